use std::ffi::{c_char, c_void, CString};
use std::net::IpAddr;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, EngineConfig};
use crate::doh::CacheStatus;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory, LogLevel, LogSink};
use crate::resolver::{Transaction, TransactionListener, TransactionStatus};
use crate::tracker::TrackerCounters;

pub type EmitPacketsFn = unsafe extern "C" fn(
    packets: *const *const u8,
    sizes: *const usize,
    count: usize,
    context: *mut c_void,
);
pub type RecordTransactionFn =
    unsafe extern "C" fn(transaction: *const BridgeTransaction, context: *mut c_void);
pub type RaceResultFn = unsafe extern "C" fn(index: i64, context: *mut c_void);
pub type LogFn = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

/// Mirror of the `BridgeConfig` struct defined in `include/doh_bridge.h`.
/// Zero in any numeric field selects the default.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BridgeConfig {
    pub mtu: u32,
    pub cache_capacity: u32,
    pub connect_timeout_ms: u32,
    pub read_timeout_ms: u32,
    pub worker_threads: u32,
    /// Inbound/outbound queue depth of the in-memory device. Default: 1024.
    pub queue_capacity: u32,
    pub history_enabled: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mtu: config::DEFAULT_MTU as u32,
            cache_capacity: config::DEFAULT_CACHE_CAPACITY as u32,
            connect_timeout_ms: config::DEFAULT_CONNECT_TIMEOUT.as_millis() as u32,
            read_timeout_ms: config::DEFAULT_READ_TIMEOUT.as_millis() as u32,
            worker_threads: 2,
            queue_capacity: crate::device::DEFAULT_QUEUE_CAPACITY as u32,
            history_enabled: false,
        }
    }
}

impl BridgeConfig {
    pub fn to_engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let or_default = |value: u32, default: usize| {
            if value == 0 {
                default
            } else {
                value as usize
            }
        };
        let millis_or = |value: u32, default: Duration| {
            if value == 0 {
                default
            } else {
                Duration::from_millis(u64::from(value))
            }
        };
        EngineConfig {
            mtu: if self.mtu == 0 {
                defaults.mtu
            } else {
                config::normalize_mtu(self.mtu)
            },
            connect_timeout: millis_or(self.connect_timeout_ms, defaults.connect_timeout),
            read_timeout: millis_or(self.read_timeout_ms, defaults.read_timeout),
            cache_capacity: or_default(self.cache_capacity, defaults.cache_capacity),
            history_enabled: self.history_enabled,
            worker_threads: or_default(self.worker_threads, defaults.worker_threads),
            ..defaults
        }
    }

    pub fn queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            crate::device::DEFAULT_QUEUE_CAPACITY
        } else {
            self.queue_capacity as usize
        }
    }
}

/// Callbacks installed by the host. `record_transaction` may be null.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct BridgeCallbacks {
    pub emit_packets: EmitPacketsFn,
    pub record_transaction: Option<RecordTransactionFn>,
    pub context: *mut c_void,
}

unsafe impl Send for BridgeCallbacks {}
unsafe impl Sync for BridgeCallbacks {}

impl BridgeCallbacks {
    pub fn emit_packet(&self, packet: &[u8]) {
        let pointers = [packet.as_ptr()];
        let sizes = [packet.len()];
        // SAFETY: both arrays outlive the call and hold `count` entries.
        unsafe { (self.emit_packets)(pointers.as_ptr(), sizes.as_ptr(), 1, self.context) };
    }
}

impl TransactionListener for BridgeCallbacks {
    fn on_transaction(&self, transaction: &Transaction) {
        let Some(record) = self.record_transaction else {
            return;
        };
        let Ok(name) = CString::new(transaction.name.as_str()) else {
            logger::rate_limited_error(
                ErrorCategory::CallbackError,
                "transaction name contains NUL".to_string(),
            );
            return;
        };
        let bridged = BridgeTransaction::new(transaction, &name);
        unsafe { record(&bridged, self.context) };
    }
}

pub const BRIDGE_STATUS_COMPLETE: i32 = 0;
pub const BRIDGE_STATUS_SEND_FAIL: i32 = 1;
pub const BRIDGE_STATUS_HTTP_ERROR: i32 = 2;
pub const BRIDGE_STATUS_BAD_RESPONSE: i32 = 3;
pub const BRIDGE_STATUS_CANCELED: i32 = 4;

pub const BRIDGE_CACHE_NONE: i32 = -1;
pub const BRIDGE_CACHE_HIT: i32 = 0;
pub const BRIDGE_CACHE_MISS: i32 = 1;
pub const BRIDGE_CACHE_PENDING: i32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeIp {
    /// 0 when absent, otherwise 4 or 6.
    pub family: u8,
    pub bytes: [u8; 16],
}

impl BridgeIp {
    pub fn encode(addr: Option<IpAddr>) -> Self {
        let mut out = BridgeIp::default();
        match addr {
            Some(IpAddr::V4(v4)) => {
                out.family = 4;
                out.bytes[..4].copy_from_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                out.family = 6;
                out.bytes.copy_from_slice(&v6.octets());
            }
            None => {}
        }
        out
    }
}

/// Borrowed view of a transaction, valid only for the duration of the
/// `record_transaction` call.
#[repr(C)]
#[derive(Debug)]
pub struct BridgeTransaction {
    pub name: *const c_char,
    pub qtype: u16,
    pub http_status: u16,
    pub status: i32,
    pub cache_status: i32,
    pub server_ip: BridgeIp,
    pub query_time_ms: u64,
    pub response_time_ms: u64,
    pub response: *const u8,
    pub response_len: usize,
}

impl BridgeTransaction {
    pub fn new(transaction: &Transaction, name: &CString) -> Self {
        let (response, response_len) = match &transaction.response {
            Some(bytes) => (bytes.as_ptr(), bytes.len()),
            None => (ptr::null(), 0),
        };
        Self {
            name: name.as_ptr(),
            qtype: transaction.qtype,
            http_status: transaction.http_status.unwrap_or(0),
            status: status_code(transaction.status),
            cache_status: cache_code(transaction.cache_status),
            server_ip: BridgeIp::encode(transaction.server_ip),
            query_time_ms: transaction.query_time_ms,
            response_time_ms: transaction.response_time_ms,
            response,
            response_len,
        }
    }
}

pub fn status_code(status: TransactionStatus) -> i32 {
    match status {
        TransactionStatus::Complete => BRIDGE_STATUS_COMPLETE,
        TransactionStatus::SendFail => BRIDGE_STATUS_SEND_FAIL,
        TransactionStatus::HttpError => BRIDGE_STATUS_HTTP_ERROR,
        TransactionStatus::BadResponse => BRIDGE_STATUS_BAD_RESPONSE,
        TransactionStatus::Canceled => BRIDGE_STATUS_CANCELED,
    }
}

pub fn cache_code(status: Option<CacheStatus>) -> i32 {
    match status {
        None => BRIDGE_CACHE_NONE,
        Some(CacheStatus::Hit) => BRIDGE_CACHE_HIT,
        Some(CacheStatus::Miss) => BRIDGE_CACHE_MISS,
        Some(CacheStatus::Pending) => BRIDGE_CACHE_PENDING,
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BridgeCounters {
    /// Successfully answered queries, including any restored count.
    pub num_requests: u64,
    /// Queries in the last 60 seconds.
    pub recent_queries: u64,
    pub send_failures: u64,
    pub http_errors: u64,
    pub bad_responses: u64,
    pub canceled: u64,
}

impl From<TrackerCounters> for BridgeCounters {
    fn from(counters: TrackerCounters) -> Self {
        Self {
            num_requests: counters.num_requests,
            recent_queries: counters.recent_queries,
            send_failures: counters.send_failures,
            http_errors: counters.http_errors,
            bad_responses: counters.bad_responses,
            canceled: counters.canceled,
        }
    }
}

#[repr(C)]
pub struct BridgeLogSink {
    pub log: Option<LogFn>,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}

#[derive(Clone, Copy)]
struct HostContext(*mut c_void);

unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

/// Route engine logs to a C callback. A null sink or a sink without a
/// `log` function removes the current sink.
pub fn install_log_sink(sink: Option<&BridgeLogSink>, level: Option<&str>) {
    let level = level.map(LogLevel::parse).unwrap_or(LogLevel::Info);
    let Some((log, context, breadcrumbs)) =
        sink.and_then(|sink| sink.log.map(|log| (log, HostContext(sink.context), sink.enabled_breadcrumbs)))
    else {
        logger::install_sink(None, level, BreadcrumbFlags::empty());
        return;
    };

    let forward: LogSink = Arc::new(move |level: LogLevel, flags: BreadcrumbFlags, message: &str| {
        // Capture the Send wrapper, not its raw field.
        let context = context;
        let (Ok(level), Ok(message)) = (CString::new(level.as_str()), CString::new(message)) else {
            return;
        };
        unsafe { log(level.as_ptr(), message.as_ptr(), flags.bits(), context.0) };
    });
    logger::install_sink(
        Some(forward),
        level,
        BreadcrumbFlags::from_bits_truncate(breadcrumbs),
    );
}

pub(crate) struct RaceCallback {
    callback: RaceResultFn,
    context: HostContext,
}

impl RaceCallback {
    pub fn new(callback: RaceResultFn, context: *mut c_void) -> Self {
        Self {
            callback,
            context: HostContext(context),
        }
    }

    pub fn fire(self, index: i64) {
        unsafe { (self.callback)(index, self.context.0) };
    }
}

#[cfg(test)]
mod tests;
