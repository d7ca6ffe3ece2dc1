#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod config;
pub mod device;
pub mod dns;
pub mod doh;
pub mod engine;
pub mod ffi;
pub mod logger;
pub mod packet;
pub mod probe;
pub mod resolver;
pub mod tracker;
pub mod tunnel;

#[cfg(test)]
mod test_support;

use crate::device::MemoryTunDevice;
use crate::engine::Engine;
use crate::ffi::{
    BridgeCallbacks, BridgeConfig, BridgeCounters, BridgeLogSink, RaceCallback, RaceResultFn,
};
use crate::logger::BreadcrumbFlags;
use crate::resolver::TransactionListener;
use parking_lot::Mutex;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

/// Opaque engine handle shared with the host.
pub struct BridgeEngine {
    engine: Engine,
    config: BridgeConfig,
    device: Mutex<Option<Arc<MemoryTunDevice>>>,
}

impl BridgeEngine {
    fn new(config: BridgeConfig) -> anyhow::Result<Self> {
        let engine = Engine::new(config.to_engine_config())?;
        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!(
                "BridgeEngine initialized (mtu={}, queue_cap={})",
                engine.config().mtu,
                config.queue_capacity()
            ),
        );
        Ok(Self {
            engine,
            config,
            device: Mutex::new(None),
        })
    }

    fn install_callbacks(&self, callbacks: BridgeCallbacks) {
        let listener: Arc<dyn TransactionListener> = Arc::new(callbacks);
        self.engine.set_transaction_listener(Some(listener));
    }

    fn start_tunnel(&self, callbacks: BridgeCallbacks) -> anyhow::Result<()> {
        self.install_callbacks(callbacks);
        let engine_config = self.engine.config();
        let device = Arc::new(MemoryTunDevice::with_sink(
            engine_config.mtu,
            self.config.queue_capacity(),
            engine_config.addressing,
            move |packet| callbacks.emit_packet(packet),
        ));
        self.engine.start_tunnel(device.clone())?;
        *self.device.lock() = Some(device);
        logger::breadcrumb(BreadcrumbFlags::FFI, "memory tunnel running".to_string());
        Ok(())
    }

    #[cfg(unix)]
    fn start_fd_tunnel(&self, fd: i32, callbacks: BridgeCallbacks) -> anyhow::Result<()> {
        let device = crate::device::FdTunDevice::from_host_fd(fd, &self.engine.config().addressing)?;
        self.install_callbacks(callbacks);
        self.engine.start_tunnel(Arc::new(device))?;
        self.device.lock().take();
        logger::breadcrumb(
            BreadcrumbFlags::FFI,
            format!("fd tunnel running (fd={fd})"),
        );
        Ok(())
    }

    fn handle_packet(&self, packet: &[u8]) -> bool {
        let device = self.device.lock().clone();
        let Some(device) = device else {
            logger::breadcrumb(
                BreadcrumbFlags::FFI,
                format!("Dropped packet (len={}): no memory tunnel", packet.len()),
            );
            return false;
        };
        device.push_inbound(packet)
    }

    fn stop(&self) {
        self.engine.stop();
        self.device.lock().take();
        self.engine.set_transaction_listener(None);
    }
}

/// # Safety
/// `value` must be null or a NUL-terminated string.
unsafe fn optional_str<'a>(value: *const c_char) -> Result<Option<&'a str>, ()> {
    if value.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(value) }
        .to_str()
        .map(Some)
        .map_err(|_| ())
}

#[no_mangle]
pub unsafe extern "C" fn BridgeNewEngine(config: *const BridgeConfig) -> *mut BridgeEngine {
    let config = if let Some(cfg) = NonNull::new(config as *mut BridgeConfig) {
        unsafe { *cfg.as_ptr() }
    } else {
        BridgeConfig::default()
    };

    match BridgeEngine::new(config) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(error) => {
            crate::logger::error(format!("BridgeNewEngine failed: {error:?}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeFreeEngine(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe {
            drop(Box::from_raw(engine.as_ptr()));
        }
    }
}

/// Select the DoH server. A null or empty `url` selects the built-in
/// default. Blocks until the server's addresses are known.
///
/// Returns 0 on success, -1 for a null engine, -2 for a non UTF-8 url and -3
/// if the server could not be set up.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineSetServer(
    engine: *mut BridgeEngine,
    url: *const c_char,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Ok(url) = (unsafe { optional_str(url) }) else {
        return -2;
    };
    match unsafe { engine.as_ref() }.engine.set_server(url) {
        Ok(()) => 0,
        Err(error) => {
            crate::logger::error(format!("BridgeEngineSetServer error: {error}"));
            -3
        }
    }
}

/// Start a tunnel fed through `BridgeEngineHandlePacket`. Replies are
/// delivered through `emit_packets`.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStartTunnel(
    engine: *mut BridgeEngine,
    callbacks: *const BridgeCallbacks,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callbacks) = NonNull::new(callbacks as *mut BridgeCallbacks) else {
        return -2;
    };

    match unsafe { engine.as_ref() }.start_tunnel(unsafe { *callbacks.as_ptr() }) {
        Ok(_) => 0,
        Err(error) => {
            crate::logger::error(format!("BridgeEngineStartTunnel error: {error:?}"));
            -3
        }
    }
}

/// Start a tunnel that reads and writes the TUN descriptor `fd` directly.
/// The descriptor is duplicated; the host keeps ownership of `fd`.
#[cfg(unix)]
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStartFdTunnel(
    engine: *mut BridgeEngine,
    fd: i32,
    callbacks: *const BridgeCallbacks,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callbacks) = NonNull::new(callbacks as *mut BridgeCallbacks) else {
        return -2;
    };

    match unsafe { engine.as_ref() }.start_fd_tunnel(fd, unsafe { *callbacks.as_ptr() }) {
        Ok(_) => 0,
        Err(error) => {
            crate::logger::error(format!("BridgeEngineStartFdTunnel error: {error:?}"));
            -3
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineStop(engine: *mut BridgeEngine) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }.stop();
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineHandlePacket(
    engine: *mut BridgeEngine,
    packet: *const u8,
    length: usize,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    if packet.is_null() || length == 0 {
        return false;
    }
    // Safety: caller guarantees `packet` points to `length` bytes of readable memory.
    let slice = unsafe { slice::from_raw_parts(packet, length) };
    unsafe { engine.as_ref() }.handle_packet(slice)
}

/// Race `count` server urls. `callback` fires exactly once with the index
/// of the first server to answer, or -1 if all failed, unless the race is
/// abandoned by a newer race or `BridgeEngineStop`.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineRace(
    engine: *mut BridgeEngine,
    urls: *const *const c_char,
    count: usize,
    callback: Option<RaceResultFn>,
    context: *mut c_void,
) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Some(callback) = callback else {
        return -2;
    };
    if urls.is_null() && count > 0 {
        return -2;
    }
    let pointers = if count == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(urls, count) }
    };
    let mut owned = Vec::with_capacity(count);
    for pointer in pointers {
        match unsafe { optional_str(*pointer) } {
            Ok(url) => owned.push(url.unwrap_or("").to_string()),
            Err(()) => return -2,
        }
    }

    let callback = RaceCallback::new(callback, context);
    unsafe { engine.as_ref() }
        .engine
        .race(owned, Box::new(move |result| callback.fire(result.index())));
    0
}

/// Blocking health check. Returns 1 if the server answered, 0 if not and -1
/// on invalid arguments or when called from an engine thread.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineProbe(engine: *mut BridgeEngine, url: *const c_char) -> i32 {
    let Some(engine) = NonNull::new(engine) else {
        return -1;
    };
    let Ok(url) = (unsafe { optional_str(url) }) else {
        return -1;
    };
    match unsafe { engine.as_ref() }.engine.probe(url.unwrap_or("")) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(error) => {
            crate::logger::error(format!("BridgeEngineProbe error: {error}"));
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineGetCounters(
    engine: *mut BridgeEngine,
    out: *mut BridgeCounters,
) -> bool {
    let Some(engine) = NonNull::new(engine) else {
        return false;
    };
    let Some(out) = NonNull::new(out) else {
        return false;
    };
    let counters = BridgeCounters::from(unsafe { engine.as_ref() }.engine.counters());
    unsafe { out.as_ptr().write(counters) };
    true
}

/// Seed the lifetime request count, typically from a value the host
/// persisted at shutdown.
#[no_mangle]
pub unsafe extern "C" fn BridgeEngineRestoreRequestCount(engine: *mut BridgeEngine, value: u64) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }
            .engine
            .tracker()
            .restore_num_requests(value);
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeEngineSetHistoryEnabled(engine: *mut BridgeEngine, enabled: bool) {
    if let Some(engine) = NonNull::new(engine) {
        unsafe { engine.as_ref() }
            .engine
            .tracker()
            .set_history_enabled(enabled);
    }
}

#[no_mangle]
pub unsafe extern "C" fn BridgeSetLogSink(
    sink: *const BridgeLogSink,
    level: *const c_char,
    _error: *mut *mut std::ffi::c_void,
) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = unsafe { optional_str(level) }.ok().flatten();
    crate::ffi::install_log_sink(sink_ref, level_str);
    true
}

#[no_mangle]
pub extern "C" fn BridgeSetBreadcrumbMask(mask: u32) {
    crate::logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub extern "C" fn BridgeEnsureLinked() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    unsafe extern "C" fn discard_packets(
        _packets: *const *const u8,
        _sizes: *const usize,
        _count: usize,
        _context: *mut c_void,
    ) {
    }

    unsafe extern "C" fn ignore_race(_index: i64, _context: *mut c_void) {}

    fn callbacks() -> BridgeCallbacks {
        BridgeCallbacks {
            emit_packets: discard_packets,
            record_transaction: None,
            context: ptr::null_mut(),
        }
    }

    #[test]
    fn null_engine_is_rejected_everywhere() {
        let url = CString::new("https://doh.test/dns-query").unwrap();
        unsafe {
            assert_eq!(BridgeEngineSetServer(ptr::null_mut(), url.as_ptr()), -1);
            assert_eq!(BridgeEngineStartTunnel(ptr::null_mut(), &callbacks()), -1);
            assert!(!BridgeEngineHandlePacket(ptr::null_mut(), [1u8].as_ptr(), 1));
            assert_eq!(
                BridgeEngineRace(ptr::null_mut(), ptr::null(), 0, Some(ignore_race), ptr::null_mut()),
                -1
            );
            let mut counters = BridgeCounters::default();
            assert!(!BridgeEngineGetCounters(ptr::null_mut(), &mut counters));
            BridgeEngineStop(ptr::null_mut());
            BridgeFreeEngine(ptr::null_mut());
        }
    }

    #[test]
    fn packets_need_a_running_memory_tunnel() {
        unsafe {
            let engine = BridgeNewEngine(ptr::null());
            assert!(!engine.is_null());
            let packet = [0x45u8; 28];
            assert!(!BridgeEngineHandlePacket(engine, packet.as_ptr(), packet.len()));

            assert_eq!(BridgeEngineStartTunnel(engine, &callbacks()), 0);
            assert!(BridgeEngineHandlePacket(engine, packet.as_ptr(), packet.len()));

            BridgeEngineStop(engine);
            assert!(!BridgeEngineHandlePacket(engine, packet.as_ptr(), packet.len()));
            BridgeFreeEngine(engine);
        }
    }

    #[test]
    fn invalid_urls_are_reported() {
        unsafe {
            let engine = BridgeNewEngine(ptr::null());
            let insecure = CString::new("http://doh.test/dns-query").unwrap();
            assert_eq!(BridgeEngineSetServer(engine, insecure.as_ptr()), -3);

            let bad_utf8 = [0xffu8, 0xfe, 0];
            assert_eq!(BridgeEngineSetServer(engine, bad_utf8.as_ptr() as *const c_char), -2);
            BridgeFreeEngine(engine);
        }
    }

    #[test]
    fn counters_and_restored_requests() {
        unsafe {
            let engine = BridgeNewEngine(ptr::null());
            BridgeEngineRestoreRequestCount(engine, 41);
            let mut counters = BridgeCounters::default();
            assert!(BridgeEngineGetCounters(engine, &mut counters));
            assert_eq!(counters.num_requests, 41);
            assert_eq!(counters.send_failures, 0);
            BridgeFreeEngine(engine);
        }
    }

    #[test]
    fn race_requires_a_callback() {
        unsafe {
            let engine = BridgeNewEngine(ptr::null());
            assert_eq!(BridgeEngineRace(engine, ptr::null(), 0, None, ptr::null_mut()), -2);
            assert_eq!(BridgeEngineRace(engine, ptr::null(), 1, Some(ignore_race), ptr::null_mut()), -2);
            BridgeFreeEngine(engine);
        }
    }
}
