//! Process-wide logging with a pluggable sink. Components log through the
//! free functions below; the host installs a sink (the C boundary wraps its
//! callback in one, the standalone runner prints to stderr).

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Receives every message that passes the level and breadcrumb filters.
pub type LogSink = Arc<dyn Fn(LogLevel, BreadcrumbFlags, &str) + Send + Sync>;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Install (or with `None`, remove) the process log sink.
pub fn install_sink(sink: Option<LogSink>, level: LogLevel, breadcrumbs: BreadcrumbFlags) {
    LOGGER.install_sink(sink, level, breadcrumbs);
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const DEVICE = 0b0000_0001;
        const TUNNEL = 0b0000_0010;
        const DNS    = 0b0000_0100;
        const DOH    = 0b0000_1000;
        const FFI    = 0b0001_0000;
        const CACHE  = 0b0010_0000;
        const PACKET = 0b0100_0000;
        const PROBE  = 0b1000_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct LogSinkInner {
    sink: LogSink,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[doh-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<LogSink>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
        *self.sink.lock() = sink.map(|sink| LogSinkInner {
            sink,
            breadcrumbs,
            min_level,
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        // Clone out so the sink runs without the lock held.
        let sink = self.sink.lock().clone();
        let Some(inner) = sink else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if !breadcrumbs.is_empty() {
            let label = label_for(breadcrumbs);
            format!("{} [{}] {}", self.prefix, label, message)
        } else {
            format!("{} {}", self.prefix, message)
        };
        (inner.sink)(level, breadcrumbs, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::TUNNEL) {
        "TUNNEL"
    } else if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else if flags.contains(BreadcrumbFlags::DOH) {
        "DOH"
    } else if flags.contains(BreadcrumbFlags::CACHE) {
        "CACHE"
    } else if flags.contains(BreadcrumbFlags::PROBE) {
        "PROBE"
    } else if flags.contains(BreadcrumbFlags::DEVICE) {
        "DEVICE"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else if flags.contains(BreadcrumbFlags::FFI) {
        "FFI"
    } else {
        "LOG"
    }
}

// ============================================================================
// Rate-Limited Error Logging
// ============================================================================
// A malformed-packet storm or a dead upstream produces one error per query.
// Each category is limited independently so unrelated errors still surface.

/// Minimum interval between logs of the same error category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

/// Error categories for rate-limited logging.
/// Each category has independent rate limiting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Truncated IP/UDP headers, bad checksums, unsupported protocols
    MalformedPacket,
    /// DNS payloads that are not a decodable query
    MalformedDns,
    /// Connect or read failures talking to the DoH server
    Transport,
    /// Failures writing replies back into the tunnel device
    TunnelWrite,
    /// FFI/callback errors
    CallbackError,
}

const CATEGORY_COUNT: usize = 5;

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::MalformedPacket => 0,
            Self::MalformedDns => 1,
            Self::Transport => 2,
            Self::TunnelWrite => 3,
            Self::CallbackError => 4,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::MalformedPacket => "MALFORMED_PACKET",
            Self::MalformedDns => "MALFORMED_DNS",
            Self::Transport => "TRANSPORT",
            Self::TunnelWrite => "TUNNEL_WRITE",
            Self::CallbackError => "CALLBACK_ERROR",
        }
    }
}

/// Rate limiter state for error logging.
/// Uses atomic timestamps for lock-free rate limiting.
struct RateLimitedLogger {
    /// Last log time (unix millis) for each error category.
    last_log_times: [AtomicU64; CATEGORY_COUNT],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        Self {
            last_log_times: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Attempts to log an error if rate limit allows.
    /// Returns true if the log was emitted, false if rate-limited.
    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }
        // Only the thread that wins the CAS emits.
        let won = self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok();
        if won {
            error(format!("[{}] {}", category.label(), message));
        }
        won
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Log at error level, at most once per second per category. Returns true if
/// the message was emitted.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}
