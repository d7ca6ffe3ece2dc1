//! DNS-over-HTTPS transports. A `ServerConnection` sends one wire-format
//! query to one server and hands back the raw response along with the HTTP
//! metadata the resolver and cache need.

pub mod cache;
pub mod factory;
pub mod json;
pub mod standard;

pub use cache::CachingServerConnection;
pub use factory::{equal_urls, DualStackResult, ServerDirectory};
pub use json::JsonServerConnection;
pub use standard::StandardServerConnection;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, AGE};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::logger::{self, BreadcrumbFlags};

pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Whether a response came from the cache, triggered a fetch, or piggybacked
/// on a fetch another caller started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Pending,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DohResponse {
    pub status: u16,
    pub body: Bytes,
    /// Value of the `Age` header, zero when absent.
    pub age_secs: u32,
    /// Clock reading when the response headers arrived.
    pub received_at_ms: u64,
    /// Peer that actually answered the HTTPS request.
    pub server_ip: Option<IpAddr>,
    pub cache_status: Option<CacheStatus>,
}

impl DohResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Total age in milliseconds as of `now_ms`.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        u64::from(self.age_secs) * 1000 + now_ms.saturating_sub(self.received_at_ms)
    }
}

/// Failures before a usable HTTP response exists. `Clone` so a shared
/// in-flight fetch can hand the same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DohError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unreadable response body: {0}")]
    Body(String),
    #[error("request canceled")]
    Canceled,
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl DohError {
    pub(crate) fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            DohError::Timeout
        } else if error.is_body() || error.is_decode() {
            DohError::Body(error.to_string())
        } else {
            DohError::Connect(error.to_string())
        }
    }
}

pub type DohFuture = BoxFuture<'static, Result<DohResponse, DohError>>;

pub trait ServerConnection: Send + Sync {
    /// Send `query` (a DNS wire-format message). The ID is zeroed before it
    /// goes upstream so identical questions from different callers look the
    /// same to the server and to any cache.
    fn perform_request(&self, query: &[u8]) -> DohFuture;

    /// Replace the HTTP client and cancel everything issued on the old one.
    fn reset(&self);

    /// Number of client replacements so far.
    fn generation(&self) -> u64;

    /// `reset` unless the client has already been replaced since
    /// `generation` was read. Returns whether this call replaced it.
    fn reset_if_current(&self, generation: u64) -> bool;

    /// `None` for the built-in default server.
    fn url(&self) -> Option<&str>;
}

/// The active connection shared between the engine and a running tunnel.
pub type ConnectionSlot = Arc<RwLock<Option<Arc<dyn ServerConnection>>>>;

pub fn new_connection_slot() -> ConnectionSlot {
    Arc::new(RwLock::new(None))
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl From<&EngineConfig> for ConnectionSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            user_agent: config.user_agent.clone(),
        }
    }
}

impl ConnectionSettings {
    pub(crate) fn client_builder(&self) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .user_agent(self.user_agent.clone())
    }
}

/// An HTTP client together with the token that cancels every request
/// issued through it. Swapped as a unit on reset.
pub(crate) struct ClientHandle {
    pub client: reqwest::Client,
    pub cancel: CancellationToken,
    pub generation: u64,
}

pub(crate) struct ClientSlot {
    inner: Mutex<ClientHandle>,
}

impl ClientSlot {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            inner: Mutex::new(ClientHandle {
                client,
                cancel: CancellationToken::new(),
                generation: 0,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Snapshot the current client and its token under the lock, so a
    /// request is never paired with a half-replaced client.
    pub fn current(&self) -> (reqwest::Client, CancellationToken) {
        let guard = self.inner.lock();
        (guard.client.clone(), guard.cancel.clone())
    }

    pub fn replace(&self, client: reqwest::Client) {
        let old = {
            let mut guard = self.inner.lock();
            let generation = guard.generation;
            Self::install(&mut guard, generation, client)
        };
        old.cancel.cancel();
    }

    /// Install `client` only if nothing replaced the current one since
    /// `generation` was read.
    pub fn replace_if_current(&self, generation: u64, client: reqwest::Client) -> bool {
        let old = {
            let mut guard = self.inner.lock();
            if guard.generation != generation {
                return false;
            }
            Self::install(&mut guard, generation, client)
        };
        old.cancel.cancel();
        true
    }

    fn install(handle: &mut ClientHandle, generation: u64, client: reqwest::Client) -> ClientHandle {
        std::mem::replace(
            handle,
            ClientHandle {
                client,
                cancel: CancellationToken::new(),
                generation: generation.wrapping_add(1),
            },
        )
    }
}

pub(crate) fn age_secs(headers: &HeaderMap) -> u32 {
    headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Send `request`, racing it against `cancel`, and read the whole body.
pub(crate) async fn execute(
    request: reqwest::RequestBuilder,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
) -> Result<DohResponse, DohError> {
    let exchange = async {
        let response = request
            .send()
            .await
            .map_err(|error| DohError::from_reqwest(&error))?;
        let received_at_ms = clock.now_ms();
        let status = response.status().as_u16();
        let server_ip = response.remote_addr().map(|addr| addr.ip());
        let age_secs = age_secs(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|error| match DohError::from_reqwest(&error) {
                DohError::Timeout => DohError::Timeout,
                _ => DohError::Body(error.to_string()),
            })?;
        logger::breadcrumb(
            BreadcrumbFlags::DOH,
            format!(
                "response status={} len={} server={:?} age={}s",
                status,
                body.len(),
                server_ip,
                age_secs
            ),
        );
        Ok(DohResponse {
            status,
            body,
            age_secs,
            received_at_ms,
            server_ip,
            cache_status: None,
        })
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DohError::Canceled),
        result = exchange => result,
    }
}
