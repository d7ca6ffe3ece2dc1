//! Legacy JSON-parameter DoH against Google's resolver, used when no server
//! URL is configured. Steady-state queries use `encoding=raw` so the body is
//! still a wire-format response; only the bootstrap parses JSON.
//!
//! When the primary TLS hostname is unreachable the connection falls back to
//! `google.com`, sending `Host: dns.google.com`, and flips back on the next
//! failure.

use futures::FutureExt;
use parking_lot::Mutex;
use reqwest::header::HOST;
use reqwest::Url;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::{
    execute, ClientSlot, ConnectionSettings, DohError, DohFuture, DohResponse, DualStackResult,
    ServerConnection,
};
use crate::clock::Clock;
use crate::dns;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};

pub const HTTP_HOSTNAME: &str = "dns.google.com";
pub const PRIMARY_TLS_HOSTNAME: &str = HTTP_HOSTNAME;
pub const FALLBACK_TLS_HOSTNAME: &str = "google.com";

#[derive(Debug, Deserialize)]
struct JsonDnsResponse {
    #[serde(rename = "Answer")]
    answer: Vec<JsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    data: String,
}

/// `data` of every entry in the `Answer` array. Missing `Answer` is an error.
pub fn parse_json_answers(body: &[u8]) -> Result<Vec<String>, DohError> {
    let parsed: JsonDnsResponse =
        serde_json::from_slice(body).map_err(|error| DohError::Body(error.to_string()))?;
    Ok(parsed.answer.into_iter().map(|answer| answer.data).collect())
}

fn other_hostname(current: &'static str) -> &'static str {
    if current == PRIMARY_TLS_HOSTNAME {
        FALLBACK_TLS_HOSTNAME
    } else {
        PRIMARY_TLS_HOSTNAME
    }
}

struct JsonInner {
    settings: ConnectionSettings,
    clients: ClientSlot,
    tls_hostname: Mutex<&'static str>,
    preferred: Mutex<DualStackResult>,
    clock: Arc<dyn Clock>,
}

impl JsonInner {
    fn build_client(&self) -> Result<reqwest::Client, DohError> {
        let addresses: Vec<SocketAddr> = self
            .preferred
            .lock()
            .interleaved()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, 0))
            .collect();
        let mut builder = self.settings.client_builder();
        if !addresses.is_empty() {
            builder = builder
                .resolve_to_addrs(PRIMARY_TLS_HOSTNAME, &addresses)
                .resolve_to_addrs(FALLBACK_TLS_HOSTNAME, &addresses);
        }
        builder
            .build()
            .map_err(|error| DohError::Connect(error.to_string()))
    }

    fn reset(&self) {
        match self.build_client() {
            Ok(client) => self.clients.replace(client),
            Err(error) => logger::error(format!("failed to rebuild JSON client: {error}")),
        }
    }

    fn reset_if_current(&self, generation: u64) -> bool {
        if self.clients.generation() != generation {
            return false;
        }
        match self.build_client() {
            Ok(client) => self.clients.replace_if_current(generation, client),
            Err(error) => {
                logger::error(format!("failed to rebuild JSON client: {error}"));
                false
            }
        }
    }

    fn request(
        &self,
        params: &[(&str, String)],
    ) -> Result<impl std::future::Future<Output = Result<DohResponse, DohError>>, DohError> {
        let tls_hostname = *self.tls_hostname.lock();
        let url = Url::parse_with_params(&format!("https://{tls_hostname}/resolve"), params)
            .map_err(|error| DohError::InvalidUrl(error.to_string()))?;
        let (client, cancel) = self.clients.current();
        let request = client.get(url).header(HOST, HTTP_HOSTNAME);
        Ok(execute(request, cancel, Arc::clone(&self.clock)))
    }

    fn toggle_hostname(&self) {
        let mut hostname = self.tls_hostname.lock();
        *hostname = other_hostname(*hostname);
    }

    /// Addresses for `name`, retrying once on the fallback hostname.
    async fn resolve(&self, name: &str, qtype: &str) -> Option<Vec<String>> {
        let params = [("name", name.to_string()), ("type", qtype.to_string())];
        let response = match self.request(&params).ok()?.await {
            Ok(response) => response,
            Err(_) => {
                *self.tls_hostname.lock() = FALLBACK_TLS_HOSTNAME;
                self.reset();
                self.request(&params).ok()?.await.ok()?
            }
        };
        match parse_json_answers(&response.body) {
            Ok(answers) => Some(answers),
            Err(error) => {
                logger::warn(format!("bootstrap {name} {qtype}: {error}"));
                None
            }
        }
    }
}

pub struct JsonServerConnection {
    inner: Arc<JsonInner>,
}

impl JsonServerConnection {
    /// Build a connection and confirm it works by fetching fresh addresses
    /// for the resolver itself. Fails when no IPv4 address comes back.
    pub async fn bootstrap(
        settings: ConnectionSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DohError> {
        let inner = Arc::new(JsonInner {
            clients: ClientSlot::new(
                settings
                    .client_builder()
                    .build()
                    .map_err(|error| DohError::Connect(error.to_string()))?,
            ),
            settings,
            tls_hostname: Mutex::new(PRIMARY_TLS_HOSTNAME),
            preferred: Mutex::new(DualStackResult::default()),
            clock,
        });

        let v4 = inner
            .resolve(HTTP_HOSTNAME, "A")
            .await
            .filter(|names| !names.is_empty())
            .ok_or_else(|| DohError::Connect("JSON bootstrap failed".into()))?;
        let v6 = inner.resolve(HTTP_HOSTNAME, "AAAA").await.unwrap_or_default();

        let preferred = DualStackResult::from_strings(&v4, &v6);
        logger::info(format!(
            "JSON bootstrap via {} found {} v4 / {} v6 addresses",
            *inner.tls_hostname.lock(),
            preferred.v4.len(),
            preferred.v6.len()
        ));
        *inner.preferred.lock() = preferred;
        inner.reset();
        Ok(Self { inner })
    }
}

impl ServerConnection for JsonServerConnection {
    fn perform_request(&self, query: &[u8]) -> DohFuture {
        let question = match dns::parse_query(query) {
            Ok(parsed) => parsed.question,
            Err(error) => {
                return futures::future::ready(Err(DohError::InvalidQuery(error.to_string())))
                    .boxed()
            }
        };
        let inner = Arc::clone(&self.inner);
        async move {
            let params = [
                ("name", question.name.clone()),
                ("type", question.qtype.to_string()),
                ("encoding", "raw".to_string()),
            ];
            match inner.request(&params)?.await {
                Err(DohError::Connect(reason)) => {
                    logger::rate_limited_error(
                        ErrorCategory::Transport,
                        format!("JSON request failed ({reason}), switching TLS hostname"),
                    );
                    inner.toggle_hostname();
                    inner.reset();
                    inner.request(&params)?.await
                }
                other => other,
            }
        }
        .boxed()
    }

    fn reset(&self) {
        logger::breadcrumb(BreadcrumbFlags::DOH, "reset JSON client".to_string());
        self.inner.reset();
    }

    fn generation(&self) -> u64 {
        self.inner.clients.generation()
    }

    fn reset_if_current(&self, generation: u64) -> bool {
        self.inner.reset_if_current(generation)
    }

    fn url(&self) -> Option<&str> {
        None
    }
}
