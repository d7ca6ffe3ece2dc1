//! RFC 8484 DoH: the wire-format query is POSTed as
//! `application/dns-message` and the body of the reply is the raw DNS
//! response.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::{
    execute, ClientSlot, ConnectionSettings, DohError, DohFuture, DualStackResult,
    ServerConnection, DNS_MESSAGE_CONTENT_TYPE,
};
use crate::clock::Clock;
use crate::dns;
use crate::logger::{self, BreadcrumbFlags};

pub struct StandardServerConnection {
    url: String,
    host: String,
    /// Interleaved v6/v4 addresses pinned into every client we build.
    addresses: Vec<SocketAddr>,
    settings: ConnectionSettings,
    clients: ClientSlot,
    clock: Arc<dyn Clock>,
}

impl StandardServerConnection {
    /// `ips` pins the server's hostname; when empty the system resolver is
    /// used. Only https URLs are accepted.
    pub fn new(
        url: &str,
        ips: &[IpAddr],
        settings: ConnectionSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DohError> {
        let parsed = Url::parse(url).map_err(|error| DohError::InvalidUrl(error.to_string()))?;
        if parsed.scheme() != "https" {
            return Err(DohError::InvalidUrl(format!("{url} is not https")));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| DohError::InvalidUrl(format!("{url} has no host")))?
            .to_string();
        // Port 0 tells reqwest to keep the URL's port.
        let addresses: Vec<SocketAddr> = DualStackResult::from_addrs(ips.iter().copied())
            .interleaved()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, 0))
            .collect();

        let client = build_client(&settings, &host, &addresses)?;
        logger::breadcrumb(
            BreadcrumbFlags::DOH,
            format!("standard connection to {url} ({} pinned addresses)", ips.len()),
        );
        Ok(Self {
            url: url.to_string(),
            host,
            addresses,
            settings,
            clients: ClientSlot::new(client),
            clock,
        })
    }
}

fn build_client(
    settings: &ConnectionSettings,
    host: &str,
    addresses: &[SocketAddr],
) -> Result<reqwest::Client, DohError> {
    let mut builder = settings.client_builder();
    if !addresses.is_empty() {
        builder = builder.resolve_to_addrs(host, addresses);
    }
    builder
        .build()
        .map_err(|error| DohError::Connect(error.to_string()))
}

impl ServerConnection for StandardServerConnection {
    fn perform_request(&self, query: &[u8]) -> DohFuture {
        let mut body = query.to_vec();
        dns::rewrite_id(&mut body, 0);

        let (client, cancel) = self.clients.current();
        let request = client
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(body);
        let clock = Arc::clone(&self.clock);
        Box::pin(execute(request, cancel, clock))
    }

    fn reset(&self) {
        match build_client(&self.settings, &self.host, &self.addresses) {
            Ok(client) => {
                self.clients.replace(client);
                logger::breadcrumb(BreadcrumbFlags::DOH, format!("reset client for {}", self.url));
            }
            Err(error) => logger::error(format!("failed to rebuild client for {}: {error}", self.url)),
        }
    }

    fn generation(&self) -> u64 {
        self.clients.generation()
    }

    fn reset_if_current(&self, generation: u64) -> bool {
        if self.clients.generation() != generation {
            return false;
        }
        match build_client(&self.settings, &self.host, &self.addresses) {
            Ok(client) => {
                let replaced = self.clients.replace_if_current(generation, client);
                if replaced {
                    logger::breadcrumb(BreadcrumbFlags::DOH, format!("reset client for {}", self.url));
                }
                replaced
            }
            Err(error) => {
                logger::error(format!("failed to rebuild client for {}: {error}", self.url));
                false
            }
        }
    }

    fn url(&self) -> Option<&str> {
        Some(&self.url)
    }
}
