//! Builds `ServerConnection`s from URLs, seeding each with the addresses the
//! host already knows for that server.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use super::{ConnectionSettings, DohError, JsonServerConnection, ServerConnection, StandardServerConnection};
use crate::clock::Clock;
use crate::config::{EngineConfig, ServerCandidate};
use crate::logger::{self, BreadcrumbFlags};

const HTTPS_PORT: u16 = 443;

/// An empty URL and no URL both mean the built-in default server.
pub fn equal_urls(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("") == b.unwrap_or("")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DualStackResult {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

impl DualStackResult {
    /// Parse textual addresses, silently skipping anything that is not an
    /// address of the expected family.
    pub fn from_strings(v4: &[String], v6: &[String]) -> Self {
        Self {
            v4: v4.iter().filter_map(|text| text.trim().parse().ok()).collect(),
            v6: v6.iter().filter_map(|text| text.trim().parse().ok()).collect(),
        }
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut result = Self::default();
        for addr in addrs {
            match addr {
                IpAddr::V4(v4) if !result.v4.contains(&v4) => result.v4.push(v4),
                IpAddr::V6(v6) if !result.v6.contains(&v6) => result.v6.push(v6),
                _ => {}
            }
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Alternate families, IPv6 first at each position, so a broken stack
    /// costs at most one connect attempt before the other is tried.
    pub fn interleaved(&self) -> Vec<IpAddr> {
        let mut out = Vec::with_capacity(self.v4.len() + self.v6.len());
        for index in 0..self.v4.len().max(self.v6.len()) {
            if let Some(v6) = self.v6.get(index) {
                out.push(IpAddr::V6(*v6));
            }
            if let Some(v4) = self.v4.get(index) {
                out.push(IpAddr::V4(*v4));
            }
        }
        out
    }
}

pub struct ServerDirectory {
    servers: Vec<ServerCandidate>,
    settings: ConnectionSettings,
    clock: Arc<dyn Clock>,
}

impl ServerDirectory {
    pub fn new(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            servers: config.servers.clone(),
            settings: ConnectionSettings::from(config),
            clock,
        }
    }

    pub fn known_ips(&self, url: &str) -> &[IpAddr] {
        self.servers
            .iter()
            .find(|candidate| candidate.url == url)
            .map(|candidate| candidate.known_ips.as_slice())
            .unwrap_or(&[])
    }

    /// Open a connection to `url`. An empty URL selects the JSON fallback,
    /// which has to bootstrap before it is usable.
    pub async fn connect(&self, url: &str) -> Result<Arc<dyn ServerConnection>, DohError> {
        if url.is_empty() {
            let connection =
                JsonServerConnection::bootstrap(self.settings.clone(), Arc::clone(&self.clock)).await?;
            return Ok(Arc::new(connection));
        }

        let parsed = reqwest::Url::parse(url).map_err(|error| DohError::InvalidUrl(error.to_string()))?;
        if parsed.scheme() != "https" {
            return Err(DohError::InvalidUrl(format!("{url} is not https")));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| DohError::InvalidUrl(format!("{url} has no host")))?
            .to_string();

        let mut addresses: Vec<IpAddr> = self.known_ips(url).to_vec();
        match tokio::net::lookup_host((host.as_str(), HTTPS_PORT)).await {
            Ok(resolved) => {
                for addr in resolved {
                    if !addresses.contains(&addr.ip()) {
                        addresses.push(addr.ip());
                    }
                }
            }
            Err(error) => logger::warn(format!("lookup of {host} failed: {error}")),
        }
        if addresses.is_empty() {
            return Err(DohError::Connect(format!("no addresses for {host}")));
        }

        logger::breadcrumb(
            BreadcrumbFlags::DOH,
            format!("connecting to {url} with {} addresses", addresses.len()),
        );
        let connection = StandardServerConnection::new(
            url,
            &addresses,
            self.settings.clone(),
            Arc::clone(&self.clock),
        )?;
        Ok(Arc::new(connection))
    }
}
