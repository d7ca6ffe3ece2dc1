//! Engine configuration. Everything has a default so hosts only override
//! what they care about.

use smallvec::{smallvec, SmallVec};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::packet::PacketEndpoints;

/// Large enough that the tunnel never has to think about fragmentation.
pub const DEFAULT_MTU: usize = 32767;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 65535;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

pub const DNS_PORT: u16 = 53;

/// A DoH server the host knows about, with addresses to use even when the
/// system resolver cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub url: String,
    pub known_ips: SmallVec<[IpAddr; 4]>,
}

impl ServerCandidate {
    pub fn new(url: impl Into<String>, known_ips: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            url: url.into(),
            known_ips: known_ips.into_iter().collect(),
        }
    }
}

pub fn default_servers() -> Vec<ServerCandidate> {
    vec![
        ServerCandidate {
            url: "https://cloudflare-dns.com/dns-query".into(),
            known_ips: smallvec![
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
                IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
                IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1001)),
            ],
        },
        ServerCandidate {
            url: "https://dns.google/dns-query".into(),
            known_ips: smallvec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
                IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
                IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8844)),
            ],
        },
    ]
}

/// Private addressing handed to the host when it configures the interface.
/// The host routes the fake DNS address into the tunnel; it never leaves the
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelAddressing {
    pub ipv4_device: Ipv4Addr,
    pub ipv4_router: Ipv4Addr,
    pub ipv4_dns: Ipv4Addr,
    pub ipv4_prefix: u8,
    pub ipv6_device: Ipv6Addr,
    pub ipv6_router: Ipv6Addr,
    pub ipv6_dns: Ipv6Addr,
    pub ipv6_prefix: u8,
}

impl Default for TunnelAddressing {
    fn default() -> Self {
        let v6 = |host: u16| Ipv6Addr::new(0xfd66, 0xf83a, 0xc650, 0, 0, 0, 0, host);
        Self {
            ipv4_device: Ipv4Addr::new(10, 111, 222, 1),
            ipv4_router: Ipv4Addr::new(10, 111, 222, 2),
            ipv4_dns: Ipv4Addr::new(10, 111, 222, 3),
            ipv4_prefix: 24,
            ipv6_device: v6(1),
            ipv6_router: v6(2),
            ipv6_dns: v6(3),
            ipv6_prefix: 120,
        }
    }
}

impl TunnelAddressing {
    pub fn fake_dns(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ipv4_dns), DNS_PORT)
    }

    /// Addressing of the empty datagram used to wake a blocked reader.
    pub fn interrupt_endpoints(&self) -> PacketEndpoints {
        PacketEndpoints {
            source: IpAddr::V4(self.ipv4_device),
            destination: IpAddr::V4(self.ipv4_dns),
            source_port: 0,
            destination_port: DNS_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mtu: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub cache_capacity: usize,
    pub history_enabled: bool,
    pub worker_threads: usize,
    pub user_agent: String,
    pub servers: Vec<ServerCandidate>,
    pub addressing: TunnelAddressing,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            history_enabled: false,
            worker_threads: 2,
            user_agent: format!("doh-bridge/{}", env!("CARGO_PKG_VERSION")),
            servers: default_servers(),
            addressing: TunnelAddressing::default(),
        }
    }
}

pub fn normalize_mtu(value: u32) -> usize {
    let clamped = value.clamp(MIN_MTU as u32, MAX_MTU as u32);
    usize::try_from(clamped).unwrap_or(DEFAULT_MTU)
}
