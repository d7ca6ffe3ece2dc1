//! IPv4/IPv6 and UDP codec for packets read from, and written to, the tunnel
//! device. Parsing validates every length field and checksum before handing
//! out borrowed payload slices; building always produces fully checksummed
//! packets.

pub mod builder;
pub mod checksum;

pub use builder::{build_packet, build_udp, build_udp_reply};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const IPPROTO_UDP: u8 = 17;

/// TTL / hop limit stamped on every packet we build.
pub const REPLY_TTL: u8 = 64;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

// IPv6 extension header identifiers.
const EXT_HOP_BY_HOP: u8 = 0;
const EXT_ROUTING: u8 = 43;
const EXT_FRAGMENT: u8 = 44;
const EXT_AUTH: u8 = 51;
const EXT_NONE: u8 = 59;
const EXT_DEST_OPTIONS: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedIpv4Header,
    #[error("malformed IPv6 header")]
    MalformedIpv6Header,
    #[error("malformed UDP datagram")]
    MalformedUdpDatagram,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
    #[error("not a UDP packet (protocol {0})")]
    NotUdp(u8),
    #[error("source and destination address families differ")]
    AddressFamilyMismatch,
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// A parsed IP packet. `protocol` is the upper-layer protocol after any IPv6
/// extension headers, and `payload` is the upper-layer segment.
#[derive(Debug, Clone)]
pub struct IpPacket<'a> {
    pub version: IpVersion,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: u8,
    pub ttl: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct UdpDatagram<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: &'a [u8],
}

/// Addressing captured from an inbound datagram so the reply can be sent
/// back with source and destination swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketEndpoints {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
}

impl PacketEndpoints {
    pub fn version(&self) -> IpVersion {
        match self.source {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            source_port: self.destination_port,
            destination_port: self.source_port,
        }
    }
}

/// A UDP datagram together with its IP addressing.
#[derive(Debug, Clone)]
pub struct UdpPacket<'a> {
    pub endpoints: PacketEndpoints,
    pub payload: &'a [u8],
}

impl UdpPacket<'_> {
    /// Empty datagrams are used to wake the reader and carry no DNS.
    pub fn is_interrupt(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Parse an IPv4 or IPv6 packet, verifying the IPv4 header checksum and, for
/// UDP over IPv6, the UDP checksum.
pub fn parse_packet(packet: &[u8]) -> Result<IpPacket<'_>, PacketError> {
    let Some(&first) = packet.first() else {
        return Err(PacketError::Empty);
    };
    match first >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        version => Err(PacketError::UnsupportedVersion(version)),
    }
}

/// Parse the UDP header of an already parsed IP packet.
pub fn parse_udp<'a>(packet: &IpPacket<'a>) -> Result<UdpDatagram<'a>, PacketError> {
    if packet.protocol != IPPROTO_UDP {
        return Err(PacketError::NotUdp(packet.protocol));
    }
    let segment = packet.payload;
    if segment.len() < UDP_HEADER_LEN {
        return Err(PacketError::MalformedUdpDatagram);
    }
    let source_port = u16::from_be_bytes([segment[0], segment[1]]);
    let destination_port = u16::from_be_bytes([segment[2], segment[3]]);
    let length = u16::from_be_bytes([segment[4], segment[5]]) as usize;
    if length < UDP_HEADER_LEN || length > segment.len() {
        return Err(PacketError::MalformedUdpDatagram);
    }
    Ok(UdpDatagram {
        source_port,
        destination_port,
        payload: &segment[UDP_HEADER_LEN..length],
    })
}

/// Convenience wrapper: IP parse followed by UDP parse.
pub fn parse_udp_packet(packet: &[u8]) -> Result<UdpPacket<'_>, PacketError> {
    let ip = parse_packet(packet)?;
    let udp = parse_udp(&ip)?;
    Ok(UdpPacket {
        endpoints: PacketEndpoints {
            source: ip.source,
            destination: ip.destination,
            source_port: udp.source_port,
            destination_port: udp.destination_port,
        },
        payload: udp.payload,
    })
}

fn parse_ipv4(packet: &[u8]) -> Result<IpPacket<'_>, PacketError> {
    if packet.len() < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || header_len > packet.len() {
        return Err(PacketError::MalformedIpv4Header);
    }

    // Checksum first: a corrupted length field must read as corruption.
    let stored = u16::from_be_bytes([packet[10], packet[11]]);
    let mut header = [0u8; 60];
    header[..header_len].copy_from_slice(&packet[..header_len]);
    header[10] = 0;
    header[11] = 0;
    if checksum::ipv4_header(&header[..header_len]) != stored {
        return Err(PacketError::ChecksumMismatch);
    }

    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(PacketError::MalformedIpv4Header);
    }
    let source = IpAddr::V4(Ipv4Addr::new(
        packet[12], packet[13], packet[14], packet[15],
    ));
    let destination = IpAddr::V4(Ipv4Addr::new(
        packet[16], packet[17], packet[18], packet[19],
    ));
    Ok(IpPacket {
        version: IpVersion::V4,
        source,
        destination,
        protocol: packet[9],
        ttl: packet[8],
        payload: &packet[header_len..total_len],
    })
}

fn parse_ipv6(packet: &[u8]) -> Result<IpPacket<'_>, PacketError> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(PacketError::MalformedIpv6Header);
    }
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    let mut next_header = packet[6];
    let hop_limit = packet[7];
    if payload_len == 0 && next_header == EXT_HOP_BY_HOP {
        return Err(PacketError::Unsupported("IPv6 jumbogram"));
    }
    let end = IPV6_HEADER_LEN + payload_len;
    if end > packet.len() {
        return Err(PacketError::MalformedIpv6Header);
    }

    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[8..24]);
    let source = Ipv6Addr::from(octets);
    octets.copy_from_slice(&packet[24..40]);
    let destination = Ipv6Addr::from(octets);

    let mut offset = IPV6_HEADER_LEN;
    while matches!(
        next_header,
        EXT_HOP_BY_HOP | EXT_ROUTING | EXT_FRAGMENT | EXT_AUTH | EXT_DEST_OPTIONS
    ) {
        if offset + 2 > end {
            return Err(PacketError::MalformedIpv6Header);
        }
        let length_field = usize::from(packet[offset + 1]);
        let ext_len = match next_header {
            EXT_FRAGMENT => 8,
            EXT_AUTH => (length_field + 2) * 4,
            _ => (length_field + 1) * 8,
        };
        next_header = packet[offset];
        offset += ext_len;
        if offset > end {
            return Err(PacketError::MalformedIpv6Header);
        }
    }

    let payload = if next_header == EXT_NONE {
        &packet[end..end]
    } else {
        &packet[offset..end]
    };

    if next_header == IPPROTO_UDP {
        if payload.len() < UDP_HEADER_LEN {
            return Err(PacketError::MalformedUdpDatagram);
        }
        // A zero UDP checksum is not permitted over IPv6.
        let stored = u16::from_be_bytes([payload[6], payload[7]]);
        if stored == 0 || checksum::udp_ipv6(source, destination, payload) != 0 {
            return Err(PacketError::ChecksumMismatch);
        }
    }

    Ok(IpPacket {
        version: IpVersion::V6,
        source: IpAddr::V6(source),
        destination: IpAddr::V6(destination),
        protocol: next_header,
        ttl: hop_limit,
        payload,
    })
}
