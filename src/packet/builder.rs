//! Packet building for DNS replies written back into the tunnel.

use super::{checksum, PacketEndpoints, PacketError, IPPROTO_UDP, REPLY_TTL};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// Wrap an upper-layer `payload` in an IP header addressed from `source` to
/// `destination`.
pub fn build_packet(
    protocol: u8,
    source: IpAddr,
    destination: IpAddr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => build_ipv4(protocol, src, dst, payload),
        (IpAddr::V6(src), IpAddr::V6(dst)) => build_ipv6(protocol, src, dst, payload),
        _ => Err(PacketError::AddressFamilyMismatch),
    }
}

/// Build a UDP segment (header + payload) with its checksum filled in.
pub fn build_udp(endpoints: &PacketEndpoints, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let total_len = UDP_HEADER_LEN + payload.len();
    if total_len > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let mut buffer = vec![0u8; total_len];
    buffer[0..2].copy_from_slice(&endpoints.source_port.to_be_bytes());
    buffer[2..4].copy_from_slice(&endpoints.destination_port.to_be_bytes());
    buffer[4..6].copy_from_slice(&(total_len as u16).to_be_bytes());
    // checksum placeholder at 6..8
    buffer[UDP_HEADER_LEN..].copy_from_slice(payload);

    let sum = checksum::udp(endpoints.source, endpoints.destination, &buffer)
        .ok_or(PacketError::AddressFamilyMismatch)?;
    buffer[6..8].copy_from_slice(&checksum::non_zero(sum).to_be_bytes());
    Ok(buffer)
}

/// Build the reply to a datagram received on `endpoints`: addresses and
/// ports are swapped.
pub fn build_udp_reply(endpoints: &PacketEndpoints, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let reply = endpoints.reversed();
    let segment = build_udp(&reply, payload)?;
    build_packet(IPPROTO_UDP, reply.source, reply.destination, &segment)
}

fn build_ipv4(
    protocol: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    let total_len = IPV4_HEADER_LEN + payload.len();
    if total_len > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45; // version + IHL
    buffer[1] = 0;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buffer[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags + fragment offset
    buffer[8] = REPLY_TTL;
    buffer[9] = protocol;
    buffer[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    buffer[12..16].copy_from_slice(&source.octets());
    buffer[16..20].copy_from_slice(&destination.octets());

    let header_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&header_checksum.to_be_bytes());
    buffer[IPV4_HEADER_LEN..].copy_from_slice(payload);
    Ok(buffer)
}

fn build_ipv6(
    protocol: u8,
    source: Ipv6Addr,
    destination: Ipv6Addr,
    payload: &[u8],
) -> Result<Vec<u8>, PacketError> {
    if payload.len() > u16::MAX as usize {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }
    let mut buffer = vec![0u8; IPV6_HEADER_LEN + payload.len()];

    buffer[0] = 0x60; // version 6, traffic class + flow label zero
    buffer[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    buffer[6] = protocol;
    buffer[7] = REPLY_TTL; // hop limit
    buffer[8..24].copy_from_slice(&source.octets());
    buffer[24..40].copy_from_slice(&destination.octets());
    buffer[IPV6_HEADER_LEN..].copy_from_slice(payload);
    Ok(buffer)
}
