//! Internet checksum (RFC 1071) helpers for IPv4 headers and UDP segments.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::IPPROTO_UDP;

/// Adds `bytes` to a running one's-complement sum as big-endian 16-bit words.
/// An odd trailing byte is padded with zero.
pub fn accumulate(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add(u16::from_be_bytes([byte, 0]) as u32);
    }
    sum
}

/// Folds the carries back in and returns the complemented 16-bit result.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the ones' complement checksum over a byte slice.
pub fn ones_complement(sum: u32, bytes: &[u8]) -> u16 {
    finish(accumulate(sum, bytes))
}

/// Compute IPv4 header checksum. The checksum field must already be zeroed
/// when building; when verifying a received header the result is zero.
pub fn ipv4_header(header: &[u8]) -> u16 {
    ones_complement(0, header)
}

/// Compute UDP checksum over IPv4 pseudo-header + segment.
pub fn udp_ipv4(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = accumulate(sum, &[0, IPPROTO_UDP]);
    sum = accumulate(sum, &(segment.len() as u16).to_be_bytes());
    ones_complement(sum, segment)
}

/// Compute UDP checksum over IPv6 pseudo-header + segment.
pub fn udp_ipv6(src: Ipv6Addr, dst: Ipv6Addr, segment: &[u8]) -> u16 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum = accumulate(sum, &(segment.len() as u32).to_be_bytes());
    sum = accumulate(sum, &[0, 0, 0, IPPROTO_UDP]);
    ones_complement(sum, segment)
}

/// UDP checksum for either family. Returns `None` when the addresses are of
/// different families.
pub fn udp(src: IpAddr, dst: IpAddr, segment: &[u8]) -> Option<u16> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => Some(udp_ipv4(src, dst, segment)),
        (IpAddr::V6(src), IpAddr::V6(dst)) => Some(udp_ipv6(src, dst, segment)),
        _ => None,
    }
}

/// A transmitted UDP checksum of zero means "no checksum", so a computed zero
/// goes on the wire as all ones.
pub fn non_zero(checksum: u16) -> u16 {
    if checksum == 0 {
        0xFFFF
    } else {
        checksum
    }
}
