//! Pre-cooked L2/L3/L4 frame assembly and parsing for the UDP engine.
//!
//! The tap adapter speaks whole Ethernet frames (see
//! `passt_tap::framing::TapSink`), so every datagram forwarded toward
//! the guest has to carry its own Ethernet/IP/UDP headers; this module
//! is the one place that lays those bytes out and folds in the
//! checksums from [`crate::checksum`].

use crate::checksum;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const IPPROTO_UDP: u8 = 17;

/// Default hop limit/TTL stamped on every frame the connector cooks;
/// the guest never routes these packets further, so any value works,
/// but a real-looking one avoids surprising a packet-capturing guest.
pub const DEFAULT_TTL: u8 = 64;

/// A decoded UDP-over-IP datagram lifted out of a guest-originated
/// Ethernet frame, with `payload` borrowed from the original frame.
pub struct ParsedUdpV4<'a> {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub payload: &'a [u8],
}

pub struct ParsedUdpV6<'a> {
    pub src: SocketAddrV6,
    pub dst: SocketAddrV6,
    pub payload: &'a [u8],
}

/// Parses a guest-originated Ethernet frame as IPv4/UDP, returning
/// `None` for anything else (ARP, non-UDP IP, truncated frame, IP
/// options present).
pub fn parse_udp_v4(frame: &[u8]) -> Option<ParsedUdpV4<'_>> {
    if frame.len() < ETH_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = &frame[ETH_HDR_LEN..];
    if ip[0] != 0x45 || ip[9] != IPPROTO_UDP {
        return None;
    }
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ETH_HDR_LEN + total_len > frame.len() || total_len < IPV4_HDR_LEN + UDP_HDR_LEN {
        return None;
    }
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    let udp = &ip[IPV4_HDR_LEN..total_len];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < UDP_HDR_LEN || udp_len > udp.len() {
        return None;
    }
    Some(ParsedUdpV4 {
        src: SocketAddrV4::new(src_ip, src_port),
        dst: SocketAddrV4::new(dst_ip, dst_port),
        payload: &udp[UDP_HDR_LEN..udp_len],
    })
}

pub fn parse_udp_v6(frame: &[u8]) -> Option<ParsedUdpV6<'_>> {
    if frame.len() < ETH_HDR_LEN + IPV6_HDR_LEN + UDP_HDR_LEN {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV6 {
        return None;
    }
    let ip = &frame[ETH_HDR_LEN..];
    if ip[6] != IPPROTO_UDP {
        return None;
    }
    let payload_len = u16::from_be_bytes([ip[4], ip[5]]) as usize;
    if IPV6_HDR_LEN + payload_len > frame.len() - ETH_HDR_LEN || payload_len < UDP_HDR_LEN {
        return None;
    }
    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(&ip[8..24]);
    let mut dst_octets = [0u8; 16];
    dst_octets.copy_from_slice(&ip[24..40]);
    let src_ip = Ipv6Addr::from(src_octets);
    let dst_ip = Ipv6Addr::from(dst_octets);
    let udp = &ip[IPV6_HDR_LEN..IPV6_HDR_LEN + payload_len];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    Some(ParsedUdpV6 {
        src: SocketAddrV6::new(src_ip, src_port, 0, 0),
        dst: SocketAddrV6::new(dst_ip, dst_port, 0, 0),
        payload: &udp[UDP_HDR_LEN..],
    })
}

/// Cooks one complete Ethernet/IPv4/UDP frame, checksums included.
pub fn cook_v4(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = (UDP_HDR_LEN + payload.len()) as u16;
    let total_len = IPV4_HDR_LEN as u16 + udp_len;
    let mut frame = Vec::with_capacity(ETH_HDR_LEN + total_len as usize);

    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_at = frame.len();
    frame.push(0x45);
    frame.push(0); // DSCP/ECN
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // identification
    frame.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, no fragment offset
    frame.push(DEFAULT_TTL);
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0, 0]); // checksum, filled below
    frame.extend_from_slice(&src.ip().octets());
    frame.extend_from_slice(&dst.ip().octets());

    let udp_at = frame.len();
    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]); // checksum, filled below
    frame.extend_from_slice(payload);

    let base = checksum::ipv4_partial_sum(0, DEFAULT_TTL, IPPROTO_UDP);
    let ip_checksum = checksum::ipv4_header_checksum(base, total_len, 0, *src.ip(), *dst.ip());
    frame[ip_at + 10..ip_at + 12].copy_from_slice(&ip_checksum.to_be_bytes());

    let udp_checksum = checksum::udp_checksum_v4(*src.ip(), *dst.ip(), &frame[udp_at..]);
    frame[udp_at + 6..udp_at + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    frame
}

/// Cooks one complete Ethernet/IPv6/UDP frame; the UDP checksum is
/// mandatory and always filled in.
pub fn cook_v6(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    src: SocketAddrV6,
    dst: SocketAddrV6,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = (UDP_HDR_LEN + payload.len()) as u16;
    let mut frame = Vec::with_capacity(ETH_HDR_LEN + IPV6_HDR_LEN + udp_len as usize);

    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());

    frame.extend_from_slice(&0x6000_0000u32.to_be_bytes()); // version 6, traffic class/flow label 0
    frame.extend_from_slice(&udp_len.to_be_bytes()); // payload length
    frame.push(IPPROTO_UDP); // next header
    frame.push(DEFAULT_TTL); // hop limit
    frame.extend_from_slice(&src.ip().octets());
    frame.extend_from_slice(&dst.ip().octets());

    let udp_at = frame.len();
    frame.extend_from_slice(&src.port().to_be_bytes());
    frame.extend_from_slice(&dst.port().to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);

    let udp_checksum = checksum::udp_checksum_v6(*src.ip(), *dst.ip(), &frame[udp_at..]);
    frame[udp_at + 6..udp_at + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST_MAC: [u8; 6] = [0x9a, 0x2b, 0x3c, 0x4d, 0x5e, 0x01];
    const GW_MAC: [u8; 6] = [0x9a, 0x2b, 0x3c, 0x4d, 0x5e, 0x02];

    #[test]
    fn cooked_v4_frame_round_trips_through_the_parser() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 3), 53);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), 54213);
        let frame = cook_v4(GUEST_MAC, GW_MAC, src, dst, b"reply-payload");

        let parsed = parse_udp_v4(&frame).expect("cooked frame must parse back");
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.payload, b"reply-payload");
    }

    #[test]
    fn cooked_v4_frame_carries_a_verifiable_ip_checksum() {
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 3), 53);
        let dst = SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), 54213);
        let frame = cook_v4(GUEST_MAC, GW_MAC, src, dst, b"x");
        let ip = &frame[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN];

        let mut sum = crate::checksum::PartialSum::new();
        sum.add_bytes(ip);
        assert_eq!(sum.finish(), 0);
    }

    #[test]
    fn cooked_v6_frame_round_trips_through_the_parser() {
        let src = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 53, 0, 0);
        let dst = SocketAddrV6::new(Ipv6Addr::LOCALHOST, 9000, 0, 0);
        let frame = cook_v6(GUEST_MAC, GW_MAC, src, dst, b"hello-v6");

        let parsed = parse_udp_v6(&frame).expect("cooked v6 frame must parse back");
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.payload, b"hello-v6");
    }
}
