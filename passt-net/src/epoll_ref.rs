//! Tagged per-resource reference, standing in for a packed 64-bit epoll
//! userdata word.
//!
//! A C implementation packs `{proto, fd, per-proto payload}` into one
//! 64-bit integer attached to each `epoll_ctl` registration, because C has
//! no sum type and one `union`-typed word is the cheapest way to carry
//! per-fd context through `epoll_wait`. Rust's reactor (`tokio`, backed by
//! `mio`) already does this multiplexing and owns `epoll_ctl` itself, so
//! there is nothing to pack — we just attach a plain tagged enum to each
//! resource we track, keeping the full sum type instead of an integer
//! token, since nothing here lives across an FFI boundary.

use passt_core::types::IpVersion;

/// Per-connection payload for a TCP-related registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpRef {
    /// True if this registration belongs to a spliced connection (as
    /// opposed to the full tap-facing TCP stack, out of scope here).
    pub splice: bool,
    /// True if this is a listening socket rather than an established one.
    pub listen: bool,
    pub v6: bool,
    /// Index into the splice connection table.
    pub index: u32,
}

/// Direction tag for a UDP PASTA loopback-shortcut registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpSplice {
    None,
    ToNs,
    ToInit,
    BackToNs,
    BackToInit,
}

/// Per-socket payload for a UDP-related registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpRef {
    pub bound: bool,
    pub v6: bool,
    pub splice: UdpSplice,
    pub port: u16,
}

/// Per-socket payload for an ICMP echo-proxy registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpRef {
    pub v6: bool,
    pub echo_id: u16,
}

/// Discriminated reference attached to every tracked file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ref {
    Tcp(TcpRef),
    Udp(UdpRef),
    Icmp(IcmpRef),
}

impl Ref {
    pub fn ip_version(&self) -> IpVersion {
        let v6 = match self {
            Ref::Tcp(r) => r.v6,
            Ref::Udp(r) => r.v6,
            Ref::Icmp(r) => r.v6,
        };
        if v6 {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }
}
