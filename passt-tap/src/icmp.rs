//! ICMP/ICMPv6 echo proxy.
//!
//! One unprivileged "ping" socket (`SOCK_DGRAM` + `IPPROTO_ICMP`/
//! `IPPROTO_ICMPV6`) per echo identifier, indexed by that identifier.
//! Requires the host to allow unprivileged ping sockets for the
//! connector's uid/gid range (`net.ipv4.ping_group_range`); if the kernel
//! refuses socket creation, the echo is simply dropped and logged rather
//! than propagated as a fatal error.

use crate::error::{Error, Result};
use passt_core::types::PORTS;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::rc::Rc;
use tokio::net::UdpSocket;

/// Wraps an IPv4 address as an IPv4-mapped IPv6 address
/// (`::ffff:a.b.c.d`), used when a v4 echo reply needs to be injected
/// over a v6 tap path.
pub fn v4_mapped_v6(addr: Ipv4Addr) -> Ipv6Addr {
    addr.to_ipv6_mapped()
}

/// Tracks one open ping socket per echo identifier, for one IP version.
struct EchoTable {
    sockets: Vec<Option<Rc<UdpSocket>>>,
}

impl EchoTable {
    fn new() -> Self {
        let mut sockets = Vec::with_capacity(PORTS);
        sockets.resize_with(PORTS, || None);
        Self { sockets }
    }
}

/// The ICMP echo proxy: one [`EchoTable`] per IP version.
pub struct IcmpProxy {
    v4: EchoTable,
    v6: EchoTable,
}

impl Default for IcmpProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl IcmpProxy {
    pub fn new() -> Self {
        Self {
            v4: EchoTable::new(),
            v6: EchoTable::new(),
        }
    }

    /// Returns the socket already bound to `echo_id`, opening (and
    /// caching) one if this is the first echo seen for that identifier.
    pub fn socket_for_v4(&mut self, echo_id: u16) -> Result<Rc<UdpSocket>> {
        if let Some(sock) = &self.v4.sockets[echo_id as usize] {
            return Ok(sock.clone());
        }
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
            .map_err(Error::Io)?;
        raw.set_nonblocking(true)?;
        let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, echo_id).into();
        raw.bind(&bind_addr.into())?;
        let sock = Rc::new(UdpSocket::from_std(raw.into())?);
        self.v4.sockets[echo_id as usize] = Some(sock.clone());
        Ok(sock)
    }

    pub fn socket_for_v6(&mut self, echo_id: u16) -> Result<Rc<UdpSocket>> {
        if let Some(sock) = &self.v6.sockets[echo_id as usize] {
            return Ok(sock.clone());
        }
        let raw = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6))
            .map_err(Error::Io)?;
        raw.set_nonblocking(true)?;
        let bind_addr: SocketAddr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, echo_id, 0, 0).into();
        raw.bind(&bind_addr.into())?;
        let sock = Rc::new(UdpSocket::from_std(raw.into())?);
        self.v6.sockets[echo_id as usize] = Some(sock.clone());
        Ok(sock)
    }

    /// Forwards an echo request read off the tap toward `dest`, opening
    /// the identifier's socket lazily.
    pub async fn forward_request_v4(&mut self, echo_id: u16, dest: Ipv4Addr, payload: &[u8]) -> Result<()> {
        let sock = self.socket_for_v4(echo_id)?;
        sock.send_to(payload, SocketAddr::V4(SocketAddrV4::new(dest, 0)))
            .await?;
        Ok(())
    }

    pub async fn forward_request_v6(&mut self, echo_id: u16, dest: Ipv6Addr, payload: &[u8]) -> Result<()> {
        let sock = self.socket_for_v6(echo_id)?;
        sock.send_to(payload, SocketAddr::V6(SocketAddrV6::new(dest, 0, 0, 0)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_v4_address_into_v4_mapped_v6() {
        let v4 = Ipv4Addr::new(192, 0, 2, 7);
        let mapped = v4_mapped_v6(v4);
        assert!(mapped.to_ipv4_mapped().is_some());
        assert_eq!(mapped.to_ipv4_mapped().unwrap(), v4);
    }
}
