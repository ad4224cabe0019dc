//! UDP forwarding engine.
//!
//! Tracks, per IP version, which guest-facing ports currently have a
//! forwarding socket open on the host side (`tap_ports`), and — PASTA
//! only — which ports are short-circuited straight across the loopback
//! namespace boundary without a host-side socket at all (`splice_ports`).
//! Both tables are dense, port-indexed arrays so lookup is O(1) and the
//! aging sweep only visits ports an activity bitmap says were touched
//! since the last tick, instead of scanning the full 65536-entry table.
//!
//! Two directions are driven on top of these tables: guest-to-socket
//! (`forward_guest_frame*`, a datagram the guest just sent, rewritten and
//! handed to a host socket) and socket-to-guest (`drain_all_tap_ports`,
//! replies drained off those same host sockets, rewritten and cooked
//! into Ethernet frames for the caller to batch onto the tap sink). A
//! third, PASTA-only path (`splice_forward`/`splice_reverse_send`)
//! shortcuts UDP between the init and guest namespaces over loopback
//! without opening a tap-facing socket at all, since both ends are
//! local.
//!
//! Every socket operation here is the non-blocking `try_*` form
//! (`try_recv_from`/`try_send_to`), never the `.await`-ing kind: the
//! engine is driven from inside a single `Rc<RefCell<_>>`-guarded
//! `Context`, and holding that borrow across an `.await` would risk a
//! double-borrow panic against the maintenance tick running on the same
//! `LocalSet`. A `try_send_to` that would block simply drops the
//! datagram, same as a kernel socket buffer overflowing would.

use crate::error::{Error, Result};
use crate::headers;
use bitflags::bitflags;
use passt_core::config::{Config, PortMap};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use passt_core::types::{IpVersion, PORTS, UDP_IDLE_TIMEOUT_SECS, UDP_MAX_BATCH};

bitflags! {
    /// Per-port classification used to pick a source-rewrite rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u8 {
        /// Bound to a host-local (non-loopback, non-GUA) address.
        const LOCAL    = 0b0000_0001;
        /// Bound to loopback; only reachable via the PASTA shortcut.
        const LOOPBACK = 0b0000_0010;
        /// Bound to a global unicast IPv6 address.
        const GUA      = 0b0000_0100;
        /// Currently spliced straight across the namespace boundary.
        const SPLICE   = 0b0000_1000;
        /// A reply on this port was last seen rewritten to look like it
        /// came from the gateway, rather than passed straight through.
        const MASQUERADED = 0b0001_0000;
    }
}

/// A word-granularity activity bitmap over the 65536 possible ports: a
/// set bit means "touched since the last aging sweep", letting the aging
/// pass skip entire 64-port words with a single comparison instead of
/// visiting all 65536 entries.
pub struct ActivityBitmap {
    words: Box<[u64]>,
}

impl ActivityBitmap {
    fn new() -> Self {
        Self {
            words: vec![0u64; PORTS / 64].into_boxed_slice(),
        }
    }

    pub fn mark(&mut self, port: u16) {
        let idx = port as usize;
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self, port: u16) {
        let idx = port as usize;
        self.words[idx / 64] &= !(1 << (idx % 64));
    }

    pub fn is_marked(&self, port: u16) -> bool {
        let idx = port as usize;
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Ports in words with at least one set bit, for the aging sweep to
    /// visit instead of scanning all 65536 entries.
    pub fn active_words(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .map(|(i, _)| i)
    }
}

/// One tap-facing UDP forwarding entry: the host-side socket used to
/// relay datagrams originating from this guest port, and when it was
/// last used.
pub struct TapPortEntry {
    pub socket: Rc<UdpSocket>,
    pub last_active: Instant,
    pub flags: PortFlags,
    /// The address the guest was last seen sending this port's traffic
    /// toward, before any destination rewrite; replies are cooked back
    /// toward this address on the way to the tap.
    pub guest_addr: IpAddr,
}

/// A PASTA-only loopback splice: guest port `port` is forwarded directly
/// to a configured port inside the init namespace (or vice-versa)
/// without opening a distinct tap-facing socket, because both endpoints
/// are loopback addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceDirection {
    /// A guest-originated datagram forwarded into the init namespace.
    ToNs,
    /// A guest-originated datagram forwarded into the ns namespace.
    ToInit,
    /// A reply routed back toward the ns-side sender.
    BackToNs,
    /// A reply routed back toward the init-side sender.
    BackToInit,
}

/// One loopback-splice port's bookkeeping. A single flow touches two
/// table slots: the slot keyed by the original sender's port holds the
/// `*_conn_sock` used to send the forward datagram, and the slot keyed
/// by that socket's own (kernel-assigned) port holds the `*_bound_sock`
/// and destination port the reverse path sends a reply back to — in the
/// common case both names refer to the very same socket, registered
/// under two keys because it plays both roles.
#[derive(Default)]
pub struct SplicePortEntry {
    pub ns_conn_sock: Option<Rc<UdpSocket>>,
    pub init_conn_sock: Option<Rc<UdpSocket>>,
    pub ns_bound_sock: Option<Rc<UdpSocket>>,
    pub init_bound_sock: Option<Rc<UdpSocket>>,
    pub ns_dst_port: Option<u16>,
    pub init_dst_port: Option<u16>,
    pub last_active_fwd: Option<Instant>,
    pub last_active_back: Option<Instant>,
}

struct PortTable {
    tap: Vec<Option<TapPortEntry>>,
    splice: Vec<Option<SplicePortEntry>>,
    activity: ActivityBitmap,
}

impl PortTable {
    fn new() -> Self {
        let mut tap = Vec::with_capacity(PORTS);
        tap.resize_with(PORTS, || None);
        let mut splice = Vec::with_capacity(PORTS);
        splice.resize_with(PORTS, || None);
        Self {
            tap,
            splice,
            activity: ActivityBitmap::new(),
        }
    }
}

/// The UDP forwarding engine: one dense port table per IP version.
pub struct UdpEngine {
    tables: HashMap<IpVersion, PortTable>,
}

impl Default for UdpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpEngine {
    pub fn new() -> Self {
        let mut tables = HashMap::new();
        for v in IpVersion::ALL {
            tables.insert(v, PortTable::new());
        }
        Self { tables }
    }

    fn table_mut(&mut self, v: IpVersion) -> &mut PortTable {
        self.tables.get_mut(&v).expect("every IpVersion has a table")
    }

    fn table(&self, v: IpVersion) -> &PortTable {
        self.tables.get(&v).expect("every IpVersion has a table")
    }

    /// Registers (or refreshes) a tap-facing forwarding socket for
    /// `port`, classifying it by the address it ended up bound to.
    pub fn bind_tap_port(
        &mut self,
        v: IpVersion,
        port: u16,
        socket: Rc<UdpSocket>,
        flags: PortFlags,
        guest_addr: IpAddr,
    ) {
        let now = Instant::now();
        let table = self.table_mut(v);
        table.tap[port as usize] = Some(TapPortEntry {
            socket,
            last_active: now,
            flags,
            guest_addr,
        });
        table.activity.mark(port);
    }

    pub fn tap_port(&self, v: IpVersion, port: u16) -> Option<&TapPortEntry> {
        self.table(v).tap[port as usize].as_ref()
    }

    /// Marks a port as freshly active, refreshing its aging clock
    /// (called on every datagram forwarded through it).
    pub fn touch_tap_port(&mut self, v: IpVersion, port: u16) {
        let now = Instant::now();
        let table = self.table_mut(v);
        if let Some(entry) = table.tap[port as usize].as_mut() {
            entry.last_active = now;
        }
        table.activity.mark(port);
    }

    pub fn splice_entry(&self, v: IpVersion, port: u16) -> Option<&SplicePortEntry> {
        self.table(v).splice[port as usize].as_ref()
    }

    fn splice_entry_mut(&mut self, v: IpVersion, port: u16) -> &mut SplicePortEntry {
        let table = self.table_mut(v);
        table.activity.mark(port);
        table.splice[port as usize].get_or_insert_with(SplicePortEntry::default)
    }

    /// Ages out entries idle for longer than
    /// [`passt_core::types::UDP_IDLE_TIMEOUT_SECS`], visiting only the
    /// words the activity bitmap says might hold something, and clearing
    /// the bit for any port it fully retires. A splice entry's idle
    /// clock is the more recent of its forward and reverse activity.
    pub fn age_out(&mut self, now: Instant) -> usize {
        let timeout = Duration::from_secs(UDP_IDLE_TIMEOUT_SECS);
        let mut retired = 0;
        for v in IpVersion::ALL {
            let table = self.table_mut(v);
            let words: Vec<usize> = table.activity.active_words().collect();
            for word in words {
                for bit in 0..64u16 {
                    let port = (word * 64) as u16 + bit;
                    let mut still_live = false;

                    if let Some(entry) = &table.tap[port as usize] {
                        if now.duration_since(entry.last_active) >= timeout {
                            table.tap[port as usize] = None;
                            retired += 1;
                        } else {
                            still_live = true;
                        }
                    }
                    if let Some(entry) = &table.splice[port as usize] {
                        let last = match (entry.last_active_fwd, entry.last_active_back) {
                            (Some(a), Some(b)) => a.max(b),
                            (Some(a), None) => a,
                            (None, Some(b)) => b,
                            (None, None) => now,
                        };
                        if now.duration_since(last) >= timeout {
                            table.splice[port as usize] = None;
                            retired += 1;
                        } else {
                            still_live = true;
                        }
                    }

                    if !still_live {
                        table.activity.clear(port);
                    }
                }
            }
        }
        retired
    }

    // ---- PASTA loopback splice (guest namespace <-> init namespace) ----

    /// Finds or creates the loopback-bound socket used to carry a
    /// forwarded splice datagram, registering the two table slots
    /// (keyed by the rewritten sender port, and by the socket's own
    /// kernel-assigned port) the reverse path needs to route a reply.
    /// `ToNs` creates its socket inside the guest namespace at `netns`;
    /// `ToInit` creates it in the connector's own namespace.
    pub fn splice_forward_socket(
        &mut self,
        v: IpVersion,
        direction: SpliceDirection,
        peer_port: u16,
        port_map: &PortMap,
        netns: Option<&Path>,
    ) -> Result<Rc<UdpSocket>> {
        let src = port_map.reverse(peer_port);

        if let Some(existing) = self.splice_conn_socket(v, src, direction) {
            return Ok(existing);
        }

        let std_socket = match direction {
            SpliceDirection::ToNs => {
                let ns_path = netns.ok_or_else(|| {
                    Error::Namespace("ToNs loopback splice requires a guest namespace path".into())
                })?;
                crate::nsenter::enter_and(ns_path, || new_loopback_bound(v))??
            }
            SpliceDirection::ToInit => new_loopback_bound(v)?,
            SpliceDirection::BackToNs | SpliceDirection::BackToInit => {
                return Err(Error::Namespace(
                    "splice_forward_socket called with a reverse direction".into(),
                ))
            }
        };
        let socket = Rc::new(UdpSocket::from_std(std_socket)?);
        let own_port = socket.local_addr()?.port();

        {
            let bound_entry = self.splice_entry_mut(v, own_port);
            match direction {
                SpliceDirection::ToNs => {
                    bound_entry.ns_bound_sock = Some(Rc::clone(&socket));
                    bound_entry.ns_dst_port = Some(src);
                }
                SpliceDirection::ToInit => {
                    bound_entry.init_bound_sock = Some(Rc::clone(&socket));
                    bound_entry.init_dst_port = Some(src);
                }
                _ => unreachable!("reverse directions rejected above"),
            }
            bound_entry.last_active_back = Some(Instant::now());
        }
        {
            let conn_entry = self.splice_entry_mut(v, src);
            match direction {
                SpliceDirection::ToNs => conn_entry.ns_conn_sock = Some(Rc::clone(&socket)),
                SpliceDirection::ToInit => conn_entry.init_conn_sock = Some(Rc::clone(&socket)),
                _ => unreachable!("reverse directions rejected above"),
            }
            conn_entry.last_active_fwd = Some(Instant::now());
        }

        Ok(socket)
    }

    fn splice_conn_socket(&self, v: IpVersion, src_port: u16, direction: SpliceDirection) -> Option<Rc<UdpSocket>> {
        let entry = self.table(v).splice[src_port as usize].as_ref()?;
        match direction {
            SpliceDirection::ToNs => entry.ns_conn_sock.clone(),
            SpliceDirection::ToInit => entry.init_conn_sock.clone(),
            _ => None,
        }
    }

    /// Sends a forwarded datagram over the loopback-splice socket for
    /// this flow, creating it first if this is the flow's first packet.
    /// A kernel-buffer-full `try_send_to` silently drops the datagram.
    pub fn splice_forward(
        &mut self,
        v: IpVersion,
        direction: SpliceDirection,
        peer_port: u16,
        configured_port: u16,
        port_map: &PortMap,
        netns: Option<&Path>,
        payload: &[u8],
    ) -> Result<()> {
        let socket = self.splice_forward_socket(v, direction, peer_port, port_map, netns)?;
        let loopback: IpAddr = match v {
            IpVersion::V4 => Ipv4Addr::LOCALHOST.into(),
            IpVersion::V6 => Ipv6Addr::LOCALHOST.into(),
        };
        match socket.try_send_to(payload, SocketAddr::new(loopback, configured_port)) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        let src = port_map.reverse(peer_port);
        let table = self.table_mut(v);
        if let Some(entry) = table.splice[src as usize].as_mut() {
            entry.last_active_fwd = Some(Instant::now());
        }
        Ok(())
    }

    /// Looks up the bound socket and destination port a reply for
    /// `own_port` (the forward socket's own kernel-assigned port) should
    /// be sent back through, for the matching reverse direction.
    pub fn splice_reverse_target(
        &self,
        v: IpVersion,
        direction: SpliceDirection,
        own_port: u16,
    ) -> Option<(Rc<UdpSocket>, u16)> {
        let entry = self.table(v).splice[own_port as usize].as_ref()?;
        match direction {
            SpliceDirection::BackToNs => Some((entry.ns_bound_sock.clone()?, entry.ns_dst_port?)),
            SpliceDirection::BackToInit => Some((entry.init_bound_sock.clone()?, entry.init_dst_port?)),
            _ => None,
        }
    }

    /// Sends a reply back across the loopback splice. Silently drops it
    /// if no forward flow registered a route for `own_port` — the peer
    /// that would have received it is gone — or if the send would block.
    pub fn splice_reverse_send(
        &mut self,
        v: IpVersion,
        direction: SpliceDirection,
        own_port: u16,
        payload: &[u8],
    ) -> Result<()> {
        let Some((back_sock, send_dst)) = self.splice_reverse_target(v, direction, own_port) else {
            return Ok(());
        };
        let loopback: IpAddr = match v {
            IpVersion::V4 => Ipv4Addr::LOCALHOST.into(),
            IpVersion::V6 => Ipv6Addr::LOCALHOST.into(),
        };
        match back_sock.try_send_to(payload, SocketAddr::new(loopback, send_dst)) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        let table = self.table_mut(v);
        if let Some(entry) = table.splice[own_port as usize].as_mut() {
            entry.last_active_back = Some(Instant::now());
        }
        Ok(())
    }

    // ---- guest -> socket direction ----

    /// Rewrites a guest-originated destination: a DNS-forward query is
    /// redirected to the first configured resolver outright; otherwise
    /// traffic aimed at the gateway address is redirected to loopback,
    /// unless this port has already talked to a genuinely local address
    /// (`PortFlags::LOCAL`), in which case it is left addressed to
    /// `addr_seen` instead, so a port already mid-conversation with a
    /// real local peer is not silently rerouted onto loopback.
    pub fn redirect_destination_v4(
        &self,
        guest_port: u16,
        dest: SocketAddr,
        gw: Ipv4Addr,
        addr_seen: Ipv4Addr,
        dns: &[Ipv4Addr],
        dns_fwd: bool,
    ) -> SocketAddr {
        let dns_redirected = redirect_dns_v4(dest, dns, dns_fwd);
        if dns_redirected != dest {
            return dns_redirected;
        }
        match dest {
            SocketAddr::V4(s) if *s.ip() == gw => {
                let prior_local = self
                    .tap_port(IpVersion::V4, guest_port)
                    .is_some_and(|e| e.flags.contains(PortFlags::LOCAL));
                if prior_local {
                    SocketAddr::new(IpAddr::V4(addr_seen), s.port())
                } else {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), s.port())
                }
            }
            other => other,
        }
    }

    pub fn redirect_destination_v6(
        &self,
        guest_port: u16,
        dest: SocketAddr,
        gw: Ipv6Addr,
        addr: Ipv6Addr,
        dns: &[Ipv6Addr],
        dns_fwd: bool,
    ) -> SocketAddr {
        let dns_redirected = redirect_dns_v6(dest, dns, dns_fwd);
        if dns_redirected != dest {
            return dns_redirected;
        }
        match dest {
            SocketAddr::V6(s) if *s.ip() == gw => {
                let prior_local = self
                    .tap_port(IpVersion::V6, guest_port)
                    .is_some_and(|e| e.flags.contains(PortFlags::LOCAL));
                if prior_local {
                    SocketAddr::new(IpAddr::V6(addr), s.port())
                } else {
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), s.port())
                }
            }
            other => other,
        }
    }

    fn classify_v4(dst: Ipv4Addr) -> PortFlags {
        if dst.is_loopback() {
            PortFlags::LOOPBACK
        } else {
            PortFlags::LOCAL
        }
    }

    fn classify_v6(dst: Ipv6Addr) -> PortFlags {
        if dst.is_loopback() {
            PortFlags::LOOPBACK
        } else if (dst.segments()[0] & 0xe000) == 0x2000 {
            PortFlags::GUA
        } else {
            PortFlags::LOCAL
        }
    }

    /// Binds (or reuses) the tap-facing socket for `port`, non-blocking
    /// and registered with the reactor via a synchronous `std` bind so
    /// this never needs to be an `async fn`.
    fn socket_for_guest_port_v4(&mut self, port: u16, classify_dst: Ipv4Addr) -> Result<Rc<UdpSocket>> {
        if let Some(entry) = self.tap_port(IpVersion::V4, port) {
            return Ok(Rc::clone(&entry.socket));
        }
        let std_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = Rc::new(UdpSocket::from_std(std_socket)?);
        self.bind_tap_port(
            IpVersion::V4,
            port,
            Rc::clone(&socket),
            Self::classify_v4(classify_dst),
            IpAddr::V4(classify_dst),
        );
        Ok(socket)
    }

    fn socket_for_guest_port_v6(&mut self, port: u16, classify_dst: Ipv6Addr) -> Result<Rc<UdpSocket>> {
        if let Some(entry) = self.tap_port(IpVersion::V6, port) {
            return Ok(Rc::clone(&entry.socket));
        }
        let std_socket = std::net::UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?;
        std_socket.set_nonblocking(true)?;
        let socket = Rc::new(UdpSocket::from_std(std_socket)?);
        self.bind_tap_port(
            IpVersion::V6,
            port,
            Rc::clone(&socket),
            Self::classify_v6(classify_dst),
            IpAddr::V6(classify_dst),
        );
        Ok(socket)
    }

    /// Dispatches a guest-originated Ethernet frame by Ethertype,
    /// ignoring anything that isn't IPv4/IPv6 UDP (ARP, TCP, ICMP are
    /// handled by their own engines).
    pub fn forward_guest_frame(&mut self, frame: &[u8], cfg: &Config) -> Result<()> {
        if frame.len() < headers::ETH_HDR_LEN {
            return Ok(());
        }
        match u16::from_be_bytes([frame[12], frame[13]]) {
            0x0800 => self.forward_guest_frame_v4(frame, cfg),
            0x86dd => self.forward_guest_frame_v6(frame, cfg),
            _ => Ok(()),
        }
    }

    pub fn forward_guest_frame_v4(&mut self, frame: &[u8], cfg: &Config) -> Result<()> {
        let Some(parsed) = headers::parse_udp_v4(frame) else {
            return Ok(());
        };
        let port = parsed.src.port();
        let socket = self.socket_for_guest_port_v4(port, *parsed.dst.ip())?;
        let dest = self.redirect_destination_v4(
            port,
            SocketAddr::V4(parsed.dst),
            cfg.ip4.gw,
            cfg.ip4.addr_seen,
            &cfg.ip4.dns,
            !cfg.ip4.dns_fwd.is_unspecified(),
        );
        match socket.try_send_to(parsed.payload, dest) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        self.touch_tap_port(IpVersion::V4, port);
        Ok(())
    }

    pub fn forward_guest_frame_v6(&mut self, frame: &[u8], cfg: &Config) -> Result<()> {
        let Some(parsed) = headers::parse_udp_v6(frame) else {
            return Ok(());
        };
        let port = parsed.src.port();
        let socket = self.socket_for_guest_port_v6(port, *parsed.dst.ip())?;
        let dest = self.redirect_destination_v6(
            port,
            SocketAddr::V6(parsed.dst),
            cfg.ip6.gw,
            cfg.ip6.addr,
            &cfg.ip6.dns,
            !cfg.ip6.dns_fwd.is_unspecified(),
        );
        match socket.try_send_to(parsed.payload, dest) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        }
        self.touch_tap_port(IpVersion::V6, port);
        Ok(())
    }

    // ---- socket -> guest direction ----

    /// Rewrites a reply's source address before it is cooked into a
    /// frame for the guest. Priority order: a reply from the resolver
    /// this engine itself redirected queries to (`dns[0]:53`, only while
    /// `dns_fwd` is configured) is rewritten back to `dns_fwd:53` so the
    /// guest sees the address it was told to expect; otherwise a reply
    /// from loopback, an unspecified address, or `addr_seen` is
    /// masqueraded as coming from the gateway. Returns the rewritten
    /// address and whether the gateway rule fired.
    pub fn masquerade_v4(
        source: SocketAddr,
        gw: Ipv4Addr,
        addr_seen: Ipv4Addr,
        dns: &[Ipv4Addr],
        dns_fwd: Ipv4Addr,
        no_map_gw: bool,
    ) -> (SocketAddr, bool) {
        if let SocketAddr::V4(s) = source {
            if s.port() == 53 && !dns_fwd.is_unspecified() && dns.first() == Some(s.ip()) {
                return (SocketAddr::new(IpAddr::V4(dns_fwd), 53), false);
            }
        }
        if no_map_gw {
            return (source, false);
        }
        match source {
            SocketAddr::V4(s)
                if s.ip().is_loopback() || s.ip().is_unspecified() || *s.ip() == addr_seen =>
            {
                (SocketAddr::new(IpAddr::V4(gw), s.port()), true)
            }
            other => (other, false),
        }
    }

    pub fn masquerade_v6(
        source: SocketAddr,
        gw: Ipv6Addr,
        addr_seen: Ipv6Addr,
        dns: &[Ipv6Addr],
        dns_fwd: Ipv6Addr,
        no_map_gw: bool,
    ) -> (SocketAddr, bool) {
        if let SocketAddr::V6(s) = source {
            if s.port() == 53 && !dns_fwd.is_unspecified() && dns.first() == Some(s.ip()) {
                return (SocketAddr::new(IpAddr::V6(dns_fwd), 53), false);
            }
        }
        if no_map_gw {
            return (source, false);
        }
        match source {
            SocketAddr::V6(s)
                if s.ip().is_loopback() || s.ip().is_unspecified() || *s.ip() == addr_seen =>
            {
                (SocketAddr::new(IpAddr::V6(gw), s.port()), true)
            }
            other => (other, false),
        }
    }

    /// Applies [`Self::masquerade_v4`] and, when the gateway rule fires,
    /// records it on the owning tap port (`PortFlags::MASQUERADED`) and
    /// refreshes its activity.
    pub fn apply_masquerade_v4(
        &mut self,
        source: SocketAddr,
        gw: Ipv4Addr,
        addr_seen: Ipv4Addr,
        dns: &[Ipv4Addr],
        dns_fwd: Ipv4Addr,
        no_map_gw: bool,
    ) -> SocketAddr {
        let port = source.port();
        let (rewritten, matched_gw) = Self::masquerade_v4(source, gw, addr_seen, dns, dns_fwd, no_map_gw);
        if matched_gw {
            let now = Instant::now();
            let table = self.table_mut(IpVersion::V4);
            if let Some(entry) = table.tap[port as usize].as_mut() {
                entry.flags.insert(PortFlags::MASQUERADED);
                entry.last_active = now;
            }
            table.activity.mark(port);
        }
        rewritten
    }

    pub fn apply_masquerade_v6(
        &mut self,
        source: SocketAddr,
        gw: Ipv6Addr,
        addr_seen: Ipv6Addr,
        dns: &[Ipv6Addr],
        dns_fwd: Ipv6Addr,
        no_map_gw: bool,
    ) -> SocketAddr {
        let port = source.port();
        let (rewritten, matched_gw) = Self::masquerade_v6(source, gw, addr_seen, dns, dns_fwd, no_map_gw);
        if matched_gw {
            let now = Instant::now();
            let table = self.table_mut(IpVersion::V6);
            if let Some(entry) = table.tap[port as usize].as_mut() {
                entry.flags.insert(PortFlags::MASQUERADED);
                entry.last_active = now;
            }
            table.activity.mark(port);
        }
        rewritten
    }

    /// Drains up to [`passt_core::types::UDP_MAX_BATCH`] replies
    /// waiting on `port`'s tap-facing socket, rewrites each source
    /// address and cooks an Ethernet frame per datagram. Entirely
    /// non-blocking: never waits for a datagram that isn't there yet.
    fn forward_tap_batch_v4(&mut self, port: u16, cfg: &Config, out: &mut Vec<bytes::Bytes>) {
        let Some(socket) = self.tap_port(IpVersion::V4, port).map(|e| Rc::clone(&e.socket)) else {
            return;
        };
        let guest_addr = match self.tap_port(IpVersion::V4, port).map(|e| e.guest_addr) {
            Some(IpAddr::V4(a)) => a,
            _ => return,
        };

        let mut buf = [0u8; 65536];
        let mut sent = 0usize;
        for _ in 0..UDP_MAX_BATCH {
            let (n, from) = match socket.try_recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            let source = self.apply_masquerade_v4(
                from,
                cfg.ip4.gw,
                cfg.ip4.addr_seen,
                &cfg.ip4.dns,
                cfg.ip4.dns_fwd,
                cfg.ip4.no_map_gw,
            );
            let SocketAddr::V4(source_v4) = source else {
                continue;
            };
            let dst = SocketAddrV4::new(guest_addr, port);
            let frame = headers::cook_v4(cfg.mac.guest, cfg.mac.gw, source_v4, dst, &buf[..n]);
            out.push(bytes::Bytes::from(frame));
            sent += 1;
        }
        if sent > 0 {
            self.touch_tap_port(IpVersion::V4, port);
        }
    }

    fn forward_tap_batch_v6(&mut self, port: u16, cfg: &Config, out: &mut Vec<bytes::Bytes>) {
        let Some(socket) = self.tap_port(IpVersion::V6, port).map(|e| Rc::clone(&e.socket)) else {
            return;
        };
        let guest_addr = match self.tap_port(IpVersion::V6, port).map(|e| e.guest_addr) {
            Some(IpAddr::V6(a)) => a,
            _ => return,
        };

        let mut buf = [0u8; 65536];
        let mut sent = 0usize;
        for _ in 0..UDP_MAX_BATCH {
            let (n, from) = match socket.try_recv_from(&mut buf) {
                Ok(r) => r,
                Err(_) => break,
            };
            let source = self.apply_masquerade_v6(
                from,
                cfg.ip6.gw,
                cfg.ip6.addr_seen,
                &cfg.ip6.dns,
                cfg.ip6.dns_fwd,
                cfg.ip6.no_map_gw,
            );
            let SocketAddr::V6(source_v6) = source else {
                continue;
            };
            let dst = SocketAddrV6::new(guest_addr, port, 0, 0);
            let frame = headers::cook_v6(cfg.mac.guest, cfg.mac.gw, source_v6, dst, &buf[..n]);
            out.push(bytes::Bytes::from(frame));
            sent += 1;
        }
        if sent > 0 {
            self.touch_tap_port(IpVersion::V6, port);
        }
    }

    /// Drains every tap port the activity bitmap says has seen traffic
    /// recently, across both IP versions, returning the cooked frames
    /// ready for one batched send to the tap sink.
    pub fn drain_all_tap_ports(&mut self, cfg: &Config) -> Vec<bytes::Bytes> {
        let mut frames = Vec::new();
        for v in IpVersion::ALL {
            let words: Vec<usize> = self.table(v).activity.active_words().collect();
            for word in words {
                for bit in 0..64u16 {
                    let port = (word * 64) as u16 + bit;
                    if self.tap_port(v, port).is_none() {
                        continue;
                    }
                    match v {
                        IpVersion::V4 => self.forward_tap_batch_v4(port, cfg, &mut frames),
                        IpVersion::V6 => self.forward_tap_batch_v6(port, cfg, &mut frames),
                    }
                }
            }
        }
        frames
    }
}

/// Binds a fresh, non-blocking datagram socket on an ephemeral loopback
/// port, used as the dedicated socket for one PASTA loopback-splice
/// flow (both to send the forward datagram and, registered under a
/// second table key, to send replies back).
fn new_loopback_bound(v: IpVersion) -> std::io::Result<std::net::UdpSocket> {
    let loopback: IpAddr = match v {
        IpVersion::V4 => Ipv4Addr::LOCALHOST.into(),
        IpVersion::V6 => Ipv6Addr::LOCALHOST.into(),
    };
    let socket = std::net::UdpSocket::bind(SocketAddr::new(loopback, 0))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// DNS forward-only rewrite: when `dns_fwd` is set and the destination
/// port is 53, the destination address is rewritten to `dns[0]`
/// specifically — never any other configured resolver — an intentionally
/// asymmetric single-entry redirect.
pub fn redirect_dns_v4(dest: SocketAddr, dns: &[Ipv4Addr], dns_fwd: bool) -> SocketAddr {
    if !dns_fwd || dest.port() != 53 {
        return dest;
    }
    match dns.first() {
        Some(&resolver) => SocketAddr::new(IpAddr::V4(resolver), 53),
        None => dest,
    }
}

pub fn redirect_dns_v6(dest: SocketAddr, dns: &[Ipv6Addr], dns_fwd: bool) -> SocketAddr {
    if !dns_fwd || dest.port() != 53 {
        return dest;
    }
    match dns.first() {
        Some(&resolver) => SocketAddr::new(IpAddr::V6(resolver), 53),
        None => dest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn bind_and_lookup_tap_port() {
        let mut engine = UdpEngine::new();
        let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let guest = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15));
        engine.bind_tap_port(IpVersion::V4, 5000, socket, PortFlags::LOCAL, guest);
        assert!(engine.tap_port(IpVersion::V4, 5000).is_some());
        assert!(engine.tap_port(IpVersion::V4, 5001).is_none());
        assert!(engine.tap_port(IpVersion::V6, 5000).is_none());
        assert_eq!(engine.tap_port(IpVersion::V4, 5000).unwrap().guest_addr, guest);
    }

    #[test]
    fn masquerade_rewrites_loopback_unspecified_and_addr_seen_to_the_gateway() {
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        let addr_seen = Ipv4Addr::new(192, 168, 1, 2);
        let dns = [];

        for source_ip in [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED, addr_seen] {
            let source = SocketAddr::new(IpAddr::V4(source_ip), 4000);
            let (rewritten, matched) =
                UdpEngine::masquerade_v4(source, gw, addr_seen, &dns, Ipv4Addr::UNSPECIFIED, false);
            assert_eq!(rewritten, SocketAddr::new(IpAddr::V4(gw), 4000));
            assert!(matched);
        }

        let elsewhere = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 4000);
        let (rewritten, matched) =
            UdpEngine::masquerade_v4(elsewhere, gw, addr_seen, &dns, Ipv4Addr::UNSPECIFIED, false);
        assert_eq!(rewritten, elsewhere);
        assert!(!matched);
    }

    #[test]
    fn masquerade_dns_forward_rule_takes_priority_over_the_gateway_rule() {
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        let addr_seen = Ipv4Addr::new(192, 168, 1, 2);
        let dns = [Ipv4Addr::new(8, 8, 8, 8)];
        let dns_fwd = Ipv4Addr::new(10, 0, 2, 3);

        let from_resolver = SocketAddr::new(IpAddr::V4(dns[0]), 53);
        let (rewritten, matched) = UdpEngine::masquerade_v4(from_resolver, gw, addr_seen, &dns, dns_fwd, false);
        assert_eq!(rewritten, SocketAddr::new(IpAddr::V4(dns_fwd), 53));
        assert!(!matched, "the DNS-forward rule fired, not the gateway rule");
    }

    #[test]
    fn no_map_gw_disables_the_gateway_rewrite() {
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        let addr_seen = Ipv4Addr::new(192, 168, 1, 2);
        let from_loopback = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
        let (rewritten, matched) =
            UdpEngine::masquerade_v4(from_loopback, gw, addr_seen, &[], Ipv4Addr::UNSPECIFIED, true);
        assert_eq!(rewritten, from_loopback);
        assert!(!matched);
    }

    #[test]
    fn dns_redirect_only_touches_port_53_and_only_uses_the_first_resolver() {
        let dns = vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)];
        let query = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 53);
        let rewritten = redirect_dns_v4(query, &dns, true);
        assert_eq!(rewritten, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53));

        let non_dns = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 80);
        assert_eq!(redirect_dns_v4(non_dns, &dns, true), non_dns);
        assert_eq!(redirect_dns_v4(query, &dns, false), query);
    }

    #[test]
    fn activity_bitmap_tracks_touched_words_only() {
        let mut bitmap = ActivityBitmap::new();
        assert_eq!(bitmap.active_words().count(), 0);
        bitmap.mark(130); // word 2
        assert!(bitmap.is_marked(130));
        assert_eq!(bitmap.active_words().collect::<Vec<_>>(), vec![2]);
        bitmap.clear(130);
        assert_eq!(bitmap.active_words().count(), 0);
    }

    #[tokio::test]
    async fn age_out_retires_idle_tap_ports_but_not_fresh_ones() {
        let mut engine = UdpEngine::new();
        let socket = Rc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let guest = IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15));
        engine.bind_tap_port(IpVersion::V4, 7000, socket.clone(), PortFlags::LOCAL, guest);
        engine.bind_tap_port(IpVersion::V4, 7001, socket, PortFlags::LOCAL, guest);

        let now = Instant::now();
        // Backdate port 7000's activity past the idle timeout; leave 7001 fresh.
        engine.table_mut(IpVersion::V4).tap[7000]
            .as_mut()
            .unwrap()
            .last_active = now - Duration::from_secs(UDP_IDLE_TIMEOUT_SECS + 5);

        let retired = engine.age_out(now);
        assert_eq!(retired, 1);
        assert!(engine.tap_port(IpVersion::V4, 7000).is_none());
        assert!(engine.tap_port(IpVersion::V4, 7001).is_some());
    }

    #[tokio::test]
    async fn splice_forward_and_reverse_round_trip_over_loopback() {
        let mut engine = UdpEngine::new();
        let port_map = PortMap::default();

        // Stand in for the real application inside the target namespace.
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_port = target.local_addr().unwrap().port();

        // Stand in for the guest's own socket, whose port becomes `peer_port`.
        let guest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_port = guest.local_addr().unwrap().port();

        // try_send_to can transiently report WouldBlock even on an
        // otherwise-idle loopback socket; retry the handful of times a
        // real send loop would.
        for _ in 0..50 {
            engine
                .splice_forward(
                    IpVersion::V4,
                    SpliceDirection::ToInit,
                    peer_port,
                    target_port,
                    &port_map,
                    None,
                    b"hello",
                )
                .unwrap();
            if engine.splice_entry(IpVersion::V4, peer_port).is_some() {
                break;
            }
        }

        let mut buf = [0u8; 64];
        let (n, from) = target.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let own_port = from.port();

        // The reverse path looks the flow back up by the forward
        // socket's own port and must find the same socket again.
        let (back_sock, send_dst) = engine
            .splice_reverse_target(IpVersion::V4, SpliceDirection::BackToInit, own_port)
            .expect("forward registration must leave a reverse route behind");
        assert_eq!(send_dst, peer_port);
        drop(back_sock);

        engine
            .splice_reverse_send(IpVersion::V4, SpliceDirection::BackToInit, own_port, b"reply")
            .unwrap();

        let mut reply_buf = [0u8; 64];
        let (n, _) = guest.recv_from(&mut reply_buf).await.unwrap();
        assert_eq!(&reply_buf[..n], b"reply");
    }
}
