//! Single-owner execution context: every table and pool
//! lives here, owned by the one task driving the event loop, with no
//! `Arc`/`Mutex`/atomics — `Rc<RefCell<_>>` where a spawned-but-local task
//! needs shared access without paying for atomics it will never contend on.

use passt_core::config::Config;
use passt_net::pipepool::PipePool;
use passt_net::sockpool::SocketPool;
use passt_net::tcp_splice::ConnTable;
use passt_net::udp::UdpEngine;
use passt_tap::framing::TapHandle;
use passt_tap::icmp::IcmpProxy;
use passt_tap::pcap::PcapWriter;
use std::cell::RefCell;
use std::rc::Rc;

/// Everything the event loop needs, built once at startup from [`Config`]
/// plus the CLI's tap/pcap selections.
pub struct Context {
    pub config: Config,
    pub conn_table: ConnTable,
    pub socket_pool: SocketPool,
    pub pipe_pool: PipePool,
    pub udp_engine: UdpEngine,
    pub icmp_proxy: IcmpProxy,
    pub pcap: PcapWriter,
    /// The guest-facing tap transport, once one has been attached.
    /// `None` leaves UDP forwarding idle, e.g. before the tap/pasta
    /// device is opened or in configurations that never need it.
    pub tap: Option<Rc<RefCell<TapHandle>>>,
}

impl Context {
    pub fn new(config: Config, pipe_size: usize, pcap: PcapWriter) -> Self {
        use passt_core::types::TCP_SPLICE_MAX_CONNS;

        Self {
            config,
            conn_table: ConnTable::new(TCP_SPLICE_MAX_CONNS),
            socket_pool: SocketPool::new(16),
            pipe_pool: PipePool::new(pipe_size, 16),
            udp_engine: UdpEngine::new(),
            icmp_proxy: IcmpProxy::new(),
            pcap,
            tap: None,
        }
    }
}
