use serde::Deserialize;
use std::fmt;

/// Total number of transport-layer ports; every port-indexed table in
/// `passt-net` is sized to this constant.
pub const PORTS: usize = 1 << 16;

/// Connection table capacity for the TCP splice engine.
pub const TCP_SPLICE_MAX_CONNS: usize = 131_072;

/// Idle aging timeout applied to every UDP port entry.
pub const UDP_IDLE_TIMEOUT_SECS: u64 = 180;

/// Maximum pipe buffer size probed at startup, halved on `F_SETPIPE_SZ`
/// failure down to [`MIN_PIPE_SIZE`].
pub const MAX_PIPE_SIZE: usize = 8 * 1024 * 1024;

/// Floor below which pipe-size probing gives up (one page).
pub const MIN_PIPE_SIZE: usize = 4096;

/// Maximum datagrams folded into one tap-direction batch.
pub const UDP_MAX_BATCH: usize = 32;

/// Operating mode selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Guest peer is a length-prefixed byte-stream socket.
    Passt,
    /// Guest peer is a tuntap device inside a network namespace.
    Pasta,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Passt => "passt",
            Mode::Pasta => "pasta",
        })
    }
}

/// IP version discriminant used throughout the port-indexed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];
}

/// Transport-layer protocol carried by a tap frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Protocol {
    Tcp,
    Udp,
    Icmp,
}
