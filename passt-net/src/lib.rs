//! TCP splice engine and UDP forwarding engine:
//! the core of the connector, independent of how the guest-facing tap
//! endpoint or the process's outer CLI/config loading are wired up.

pub mod checksum;
pub mod epoll_ref;
pub mod error;
pub mod headers;
pub mod nsenter;
pub mod pipepool;
pub mod sockpool;
pub mod tcp_splice;
pub mod udp;

pub use error::{Error, Result};
