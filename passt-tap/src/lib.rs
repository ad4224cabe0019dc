//! Guest-facing tap transports, ICMP echo proxy, and packet capture.

pub mod error;
pub mod framing;
pub mod icmp;
pub mod pcap;

pub use error::{Error, Result};
