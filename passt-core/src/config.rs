//! Configuration loading and validation.
//!
//! Parses a TOML file into [`Config`], the typed structure holding every
//! input the connector needs before it can start forwarding traffic.
//! Port-delta / reverse-delta symmetry is validated eagerly at load time
//! so a bad config fails fast instead of silently corrupting replies at
//! runtime.

use crate::error::{Error, Result};
use crate::types::{Mode, PORTS};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Per-IP-version addressing the UDP/TCP engines rewrite against.
#[derive(Debug, Clone, Deserialize)]
pub struct Ip4Config {
    /// Virtual gateway address the guest sees as its default route.
    pub gw: Ipv4Addr,
    /// Outer-side address the guest will observe as its own ("seen").
    pub addr_seen: Ipv4Addr,
    /// Configured upstream DNS servers, in priority order.
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    /// Address DNS traffic from `dns[0]:53` is rewritten to on the way to
    /// the guest (0.0.0.0 disables the rewrite).
    #[serde(default)]
    pub dns_fwd: Ipv4Addr,
    /// Disable gateway-address masquerade rewrite for local traffic.
    #[serde(default)]
    pub no_map_gw: bool,
}

/// IPv6 analogue of [`Ip4Config`], with link-local addressing added.
#[derive(Debug, Clone, Deserialize)]
pub struct Ip6Config {
    pub gw: Ipv6Addr,
    pub addr: Ipv6Addr,
    pub addr_seen: Ipv6Addr,
    pub addr_ll: Ipv6Addr,
    pub addr_ll_seen: Ipv6Addr,
    #[serde(default)]
    pub dns: Vec<Ipv6Addr>,
    #[serde(default)]
    pub dns_fwd: Ipv6Addr,
    #[serde(default)]
    pub no_map_gw: bool,
}

/// Synthetic Ethernet addressing used to cook L2 headers for frames
/// forwarded to the guest. A real tap adapter learns the guest's MAC
/// from the frames it reads; this connector pins both ends to a fixed,
/// locally-administered pair instead, since MAC learning belongs to the
/// tap transport rather than the forwarding engines.
#[derive(Debug, Clone, Deserialize)]
pub struct MacConfig {
    pub guest: [u8; 6],
    pub gw: [u8; 6],
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            guest: [0x9a, 0x2b, 0x3c, 0x4d, 0x5e, 0x01],
            gw: [0x9a, 0x2b, 0x3c, 0x4d, 0x5e, 0x02],
        }
    }
}

/// Forward/reverse port remapping tables (GLOSSARY: "Port delta / rdelta").
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortMap {
    /// `delta[port] = d` means traffic to `port` is forwarded to `port + d`.
    #[serde(default)]
    pub delta: HashMap<u16, i32>,
    /// `rdelta[port] = d` undoes the corresponding forward mapping.
    #[serde(default)]
    pub rdelta: HashMap<u16, i32>,
}

impl PortMap {
    /// Property #7: for every forward delta `d` at port `p`,
    /// `rdelta[p+d] == PORTS - d` (mod `PORTS`), i.e. a reply to the
    /// translated port is untranslated back exactly.
    pub fn validate(&self) -> Result<()> {
        for (&port, &d) in &self.delta {
            let translated = (port as i64 + d as i64).rem_euclid(PORTS as i64) as u16;
            let expected = (-(d as i64)).rem_euclid(PORTS as i64);
            match self.rdelta.get(&translated) {
                Some(&rd) if (rd as i64).rem_euclid(PORTS as i64) == expected => {}
                Some(&rd) => {
                    return Err(Error::config(format!(
                        "port-remap asymmetry at port {port}: rdelta[{translated}] = {rd}, expected {expected} (mod {PORTS})"
                    )))
                }
                None => {
                    return Err(Error::config(format!(
                        "port-remap: missing rdelta entry for translated port {translated} (forward delta {d} at port {port})"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Applies the forward delta for `port`, if configured.
    pub fn forward(&self, port: u16) -> u16 {
        match self.delta.get(&port) {
            Some(&d) => (port as i64 + d as i64).rem_euclid(PORTS as i64) as u16,
            None => port,
        }
    }

    /// Applies the reverse delta for `port`, if configured.
    pub fn reverse(&self, port: u16) -> u16 {
        match self.rdelta.get(&port) {
            Some(&d) => (port as i64 + d as i64).rem_euclid(PORTS as i64) as u16,
            None => port,
        }
    }
}

/// Top-level connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub ip4: Ip4Config,
    pub ip6: Ip6Config,
    #[serde(default)]
    pub tcp_ports: PortMap,
    #[serde(default)]
    pub udp_ports: PortMap,
    #[serde(default)]
    pub mac: MacConfig,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses and validates a configuration document from memory, mainly
    /// for tests and for embedding default configs in the binary.
    pub fn parse(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        cfg.tcp_ports.validate()?;
        cfg.udp_ports.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        mode = "pasta"

        [ip4]
        gw = "169.254.1.1"
        addr_seen = "169.254.1.2"
        dns = ["169.254.1.1"]
        dns_fwd = "10.0.2.3"

        [ip6]
        gw = "fd00::1"
        addr = "fd00::2"
        addr_seen = "fd00::2"
        addr_ll = "fe80::1"
        addr_ll_seen = "fe80::2"
    "#;

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse(MINIMAL).expect("valid config");
        assert_eq!(cfg.mode, Mode::Pasta);
        assert_eq!(cfg.ip4.gw, Ipv4Addr::new(169, 254, 1, 1));
    }

    #[test]
    fn accepts_symmetric_port_map() {
        let mut map = PortMap::default();
        map.delta.insert(80, 8000); // 80 -> 8080
        map.rdelta.insert(8080, -8000); // 8080 -> 80
        map.validate().expect("symmetric map must validate");
    }

    #[test]
    fn rejects_asymmetric_port_map() {
        let mut map = PortMap::default();
        map.delta.insert(80, 8000); // 80 -> 8080
        map.rdelta.insert(8080, 1);
        assert!(map.validate().is_err());
    }

    #[test]
    fn forward_then_reverse_round_trips() {
        let mut map = PortMap::default();
        map.delta.insert(22, 2200); // 22 -> 2222
        map.rdelta.insert(2222, -2200);
        map.validate().expect("symmetric map must validate");
        let translated = map.forward(22);
        assert_eq!(translated, 2222);
        assert_eq!(map.reverse(translated), 22);
    }
}
