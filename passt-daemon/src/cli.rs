//! Command-line surface, built with `clap`'s derive macros.

use clap::{Parser, ValueEnum};
use passt_core::types::Mode;
use std::path::PathBuf;

/// `clap`-compatible mirror of [`passt_core::types::Mode`]; `passt-core`
/// itself stays free of a `clap` dependency since it's also used by
/// non-CLI consumers (tests, future embedders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliMode {
    Passt,
    Pasta,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Passt => Mode::Passt,
            CliMode::Pasta => Mode::Pasta,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "passt-rs", about = "Unprivileged user-mode L2 network connector")]
pub struct Cli {
    /// Operating mode: byte-stream guest socket, or tuntap-in-namespace.
    #[arg(long, value_enum)]
    pub mode: CliMode,

    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: PathBuf,

    /// PASST mode: path to the UNIX-domain socket the guest connects to.
    #[arg(long, required_if_eq("mode", "passt"))]
    pub tap_socket: Option<PathBuf>,

    /// PASTA mode: name of the tuntap device to create inside the target
    /// network namespace.
    #[arg(long, required_if_eq("mode", "pasta"))]
    pub tap_device: Option<String>,

    /// PASTA mode: PID whose network namespace the tap device is created
    /// in (defaults to the connector's own namespace if omitted).
    #[arg(long)]
    pub netns_pid: Option<u32>,

    /// Optional packet capture output path.
    #[arg(long)]
    pub pcap: Option<PathBuf>,

    /// Increase logging verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all but warning/error logging.
    #[arg(short, long)]
    pub quiet: bool,
}

impl Cli {
    /// Resolves the effective `tracing` filter directive from `-v`/`-q`
    /// and `RUST_LOG`, with `RUST_LOG` always taking precedence.
    pub fn log_filter(&self) -> String {
        if let Ok(from_env) = std::env::var("RUST_LOG") {
            return from_env;
        }
        if self.quiet {
            return "warn".into();
        }
        match self.verbose {
            0 => "info".into(),
            1 => "debug".into(),
            _ => "trace".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passt_mode_requires_tap_socket() {
        let result = Cli::try_parse_from([
            "passt-rs",
            "--mode",
            "passt",
            "--config",
            "c.toml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn pasta_mode_requires_tap_device() {
        let result = Cli::try_parse_from([
            "passt-rs",
            "--mode",
            "pasta",
            "--config",
            "c.toml",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn valid_passt_invocation_parses() {
        let cli = Cli::try_parse_from([
            "passt-rs",
            "--mode",
            "passt",
            "--config",
            "c.toml",
            "--tap-socket",
            "/tmp/passt.sock",
        ])
        .unwrap();
        assert_eq!(cli.tap_socket.unwrap(), PathBuf::from("/tmp/passt.sock"));
    }

    #[test]
    fn verbosity_count_selects_filter() {
        let quiet = Cli::try_parse_from(["passt-rs", "--mode", "passt", "--config", "c.toml", "--tap-socket", "s", "-q"]).unwrap();
        assert_eq!(quiet.log_filter(), "warn");

        let verbose = Cli::try_parse_from(["passt-rs", "--mode", "passt", "--config", "c.toml", "--tap-socket", "s", "-vv"]).unwrap();
        assert_eq!(verbose.log_filter(), "trace");
    }
}
