//! `passt-rs`: unprivileged user-mode L2 network connector.

mod cli;
mod context;
mod event_loop;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use context::Context as DaemonContext;
use passt_core::config::Config;
use passt_core::types::Mode;
use passt_net::pipepool::probe_pipe_size;
use passt_tap::pcap::PcapWriter;
use std::net::SocketAddr;
use std::rc::Rc;
use tokio::task::LocalSet;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_filter()))
        .init();

    // One current-thread runtime, one LocalSet — no work-stealing,
    // no cross-thread Arc/Mutex.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the tokio current-thread runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    tracing::info!(mode = %Mode::from(cli.mode), "starting connector");

    let pipe_size = probe_pipe_size().context("probing usable pipe size")?;
    let pcap = match &cli.pcap {
        Some(path) => PcapWriter::open(path, 65535).await,
        None => PcapWriter::disabled(),
    };

    let daemon_ctx = Rc::new(std::cell::RefCell::new(DaemonContext::new(
        config, pipe_size, pcap,
    )));

    // Demonstration wiring for the loopback splice path;
    // full tap-driven port demux across the guest's ephemeral range is
    // layered on top of this same Context once a concrete tap source is
    // plugged in.
    let listen_addr: SocketAddr = "127.0.0.1:0".parse().expect("valid loopback address");
    let dest_port = 0u16;

    let local = LocalSet::new();
    event_loop::run(&local, daemon_ctx, listen_addr, dest_port, false).await
}
