//! Event loop orchestration: one `tokio`
//! current-thread runtime, one `LocalSet`, accepting spliced TCP
//! connections and running periodic maintenance (pool refill, UDP port
//! aging, connection-table reaping).

use crate::context::Context;
use anyhow::{Context as _, Result};
use passt_net::sockpool::PoolSide;
use passt_net::tcp_splice::SpliceConn;
use passt_tap::framing::{TapSink, TapSource};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::LocalSet;

/// Accepts connections on `listen_addr`, splicing each accepted socket to
/// a freshly connected loopback peer at `dest_port`, and
/// runs maintenance ticks for as long as the `LocalSet` is alive.
///
/// Only the loopback splice path is wired up end-to-end here; a full
/// guest-tap-to-splice-table port demux across the whole ephemeral port
/// range is the natural next increment once a concrete tap source is
/// plugged in via `passt_tap::framing`.
pub async fn run_splice_listener(
    ctx: Rc<RefCell<Context>>,
    listen_addr: SocketAddr,
    dest_port: u16,
    v6: bool,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding splice listener on {listen_addr}"))?;
    tracing::info!(%listen_addr, dest_port, "listening for spliced TCP connections");

    loop {
        let (a, peer) = listener.accept().await.context("accept on splice listener")?;
        tracing::debug!(%peer, "accepted connection for splice");

        let ctx = ctx.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = accept_one(ctx, a, dest_port, v6).await {
                tracing::warn!(error = %e, %peer, "spliced connection failed");
            }
        });
    }
}

async fn accept_one(
    ctx: Rc<RefCell<Context>>,
    a: tokio::net::TcpStream,
    dest_port: u16,
    v6: bool,
) -> Result<()> {
    let (pipes, pipe_size, b_socket) = {
        let mut ctx = ctx.borrow_mut();
        let pipes = ctx.pipe_pool.take().context("taking pipe pair from pool")?;
        let pipe_size = ctx.pipe_pool.pipe_size();
        let socket = ctx
            .socket_pool
            .take(v6, PoolSide::Init)
            .map(Ok)
            .unwrap_or_else(|| if v6 { TcpSocket::new_v6() } else { TcpSocket::new_v4() })
            .context("obtaining outbound socket")?;
        (pipes, pipe_size, socket)
    };

    let dest: SocketAddr = if v6 {
        SocketAddr::new(std::net::Ipv6Addr::LOCALHOST.into(), dest_port)
    } else {
        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), dest_port)
    };
    let b = b_socket.connect(dest).await.context("connecting to loopback peer")?;

    let index = ctx.borrow_mut().conn_table.insert().context("connection table full")?;
    let conn = SpliceConn::new(a, b, pipes, pipe_size, v6);
    let result = conn.run().await;
    ctx.borrow_mut().conn_table.remove(index.get());
    result.context("spliced connection pump failed")
}

/// Periodic maintenance: tops pools back up, ages out idle UDP entries,
/// and reaps closed TCP connections under file-descriptor pressure.
pub async fn run_maintenance(ctx: Rc<RefCell<Context>>) -> Result<()> {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let mut ctx = ctx.borrow_mut();
        if let Err(e) = ctx.socket_pool.refill_init() {
            tracing::warn!(error = %e, "socket pool refill failed");
        }
        if let Err(e) = ctx.pipe_pool.refill() {
            tracing::warn!(error = %e, "pipe pool refill failed");
        }
        let retired = ctx.udp_engine.age_out(std::time::Instant::now());
        if retired > 0 {
            tracing::debug!(retired, "aged out idle UDP port entries");
        }
        if ctx
            .conn_table
            .should_reap(rlimit_nofile(), passt_core::types::TCP_SPLICE_MAX_CONNS)
        {
            let reaped = ctx.conn_table.reap_closing();
            if reaped > 0 {
                tracing::debug!(reaped, "reaped closing TCP splice connections");
            }
        }
    }
}

/// Drives guest-originated UDP datagrams to their host sockets and
/// drains replies back to the tap, one frame (or reply batch) at a
/// time. The tap handle and the rest of `Context` are borrowed
/// separately and never across each other's `.await` points: every
/// `UdpEngine` method here is non-blocking and synchronous, so the only
/// suspension point in this loop is the tap I/O itself. Idle when no
/// tap transport has been attached.
pub async fn run_udp_forwarding(ctx: Rc<RefCell<Context>>) -> Result<()> {
    let tap = match ctx.borrow().tap.clone() {
        Some(tap) => tap,
        None => return Ok(()),
    };
    loop {
        let frame = {
            let mut handle = tap.borrow_mut();
            handle.recv_frame().await.context("receiving a guest frame")?
        };

        {
            let mut ctx = ctx.borrow_mut();
            let cfg = ctx.config.clone();
            if let Err(e) = ctx.udp_engine.forward_guest_frame(&frame, &cfg) {
                tracing::warn!(error = %e, "dropping guest UDP datagram");
            }
        }

        let replies = {
            let mut ctx = ctx.borrow_mut();
            let cfg = ctx.config.clone();
            ctx.udp_engine.drain_all_tap_ports(&cfg)
        };
        if !replies.is_empty() {
            let mut handle = tap.borrow_mut();
            if let Err(e) = handle.send_batch(&replies).await {
                tracing::warn!(error = %e, "failed to send UDP reply batch to tap");
            }
        }
    }
}

fn rlimit_nofile() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, fully-initialized out-parameter.
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return 1024;
    }
    rlim.rlim_cur as usize
}

/// Runs the daemon's maintenance loop and splice listener side by side on
/// one `LocalSet`, so both stay on the same thread with no cross-task
/// synchronization.
pub async fn run(local: &LocalSet, ctx: Rc<RefCell<Context>>, listen_addr: SocketAddr, dest_port: u16, v6: bool) -> Result<()> {
    local
        .run_until(async move {
            let maintenance = tokio::task::spawn_local(run_maintenance(ctx.clone()));
            let udp_forwarding = tokio::task::spawn_local(run_udp_forwarding(ctx.clone()));
            let listener = tokio::task::spawn_local(run_splice_listener(ctx, listen_addr, dest_port, v6));
            tokio::select! {
                res = maintenance => res.context("maintenance task panicked")?.context("maintenance loop exited"),
                res = udp_forwarding => res.context("UDP forwarding task panicked")?.context("UDP forwarding loop exited"),
                res = listener => res.context("splice listener task panicked")?.context("splice listener exited"),
            }
        })
        .await
}
