//! Pre-opened TCP socket pool.
//!
//! Holds unconnected, non-blocking sockets ready for a new spliced
//! connection to `connect()` on, split by IP version and by which
//! namespace created them ("init" = the namespace the connector itself
//! runs in; "ns" = the guest's namespace, PASTA only). Pulling a socket
//! from the pool swaps it out for a hole the next timer tick refills.

use std::collections::VecDeque;
use tokio::net::TcpSocket;

/// Which side created (and thus which namespace owns) a pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSide {
    /// Created in the connector's own namespace (outbound connections).
    Init,
    /// Created inside the guest/PASTA namespace.
    Ns,
}

struct VersionPool {
    init: VecDeque<TcpSocket>,
    ns: VecDeque<TcpSocket>,
}

impl VersionPool {
    fn new() -> Self {
        Self {
            init: VecDeque::new(),
            ns: VecDeque::new(),
        }
    }

    fn side_mut(&mut self, side: PoolSide) -> &mut VecDeque<TcpSocket> {
        match side {
            PoolSide::Init => &mut self.init,
            PoolSide::Ns => &mut self.ns,
        }
    }
}

/// Socket pool for one connector instance, covering both IP versions and
/// both pool sides.
pub struct SocketPool {
    v4: VersionPool,
    v6: VersionPool,
    /// Target occupancy per (version, side) queue.
    target_size: usize,
}

impl SocketPool {
    pub fn new(target_size: usize) -> Self {
        Self {
            v4: VersionPool::new(),
            v6: VersionPool::new(),
            target_size,
        }
    }

    fn pool_mut(&mut self, v6: bool) -> &mut VersionPool {
        if v6 {
            &mut self.v6
        } else {
            &mut self.v4
        }
    }

    /// Takes a pooled socket if one is available, leaving a hole for the
    /// next refill to fill. Callers fall back to creating a fresh socket
    /// when the pool is empty.
    pub fn take(&mut self, v6: bool, side: PoolSide) -> Option<TcpSocket> {
        self.pool_mut(v6).side_mut(side).pop_front()
    }

    /// Number of sockets currently queued for `(v6, side)`.
    pub fn len(&self, v6: bool, side: PoolSide) -> usize {
        self.pool_mut(v6).side_mut(side).len()
    }

    pub fn is_empty(&self, v6: bool, side: PoolSide) -> bool {
        self.len(v6, side) == 0
    }

    /// Tops up the `Init`-side pools (created in the connector's own
    /// namespace — always safe to call directly) up to `target_size`.
    pub fn refill_init(&mut self) -> std::io::Result<()> {
        Self::refill_queue(&mut self.v4.init, false, self.target_size)?;
        Self::refill_queue(&mut self.v6.init, true, self.target_size)?;
        Ok(())
    }

    /// Tops up the `Ns`-side pools. The caller is responsible for having
    /// already entered the target namespace (see `nsenter::enter_and`);
    /// sockets are plain `socket()` calls and inherit whatever namespace
    /// the calling thread is in when created.
    pub fn refill_ns(&mut self) -> std::io::Result<()> {
        Self::refill_queue(&mut self.v4.ns, false, self.target_size)?;
        Self::refill_queue(&mut self.v6.ns, true, self.target_size)?;
        Ok(())
    }

    fn refill_queue(
        queue: &mut VecDeque<TcpSocket>,
        v6: bool,
        target: usize,
    ) -> std::io::Result<()> {
        while queue.len() < target {
            let sock = if v6 {
                TcpSocket::new_v6()?
            } else {
                TcpSocket::new_v4()?
            };
            queue.push_back(sock);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_init_reaches_target_and_take_drains_it() {
        let mut pool = SocketPool::new(4);
        pool.refill_init().expect("refill must succeed");
        assert_eq!(pool.len(false, PoolSide::Init), 4);
        assert_eq!(pool.len(true, PoolSide::Init), 4);

        assert!(pool.take(false, PoolSide::Init).is_some());
        assert_eq!(pool.len(false, PoolSide::Init), 3);

        pool.refill_init().expect("refill must top back up");
        assert_eq!(pool.len(false, PoolSide::Init), 4);
    }

    #[test]
    fn ns_side_is_independent_of_init_side() {
        let mut pool = SocketPool::new(2);
        pool.refill_init().unwrap();
        assert!(pool.is_empty(false, PoolSide::Ns));
        pool.refill_ns().unwrap();
        assert_eq!(pool.len(false, PoolSide::Ns), 2);
    }
}
