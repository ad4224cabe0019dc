//! Pipe probing and pool.
//!
//! Each spliced connection owns two pipe *pairs* (`pipe_a_b`, `pipe_b_a`);
//! this module probes the largest `F_SETPIPE_SZ` the kernel will grant,
//! starting at [`passt_core::types::MAX_PIPE_SIZE`] and halving on
//! failure, then keeps a pool of pre-opened, pre-sized pairs so accepting
//! a new connection never has to pay for `pipe2()`/`fcntl()` on the hot
//! path.

use crate::error::{Error, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use passt_core::types::{MAX_PIPE_SIZE, MIN_PIPE_SIZE};
use std::collections::VecDeque;
use std::os::fd::OwnedFd;

/// One kernel pipe, read and write ends, sized to the probed maximum.
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    fn open(size: usize) -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        fcntl(&read, FcntlArg::F_SETPIPE_SZ(size as i32))?;
        Ok(Self { read, write })
    }
}

/// The two pipes a spliced connection needs: `a_to_b` carries bytes read
/// from socket `a` toward socket `b`, `b_to_a` the opposite direction.
pub struct PipePair {
    pub a_to_b: Pipe,
    pub b_to_a: Pipe,
}

/// Probes the largest pipe buffer size the kernel will grant via
/// `F_SETPIPE_SZ`, starting at `MAX_PIPE_SIZE` and halving on failure,
/// down to a one-page floor (see DESIGN.md).
pub fn probe_pipe_size() -> Result<usize> {
    let mut size = MAX_PIPE_SIZE;
    loop {
        match Pipe::open(size) {
            Ok(_pipe) => return Ok(size),
            Err(_) if size > MIN_PIPE_SIZE => size /= 2,
            Err(_) => return Err(Error::PipeProbeExhausted),
        }
    }
}

/// A pool of pre-opened, pre-sized pipe pairs, pulled by new spliced
/// connections and refilled lazily on timer ticks.
pub struct PipePool {
    pipe_size: usize,
    target: usize,
    pairs: VecDeque<PipePair>,
}

impl PipePool {
    pub fn new(pipe_size: usize, target: usize) -> Self {
        Self {
            pipe_size,
            target,
            pairs: VecDeque::new(),
        }
    }

    pub fn pipe_size(&self) -> usize {
        self.pipe_size
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Takes a pair out of the pool, or opens one fresh if the pool is
    /// empty (a cold miss; the next `refill` tops the pool back up).
    pub fn take(&mut self) -> Result<PipePair> {
        if let Some(pair) = self.pairs.pop_front() {
            return Ok(pair);
        }
        Self::open_pair(self.pipe_size)
    }

    /// Tops the pool back up to its target occupancy.
    pub fn refill(&mut self) -> Result<()> {
        while self.pairs.len() < self.target {
            self.pairs.push_back(Self::open_pair(self.pipe_size)?);
        }
        Ok(())
    }

    fn open_pair(pipe_size: usize) -> Result<PipePair> {
        Ok(PipePair {
            a_to_b: Pipe::open(pipe_size)?,
            b_to_a: Pipe::open(pipe_size)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probing_finds_a_usable_size() {
        let size = probe_pipe_size().expect("pipe probing must find a usable size");
        assert!(size >= MIN_PIPE_SIZE);
        assert!(size <= MAX_PIPE_SIZE);
    }

    #[test]
    fn pool_refills_to_target_and_take_consumes_one() {
        let size = probe_pipe_size().expect("probe");
        let mut pool = PipePool::new(size, 3);
        pool.refill().expect("refill");
        assert_eq!(pool.len(), 3);
        let _pair = pool.take().expect("take");
        assert_eq!(pool.len(), 2);
        pool.refill().expect("refill back up");
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn take_on_empty_pool_opens_a_fresh_pair() {
        let size = probe_pipe_size().expect("probe");
        let mut pool = PipePool::new(size, 0);
        let pair = pool.take().expect("cold-miss open");
        drop(pair); // both fds close cleanly without panicking
        assert_eq!(pool.len(), 0);
    }
}
