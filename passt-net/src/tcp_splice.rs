//! TCP splice engine: accepts a local TCP connection,
//! connects a loopback peer, and shuttles bytes between the two sockets
//! through a pair of kernel pipes until both sides have half-closed.
//!
//! The table-compaction and pressure-reaper mechanics are kept as literal,
//! independently testable bookkeeping (`ConnTable`) even though the byte
//! pump itself runs as one `tokio` task per connection rather than behind
//! an epoll registration (see DESIGN.md).

use crate::error::Result;
use crate::pipepool::{Pipe, PipePair};
use bitflags::bitflags;
use std::cell::Cell;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use tokio::io::Interest;
use tokio::net::TcpStream;

bitflags! {
    /// Additive event bitset: events accumulate and are only
    /// ever cleared explicitly (`A_OUT_WAIT`, `B_OUT_WAIT`,
    /// `RCVLOWAT_ACT_*`); a connection never transitions
    /// `ESTABLISHED -> CONNECT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnEvents: u16 {
        const CONNECT      = 0b0000_0001;
        const ESTABLISHED  = 0b0000_0010;
        const A_OUT_WAIT   = 0b0000_0100;
        const B_OUT_WAIT   = 0b0000_1000;
        const A_FIN_RCVD   = 0b0001_0000;
        const B_FIN_RCVD   = 0b0010_0000;
        const A_FIN_SENT   = 0b0100_0000;
        const B_FIN_SENT   = 0b1000_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        const SOCK_V6           = 0b0000_0001;
        const IN_EPOLL          = 0b0000_0010;
        const RCVLOWAT_SET_A    = 0b0000_0100;
        const RCVLOWAT_ACT_A    = 0b0000_1000;
        const RCVLOWAT_SET_B    = 0b0001_0000;
        const RCVLOWAT_ACT_B    = 0b0010_0000;
        const CLOSING           = 0b0100_0000;
    }
}

const SPLICE_FLAGS: std::os::raw::c_uint = (libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK) as _;

/// Raw, non-blocking `splice(2)` between two file descriptors.
///
/// # Safety
/// `from` and `to` must be valid, open file descriptors for the duration
/// of the call; at least one must be a pipe end, per `splice(2)`'s
/// contract. The caller is responsible for only calling this from within
/// a readiness callback (`try_io`) so `SPLICE_F_NONBLOCK` behavior is
/// meaningful.
unsafe fn raw_splice(
    from: std::os::unix::io::RawFd,
    to: std::os::unix::io::RawFd,
    len: usize,
    more: bool,
) -> std::io::Result<usize> {
    let flags = if more {
        SPLICE_FLAGS | libc::SPLICE_F_MORE as std::os::raw::c_uint
    } else {
        SPLICE_FLAGS
    };
    let ret = libc::splice(
        from,
        std::ptr::null_mut(),
        to,
        std::ptr::null_mut(),
        len,
        flags,
    );
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Outcome of one pump attempt in a single direction.
#[derive(Debug, Default)]
pub struct PumpOutcome {
    /// Any bytes moved in either leg of the pump this call.
    pub progressed: bool,
    /// The source socket reported EOF (`splice` returned 0).
    pub source_eof: bool,
    /// The destination write blocked (`EAGAIN`); caller should set
    /// `*_OUT_WAIT` and wait for writability before trying again.
    pub dest_would_block: bool,
    /// The burst size as a fraction of `pipe_size`, used for the fast-path
    /// decision and the `SO_RCVLOWAT` hysteresis below.
    pub burst_fraction_pct: u32,
}

/// The `from -> pipe` half of a pump attempt. Retries `EINTR`
/// internally; returns once a fresh burst has landed, EOF has been
/// observed, or there is simply nothing new to read yet.
async fn pump_read(
    from: &TcpStream,
    pipe: &Pipe,
    pipe_size: usize,
    read_ctr: &mut u64,
) -> std::io::Result<PumpOutcome> {
    let mut outcome = PumpOutcome::default();
    loop {
        from.readable().await?;
        let res = from.try_io(Interest::READABLE, || unsafe {
            raw_splice(from.as_raw_fd(), pipe.write.as_raw_fd(), pipe_size, false)
        });
        match res {
            Ok(0) => {
                outcome.source_eof = true;
                break;
            }
            Ok(n) => {
                *read_ctr += n as u64;
                outcome.progressed = true;
                outcome.burst_fraction_pct = ((n as u64) * 100 / pipe_size as u64) as u32;
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // No fresh bytes; still attempt to drain what's buffered.
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(outcome)
}

/// The `pipe -> to` half of a pump attempt: flushes whatever is already
/// sitting in the pipe (`read_ctr - *write_ctr` bytes) toward `to`,
/// waiting on `to`'s own writability rather than on anything about the
/// source. This is the half that must be retried on its own once a
/// previous attempt hit `EAGAIN` on `to` — re-entering via
/// [`pump_read`] first would block on the source becoming readable
/// again before ever retrying the write that is actually stuck.
async fn pump_flush(
    to: &TcpStream,
    pipe: &Pipe,
    pipe_size: usize,
    read_ctr: u64,
    write_ctr: &mut u64,
) -> std::io::Result<PumpOutcome> {
    let mut outcome = PumpOutcome::default();
    let pending = read_ctr.saturating_sub(*write_ctr);
    if pending > 0 {
        let more = pending > (pipe_size as u64) / 2;
        loop {
            to.writable().await?;
            let res = to.try_io(Interest::WRITABLE, || unsafe {
                raw_splice(pipe.read.as_raw_fd(), to.as_raw_fd(), pending as usize, more)
            });
            match res {
                Ok(n) => {
                    *write_ctr += n as u64;
                    outcome.progressed |= n > 0;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    outcome.dest_would_block = true;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(outcome)
}

/// One full pump attempt `from -> pipe -> to`: reads whatever is fresh
/// on `from`, then flushes everything buffered in the pipe out to `to`.
/// Used while the destination isn't currently known to be blocked; once
/// it is, callers should drive [`pump_flush`] alone instead (see
/// [`SpliceConn::run`]).
pub async fn pump_once(
    from: &TcpStream,
    to: &TcpStream,
    pipe: &Pipe,
    pipe_size: usize,
    read_ctr: &mut u64,
    write_ctr: &mut u64,
) -> std::io::Result<PumpOutcome> {
    let read_outcome = pump_read(from, pipe, pipe_size, read_ctr).await?;
    let flush_outcome = pump_flush(to, pipe, pipe_size, *read_ctr, write_ctr).await?;
    Ok(PumpOutcome {
        progressed: read_outcome.progressed || flush_outcome.progressed,
        source_eof: read_outcome.source_eof,
        dest_would_block: flush_outcome.dest_would_block,
        burst_fraction_pct: read_outcome.burst_fraction_pct,
    })
}

/// Direction discriminant for a spliced connection's two byte pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes flowing from socket `a` into socket `b`.
    AtoB,
    /// Bytes flowing from socket `b` into socket `a`.
    BtoA,
}

/// A single spliced TCP connection.
pub struct SpliceConn {
    pub a: TcpStream,
    pub b: TcpStream,
    pub pipes: PipePair,
    pub events: ConnEvents,
    pub flags: ConnFlags,
    pub a_read: u64,
    pub a_written: u64,
    pub b_read: u64,
    pub b_written: u64,
    pub pipe_size: usize,
}

impl SpliceConn {
    pub fn new(a: TcpStream, b: TcpStream, pipes: PipePair, pipe_size: usize, v6: bool) -> Self {
        let mut flags = ConnFlags::IN_EPOLL;
        if v6 {
            flags |= ConnFlags::SOCK_V6;
        }
        Self {
            a,
            b,
            pipes,
            events: ConnEvents::ESTABLISHED,
            flags,
            a_read: 0,
            a_written: 0,
            b_read: 0,
            b_written: 0,
            pipe_size,
        }
    }

    fn ab_done(&self) -> bool {
        self.events.contains(ConnEvents::B_FIN_SENT)
    }

    fn ba_done(&self) -> bool {
        self.events.contains(ConnEvents::A_FIN_SENT)
    }

    /// Applies one pump's outcome to the connection's event bitset,
    /// including half-close propagation:
    /// once the source side has seen EOF *and* its pipe has fully drained
    /// (`read == written`), shut the destination's write side down.
    async fn apply_outcome(&mut self, dir: Direction, outcome: PumpOutcome) -> Result<()> {
        let (out_wait_evt, fin_rcvd_evt, fin_sent_evt, read_ctr, written_ctr, dest) = match dir {
            Direction::AtoB => (
                ConnEvents::A_OUT_WAIT,
                ConnEvents::A_FIN_RCVD,
                ConnEvents::B_FIN_SENT,
                self.a_read,
                self.a_written,
                &self.b,
            ),
            Direction::BtoA => (
                ConnEvents::B_OUT_WAIT,
                ConnEvents::B_FIN_RCVD,
                ConnEvents::A_FIN_SENT,
                self.b_read,
                self.b_written,
                &self.a,
            ),
        };

        if outcome.dest_would_block {
            self.events.insert(out_wait_evt);
        } else {
            self.events.remove(out_wait_evt);
        }

        if outcome.source_eof {
            self.events.insert(fin_rcvd_evt);
            if read_ctr == written_ctr && !self.events.contains(fin_sent_evt) {
                dest.shutdown().await.ok();
                self.events.insert(fin_sent_evt);
            }
        }

        self.apply_rcvlowat_hysteresis(dir, &outcome);
        Ok(())
    }

    /// A burst strictly between 10% and 100% of the pipe raises
    /// `SO_RCVLOWAT` on the source socket to coarsen future readiness
    /// notifications under sustained load.
    fn apply_rcvlowat_hysteresis(&mut self, dir: Direction, outcome: &PumpOutcome) {
        if !outcome.progressed || outcome.burst_fraction_pct == 0 {
            return;
        }
        if outcome.burst_fraction_pct > 10 && outcome.burst_fraction_pct <= 100 {
            let (source, set_flag, act_flag) = match dir {
                Direction::AtoB => (&self.a, ConnFlags::RCVLOWAT_SET_A, ConnFlags::RCVLOWAT_ACT_A),
                Direction::BtoA => (&self.b, ConnFlags::RCVLOWAT_SET_B, ConnFlags::RCVLOWAT_ACT_B),
            };
            let lowat = (self.pipe_size / 4) as libc::c_int;
            let _ = source.try_io(Interest::READABLE, || {
                set_rcvlowat(source.as_raw_fd(), lowat)
            });
            self.flags.insert(set_flag);
            self.flags.insert(act_flag);
        }
    }

    /// Called once per timer tick: clears the `ACT` bit,
    /// and if a previous tick's `SET` survived without fresh `ACT`
    /// activity, restores `SO_RCVLOWAT` to 1.
    pub fn tick_rcvlowat(&mut self) {
        for (set_flag, act_flag, source_is_a) in [
            (ConnFlags::RCVLOWAT_SET_A, ConnFlags::RCVLOWAT_ACT_A, true),
            (ConnFlags::RCVLOWAT_SET_B, ConnFlags::RCVLOWAT_ACT_B, false),
        ] {
            if self.flags.contains(set_flag) {
                if self.flags.contains(act_flag) {
                    self.flags.remove(act_flag);
                } else {
                    let source = if source_is_a { &self.a } else { &self.b };
                    let _ = source.try_io(Interest::READABLE, || set_rcvlowat(source.as_raw_fd(), 1));
                    self.flags.remove(set_flag);
                }
            }
        }
    }

    fn fully_closed(&self) -> bool {
        self.events.contains(ConnEvents::A_FIN_SENT) && self.events.contains(ConnEvents::B_FIN_SENT)
    }

    /// Drives the connection to completion: pumps both directions until
    /// both halves have closed or a fatal I/O error occurs, then marks
    /// `CLOSING`. Dropping the returned `SpliceConn` closes both sockets
    /// and both pipes.
    pub async fn run(mut self) -> Result<()> {
        // Ticks the SO_RCVLOWAT hysteresis state machine independently of
        // pump activity; hysteresis decay needs a clock, not just
        // readiness events.
        let mut hysteresis_tick = tokio::time::interval(std::time::Duration::from_millis(100));
        hysteresis_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.fully_closed() {
                self.flags.insert(ConnFlags::CLOSING);
                break;
            }
            let ab_done = self.ab_done();
            let ba_done = self.ba_done();
            if ab_done && ba_done {
                self.flags.insert(ConnFlags::CLOSING);
                break;
            }

            // Once a direction's destination has blocked, only its
            // pending-flush half is retried, driven off the
            // destination's own writability; re-entering through
            // `pump_once` would wait on the source becoming readable
            // again first, starving the write that is actually stuck.
            let ab_out_wait = self.events.contains(ConnEvents::A_OUT_WAIT);
            let ba_out_wait = self.events.contains(ConnEvents::B_OUT_WAIT);

            tokio::select! {
                res = pump_once(&self.a, &self.b, &self.pipes.a_to_b, self.pipe_size, &mut self.a_read, &mut self.a_written), if !ab_done && !ab_out_wait => {
                    let outcome = res?;
                    self.apply_outcome(Direction::AtoB, outcome).await?;
                }
                res = pump_flush(&self.b, &self.pipes.a_to_b, self.pipe_size, self.a_read, &mut self.a_written), if !ab_done && ab_out_wait => {
                    let outcome = res?;
                    self.apply_outcome(Direction::AtoB, outcome).await?;
                }
                res = pump_once(&self.b, &self.a, &self.pipes.b_to_a, self.pipe_size, &mut self.b_read, &mut self.b_written), if !ba_done && !ba_out_wait => {
                    let outcome = res?;
                    self.apply_outcome(Direction::BtoA, outcome).await?;
                }
                res = pump_flush(&self.a, &self.pipes.b_to_a, self.pipe_size, self.b_read, &mut self.b_written), if !ba_done && ba_out_wait => {
                    let outcome = res?;
                    self.apply_outcome(Direction::BtoA, outcome).await?;
                }
                _ = hysteresis_tick.tick() => {
                    self.tick_rcvlowat();
                }
            }
        }
        Ok(())
    }
}

fn set_rcvlowat(fd: std::os::unix::io::RawFd, value: libc::c_int) -> std::io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVLOWAT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Re-applies `TCP_QUICKACK`, which Linux clears after one ACK cycle, so
/// it has to be set again on every splice that needs low-latency ACKs.
pub fn rearm_quickack(fd: std::os::unix::io::RawFd) -> std::io::Result<()> {
    let value: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Bookkeeping handle for one table slot, shared with the task driving the
/// connection so it always knows its own current index even after other
/// entries are compacted out from under it.
pub struct ConnHandle {
    pub index: Rc<Cell<usize>>,
    pub closing: bool,
}

/// Dense, index-packed connection table: occupied slots always fill
/// `[0, len)` with no holes. Destruction moves the tail entry into the
/// freed slot and updates that entry's shared index cell, which stands
/// in for "re-arming epoll with the new index" now that registration
/// lives inside each `TcpStream`.
#[derive(Default)]
pub struct ConnTable {
    entries: Vec<ConnHandle>,
    capacity: usize,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Inserts a new entry, returning the shared index cell the owning
    /// task should consult whenever it needs to know "my current table
    /// index" (e.g. to report completion back for removal).
    pub fn insert(&mut self) -> Result<Rc<Cell<usize>>> {
        if self.is_full() {
            return Err(crate::error::Error::TableFull(self.capacity));
        }
        let index = self.entries.len();
        let cell = Rc::new(Cell::new(index));
        self.entries.push(ConnHandle {
            index: cell.clone(),
            closing: false,
        });
        Ok(cell)
    }

    pub fn mark_closing(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.closing = true;
        }
    }

    pub fn is_closing(&self, index: usize) -> bool {
        self.entries.get(index).map(|e| e.closing).unwrap_or(false)
    }

    /// Removes `index` by swapping the last entry into its place and
    /// truncating, re-pointing the moved entry's shared index cell at its
    /// new slot — a single, infallible bookkeeping step (see DESIGN.md).
    pub fn remove(&mut self, index: usize) {
        let last = self.entries.len() - 1;
        if index != last {
            self.entries.swap(index, last);
            self.entries[index].index.set(index);
        }
        self.entries.pop();
    }

    /// Runs the file-pressure reaper: removes every
    /// entry already marked `CLOSING`. Driven on demand rather than on a
    /// fixed timer, triggered by `should_reap`.
    pub fn reap_closing(&mut self) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].closing {
                self.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// The reaper runs once the connection count crosses
    /// `min(nofile * 30% / 6, tcp_conn_count * 30%)`.
    pub fn should_reap(&self, nofile: usize, tcp_conn_count: usize) -> bool {
        let threshold = std::cmp::min((nofile * 30 / 100) / 6, tcp_conn_count * 30 / 100);
        self.entries.len() >= threshold
    }
}

#[cfg(test)]
mod table_tests {
    use super::*;

    #[test]
    fn insert_assigns_dense_indices() {
        let mut table = ConnTable::new(4);
        let c0 = table.insert().unwrap();
        let c1 = table.insert().unwrap();
        let c2 = table.insert().unwrap();
        assert_eq!(c0.get(), 0);
        assert_eq!(c1.get(), 1);
        assert_eq!(c2.get(), 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn insert_beyond_capacity_fails() {
        let mut table = ConnTable::new(1);
        table.insert().unwrap();
        assert!(table.insert().is_err());
    }

    #[test]
    fn remove_compacts_by_moving_last_into_hole() {
        let mut table = ConnTable::new(4);
        let c0 = table.insert().unwrap();
        let c1 = table.insert().unwrap();
        let c2 = table.insert().unwrap();
        assert_eq!((c0.get(), c1.get(), c2.get()), (0, 1, 2));

        table.remove(0); // removes c0; c2 (tail) moves into slot 0
        assert_eq!(table.len(), 2);
        assert_eq!(c2.get(), 0, "moved entry must see its new index");
        assert_eq!(c1.get(), 1, "untouched entry keeps its index");
    }

    #[test]
    fn removing_the_tail_needs_no_move() {
        let mut table = ConnTable::new(4);
        let c0 = table.insert().unwrap();
        let c1 = table.insert().unwrap();
        table.remove(1);
        assert_eq!(table.len(), 1);
        assert_eq!(c0.get(), 0);
    }

    #[test]
    fn reap_closing_removes_every_marked_entry_and_keeps_the_rest_dense() {
        let mut table = ConnTable::new(8);
        let handles: Vec<_> = (0..5).map(|_| table.insert().unwrap()).collect();
        table.mark_closing(1);
        table.mark_closing(3);

        let removed = table.reap_closing();
        assert_eq!(removed, 2);
        assert_eq!(table.len(), 3);

        // All surviving handles' indices must be exactly [0, len).
        let mut seen: Vec<usize> = handles
            .iter()
            .filter(|h| !h.is_closing_by_cell(&table))
            .map(|h| h.get())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    /// Test-only helper: whether the handle's cell refers to a now-removed
    /// slot is undecidable from the cell alone once a handle has been
    /// reaped (its value was last set before removal), so we sidestep
    /// that by checking against `table.len()` instead.
    trait ClosingByCellExt {
        fn is_closing_by_cell(&self, table: &ConnTable) -> bool;
    }
    impl ClosingByCellExt for Rc<Cell<usize>> {
        fn is_closing_by_cell(&self, table: &ConnTable) -> bool {
            self.get() >= table.len()
        }
    }
}
