//! Worker handshake: the ready/busy byte that serializes access to a core's
//! region between host accessors and the FPGA.
//!
//! ```text
//!   Idle ──CAS {ready} → {ready, busy}──▶ InCriticalSection
//!    ▲                                          │
//!    └──── barrier, clear busy, barrier ◀───────┘ (guard dropped)
//! ```
//!
//! The FPGA owns `ready` and drops it while it preempts the core. The host
//! owns `busy`. Entering is a single compare-and-swap on the byte, so both
//! bits are always observed together.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use lauberhorn_core::Direction;

use crate::barrier::barrier;
use crate::core_state::NextCl;
use crate::error::ExchangeError;

bitflags! {
    /// Byte 0 of the worker-control cacheline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkerCtrl: u8 {
        /// Hardware lets the host use the region.
        const READY = 1 << 0;
        /// Host is inside a critical section.
        const BUSY = 1 << 1;
    }
}

/// How long [`WorkerHandshake::enter`] keeps retrying.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpinLimit {
    /// Spin until the hardware becomes ready.
    #[default]
    Unbounded,
    /// Give up after this many failed retries.
    Attempts(u64),
    /// Give up once this much time has passed since the first failure.
    Timeout(Duration),
}

impl SpinLimit {
    pub fn budget(self) -> SpinBudget {
        SpinBudget {
            limit: self,
            started: None,
        }
    }
}

/// Decides whether to keep spinning after a failed entry attempt.
///
/// Closures `FnMut(u64) -> bool` are policies too; they get the number of
/// failed attempts so far.
pub trait SpinPolicy {
    fn keep_spinning(&mut self, failed_attempts: u64) -> bool;
}

impl<F: FnMut(u64) -> bool> SpinPolicy for F {
    fn keep_spinning(&mut self, failed_attempts: u64) -> bool {
        self(failed_attempts)
    }
}

/// Stateful policy for one `enter` call, built from a [`SpinLimit`].
#[derive(Debug, Clone)]
pub struct SpinBudget {
    limit: SpinLimit,
    started: Option<Instant>,
}

impl SpinPolicy for SpinBudget {
    fn keep_spinning(&mut self, failed_attempts: u64) -> bool {
        match self.limit {
            SpinLimit::Unbounded => true,
            SpinLimit::Attempts(max) => failed_attempts <= max,
            SpinLimit::Timeout(timeout) => {
                let started = *self.started.get_or_insert_with(Instant::now);
                started.elapsed() < timeout
            }
        }
    }
}

/// Counters for one core's handshake.
#[derive(Debug, Default)]
pub struct HandshakeStats {
    entries: AtomicU64,
    exits: AtomicU64,
    spins: AtomicU64,
}

/// Point-in-time copy of [`HandshakeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeCounters {
    pub entries: u64,
    pub exits: u64,
    /// Failed entry attempts, summed over all `enter` calls.
    pub spins: u64,
}

impl HandshakeCounters {
    /// Critical sections entered but not yet left.
    ///
    /// A snapshot taken while another thread leaves may count the exit
    /// without its entry; that reads as zero.
    pub fn in_flight(&self) -> u64 {
        self.entries.saturating_sub(self.exits)
    }
}

impl HandshakeStats {
    pub fn snapshot(&self) -> HandshakeCounters {
        // Exits first: every exit counted here has its entry counted below.
        let exits = self.exits.load(Ordering::Acquire);
        HandshakeCounters {
            entries: self.entries.load(Ordering::Acquire),
            exits,
            spins: self.spins.load(Ordering::Relaxed),
        }
    }
}

/// Handle on one core's worker-control byte.
#[derive(Debug, Clone, Copy)]
pub struct WorkerHandshake<'m> {
    core: usize,
    ctrl: &'m AtomicU8,
    stats: &'m HandshakeStats,
}

impl<'m> WorkerHandshake<'m> {
    pub fn new(core: usize, ctrl: &'m AtomicU8, stats: &'m HandshakeStats) -> Self {
        Self { core, ctrl, stats }
    }

    #[inline]
    pub fn state(&self) -> WorkerCtrl {
        WorkerCtrl::from_bits_retain(self.ctrl.load(Ordering::Acquire))
    }

    /// Set or clear `ready`. This is the hardware's half of the protocol;
    /// the host only calls it from software models.
    pub fn set_ready(&self, ready: bool) {
        if ready {
            self.ctrl.fetch_or(WorkerCtrl::READY.bits(), Ordering::AcqRel);
        } else {
            self.ctrl
                .fetch_and(!WorkerCtrl::READY.bits(), Ordering::AcqRel);
        }
    }

    pub fn stats(&self) -> HandshakeCounters {
        self.stats.snapshot()
    }

    /// One attempt at `{ready} -> {ready, busy}`.
    pub fn try_enter(&self) -> Option<CriticalSection<'m>> {
        let current = self.state();
        if !current.contains(WorkerCtrl::READY) || current.contains(WorkerCtrl::BUSY) {
            return None;
        }
        self.ctrl
            .compare_exchange(
                current.bits(),
                (current | WorkerCtrl::BUSY).bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;

        self.stats.entries.fetch_add(1, Ordering::Release);
        tracing::debug!(core = self.core, "entered critical section");
        Some(CriticalSection {
            core: self.core,
            ctrl: self.ctrl,
            stats: self.stats,
        })
    }

    /// Spin on [`try_enter`](Self::try_enter) until it succeeds or `policy`
    /// gives up.
    pub fn enter<P: SpinPolicy + ?Sized>(
        &self,
        policy: &mut P,
    ) -> Result<CriticalSection<'m>, ExchangeError> {
        let mut attempts = 0u64;
        loop {
            if let Some(cs) = self.try_enter() {
                self.stats.spins.fetch_add(attempts, Ordering::Relaxed);
                return Ok(cs);
            }
            attempts += 1;
            if !policy.keep_spinning(attempts) {
                self.stats.spins.fetch_add(attempts, Ordering::Relaxed);
                tracing::warn!(
                    core = self.core,
                    attempts,
                    state = ?self.state(),
                    "worker handshake did not become ready"
                );
                return Err(ExchangeError::HandshakeStuck {
                    core: self.core,
                    attempts,
                });
            }
            std::hint::spin_loop();
        }
    }
}

/// Proof that the host holds `busy` on a core. Dropping it leaves the
/// critical section.
#[must_use = "dropping the guard leaves the critical section immediately"]
#[derive(Debug)]
pub struct CriticalSection<'m> {
    core: usize,
    ctrl: &'m AtomicU8,
    stats: &'m HandshakeStats,
}

impl CriticalSection<'_> {
    #[inline]
    pub fn core(&self) -> usize {
        self.core
    }

    #[inline]
    pub fn parity(&self, next: &NextCl, dir: Direction) -> bool {
        next.get(dir)
    }

    #[inline]
    pub fn set_parity(&self, next: &mut NextCl, dir: Direction, value: bool) {
        next.set(dir, value);
    }

    /// Flip `dir`'s parity and return the new value.
    #[inline]
    pub fn toggle_parity(&self, next: &mut NextCl, dir: Direction) -> bool {
        let value = !next.get(dir);
        next.set(dir, value);
        value
    }

    /// Leave the critical section now.
    pub fn exit(self) {}
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        barrier();
        let prev = WorkerCtrl::from_bits_retain(
            self.ctrl
                .fetch_and(!WorkerCtrl::BUSY.bits(), Ordering::AcqRel),
        );
        barrier();
        self.stats.exits.fetch_add(1, Ordering::Release);

        if prev.contains(WorkerCtrl::BUSY) {
            tracing::debug!(core = self.core, "left critical section");
        } else {
            tracing::error!(
                core = self.core,
                state = ?prev,
                "left critical section but busy was already clear"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ready_byte() -> AtomicU8 {
        AtomicU8::new(WorkerCtrl::READY.bits())
    }

    #[test]
    fn enter_sets_and_exit_clears_busy() {
        let ctrl = ready_byte();
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);

        let cs = hs.try_enter().expect("ready and idle");
        assert_eq!(hs.state(), WorkerCtrl::READY | WorkerCtrl::BUSY);
        assert!(hs.try_enter().is_none(), "busy excludes a second entry");
        cs.exit();

        assert_eq!(hs.state(), WorkerCtrl::READY);
        let counters = hs.stats();
        assert_eq!((counters.entries, counters.exits), (1, 1));
        assert_eq!(counters.in_flight(), 0);
    }

    #[test]
    fn in_flight_never_underflows() {
        let torn = HandshakeCounters {
            entries: 4,
            exits: 5,
            spins: 0,
        };
        assert_eq!(torn.in_flight(), 0);
    }

    #[test]
    fn snapshot_while_leaving_stays_consistent() {
        let ctrl = ready_byte();
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..2_000 {
                    if let Some(cs) = hs.try_enter() {
                        cs.exit();
                    }
                }
                done.store(true, Ordering::Release);
            });
            while !done.load(Ordering::Acquire) {
                let counters = hs.stats();
                assert!(counters.exits <= counters.entries, "{counters:?}");
                assert!(counters.in_flight() <= 1);
            }
        });
    }

    #[test]
    fn not_ready_blocks_entry() {
        let ctrl = AtomicU8::new(0);
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);
        assert!(hs.try_enter().is_none());

        hs.set_ready(true);
        assert!(hs.try_enter().is_some());
        hs.set_ready(false);
        assert_eq!(hs.state(), WorkerCtrl::empty());
    }

    #[test]
    fn zero_retry_policy_reports_stuck() {
        let ctrl = AtomicU8::new(0);
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(5, &ctrl, &stats);

        let err = hs.enter(&mut SpinLimit::Attempts(0).budget()).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::HandshakeStuck {
                core: 5,
                attempts: 1
            }
        ));
        assert_eq!(hs.stats().entries, 0);
        assert_eq!(hs.stats().spins, 1);
    }

    #[test]
    fn closure_policy_sees_attempt_count() {
        let ctrl = AtomicU8::new(0);
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);

        let mut seen = Vec::new();
        let mut policy = |n: u64| {
            seen.push(n);
            n < 3
        };
        assert!(hs.enter(&mut policy).is_err());
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn policy_can_release_the_hardware() {
        let ctrl = AtomicU8::new(0);
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);

        // Hardware comes back after a few polls.
        let mut policy = |n: u64| {
            if n == 4 {
                hs.set_ready(true);
            }
            true
        };
        let cs = hs.enter(&mut policy).unwrap();
        drop(cs);
        assert_eq!(hs.stats().spins, 4);
    }

    #[test]
    fn timeout_policy_expires() {
        let ctrl = AtomicU8::new(0);
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);
        let err = hs
            .enter(&mut SpinLimit::Timeout(Duration::from_millis(5)).budget())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::HandshakeStuck { .. }));
    }

    #[test]
    fn parity_only_through_guard() {
        let ctrl = ready_byte();
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);
        let mut next = NextCl::default();

        let cs = hs.try_enter().unwrap();
        assert!(!cs.parity(&next, Direction::Rx));
        assert!(cs.toggle_parity(&mut next, Direction::Rx));
        assert!(!cs.toggle_parity(&mut next, Direction::Rx));
        cs.set_parity(&mut next, Direction::Tx, true);
        drop(cs);

        assert_eq!(next, NextCl::new(false, true));
    }

    #[test]
    fn exit_tolerates_externally_cleared_busy() {
        let ctrl = ready_byte();
        let stats = HandshakeStats::default();
        let hs = WorkerHandshake::new(0, &ctrl, &stats);
        let cs = hs.try_enter().unwrap();
        ctrl.store(WorkerCtrl::READY.bits(), Ordering::Release);
        drop(cs);
        assert_eq!(hs.stats().exits, 1);
        assert_eq!(hs.state(), WorkerCtrl::READY);
    }

    #[test]
    fn concurrent_accessors_are_mutually_exclusive() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;

        let ctrl = ready_byte();
        let stats = HandshakeStats::default();
        let inside = AtomicUsize::new(0);
        let total = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    let hs = WorkerHandshake::new(0, &ctrl, &stats);
                    for _ in 0..ROUNDS {
                        let cs = hs.enter(&mut SpinLimit::Unbounded.budget()).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        assert!(hs.state().contains(WorkerCtrl::BUSY));
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(cs);
                    }
                });
            }
        });

        assert_eq!(total.load(Ordering::Relaxed), THREADS * ROUNDS);
        let counters = stats.snapshot();
        assert_eq!(counters.entries, (THREADS * ROUNDS) as u64);
        assert_eq!(counters.exits, counters.entries);
        assert_eq!(
            WorkerCtrl::from_bits_retain(ctrl.load(Ordering::Acquire)),
            WorkerCtrl::READY
        );
    }
}
