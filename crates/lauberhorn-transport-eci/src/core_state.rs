//! Host-side bookkeeping for one logical core.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lauberhorn_core::Direction;
use parking_lot::Mutex;

use crate::config::EciConfig;

/// Which control cacheline of each pair the host touches next.
///
/// Mirrors the hardware's own next-CL counters. Only the exchange engine
/// changes it: through a [`CriticalSection`](crate::CriticalSection) or at
/// resync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NextCl {
    rx: bool,
    tx: bool,
}

impl NextCl {
    pub const fn new(rx: bool, tx: bool) -> Self {
        Self { rx, tx }
    }

    #[inline]
    pub const fn get(&self, dir: Direction) -> bool {
        match dir {
            Direction::Rx => self.rx,
            Direction::Tx => self.tx,
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, dir: Direction, value: bool) {
        match dir {
            Direction::Rx => self.rx = value,
            Direction::Tx => self.tx = value,
        }
    }
}

/// Per-core counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreStats {
    /// Valid transactions received, including error-tagged ones.
    pub rx_transactions: u64,
    /// Receives that found nothing pending.
    pub rx_empty_polls: u64,
    pub rx_error_tagged: u64,
    pub tx_transactions: u64,
    /// Transmits that put nothing on the wire.
    pub tx_aborted: u64,
}

impl fmt::Display for CoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx={} (empty={}, error={}) tx={} (aborted={})",
            self.rx_transactions,
            self.rx_empty_polls,
            self.rx_error_tagged,
            self.tx_transactions,
            self.tx_aborted
        )
    }
}

/// Exclusive hold on one core of a transport, released on drop.
#[derive(Debug)]
pub(crate) struct CoreClaim {
    claims: Arc<[AtomicBool]>,
    core: usize,
}

impl CoreClaim {
    /// `None` if someone else already holds `core`.
    pub(crate) fn acquire(claims: &Arc<[AtomicBool]>, core: usize) -> Option<Self> {
        claims[core]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            claims: Arc::clone(claims),
            core,
        })
    }
}

impl Drop for CoreClaim {
    fn drop(&mut self) {
        self.claims[self.core].store(false, Ordering::Release);
        tracing::trace!(core = self.core, "core released");
    }
}

/// Everything the host tracks for one core between exchanges.
///
/// Owned by the thread driving the core. Sharing it between threads needs
/// a lock; see [`SharedCoreState`]. The transport hands out at most one
/// live state per core; dropping it frees the core for the next owner.
#[derive(Debug)]
pub struct CoreState {
    core: usize,
    claim: Option<CoreClaim>,
    pub(crate) next_cl: NextCl,
    /// Receive scratch buffer; its length is the receive capacity.
    pub(crate) rx_buf: Vec<u8>,
    /// Transmit buffer, lent out by `prepare_transmit`.
    pub(crate) tx_buf: Vec<u8>,
    pub(crate) stats: CoreStats,
}

/// A [`CoreState`] driven from more than one thread.
pub type SharedCoreState = Arc<Mutex<CoreState>>;

impl CoreState {
    /// Fresh state after a hardware reset: both parities at 0.
    pub(crate) fn cold(core: usize, config: &EciConfig) -> Self {
        Self::synced(core, config, false, false)
    }

    /// State aligned to the hardware's next-CL registers.
    pub(crate) fn synced(core: usize, config: &EciConfig, hw_rx: bool, hw_tx: bool) -> Self {
        Self {
            core,
            claim: None,
            next_cl: NextCl::new(hw_rx, hw_tx),
            rx_buf: vec![0; config.rx_buffer_size],
            tx_buf: Vec::with_capacity(config.tx_buffer_size),
            stats: CoreStats::default(),
        }
    }

    pub(crate) fn with_claim(mut self, claim: CoreClaim) -> Self {
        debug_assert_eq!(claim.core, self.core);
        self.claim = Some(claim);
        self
    }

    pub fn into_shared(self) -> SharedCoreState {
        Arc::new(Mutex::new(self))
    }

    #[inline]
    pub fn core(&self) -> usize {
        self.core
    }

    #[inline]
    pub fn next_cl(&self) -> NextCl {
        self.next_cl
    }

    #[inline]
    pub fn rx_next_cl(&self) -> bool {
        self.next_cl.rx
    }

    #[inline]
    pub fn tx_next_cl(&self) -> bool {
        self.next_cl.tx
    }

    /// Largest payload `receive` accepts before failing with
    /// `OverflowExceeded`.
    #[inline]
    pub fn rx_capacity(&self) -> usize {
        self.rx_buf.len()
    }

    pub fn stats(&self) -> &CoreStats {
        &self.stats
    }
}
