//! Exchange engine.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use lauberhorn_core::{
    inline_window, ControlCodec, Direction, EncodeError, HeaderKind, Transaction,
    TransactionKind, CACHELINE_SIZE, INLINE_DATA_SIZE,
};

use crate::barrier::barrier;
use crate::config::{ConfigError, EciConfig};
use crate::core_state::{CoreClaim, CoreState, NextCl};
use crate::error::ExchangeError;
use crate::handshake::{HandshakeStats, SpinPolicy, WorkerHandshake};
use crate::memory::CoherentMemory;

/// A transaction handed out by [`EciTransport::receive`].
///
/// The payload lives in the core's receive buffer, so the core state stays
/// borrowed until the descriptor is acknowledged (or dropped).
#[derive(Debug)]
pub struct Received<'a> {
    transaction: Transaction,
    payload: &'a [u8],
}

impl<'a> Received<'a> {
    #[inline]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    #[inline]
    pub fn kind(&self) -> TransactionKind {
        self.transaction.kind()
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A transaction being staged for [`EciTransport::transmit`].
///
/// Holds the core's transmit buffer while it is out; `transmit` gives it
/// back.
#[derive(Debug)]
pub struct TxDescriptor {
    transaction: Transaction,
    payload: Vec<u8>,
}

impl TxDescriptor {
    #[inline]
    pub fn kind(&self) -> TransactionKind {
        self.transaction.kind()
    }

    #[inline]
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    #[inline]
    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.transaction
    }

    pub fn set_transaction(&mut self, transaction: Transaction) {
        self.transaction = transaction;
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Fill in place. Starts empty with room for a full transaction.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }
}

/// Host end of the Lauberhorn cacheline exchange for every core mapped in
/// one coherent region.
///
/// The transport itself is shared freely; each core's [`CoreState`] is
/// owned by whoever drives that core, and only one exists at a time.
pub struct EciTransport<M> {
    memory: M,
    config: EciConfig,
    codec: ControlCodec,
    handshakes: Box<[HandshakeStats]>,
    claims: Arc<[AtomicBool]>,
}

impl<M: std::fmt::Debug> std::fmt::Debug for EciTransport<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EciTransport")
            .field("memory", &self.memory)
            .field("num_cores", &self.config.num_cores)
            .finish_non_exhaustive()
    }
}

impl<M: CoherentMemory> EciTransport<M> {
    pub fn new(memory: M, config: EciConfig) -> Result<Self, ExchangeError> {
        config.validate()?;
        let codec = ControlCodec::new(config.format).map_err(ConfigError::Format)?;

        let required = config
            .layout
            .region_size(config.num_cores)
            .unwrap_or(usize::MAX);
        if memory.len() < required {
            return Err(ExchangeError::RegionTooSmall {
                required,
                found: memory.len(),
            });
        }

        let handshakes = (0..config.num_cores)
            .map(|_| HandshakeStats::default())
            .collect();
        let claims = (0..config.num_cores)
            .map(|_| AtomicBool::new(false))
            .collect();
        tracing::debug!(
            num_cores = config.num_cores,
            region = memory.len(),
            capacity = config.layout.payload_capacity(),
            "eci transport ready"
        );
        Ok(Self {
            memory,
            config,
            codec,
            handshakes,
            claims,
        })
    }

    #[inline]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    #[inline]
    pub fn config(&self) -> &EciConfig {
        &self.config
    }

    #[inline]
    pub fn codec(&self) -> &ControlCodec {
        &self.codec
    }

    /// Claim `core` with cold parity (both 0).
    ///
    /// Fails with [`ExchangeError::CoreInUse`] while another state for the
    /// same core is alive.
    pub fn core_state(&self, core: usize) -> Result<CoreState, ExchangeError> {
        self.synced_core_state(core, false, false)
    }

    /// Claim `core` with parity taken from the hardware's next-CL
    /// registers.
    pub fn synced_core_state(
        &self,
        core: usize,
        hw_rx: bool,
        hw_tx: bool,
    ) -> Result<CoreState, ExchangeError> {
        self.core_base(core)?;
        let claim = CoreClaim::acquire(&self.claims, core)
            .ok_or(ExchangeError::CoreInUse { core })?;
        tracing::debug!(core, hw_rx, hw_tx, "core claimed");
        Ok(CoreState::synced(core, &self.config, hw_rx, hw_tx).with_claim(claim))
    }

    pub fn handshake(&self, core: usize) -> Result<WorkerHandshake<'_>, ExchangeError> {
        let base = self.core_base(core)?;
        Ok(WorkerHandshake::new(
            core,
            self.memory
                .ctrl_byte(base + self.config.layout.worker_ctrl_offset),
            &self.handshakes[core],
        ))
    }

    fn core_base(&self, core: usize) -> Result<usize, ExchangeError> {
        if core >= self.config.num_cores {
            return Err(ExchangeError::InvalidCore {
                core,
                num_cores: self.config.num_cores,
            });
        }
        Ok(self.config.layout.core_base(core))
    }

    /// Poll for one transaction with the configured spin policy.
    pub fn receive<'s>(
        &self,
        state: &'s mut CoreState,
    ) -> Result<Option<Received<'s>>, ExchangeError> {
        self.receive_with(state, &mut self.config.spin.budget())
    }

    /// Poll for one transaction. `Ok(None)` means nothing was pending.
    pub fn receive_with<'s, P: SpinPolicy + ?Sized>(
        &self,
        state: &'s mut CoreState,
        policy: &mut P,
    ) -> Result<Option<Received<'s>>, ExchangeError> {
        let core = state.core();
        let base = self.core_base(core)?;
        let handshake = self.handshake(core)?;
        let layout = &self.config.layout;
        let CoreState {
            next_cl,
            rx_buf,
            stats,
            ..
        } = state;

        barrier();
        let cs = handshake.enter(policy)?;
        let parity = cs.parity(next_cl, Direction::Rx);

        let mut cl = [0u8; CACHELINE_SIZE];
        self.memory
            .read(base + layout.control_offset(Direction::Rx, parity), &mut cl);
        let header = self.codec.decode(&cl);
        barrier();

        cs.toggle_parity(next_cl, Direction::Rx);

        if !header.valid {
            stats.rx_empty_polls += 1;
            return Ok(None);
        }

        let len = header.length;
        let capacity = rx_buf.len().min(layout.payload_capacity());
        if len > capacity {
            drop(cs);
            tracing::error!(core, len, capacity, "received length exceeds receive buffer");
            return Err(ExchangeError::OverflowExceeded { len, capacity });
        }

        let inline = len.min(INLINE_DATA_SIZE);
        rx_buf[..inline].copy_from_slice(&inline_window(&cl)[..inline]);
        if len > INLINE_DATA_SIZE {
            self.memory.read(
                base + layout.overflow_offset(Direction::Rx),
                &mut rx_buf[INLINE_DATA_SIZE..len],
            );
        }
        drop(cs);

        stats.rx_transactions += 1;
        if let Transaction::Error { tag } = header.transaction {
            stats.rx_error_tagged += 1;
            tracing::warn!(core, tag, len, "hardware sent an unrecognised transaction tag");
        }
        tracing::debug!(core, parity, kind = %header.transaction.kind(), len, "received");

        let rx_buf: &'s [u8] = rx_buf;
        Ok(Some(Received {
            transaction: header.transaction,
            payload: &rx_buf[..len],
        }))
    }

    /// Release a received transaction. The receive buffer is reused, so
    /// this only ends the borrow on the core state.
    pub fn acknowledge_receive(&self, received: Received<'_>) {
        tracing::trace!(kind = %received.kind(), len = received.len(), "acknowledged");
    }

    /// Lend out the core's transmit buffer for a `kind` transaction.
    pub fn prepare_transmit(&self, state: &mut CoreState, kind: TransactionKind) -> TxDescriptor {
        let mut payload = std::mem::take(&mut state.tx_buf);
        payload.clear();
        payload.reserve(self.config.tx_buffer_size);
        TxDescriptor {
            transaction: Transaction::empty(kind, &self.config.format),
            payload,
        }
    }

    /// Put a staged transaction on the wire with the configured spin policy.
    pub fn transmit(&self, state: &mut CoreState, desc: TxDescriptor) -> Result<(), ExchangeError> {
        self.transmit_with(state, desc, &mut self.config.spin.budget())
    }

    pub fn transmit_with<P: SpinPolicy + ?Sized>(
        &self,
        state: &mut CoreState,
        desc: TxDescriptor,
        policy: &mut P,
    ) -> Result<(), ExchangeError> {
        let TxDescriptor {
            transaction,
            mut payload,
        } = desc;
        let result = self.transmit_staged(state, &transaction, &payload, policy);
        payload.clear();
        state.tx_buf = payload;
        result
    }

    fn transmit_staged<P: SpinPolicy + ?Sized>(
        &self,
        state: &mut CoreState,
        transaction: &Transaction,
        payload: &[u8],
        policy: &mut P,
    ) -> Result<(), ExchangeError> {
        let core = state.core();
        let base = self.core_base(core)?;
        let layout = &self.config.layout;

        let capacity = layout.payload_capacity();
        if payload.len() > capacity {
            state.stats.tx_aborted += 1;
            return Err(ExchangeError::PayloadTooLarge {
                len: payload.len(),
                capacity,
            });
        }

        let handshake = self.handshake(core)?;
        barrier();
        let cs = handshake.enter(policy)?;
        let parity = cs.parity(&state.next_cl, Direction::Tx);

        let inline = payload.len().min(INLINE_DATA_SIZE);
        let encoded = transmittable(transaction)
            .and_then(|()| self.codec.encode(transaction, payload.len(), &payload[..inline]));
        match &encoded {
            Ok(cl) => {
                if payload.len() > INLINE_DATA_SIZE {
                    self.memory.write(
                        base + layout.overflow_offset(Direction::Tx),
                        &payload[INLINE_DATA_SIZE..],
                    );
                }
                self.memory
                    .write(base + layout.control_offset(Direction::Tx, parity), cl);
            }
            Err(e) => {
                tracing::warn!(core, kind = %transaction.kind(), error = %e, "not transmitting");
            }
        }
        barrier();

        let next = cs.toggle_parity(&mut state.next_cl, Direction::Tx);
        self.memory
            .touch(base + layout.control_offset(Direction::Tx, next));
        drop(cs);

        match encoded {
            Ok(_) => {
                state.stats.tx_transactions += 1;
                tracing::debug!(core, parity, kind = %transaction.kind(), len = payload.len(), "transmitted");
                Ok(())
            }
            Err(e) => {
                state.stats.tx_aborted += 1;
                Err(e.into())
            }
        }
    }

    /// Align host parity with the hardware's next-CL registers.
    pub fn resync(
        &self,
        state: &mut CoreState,
        hw_rx: bool,
        hw_tx: bool,
    ) -> Result<(), ExchangeError> {
        self.core_base(state.core())?;
        let before = state.next_cl;
        state.next_cl = NextCl::new(hw_rx, hw_tx);
        tracing::debug!(core = state.core(), ?before, after = ?state.next_cl, "resynced parity");
        Ok(())
    }

    /// Invalidate the core's cachelines and drop anything left over from a
    /// previous run. Returns how many stale transactions were dropped.
    pub fn bring_up(&self, state: &mut CoreState) -> Result<usize, ExchangeError> {
        let core = state.core();
        let base = self.core_base(core)?;
        for offset in self.config.layout.exchange_cachelines() {
            self.memory.invalidate_cacheline(base + offset);
        }
        barrier();

        let mut drained = 0;
        while let Some(stale) = self.receive(state)? {
            tracing::warn!(core, kind = %stale.kind(), len = stale.len(), "dropping stale transaction");
            self.acknowledge_receive(stale);
            drained += 1;
        }
        tracing::info!(core, drained, "core up");
        Ok(drained)
    }
}

/// What the host may put on the wire: bypass frames with an Ethernet or IP
/// header, and ONC-RPC calls and replies.
fn transmittable(transaction: &Transaction) -> Result<(), EncodeError> {
    match transaction {
        Transaction::Bypass(bypass) => match bypass.header_kind {
            HeaderKind::Ethernet | HeaderKind::Ip => Ok(()),
            other => Err(EncodeError::UnsupportedHeader(other)),
        },
        Transaction::OncRpcCall(_) | Transaction::OncRpcReply(_) => Ok(()),
        Transaction::Error { .. } => Err(EncodeError::UnsupportedKind(TransactionKind::Error)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use lauberhorn_core::DEFAULT_LAYOUT;

    use super::*;
    use crate::handshake::{SpinLimit, WorkerCtrl};
    use crate::memory::HeapMemory;

    fn transport() -> EciTransport<HeapMemory> {
        let config = EciConfig::default();
        let memory = HeapMemory::new(config.layout.region_size(1).unwrap());
        let transport = EciTransport::new(memory, config).unwrap();
        transport.handshake(0).unwrap().set_ready(true);
        transport
    }

    /// Place a valid transaction in RX control cacheline `parity` the way
    /// the FPGA would.
    fn stage_rx(t: &EciTransport<HeapMemory>, parity: bool, tx: &Transaction, payload: &[u8]) {
        let inline = payload.len().min(INLINE_DATA_SIZE);
        let cl = t.codec().encode(tx, payload.len(), &payload[..inline]).unwrap();
        let layout = &t.config().layout;
        if payload.len() > INLINE_DATA_SIZE {
            t.memory()
                .write(layout.overflow_offset(Direction::Rx), &payload[INLINE_DATA_SIZE..]);
        }
        t.memory()
            .write(layout.control_offset(Direction::Rx, parity), &cl);
    }

    fn eth() -> Transaction {
        Transaction::bypass(HeaderKind::Ethernet, &[0xee; 14]).unwrap()
    }

    #[test]
    fn new_rejects_small_region() {
        let err = EciTransport::new(HeapMemory::new(0x1000), EciConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::RegionTooSmall {
                required: 0x10000,
                found: 0x1000
            }
        );
    }

    #[test]
    fn invalid_core_rejected() {
        let t = transport();
        assert!(matches!(
            t.core_state(1),
            Err(ExchangeError::InvalidCore { core: 1, num_cores: 1 })
        ));
        let mut state = CoreState::cold(3, t.config());
        assert!(matches!(
            t.receive(&mut state),
            Err(ExchangeError::InvalidCore { .. })
        ));
    }

    #[test]
    fn one_state_per_core() {
        let t = transport();
        let state = t.core_state(0).unwrap();
        assert_eq!(
            t.core_state(0).unwrap_err(),
            ExchangeError::CoreInUse { core: 0 }
        );
        assert!(matches!(
            t.synced_core_state(0, true, true),
            Err(ExchangeError::CoreInUse { core: 0 })
        ));

        let shared = state.into_shared();
        assert!(t.core_state(0).is_err(), "shared state still holds the core");
        drop(shared);

        let synced = t.synced_core_state(0, true, false).unwrap();
        assert!(synced.rx_next_cl());
        assert!(!synced.tx_next_cl());
    }

    #[test]
    fn empty_poll_still_toggles_parity() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        assert!(t.receive(&mut state).unwrap().is_none());
        assert!(state.rx_next_cl());
        assert!(t.receive(&mut state).unwrap().is_none());
        assert!(!state.rx_next_cl());
        assert_eq!(state.stats().rx_empty_polls, 2);
        assert_eq!(t.handshake(0).unwrap().state(), WorkerCtrl::READY);
    }

    #[test]
    fn receive_reads_inline_and_overflow() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        stage_rx(&t, false, &eth(), &payload);

        let rx = t.receive(&mut state).unwrap().expect("staged");
        assert_eq!(rx.kind(), TransactionKind::Bypass);
        assert_eq!(rx.transaction(), &eth());
        assert_eq!(rx.payload(), &payload[..]);
        t.acknowledge_receive(rx);
        assert_eq!(state.stats().rx_transactions, 1);
    }

    #[test]
    fn oversized_receive_exits_and_fails() {
        let config = EciConfig {
            rx_buffer_size: 100,
            ..EciConfig::default()
        };
        let memory = HeapMemory::new(config.layout.region_size(1).unwrap());
        let t = EciTransport::new(memory, config).unwrap();
        t.handshake(0).unwrap().set_ready(true);
        let mut state = t.core_state(0).unwrap();
        stage_rx(&t, false, &eth(), &[1; 101]);

        let err = t.receive(&mut state).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::OverflowExceeded {
                len: 101,
                capacity: 100
            }
        );
        let counters = t.handshake(0).unwrap().stats();
        assert_eq!(counters.entries, counters.exits);
        assert!(state.rx_next_cl());
    }

    #[test]
    fn transmit_writes_control_and_rings_doorbell() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        let mut desc = t.prepare_transmit(&mut state, TransactionKind::Bypass);
        assert!(desc.payload().is_empty());
        assert!(desc.payload_mut().capacity() >= DEFAULT_LAYOUT.payload_capacity());
        desc.set_transaction(eth());
        desc.payload_mut().extend_from_slice(&[7; 80]);
        t.transmit(&mut state, desc).unwrap();

        assert!(state.tx_next_cl());
        let mut cl = [0u8; CACHELINE_SIZE];
        t.memory()
            .read(DEFAULT_LAYOUT.control_offset(Direction::Tx, false), &mut cl);
        let header = t.codec().decode(&cl);
        assert!(header.valid);
        assert_eq!(header.length, 80);
        assert_eq!(header.transaction, eth());

        let mut overflow = [0u8; 16];
        t.memory()
            .read(DEFAULT_LAYOUT.overflow_offset(Direction::Tx), &mut overflow);
        assert_eq!(overflow, [7; 16]);
    }

    #[test]
    fn payload_too_large_touches_nothing() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        let mut desc = t.prepare_transmit(&mut state, TransactionKind::Bypass);
        desc.set_transaction(eth());
        desc.payload_mut()
            .resize(DEFAULT_LAYOUT.payload_capacity() + 1, 0xaa);

        let err = t.transmit(&mut state, desc).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ExchangeError::PayloadTooLarge { .. }));
        assert!(!state.tx_next_cl());
        assert_eq!(t.handshake(0).unwrap().stats().entries, 0);
        assert_eq!(state.stats().tx_aborted, 1);
    }

    #[test]
    fn unsupported_transmit_still_advances() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        let desc = t.prepare_transmit(&mut state, TransactionKind::Error);
        let err = t.transmit(&mut state, desc).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::UnsupportedTransmit(EncodeError::UnsupportedKind(
                TransactionKind::Error
            ))
        );
        assert!(state.tx_next_cl());

        let mut desc = t.prepare_transmit(&mut state, TransactionKind::Bypass);
        desc.set_transaction(Transaction::bypass(HeaderKind::Udp, &[0; 42]).unwrap());
        assert!(matches!(
            t.transmit(&mut state, desc),
            Err(ExchangeError::UnsupportedTransmit(EncodeError::UnsupportedHeader(
                HeaderKind::Udp
            )))
        ));
        assert!(!state.tx_next_cl());

        let counters = t.handshake(0).unwrap().stats();
        assert_eq!((counters.entries, counters.exits), (2, 2));
        let mut cl = [0u8; CACHELINE_SIZE];
        t.memory().read(DEFAULT_LAYOUT.tx_base, &mut cl);
        assert!(!t.codec().is_valid(&cl));
    }

    #[test]
    fn stuck_handshake_with_zero_retries() {
        let t = transport();
        t.handshake(0).unwrap().set_ready(false);
        let mut state = t.core_state(0).unwrap();
        let err = t
            .receive_with(&mut state, &mut SpinLimit::Attempts(0).budget())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::HandshakeStuck { core: 0, .. }));
        assert!(!state.rx_next_cl(), "parity untouched without the handshake");
    }

    #[test]
    fn resync_and_bring_up() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        t.resync(&mut state, true, true).unwrap();
        assert_eq!(state.next_cl(), NextCl::new(true, true));

        stage_rx(&t, true, &eth(), &[1; 10]);
        assert_eq!(t.bring_up(&mut state).unwrap(), 1);
        // The stale transaction was consumed, then one empty poll.
        assert!(state.rx_next_cl());
        assert_eq!(state.stats().rx_empty_polls, 1);
    }

    #[test]
    fn tx_buffer_returns_to_state() {
        let t = transport();
        let mut state = t.core_state(0).unwrap();
        let mut desc = t.prepare_transmit(&mut state, TransactionKind::OncRpcReply);
        let ptr = desc.payload_mut().as_ptr();
        desc.payload_mut().extend_from_slice(&[1, 2, 3, 4]);
        t.transmit(&mut state, desc).unwrap();

        let mut desc = t.prepare_transmit(&mut state, TransactionKind::OncRpcReply);
        assert!(desc.payload().is_empty());
        assert_eq!(desc.payload_mut().as_ptr(), ptr);
        assert_eq!(
            t.memory()
                .ctrl_byte(DEFAULT_LAYOUT.worker_ctrl_offset)
                .load(Ordering::Acquire),
            WorkerCtrl::READY.bits()
        );
    }
}
