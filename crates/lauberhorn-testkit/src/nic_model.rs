//! Software model of the FPGA end of the exchange.
//!
//! The model sits between the engine and a backing [`CoherentMemory`] and
//! reacts to the two accesses the real hardware reacts to:
//!
//! - a read of an RX control cacheline: fill it with the next queued
//!   transaction (or leave it invalid) and advance the hardware RX counter;
//! - a read of a TX control cacheline (the doorbell): consume the *other*
//!   TX control cacheline, record it, optionally loop it back to RX, and
//!   advance the hardware TX counter.
//!
//! It also owns the `ready` bit, so tests can preempt a core.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};

use lauberhorn_core::{
    inline_window, Cacheline, ControlCodec, Direction, EncodeError, RegionLayout, Transaction,
    CACHELINE_SIZE, INLINE_DATA_SIZE,
};
use lauberhorn_transport_eci::{CoherentMemory, ConfigError, EciConfig, HeapMemory, WorkerCtrl};
use parking_lot::Mutex;

/// A transaction exactly as it sits in coherent memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub control: Cacheline,
    /// Payload bytes past the inline window.
    pub overflow: Vec<u8>,
}

/// A transaction the host put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub transaction: Transaction,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct NicCore {
    rx_queue: VecDeque<RawTransaction>,
    transmitted: Vec<Packet>,
    hw_rx_next: bool,
    hw_tx_next: bool,
    loopback: bool,
    /// Host touched a cacheline the hardware did not expect next.
    desyncs: u64,
    /// Host touched a control cacheline without holding `busy`.
    unguarded: u64,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    RxControl(bool),
    TxControl(bool),
}

pub struct NicModel<M = HeapMemory> {
    memory: M,
    layout: RegionLayout,
    codec: ControlCodec,
    cores: Vec<Mutex<NicCore>>,
}

impl NicModel<HeapMemory> {
    /// Model over a fresh heap region sized for `config`.
    pub fn new(config: &EciConfig) -> Result<Self, ConfigError> {
        let len = config
            .layout
            .region_size(config.num_cores)
            .unwrap_or(usize::MAX);
        Self::with_memory(HeapMemory::new(len), config)
    }
}

impl<M: CoherentMemory> NicModel<M> {
    /// Model over `memory`. Every core starts ready with both hardware
    /// counters at 0.
    pub fn with_memory(memory: M, config: &EciConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let codec = ControlCodec::new(config.format).map_err(ConfigError::Format)?;
        let model = Self {
            memory,
            layout: config.layout,
            codec,
            cores: (0..config.num_cores)
                .map(|_| Mutex::new(NicCore::default()))
                .collect(),
        };
        for core in 0..config.num_cores {
            model.set_ready(core, true);
        }
        Ok(model)
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    fn ctrl(&self, core: usize) -> &AtomicU8 {
        self.memory
            .ctrl_byte(self.layout.core_base(core) + self.layout.worker_ctrl_offset)
    }

    /// Grant or revoke the host's use of `core`.
    pub fn set_ready(&self, core: usize, ready: bool) {
        let ctrl = self.ctrl(core);
        if ready {
            ctrl.fetch_or(WorkerCtrl::READY.bits(), Ordering::AcqRel);
        } else {
            ctrl.fetch_and(!WorkerCtrl::READY.bits(), Ordering::AcqRel);
        }
    }

    pub fn set_loopback(&self, core: usize, loopback: bool) {
        self.cores[core].lock().loopback = loopback;
    }

    /// Queue a transaction for the host to receive.
    pub fn inject(
        &self,
        core: usize,
        transaction: &Transaction,
        payload: &[u8],
    ) -> Result<(), EncodeError> {
        let capacity = self.layout.payload_capacity();
        if payload.len() > capacity {
            return Err(EncodeError::TooLarge {
                what: "injected payload",
                len: payload.len(),
                max: capacity,
            });
        }
        let inline = payload.len().min(INLINE_DATA_SIZE);
        let control = self
            .codec
            .encode(transaction, payload.len(), &payload[..inline])?;
        self.inject_raw(
            core,
            RawTransaction {
                control,
                overflow: payload[inline..].to_vec(),
            },
        );
        Ok(())
    }

    /// Queue raw cacheline contents, bypassing the codec.
    pub fn inject_raw(&self, core: usize, raw: RawTransaction) {
        self.cores[core].lock().rx_queue.push_back(raw);
    }

    pub fn pending(&self, core: usize) -> usize {
        self.cores[core].lock().rx_queue.len()
    }

    /// Everything transmitted on `core` since the last call.
    pub fn take_transmitted(&self, core: usize) -> Vec<Packet> {
        std::mem::take(&mut self.cores[core].lock().transmitted)
    }

    /// Hardware next-CL counters `(rx, tx)`, as the registers would report.
    pub fn next_cl(&self, core: usize) -> (bool, bool) {
        let state = self.cores[core].lock();
        (state.hw_rx_next, state.hw_tx_next)
    }

    pub fn desyncs(&self, core: usize) -> u64 {
        self.cores[core].lock().desyncs
    }

    pub fn unguarded(&self, core: usize) -> u64 {
        self.cores[core].lock().unguarded
    }

    fn locate(&self, offset: usize) -> Option<(usize, Slot)> {
        let core = offset / self.layout.core_stride;
        if core >= self.cores.len() {
            return None;
        }
        let rel = offset % self.layout.core_stride;
        [false, true].into_iter().find_map(|parity| {
            if rel == self.layout.control_offset(Direction::Rx, parity) {
                Some((core, Slot::RxControl(parity)))
            } else if rel == self.layout.control_offset(Direction::Tx, parity) {
                Some((core, Slot::TxControl(parity)))
            } else {
                None
            }
        })
    }

    fn guarded(&self, core: usize) -> bool {
        WorkerCtrl::from_bits_retain(self.ctrl(core).load(Ordering::Acquire))
            .contains(WorkerCtrl::BUSY)
    }

    fn serve_rx(&self, core: usize, parity: bool) {
        let guarded = self.guarded(core);
        let mut state = self.cores[core].lock();
        if !guarded {
            state.unguarded += 1;
        }
        if state.hw_rx_next != parity {
            state.desyncs += 1;
            tracing::warn!(core, parity, "host read the wrong RX control cacheline");
        }

        let base = self.layout.core_base(core);
        let control = base + self.layout.control_offset(Direction::Rx, parity);
        match state.rx_queue.pop_front() {
            Some(raw) => {
                if !raw.overflow.is_empty() {
                    self.memory
                        .write(base + self.layout.overflow_offset(Direction::Rx), &raw.overflow);
                }
                self.memory.write(control, &raw.control);
            }
            None => self.memory.write(control, &[0u8; CACHELINE_SIZE]),
        }
        state.hw_rx_next = !parity;
    }

    /// The doorbell for TX control cacheline `parity` was rung: the
    /// transaction sits in the other one.
    fn consume_tx(&self, core: usize, doorbell: bool) {
        let written = !doorbell;
        let guarded = self.guarded(core);
        let mut state = self.cores[core].lock();
        if !guarded {
            state.unguarded += 1;
        }
        if state.hw_tx_next != written {
            state.desyncs += 1;
            tracing::warn!(core, parity = written, "doorbell for unexpected TX control cacheline");
        }
        state.hw_tx_next = doorbell;

        let base = self.layout.core_base(core);
        let control = base + self.layout.control_offset(Direction::Tx, written);
        let mut cl = [0u8; CACHELINE_SIZE];
        self.memory.read(control, &mut cl);
        let header = self.codec.decode(&cl);
        if !header.valid {
            return;
        }

        let len = header.length.min(self.layout.payload_capacity());
        let inline = len.min(INLINE_DATA_SIZE);
        let mut payload = inline_window(&cl)[..inline].to_vec();
        let mut overflow = vec![0u8; len - inline];
        if !overflow.is_empty() {
            self.memory
                .read(base + self.layout.overflow_offset(Direction::Tx), &mut overflow);
        }
        payload.extend_from_slice(&overflow);

        // Hardware has taken the line; a second doorbell must not resend it.
        self.memory.write(control, &[0u8; CACHELINE_SIZE]);

        if state.loopback {
            state
                .rx_queue
                .push_back(RawTransaction { control: cl, overflow });
        }
        state.transmitted.push(Packet {
            transaction: header.transaction,
            payload,
        });
    }
}

impl<M: CoherentMemory> CoherentMemory for NicModel<M> {
    fn len(&self) -> usize {
        self.memory.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        if let Some((core, Slot::RxControl(parity))) = self.locate(offset) {
            self.serve_rx(core, parity);
        }
        self.memory.read(offset, dst)
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.memory.write(offset, src)
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        self.memory.ctrl_byte(offset)
    }

    fn touch(&self, offset: usize) {
        if let Some((core, Slot::TxControl(parity))) = self.locate(offset) {
            self.consume_tx(core, parity);
        }
        self.memory.touch(offset)
    }

    fn invalidate_cacheline(&self, offset: usize) {
        self.memory.invalidate_cacheline(offset)
    }
}

impl<M: std::fmt::Debug> std::fmt::Debug for NicModel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NicModel")
            .field("memory", &self.memory)
            .field("cores", &self.cores.len())
            .finish_non_exhaustive()
    }
}
