//! lauberhorn-testkit: Conformance test suite for Lauberhorn ECI memory
//! backends.
//!
//! Provides the `MemoryFactory` trait, a software model of the FPGA side of
//! the exchange ([`NicModel`]), a memory wrapper that records every access
//! ([`TracingMemory`]), and shared scenarios every backend must pass.
//!
//! # Usage
//!
//! Each backend implements `MemoryFactory` and runs the shared scenarios:
//!
//! ```ignore
//! use lauberhorn_testkit::{MemoryFactory, TestError};
//!
//! struct MyMemoryFactory;
//!
//! impl MemoryFactory for MyMemoryFactory {
//!     type Memory = MyMemory;
//!
//!     fn create(len: usize) -> Result<Self::Memory, TestError> {
//!         /* allocate or map `len` zeroed bytes */
//!     }
//! }
//!
//! #[test]
//! fn my_memory_loopback_bypass_ethernet() {
//!     lauberhorn_testkit::run_loopback_bypass_ethernet::<MyMemoryFactory>();
//! }
//! ```

use std::ops::Range;
use std::sync::Arc;

use lauberhorn_core::{
    Direction, EncodeError, HeaderKind, InlineBytes, OncRpc, Transaction, TransactionKind,
    CACHELINE_SIZE, ETHERNET_HEADER_LEN, INLINE_DATA_OFFSET, INLINE_DATA_SIZE, IP_HEADER_LEN,
};
use lauberhorn_transport_eci::{
    CoherentMemory, CoreState, EciConfig, EciTransport, ExchangeError, SpinLimit, WorkerCtrl,
};

mod nic_model;
mod trace;

pub use nic_model::{NicModel, Packet, RawTransaction};
pub use trace::{Access, TracingMemory};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Backend or model creation failed.
    Setup(String),
    /// The engine returned an error the scenario did not expect.
    Exchange(ExchangeError),
    /// The model could not encode an injected transaction.
    Encode(EncodeError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Exchange(e) => write!(f, "exchange error: {}", e),
            TestError::Encode(e) => write!(f, "encode error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<ExchangeError> for TestError {
    fn from(e: ExchangeError) -> Self {
        TestError::Exchange(e)
    }
}

impl From<EncodeError> for TestError {
    fn from(e: EncodeError) -> Self {
        TestError::Encode(e)
    }
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(TestError::Assertion(format!($($arg)+)));
        }
    };
}

/// Factory trait for creating coherent memory backends for testing.
pub trait MemoryFactory: 'static {
    /// The backend being tested.
    type Memory: CoherentMemory + 'static;

    /// A zeroed, cacheline-aligned region of at least `len` bytes.
    fn create(len: usize) -> Result<Self::Memory, TestError>;
}

/// Engine over a traced FPGA model over the backend under test. The trace
/// sees exactly what the host does; the model's own accesses bypass it.
pub type Harness<M> = EciTransport<TracingMemory<NicModel<M>>>;

pub fn harness<F: MemoryFactory>(config: EciConfig) -> Result<Harness<F::Memory>, TestError> {
    let len = config
        .layout
        .region_size(config.num_cores)
        .ok_or_else(|| TestError::Setup("region size overflows usize".into()))?;
    let backing = F::create(len)?;
    let model =
        NicModel::with_memory(backing, &config).map_err(|e| TestError::Setup(e.to_string()))?;
    Ok(EciTransport::new(TracingMemory::new(model), config)?)
}

fn overflow_range<M>(t: &Harness<M>, core: usize, dir: Direction) -> Range<usize>
where
    M: CoherentMemory,
{
    let layout = &t.config().layout;
    let start = layout.core_base(core) + layout.overflow_offset(dir);
    start..start + layout.num_overflow_cachelines * CACHELINE_SIZE
}

fn ethernet() -> Transaction {
    let header: Vec<u8> = (0..ETHERNET_HEADER_LEN as u8).collect();
    Transaction::bypass(HeaderKind::Ethernet, &header).unwrap_or(Transaction::Error { tag: 0 })
}

fn transmit_bypass<M: CoherentMemory>(
    t: &Harness<M>,
    state: &mut CoreState,
    transaction: Transaction,
    payload: &[u8],
) -> Result<(), ExchangeError> {
    let mut desc = t.prepare_transmit(state, TransactionKind::Bypass);
    desc.set_transaction(transaction);
    desc.payload_mut().extend_from_slice(payload);
    t.transmit(state, desc)
}

// ============================================================================
// Test scenarios
// ============================================================================

/// Transmit a bypass frame with an Ethernet header and 100 payload bytes,
/// loop it back, and receive it unchanged.
pub fn run_loopback_bypass_ethernet<F: MemoryFactory>() {
    let result = run_loopback_bypass_ethernet_inner::<F>();
    if let Err(e) = result {
        panic!("run_loopback_bypass_ethernet failed: {}", e);
    }
}

fn run_loopback_bypass_ethernet_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    model.set_loopback(0, true);
    let mut state = t.core_state(0)?;

    let sent = ethernet();
    let payload: Vec<u8> = (0..100u32).map(|i| (i * 7) as u8).collect();
    transmit_bypass(&t, &mut state, sent, &payload)?;

    // 100 bytes: 64 inline, 36 in the first overflow cacheline.
    let overflow = t.memory().bytes_written(overflow_range(&t, 0, Direction::Tx));
    ensure!(overflow == 36, "expected 36 overflow bytes written, got {}", overflow);

    let rx = t
        .receive(&mut state)?
        .ok_or_else(|| TestError::Assertion("loopback produced nothing".into()))?;
    ensure!(
        rx.kind() == TransactionKind::Bypass,
        "expected bypass, got {}",
        rx.kind()
    );
    match rx.transaction() {
        Transaction::Bypass(bypass) => {
            ensure!(
                bypass.header_kind == HeaderKind::Ethernet,
                "expected ethernet header, got {:?}",
                bypass.header_kind
            );
            ensure!(*rx.transaction() == sent, "header bytes changed in flight");
        }
        other => return Err(TestError::Assertion(format!("unexpected {:?}", other))),
    }
    ensure!(rx.len() == 100, "expected 100 payload bytes, got {}", rx.len());
    ensure!(rx.payload() == &payload[..], "payload changed in flight");
    t.acknowledge_receive(rx);

    let wire = model.take_transmitted(0);
    ensure!(wire.len() == 1, "expected one packet on the wire, got {}", wire.len());
    ensure!(wire[0].payload == payload, "wire payload differs");
    ensure!(model.desyncs(0) == 0, "host and model parity diverged");
    Ok(())
}

/// Payloads of 63, 64 and 65 bytes round-trip; only the last one touches an
/// overflow cacheline, and exactly one.
pub fn run_inline_boundary_round_trip<F: MemoryFactory>() {
    let result = run_inline_boundary_round_trip_inner::<F>();
    if let Err(e) = result {
        panic!("run_inline_boundary_round_trip failed: {}", e);
    }
}

fn run_inline_boundary_round_trip_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    model.set_loopback(0, true);
    let mut state = t.core_state(0)?;
    let tx_overflow = overflow_range(&t, 0, Direction::Tx);
    let rx_overflow = overflow_range(&t, 0, Direction::Rx);
    let ip = Transaction::bypass(HeaderKind::Ip, &[0x45; IP_HEADER_LEN])
        .ok_or_else(|| TestError::Setup("ip header does not fit".into()))?;

    for len in [INLINE_DATA_SIZE - 1, INLINE_DATA_SIZE, INLINE_DATA_SIZE + 1] {
        t.memory().clear();
        let payload: Vec<u8> = (0..len).map(|i| (i as u8) ^ 0xa5).collect();
        transmit_bypass(&t, &mut state, ip, &payload)?;

        let spill = len.saturating_sub(INLINE_DATA_SIZE);
        let writes = t.memory().writes_within(tx_overflow.clone());
        if spill == 0 {
            ensure!(writes.is_empty(), "len {}: unexpected overflow writes {:?}", len, writes);
        } else {
            ensure!(
                writes
                    == [Access::Write {
                        offset: tx_overflow.start,
                        len: spill
                    }],
                "len {}: expected one write into the first overflow cacheline, got {:?}",
                len,
                writes
            );
        }

        let rx = t
            .receive(&mut state)?
            .ok_or_else(|| TestError::Assertion(format!("len {}: nothing looped back", len)))?;
        ensure!(rx.payload() == &payload[..], "len {}: payload mismatch", len);
        ensure!(*rx.transaction() == ip, "len {}: header mismatch", len);
        t.acknowledge_receive(rx);

        let read = t.memory().bytes_read(rx_overflow.clone());
        ensure!(
            read == spill,
            "len {}: expected {} overflow bytes read, got {}",
            len,
            spill,
            read
        );
    }
    Ok(())
}

/// Consecutive receives and transmits each read the opposite parity of the
/// previous call, in step with the hardware counters.
pub fn run_parity_alternation<F: MemoryFactory>() {
    let result = run_parity_alternation_inner::<F>();
    if let Err(e) = result {
        panic!("run_parity_alternation failed: {}", e);
    }
}

fn run_parity_alternation_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let mut state = t.core_state(0)?;
    let eth = ethernet();

    for i in 0..6u8 {
        model.inject(0, &eth, &[i; 10])?;
    }

    let mut parities = Vec::new();
    for i in 0..6u8 {
        parities.push(state.rx_next_cl());
        let rx = t
            .receive(&mut state)?
            .ok_or_else(|| TestError::Assertion(format!("packet {} missing", i)))?;
        ensure!(rx.payload() == &[i; 10][..], "packet {} out of order", i);
        t.acknowledge_receive(rx);
    }
    ensure!(
        parities.windows(2).all(|w| w[0] != w[1]),
        "rx parity did not alternate: {:?}",
        parities
    );

    for _ in 0..2 {
        let before = state.rx_next_cl();
        ensure!(t.receive(&mut state)?.is_none(), "queue should be drained");
        ensure!(state.rx_next_cl() != before, "empty poll did not toggle parity");
    }
    ensure!(
        model.next_cl(0).0 == state.rx_next_cl(),
        "hardware rx counter out of step"
    );

    for i in 0..4u8 {
        let before = state.tx_next_cl();
        transmit_bypass(&t, &mut state, eth, &[i; 3])?;
        ensure!(state.tx_next_cl() != before, "transmit {} did not toggle parity", i);
        ensure!(
            model.next_cl(0).1 == state.tx_next_cl(),
            "hardware tx counter out of step after transmit {}",
            i
        );
    }
    ensure!(model.take_transmitted(0).len() == 4, "expected 4 packets on the wire");
    ensure!(model.desyncs(0) == 0, "model saw {} desyncs", model.desyncs(0));
    Ok(())
}

/// A payload one byte over capacity is rejected before anything is touched;
/// exactly capacity still goes through.
pub fn run_capacity_rejection<F: MemoryFactory>() {
    let result = run_capacity_rejection_inner::<F>();
    if let Err(e) = result {
        panic!("run_capacity_rejection failed: {}", e);
    }
}

fn run_capacity_rejection_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    model.set_loopback(0, true);
    let mut state = t.core_state(0)?;
    let capacity = t.config().layout.payload_capacity();

    t.memory().clear();
    let oversized = vec![0x11; capacity + 1];
    match transmit_bypass(&t, &mut state, ethernet(), &oversized) {
        Err(ExchangeError::PayloadTooLarge { len, capacity: c })
            if len == capacity + 1 && c == capacity => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected PayloadTooLarge, got {:?}",
                other
            )))
        }
    }
    let accesses = t.memory().accesses();
    ensure!(accesses.is_empty(), "rejected transmit touched memory: {:?}", accesses);
    ensure!(
        t.handshake(0)?.stats().entries == 0,
        "rejected transmit entered the handshake"
    );
    ensure!(!state.tx_next_cl(), "rejected transmit toggled parity");

    let full: Vec<u8> = (0..capacity).map(|i| (i % 251) as u8).collect();
    transmit_bypass(&t, &mut state, ethernet(), &full)?;
    let rx = t
        .receive(&mut state)?
        .ok_or_else(|| TestError::Assertion("full-capacity packet not looped back".into()))?;
    ensure!(rx.payload() == &full[..], "full-capacity payload mismatch");
    t.acknowledge_receive(rx);
    Ok(())
}

/// A tag outside the known set arrives as a present `Error` transaction,
/// distinct from "nothing pending".
pub fn run_unknown_tag<F: MemoryFactory>() {
    let result = run_unknown_tag_inner::<F>();
    if let Err(e) = result {
        panic!("run_unknown_tag failed: {}", e);
    }
}

fn run_unknown_tag_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let mut state = t.core_state(0)?;
    let format = t.config().format;
    let tag = format.ty.max_value();

    let mut control = [0u8; CACHELINE_SIZE];
    format.valid.insert(&mut control, 1);
    format.len.insert(&mut control, 10);
    format.ty.insert(&mut control, tag);
    control[INLINE_DATA_OFFSET..INLINE_DATA_OFFSET + 10].copy_from_slice(&[0xcd; 10]);
    model.inject_raw(
        0,
        RawTransaction {
            control,
            overflow: Vec::new(),
        },
    );

    let rx = t
        .receive(&mut state)?
        .ok_or_else(|| TestError::Assertion("error-tagged transaction dropped".into()))?;
    ensure!(
        *rx.transaction() == Transaction::Error { tag },
        "expected Error {{ tag: {} }}, got {:?}",
        tag,
        rx.transaction()
    );
    ensure!(rx.payload() == &[0xcd; 10][..], "error payload mismatch");
    t.acknowledge_receive(rx);

    ensure!(state.stats().rx_error_tagged == 1, "error tag not counted");
    ensure!(
        t.receive(&mut state)?.is_none(),
        "empty poll after an error transaction must be None"
    );
    Ok(())
}

/// Every branch that enters the handshake leaves it exactly once.
pub fn run_always_exit<F: MemoryFactory>() {
    let result = run_always_exit_inner::<F>();
    if let Err(e) = result {
        panic!("run_always_exit failed: {}", e);
    }
}

fn run_always_exit_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let config = EciConfig {
        rx_buffer_size: 128,
        ..EciConfig::default()
    };
    let t = harness::<F>(config)?;
    let model = t.memory().inner();
    let mut state = t.core_state(0)?;
    let hs = t.handshake(0)?;
    let balanced = |expected: u64, branch: &str| -> Result<(), TestError> {
        let counters = hs.stats();
        ensure!(
            counters.entries == expected && counters.exits == expected,
            "{}: expected {} entries and exits, got {:?}",
            branch,
            expected,
            counters
        );
        ensure!(
            hs.state() == WorkerCtrl::READY,
            "{}: busy left set ({:?})",
            branch,
            hs.state()
        );
        Ok(())
    };

    ensure!(t.receive(&mut state)?.is_none(), "nothing injected yet");
    balanced(1, "empty receive")?;

    model.inject(0, &ethernet(), &[1; 10])?;
    ensure!(t.receive(&mut state)?.is_some(), "valid packet missing");
    balanced(2, "valid receive")?;

    let mut control = [0u8; CACHELINE_SIZE];
    let format = t.config().format;
    format.valid.insert(&mut control, 1);
    format.ty.insert(&mut control, format.ty.max_value());
    model.inject_raw(
        0,
        RawTransaction {
            control,
            overflow: Vec::new(),
        },
    );
    ensure!(t.receive(&mut state)?.is_some(), "error packet missing");
    balanced(3, "error-tagged receive")?;

    model.inject(0, &ethernet(), &[2; 200])?;
    match t.receive(&mut state) {
        Err(ExchangeError::OverflowExceeded {
            len: 200,
            capacity: 128,
        }) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "expected OverflowExceeded, got {:?}",
                other
            )))
        }
    }
    balanced(4, "oversized receive")?;

    let desc = t.prepare_transmit(&mut state, TransactionKind::Error);
    ensure!(
        matches!(
            t.transmit(&mut state, desc),
            Err(ExchangeError::UnsupportedTransmit(_))
        ),
        "error-kind transmit accepted"
    );
    balanced(5, "unsupported transmit")?;

    let too_big = vec![0; t.config().layout.payload_capacity() + 1];
    ensure!(
        transmit_bypass(&t, &mut state, ethernet(), &too_big).is_err(),
        "oversized transmit accepted"
    );
    balanced(5, "oversized transmit")?;

    model.set_ready(0, false);
    ensure!(
        t.receive_with(&mut state, &mut SpinLimit::Attempts(0).budget())
            .is_err(),
        "receive succeeded without ready"
    );
    model.set_ready(0, true);
    balanced(5, "stuck handshake")?;

    ensure!(
        model.unguarded(0) == 0,
        "model saw {} accesses outside a critical section",
        model.unguarded(0)
    );
    Ok(())
}

/// With the hardware never ready, a bounded policy surfaces a retryable
/// error; once ready, the same core state works.
pub fn run_stuck_handshake<F: MemoryFactory>() {
    let result = run_stuck_handshake_inner::<F>();
    if let Err(e) = result {
        panic!("run_stuck_handshake failed: {}", e);
    }
}

fn run_stuck_handshake_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let mut state = t.core_state(0)?;
    model.set_ready(0, false);

    let mut polls = 0;
    let result = t.receive_with(&mut state, &mut |n: u64| {
        polls = n;
        n < 3
    });
    let err = match result {
        Err(err @ ExchangeError::HandshakeStuck { core: 0, attempts: 3 }) => err,
        other => {
            return Err(TestError::Assertion(format!(
                "expected HandshakeStuck after 3 attempts, got {:?}",
                other
            )))
        }
    };
    ensure!(polls == 3, "policy consulted {} times", polls);
    ensure!(err.is_retryable(), "stuck handshake should be retryable");
    ensure!(!state.rx_next_cl(), "parity moved without the handshake");

    model.set_ready(0, true);
    ensure!(t.receive(&mut state)?.is_none(), "nothing was injected");
    ensure!(state.rx_next_cl(), "receive after recovery did not toggle parity");
    Ok(())
}

/// Receive an ONC-RPC call with inline arguments and answer it.
pub fn run_rpc_call_reply<F: MemoryFactory>() {
    let result = run_rpc_call_reply_inner::<F>();
    if let Err(e) = result {
        panic!("run_rpc_call_reply failed: {}", e);
    }
}

fn run_rpc_call_reply_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let mut state = t.core_state(0)?;
    let format = t.config().format;

    let mut words = InlineBytes::zeroed(format.rpc_args_size());
    words.set_word(0, 40);
    words.set_word(1, 2);
    let call = Transaction::OncRpcCall(OncRpc {
        func_ptr: 0xffff_0000_1234_5678,
        xid: 0xabcd,
        words,
    });
    let args: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
    model.inject(0, &call, &args)?;

    let rx = t
        .receive(&mut state)?
        .ok_or_else(|| TestError::Assertion("call not received".into()))?;
    let (xid, sum) = match rx.transaction() {
        Transaction::OncRpcCall(rpc) => {
            ensure!(
                rpc.func_ptr == 0xffff_0000_1234_5678,
                "func_ptr {:#x}",
                rpc.func_ptr
            );
            (rpc.xid, rpc.words.words().take(2).sum::<u32>())
        }
        other => return Err(TestError::Assertion(format!("expected call, got {:?}", other))),
    };
    ensure!(rx.payload() == &args[..], "call arguments mismatch");
    t.acknowledge_receive(rx);

    let mut reply = t.prepare_transmit(&mut state, TransactionKind::OncRpcReply);
    match reply.transaction_mut() {
        Transaction::OncRpcReply(rpc) => {
            rpc.xid = xid;
            rpc.words.set_word(0, sum);
        }
        other => return Err(TestError::Assertion(format!("expected reply, got {:?}", other))),
    }
    reply.payload_mut().extend_from_slice(b"ok");
    t.transmit(&mut state, reply)?;

    let wire = model.take_transmitted(0);
    ensure!(wire.len() == 1, "expected one reply, got {}", wire.len());
    match &wire[0].transaction {
        Transaction::OncRpcReply(rpc) => {
            ensure!(rpc.xid == 0xabcd, "reply xid {:#x}", rpc.xid);
            ensure!(rpc.words.word(0) == Some(42), "reply result {:?}", rpc.words.word(0));
        }
        other => return Err(TestError::Assertion(format!("expected reply, got {:?}", other))),
    }
    ensure!(wire[0].payload == b"ok", "reply payload mismatch");
    Ok(())
}

/// After a restart, resync from the hardware counters and drain whatever
/// the previous run left behind.
pub fn run_bring_up_drains_stale<F: MemoryFactory>() {
    let result = run_bring_up_drains_stale_inner::<F>();
    if let Err(e) = result {
        panic!("run_bring_up_drains_stale failed: {}", e);
    }
}

fn run_bring_up_drains_stale_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let eth = ethernet();

    // A previous run that advanced both counters.
    {
        let mut previous = t.core_state(0)?;
        ensure!(t.receive(&mut previous)?.is_none(), "previous run saw a packet");
        transmit_bypass(&t, &mut previous, eth, &[0; 4])?;
    }
    for i in 0..3u8 {
        model.inject(0, &eth, &[i; 70])?;
    }

    let mut state = t.core_state(0)?;
    let (hw_rx, hw_tx) = model.next_cl(0);
    ensure!(hw_rx && hw_tx, "model counters should have advanced");
    t.resync(&mut state, hw_rx, hw_tx)?;

    t.memory().clear();
    let drained = t.bring_up(&mut state)?;
    ensure!(drained == 3, "expected 3 stale packets, drained {}", drained);
    let layout = &t.config().layout;
    let invalidated = t.memory().invalidated();
    let expected = 2 * (2 + layout.num_overflow_cachelines);
    ensure!(
        invalidated.len() == expected,
        "expected {} invalidations, got {}",
        expected,
        invalidated.len()
    );
    ensure!(model.pending(0) == 0, "stale packets left queued");

    model.inject(0, &eth, &[9; 5])?;
    let rx = t
        .receive(&mut state)?
        .ok_or_else(|| TestError::Assertion("fresh packet after bring-up missing".into()))?;
    ensure!(rx.payload() == &[9; 5][..], "fresh payload mismatch");
    t.acknowledge_receive(rx);

    transmit_bypass(&t, &mut state, eth, &[1; 4])?;
    ensure!(model.desyncs(0) == 0, "resync left host and model out of step");
    Ok(())
}

/// Cores have independent regions, parities and handshakes.
pub fn run_multi_core_isolation<F: MemoryFactory>() {
    let result = run_multi_core_isolation_inner::<F>();
    if let Err(e) = result {
        panic!("run_multi_core_isolation failed: {}", e);
    }
}

fn run_multi_core_isolation_inner<F: MemoryFactory>() -> Result<(), TestError> {
    let t = harness::<F>(EciConfig::with_cores(2))?;
    let model = t.memory().inner();
    let mut core0 = t.core_state(0)?;
    let mut core1 = t.core_state(1)?;

    model.inject(1, &ethernet(), &[1; 90])?;
    ensure!(t.receive(&mut core0)?.is_none(), "core 0 saw core 1's packet");
    let rx = t
        .receive(&mut core1)?
        .ok_or_else(|| TestError::Assertion("core 1 packet missing".into()))?;
    ensure!(rx.payload() == &[1; 90][..], "core 1 payload mismatch");
    t.acknowledge_receive(rx);

    transmit_bypass(&t, &mut core0, ethernet(), &[3; 100])?;
    ensure!(
        model.take_transmitted(1).is_empty(),
        "core 0 transmit landed on core 1"
    );
    ensure!(
        model.take_transmitted(0).len() == 1,
        "core 0 transmit missing"
    );
    ensure!(!core1.tx_next_cl(), "core 1 tx parity moved");

    let c0 = t.handshake(0)?.stats();
    let c1 = t.handshake(1)?.stats();
    ensure!(
        c0.entries == 2 && c1.entries == 1,
        "per-core entries {:?} / {:?}",
        c0,
        c1
    );
    ensure!(
        matches!(t.core_state(2), Err(ExchangeError::InvalidCore { .. })),
        "core 2 is not mapped"
    );

    // Two owners would track parity independently and fall out of step.
    ensure!(
        matches!(t.core_state(0), Err(ExchangeError::CoreInUse { core: 0 })),
        "core 0 claimed twice"
    );
    drop(core1);
    let again = t.synced_core_state(1, model.next_cl(1).0, model.next_cl(1).1)?;
    ensure!(again.rx_next_cl(), "re-claimed core 1 lost hardware parity");
    Ok(())
}

/// Threads sharing one core state through its lock transmit without
/// losing, reordering or duplicating anything.
pub fn run_shared_core_state<F: MemoryFactory>() {
    let result = run_shared_core_state_inner::<F>();
    if let Err(e) = result {
        panic!("run_shared_core_state failed: {}", e);
    }
}

fn run_shared_core_state_inner<F: MemoryFactory>() -> Result<(), TestError> {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 25;

    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    let shared = t.core_state(0)?.into_shared();
    let eth = ethernet();

    std::thread::scope(|s| -> Result<(), TestError> {
        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let t = &t;
                s.spawn(move || -> Result<(), ExchangeError> {
                    for seq in 0..PER_THREAD {
                        let mut state = shared.lock();
                        transmit_bypass(t, &mut state, eth, &[id as u8, seq as u8])?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| TestError::Assertion("transmit thread panicked".into()))??;
        }
        Ok(())
    })?;

    let wire = model.take_transmitted(0);
    ensure!(
        wire.len() == THREADS * PER_THREAD,
        "expected {} packets, got {}",
        THREADS * PER_THREAD,
        wire.len()
    );
    for id in 0..THREADS {
        let seqs: Vec<u8> = wire
            .iter()
            .filter(|p| p.payload[0] == id as u8)
            .map(|p| p.payload[1])
            .collect();
        let expected: Vec<u8> = (0..PER_THREAD as u8).collect();
        ensure!(seqs == expected, "thread {} packets reordered: {:?}", id, seqs);
    }
    ensure!(model.desyncs(0) == 0, "parity diverged under sharing");
    ensure!(model.unguarded(0) == 0, "unguarded access under sharing");
    let tx = shared.lock().stats().tx_transactions;
    ensure!(tx == (THREADS * PER_THREAD) as u64, "stats counted {} transmits", tx);
    Ok(())
}

/// The hardware drops and restores `ready` while the host keeps receiving.
/// Nothing is lost and the handshake stays balanced.
pub fn run_preemption_during_exchange<F: MemoryFactory>() {
    let result = run_preemption_during_exchange_inner::<F>();
    if let Err(e) = result {
        panic!("run_preemption_during_exchange failed: {}", e);
    }
}

fn run_preemption_during_exchange_inner<F: MemoryFactory>() -> Result<(), TestError> {
    const PACKETS: usize = 64;

    let t = harness::<F>(EciConfig::default())?;
    let model = t.memory().inner();
    for i in 0..PACKETS {
        model.inject(0, &ethernet(), &[i as u8; 3])?;
    }
    let mut state = t.core_state(0)?;

    let received = std::thread::scope(|s| -> Result<Vec<u8>, TestError> {
        s.spawn(|| {
            for _ in 0..200 {
                model.set_ready(0, false);
                std::thread::yield_now();
                model.set_ready(0, true);
                std::thread::yield_now();
            }
        });

        let mut got = Vec::with_capacity(PACKETS);
        while got.len() < PACKETS {
            if let Some(rx) = t.receive(&mut state)? {
                got.push(rx.payload()[0]);
                t.acknowledge_receive(rx);
            }
        }
        Ok(got)
    })?;

    let expected: Vec<u8> = (0..PACKETS).map(|i| i as u8).collect();
    ensure!(received == expected, "packets lost or reordered: {:?}", received);
    let counters = t.handshake(0)?.stats();
    ensure!(
        counters.entries == counters.exits,
        "unbalanced handshake {:?}",
        counters
    );
    ensure!(model.desyncs(0) == 0, "parity diverged under preemption");
    ensure!(model.unguarded(0) == 0, "unguarded access under preemption");
    Ok(())
}
