//! The exchange engine against the software FPGA, driven by arbitrary
//! sequences of injections, receives, transmits and preemptions.
//!
//! Properties checked after every step:
//! - received payloads come out in injection order, unchanged
//! - transmitted payloads reach the wire unchanged
//! - host and hardware parity never diverge
//! - every critical section that was entered has been left
//! - the hardware never sees a control cacheline touched without `busy`

use std::collections::VecDeque;

use lauberhorn_core::{HeaderKind, Transaction, TransactionKind, ETHERNET_HEADER_LEN};
use lauberhorn_testkit::NicModel;
use lauberhorn_transport_eci::{CoreState, EciConfig, EciTransport, ExchangeError, SpinLimit};

/// Failed `try_enter` calls before a preempted core gives up.
const SPIN_ATTEMPTS: u64 = 4;

#[derive(Debug, Clone, Copy, bolero::TypeGenerator)]
pub enum ExchangeOp {
    /// FPGA queues a packet of `len` bytes (reduced modulo capacity).
    Inject { len: u16, fill: u8 },
    Receive,
    /// Host transmits `len` bytes; may exceed capacity by one.
    Transmit { len: u16, fill: u8 },
    Preempt,
    Resume,
}

pub struct ExchangeRun {
    transport: EciTransport<NicModel>,
    state: CoreState,
    capacity: usize,
    header: Transaction,
    expected_rx: VecDeque<Vec<u8>>,
    ready: bool,
}

impl ExchangeRun {
    pub fn new() -> Self {
        let config = EciConfig {
            spin: SpinLimit::Attempts(SPIN_ATTEMPTS),
            ..EciConfig::default()
        };
        let model = NicModel::new(&config).expect("default config is valid");
        let transport = EciTransport::new(model, config).expect("model region fits");
        let state = transport.core_state(0).expect("core 0 exists");
        let header: Vec<u8> = (0..ETHERNET_HEADER_LEN as u8).collect();
        Self {
            capacity: transport.config().layout.payload_capacity(),
            state,
            transport,
            header: Transaction::bypass(HeaderKind::Ethernet, &header)
                .expect("ethernet header fits"),
            expected_rx: VecDeque::new(),
            ready: true,
        }
    }

    fn model(&self) -> &NicModel {
        self.transport.memory()
    }

    pub fn apply(&mut self, op: ExchangeOp) {
        match op {
            ExchangeOp::Inject { len, fill } => {
                let len = len as usize % (self.capacity + 1);
                let payload = vec![fill; len];
                self.model()
                    .inject(0, &self.header, &payload)
                    .expect("in-capacity injection encodes");
                self.expected_rx.push_back(payload);
            }
            ExchangeOp::Receive => {
                let before = self.state.rx_next_cl();
                match self.transport.receive(&mut self.state) {
                    Ok(Some(rx)) => {
                        assert!(self.ready, "received while preempted");
                        let expected = self
                            .expected_rx
                            .pop_front()
                            .expect("received with nothing injected");
                        assert_eq!(rx.payload(), &expected[..], "payload changed");
                        assert_eq!(*rx.transaction(), self.header);
                        self.transport.acknowledge_receive(rx);
                    }
                    Ok(None) => {
                        assert!(self.ready, "polled while preempted");
                        assert!(self.expected_rx.is_empty(), "pending packet not seen");
                    }
                    Err(ExchangeError::HandshakeStuck { attempts, .. }) => {
                        assert!(!self.ready, "stuck while ready");
                        assert_eq!(attempts, SPIN_ATTEMPTS + 1);
                        assert_eq!(self.state.rx_next_cl(), before, "parity moved while stuck");
                    }
                    Err(e) => panic!("unexpected receive error: {e}"),
                }
            }
            ExchangeOp::Transmit { len, fill } => {
                let len = len as usize % (self.capacity + 2);
                let before = self.state.tx_next_cl();
                let mut desc = self
                    .transport
                    .prepare_transmit(&mut self.state, TransactionKind::Bypass);
                desc.set_transaction(self.header);
                desc.payload_mut().resize(len, fill);

                match self.transport.transmit(&mut self.state, desc) {
                    Ok(()) => {
                        assert!(self.ready && len <= self.capacity);
                        let wire = self.model().take_transmitted(0);
                        assert_eq!(wire.len(), 1);
                        assert_eq!(wire[0].payload.len(), len);
                        assert!(wire[0].payload.iter().all(|&b| b == fill));
                    }
                    Err(ExchangeError::PayloadTooLarge { len: rejected, .. }) => {
                        assert_eq!(rejected, len);
                        assert!(len > self.capacity);
                        assert_eq!(self.state.tx_next_cl(), before);
                    }
                    Err(ExchangeError::HandshakeStuck { .. }) => {
                        assert!(!self.ready, "stuck while ready");
                        assert_eq!(self.state.tx_next_cl(), before);
                    }
                    Err(e) => panic!("unexpected transmit error: {e}"),
                }
                assert!(self.model().take_transmitted(0).is_empty());
            }
            ExchangeOp::Preempt => {
                self.model().set_ready(0, false);
                self.ready = false;
            }
            ExchangeOp::Resume => {
                self.model().set_ready(0, true);
                self.ready = true;
            }
        }
    }

    pub fn check_invariants(&self) {
        let model = self.model();
        assert_eq!(model.desyncs(0), 0, "host and hardware parity diverged");
        assert_eq!(model.unguarded(0), 0, "control cacheline touched without busy");
        assert_eq!(
            model.next_cl(0),
            (self.state.rx_next_cl(), self.state.tx_next_cl())
        );
        assert_eq!(model.pending(0), self.expected_rx.len());

        let handshake = self.transport.handshake(0).expect("core 0 exists");
        assert_eq!(handshake.stats().in_flight(), 0);
    }
}

impl Default for ExchangeRun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_then_receive_in_order() {
        let mut run = ExchangeRun::new();
        run.apply(ExchangeOp::Inject { len: 10, fill: 1 });
        run.apply(ExchangeOp::Inject { len: 300, fill: 2 });
        for _ in 0..3 {
            run.apply(ExchangeOp::Receive);
            run.check_invariants();
        }
    }

    #[test]
    fn preempted_core_recovers() {
        let mut run = ExchangeRun::new();
        run.apply(ExchangeOp::Inject { len: 64, fill: 7 });
        run.apply(ExchangeOp::Preempt);
        run.apply(ExchangeOp::Receive);
        run.apply(ExchangeOp::Transmit { len: 65, fill: 3 });
        run.check_invariants();

        run.apply(ExchangeOp::Resume);
        run.apply(ExchangeOp::Receive);
        run.apply(ExchangeOp::Transmit { len: 65, fill: 3 });
        run.check_invariants();
    }

    #[test]
    fn oversized_transmit_is_rejected() {
        let mut run = ExchangeRun::new();
        let len = (run.capacity + 1) as u16;
        run.apply(ExchangeOp::Transmit { len, fill: 0 });
        run.check_invariants();
    }
}
