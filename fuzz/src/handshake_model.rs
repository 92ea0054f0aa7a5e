//! Several host threads contending for one core's worker-control byte,
//! interleaved one step at a time.
//!
//! Each actor either holds a [`CriticalSection`] or not. The fuzzer picks
//! which actor moves next, and when the hardware drops or restores `ready`.

use std::sync::atomic::AtomicU8;

use lauberhorn_core::Direction;
use lauberhorn_transport_eci::{
    CriticalSection, HandshakeStats, NextCl, WorkerCtrl, WorkerHandshake,
};

/// Actors per run.
pub const ACTORS: usize = 4;

#[derive(Debug, Clone, Copy, bolero::TypeGenerator)]
pub enum HandshakeOp {
    /// One `try_enter` by this actor.
    Enter(u8),
    /// Leave the critical section, if held.
    Exit(u8),
    /// Toggle RX parity from inside the critical section, if held.
    Toggle(u8),
    /// Hardware clears `ready`.
    Preempt,
    /// Hardware sets `ready`.
    Resume,
}

/// The shared control byte and its counters. Lives outside
/// [`HandshakeRun`] so the guards can borrow it.
#[derive(Debug, Default)]
pub struct Worker {
    pub ctrl: AtomicU8,
    pub stats: HandshakeStats,
}

impl Worker {
    pub fn ready() -> Self {
        Self {
            ctrl: AtomicU8::new(WorkerCtrl::READY.bits()),
            stats: HandshakeStats::default(),
        }
    }
}

#[derive(Debug)]
pub struct HandshakeRun<'m> {
    handshake: WorkerHandshake<'m>,
    held: Vec<Option<CriticalSection<'m>>>,
    next_cl: NextCl,
    ready: bool,
    toggles: u64,
}

impl<'m> HandshakeRun<'m> {
    pub fn new(worker: &'m Worker) -> Self {
        Self {
            handshake: WorkerHandshake::new(0, &worker.ctrl, &worker.stats),
            held: (0..ACTORS).map(|_| None).collect(),
            next_cl: NextCl::default(),
            ready: true,
            toggles: 0,
        }
    }

    pub fn apply(&mut self, op: HandshakeOp) {
        match op {
            HandshakeOp::Enter(actor) => {
                let actor = actor as usize % ACTORS;
                if self.held[actor].is_some() {
                    return;
                }
                let anyone = self.holders() > 0;
                let entered = self.handshake.try_enter();
                if entered.is_some() {
                    assert!(self.ready, "entered while not ready");
                    assert!(!anyone, "actor {actor} entered while another held busy");
                } else {
                    assert!(
                        !self.ready || anyone,
                        "actor {actor} refused with ready set and nobody inside"
                    );
                }
                self.held[actor] = entered;
            }
            HandshakeOp::Exit(actor) => {
                if let Some(cs) = self.held[actor as usize % ACTORS].take() {
                    cs.exit();
                }
            }
            HandshakeOp::Toggle(actor) => {
                if let Some(cs) = &self.held[actor as usize % ACTORS] {
                    cs.toggle_parity(&mut self.next_cl, Direction::Rx);
                    self.toggles += 1;
                }
            }
            HandshakeOp::Preempt => {
                self.handshake.set_ready(false);
                self.ready = false;
            }
            HandshakeOp::Resume => {
                self.handshake.set_ready(true);
                self.ready = true;
            }
        }
    }

    pub fn holders(&self) -> usize {
        self.held.iter().filter(|cs| cs.is_some()).count()
    }

    pub fn check_invariants(&self) {
        let holders = self.holders();
        assert!(holders <= 1, "{holders} actors inside the critical section");

        let state = self.handshake.state();
        assert_eq!(
            state.contains(WorkerCtrl::BUSY),
            holders == 1,
            "busy bit {state:?} disagrees with {holders} holders"
        );
        assert_eq!(state.contains(WorkerCtrl::READY), self.ready);

        let counters = self.handshake.stats();
        assert_eq!(counters.in_flight(), holders as u64);
        assert_eq!(self.next_cl.get(Direction::Rx), self.toggles % 2 == 1);
        assert!(!self.next_cl.get(Direction::Tx), "tx parity moved");
    }

    /// Release everything still held and check the byte is back to idle.
    pub fn finish(mut self) {
        for cs in self.held.iter_mut().filter_map(Option::take) {
            cs.exit();
        }
        let state = self.handshake.state();
        assert!(!state.contains(WorkerCtrl::BUSY), "busy left set: {state:?}");
        let counters = self.handshake.stats();
        assert_eq!(counters.entries, counters.exits);
    }
}
