//! lauberhorn-transport-eci: host side of the Lauberhorn cacheline exchange.
//!
//! The FPGA and the host share a region of cache-coherent memory over ECI.
//! There is no DMA engine and no doorbell register: the FPGA learns about
//! new data from the coherence traffic the host generates, and the host
//! learns about incoming packets by reading a control cacheline.
//!
//! # Characteristics
//!
//! - Double-buffered control cachelines per direction, selected by a parity
//!   bit the host tracks in its [`CoreState`]
//! - Up to 64 payload bytes inline, the rest in overflow cachelines
//! - A ready/busy byte ([`WorkerHandshake`]) as the only mutual exclusion,
//!   released by a guard on every path
//! - Explicit full barriers at each ordering point
//!
//! # Exchange
//!
//! ```text
//!  receive                              transmit
//!  ───────                              ────────
//!  barrier                              length check
//!  enter (CAS ready → ready|busy)       barrier
//!  read RX control CL[parity]           enter
//!  decode, barrier                      encode, write overflow + TX CL[parity]
//!  toggle parity                        barrier
//!  copy inline + overflow payload       toggle parity
//!  barrier, clear busy, barrier         read TX CL[!parity]   (doorbell)
//!                                       barrier, clear busy, barrier
//! ```

mod barrier;
mod config;
mod core_state;
mod error;
mod handshake;
mod memory;
mod transport;

pub use barrier::barrier;
pub use config::{ConfigError, EciConfig};
pub use core_state::{CoreState, CoreStats, NextCl, SharedCoreState};
pub use error::ExchangeError;
pub use handshake::{
    CriticalSection, HandshakeCounters, HandshakeStats, SpinBudget, SpinLimit, SpinPolicy,
    WorkerCtrl, WorkerHandshake,
};
pub use memory::{CoherentMemory, HeapMemory, MappedMemory};
pub use transport::{EciTransport, Received, TxDescriptor};
