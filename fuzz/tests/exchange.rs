//! Bolero fuzzer for the exchange engine against the software FPGA.
//!
//! Properties tested:
//! - Packets are received in injection order with their payload intact
//! - Transmitted payloads reach the wire intact
//! - Oversized transmits are refused without touching memory
//! - A preempted core fails with a bounded, retryable error and recovers
//! - Host and hardware parity stay in step

use bolero::check;
use lauberhorn_fuzz::exchange_model::{ExchangeOp, ExchangeRun};

fn main() {
    check!().with_type::<Vec<ExchangeOp>>().for_each(|ops| {
        let mut run = ExchangeRun::new();
        for op in ops {
            run.apply(*op);
            run.check_invariants();
        }
    });
}
