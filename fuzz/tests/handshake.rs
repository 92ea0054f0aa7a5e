//! Bolero fuzzer for the worker-control handshake.
//!
//! Four actors interleave `try_enter`, exit and parity toggles while the
//! hardware drops and restores `ready`.
//!
//! Properties tested:
//! - At most one actor is inside the critical section
//! - `busy` is set exactly while someone is inside
//! - Parity only moves from inside the critical section
//! - Entries and exits balance once everyone has left

use bolero::check;
use lauberhorn_fuzz::handshake_model::{HandshakeOp, HandshakeRun, Worker};

fn main() {
    check!().with_type::<Vec<HandshakeOp>>().for_each(|ops| {
        let worker = Worker::ready();
        let mut run = HandshakeRun::new(&worker);
        for op in ops {
            run.apply(*op);
            run.check_invariants();
        }
        run.finish();
    });
}
