//! Conformance scenarios against both memory backends.

use std::ptr::NonNull;
use std::sync::atomic::AtomicU8;

use lauberhorn_core::CACHELINE_SIZE;
use lauberhorn_testkit::{MemoryFactory, TestError};
use lauberhorn_transport_eci::{CoherentMemory, HeapMemory, MappedMemory};

struct HeapFactory;

impl MemoryFactory for HeapFactory {
    type Memory = HeapMemory;

    fn create(len: usize) -> Result<Self::Memory, TestError> {
        Ok(HeapMemory::new(len))
    }
}

#[repr(C, align(128))]
struct Line([u8; CACHELINE_SIZE]);

/// Cacheline-aligned heap allocation handed to [`MappedMemory`] as if it
/// had been mapped from the device.
#[derive(Debug)]
struct OwnedMapping {
    memory: MappedMemory,
    lines: usize,
}

impl OwnedMapping {
    fn new(len: usize) -> Self {
        let lines = len.div_ceil(CACHELINE_SIZE);
        let backing: Box<[Line]> = (0..lines).map(|_| Line([0; CACHELINE_SIZE])).collect();
        let base = NonNull::from(Box::leak(backing)).cast::<u8>();
        // SAFETY: `base` owns `lines` aligned cachelines until `drop`.
        let memory = unsafe { MappedMemory::from_raw(base, lines * CACHELINE_SIZE) };
        Self { memory, lines }
    }
}

impl Drop for OwnedMapping {
    fn drop(&mut self) {
        let lines = std::ptr::slice_from_raw_parts_mut(self.memory.as_ptr().cast::<Line>(), self.lines);
        // SAFETY: reconstructs the box leaked in `new`.
        drop(unsafe { Box::from_raw(lines) });
    }
}

impl CoherentMemory for OwnedMapping {
    fn len(&self) -> usize {
        self.memory.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        self.memory.read(offset, dst)
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.memory.write(offset, src)
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        self.memory.ctrl_byte(offset)
    }

    fn touch(&self, offset: usize) {
        self.memory.touch(offset)
    }

    fn invalidate_cacheline(&self, offset: usize) {
        self.memory.invalidate_cacheline(offset)
    }
}

struct MappedFactory;

impl MemoryFactory for MappedFactory {
    type Memory = OwnedMapping;

    fn create(len: usize) -> Result<Self::Memory, TestError> {
        if len == 0 {
            return Err(TestError::Setup("empty mapping".into()));
        }
        Ok(OwnedMapping::new(len))
    }
}

macro_rules! conformance {
    ($($scenario:ident),* $(,)?) => {
        mod heap {
            $(
                #[test]
                fn $scenario() {
                    lauberhorn_testkit::$scenario::<super::HeapFactory>();
                }
            )*
        }

        mod mapped {
            $(
                #[test]
                fn $scenario() {
                    lauberhorn_testkit::$scenario::<super::MappedFactory>();
                }
            )*
        }
    };
}

conformance!(
    run_loopback_bypass_ethernet,
    run_inline_boundary_round_trip,
    run_parity_alternation,
    run_capacity_rejection,
    run_unknown_tag,
    run_always_exit,
    run_stuck_handshake,
    run_rpc_call_reply,
    run_bring_up_drains_stale,
    run_multi_core_isolation,
    run_shared_core_state,
    run_preemption_during_exchange,
);
