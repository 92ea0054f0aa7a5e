//! Coherent memory backends.
//!
//! The exchange engine never dereferences raw pointers itself. It goes
//! through [`CoherentMemory`], which is implemented for a heap arena (tests,
//! software models) and for a region the caller has already mapped from the
//! device ([`MappedMemory`]).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use lauberhorn_core::CACHELINE_SIZE;

/// Byte-addressed view of the coherent region shared with the FPGA.
///
/// Offsets are absolute within the region. Out-of-range accesses panic,
/// like slice indexing; the engine only issues offsets derived from a
/// layout it has checked against [`CoherentMemory::len`].
pub trait CoherentMemory: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, dst: &mut [u8]);

    fn write(&self, offset: usize, src: &[u8]);

    /// The byte at `offset` as an atomic, for the worker-control handshake.
    fn ctrl_byte(&self, offset: usize) -> &AtomicU8;

    /// Load one byte and discard it. On ECI this is what tells the FPGA
    /// that the host has moved on to the next cacheline.
    fn touch(&self, offset: usize) {
        let mut byte = [0u8; 1];
        self.read(offset, &mut byte);
        std::hint::black_box(byte);
    }

    /// Drop any locally cached copy of the cacheline at `offset`.
    fn invalidate_cacheline(&self, _offset: usize) {}
}

impl<M: CoherentMemory + ?Sized> CoherentMemory for Arc<M> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        (**self).read(offset, dst)
    }

    fn write(&self, offset: usize, src: &[u8]) {
        (**self).write(offset, src)
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        (**self).ctrl_byte(offset)
    }

    fn touch(&self, offset: usize) {
        (**self).touch(offset)
    }

    fn invalidate_cacheline(&self, offset: usize) {
        (**self).invalidate_cacheline(offset)
    }
}

#[inline]
#[track_caller]
fn check_bounds(region: usize, offset: usize, len: usize) {
    let in_bounds = offset.checked_add(len).is_some_and(|end| end <= region);
    assert!(
        in_bounds,
        "access {offset:#x}+{len} outside coherent region of {region:#x} bytes"
    );
}

/// Heap-backed region. Every byte is an [`AtomicU8`] so the hardware side
/// (a model thread) and the host can share it without data races.
pub struct HeapMemory {
    bytes: Box<[AtomicU8]>,
}

impl HeapMemory {
    /// A zeroed region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            bytes: (0..len).map(|_| AtomicU8::new(0)).collect(),
        }
    }
}

impl std::fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapMemory")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl CoherentMemory for HeapMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        check_bounds(self.bytes.len(), offset, dst.len());
        for (d, s) in dst.iter_mut().zip(&self.bytes[offset..]) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        check_bounds(self.bytes.len(), offset, src.len());
        for (s, d) in src.iter().zip(&self.bytes[offset..]) {
            d.store(*s, Ordering::Relaxed);
        }
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        check_bounds(self.bytes.len(), offset, 1);
        &self.bytes[offset]
    }
}

/// A region mapped from the device by the surrounding runtime.
///
/// Mapping (and unmapping) is the caller's business; this type only reads
/// and writes through the pointer it is given.
#[derive(Debug)]
pub struct MappedMemory {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is shared with the FPGA anyway; host-side access is
// serialized by the worker handshake and the control byte is only touched
// through atomics.
unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// # Safety
    ///
    /// - `base` must point to `len` bytes that stay mapped, readable and
    ///   writable for the lifetime of the returned value.
    /// - `base` must be aligned to [`CACHELINE_SIZE`].
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % CACHELINE_SIZE, 0);
        Self { base, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl CoherentMemory for MappedMemory {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        check_bounds(self.len, offset, dst.len());
        // SAFETY: bounds checked above; the region is valid per `from_raw`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        check_bounds(self.len, offset, src.len());
        // SAFETY: as for `read`.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        check_bounds(self.len, offset, 1);
        // SAFETY: in bounds, and AtomicU8 has the same layout as u8.
        unsafe { AtomicU8::from_ptr(self.base.as_ptr().add(offset)) }
    }

    fn touch(&self, offset: usize) {
        check_bounds(self.len, offset, 1);
        // SAFETY: in bounds. Volatile so the load is not elided.
        unsafe {
            std::ptr::read_volatile(self.base.as_ptr().add(offset));
        }
    }
}
