//! Memory wrapper that records every access the engine makes.

use std::ops::Range;
use std::sync::atomic::AtomicU8;

use lauberhorn_transport_eci::CoherentMemory;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { offset: usize, len: usize },
    Write { offset: usize, len: usize },
    Touch { offset: usize },
    Invalidate { offset: usize },
}

impl Access {
    fn bytes_within(offset: usize, len: usize, range: &Range<usize>) -> usize {
        let start = offset.max(range.start);
        let end = (offset + len).min(range.end);
        end.saturating_sub(start)
    }
}

/// Forwards to `M` and logs reads, writes, doorbells and invalidations.
/// Atomic accesses to the worker-control byte are not logged.
#[derive(Debug)]
pub struct TracingMemory<M> {
    inner: M,
    log: Mutex<Vec<Access>>,
}

impl<M> TracingMemory<M> {
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn accesses(&self) -> Vec<Access> {
        self.log.lock().clone()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Bytes written inside `range`.
    pub fn bytes_written(&self, range: Range<usize>) -> usize {
        self.log
            .lock()
            .iter()
            .map(|access| match *access {
                Access::Write { offset, len } => Access::bytes_within(offset, len, &range),
                _ => 0,
            })
            .sum()
    }

    /// Bytes read inside `range`.
    pub fn bytes_read(&self, range: Range<usize>) -> usize {
        self.log
            .lock()
            .iter()
            .map(|access| match *access {
                Access::Read { offset, len } => Access::bytes_within(offset, len, &range),
                _ => 0,
            })
            .sum()
    }

    /// Write accesses that overlap `range`.
    pub fn writes_within(&self, range: Range<usize>) -> Vec<Access> {
        self.log
            .lock()
            .iter()
            .filter(|access| match **access {
                Access::Write { offset, len } => Access::bytes_within(offset, len, &range) > 0,
                _ => false,
            })
            .copied()
            .collect()
    }

    pub fn invalidated(&self) -> Vec<usize> {
        self.log
            .lock()
            .iter()
            .filter_map(|access| match *access {
                Access::Invalidate { offset } => Some(offset),
                _ => None,
            })
            .collect()
    }

    fn record(&self, access: Access) {
        self.log.lock().push(access);
    }
}

impl<M: CoherentMemory> CoherentMemory for TracingMemory<M> {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        self.record(Access::Read {
            offset,
            len: dst.len(),
        });
        self.inner.read(offset, dst)
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.record(Access::Write {
            offset,
            len: src.len(),
        });
        self.inner.write(offset, src)
    }

    fn ctrl_byte(&self, offset: usize) -> &AtomicU8 {
        self.inner.ctrl_byte(offset)
    }

    fn touch(&self, offset: usize) {
        self.record(Access::Touch { offset });
        self.inner.touch(offset)
    }

    fn invalidate_cacheline(&self, offset: usize) {
        self.record(Access::Invalidate { offset });
        self.inner.invalidate_cacheline(offset)
    }
}
