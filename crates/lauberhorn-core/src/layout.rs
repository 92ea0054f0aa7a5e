//! Coherent region layout.
//!
//! Each core owns a fixed window of the FPGA's coherent address space.
//! Within that window the RX and TX directions each have two control
//! cachelines (one per parity) followed by an overflow array, and one
//! cacheline further up carries the worker-control byte.
//!
//! ```text
//! core_base = core * core_stride
//!
//! ┌──────────────────────────────┐ core_base + rx_base
//! │ RX control, parity 0 (128 B) │
//! │ RX control, parity 1 (128 B) │
//! ├──────────────────────────────┤ core_base + rx_base + overflow_offset
//! │ RX overflow[0..N]  (N x 128) │
//! ├──────────────────────────────┤ core_base + tx_base
//! │ TX control, parity 0         │
//! │ TX control, parity 1         │
//! ├──────────────────────────────┤ core_base + tx_base + overflow_offset
//! │ TX overflow[0..N]            │
//! ├──────────────────────────────┤ core_base + worker_ctrl_offset
//! │ worker control (byte 0)      │
//! └──────────────────────────────┘
//! ```
//!
//! Every control cacheline is split in two halves: the control header in
//! bytes `[0, 64)` and the first 64 bytes of payload in `[64, 128)`.

use std::fmt;

/// Size of one coherence unit.
pub const CACHELINE_SIZE: usize = 128;

/// Bytes `[0, CONTROL_HEADER_SIZE)` of a control cacheline hold metadata.
pub const CONTROL_HEADER_SIZE: usize = 64;

/// Payload starts right after the control header.
pub const INLINE_DATA_OFFSET: usize = CONTROL_HEADER_SIZE;

/// Payload bytes that fit in the control cacheline itself.
pub const INLINE_DATA_SIZE: usize = CACHELINE_SIZE - INLINE_DATA_OFFSET;

/// Transfer direction, named from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// FPGA to host.
    Rx,
    /// Host to FPGA.
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("rx"),
            Direction::Tx => f.write_str("tx"),
        }
    }
}

/// Offsets (in bytes) describing one core's window of coherent memory.
///
/// All offsets except `core_stride` are relative to the core base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub rx_base: usize,
    pub tx_base: usize,
    /// Distance from a direction's base to its first overflow cacheline.
    pub overflow_offset: usize,
    pub num_overflow_cachelines: usize,
    pub worker_ctrl_offset: usize,
    /// Distance between consecutive core windows.
    pub core_stride: usize,
}

/// Layout used by the Lauberhorn bitstream on Enzian.
pub const DEFAULT_LAYOUT: RegionLayout = RegionLayout {
    rx_base: 0x0,
    tx_base: 0x1000,
    overflow_offset: 0x100,
    num_overflow_cachelines: 16,
    worker_ctrl_offset: 0xFF80,
    core_stride: 0x10000,
};

const _: () = assert!(DEFAULT_LAYOUT.check().is_ok());

/// Errors from validating a [`RegionLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// An offset is not a multiple of [`CACHELINE_SIZE`].
    Misaligned { field: &'static str, offset: usize },
    /// A region starts before the previous one has ended.
    Overlap {
        field: &'static str,
        offset: usize,
        min: usize,
    },
    /// The backing memory is too small for the configured cores.
    RegionTooSmall { required: usize, found: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Misaligned { field, offset } => {
                write!(f, "{field} at {offset:#x} is not cacheline aligned")
            }
            LayoutError::Overlap { field, offset, min } => write!(
                f,
                "{field} at {offset:#x} overlaps the preceding region (must be >= {min:#x})"
            ),
            LayoutError::RegionTooSmall { required, found } => write!(
                f,
                "coherent region too small: required {required:#x} bytes, found {found:#x}"
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

impl RegionLayout {
    /// Const-evaluable validation. [`RegionLayout::validate`] is the
    /// runtime spelling.
    pub const fn check(&self) -> Result<(), LayoutError> {
        let aligned = [
            ("rx_base", self.rx_base),
            ("tx_base", self.tx_base),
            ("overflow_offset", self.overflow_offset),
            ("worker_ctrl_offset", self.worker_ctrl_offset),
            ("core_stride", self.core_stride),
        ];
        let mut i = 0;
        while i < aligned.len() {
            let (field, offset) = aligned[i];
            if offset % CACHELINE_SIZE != 0 {
                return Err(LayoutError::Misaligned { field, offset });
            }
            i += 1;
        }

        // Both control cachelines come before the overflow array.
        let min = 2 * CACHELINE_SIZE;
        if self.overflow_offset < min {
            return Err(LayoutError::Overlap {
                field: "overflow_offset",
                offset: self.overflow_offset,
                min,
            });
        }

        let min = self.rx_base.saturating_add(self.direction_span());
        if self.tx_base < min {
            return Err(LayoutError::Overlap {
                field: "tx_base",
                offset: self.tx_base,
                min,
            });
        }

        let min = self.tx_base.saturating_add(self.direction_span());
        if self.worker_ctrl_offset < min {
            return Err(LayoutError::Overlap {
                field: "worker_ctrl_offset",
                offset: self.worker_ctrl_offset,
                min,
            });
        }

        let min = self.worker_ctrl_offset.saturating_add(CACHELINE_SIZE);
        if self.core_stride < min {
            return Err(LayoutError::Overlap {
                field: "core_stride",
                offset: self.core_stride,
                min,
            });
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        self.check()
    }

    /// Bytes covered by one direction: two control cachelines plus overflow.
    const fn direction_span(&self) -> usize {
        self.overflow_offset
            .saturating_add(self.num_overflow_cachelines.saturating_mul(CACHELINE_SIZE))
    }

    /// Largest payload a single transaction can carry in either direction.
    #[inline]
    pub const fn payload_capacity(&self) -> usize {
        INLINE_DATA_SIZE.saturating_add(self.num_overflow_cachelines.saturating_mul(CACHELINE_SIZE))
    }

    /// Absolute offset of `core`'s window.
    #[inline]
    pub const fn core_base(&self, core: usize) -> usize {
        core * self.core_stride
    }

    #[inline]
    pub const fn direction_base(&self, dir: Direction) -> usize {
        match dir {
            Direction::Rx => self.rx_base,
            Direction::Tx => self.tx_base,
        }
    }

    /// Offset of the control cacheline for `dir` at `parity`, relative to
    /// the core base.
    #[inline]
    pub const fn control_offset(&self, dir: Direction, parity: bool) -> usize {
        self.direction_base(dir) + parity as usize * CACHELINE_SIZE
    }

    /// Offset of the first overflow cacheline for `dir`, relative to the
    /// core base. Both parities share the same overflow array.
    #[inline]
    pub const fn overflow_offset(&self, dir: Direction) -> usize {
        self.direction_base(dir) + self.overflow_offset
    }

    /// Bytes of coherent memory needed for `num_cores` windows.
    pub fn region_size(&self, num_cores: usize) -> Option<usize> {
        if num_cores == 0 {
            return Some(0);
        }
        self.core_stride
            .checked_mul(num_cores - 1)?
            .checked_add(self.worker_ctrl_offset.checked_add(CACHELINE_SIZE)?)
    }

    /// Check that `found` bytes of memory can hold `num_cores` windows.
    pub fn check_region(&self, num_cores: usize, found: usize) -> Result<(), LayoutError> {
        let required = self.region_size(num_cores).unwrap_or(usize::MAX);
        if found < required {
            return Err(LayoutError::RegionTooSmall { required, found });
        }
        Ok(())
    }

    /// Every cacheline a core touches during an exchange, relative to the
    /// core base. Used to invalidate stale lines at bring-up.
    pub fn exchange_cachelines(&self) -> impl Iterator<Item = usize> + '_ {
        [Direction::Rx, Direction::Tx].into_iter().flat_map(move |dir| {
            let controls = [false, true]
                .into_iter()
                .map(move |parity| self.control_offset(dir, parity));
            let overflow = (0..self.num_overflow_cachelines)
                .map(move |i| self.overflow_offset(dir) + i * CACHELINE_SIZE);
            controls.chain(overflow)
        })
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        DEFAULT_LAYOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_offsets() {
        let layout = RegionLayout::default();
        assert_eq!(layout.payload_capacity(), 64 + 16 * 128);
        assert_eq!(layout.control_offset(Direction::Rx, false), 0x0);
        assert_eq!(layout.control_offset(Direction::Rx, true), 0x80);
        assert_eq!(layout.control_offset(Direction::Tx, true), 0x1080);
        assert_eq!(layout.overflow_offset(Direction::Tx), 0x1100);
        assert_eq!(layout.core_base(3), 0x30000);
    }

    #[test]
    fn region_size_covers_last_worker_ctrl() {
        let layout = RegionLayout::default();
        assert_eq!(layout.region_size(1), Some(0x10000));
        assert_eq!(layout.region_size(2), Some(0x20000));
        assert!(layout.check_region(2, 0x1FFFF).is_err());
        assert!(layout.check_region(2, 0x20000).is_ok());
    }

    #[test]
    fn rejects_misaligned_offsets() {
        let layout = RegionLayout {
            tx_base: 0x1001,
            ..DEFAULT_LAYOUT
        };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::Misaligned {
                field: "tx_base",
                offset: 0x1001
            })
        );
    }

    #[test]
    fn rejects_overflow_running_into_tx() {
        let layout = RegionLayout {
            num_overflow_cachelines: 64,
            ..DEFAULT_LAYOUT
        };
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::Overlap {
                field: "tx_base",
                ..
            })
        ));
    }

    #[test]
    fn rejects_overflow_over_control_lines() {
        let layout = RegionLayout {
            overflow_offset: CACHELINE_SIZE,
            ..DEFAULT_LAYOUT
        };
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::Overlap {
                field: "overflow_offset",
                ..
            })
        ));
    }

    #[test]
    fn exchange_cachelines_are_distinct_and_aligned() {
        let layout = RegionLayout::default();
        let mut lines: Vec<usize> = layout.exchange_cachelines().collect();
        assert_eq!(lines.len(), 2 * (2 + 16));
        assert!(lines.iter().all(|off| off % CACHELINE_SIZE == 0));
        lines.sort_unstable();
        lines.dedup();
        assert_eq!(lines.len(), 2 * (2 + 16));
    }
}
