//! Full memory barrier.

/// Order every earlier load and store against every later one, as seen by
/// the FPGA on the other end of the interconnect.
///
/// On aarch64 (Enzian's ThunderX) this is `dmb sy; isb`. Elsewhere it is a
/// sequentially consistent fence, which is enough for the software models.
#[inline(always)]
pub fn barrier() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: barrier instructions have no operands and no side effects
    // beyond ordering.
    unsafe {
        core::arch::asm!("dmb sy", "isb", options(nostack, preserves_flags));
    }

    #[cfg(not(target_arch = "aarch64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
