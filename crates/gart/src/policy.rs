//! Per-request decision between translated and direct DMA.

use crate::{ApertureError, PhysicalAddress};

/// Decides whether a DMA request has to go through the aperture.
///
/// A device can reach memory directly when the end of the buffer has no bit set outside its
/// DMA mask. Two global overrides apply on top of that: `force_translate` sends every request
/// through the aperture, and `never_translate` sends none. `never_translate` wins if both are
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BypassPolicy {
    force_translate: bool,
    never_translate: bool,
}

impl BypassPolicy {
    /// Creates a policy with the given overrides.
    pub const fn new(force_translate: bool, never_translate: bool) -> Self {
        Self {
            force_translate,
            never_translate,
        }
    }

    /// Policy of a disabled manager: nothing is ever translated.
    pub const fn bypass_only() -> Self {
        Self::new(false, true)
    }

    /// Returns whether every request is translated.
    pub const fn force_translate(&self) -> bool {
        self.force_translate
    }

    /// Returns whether translation is switched off.
    pub const fn never_translate(&self) -> bool {
        self.never_translate
    }

    /// Returns whether `[phys, phys + size)` lies beyond what `dma_mask` can address.
    pub fn is_out_of_reach(dma_mask: u64, phys: PhysicalAddress, size: usize) -> bool {
        match phys.checked_add(size) {
            Some(end) => end.as_raw() & !dma_mask != 0,
            None => true,
        }
    }

    /// Returns whether a request for `[phys, phys + size)` from a device with `dma_mask` must
    /// be translated.
    ///
    /// Fails with [`ApertureError::Unreachable`] when translation is switched off but the
    /// device cannot reach the memory.
    pub fn needs_translation(
        &self,
        dma_mask: u64,
        phys: PhysicalAddress,
        size: usize,
    ) -> Result<bool, ApertureError> {
        let high = Self::is_out_of_reach(dma_mask, phys, size);
        if self.never_translate {
            if high {
                log::error!(
                    "PCI-DMA: {} bytes at {} beyond DMA mask {:#x} but no IOMMU",
                    size,
                    phys,
                    dma_mask
                );
                return Err(ApertureError::Unreachable(phys));
            }
            return Ok(false);
        }
        Ok(high || self.force_translate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK_32: u64 = 0xffff_ffff;

    #[test]
    fn low_memory_bypasses() {
        let policy = BypassPolicy::default();
        assert_eq!(
            policy.needs_translation(MASK_32, PhysicalAddress::new(0x10_0000), 4096),
            Ok(false)
        );
    }

    #[test]
    fn high_memory_translates() {
        let policy = BypassPolicy::default();
        assert_eq!(
            policy.needs_translation(MASK_32, PhysicalAddress::new(0x1_0000_0000), 4096),
            Ok(true)
        );
    }

    #[test]
    fn buffer_crossing_the_mask_translates() {
        let policy = BypassPolicy::default();
        assert_eq!(
            policy.needs_translation(MASK_32, PhysicalAddress::new(0xffff_f000), 0x2000),
            Ok(true)
        );
    }

    #[test]
    fn full_mask_never_translates() {
        let policy = BypassPolicy::default();
        assert_eq!(
            policy.needs_translation(u64::MAX, PhysicalAddress::new(0x10_0000_0000), 4096),
            Ok(false)
        );
    }

    #[test]
    fn force_translate_overrides() {
        let policy = BypassPolicy::new(true, false);
        assert_eq!(
            policy.needs_translation(u64::MAX, PhysicalAddress::new(0x1000), 16),
            Ok(true)
        );
    }

    #[test]
    fn never_translate_bypasses_reachable_memory() {
        let policy = BypassPolicy::new(true, true);
        assert_eq!(
            policy.needs_translation(MASK_32, PhysicalAddress::new(0x1000), 16),
            Ok(false)
        );
    }

    #[test]
    fn never_translate_rejects_unreachable_memory() {
        let policy = BypassPolicy::bypass_only();
        let phys = PhysicalAddress::new(0x2_0000_0000);
        assert_eq!(
            policy.needs_translation(MASK_32, phys, 16),
            Err(ApertureError::Unreachable(phys))
        );
    }

    #[test]
    fn overflowing_end_is_out_of_reach() {
        assert!(BypassPolicy::is_out_of_reach(
            u64::MAX,
            PhysicalAddress::new(u64::MAX),
            2
        ));
    }
}
