//! External collaborators of the aperture manager.
//!
//! The manager owns no memory and touches no hardware directly. Physical pages come from a
//! [`PageProvider`], the GART TLB and CPU caches are driven through [`GartHardware`], and the
//! aperture itself is discovered once at startup through an [`ApertureBackend`].

use crate::{BusAddress, PhysicalAddress, VirtualAddress, arch::PAGE_SIZE};

/// A contiguous, zero-filled block of `2^order` pages handed out by a [`PageProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRegion {
    base: VirtualAddress,
    order: u32,
}

impl PageRegion {
    /// Creates a region descriptor.
    pub const fn new(base: VirtualAddress, order: u32) -> Self {
        Self { base, order }
    }

    /// Returns the virtual address of the first page.
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the allocation order.
    pub const fn order(&self) -> u32 {
        self.order
    }

    /// Returns the number of pages in the region.
    pub const fn pages(&self) -> usize {
        1 << self.order
    }

    /// Returns the size of the region in bytes.
    pub const fn size(&self) -> usize {
        self.pages() * PAGE_SIZE
    }

    /// Returns the virtual address of page `index` within the region.
    pub fn page(&self, index: usize) -> VirtualAddress {
        debug_assert!(index < self.pages(), "page index out of region");
        self.base + index * PAGE_SIZE
    }
}

/// Source of physical memory for consistent allocations.
///
/// Implementations must be usable from several callers at once; the manager never serializes
/// calls into the provider.
pub trait PageProvider {
    /// Allocates `2^order` virtually contiguous pages, zero-filled.
    ///
    /// Returns None if the request cannot be satisfied.
    fn alloc_pages(&self, order: u32) -> Option<PageRegion>;

    /// Returns a region previously obtained from [`Self::alloc_pages`].
    fn free_pages(&self, region: PageRegion);

    /// Translates a virtual address inside an allocated region to its physical address.
    ///
    /// Pages of one region are contiguous in virtual memory but may be scattered physically.
    fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress;
}

/// Hardware synchronization primitives.
pub trait GartHardware {
    /// Invalidates the GART translation cache of every northbridge.
    ///
    /// Synchronous and infallible. Table writes made before the call are visible to devices
    /// after it returns.
    fn flush(&self);

    /// Writes back and invalidates CPU caches, making the freshly zeroed table visible to the
    /// northbridge. Issued once at the end of initialization.
    fn write_back_caches(&self);
}

/// Location and size of the aperture, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApertureDescriptor {
    /// Bus address of the first aperture byte.
    pub bus_base: BusAddress,
    /// Size of the whole aperture in bytes.
    pub size: u64,
}

impl ApertureDescriptor {
    /// Creates a descriptor.
    pub const fn new(bus_base: BusAddress, size: u64) -> Self {
        Self { bus_base, size }
    }
}

/// One-time aperture discovery.
pub trait ApertureBackend {
    /// Negotiates the aperture with the AGP backend, which then shares it with the IOMMU.
    fn agp_aperture(&mut self) -> Option<ApertureDescriptor>;

    /// Programs the northbridge directly, without an AGP backend, and returns the aperture.
    fn northbridge_aperture(&mut self) -> Option<ApertureDescriptor>;

    /// Returns the first physical address past the end of RAM.
    fn end_of_memory(&self) -> PhysicalAddress;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_geometry() {
        let region = PageRegion::new(VirtualAddress::new(0x10_0000), 2);
        assert_eq!(region.pages(), 4);
        assert_eq!(region.size(), 4 * PAGE_SIZE);
        assert_eq!(region.page(3), VirtualAddress::new(0x10_0000 + 3 * PAGE_SIZE));
    }
}
