//! Address types used on both sides of the aperture.
//!
//! Three address spaces meet in the GART: the CPU's virtual addresses (what the page provider
//! hands back for consistent buffers), physical addresses (what translation entries point at)
//! and bus addresses (what a device is told to DMA to). Keeping them as distinct newtypes makes
//! it impossible to hand a physical address to a device by accident on the translated path.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch::PAGE_SIZE;

/// Macro to define common address type functionality.
///
/// Generates the newtype plus alignment helpers, formatting, and offset arithmetic shared by
/// every address space.
macro_rules! impl_address_common {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: $repr) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_raw(self) -> $repr {
                self.0
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                (self.0 as usize) & (PAGE_SIZE - 1)
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align as $repr - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align as $repr - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align as $repr - 1) & !(align as $repr - 1))
            }

            /// Returns the address with `bytes` added, or None on overflow.
            #[inline]
            pub const fn checked_add(self, bytes: usize) -> Option<Self> {
                match self.0.checked_add(bytes as $repr) {
                    Some(addr) => Some(Self(addr)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<$repr> for $name {
            #[inline]
            fn from(addr: $repr) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs as $repr)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs as $repr)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                (self.0 - rhs.0) as usize
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    u64,
    "A physical memory address.\n\n\
     Physical addresses are always 64 bits wide, independent of the host pointer width, since\n\
     device DMA masks are expressed against them."
);

impl_address_common!(
    BusAddress,
    u64,
    "An address as seen by a bus-mastering device.\n\n\
     Inside the aperture a bus address is translated by the GART; outside it, bus and physical\n\
     addresses are identical (the bypass case)."
);

impl_address_common!(
    VirtualAddress,
    usize,
    "A CPU virtual address, as returned by the page provider for consistent buffers."
);

impl PhysicalAddress {
    /// Returns the bus address a device uses to reach this memory without translation.
    #[inline]
    pub const fn identity_bus(self) -> BusAddress {
        BusAddress::new(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_offset() {
        let addr = PhysicalAddress::new(3 * PAGE_SIZE as u64 + 100);
        assert_eq!(addr.page_offset(), 100);
        assert_eq!(addr.align_down(PAGE_SIZE).as_raw(), 3 * PAGE_SIZE as u64);
    }

    #[test]
    fn align_up() {
        let addr = BusAddress::new(1);
        assert_eq!(addr.align_up(PAGE_SIZE).as_raw(), PAGE_SIZE as u64);
        assert_eq!(
            BusAddress::new(PAGE_SIZE as u64).align_up(PAGE_SIZE).as_raw(),
            PAGE_SIZE as u64
        );
    }

    #[test]
    fn is_aligned() {
        assert!(PhysicalAddress::new(0x2000).is_aligned(0x1000));
        assert!(!PhysicalAddress::new(0x2010).is_aligned(0x1000));
    }

    #[test]
    fn checked_add_overflow() {
        assert_eq!(PhysicalAddress::new(u64::MAX).checked_add(1), None);
        assert_eq!(
            PhysicalAddress::new(0x1000).checked_add(0x10),
            Some(PhysicalAddress::new(0x1010))
        );
    }

    #[test]
    fn difference() {
        let a = BusAddress::new(0x5000);
        let b = BusAddress::new(0x2000);
        assert_eq!(a - b, 0x3000);
    }

    #[test]
    fn identity_bus_keeps_address() {
        let phys = PhysicalAddress::new(0x1234_5000);
        assert_eq!(phys.identity_bus(), BusAddress::new(0x1234_5000));
    }

    #[test]
    fn formatting() {
        let addr = PhysicalAddress::new(0x1000);
        assert_eq!(format!("{}", addr), "0x1000");
        assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
    }
}
