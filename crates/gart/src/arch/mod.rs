//! Architecture-specific translation entry formats.
//!
//! The allocator and manager are architecture-neutral: they only ever see physical addresses
//! and [`EntryFlags`]. How those are packed into a hardware-visible entry is the job of an
//! [`EntryFormat`]. The AMD K8 northbridge layout is always available; the software layout used
//! by host emulation is only compiled for tests or with the `software-emulation` feature.

mod flags;
mod k8;

#[cfg(any(test, feature = "software-emulation"))]
mod software;

pub use flags::EntryFlags;
pub use k8::K8Format;

#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedBackend, EmulatedHardware, EmulatedPages, SoftwareFormat};

use crate::PhysicalAddress;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Size of an aperture page in bytes (4 KiB), equal to the CPU's base page size.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Size of a large page (2 MiB). The translated part of the aperture ends on this boundary.
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Encoding of a single translation table entry.
///
/// Implementations are pure bit-layout conversions: they never touch the table or the hardware.
/// An all-zero raw value must decode as unmapped, so a freshly zeroed table is empty.
pub trait EntryFormat {
    /// Human-readable name of the format, used in log messages.
    const NAME: &'static str;

    /// Number of physical address bits an entry can express.
    const PHYSICAL_BITS: u32;

    /// Encodes a page-aligned physical address and flags into a raw entry.
    ///
    /// The valid flag is always set in the result. Returns None if the address is not
    /// page-aligned or does not fit in [`Self::PHYSICAL_BITS`].
    fn encode(phys: PhysicalAddress, flags: EntryFlags) -> Option<u64>;

    /// Decodes a raw entry.
    ///
    /// Returns None if the entry is not valid (unmapped).
    fn decode(raw: u64) -> Option<(PhysicalAddress, EntryFlags)>;

    /// Returns whether `phys` can be stored in an entry of this format.
    fn can_encode(phys: PhysicalAddress) -> bool {
        phys.is_aligned(PAGE_SIZE) && phys.as_raw() >> Self::PHYSICAL_BITS == 0
    }
}
