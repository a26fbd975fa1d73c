//! Errors reported by the aperture manager.

use crate::{BusAddress, PhysicalAddress};

/// Errors that can occur while mapping or unmapping DMA memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApertureError {
    /// The request has a zero length.
    #[error("zero-length DMA mapping")]
    InvalidSize,
    /// The page provider, or table/bitmap storage, could not supply memory.
    #[error("out of memory")]
    OutOfMemory,
    /// No run of free aperture pages is large enough for the request.
    #[error("out of IOMMU aperture space")]
    OutOfApertureSpace,
    /// The device cannot reach the memory directly and translation is not available.
    ///
    /// With translation forced off this means the platform broke its promise that all memory
    /// is reachable by every device.
    #[error("physical address {0} is not reachable by the device without translation")]
    Unreachable(PhysicalAddress),
    /// The entry format cannot express this physical page.
    #[error("physical page {0} cannot be encoded in a GART entry")]
    Unencodable(PhysicalAddress),
    /// Unmap of an aperture page whose entry is already clear.
    #[error("aperture page {index} is not mapped (double free?)")]
    DoubleFree {
        /// Aperture page index of the first unmapped entry.
        index: usize,
    },
    /// The bus address and size reach past the end of the aperture.
    #[error("bus address {0} is outside the aperture")]
    OutOfRange(BusAddress),
}
