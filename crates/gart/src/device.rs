//! Description of the device a mapping is made for.

use core::fmt;

use crate::PhysicalAddress;

/// A bus-mastering device, as far as DMA mapping is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDevice<'a> {
    name: &'a str,
    slot: &'a str,
    dma_mask: u64,
}

impl<'a> DmaDevice<'a> {
    /// DMA mask assumed for devices that do not report one: 32-bit addressing.
    pub const LEGACY_MASK: u64 = 0xffff_ffff;

    /// Creates a device description.
    pub const fn new(name: &'a str, slot: &'a str, dma_mask: u64) -> Self {
        Self {
            name,
            slot,
            dma_mask,
        }
    }

    /// Creates a description for a device limited to 32-bit DMA.
    pub const fn legacy(name: &'a str, slot: &'a str) -> Self {
        Self::new(name, slot, Self::LEGACY_MASK)
    }

    /// Returns the device name.
    pub const fn name(&self) -> &'a str {
        self.name
    }

    /// Returns the bus slot the device sits in.
    pub const fn slot(&self) -> &'a str {
        self.slot
    }

    /// Returns the mask of physical address bits the device can drive.
    pub const fn dma_mask(&self) -> u64 {
        self.dma_mask
    }

    /// Returns whether the device can reach `phys` without translation.
    pub const fn can_address(&self, phys: PhysicalAddress) -> bool {
        phys.as_raw() & !self.dma_mask == 0
    }
}

impl fmt::Display for DmaDevice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.slot)
    }
}

/// Direction of a streaming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Memory is read by the device.
    ToDevice,
    /// Memory is written by the device.
    FromDevice,
    /// Both.
    Bidirectional,
}

impl DmaDirection {
    /// Returns whether the device writes to memory.
    pub const fn device_writes(self) -> bool {
        matches!(self, Self::FromDevice | Self::Bidirectional)
    }

    /// Returns whether the device reads from memory.
    pub const fn device_reads(self) -> bool {
        matches!(self, Self::ToDevice | Self::Bidirectional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_device_reaches_4g() {
        let dev = DmaDevice::legacy("eth0", "0000:00:03.0");
        assert!(dev.can_address(PhysicalAddress::new(0xffff_f000)));
        assert!(!dev.can_address(PhysicalAddress::new(0x1_0000_0000)));
    }

    #[test]
    fn display_names_slot() {
        let dev = DmaDevice::legacy("eth0", "0000:00:03.0");
        assert_eq!(format!("{dev}"), "eth0[0000:00:03.0]");
    }

    #[test]
    fn directions() {
        assert!(DmaDirection::FromDevice.device_writes());
        assert!(!DmaDirection::FromDevice.device_reads());
        assert!(DmaDirection::ToDevice.device_reads());
        assert!(DmaDirection::Bidirectional.device_reads());
        assert!(DmaDirection::Bidirectional.device_writes());
    }
}
