//! AMD K8 northbridge GART entry format.

use crate::PhysicalAddress;

use super::{EntryFlags, EntryFormat};

/// GART entry format of the AMD K8 (Hammer) integrated northbridge.
///
/// Entries are 32 bits wide and address 40 bits of physical memory:
/// - Bit 0: valid
/// - Bit 1: coherent
/// - Bits 2-3: reserved, zero
/// - Bits 4-11: physical address bits 32-39
/// - Bits 12-31: physical address bits 12-31
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct K8Format;

impl K8Format {
    /// Physical address bits 12-31, kept in place.
    const LOW_ADDRESS_MASK: u64 = 0xffff_f000;

    /// Bits 4-11 of the entry, which hold physical address bits 32-39.
    const HIGH_ADDRESS_MASK: u64 = 0xff0;

    /// Distance the high address bits move between the address and the entry.
    const HIGH_ADDRESS_SHIFT: u32 = 28;
}

impl EntryFormat for K8Format {
    const NAME: &'static str = "K8";
    const PHYSICAL_BITS: u32 = 40;

    fn encode(phys: PhysicalAddress, flags: EntryFlags) -> Option<u64> {
        if !Self::can_encode(phys) {
            return None;
        }

        let addr = phys.as_raw();
        let low = addr & Self::LOW_ADDRESS_MASK;
        let high = (addr >> Self::HIGH_ADDRESS_SHIFT) & Self::HIGH_ADDRESS_MASK;
        Some(low | high | flags.to_raw() | EntryFlags::VALID)
    }

    fn decode(raw: u64) -> Option<(PhysicalAddress, EntryFlags)> {
        let flags = EntryFlags::from_raw(raw);
        if !flags.is_valid() {
            return None;
        }

        let low = raw & Self::LOW_ADDRESS_MASK;
        let high = (raw & Self::HIGH_ADDRESS_MASK) << Self::HIGH_ADDRESS_SHIFT;
        Some((PhysicalAddress::new(low | high), flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_low_address() {
        let raw = K8Format::encode(PhysicalAddress::new(0x1234_5000), EntryFlags::mapped(true));
        assert_eq!(raw, Some(0x1234_5003));
    }

    #[test]
    fn encodes_high_address_bits_into_entry() {
        // Bits 32-39 (0x12) land in entry bits 4-11.
        let raw = K8Format::encode(
            PhysicalAddress::new(0x12_3456_7000),
            EntryFlags::mapped(true),
        );
        assert_eq!(raw, Some(0x3456_7123));
    }

    #[test]
    fn non_coherent_entry() {
        let raw = K8Format::encode(PhysicalAddress::new(0xff_ffff_f000), EntryFlags::mapped(false));
        assert_eq!(raw, Some(0xffff_fff1));
    }

    #[test]
    fn encode_always_sets_valid() {
        let raw = K8Format::encode(PhysicalAddress::new(0x1000), EntryFlags::empty());
        assert_eq!(raw, Some(0x1001));
    }

    #[test]
    fn decodes_known_pattern() {
        let (phys, flags) = K8Format::decode(0x3456_7123).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x12_3456_7000));
        assert!(flags.is_valid());
        assert!(flags.is_coherent());
    }

    #[test]
    fn zero_entry_is_unmapped() {
        assert_eq!(K8Format::decode(0), None);
        // Address bits without the valid bit are still unmapped.
        assert_eq!(K8Format::decode(0x1234_5002), None);
    }

    #[test]
    fn rejects_unaligned_address() {
        assert_eq!(
            K8Format::encode(PhysicalAddress::new(0x1234_5010), EntryFlags::mapped(true)),
            None
        );
    }

    #[test]
    fn rejects_address_beyond_40_bits() {
        assert_eq!(
            K8Format::encode(PhysicalAddress::new(1 << 40), EntryFlags::mapped(true)),
            None
        );
    }
}
