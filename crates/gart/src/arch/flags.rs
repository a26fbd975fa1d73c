//! Translation entry flags.

/// Flags stored alongside the physical address in a translation entry.
///
/// Both GART formats keep the same two low-order flag bits, so the raw values here are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryFlags(u64);

impl EntryFlags {
    /// Valid bit (bit 0). Set on every mapped entry.
    pub const VALID: u64 = 1 << 0;

    /// Coherent bit (bit 1). The device snoops CPU caches for accesses through this entry.
    pub const COHERENT: u64 = 1 << 1;

    /// Mask covering every flag bit this type knows about.
    pub const MASK: u64 = Self::VALID | Self::COHERENT;

    /// Creates empty flags (entry not valid).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags for a valid mapping with the given coherency.
    pub const fn mapped(coherent: bool) -> Self {
        if coherent {
            Self(Self::VALID | Self::COHERENT)
        } else {
            Self(Self::VALID)
        }
    }

    /// Creates flags from raw entry bits, ignoring anything outside [`Self::MASK`].
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw flag bits.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Returns whether the valid bit is set.
    pub const fn is_valid(self) -> bool {
        (self.0 & Self::VALID) != 0
    }

    /// Returns whether the coherent bit is set.
    pub const fn is_coherent(self) -> bool {
        (self.0 & Self::COHERENT) != 0
    }
}
