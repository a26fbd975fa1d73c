//! Byte counts for log lines.

use core::fmt;

/// Formats a byte count with binary prefixes (KiB, MiB, ...).
///
/// Up to two decimals are shown, truncated, with trailing zeros dropped.
///
/// ```
/// use gart::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(4096)), "4KiB");
/// assert_eq!(format!("{}", HumanSize(96 << 20)), "96MiB");
/// assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl From<usize> for HumanSize {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value as u64)
    }
}

impl From<u64> for HumanSize {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

        let mut unit = 0;
        while unit + 1 < UNITS.len() && self.0 >> (10 * (unit + 1)) != 0 {
            unit += 1;
        }
        let shift = 10 * unit as u32;
        let whole = self.0 >> shift;
        let rest = self.0 & ((1u64 << shift) - 1);
        let hundredths = ((rest as u128 * 100) >> shift) as u64;

        if hundredths == 0 {
            write!(f, "{}{}", whole, UNITS[unit])
        } else if hundredths % 10 == 0 {
            write!(f, "{}.{}{}", whole, hundredths / 10, UNITS[unit])
        } else {
            write!(f, "{}.{:02}{}", whole, hundredths, UNITS[unit])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_bytes() {
        assert_eq!(format!("{}", HumanSize(0)), "0B");
        assert_eq!(format!("{}", HumanSize(1023)), "1023B");
    }

    #[test]
    fn formats_whole_units() {
        assert_eq!(format!("{}", HumanSize(1024)), "1KiB");
        assert_eq!(format!("{}", HumanSize(128 << 10)), "128KiB");
        assert_eq!(format!("{}", HumanSize(64 << 20)), "64MiB");
        assert_eq!(format!("{}", HumanSize(4 << 30)), "4GiB");
        assert_eq!(format!("{}", HumanSize(1 << 40)), "1TiB");
    }

    #[test]
    fn formats_fractions() {
        assert_eq!(format!("{}", HumanSize(1536)), "1.5KiB");
        assert_eq!(format!("{}", HumanSize(1280)), "1.25KiB");
        assert_eq!(format!("{}", HumanSize(3 << 29)), "1.5GiB");
    }

    #[test]
    fn truncates_tiny_fractions() {
        assert_eq!(format!("{}", HumanSize(1025)), "1KiB");
    }

    #[test]
    fn formats_largest_values() {
        assert_eq!(format!("{}", HumanSize(u64::MAX)), "15.99EiB");
    }
}
