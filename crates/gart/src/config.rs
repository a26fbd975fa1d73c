//! Aperture manager configuration.
//!
//! Configuration is read once, before [`crate::ApertureManager::init`]. It is usually parsed
//! from the kernel command line option `iommu=`, a comma separated list of:
//!
//! - `<size>[k|m|g]`: bytes of the aperture dedicated to translation
//! - `noagp`: skip AGP negotiation and program the northbridge directly
//! - `off`: disable the manager; every device uses physical addresses
//! - `force` / `noforce`: translate every request / only those that need it
//! - `bypass`: never translate, even for devices that cannot reach the memory
//! - `fallback`: on streaming exhaustion, hand out the reserved range instead of failing

use crate::BypassPolicy;

/// Number of aperture pages kept back at the start of the window.
pub const DEFAULT_RESERVED_PAGES: usize = 32;

/// What `map_streaming` does when the aperture has no room left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Return [`crate::ApertureError::OutOfApertureSpace`].
    #[default]
    Fail,
    /// Log and return the bus address of the reserved range.
    ///
    /// The transfer then lands in pages nobody owns. A device write corrupts memory and a
    /// device read transmits garbage. Only for callers that cannot fail a transfer.
    ///
    /// Acts like [`ExhaustionPolicy::Fail`] when no pages are reserved.
    ReservedFallback,
}

/// Settings consumed by aperture initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Skip AGP negotiation and build the table manually.
    pub no_backend: bool,
    /// Never translate anything. The manager starts disabled.
    pub disabled: bool,
    /// Translate every request, even for devices that could reach the memory directly.
    pub force_translate: bool,
    /// Never translate, even for devices that cannot reach the memory.
    pub never_translate: bool,
    /// Bytes of the aperture to dedicate to translation. Chosen from the aperture when None.
    pub iommu_size: Option<u64>,
    /// Aperture pages kept back at the start of the window.
    pub reserved_pages: usize,
    /// Behavior of `map_streaming` on exhaustion.
    pub exhaustion: ExhaustionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            no_backend: false,
            disabled: false,
            force_translate: false,
            never_translate: false,
            iommu_size: None,
            reserved_pages: DEFAULT_RESERVED_PAGES,
            exhaustion: ExhaustionPolicy::Fail,
        }
    }
}

impl Config {
    /// Parses an option string such as `iommu=64m,noagp,force`.
    ///
    /// The `iommu=` prefix is optional. Unknown options are logged and skipped.
    pub fn parse(options: &str) -> Self {
        let mut config = Self::default();
        let options = options.trim();
        let options = options.strip_prefix("iommu=").unwrap_or(options);
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            config.apply(option);
        }
        config
    }

    /// Applies one option to the configuration.
    ///
    /// Returns false if the option was not recognized.
    pub fn apply(&mut self, option: &str) -> bool {
        match option {
            "noagp" => self.no_backend = true,
            "off" => self.disabled = true,
            "force" => self.force_translate = true,
            "noforce" => self.force_translate = false,
            "bypass" => self.never_translate = true,
            "fallback" => self.exhaustion = ExhaustionPolicy::ReservedFallback,
            _ => match parse_size(option) {
                Some(size) => self.iommu_size = Some(size),
                None => {
                    log::warn!("iommu: ignoring unknown option `{option}`");
                    return false;
                }
            },
        }
        true
    }

    /// Returns the bypass policy these settings select.
    pub const fn policy(&self) -> BypassPolicy {
        if self.disabled {
            BypassPolicy::bypass_only()
        } else {
            BypassPolicy::new(self.force_translate, self.never_translate)
        }
    }
}

/// Parses a byte count with an optional binary `k`, `m` or `g` suffix.
fn parse_size(option: &str) -> Option<u64> {
    let split = option
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(option.len());
    let (digits, suffix) = option.split_at(split);
    if digits.is_empty() {
        return None;
    }

    let shift = match suffix {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        _ => return None,
    };
    let value: u64 = digits.parse().ok()?;
    value.checked_mul(1 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.no_backend);
        assert!(!config.disabled);
        assert_eq!(config.iommu_size, None);
        assert_eq!(config.reserved_pages, 32);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Fail);
        assert_eq!(config, Config::parse(""));
    }

    #[test]
    fn parses_flags() {
        let config = Config::parse("iommu=noagp,force,fallback");
        assert!(config.no_backend);
        assert!(config.force_translate);
        assert!(!config.never_translate);
        assert_eq!(config.exhaustion, ExhaustionPolicy::ReservedFallback);
    }

    #[test]
    fn later_options_win() {
        let config = Config::parse("force,noforce");
        assert!(!config.force_translate);
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(Config::parse("iommu=64m").iommu_size, Some(64 << 20));
        assert_eq!(Config::parse("512K").iommu_size, Some(512 << 10));
        assert_eq!(Config::parse("1g").iommu_size, Some(1 << 30));
        assert_eq!(Config::parse("4096").iommu_size, Some(4096));
    }

    #[test]
    fn ignores_unknown_options() {
        let mut config = Config::default();
        assert!(!config.apply("turbo"));
        assert!(!config.apply("12x"));
        assert!(!config.apply("m"));
        assert_eq!(config, Config::default());

        let config = Config::parse(" iommu=bogus, off ");
        assert!(config.disabled);
    }

    #[test]
    fn oversized_number_is_unknown() {
        assert_eq!(Config::parse("99999999999999999999g").iommu_size, None);
    }

    #[test]
    fn policy_follows_flags() {
        assert_eq!(Config::parse("force").policy(), BypassPolicy::new(true, false));
        assert_eq!(Config::parse("bypass").policy(), BypassPolicy::new(false, true));
        assert_eq!(Config::parse("off,force").policy(), BypassPolicy::bypass_only());
    }
}
