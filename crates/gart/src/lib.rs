#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris GART Aperture Manager
//!
//! DMA address translation through the AGP aperture of AMD K8 class northbridges. Devices that
//! can only drive 32 address bits reach memory above 4 GiB through a window of bus addresses
//! whose pages are remapped by the GART. This crate provides:
//!
//! - A next-fit bitmap allocator for aperture pages.
//! - The translation table and its hardware entry formats.
//! - Consistent (long-lived, allocated here) and streaming (per-transfer) DMA mappings that
//!   skip translation whenever the device can reach the memory directly.
//! - One-time aperture discovery and `iommu=` option parsing.
//! - Software emulation of the page provider, northbridge and aperture discovery for testing
//!   in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod bitmap;
mod config;
mod device;
mod error;
mod human_size;
mod init;
mod manager;
mod numbers;
mod platform;
mod policy;
mod table;

pub use address::{BusAddress, PhysicalAddress, VirtualAddress};
pub use bitmap::BitmapAllocator;
pub use config::{Config, DEFAULT_RESERVED_PAGES, ExhaustionPolicy};
pub use device::{DmaDevice, DmaDirection};
pub use error::ApertureError;
pub use human_size::HumanSize;
pub use init::{ApertureSource, discover, iommu_window_size};
pub use manager::{Aperture, ApertureManager, ApertureStats, ConsistentBuffer};
pub use platform::{ApertureBackend, ApertureDescriptor, GartHardware, PageProvider, PageRegion};
pub use policy::BypassPolicy;
pub use table::TranslationTable;

pub use arch::{EntryFlags, EntryFormat, K8Format, LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedBackend, EmulatedHardware, EmulatedPages, SoftwareFormat};
