//! Software emulation for testing and development.
//!
//! This module provides an entry format and stand-ins for every external collaborator, so the
//! aperture manager can run on any host without a northbridge:
//! - [`SoftwareFormat`] is a flat 64-bit entry layout
//! - [`EmulatedPages`] hands out page regions and records every call
//! - [`EmulatedHardware`] counts flushes and cache write-backs
//! - [`EmulatedBackend`] answers aperture discovery with scripted values
//!
//! None of these touch real memory. Page regions are bookkeeping only, so "zero-filled" holds
//! trivially.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    ApertureBackend, ApertureDescriptor, GartHardware, PageProvider, PageRegion, PhysicalAddress,
    VirtualAddress,
};

use super::{EntryFlags, EntryFormat, PAGE_SIZE};

/// A flat 64-bit entry layout: address bits 12-51 in place, flags in bits 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftwareFormat;

impl SoftwareFormat {
    const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;
}

impl EntryFormat for SoftwareFormat {
    const NAME: &'static str = "software";
    const PHYSICAL_BITS: u32 = 52;

    fn encode(phys: PhysicalAddress, flags: EntryFlags) -> Option<u64> {
        if !Self::can_encode(phys) {
            return None;
        }
        Some((phys.as_raw() & Self::ADDRESS_MASK) | flags.to_raw() | EntryFlags::VALID)
    }

    fn decode(raw: u64) -> Option<(PhysicalAddress, EntryFlags)> {
        let flags = EntryFlags::from_raw(raw);
        flags
            .is_valid()
            .then(|| (PhysicalAddress::new(raw & Self::ADDRESS_MASK), flags))
    }
}

/// Offset between emulated physical pages and the virtual addresses handed out for them.
const DIRECT_MAP_OFFSET: usize = 0x4000_0000_0000;

/// Bookkeeping behind [`EmulatedPages`].
struct PagePool {
    /// Next physical page to hand out when the free list is empty.
    next_phys: u64,
    /// Next virtual address to hand out. Virtual space is never reused.
    next_virt: usize,
    /// Physical pages returned by `free_pages`, reused before `next_phys`.
    free: Vec<u64>,
    /// Physical address backing each live virtual page.
    mapped: BTreeMap<usize, u64>,
}

/// Emulated page provider.
///
/// Hands out physical pages upward from a configurable base, so tests can place memory above
/// or below a device's DMA mask. With [`EmulatedPages::scattered`] consecutive virtual pages
/// are backed by non-adjacent physical pages.
pub struct EmulatedPages {
    pool: spin::Mutex<PagePool>,
    capacity: usize,
    stride: u64,
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl EmulatedPages {
    /// Creates a provider that hands out at most `capacity` pages starting at `phys_base`.
    pub fn new(phys_base: PhysicalAddress, capacity: usize) -> Self {
        let phys_base = phys_base.align_up(PAGE_SIZE);
        Self {
            pool: spin::Mutex::new(PagePool {
                next_phys: phys_base.as_raw(),
                next_virt: DIRECT_MAP_OFFSET + phys_base.as_raw() as usize,
                free: Vec::new(),
                mapped: BTreeMap::new(),
            }),
            capacity,
            stride: PAGE_SIZE as u64,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    /// Like [`EmulatedPages::new`], but leaves a one-page hole between consecutive physical
    /// pages.
    pub fn scattered(phys_base: PhysicalAddress, capacity: usize) -> Self {
        Self {
            stride: 2 * PAGE_SIZE as u64,
            ..Self::new(phys_base, capacity)
        }
    }

    /// Number of successful `alloc_pages` calls.
    pub fn alloc_calls(&self) -> usize {
        self.allocs.load(Ordering::Acquire)
    }

    /// Number of `free_pages` calls.
    pub fn free_calls(&self) -> usize {
        self.frees.load(Ordering::Acquire)
    }

    /// Number of pages currently handed out.
    pub fn outstanding_pages(&self) -> usize {
        self.pool.lock().mapped.len()
    }
}

impl PageProvider for EmulatedPages {
    fn alloc_pages(&self, order: u32) -> Option<PageRegion> {
        let pages = 1usize << order;
        let mut pool = self.pool.lock();
        if pool.mapped.len() + pages > self.capacity {
            return None;
        }

        let base = pool.next_virt;
        pool.next_virt += pages * PAGE_SIZE;
        for index in 0..pages {
            let phys = match pool.free.pop() {
                Some(phys) => phys,
                None => {
                    let phys = pool.next_phys;
                    pool.next_phys += self.stride;
                    phys
                }
            };
            pool.mapped.insert(base + index * PAGE_SIZE, phys);
        }

        self.allocs.fetch_add(1, Ordering::AcqRel);
        Some(PageRegion::new(VirtualAddress::new(base), order))
    }

    fn free_pages(&self, region: PageRegion) {
        let mut pool = self.pool.lock();
        for index in 0..region.pages() {
            match pool.mapped.remove(&region.page(index).as_raw()) {
                Some(phys) => pool.free.push(phys),
                None => log::error!("emulated free of unmapped page {}", region.page(index)),
            }
        }
        self.frees.fetch_add(1, Ordering::AcqRel);
    }

    fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress {
        let page = virt.align_down(PAGE_SIZE);
        let pool = self.pool.lock();
        let phys = pool
            .mapped
            .get(&page.as_raw())
            .copied()
            .unwrap_or(page.as_raw().wrapping_sub(DIRECT_MAP_OFFSET) as u64);
        PhysicalAddress::new(phys + virt.page_offset() as u64)
    }
}

/// Emulated GART hardware that only counts what it is asked to do.
#[derive(Default)]
pub struct EmulatedHardware {
    flushes: AtomicUsize,
    write_backs: AtomicUsize,
}

impl EmulatedHardware {
    /// Creates an emulated northbridge with zeroed counters.
    pub const fn new() -> Self {
        Self {
            flushes: AtomicUsize::new(0),
            write_backs: AtomicUsize::new(0),
        }
    }

    /// Number of GART TLB flushes issued.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    /// Number of cache write-backs issued.
    pub fn write_backs(&self) -> usize {
        self.write_backs.load(Ordering::Acquire)
    }
}

impl GartHardware for EmulatedHardware {
    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    fn write_back_caches(&self) {
        self.write_backs.fetch_add(1, Ordering::AcqRel);
    }
}

/// Emulated aperture discovery with scripted answers.
#[derive(Debug, Clone)]
pub struct EmulatedBackend {
    /// Answer to [`ApertureBackend::agp_aperture`].
    pub agp: Option<ApertureDescriptor>,
    /// Answer to [`ApertureBackend::northbridge_aperture`].
    pub northbridge: Option<ApertureDescriptor>,
    /// Answer to [`ApertureBackend::end_of_memory`].
    pub end_of_memory: PhysicalAddress,
    /// Number of times the AGP backend was asked.
    pub agp_queries: usize,
    /// Number of times the northbridge was probed.
    pub northbridge_queries: usize,
}

impl EmulatedBackend {
    /// Creates a backend whose AGP negotiation reports `aperture`.
    pub fn with_agp(aperture: ApertureDescriptor) -> Self {
        Self {
            agp: Some(aperture),
            ..Self::without_aperture()
        }
    }

    /// Creates a backend where only a direct northbridge probe reports `aperture`.
    pub fn with_northbridge(aperture: ApertureDescriptor) -> Self {
        Self {
            northbridge: Some(aperture),
            ..Self::without_aperture()
        }
    }

    /// Creates a backend that cannot find an aperture at all.
    pub fn without_aperture() -> Self {
        Self {
            agp: None,
            northbridge: None,
            end_of_memory: PhysicalAddress::new(1 << 30),
            agp_queries: 0,
            northbridge_queries: 0,
        }
    }
}

impl ApertureBackend for EmulatedBackend {
    fn agp_aperture(&mut self) -> Option<ApertureDescriptor> {
        self.agp_queries += 1;
        self.agp
    }

    fn northbridge_aperture(&mut self) -> Option<ApertureDescriptor> {
        self.northbridge_queries += 1;
        self.northbridge
    }

    fn end_of_memory(&self) -> PhysicalAddress {
        self.end_of_memory
    }
}
