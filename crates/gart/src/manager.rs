//! The aperture manager: DMA mapping on top of the bitmap and the translation table.
//!
//! Two kinds of mappings are served. Consistent buffers are allocated here, from the
//! [`PageProvider`], and live until [`ApertureManager::unmap_consistent`]. Streaming mappings
//! translate a buffer the caller already owns for the duration of one transfer. Either kind
//! skips the aperture entirely when the device can reach the memory on its own.
//!
//! Every call works on its own run of aperture pages. The bitmap lock is the only lock taken;
//! table entries of a run are written by the caller that owns the run, then the GART TLB is
//! flushed once before the bus address is returned.

use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    ApertureError, BitmapAllocator, BusAddress, BypassPolicy, Config, DmaDevice, DmaDirection,
    ExhaustionPolicy, GartHardware, HumanSize, PageProvider, PageRegion, PhysicalAddress,
    TranslationTable, VirtualAddress,
    arch::{EntryFormat, K8Format, PAGE_SIZE},
    numbers::{order_for, pages_to_bytes, span_pages},
};

/// The window of bus address space served by translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aperture {
    bus_base: BusAddress,
    page_count: usize,
    reserved_pages: usize,
}

impl Aperture {
    /// Describes a window of `page_count` pages at `bus_base`, whose first `reserved_pages`
    /// pages are never handed out.
    pub const fn new(bus_base: BusAddress, page_count: usize, reserved_pages: usize) -> Self {
        let reserved_pages = if reserved_pages > page_count {
            page_count
        } else {
            reserved_pages
        };
        Self {
            bus_base,
            page_count,
            reserved_pages,
        }
    }

    /// Returns the bus address of the first page.
    pub const fn bus_base(&self) -> BusAddress {
        self.bus_base
    }

    /// Returns the number of pages in the window.
    pub const fn page_count(&self) -> usize {
        self.page_count
    }

    /// Returns the number of pages in the reserved prefix.
    pub const fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }

    /// Returns the window size in bytes.
    pub const fn size(&self) -> u64 {
        pages_to_bytes(self.page_count)
    }

    /// Returns the bus addresses covered by the window.
    pub fn bus_range(&self) -> Range<BusAddress> {
        self.bus_base..self.bus_of(self.page_count)
    }

    /// Returns the page index of `bus`, if it lies inside the window.
    pub fn index_of(&self, bus: BusAddress) -> Option<usize> {
        self.bus_range()
            .contains(&bus)
            .then(|| (bus - self.bus_base) / PAGE_SIZE)
    }

    /// Returns the bus address of page `index`.
    pub fn bus_of(&self, index: usize) -> BusAddress {
        self.bus_base + index * PAGE_SIZE
    }
}

/// A buffer returned by [`ApertureManager::map_consistent`].
///
/// The handle does not free anything when dropped. Pass it back to
/// [`ApertureManager::unmap_consistent`] exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsistentBuffer {
    virt: VirtualAddress,
    bus: BusAddress,
    size: usize,
}

impl ConsistentBuffer {
    /// Rebuilds a handle from the values a driver stored.
    pub const fn from_raw_parts(virt: VirtualAddress, bus: BusAddress, size: usize) -> Self {
        Self { virt, bus, size }
    }

    /// Returns the CPU address of the buffer.
    pub const fn virt(&self) -> VirtualAddress {
        self.virt
    }

    /// Returns the address the device uses.
    pub const fn bus(&self) -> BusAddress {
        self.bus
    }

    /// Returns the size requested by the caller.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the page region backing the buffer.
    pub const fn region(&self) -> PageRegion {
        PageRegion::new(self.virt, order_for(self.size))
    }
}

/// Point-in-time counters of an [`ApertureManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApertureStats {
    /// Consistent buffers mapped through the aperture.
    pub consistent_maps: usize,
    /// Streaming buffers mapped through the aperture.
    pub streaming_maps: usize,
    /// Requests served with physical addresses.
    pub bypassed: usize,
    /// Requests that found no free run.
    pub exhausted: usize,
    /// Aperture pages owned by live mappings.
    pub pages_in_use: usize,
    /// Aperture pages in the window.
    pub total_pages: usize,
    /// Pages in the reserved prefix.
    pub reserved_pages: usize,
    /// Calls into the bitmap allocator.
    pub allocation_attempts: usize,
}

#[derive(Default)]
struct Counters {
    consistent_maps: AtomicUsize,
    streaming_maps: AtomicUsize,
    bypassed: AtomicUsize,
    exhausted: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State of an enabled manager.
pub(crate) struct Translation<F: EntryFormat> {
    pub(crate) aperture: Aperture,
    pub(crate) bitmap: BitmapAllocator,
    pub(crate) table: TranslationTable<F>,
    /// Table index of window page 0. The table may cover more than the window.
    pub(crate) table_offset: usize,
}

impl<F: EntryFormat> Translation<F> {
    fn program(
        &self,
        start: usize,
        pages: usize,
        page: impl Fn(usize) -> PhysicalAddress,
    ) -> Result<(), ApertureError> {
        self.table
            .program(self.table_offset + start, pages, true, page)
    }

    fn check_mapped(&self, start: usize, pages: usize) -> Result<(), ApertureError> {
        self.table
            .check_mapped(self.table_offset + start, pages)
            .map_err(|err| match err {
                ApertureError::DoubleFree { index } => ApertureError::DoubleFree {
                    index: index - self.table_offset,
                },
                other => other,
            })
    }

    fn clear(&self, start: usize, pages: usize) {
        self.table.clear(self.table_offset + start, pages);
    }
}

/// Maps DMA buffers for devices, through the GART aperture when they need it.
///
/// A manager is either enabled, with an aperture and a translation table, or disabled, in which
/// case every request is served with physical addresses and requests a device cannot reach fail
/// with [`ApertureError::Unreachable`].
pub struct ApertureManager<P, H, F: EntryFormat = K8Format> {
    translation: Option<Translation<F>>,
    provider: P,
    hardware: H,
    policy: BypassPolicy,
    exhaustion: ExhaustionPolicy,
    agp_reserved: u64,
    counters: Counters,
}

impl<P: PageProvider, H: GartHardware> ApertureManager<P, H> {
    /// Creates a manager with a K8 table covering exactly `aperture`.
    ///
    /// The reserved prefix comes from `aperture`; everything else from `config`. Returns a
    /// disabled manager if `config` disables translation.
    pub fn new(
        aperture: Aperture,
        provider: P,
        hardware: H,
        config: &Config,
    ) -> Result<Self, ApertureError> {
        Self::with_format(aperture, provider, hardware, config)
    }
}

impl<P, H, F> ApertureManager<P, H, F>
where
    P: PageProvider,
    H: GartHardware,
    F: EntryFormat,
{
    /// Like [`ApertureManager::new`], with entries in format `F`.
    pub fn with_format(
        aperture: Aperture,
        provider: P,
        hardware: H,
        config: &Config,
    ) -> Result<Self, ApertureError> {
        if config.disabled {
            return Ok(Self::disabled(provider, hardware, config));
        }
        if aperture.page_count() == 0 {
            return Err(ApertureError::InvalidSize);
        }

        let translation = Translation {
            aperture,
            bitmap: BitmapAllocator::try_new(aperture.page_count())?,
            table: TranslationTable::try_new(aperture.page_count())?,
            table_offset: 0,
        };
        Ok(Self::enabled(translation, 0, provider, hardware, config))
    }

    /// Creates a manager that never translates.
    pub fn disabled(provider: P, hardware: H, config: &Config) -> Self {
        Self {
            translation: None,
            provider,
            hardware,
            policy: BypassPolicy::bypass_only(),
            exhaustion: config.exhaustion,
            agp_reserved: 0,
            counters: Counters::default(),
        }
    }

    /// Reserves the prefix and makes the zeroed table visible to the northbridge.
    ///
    /// `agp_reserved` bytes at the bottom of the aperture are left to the AGP driver.
    pub(crate) fn enabled(
        translation: Translation<F>,
        agp_reserved: u64,
        provider: P,
        hardware: H,
        config: &Config,
    ) -> Self {
        translation
            .bitmap
            .reserve(0, translation.aperture.reserved_pages());
        hardware.write_back_caches();

        Self {
            translation: Some(translation),
            provider,
            hardware,
            policy: config.policy(),
            exhaustion: config.exhaustion,
            agp_reserved,
            counters: Counters::default(),
        }
    }

    /// Allocates a zeroed buffer of `size` bytes that `device` can access at the returned bus
    /// address.
    ///
    /// The buffer is a power-of-two number of pages. If the device can reach the pages directly
    /// and translation is not forced, the bus address is the physical address.
    pub fn map_consistent(
        &self,
        device: &DmaDevice<'_>,
        size: usize,
    ) -> Result<ConsistentBuffer, ApertureError> {
        if size == 0 {
            return Err(ApertureError::InvalidSize);
        }

        let region = self
            .provider
            .alloc_pages(order_for(size))
            .ok_or(ApertureError::OutOfMemory)?;
        match self.map_region(device, region, size) {
            Ok(bus) => Ok(ConsistentBuffer::from_raw_parts(region.base(), bus, size)),
            Err(err) => {
                self.provider.free_pages(region);
                Err(err)
            }
        }
    }

    fn map_region(
        &self,
        device: &DmaDevice<'_>,
        region: PageRegion,
        size: usize,
    ) -> Result<BusAddress, ApertureError> {
        let first = self.provider.virt_to_phys(region.base());
        if !self.policy.needs_translation(device.dma_mask(), first, size)? {
            match self.contiguous_phys(region) {
                Some(phys) => {
                    bump(&self.counters.bypassed);
                    return Ok(phys.identity_bus());
                }
                // Scattered pages need the aperture to look contiguous.
                None if self.policy.never_translate() => {
                    log::error!(
                        "PCI-DMA: consistent buffer for {} is not physically contiguous",
                        device
                    );
                    return Err(ApertureError::Unreachable(first));
                }
                None => {}
            }
        }

        let Some(translation) = &self.translation else {
            return Err(ApertureError::Unreachable(first));
        };
        let pages = region.pages();
        let Some(start) = translation.bitmap.allocate(pages) else {
            bump(&self.counters.exhausted);
            log::warn!(
                "PCI-DMA: no IOMMU space for {} consistent buffer for {}",
                HumanSize(region.size() as u64),
                device
            );
            return Err(ApertureError::OutOfApertureSpace);
        };

        if let Err(err) =
            translation.program(start, pages, |i| self.provider.virt_to_phys(region.page(i)))
        {
            translation.bitmap.free(start, pages);
            return Err(err);
        }
        self.hardware.flush();

        bump(&self.counters.consistent_maps);
        Ok(translation.aperture.bus_of(start))
    }

    /// Returns the physical base of `region` if its pages are physically contiguous.
    fn contiguous_phys(&self, region: PageRegion) -> Option<PhysicalAddress> {
        let base = self.provider.virt_to_phys(region.base());
        (1..region.pages())
            .all(|i| self.provider.virt_to_phys(region.page(i)) == base + i * PAGE_SIZE)
            .then_some(base)
    }

    /// Releases a buffer obtained from [`Self::map_consistent`].
    ///
    /// The translation entries are validated before anything is torn down. An entry that is
    /// already clear fails the call with [`ApertureError::DoubleFree`] and leaves all state
    /// untouched.
    pub fn unmap_consistent(&self, buffer: ConsistentBuffer) -> Result<(), ApertureError> {
        let region = buffer.region();
        let Some((translation, start)) = self.translation.as_ref().and_then(|translation| {
            translation
                .aperture
                .index_of(buffer.bus())
                .map(|start| (translation, start))
        }) else {
            self.provider.free_pages(region);
            return Ok(());
        };

        let pages = region.pages();
        self.teardown(translation, start, pages, buffer.bus())?;
        self.provider.free_pages(region);
        translation.bitmap.free(start, pages);
        Ok(())
    }

    /// Maps `length` bytes at `phys` for one transfer by `device`.
    ///
    /// Returns the physical address unchanged when the device can reach the buffer. When the
    /// aperture is full, the configured [`ExhaustionPolicy`] decides between an error and the
    /// reserved range.
    pub fn map_streaming(
        &self,
        device: &DmaDevice<'_>,
        phys: PhysicalAddress,
        length: usize,
        direction: DmaDirection,
    ) -> Result<BusAddress, ApertureError> {
        if length == 0 || phys.checked_add(length).is_none() {
            return Err(ApertureError::InvalidSize);
        }
        if !self.policy.needs_translation(device.dma_mask(), phys, length)? {
            bump(&self.counters.bypassed);
            return Ok(phys.identity_bus());
        }
        let Some(translation) = &self.translation else {
            return Err(ApertureError::Unreachable(phys));
        };

        let offset = phys.page_offset();
        let pages = span_pages(offset, length).ok_or(ApertureError::InvalidSize)?;
        let Some(start) = translation.bitmap.allocate(pages) else {
            return self.streaming_exhausted(translation, device, phys, length, direction);
        };

        let first_page = phys.align_down(PAGE_SIZE);
        if let Err(err) = translation.program(start, pages, |i| first_page + i * PAGE_SIZE) {
            translation.bitmap.free(start, pages);
            return Err(err);
        }
        self.hardware.flush();

        bump(&self.counters.streaming_maps);
        let bus = translation.aperture.bus_of(start) + offset;
        log::trace!("PCI-DMA: {} bytes at {} mapped to {} for {}", length, phys, bus, device);
        Ok(bus)
    }

    fn streaming_exhausted(
        &self,
        translation: &Translation<F>,
        device: &DmaDevice<'_>,
        phys: PhysicalAddress,
        length: usize,
        direction: DmaDirection,
    ) -> Result<BusAddress, ApertureError> {
        bump(&self.counters.exhausted);
        log::error!(
            "PCI-DMA: out of IOMMU space for {} bytes at {} for device {}",
            length,
            phys,
            device
        );

        match self.exhaustion {
            ExhaustionPolicy::Fail => Err(ApertureError::OutOfApertureSpace),
            // Without a reserved prefix the fallback address belongs to a live mapping.
            ExhaustionPolicy::ReservedFallback if translation.aperture.reserved_pages() == 0 => {
                log::error!("PCI-DMA: no reserved IOMMU range to fall back to");
                Err(ApertureError::OutOfApertureSpace)
            }
            ExhaustionPolicy::ReservedFallback => {
                let reserved = pages_to_bytes(translation.aperture.reserved_pages());
                if length as u64 > reserved {
                    if direction.device_writes() {
                        log::error!("PCI-DMA: memory will be corrupted");
                    }
                    if direction.device_reads() {
                        log::error!("PCI-DMA: random memory will be DMAed");
                    }
                }
                Ok(translation.aperture.bus_base())
            }
        }
    }

    /// Tears down a mapping made by [`Self::map_streaming`].
    ///
    /// Addresses outside the translated part of the aperture were never translated and are
    /// ignored.
    pub fn unmap_streaming(&self, bus: BusAddress, length: usize) -> Result<(), ApertureError> {
        if length == 0 {
            return Err(ApertureError::InvalidSize);
        }
        let Some(translation) = &self.translation else {
            return Ok(());
        };
        let Some(start) = translation
            .aperture
            .index_of(bus)
            .filter(|&index| index >= translation.aperture.reserved_pages())
        else {
            return Ok(());
        };

        let pages = span_pages(bus.page_offset(), length).ok_or(ApertureError::InvalidSize)?;
        self.teardown(translation, start, pages, bus)?;
        translation.bitmap.free(start, pages);
        Ok(())
    }

    /// Validates and clears the entries of a run, then flushes.
    fn teardown(
        &self,
        translation: &Translation<F>,
        start: usize,
        pages: usize,
        bus: BusAddress,
    ) -> Result<(), ApertureError> {
        if start + pages > translation.aperture.page_count() {
            log::error!("PCI-DMA: unmap of {} pages at {} runs past the aperture", pages, bus);
            return Err(ApertureError::OutOfRange(bus));
        }
        if let Err(err) = translation.check_mapped(start, pages) {
            log::error!("PCI-DMA: unmap of {} pages at {}: {}", pages, bus, err);
            return Err(err);
        }

        translation.clear(start, pages);
        self.hardware.flush();
        Ok(())
    }

    /// Returns the physical address a translated bus address currently points at.
    pub fn translate(&self, bus: BusAddress) -> Option<PhysicalAddress> {
        let translation = self.translation.as_ref()?;
        let index = translation.aperture.index_of(bus)?;
        let (phys, _) = translation.table.entry(translation.table_offset + index)?;
        Some(phys + bus.page_offset())
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> ApertureStats {
        let counters = &self.counters;
        let mut stats = ApertureStats {
            consistent_maps: counters.consistent_maps.load(Ordering::Relaxed),
            streaming_maps: counters.streaming_maps.load(Ordering::Relaxed),
            bypassed: counters.bypassed.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            ..ApertureStats::default()
        };
        if let Some(translation) = &self.translation {
            let reserved = translation.aperture.reserved_pages();
            stats.pages_in_use = translation.bitmap.used_pages().saturating_sub(reserved);
            stats.total_pages = translation.aperture.page_count();
            stats.reserved_pages = reserved;
            stats.allocation_attempts = translation.bitmap.attempts();
        }
        stats
    }

    /// Returns whether requests can be translated.
    pub fn is_enabled(&self) -> bool {
        self.translation.is_some()
    }

    /// Returns the translation window, if enabled.
    pub fn aperture(&self) -> Option<&Aperture> {
        self.translation.as_ref().map(|translation| &translation.aperture)
    }

    /// Returns the bus addresses of the translation window, if enabled.
    pub fn bus_range(&self) -> Option<Range<BusAddress>> {
        self.aperture().map(Aperture::bus_range)
    }

    /// Returns the bytes at the bottom of the aperture left to the AGP driver.
    pub fn agp_reserved_bytes(&self) -> u64 {
        self.agp_reserved
    }

    /// Returns the bypass policy in effect.
    pub fn policy(&self) -> BypassPolicy {
        self.policy
    }

    /// Returns the exhaustion policy in effect.
    pub fn exhaustion_policy(&self) -> ExhaustionPolicy {
        self.exhaustion
    }

    /// Returns the bitmap allocator, if enabled.
    pub fn allocator(&self) -> Option<&BitmapAllocator> {
        self.translation.as_ref().map(|translation| &translation.bitmap)
    }

    /// Returns the translation table, if enabled.
    pub fn table(&self) -> Option<&TranslationTable<F>> {
        self.translation.as_ref().map(|translation| &translation.table)
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the hardware interface.
    pub fn hardware(&self) -> &H {
        &self.hardware
    }
}
