//! One-time discovery and setup of the aperture.
//!
//! The aperture is found through the AGP driver if one is present, otherwise by programming the
//! northbridge directly. The IOMMU takes the top of the aperture; with AGP in use the bottom
//! half stays with the AGP driver. The translation table always spans the whole aperture.
//!
//! Nothing here fails hard. Any problem leaves the manager disabled, and devices then get
//! physical addresses.

use crate::{
    Aperture, ApertureBackend, ApertureDescriptor, ApertureManager, BitmapAllocator, Config,
    GartHardware, HumanSize, PageProvider, TranslationTable,
    arch::{EntryFormat, LARGE_PAGE_SIZE, PAGE_SIZE},
    manager::Translation,
    numbers::round_down,
};

/// Windows below this size are usable but warned about.
const SMALL_WINDOW: u64 = 128 << 20;

/// RAM beyond this is out of reach of 32-bit devices.
const LEGACY_DMA_LIMIT: u64 = 1 << 32;

/// How the aperture was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApertureSource {
    /// Negotiated with the AGP driver, which keeps part of it.
    Agp,
    /// Programmed directly into the northbridge. The IOMMU may use all of it.
    Northbridge,
}

/// Asks `backend` for an aperture: AGP first unless `config.no_backend`, then the northbridge.
pub fn discover(
    config: &Config,
    backend: &mut impl ApertureBackend,
) -> Option<(ApertureDescriptor, ApertureSource)> {
    if !config.no_backend {
        if let Some(aperture) = backend.agp_aperture() {
            return Some((aperture, ApertureSource::Agp));
        }
        log::info!("PCI-DMA: disabling AGP");
    }

    log::info!("PCI-DMA: building GART table manually");
    backend
        .northbridge_aperture()
        .map(|aperture| (aperture, ApertureSource::Northbridge))
}

/// Returns how many bytes of `aperture` go to the IOMMU.
///
/// `requested` wins when given. Otherwise the IOMMU gets the whole aperture, or half of it when
/// the AGP driver shares it. The result is rounded down to a large page. Returns None when
/// nothing usable remains.
pub fn iommu_window_size(
    aperture: &ApertureDescriptor,
    source: ApertureSource,
    requested: Option<u64>,
) -> Option<u64> {
    let size = requested.unwrap_or(match source {
        ApertureSource::Agp => aperture.size / 2,
        ApertureSource::Northbridge => aperture.size,
    });
    if size > aperture.size {
        log::warn!(
            "PCI-DMA: requested IOMMU size {} exceeds the {} aperture",
            HumanSize(size),
            HumanSize(aperture.size)
        );
        return None;
    }

    let size = round_down(size, LARGE_PAGE_SIZE);
    if size == 0 {
        log::warn!(
            "PCI-DMA: {} aperture leaves no room for the IOMMU",
            HumanSize(aperture.size)
        );
        return None;
    }
    if size < SMALL_WINDOW {
        log::warn!(
            "PCI-DMA: small IOMMU area {}. Consider increasing the AGP aperture in BIOS",
            HumanSize(size)
        );
    }
    Some(size)
}

impl<P: PageProvider, H: GartHardware> ApertureManager<P, H> {
    /// Discovers the aperture through `backend` and sets up a K8 translation table.
    ///
    /// Returns a disabled manager when the configuration turns translation off, no aperture is
    /// found, or the table cannot be allocated.
    pub fn init(
        config: &Config,
        backend: &mut impl ApertureBackend,
        provider: P,
        hardware: H,
    ) -> Self {
        Self::init_with_format(config, backend, provider, hardware)
    }
}

impl<P, H, F> ApertureManager<P, H, F>
where
    P: PageProvider,
    H: GartHardware,
    F: EntryFormat,
{
    /// Like [`ApertureManager::init`], with entries in format `F`.
    pub fn init_with_format(
        config: &Config,
        backend: &mut impl ApertureBackend,
        provider: P,
        hardware: H,
    ) -> Self {
        if config.disabled {
            log::info!("PCI-DMA: IOMMU disabled by configuration");
            return Self::disabled(provider, hardware, config);
        }

        let Some((descriptor, source)) = discover(config, backend) else {
            if backend.end_of_memory().as_raw() > LEGACY_DMA_LIMIT {
                log::error!(
                    "PCI-DMA: more than 4GB of RAM but no IOMMU; 32bit PCI IO may malfunction"
                );
            }
            log::warn!("PCI-DMA: no aperture found, IOMMU disabled");
            return Self::disabled(provider, hardware, config);
        };

        match Self::build_translation(config, descriptor, source) {
            Some(translation) => {
                let agp_reserved = descriptor.size - translation.aperture.size();
                Self::enabled(translation, agp_reserved, provider, hardware, config)
            }
            None => {
                log::warn!("PCI-DMA: IOMMU disabled");
                Self::disabled(provider, hardware, config)
            }
        }
    }

    fn build_translation(
        config: &Config,
        descriptor: ApertureDescriptor,
        source: ApertureSource,
    ) -> Option<Translation<F>> {
        let iommu_size = iommu_window_size(&descriptor, source, config.iommu_size)?;
        let page_size = PAGE_SIZE as u64;
        let window_start = descriptor.size - iommu_size;
        let window_pages = (iommu_size / page_size) as usize;

        let storage = TranslationTable::try_new((descriptor.size / page_size) as usize)
            .and_then(|table| Ok((table, BitmapAllocator::try_new(window_pages)?)));
        let (table, bitmap) = match storage {
            Ok(storage) => storage,
            Err(err) => {
                log::warn!("PCI-DMA: cannot allocate IOMMU tables: {}", err);
                return None;
            }
        };

        let aperture = Aperture::new(
            descriptor.bus_base + window_start as usize,
            window_pages,
            config.reserved_pages,
        );
        log::info!(
            "PCI-DMA: reserving {} of IOMMU area in the {} aperture at {}",
            HumanSize(iommu_size),
            HumanSize(descriptor.size),
            descriptor.bus_base
        );
        if window_start > 0 {
            log::info!(
                "PCI-DMA: {} at the bottom of the aperture left to AGP",
                HumanSize(window_start)
            );
        }

        Some(Translation {
            aperture,
            bitmap,
            table,
            table_offset: (window_start / page_size) as usize,
        })
    }
}
