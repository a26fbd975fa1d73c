//! The GART translation table.
//!
//! One hardware-visible entry per aperture page. The table itself takes no lock: an entry is
//! only ever written by the caller that holds the matching bitmap pages, so two writers never
//! touch the same entry. Entries are atomics so that shared references are enough to write
//! them, and every write is followed by a [`crate::GartHardware::flush`] issued by the manager.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    ApertureError, PhysicalAddress,
    arch::{EntryFlags, EntryFormat},
};

/// Array of translation entries encoded with format `F`.
pub struct TranslationTable<F: EntryFormat> {
    entries: Box<[AtomicU64]>,
    _format: PhantomData<F>,
}

impl<F: EntryFormat> TranslationTable<F> {
    /// Allocates a zeroed table of `entry_count` entries.
    ///
    /// Returns [`ApertureError::OutOfMemory`] if the storage cannot be allocated.
    pub fn try_new(entry_count: usize) -> Result<Self, ApertureError> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(entry_count)
            .map_err(|_| ApertureError::OutOfMemory)?;
        entries.extend((0..entry_count).map(|_| AtomicU64::new(0)));

        Ok(Self {
            entries: entries.into_boxed_slice(),
            _format: PhantomData,
        })
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `size` entries starting at `start`; entry `i` maps `page(i)`.
    ///
    /// The caller must hold the matching bitmap pages. If any page cannot be encoded, the
    /// entries written so far are cleared again and [`ApertureError::Unencodable`] is returned.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the table.
    pub fn program(
        &self,
        start: usize,
        size: usize,
        coherent: bool,
        page: impl Fn(usize) -> PhysicalAddress,
    ) -> Result<(), ApertureError> {
        let entries = &self.entries[start..start + size];
        let flags = EntryFlags::mapped(coherent);

        for (i, entry) in entries.iter().enumerate() {
            let phys = page(i);
            let Some(raw) = F::encode(phys, flags) else {
                log::error!(
                    "{} GART entry cannot hold physical page {}",
                    F::NAME,
                    phys
                );
                self.clear(start, i);
                return Err(ApertureError::Unencodable(phys));
            };
            entry.store(raw, Ordering::Release);
        }
        Ok(())
    }

    /// Zeroes `size` entries starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the table.
    pub fn clear(&self, start: usize, size: usize) {
        for entry in &self.entries[start..start + size] {
            entry.store(0, Ordering::Release);
        }
    }

    /// Checks that every entry of the range is mapped.
    ///
    /// Returns [`ApertureError::DoubleFree`] naming the first unmapped entry otherwise.
    pub fn check_mapped(&self, start: usize, size: usize) -> Result<(), ApertureError> {
        match (start..start + size).find(|&index| self.entry(index).is_none()) {
            Some(index) => Err(ApertureError::DoubleFree { index }),
            None => Ok(()),
        }
    }

    /// Decodes the entry at `index`. Returns None if it is unmapped or out of range.
    pub fn entry(&self, index: usize) -> Option<(PhysicalAddress, EntryFlags)> {
        self.entries
            .get(index)
            .and_then(|entry| F::decode(entry.load(Ordering::Acquire)))
    }

    /// Returns the raw value of the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn raw(&self, index: usize) -> u64 {
        self.entries[index].load(Ordering::Acquire)
    }

    /// Returns the number of mapped entries.
    pub fn mapped_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| F::decode(entry.load(Ordering::Acquire)).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{K8Format, PAGE_SIZE};

    fn page(base: u64) -> impl Fn(usize) -> PhysicalAddress {
        move |i| PhysicalAddress::new(base + (i * PAGE_SIZE) as u64)
    }

    #[test]
    fn new_table_is_unmapped() {
        let table = TranslationTable::<K8Format>::try_new(16).unwrap();
        assert_eq!(table.len(), 16);
        assert_eq!(table.mapped_entries(), 0);
        assert_eq!(table.entry(0), None);
    }

    #[test]
    fn program_writes_encoded_entries() {
        let table = TranslationTable::<K8Format>::try_new(8).unwrap();
        table.program(1, 3, true, page(0x1_2345_6000)).unwrap();

        assert_eq!(table.raw(0), 0);
        assert_eq!(table.raw(1), 0x2345_6013);
        assert_eq!(table.raw(2), 0x2345_7013);
        assert_eq!(table.raw(3), 0x2345_8013);
        assert_eq!(table.raw(4), 0);

        let (phys, flags) = table.entry(2).unwrap();
        assert_eq!(phys, PhysicalAddress::new(0x1_2345_7000));
        assert!(flags.is_coherent());
    }

    #[test]
    fn clear_zeroes_entries() {
        let table = TranslationTable::<K8Format>::try_new(8).unwrap();
        table.program(0, 4, false, page(0x10_0000)).unwrap();
        table.clear(1, 2);
        assert!(table.entry(0).is_some());
        assert_eq!(table.raw(1), 0);
        assert_eq!(table.raw(2), 0);
        assert!(table.entry(3).is_some());
    }

    #[test]
    fn failed_program_leaves_range_clear() {
        let table = TranslationTable::<K8Format>::try_new(8).unwrap();
        // The third page lies beyond 40 bits.
        let result = table.program(0, 4, true, |i| {
            if i == 2 {
                PhysicalAddress::new(1 << 41)
            } else {
                PhysicalAddress::new(0x1000 * (i as u64 + 1))
            }
        });
        assert_eq!(
            result,
            Err(ApertureError::Unencodable(PhysicalAddress::new(1 << 41)))
        );
        assert_eq!(table.mapped_entries(), 0);
    }

    #[test]
    fn check_mapped_reports_first_hole() {
        let table = TranslationTable::<K8Format>::try_new(8).unwrap();
        table.program(2, 4, true, page(0x20_0000)).unwrap();
        assert_eq!(table.check_mapped(2, 4), Ok(()));
        table.clear(4, 1);
        assert_eq!(
            table.check_mapped(2, 4),
            Err(ApertureError::DoubleFree { index: 4 })
        );
    }

    #[test]
    fn out_of_range_entry_is_none() {
        let table = TranslationTable::<K8Format>::try_new(2).unwrap();
        assert_eq!(table.entry(5), None);
    }
}
