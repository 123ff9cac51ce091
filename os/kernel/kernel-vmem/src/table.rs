use crate::{MapError, PageEntry, PageFlags};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// Entries per table at every level.
pub const ENTRIES: usize = 512;

/// One 4 KiB page-table frame: 512 entries, 4096-byte aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::zero(); ENTRIES],
        }
    }

    /// Mark every entry not-present.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::zero());
    }

    /// # Panics
    /// If `index >= 512`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Overwrite an entry unconditionally.
    ///
    /// # Panics
    /// If `index >= 512`.
    #[inline]
    pub fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    /// Clear an entry and return what it held.
    ///
    /// # Panics
    /// If `index >= 512`.
    #[inline]
    pub fn clear(&mut self, index: usize) -> PageEntry {
        core::mem::replace(&mut self.entries[index], PageEntry::zero())
    }

    /// Install a present entry pointing at `pa` with `flags`.
    ///
    /// # Errors
    /// - [`MapError::InvalidArgument`] if `index` is out of range or `pa` is
    ///   not 4 KiB aligned.
    /// - [`MapError::AlreadyExists`] if the slot is present; the existing
    ///   entry is left untouched.
    pub fn map(&mut self, index: usize, pa: PhysicalAddress, flags: PageFlags) -> Result<(), MapError> {
        if index >= ENTRIES {
            return Err(MapError::InvalidArgument("table index out of range"));
        }
        if !pa.is_aligned_to(Size4K::SIZE) {
            return Err(MapError::InvalidArgument("physical address not page aligned"));
        }
        if self.entries[index].present() {
            return Err(MapError::AlreadyExists);
        }

        self.entries[index] = flags.flags().with_present(true).with_physical_address(pa);
        Ok(())
    }

    /// No entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Iterate `(index, entry)` over present entries.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.present())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_into_present_slot_fails_without_altering_it() {
        let mut table = PageTable::new();
        let flags = PageEntry::kernel_rw();
        table.map(7, PhysicalAddress::new(0x5000), flags).unwrap();
        let before = table.get(7);

        assert_eq!(
            table.map(7, PhysicalAddress::new(0x9000), PageEntry::user_rw()),
            Err(MapError::AlreadyExists)
        );
        assert_eq!(table.get(7), before);
        assert_eq!(table.get(7).physical_address(), PhysicalAddress::new(0x5000));
    }

    #[test]
    fn map_rejects_bad_arguments() {
        let mut table = PageTable::new();
        let flags = PageEntry::kernel_rw();
        assert!(matches!(
            table.map(512, PhysicalAddress::zero(), flags),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.map(0, PhysicalAddress::new(0x1001), flags),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn clear_and_iterate() {
        let mut table = PageTable::new();
        table.map(1, PhysicalAddress::new(0x1000), PageEntry::kernel_rw()).unwrap();
        table.map(300, PhysicalAddress::new(0x2000), PageEntry::kernel_rw()).unwrap();
        let idx: Vec<usize> = table.present_entries().map(|(i, _)| i).collect();
        assert_eq!(idx, vec![1, 300]);

        assert!(table.clear(1).present());
        assert!(!table.clear(1).present());
        table.zero();
        assert!(table.is_empty());
    }
}
