use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// One 64-bit x86-64 page-table entry, bit-exact with the hardware format.
///
/// The same layout is used at all four levels. Whether an entry is a leaf
/// depends on the level and on [`huge_page`](Self::huge_page):
///
/// | Bits  | Field              | Meaning |
/// |-------|--------------------|---------|
/// | 0     | `present`          | Entry is valid |
/// | 1     | `writable`         | Writes allowed |
/// | 2     | `user`             | Ring-3 access allowed |
/// | 3     | `write_through`    | PWT |
/// | 4     | `cache_disabled`   | PCD |
/// | 5     | `accessed`         | Set by the CPU on access |
/// | 6     | `dirty`            | Set by the CPU on write (leaf only) |
/// | 7     | `huge_page`        | PS: 1 GiB leaf in a PDPT, 2 MiB leaf in a PD |
/// | 8     | `global`           | Survives CR3 reloads (leaf only) |
/// | 9–11  | `os_available_low` | Ignored by hardware |
/// | 12–51 | frame              | Physical frame number |
/// | 52–58 | `os_available_high`| Ignored by hardware |
/// | 59–62 | `protection_key`   | PKU |
/// | 63    | `no_execute`       | NX |
///
/// The same type doubles as the *flags* argument of mapping calls
/// ([`PageFlags`]); the frame field of a flags value is ignored.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge_page: bool,
    pub global: bool,

    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits 51..=12.
    #[bits(40)]
    frame: u64,

    #[bits(7)]
    pub os_available_high: u8,

    #[bits(4)]
    pub protection_key: u8,

    pub no_execute: bool,
}

/// Permission and caching bits passed to the mapping calls.
pub type PageFlags = PageEntry;

const FRAME_MASK: u64 = (1 << 40) - 1;

impl PageEntry {
    /// A not-present entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_frame((pa.as_u64() >> 12) & FRAME_MASK);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame((pa.as_u64() >> 12) & FRAME_MASK)
    }

    /// The 4 KiB frame the entry points at (child table or first frame of a leaf).
    #[inline]
    #[must_use]
    pub const fn frame_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing(self.physical_address())
    }

    /// The entry with its frame field cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        self.with_frame(0)
    }

    /// Kernel data: present, writable, global, not executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
            .with_no_execute(true)
    }

    /// Kernel code: present, writable, global, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rwx() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
    }

    /// User data: present, writable, user, not executable.
    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_no_execute(true)
    }

    /// Non-leaf link to a child table. Permissions are decided at the leaf,
    /// so links are as permissive as the half of the address space allows.
    #[inline]
    #[must_use]
    pub const fn table_link(user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
    }
}
