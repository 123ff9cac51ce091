//! # Virtual Memory Support
//!
//! x86-64 paging for the kernel: page-table entries, the four-level table
//! walk, per-address-space virtual range bookkeeping and the kernel's fixed
//! address windows.
//!
//! ## What you get
//! - [`PageEntry`], a bitfield over one 64-bit table entry, with the usual
//!   presets ([`PageEntry::kernel_rw`], [`PageEntry::user_rw`], ...).
//! - A 4 KiB-aligned [`PageTable`] of 512 entries and the [`PageLevel`]s.
//! - An [`AddressSpace`] that maps, unmaps and translates through a `PML4`
//!   root and reserves virtual ranges via [`VirtualRangeAlloc`].
//! - The two seams to the rest of the kernel: [`FrameAlloc`] hands out
//!   frames for tables, [`PhysMapper`] makes a frame addressable.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E (never a leaf)
//! ```
//!
//! - A **leaf entry** maps physical memory directly: a PTE always, a PDE or
//!   PDPTE when its `PS` bit ([`PageEntry::huge_page`]) is set.
//! - A **non-leaf entry** points to the next lower table and continues the walk.
//!
//! Bits 63..48 of a canonical address repeat bit 47, which splits the space
//! into a user half below `0x0000_8000_0000_0000` and a kernel half from
//! `0xFFFF_8000_0000_0000`. See [`info`] for the windows carved out of it.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
mod entry;
mod level;
pub mod ranges;
mod table;
pub mod tlb;

pub use crate::address_space::{AddressSpace, KernelLayout, RootPage, Translation};
pub use crate::entry::{PageEntry, PageFlags};
pub use crate::level::PageLevel;
pub use crate::ranges::{VirtualRangeAlloc, VirtualReservation};
pub use crate::table::{ENTRIES, PageTable};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Errors from mapping and range operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("already mapped")]
    AlreadyExists,
    #[error("not mapped")]
    NotFound,
}

/// Source of **physical** 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (boot pool, bitmap,
/// buddy). Frames need not be zeroed; the address space clears every table it
/// allocates.
pub trait FrameAlloc {
    /// One 4 KiB frame, or `None` when out of memory.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Take back a frame previously returned by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to usable addresses in the current address
/// space.
///
/// Typical patterns:
/// - **Loader**: identity-maps low memory; returns the address unchanged.
/// - **Kernel**: adds the direct-map offset.
pub trait PhysMapper {
    /// Where `pa` is visible in the current address space.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// The inverse of [`phys_to_virt`](Self::phys_to_virt), or `None` if
    /// `va` is outside the mapped physical window.
    fn virt_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Reinterpret the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable at [`phys_to_virt`](Self::phys_to_virt)
    ///   for all of `'a`.
    /// - The bytes there must be a valid `T`, suitably aligned.
    /// - No other reference to the same memory may be live.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }
}
