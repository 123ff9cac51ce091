//! # Kernel Memory Layout and Boot Memory Map
//!
//! The single source of truth for where things live in the kernel's virtual
//! address space, and for the normalized memory map handed over at boot.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User window (128 TiB)          │  per process, empty in the kernel space
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │  non-canonical hole             │
//! 0xFFFF_8880_0000_0000 ├─────────────────────────────────┤  DIRECT_MAP_BASE
//!                       │  Direct map (64 TiB)            │  physical `pa` at DIRECT_MAP_BASE + pa
//! 0xFFFF_C900_0000_0000 ├─────────────────────────────────┤  KERNEL_HEAP_BASE
//!                       │  Kernel heap (4 GiB)            │
//!                       ├─────────────────────────────────┤
//!                       │  unused                         │
//! 0xFFFF_FFFF_8000_0000 ├─────────────────────────────────┤  KERNEL_BASE
//!                       │  Kernel image (512 MiB)         │
//! 0xFFFF_FFFF_A000_0000 ├─────────────────────────────────┤  KERNEL_MODULES_BASE
//!                       │  Kernel modules (1.5 GiB)       │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All windows are compile-time constants in [`memory`]; `const` assertions
//! reject overlapping or misaligned windows.
//!
//! ## Boot Memory Map
//!
//! [`boot`] defines the `#[repr(C)]` memory map records and the merge that
//! picks the largest contiguous usable span for the frame allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
