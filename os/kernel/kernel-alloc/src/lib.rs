//! # Kernel Memory Allocation
//!
//! Physical frames, kernel virtual address space and the kernel heap, brought
//! up in that order during boot and layered on each other afterwards.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Kernel Heap                       │
//! │    • Slab caches for 16 size classes                │
//! │    • Large requests straight from frames            │
//! │    • Bump heap for early boot                       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  PageSource
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Kernel Address Space                   │
//! │    • 4-level page tables (kernel-vmem)              │
//! │    • Direct map of physical memory                  │
//! │    • Virtual range bookkeeping                      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  FrameAlloc
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical Frame Allocator                  │
//! │    • Bitmap or buddy strategy                       │
//! │    • One contiguous usable span                     │
//! │    • Self-hosted bookkeeping                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bring-up
//!
//! [`boot::check_cpu_support`] runs first. [`boot::init_frame_allocator`]
//! then carves its own bookkeeping out of the largest usable span of the
//! firmware memory map, [`boot::init_virtual_ranges`] and
//! [`boot::init_kernel_space`] build the kernel address space on top, and
//! finally a heap from [`heap`] is installed behind a [`heap::KernelHeap`].
//! [`global`] holds the frame allocator and address space once they exist.
//!
//! ## Locking
//!
//! Locks are always taken in this order, never the reverse:
//!
//! 1. a heap size class,
//! 2. the slab arena,
//! 3. the kernel address space,
//! 4. the frame allocator.
//!
//! Allocations flagged [`AllocHints::atomic`] take their locks with
//! interrupts disabled.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod config;
mod error;
pub mod frame;
pub mod global;
pub mod heap;
mod hints;
pub mod phys_mapper;

pub use config::MemoryConfig;
pub use error::MemoryError;
pub use frame::{FrameAllocator, FrameRange, FrameStrategy, KernelFrameAlloc, LockedFrameAlloc};
pub use heap::{HeapAllocator, KernelPageSource, PageSource};
pub use hints::AllocHints;
pub use phys_mapper::DirectMapPhysMapper;
