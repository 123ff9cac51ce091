//! # Kernel synchronization primitives
//!
//! The memory subsystem needs only three things from here:
//!
//! - [`SpinLock`]: one per allocator instance, released by a scoped guard.
//! - [`SyncOnceCell`]: init-once storage for the process-wide allocators.
//! - [`IrqGuard`]: withholds interrupts around CR3 loads and atomic-context
//!   allocations.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
