//! # Typed x86-64 Control Registers
//!
//! Only what the memory subsystem touches: [`Cr3`](cr3::Cr3), the page-table
//! root loaded when an address space is activated, and the
//! [`cpuid`](cpuid::cpuid) leaves that tell which paging features exist.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cpuid")]
pub mod cpuid;
#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires Ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The register access is privileged and requires Ring 0. Writing a
    /// control register can change how every subsequent memory access
    /// behaves; the caller must keep the executing code and stack mapped.
    unsafe fn store_unsafe(self);
}
