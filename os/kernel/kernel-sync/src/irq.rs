//! Interrupt masking for critical sections that must not be preempted.
//!
//! On bare-metal x86-64 (`target_os = "none"`) these use `cli`/`sti` and
//! `pushfq`. Hosted builds (unit tests, tooling) have no interrupts to
//! withhold and only track the state in software.

/// `RFLAGS.IF`
const INTERRUPT_FLAG: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Privilege
/// Ring 0 only.
#[inline]
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Privilege
/// Ring 0 only.
#[inline]
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Hosted builds report interrupts as disabled.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & INTERRUPT_FLAG != 0
}

/// RAII guard that withholds interrupts while it is alive.
///
/// Snapshots `IF` on creation and issues `cli` if interrupts were enabled.
/// On drop, `sti` runs only if they were enabled before, so guards nest.
/// Used around CR3 loads and by [`SpinLock::lock_irq`](crate::SpinLock::lock_irq).
#[derive(Debug)]
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether interrupts were enabled when the guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
