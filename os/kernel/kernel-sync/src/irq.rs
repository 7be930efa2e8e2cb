//! Interrupt masking.
//!
//! The memory manager never talks to `cli`/`sti` directly; it goes through
//! [`InterruptControl`] so the same code runs on hardware ([`X86Interrupts`])
//! and against an emulated CPU in tests.

/// Interrupt flag state, as returned by [`InterruptControl::disable`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InterruptStatus {
    Enabled,
    Disabled,
}

pub trait InterruptControl {
    fn status(&self) -> InterruptStatus;

    /// Masks interrupts and returns the state before the call.
    fn disable(&self) -> InterruptStatus;

    /// Unmasks interrupts and returns the state before the call.
    fn enable(&self) -> InterruptStatus;

    /// Returns to a state previously returned by [`disable`](Self::disable).
    fn restore(&self, status: InterruptStatus) {
        match status {
            InterruptStatus::Enabled => {
                self.enable();
            }
            InterruptStatus::Disabled => {
                self.disable();
            }
        }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nested guards compose: only the outermost one re-enables interrupts, and
/// only if they were enabled when it was created.
///
/// ```rust
/// # use core::cell::Cell;
/// # use kernel_sync::{InterruptControl, InterruptStatus, IrqGuard};
/// struct Flag(Cell<bool>);
/// impl InterruptControl for Flag {
///     fn status(&self) -> InterruptStatus {
///         if self.0.get() { InterruptStatus::Enabled } else { InterruptStatus::Disabled }
///     }
///     fn disable(&self) -> InterruptStatus { let s = self.status(); self.0.set(false); s }
///     fn enable(&self) -> InterruptStatus { let s = self.status(); self.0.set(true); s }
/// }
///
/// let cpu = Flag(Cell::new(true));
/// {
///     let _g = IrqGuard::new(&cpu);
///     assert_eq!(cpu.status(), InterruptStatus::Disabled);
/// }
/// assert_eq!(cpu.status(), InterruptStatus::Enabled);
/// ```
pub struct IrqGuard<'a, I: InterruptControl + ?Sized> {
    irq: &'a I,
    previous: InterruptStatus,
}

impl<'a, I: InterruptControl + ?Sized> IrqGuard<'a, I> {
    #[inline]
    #[must_use]
    pub fn new(irq: &'a I) -> Self {
        let previous = irq.disable();
        Self { irq, previous }
    }

    /// State that will be restored on drop.
    #[inline]
    #[must_use]
    pub const fn previous(&self) -> InterruptStatus {
        self.previous
    }
}

impl<I: InterruptControl + ?Sized> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        self.irq.restore(self.previous);
    }
}

/// The interrupt flag of the executing i386 CPU.
///
/// # Safety & Privilege
///
/// Only meaningful at CPL0 (or with IOPL permitting `cli`/`sti`).
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Interrupts;

#[cfg(target_arch = "x86")]
impl InterruptControl for X86Interrupts {
    fn status(&self) -> InterruptStatus {
        use kernel_registers::LoadRegister;
        if kernel_registers::eflags::Eflags::load().if_interrupt_enable() {
            InterruptStatus::Enabled
        } else {
            InterruptStatus::Disabled
        }
    }

    fn disable(&self) -> InterruptStatus {
        let status = self.status();
        if status == InterruptStatus::Enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
        }
        status
    }

    fn enable(&self) -> InterruptStatus {
        let status = self.status();
        if status == InterruptStatus::Disabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
        }
        status
    }
}
