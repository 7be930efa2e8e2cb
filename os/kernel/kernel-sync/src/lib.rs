//! # Kernel synchronization primitives
//!
//! - [`ReentrantMutex`]: mutual exclusion between tasks where the holding task
//!   may lock again (bounded recursion, tracked by a repeat counter).
//! - [`RawTicket`]: the FIFO raw lock underneath; waiters are served in arrival order.
//! - [`IrqGuard`]: RAII "interrupts off" section over any [`InterruptControl`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod raw_ticket;
mod reentrant;

pub use irq::{InterruptControl, InterruptStatus, IrqGuard};
pub use raw_ticket::RawTicket;
pub use reentrant::{OwnerId, ReentrantMutex, ReentrantMutexGuard};

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn raw_unlock(&self);
}
