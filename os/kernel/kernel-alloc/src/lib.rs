//! # Kernel Memory Allocation
//!
//! Physical frame accounting, virtual address space accounting, page
//! allocation and the kernel/process heaps, layered as follows:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap ([`slab`])                     │
//! │    • 16..1024 byte blocks carved from arena pages   │
//! │    • larger requests as runs of whole pages         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │            Page allocation ([`page_alloc`])         │
//! │    • reserve, back with frames, bind                │
//! │    • all-or-nothing, pool locks held throughout     │
//! └───────┬─────────────────┬──────────────────┬────────┘
//!         │                 │                  │
//! ┌───────▼───────┐ ┌───────▼────────┐ ┌───────▼────────┐
//! │ Frame pools   │ │ Virtual spaces │ │ Page tables    │
//! │ kernel / user │ │ kernel / proc. │ │ (kernel-vmem)  │
//! └───────────────┘ └────────────────┘ └────────────────┘
//! ```
//!
//! Everything hangs off one [`MemoryManager`], built at boot from a
//! [`MemoryLayout`](kernel_info::layout::MemoryLayout) and passed around by
//! reference. It reaches the hardware through [`Mmu`](kernel_vmem::Mmu) and
//! [`InterruptControl`](kernel_sync::InterruptControl), and the running task
//! through [`Scheduler`].
//!
//! ## Failure model
//!
//! Exhaustion is returned as `None`. A violated invariant (double free,
//! freeing foreign memory, rebinding a mapped page, ...) halts the kernel.
//! Every operation has a `try_*` twin returning [`AllocError`] instead, so
//! both paths can be tested.
//!
//! ## Process memory
//!
//! [`ProcessMemory`] bundles what a process owns: its page directory (sharing
//! the kernel half), its virtual address bitmap and its block ladder. See
//! [`MemoryManager::create_process_memory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod bitmap;
mod error;
mod frame_pool;
mod manager;
pub mod page_alloc;
mod process;
mod scheduler;
pub mod slab;
mod vaddr_space;

pub use crate::bitmap::Bitmap;
pub use crate::error::{AllocError, InvariantViolation, Resource, ensure, halt};
pub use crate::frame_pool::{FramePool, PoolKind};
pub use crate::manager::{MemoryManager, MemoryStats};
pub use crate::process::ProcessMemory;
pub use crate::scheduler::Scheduler;
pub use crate::slab::{ArenaHeader, ArenaInfo, BlockDescriptor, BlockLadder};
pub use crate::vaddr_space::VirtualAddressSpace;
