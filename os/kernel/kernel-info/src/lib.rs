//! # Kernel Memory Configuration
//!
//! The single source of truth for where things live in memory: the fixed
//! addresses shared between the loader and the kernel, and the layout that is
//! derived at boot from the amount of memory the loader detected.
//!
//! ## Modules
//!
//! ### Fixed addresses ([`memory`])
//! Page size, kernel base, bitmap base, kernel heap start, user space range and
//! the recursive paging slot. All `const`, checked at compile time.
//!
//! ### Loader handoff ([`boot`])
//! The `#[repr(C)]` record the loader leaves at physical `0xb00`.
//!
//! ### Runtime layout ([`layout`])
//! [`LayoutConfig`](layout::LayoutConfig) → [`MemoryLayout`](layout::MemoryLayout):
//! the 50/50 pool split and the bitmap placement.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     (unmapped / loader)         │
//! 0x0804_8000 ├─────────────────────────────────┤ USER_VADDR_START
//!             │     Process private space       │
//!             │     (one bitmap per process)    │
//! 0xc000_0000 ├─────────────────────────────────┤ KERNEL_BASE
//!             │     low 1 MiB (bitmaps, PCB)    │
//! 0xc010_0000 ├─────────────────────────────────┤ KERNEL_HEAP_START
//!             │     Kernel heap                 │
//! 0xffc0_0000 ├─────────────────────────────────┤ RECURSIVE_WINDOW_BASE
//!             │     Page tables of the active   │
//!             │     directory (self-mapped)     │
//! 0xffff_ffff └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod layout;
pub mod memory;
