//! # Loader Handoff

use kernel_memory_addresses::PhysicalAddress;

/// Physical address where the loader leaves its [`LoaderMemoryReport`].
pub const MEMORY_REPORT_PHYS: PhysicalAddress = PhysicalAddress::new(0xb00);

/// Memory size detected by the real-mode loader (BIOS `E820`/`E801`/`88h`).
///
/// Keep this `#[repr(C)]`; the loader writes it from assembly.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoaderMemoryReport {
    /// Total physical memory in bytes.
    pub total_memory_bytes: u32,
}
