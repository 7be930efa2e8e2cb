use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 — Page Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical base address of the active page directory and the
/// cache-control flags used when the CPU walks it.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2 — Ignored.
    #[bits(3)]
    pub ignored0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the directory.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the directory.
    pub pcd: bool,

    /// Bits 5–11 — Ignored.
    #[bits(7)]
    pub ignored1: u8,

    /// Bits 12–31 — Page directory physical base >> 12.
    #[bits(20)]
    directory_base_4k: u32,
}

impl Cr3 {
    /// Create a `Cr3` value pointing at the page directory in frame `directory`.
    #[must_use]
    pub fn from_directory(directory: PhysicalAddress) -> Self {
        debug_assert_eq!(
            directory.as_u32() & 0xFFF,
            0,
            "page directory must be 4K-aligned"
        );
        Self::new().with_directory_base_4k(directory.as_u32() >> 12)
    }

    /// Physical address of the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.directory_base_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let cr3 = Cr3::from_directory(PhysicalAddress::new(0x0010_0000));
        assert_eq!(cr3.into_bits(), 0x0010_0000);
        assert_eq!(cr3.directory(), PhysicalAddress::new(0x0010_0000));
    }

    #[test]
    fn flags_do_not_leak_into_base() {
        let cr3 = Cr3::from_bits(0x0020_3018);
        assert!(cr3.pwt());
        assert!(cr3.pcd());
        assert_eq!(cr3.directory(), PhysicalAddress::new(0x0020_3000));
    }
}
