//! [`Mmu`] for the executing i386 CPU.

use crate::Mmu;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// The hardware MMU: virtual addresses are dereferenced directly.
///
/// # Safety & Privilege
/// Requires CPL0 with paging enabled and the recursive slot installed in
/// every directory that is ever loaded into CR3.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl X86Mmu {
    /// Switches to the directory in frame `directory`, flushing all
    /// non-global translations.
    ///
    /// # Safety
    /// `directory` must be a valid page directory that maps the kernel half
    /// (including the currently executing code and stack).
    pub unsafe fn activate(&self, directory: PhysicalAddress) {
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }
}

impl Mmu for X86Mmu {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *(va.as_usize() as *mut T) }
    }

    unsafe fn virt_to_slice<'a>(&self, va: VirtualAddress, len: usize) -> &'a mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(va.as_usize() as *mut u8, len) }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_usize(), options(nostack, preserves_flags));
        }
    }

    fn active_directory(&self) -> PhysicalAddress {
        let cr3 = unsafe { Cr3::load_unsafe() };
        cr3.directory()
    }
}
