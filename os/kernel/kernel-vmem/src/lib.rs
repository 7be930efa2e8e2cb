//! # Virtual Memory Support (i386)
//!
//! Two-level 32-bit paging helpers for the kernel's memory manager.
//!
//! ## What you get
//! - [`PageEntryBits`]: the 32-bit directory/table entry as a bitfield.
//! - [`recursive`]: address arithmetic for the self-mapped directory.
//! - [`PageTableManager`]: bind/unbind/translate in the active directory and
//!   per-process directory initialisation.
//! - A tiny hardware interface ([`Mmu`], [`FrameAlloc`]) with an x86
//!   implementation and, behind the `sim` feature, a [`sim::SimulatedMachine`].
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → 4 KiB frame
//!          (1024 PDEs)     (1024 PTEs)
//! ```
//!
//! | Level | Table name | Entry name | Description |
//! |:------|:-----------|:-----------|:------------|
//! | 1 | **PD** (Page Directory) | **PDE** | One per address space, referenced by CR3. Each entry points to a PT and spans 4 MiB. |
//! | 2 | **PT** (Page Table) | **PTE** | Each entry maps a 4 KiB physical frame. |
//!
//! ### Recursive mapping
//!
//! The last PDE of every directory points at the directory itself. Walking
//! through it once exposes all page tables of the active address space in
//! the top 4 MiB (`0xffc0_0000..`), twice exposes the directory itself at
//! `0xffff_f000`. No physical-to-virtual mapping is needed to edit paging
//! structures.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

mod page_entry_bits;
mod page_table;
pub mod recursive;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
#[cfg(target_arch = "x86")]
mod x86;

pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{Binding, MapError, PageTableManager};
#[cfg(target_arch = "x86")]
pub use crate::x86::X86Mmu;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;
}

/// Access to memory through the paging unit of the executing CPU.
///
/// All addresses are *virtual* and resolved in the active address space,
/// which is what makes the recursive mapping usable.
pub trait Mmu {
    /// View the memory at `va` as a `T`.
    ///
    /// # Safety
    /// - `va` must be mapped and writable in the active address space.
    /// - `T` must match the bytes at `va` and `va` must be aligned for `T`.
    /// - The caller must not create aliasing references for `'a`.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;

    /// View `len` bytes starting at `va`.
    ///
    /// # Safety
    /// Same as [`virt_to_mut`](Self::virt_to_mut) for the whole range.
    unsafe fn virt_to_slice<'a>(&self, va: VirtualAddress, len: usize) -> &'a mut [u8];

    /// Drop any cached translation of the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Physical frame of the directory in CR3.
    fn active_directory(&self) -> PhysicalAddress;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedMachine;
    use kernel_info::memory::{BOOT_RESERVED_BYTES, PAGE_DIRECTORY_PHYS, PAGE_SIZE};

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    struct BumpAlloc {
        next: u32,
        end: u32,
    }

    impl BumpAlloc {
        fn new(start: u32, end: u32) -> Self {
            Self { next: start, end }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
            if self.next + PAGE_SIZE > self.end {
                return None;
            }
            let p = self.next;
            self.next += PAGE_SIZE;
            Some(PhysicalAddress::new(p))
        }
    }

    const RAM: u32 = BOOT_RESERVED_BYTES + 64 * PAGE_SIZE;

    fn frames() -> BumpAlloc {
        BumpAlloc::new(BOOT_RESERVED_BYTES, RAM)
    }

    #[test]
    fn boot_state_maps_low_memory_twice() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);

        let bitmap = VirtualAddress::new(0xc009_a123);
        assert_eq!(ptm.translate(bitmap), Some(PhysicalAddress::new(0x9a123)));
        assert_eq!(ptm.translate(VirtualAddress::new(0x9a123)), Some(PhysicalAddress::new(0x9a123)));
        assert_eq!(ptm.translate(VirtualAddress::new(0xc010_0000)), None);
        assert_eq!(machine.active_directory(), PhysicalAddress::new(PAGE_DIRECTORY_PHYS));

        // the directory is visible through its own last slot
        assert_eq!(
            ptm.translate(recursive::DIRECTORY_WINDOW),
            Some(PhysicalAddress::new(PAGE_DIRECTORY_PHYS))
        );
    }

    #[test]
    fn bind_in_kernel_half_uses_prebuilt_tables() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        let va = VirtualAddress::new(0xc010_0000);
        let pa = PhysicalAddress::new(BOOT_RESERVED_BYTES + 5 * PAGE_SIZE);
        let binding = ptm.bind(va, pa, &mut alloc).unwrap();

        assert_eq!(binding.created_table, None);
        assert_eq!(ptm.translate(va + 0x234), Some(pa + 0x234));
        assert_eq!(machine.walk(va + 0x234), Some(pa + 0x234));

        // also reachable in the slot-773 table, pre-built at boot
        let far = VirtualAddress::new(0xc140_0000);
        assert_eq!(ptm.bind(far, pa + PAGE_SIZE, &mut alloc).unwrap().created_table, None);
        assert_eq!(alloc.next, BOOT_RESERVED_BYTES);
    }

    #[test]
    fn bind_in_user_half_creates_zeroed_table() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        let va = VirtualAddress::new(0x0804_8000);
        let pa = PhysicalAddress::new(BOOT_RESERVED_BYTES + 10 * PAGE_SIZE);
        let binding = ptm.bind(va, pa, &mut alloc).unwrap();

        let table = PhysicalAddress::new(BOOT_RESERVED_BYTES);
        assert_eq!(binding.created_table, Some(table));
        let pde = ptm.directory_entry(va);
        assert!(pde.present() && pde.writable() && pde.user_access());
        assert_eq!(pde.frame(), table);

        // only the one entry is set in the fresh table
        let neighbour = va + PAGE_SIZE;
        assert_eq!(ptm.table_entry(neighbour).map(|e| e.into_bits()), Some(0));
        assert_eq!(ptm.translate(va), Some(pa));

        // same table is reused for the neighbour
        let again = ptm.bind(neighbour, pa + PAGE_SIZE, &mut alloc).unwrap();
        assert_eq!(again.created_table, None);
    }

    #[test]
    fn rebinding_a_present_entry_is_refused() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        let va = VirtualAddress::new(0xc010_1000);
        let first = PhysicalAddress::new(BOOT_RESERVED_BYTES + 20 * PAGE_SIZE);
        let _ = ptm.bind(va, first, &mut alloc).unwrap();

        let second = first + PAGE_SIZE;
        assert_eq!(
            ptm.bind(va, second, &mut alloc),
            Err(MapError::AlreadyMapped { va, existing: first })
        );
        assert_eq!(ptm.translate(va), Some(first));
    }

    #[test]
    fn table_creation_reports_exhaustion() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut empty = BumpAlloc::new(0, 0);

        let va = VirtualAddress::new(0x4000_0000);
        assert_eq!(
            ptm.bind(va, PhysicalAddress::new(BOOT_RESERVED_BYTES), &mut empty),
            Err(MapError::OutOfFrames)
        );
        assert!(!ptm.directory_entry(va).present());
    }

    #[test]
    fn bad_arguments_are_rejected() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();
        let pa = PhysicalAddress::new(BOOT_RESERVED_BYTES);

        let odd = VirtualAddress::new(0xc010_0010);
        assert_eq!(ptm.bind(odd, pa, &mut alloc), Err(MapError::Misaligned { va: odd, pa }));

        let window = VirtualAddress::new(0xffc0_0000);
        assert_eq!(ptm.bind(window, pa, &mut alloc), Err(MapError::RecursiveWindow { va: window }));
    }

    #[test]
    fn unbind_clears_entry_and_invalidates() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        let va = VirtualAddress::new(0xc010_2000);
        let pa = PhysicalAddress::new(BOOT_RESERVED_BYTES + 30 * PAGE_SIZE);
        let _ = ptm.bind(va, pa, &mut alloc).unwrap();
        machine.write_bytes(va, b"cached");

        let before = machine.invalidations();
        assert_eq!(ptm.unbind(va + 0x10), Ok(pa));
        assert_eq!(machine.invalidations(), before + 1);
        assert_eq!(ptm.translate(va), None);
        assert_eq!(ptm.unbind(va), Err(MapError::NotMapped { va }));

        // a new frame at the same address must be seen, not the cached old one
        let other = pa + PAGE_SIZE;
        let _ = ptm.bind(va, other, &mut alloc).unwrap();
        machine.write_bytes(va, b"fresh!");
        assert_eq!(machine.read_bytes(va, 6), b"fresh!");
        assert_eq!(machine.read_physical_u32(pa), u32::from_le_bytes(*b"cach"));
    }

    #[test]
    fn release_table_only_in_user_half() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        let va = VirtualAddress::new(0x0804_8000);
        let binding = ptm.bind(va, PhysicalAddress::new(BOOT_RESERVED_BYTES + 40 * PAGE_SIZE), &mut alloc).unwrap();
        let _ = ptm.unbind(va).unwrap();

        assert_eq!(ptm.release_table(va), Ok(binding.created_table.unwrap()));
        assert!(!ptm.directory_entry(va).present());
        assert_eq!(ptm.table_entry(va), None);
        assert_eq!(ptm.release_table(va), Err(MapError::NotMapped { va }));

        let kernel = VirtualAddress::new(0xc040_0000);
        assert_eq!(ptm.release_table(kernel), Err(MapError::SharedKernelTable { va: kernel }));
    }

    #[test]
    fn new_directory_shares_kernel_half() {
        let machine = SimulatedMachine::boot(RAM);
        let ptm = PageTableManager::new(&machine);
        let mut alloc = frames();

        // a user mapping in the boot directory must not leak into the copy
        let user = VirtualAddress::new(0x0804_8000);
        let _ = ptm.bind(user, PhysicalAddress::new(BOOT_RESERVED_BYTES + 50 * PAGE_SIZE), &mut alloc).unwrap();

        let dir_frame = alloc.alloc_4k().unwrap();
        let dir_va = VirtualAddress::new(0xc010_0000);
        let _ = ptm.bind(dir_va, dir_frame, &mut alloc).unwrap();
        unsafe { ptm.init_directory(dir_va, dir_frame) };

        let kernel_page = VirtualAddress::new(0xc010_3000);
        let kernel_frame = PhysicalAddress::new(BOOT_RESERVED_BYTES + 60 * PAGE_SIZE);
        let _ = ptm.bind(kernel_page, kernel_frame, &mut alloc).unwrap();

        machine.activate(dir_frame);
        let ptm = PageTableManager::new(&machine);
        assert_eq!(machine.active_directory(), dir_frame);
        assert_eq!(ptm.translate(user), None);
        assert_eq!(ptm.translate(kernel_page), Some(kernel_frame));
        assert_eq!(ptm.translate(VirtualAddress::new(0xc009_a000)), Some(PhysicalAddress::new(0x9a000)));
        assert_eq!(ptm.translate(recursive::DIRECTORY_WINDOW), Some(dir_frame));
        assert!(!ptm.directory_entry(VirtualAddress::zero()).present());
    }
}
