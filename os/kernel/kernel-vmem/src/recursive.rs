//! Address arithmetic for the self-mapped page directory.
//!
//! Slot 1023 of every page directory points back at the directory. The CPU
//! therefore walks it twice for addresses in the top 4 MiB and the paging
//! structures of the *active* directory become ordinary memory:
//!
//! ```text
//! 0xffc0_0000 + pdi·4096          page table for directory slot `pdi`
//! 0xffc0_0000 + pdi·4096 + pti·4  its entry `pti`               (PTE)
//! 0xffff_f000                     the directory itself
//! 0xffff_f000 + pdi·4             directory slot `pdi`          (PDE)
//! ```

use kernel_info::memory::{PAGE_SIZE, RECURSIVE_SLOT, RECURSIVE_WINDOW_BASE};
use kernel_memory_addresses::VirtualAddress;

/// Where the active page directory is visible.
pub const DIRECTORY_WINDOW: VirtualAddress =
    VirtualAddress::new(RECURSIVE_WINDOW_BASE + RECURSIVE_SLOT * PAGE_SIZE);

const ENTRY_BYTES: u32 = 4;

/// Which paging structure an entry lives in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryLevel {
    /// Page directory entry (PDE), selects a page table.
    Directory,
    /// Page table entry (PTE), selects a frame.
    Table,
}

/// Bits 31..22: slot in the page directory.
#[inline]
#[must_use]
pub const fn directory_index(va: VirtualAddress) -> u32 {
    va.as_u32() >> 22
}

/// Bits 21..12: slot in the page table.
#[inline]
#[must_use]
pub const fn table_index(va: VirtualAddress) -> u32 {
    (va.as_u32() >> 12) & 0x3ff
}

/// Virtual address of the directory entry that covers `va`.
#[inline]
#[must_use]
pub const fn pde_address(va: VirtualAddress) -> VirtualAddress {
    directory_slot_address(directory_index(va))
}

/// Virtual address of directory slot `slot` of the active directory.
#[inline]
#[must_use]
pub const fn directory_slot_address(slot: u32) -> VirtualAddress {
    VirtualAddress::new(DIRECTORY_WINDOW.as_u32() + slot * ENTRY_BYTES)
}

/// Virtual address of the page table that covers `va`.
///
/// Only dereferenceable while the matching directory entry is present.
#[inline]
#[must_use]
pub const fn table_window(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_WINDOW_BASE + directory_index(va) * PAGE_SIZE)
}

/// Virtual address of the table entry that maps `va`.
#[inline]
#[must_use]
pub const fn pte_address(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(table_window(va).as_u32() + table_index(va) * ENTRY_BYTES)
}

#[inline]
#[must_use]
pub const fn entry_address_of(va: VirtualAddress, level: EntryLevel) -> VirtualAddress {
    match level {
        EntryLevel::Directory => pde_address(va),
        EntryLevel::Table => pte_address(va),
    }
}

/// Whether `va` lies in the top 4 MiB occupied by the recursive mapping.
#[inline]
#[must_use]
pub const fn in_recursive_window(va: VirtualAddress) -> bool {
    va.as_u32() >= RECURSIVE_WINDOW_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices() {
        let va = VirtualAddress::new(0xc010_2345);
        assert_eq!(directory_index(va), 0x300);
        assert_eq!(table_index(va), 0x102);
    }

    #[test]
    fn kernel_heap_entries() {
        let va = VirtualAddress::new(0xc010_0000);
        assert_eq!(pde_address(va), VirtualAddress::new(0xffff_fc00));
        assert_eq!(pte_address(va), VirtualAddress::new(0xfff0_0400));
        assert_eq!(table_window(va), VirtualAddress::new(0xfff0_0000));
    }

    #[test]
    fn user_entries() {
        let va = VirtualAddress::new(0x0804_8000);
        assert_eq!(entry_address_of(va, EntryLevel::Directory), VirtualAddress::new(0xffff_f080));
        assert_eq!(entry_address_of(va, EntryLevel::Table), VirtualAddress::new(0xffc2_0120));
    }

    #[test]
    fn directory_maps_onto_itself() {
        // the PTE of the directory window is the recursive directory slot
        assert_eq!(pte_address(DIRECTORY_WINDOW), directory_slot_address(1023));
        assert_eq!(pde_address(DIRECTORY_WINDOW), directory_slot_address(1023));
        assert!(in_recursive_window(DIRECTORY_WINDOW));
        assert!(!in_recursive_window(VirtualAddress::new(0xffbf_ffff)));
    }
}
