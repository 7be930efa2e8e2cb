//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in paging and memory management code.
//!
//! ## Overview
//!
//! This crate defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical frames. |
//!
//! ## Page Sizes
//!
//! Two-level i386 paging knows two granularities, both modelled as marker
//! types implementing [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages, mapped by a page table entry
//! - [`Size4M`] — the 4 MiB span covered by one page directory entry
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC010_0123);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC010_0000);
//! assert_eq!(off.as_u32(), 0x123);
//! assert_eq!(page.join(off), va);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = MemoryAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(o.as_u32(), 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_4m() {
        let a = MemoryAddress::new(0xC012_3456);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0xC000_0000);
        assert_eq!(p.number(), 0x300);
        assert_eq!(o.as_u32(), 0x0012_3456);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn virtual_vs_physical_wrappers() {
        let va = VirtualAddress::new(0xC009_A123);
        let (vp, vo) = va.split::<Size4K>();
        assert_eq!(vp.base(), VirtualAddress::new(0xC009_A000));
        assert_eq!(vo.as_u32(), 0x123);
        assert_eq!(vp.join(vo), va);

        let pa = PhysicalAddress::new(0x0010_0042);
        let (pp, po) = pa.split::<Size4K>();
        assert_eq!(pp.number(), 0x100);
        assert_eq!(po.as_u32(), 0x42);
        assert_eq!(pp.join(po), pa);
    }

    #[test]
    fn alignment_helpers() {
        let a = VirtualAddress::new(0x12345);
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert!(!a.is_aligned::<Size4K>());
        assert!(VirtualAddress::new(0x8000_0000).is_aligned::<Size4M>());
        assert!(VirtualPage::<Size4K>::try_from(a).is_err());
        assert_eq!(
            PhysicalPage::<Size4K>::try_from(PhysicalAddress::new(0x3000)).map(PhysicalPage::base),
            Ok(PhysicalAddress::new(0x3000))
        );
    }

    #[test]
    fn checked_arithmetic_stays_in_4gib() {
        let top = VirtualAddress::new(0xFFFF_F000);
        assert_eq!(top.checked_add(0xFFF), Some(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(top.checked_add(0x1000), None);
        assert_eq!(top.checked_offset_from(VirtualAddress::new(0xFFFF_0000)), Some(0xF000));
        assert_eq!(VirtualAddress::zero().checked_offset_from(top), None);
    }

    #[test]
    fn formatting() {
        assert_eq!(format!("{:?}", VirtualAddress::new(0xC010_0000)), "VA(0xC0100000)");
        assert_eq!(format!("{:?}", PhysicalAddress::new(0x9A000)), "PA(0x0009A000)");
        assert_eq!(format!("{}", VirtualAddress::new(0x1000).page::<Size4K>()), "0x00001000/4K");
    }
}
