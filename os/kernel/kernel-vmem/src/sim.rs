//! An in-memory i386 machine for running paging code on the host.
//!
//! [`SimulatedMachine`] owns a block of "physical" RAM, a CR3 register, a
//! translation cache and an interrupt flag. Every virtual access handed out
//! through [`Mmu`] is translated by a real two-level walk starting at CR3, so
//! code that edits page tables through the recursive mapping is exercised
//! exactly as on hardware. Translations are cached until
//! [`Mmu::invalidate_page`] or [`SimulatedMachine::activate`] drops them,
//! which makes a forgotten `invlpg` visible as a stale mapping.
//!
//! Faults are fatal: touching an unmapped address panics with a page fault,
//! touching memory past the end of RAM panics with a bus error.

use crate::recursive::{directory_index, table_index};
use crate::{Mmu, PageEntryBits};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use kernel_info::memory::{
    BOOT_RESERVED_BYTES, KERNEL_DIRECTORY_SLOT, LOW_MEMORY_BYTES, PAGE_DIRECTORY_PHYS, PAGE_SIZE,
    RECURSIVE_SLOT,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, InterruptStatus};

const FRAME: usize = PAGE_SIZE as usize;

/// A 4 KiB-aligned frame of simulated RAM.
#[repr(C, align(4096))]
struct Frame([u8; FRAME]);

pub struct SimulatedMachine {
    memory: Box<[UnsafeCell<Frame>]>,
    cr3: Cell<PhysicalAddress>,
    tlb: RefCell<BTreeMap<u32, PhysicalAddress>>,
    invalidations: Cell<usize>,
    interrupts: Cell<InterruptStatus>,
    interrupt_disables: Cell<usize>,
}

impl SimulatedMachine {
    /// Zeroed RAM of `total_memory` bytes, paging structures not set up.
    #[must_use]
    pub fn with_memory(total_memory: u32) -> Self {
        assert!(
            total_memory.is_multiple_of(PAGE_SIZE),
            "memory size must be a whole number of frames"
        );
        let memory = (0..total_memory / PAGE_SIZE)
            .map(|_| UnsafeCell::new(Frame([0; FRAME])))
            .collect();
        Self {
            memory,
            cr3: Cell::new(PhysicalAddress::zero()),
            tlb: RefCell::new(BTreeMap::new()),
            invalidations: Cell::new(0),
            interrupts: Cell::new(InterruptStatus::Enabled),
            interrupt_disables: Cell::new(0),
        }
    }

    /// RAM in the state the loader leaves it when it jumps to the kernel:
    ///
    /// - page directory at `0x100000`, active in CR3;
    /// - slots 0 and 768 share one table mapping the low 1 MiB;
    /// - slots 769..=1022 point at empty, pre-built tables so the kernel
    ///   half is identical in every directory copied from this one;
    /// - slot 1023 maps the directory onto itself.
    #[must_use]
    pub fn boot(total_memory: u32) -> Self {
        assert!(total_memory > BOOT_RESERVED_BYTES, "not enough memory to boot");
        let machine = Self::with_memory(total_memory);

        let directory = PhysicalAddress::new(PAGE_DIRECTORY_PHYS);
        let low_table = directory + PAGE_SIZE;
        let slot = |index: u32| directory + index * 4;

        machine.write_physical_u32(slot(0), PageEntryBits::user_rw(low_table).into_bits());
        machine.write_physical_u32(
            slot(KERNEL_DIRECTORY_SLOT),
            PageEntryBits::user_rw(low_table).into_bits(),
        );
        for page in 0..LOW_MEMORY_BYTES / PAGE_SIZE {
            let frame = PhysicalAddress::new(page * PAGE_SIZE);
            machine.write_physical_u32(low_table + page * 4, PageEntryBits::user_rw(frame).into_bits());
        }

        let mut table = low_table;
        for index in KERNEL_DIRECTORY_SLOT + 1..RECURSIVE_SLOT {
            table += PAGE_SIZE;
            machine.write_physical_u32(slot(index), PageEntryBits::user_rw(table).into_bits());
        }
        debug_assert_eq!(table + PAGE_SIZE, PhysicalAddress::new(BOOT_RESERVED_BYTES));

        machine.write_physical_u32(slot(RECURSIVE_SLOT), PageEntryBits::user_rw(directory).into_bits());
        machine.activate(directory);
        machine
    }

    #[must_use]
    pub fn memory_size(&self) -> u32 {
        u32::try_from(self.memory.len() * FRAME).unwrap_or(u32::MAX)
    }

    /// Loads CR3, which drops every cached translation.
    pub fn activate(&self, directory: PhysicalAddress) {
        assert!(directory.is_aligned::<Size4K>(), "unaligned page directory {directory}");
        self.cr3.set(directory);
        self.tlb.borrow_mut().clear();
    }

    /// Walks the page tables of the active directory, bypassing the cache.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let directory = self.cr3.get();
        let pde = PageEntryBits::from_bits(self.read_physical_u32(directory + directory_index(va) * 4));
        if !pde.present() {
            return None;
        }
        let pte = PageEntryBits::from_bits(self.read_physical_u32(pde.frame() + table_index(va) * 4));
        if !pte.present() {
            return None;
        }
        Some(pte.frame() + va.offset::<Size4K>().as_u32())
    }

    /// Number of single-page invalidations so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// Number of times interrupts went from enabled to disabled.
    #[must_use]
    pub fn interrupt_disables(&self) -> usize {
        self.interrupt_disables.get()
    }

    #[must_use]
    pub fn read_physical_u32(&self, pa: PhysicalAddress) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(self.physical(pa, 4));
        u32::from_le_bytes(bytes)
    }

    pub fn write_physical_u32(&self, pa: PhysicalAddress, value: u32) {
        self.physical(pa, 4).copy_from_slice(&value.to_le_bytes());
    }

    /// Reads through the MMU; the range may span discontiguous frames.
    #[must_use]
    pub fn read_bytes(&self, va: VirtualAddress, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.physical(self.resolve(va + index_to_u32(i)), 1)[0])
            .collect()
    }

    /// Writes through the MMU; the range may span discontiguous frames.
    pub fn write_bytes(&self, va: VirtualAddress, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.physical(self.resolve(va + index_to_u32(i)), 1)[0] = *byte;
        }
    }

    /// Translation as the CPU would perform it: cache first, then a walk.
    fn resolve(&self, va: VirtualAddress) -> PhysicalAddress {
        let page = va.page::<Size4K>().number();
        if let Some(frame) = self.tlb.borrow().get(&page) {
            return *frame + va.offset::<Size4K>().as_u32();
        }
        let Some(pa) = self.walk(va) else {
            panic!("page fault at {va} (cr3 {})", self.cr3.get());
        };
        self.tlb.borrow_mut().insert(page, pa.page::<Size4K>().base());
        pa
    }

    /// Resolves `len` bytes starting at `va`, which must be backed by
    /// physically contiguous frames.
    fn resolve_range(&self, va: VirtualAddress, len: usize) -> PhysicalAddress {
        let start = self.resolve(va);
        let len = index_to_u32(len);
        let mut offset = PAGE_SIZE - va.offset::<Size4K>().as_u32();
        while offset < len {
            let next = self.resolve(va + offset);
            assert_eq!(
                next,
                start + offset,
                "{va}+{offset:#x} is not physically contiguous with {va}"
            );
            offset += PAGE_SIZE;
        }
        start
    }

    #[allow(clippy::mut_from_ref)]
    fn physical(&self, pa: PhysicalAddress, len: usize) -> &mut [u8] {
        let index = (pa.as_u32() / PAGE_SIZE) as usize;
        let offset = pa.offset::<Size4K>().as_u32() as usize;
        assert!(
            index < self.memory.len() && index * FRAME + offset + len <= self.memory.len() * FRAME,
            "bus error: {pa}+{len:#x} beyond {:#x} bytes of RAM",
            self.memory.len() * FRAME
        );
        let base = self.memory[index].get().cast::<u8>();
        unsafe { core::slice::from_raw_parts_mut(base.add(offset), len) }
    }
}

fn index_to_u32(i: usize) -> u32 {
    u32::try_from(i).unwrap_or(u32::MAX)
}

impl Mmu for SimulatedMachine {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let pa = self.resolve_range(va, size_of::<T>());
        let bytes = self.physical(pa, size_of::<T>());
        let ptr = bytes.as_mut_ptr().cast::<T>();
        assert!(ptr.is_aligned(), "misaligned access at {va}");
        unsafe { &mut *ptr }
    }

    unsafe fn virt_to_slice<'a>(&self, va: VirtualAddress, len: usize) -> &'a mut [u8] {
        let pa = self.resolve_range(va, len);
        let bytes = self.physical(pa, len);
        unsafe { core::slice::from_raw_parts_mut(bytes.as_mut_ptr(), len) }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.tlb.borrow_mut().remove(&va.page::<Size4K>().number());
    }

    fn active_directory(&self) -> PhysicalAddress {
        self.cr3.get()
    }
}

impl InterruptControl for SimulatedMachine {
    fn status(&self) -> InterruptStatus {
        self.interrupts.get()
    }

    fn disable(&self) -> InterruptStatus {
        let previous = self.interrupts.replace(InterruptStatus::Disabled);
        if previous == InterruptStatus::Enabled {
            self.interrupt_disables.set(self.interrupt_disables.get() + 1);
        }
        previous
    }

    fn enable(&self) -> InterruptStatus {
        self.interrupts.replace(InterruptStatus::Enabled)
    }
}
