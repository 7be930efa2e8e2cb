//! Installing and removing mappings in the active page directory.

use crate::recursive::{
    DIRECTORY_WINDOW, in_recursive_window, pde_address, pte_address, table_window,
};
use crate::{FrameAlloc, Mmu, PageEntryBits};
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_BASE, KERNEL_DIRECTORY_SLOT, PAGE_SIZE, RECURSIVE_SLOT};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};

/// Edits the page tables of whatever directory is active, through the
/// recursive mapping. Page-table frames come from the caller's [`FrameAlloc`].
pub struct PageTableManager<'m, M: Mmu> {
    mmu: &'m M,
}

/// Outcome of a successful [`PageTableManager::bind`].
#[must_use]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Binding {
    /// Frame of the page table created to hold the mapping, if any.
    pub created_table: Option<PhysicalAddress>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame available for a new page table")]
    OutOfFrames,
    #[error("{va} is already mapped to {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("{va} is not mapped")]
    NotMapped { va: VirtualAddress },
    #[error("{va} or {pa} is not page aligned")]
    Misaligned {
        va: VirtualAddress,
        pa: PhysicalAddress,
    },
    #[error("{va} lies in the recursive page table window")]
    RecursiveWindow { va: VirtualAddress },
    #[error("page table for {va} is shared by all address spaces")]
    SharedKernelTable { va: VirtualAddress },
}

impl<'m, M: Mmu> PageTableManager<'m, M> {
    pub const fn new(mmu: &'m M) -> Self {
        Self { mmu }
    }

    /// The directory entry covering `va`.
    #[must_use]
    pub fn directory_entry(&self, va: VirtualAddress) -> PageEntryBits {
        PageEntryBits::from_bits(*unsafe { self.entry_mut(pde_address(va)) })
    }

    /// The table entry for `va`; `None` when there is no page table.
    #[must_use]
    pub fn table_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        if !self.directory_entry(va).present() {
            return None;
        }
        Some(PageEntryBits::from_bits(*unsafe {
            self.entry_mut(pte_address(va))
        }))
    }

    /// Physical address `va` maps to, `None` if unmapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pte = self.table_entry(va).filter(PageEntryBits::present)?;
        Some(pte.frame() + va.offset::<Size4K>().as_u32())
    }

    /// Maps the page at `va` to the frame at `pa`.
    ///
    /// A missing page table is taken from `tables`, zeroed, and installed.
    ///
    /// # Errors
    /// - [`MapError::OutOfFrames`] if a page table is needed and `tables` is empty.
    /// - [`MapError::AlreadyMapped`] if `va` is mapped; the entry is left alone.
    /// - [`MapError::Misaligned`] / [`MapError::RecursiveWindow`] for bad arguments.
    pub fn bind<A: FrameAlloc + ?Sized>(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        tables: &mut A,
    ) -> Result<Binding, MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Misaligned { va, pa });
        }
        if in_recursive_window(va) {
            return Err(MapError::RecursiveWindow { va });
        }

        let mut created_table = None;
        if !self.directory_entry(va).present() {
            let table = tables.alloc_4k().ok_or(MapError::OutOfFrames)?;
            let pde = unsafe { self.entry_mut(pde_address(va)) };
            *pde = PageEntryBits::user_rw(table).into_bits();

            let window = table_window(va);
            self.mmu.invalidate_page(window);
            let fresh = unsafe { self.mmu.virt_to_slice(window, PAGE_SIZE as usize) };
            fresh.fill(0);

            log::trace!("page table {table} installed for {}", va.page::<Size4M>());
            created_table = Some(table);
        }

        let pte = unsafe { self.entry_mut(pte_address(va)) };
        let current = PageEntryBits::from_bits(*pte);
        if current.present() {
            return Err(MapError::AlreadyMapped {
                va,
                existing: current.frame(),
            });
        }
        *pte = PageEntryBits::user_rw(pa).into_bits();
        Ok(Binding { created_table })
    }

    /// Removes the mapping of `va` and drops its cached translation.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is nothing to remove.
    pub fn unbind(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        let va = va.align_down::<Size4K>();
        let entry = self
            .table_entry(va)
            .filter(PageEntryBits::present)
            .ok_or(MapError::NotMapped { va })?;

        let pte = unsafe { self.entry_mut(pte_address(va)) };
        *pte = 0;
        self.mmu.invalidate_page(va);
        Ok(entry.frame())
    }

    /// Uninstalls the page table covering `va` and returns its frame.
    ///
    /// Mappings still in the table become unreachable; callers free them first.
    /// Tables of the kernel half are shared by every directory and stay.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no table, or
    /// [`MapError::SharedKernelTable`] for kernel addresses.
    pub fn release_table(&self, va: VirtualAddress) -> Result<PhysicalAddress, MapError> {
        if va.as_u32() >= KERNEL_BASE {
            return Err(MapError::SharedKernelTable { va });
        }
        let pde = self.directory_entry(va);
        if !pde.present() {
            return Err(MapError::NotMapped { va });
        }

        let entry = unsafe { self.entry_mut(pde_address(va)) };
        *entry = 0;
        self.mmu.invalidate_page(table_window(va));
        log::trace!("page table {} released", pde.frame());
        Ok(pde.frame())
    }

    /// Turns the zeroed page at `directory` (backed by `frame`) into a page
    /// directory: the kernel half is copied from the active directory and the
    /// last slot maps the new directory onto itself.
    ///
    /// # Safety
    /// `directory` must be a mapped, writable page that is not in use as a
    /// page directory or page table.
    pub unsafe fn init_directory(&self, directory: VirtualAddress, frame: PhysicalAddress) {
        let kernel = KERNEL_DIRECTORY_SLOT as usize..RECURSIVE_SLOT as usize;

        let active = unsafe { self.mmu.virt_to_mut::<[u32; ENTRIES_PER_TABLE as usize]>(DIRECTORY_WINDOW) };
        let target = unsafe { self.mmu.virt_to_mut::<[u32; ENTRIES_PER_TABLE as usize]>(directory) };

        target[..kernel.start].fill(0);
        target[kernel.clone()].copy_from_slice(&active[kernel]);
        target[RECURSIVE_SLOT as usize] = PageEntryBits::user_rw(frame).into_bits();
    }

    /// # Safety
    /// `at` must be a directory or table entry address whose containing
    /// structure is present.
    unsafe fn entry_mut<'a>(&self, at: VirtualAddress) -> &'a mut u32 {
        unsafe { self.mmu.virt_to_mut::<u32>(at) }
    }
}
