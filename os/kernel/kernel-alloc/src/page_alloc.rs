//! Page-granular allocation: reserve virtual pages, back them with frames,
//! bind them in the active directory.
//!
//! Every entry point holds the pool locks for its whole duration and either
//! completes or leaves pools, virtual spaces and page tables exactly as it
//! found them.

use crate::error::{AllocError, InvariantViolation, Resource, ensure, settle};
use crate::frame_pool::PoolKind;
use crate::manager::{MemoryManager, TableFrames};
use crate::scheduler::Scheduler;
use crate::vaddr_space::VirtualAddressSpace;
use kernel_info::memory::{
    ENTRIES_PER_TABLE, KERNEL_BASE, MAX_PAGES_PER_REQUEST, PAGE_SIZE,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, IrqGuard};
use kernel_vmem::{Binding, MapError, Mmu};

/// A request spans at most this many page tables.
const MAX_TABLES_PER_REQUEST: usize =
    (MAX_PAGES_PER_REQUEST.div_ceil(ENTRIES_PER_TABLE) + 1) as usize;

/// Page tables created while serving one request, for rollback.
#[derive(Default)]
struct CreatedTables {
    at: [Option<VirtualAddress>; MAX_TABLES_PER_REQUEST],
    len: usize,
}

impl CreatedTables {
    fn record(&mut self, binding: Binding, va: VirtualAddress) {
        if binding.created_table.is_some() && self.len < self.at.len() {
            self.at[self.len] = Some(va);
            self.len += 1;
        }
    }

    fn iter(&self) -> impl Iterator<Item = VirtualAddress> + '_ {
        self.at[..self.len].iter().flatten().copied()
    }
}

fn check_request(count: u32) -> Result<(), InvariantViolation> {
    ensure(
        count > 0 && count <= MAX_PAGES_PER_REQUEST,
        InvariantViolation::RequestSize {
            count,
            max: MAX_PAGES_PER_REQUEST,
        },
    )
}

fn check_side(kind: PoolKind, va: VirtualAddress) -> Result<(), InvariantViolation> {
    ensure(va.is_aligned::<Size4K>(), InvariantViolation::Misaligned { va })?;
    let kernel_half = va.as_u32() >= KERNEL_BASE;
    ensure(
        kernel_half == (kind == PoolKind::Kernel),
        InvariantViolation::OutsideSpace { va },
    )
}

impl<'m, M, I, S> MemoryManager<'m, M, I, S>
where
    M: Mmu,
    I: InterruptControl,
    S: Scheduler<'m>,
{
    /// `count` zeroed pages of kernel memory.
    pub fn allocate_kernel_pages(&self, count: u32) -> Option<VirtualAddress> {
        settle(self.try_allocate_kernel_pages(count))
    }

    /// `count` zeroed pages in the running process.
    pub fn allocate_user_pages(&self, count: u32) -> Option<VirtualAddress> {
        settle(self.try_allocate_user_pages(count))
    }

    /// `count` contiguous pages of `kind` memory; contents are undefined.
    pub fn allocate_pages(&self, kind: PoolKind, count: u32) -> Option<VirtualAddress> {
        settle(self.try_allocate_pages(kind, count))
    }

    /// One page at the chosen address `va`.
    pub fn allocate_fixed(&self, kind: PoolKind, va: VirtualAddress) -> Option<VirtualAddress> {
        settle(self.try_allocate_fixed(kind, va))
    }

    /// Backs `va` with a fresh frame without reserving it in any virtual
    /// space. For address spaces whose bookkeeping was copied from elsewhere.
    pub fn install_page(&self, kind: PoolKind, va: VirtualAddress) -> Option<VirtualAddress> {
        settle(self.try_install_page(kind, va))
    }

    pub fn free_pages(&self, kind: PoolKind, va: VirtualAddress, count: u32) {
        let _ = settle(self.try_free_pages(kind, va, count));
    }

    /// Returns one frame to the pool it came from, decided by its address.
    pub fn free_frame(&self, pa: PhysicalAddress) {
        let _ = settle(self.try_free_frame(pa));
    }

    /// Physical address of `va` in the active address space.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.page_tables().translate(va)
    }

    /// # Errors
    /// See [`try_allocate_pages`](Self::try_allocate_pages).
    pub fn try_allocate_kernel_pages(&self, count: u32) -> Result<VirtualAddress, AllocError> {
        self.allocate_zeroed(PoolKind::Kernel, count)
    }

    /// # Errors
    /// See [`try_allocate_pages`](Self::try_allocate_pages).
    pub fn try_allocate_user_pages(&self, count: u32) -> Result<VirtualAddress, AllocError> {
        self.allocate_zeroed(PoolKind::User, count)
    }

    /// # Errors
    /// - [`AllocError::Exhausted`] if virtual pages, frames or page table
    ///   frames run out; nothing is changed then.
    /// - [`AllocError::Invariant`] for a `count` outside `1..=3840`, or a
    ///   user request without a running process.
    pub fn try_allocate_pages(&self, kind: PoolKind, count: u32) -> Result<VirtualAddress, AllocError> {
        self.locked(kind, || {
            self.with_space(kind, |space| self.allocate_in(kind, space, count))
        })
    }

    /// # Errors
    /// - [`AllocError::Exhausted`] if no frame is left; the reservation is undone.
    /// - [`AllocError::Invariant`] if `va` is misaligned, already reserved, not
    ///   in the space of `kind`, or `kind` does not match the running context
    ///   (kernel memory from a kernel thread, user memory from a process).
    pub fn try_allocate_fixed(&self, kind: PoolKind, va: VirtualAddress) -> Result<VirtualAddress, AllocError> {
        let in_process = self.context_kind() == PoolKind::User;
        ensure(
            in_process == (kind == PoolKind::User),
            InvariantViolation::WrongContext { kind },
        )?;
        check_side(kind, va)?;

        self.locked(kind, || {
            self.with_space(kind, |space| {
                {
                    let _irq = IrqGuard::new(self.irq);
                    space.reserve_at(va)?;
                }
                if let Err(e) = self.back_page(kind, va, &mut CreatedTables::default()) {
                    space.release(va, 1)?;
                    log::warn!("fixed {kind} page at {va}: {e}");
                    return Err(e);
                }
                log::debug!("{kind}: fixed page at {va}");
                Ok(va)
            })
        })
    }

    /// # Errors
    /// - [`AllocError::Exhausted`] if no frame is left.
    /// - [`AllocError::Invariant`] if `va` is misaligned, on the wrong side of
    ///   the kernel base, or already mapped.
    pub fn try_install_page(&self, kind: PoolKind, va: VirtualAddress) -> Result<VirtualAddress, AllocError> {
        check_side(kind, va)?;
        self.locked(kind, || self.back_page(kind, va, &mut CreatedTables::default()))?;
        Ok(va)
    }

    /// # Errors
    /// [`AllocError::Invariant`] if any of the pages is not reserved, not
    /// mapped, or backed by a frame of the other pool. Nothing is freed then.
    pub fn try_free_pages(&self, kind: PoolKind, va: VirtualAddress, count: u32) -> Result<(), AllocError> {
        self.locked(kind, || {
            self.with_space(kind, |space| self.free_in(kind, space, va, count))
        })
    }

    /// # Errors
    /// [`AllocError::Invariant`] if `pa` is not an allocated frame.
    pub fn try_free_frame(&self, pa: PhysicalAddress) -> Result<(), AllocError> {
        let kind = self.pool_of(pa);
        self.locked(kind, || {
            let _irq = IrqGuard::new(self.irq);
            self.with_frames(kind, |pool| pool.free_frame(pa))
        })?;
        Ok(())
    }

    fn allocate_zeroed(&self, kind: PoolKind, count: u32) -> Result<VirtualAddress, AllocError> {
        self.locked(kind, || {
            let base = self.try_allocate_pages(kind, count)?;
            self.zero_pages(base, count);
            Ok(base)
        })
    }

    pub(crate) fn zero_pages(&self, base: VirtualAddress, count: u32) {
        for index in 0..count {
            let page = unsafe { self.mmu.virt_to_slice(base + index * PAGE_SIZE, PAGE_SIZE as usize) };
            page.fill(0);
        }
    }

    /// Reserves `count` pages in `space` and backs each with a frame of `kind`.
    /// The caller holds the locks of `kind`.
    pub(crate) fn allocate_in(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        count: u32,
    ) -> Result<VirtualAddress, AllocError> {
        check_request(count)?;
        let reserved = {
            let _irq = IrqGuard::new(self.irq);
            space.reserve(count)
        };
        let Some(base) = reserved else {
            log::warn!("{kind}: no run of {count} free virtual pages");
            return Err(AllocError::Exhausted(Resource::VirtualSpace));
        };

        let mut created = CreatedTables::default();
        for index in 0..count {
            let va = base + index * PAGE_SIZE;
            if let Err(e) = self.back_page(kind, va, &mut created) {
                self.roll_back(kind, space, base, index, count, &created)?;
                log::warn!("{kind}: {count} pages not available: {e}");
                return Err(e);
            }
        }

        log::debug!("{kind}: {count} pages at {base}");
        Ok(base)
    }

    /// Validates all `count` pages at `va`, then unmaps them, frees their
    /// frames and releases the reservation. The caller holds the locks of `kind`.
    pub(crate) fn free_in(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        va: VirtualAddress,
        count: u32,
    ) -> Result<(), AllocError> {
        check_request(count)?;
        ensure(va.is_aligned::<Size4K>(), InvariantViolation::Misaligned { va })?;
        space.check_reserved(va, count)?;

        let ptm = self.page_tables();
        let region = self.pool_region(kind);
        for index in 0..count {
            let page = va + index * PAGE_SIZE;
            let pa = ptm
                .translate(page)
                .ok_or(InvariantViolation::NotMapped { va: page })?;
            ensure(
                pa >= region.start() && pa < region.end(),
                InvariantViolation::ForeignFrame { pa, kind },
            )?;
        }

        let _irq = IrqGuard::new(self.irq);
        for index in 0..count {
            let frame = ptm.unbind(va + index * PAGE_SIZE)?;
            self.with_frames(kind, |pool| pool.free_frame(frame))?;
        }
        space.release(va, count)?;

        log::debug!("{kind}: freed {count} pages at {va}");
        Ok(())
    }

    /// Takes a frame of `kind` and binds it at `va`.
    fn back_page(&self, kind: PoolKind, va: VirtualAddress, created: &mut CreatedTables) -> Result<(), AllocError> {
        let _irq = IrqGuard::new(self.irq);
        let frame = self
            .with_frames(kind, |pool| pool.allocate_frame())
            .ok_or(AllocError::Exhausted(Resource::Frames))?;

        match self.bind(va, frame) {
            Ok(binding) => {
                created.record(binding, va);
                Ok(())
            }
            Err(e) => {
                self.with_frames(kind, |pool| pool.free_frame(frame))?;
                Err(e.into())
            }
        }
    }

    fn bind(&self, va: VirtualAddress, frame: PhysicalAddress) -> Result<Binding, MapError> {
        let kernel = self.kernel_pool();
        let mut tables = TableFrames(&kernel.frames);
        self.page_tables().bind(va, frame, &mut tables)
    }

    /// Undoes the first `bound` pages of a partially served request.
    fn roll_back(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        base: VirtualAddress,
        bound: u32,
        count: u32,
        created: &CreatedTables,
    ) -> Result<(), AllocError> {
        let _irq = IrqGuard::new(self.irq);
        let ptm = self.page_tables();

        for index in 0..bound {
            let frame = ptm.unbind(base + index * PAGE_SIZE)?;
            self.with_frames(kind, |pool| pool.free_frame(frame))?;
        }

        for va in created.iter() {
            match ptm.release_table(va) {
                Ok(table) => self.with_frames(PoolKind::Kernel, |pool| pool.free_frame(table))?,
                // Kernel tables are shared with every directory and stay.
                Err(MapError::SharedKernelTable { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        space.release(base, count)?;
        log::debug!("{kind}: rolled back {bound} of {count} pages at {base}");
        Ok(())
    }
}
