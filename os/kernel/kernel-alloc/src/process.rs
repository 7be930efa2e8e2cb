//! Per-process memory: a page directory sharing the kernel half, a private
//! virtual address space and a private heap ladder.

use crate::bitmap::Bitmap;
use crate::error::{AllocError, InvariantViolation, ensure, settle};
use crate::frame_pool::PoolKind;
use crate::manager::MemoryManager;
use crate::scheduler::Scheduler;
use crate::slab::BlockLadder;
use crate::vaddr_space::VirtualAddressSpace;
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_DIRECTORY_SLOT, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{InterruptControl, IrqGuard};
use kernel_vmem::Mmu;
use kernel_vmem::recursive::directory_index;

/// Memory owned by one process. Lives as long as the process.
pub struct ProcessMemory<'m> {
    directory: VirtualAddress,
    directory_frame: PhysicalAddress,
    bitmap: VirtualAddress,
    bitmap_pages: u32,
    pub(crate) space: VirtualAddressSpace<'m>,
    pub(crate) ladder: BlockLadder,
}

impl<'m> ProcessMemory<'m> {
    /// Kernel address of the page directory.
    #[must_use]
    pub const fn directory(&self) -> VirtualAddress {
        self.directory
    }

    /// Value for CR3 when this process runs.
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalAddress {
        self.directory_frame
    }

    #[must_use]
    pub const fn space(&self) -> &VirtualAddressSpace<'m> {
        &self.space
    }

    #[must_use]
    pub const fn ladder(&self) -> &BlockLadder {
        &self.ladder
    }
}

impl<'m, M, I, S> MemoryManager<'m, M, I, S>
where
    M: Mmu,
    I: InterruptControl,
    S: Scheduler<'m>,
{
    pub fn create_process_memory(&self) -> Option<ProcessMemory<'m>> {
        settle(self.try_create_process_memory())
    }

    pub fn release_user_space(&self, process: &mut ProcessMemory<'m>) {
        let _ = settle(self.try_release_user_space(process));
    }

    pub fn destroy_process_memory(&self, process: ProcessMemory<'m>) {
        let _ = settle(self.try_destroy_process_memory(process));
    }

    /// Builds the directory, the bitmap of the user space and an empty ladder
    /// from kernel memory. Either all of it is allocated or none.
    ///
    /// # Errors
    /// [`AllocError::Exhausted`] if kernel memory runs out.
    pub fn try_create_process_memory(&self) -> Result<ProcessMemory<'m>, AllocError> {
        self.locked(PoolKind::Kernel, || {
            let directory = self.try_allocate_kernel_pages(1)?;
            let directory_frame = self
                .translate(directory)
                .ok_or(InvariantViolation::NotMapped { va: directory })?;
            unsafe { self.page_tables().init_directory(directory, directory_frame) };

            let bits = self.layout.user_space_pages();
            let bytes = self.layout.user_space_bitmap_bytes();
            let bitmap_pages = bytes.div_ceil(PAGE_SIZE);
            let bitmap = match self.try_allocate_kernel_pages(bitmap_pages) {
                Ok(bitmap) => bitmap,
                Err(e) => {
                    self.try_free_pages(PoolKind::Kernel, directory, 1)?;
                    return Err(e);
                }
            };
            let storage = unsafe { self.mmu.virt_to_slice(bitmap, bytes as usize) };

            log::info!(
                "process memory: directory {directory_frame}, {bits} user pages from {}",
                self.layout.user_space_start()
            );
            Ok(ProcessMemory {
                directory,
                directory_frame,
                bitmap,
                bitmap_pages,
                space: VirtualAddressSpace::new(self.layout.user_space_start(), Bitmap::new(storage, bits)),
                ladder: BlockLadder::new(),
            })
        })
    }

    /// Frees every user frame and user page table of `process`, then forgets
    /// its reservations and heap.
    ///
    /// # Errors
    /// [`AllocError::Invariant`] if `process` is not the active address
    /// space, or a mapped frame is not a user frame.
    pub fn try_release_user_space(&self, process: &mut ProcessMemory<'m>) -> Result<(), AllocError> {
        let directory = process.directory_frame;
        ensure(
            self.mmu.active_directory() == directory,
            InvariantViolation::ProcessInactive { directory },
        )?;

        self.locked(PoolKind::User, || {
            let ptm = self.page_tables();
            let _irq = IrqGuard::new(self.irq);
            let (mut frames, mut tables) = (0u32, 0u32);

            let first = directory_index(self.layout.user_space_start());
            for slot in first..KERNEL_DIRECTORY_SLOT {
                let table = VirtualAddress::new(slot << 22);
                if !ptm.directory_entry(table).present() {
                    continue;
                }
                for index in 0..ENTRIES_PER_TABLE {
                    let page = table + index * PAGE_SIZE;
                    if ptm.translate(page).is_none() {
                        continue;
                    }
                    let frame = ptm.unbind(page)?;
                    self.with_frames(PoolKind::User, |pool| pool.free_frame(frame))?;
                    frames += 1;
                }
                let table_frame = ptm.release_table(table)?;
                self.with_frames(PoolKind::Kernel, |pool| pool.free_frame(table_frame))?;
                tables += 1;
            }

            process.space.clear();
            process.ladder.reset();
            log::info!("process memory {directory}: released {frames} frames and {tables} page tables");
            Ok(())
        })
    }

    /// Frees the bitmap and the directory of a process whose user space has
    /// been released.
    ///
    /// # Errors
    /// [`AllocError::Invariant`] if the directory is still active or still
    /// maps user memory.
    pub fn try_destroy_process_memory(&self, process: ProcessMemory<'m>) -> Result<(), AllocError> {
        let ProcessMemory {
            directory,
            directory_frame,
            bitmap,
            bitmap_pages,
            ..
        } = process;
        ensure(
            self.mmu.active_directory() != directory_frame,
            InvariantViolation::ProcessActive {
                directory: directory_frame,
            },
        )?;

        let entries = unsafe {
            self.mmu
                .virt_to_mut::<[u32; ENTRIES_PER_TABLE as usize]>(directory)
        };
        ensure(
            entries[..KERNEL_DIRECTORY_SLOT as usize].iter().all(|&entry| entry == 0),
            InvariantViolation::UserMappingsRemain {
                directory: directory_frame,
            },
        )?;

        self.locked(PoolKind::Kernel, || {
            self.try_free_pages(PoolKind::Kernel, bitmap, bitmap_pages)?;
            self.try_free_pages(PoolKind::Kernel, directory, 1)
        })?;
        log::info!("process memory {directory_frame}: destroyed");
        Ok(())
    }
}
