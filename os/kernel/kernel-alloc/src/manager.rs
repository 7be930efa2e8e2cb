//! The memory manager object: both frame pools, the kernel's virtual space
//! and block ladder, and the collaborators every operation goes through.

use crate::bitmap::Bitmap;
use crate::error::{AllocError, InvariantViolation};
use crate::frame_pool::{FramePool, PoolKind};
use crate::scheduler::Scheduler;
use crate::slab::BlockLadder;
use crate::vaddr_space::VirtualAddressSpace;
use core::cell::RefCell;
use kernel_info::layout::{BitmapPlacement, FrameRegion, MemoryLayout};
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{InterruptControl, OwnerId, RawTicket, ReentrantMutex, ReentrantMutexGuard};
use kernel_vmem::{FrameAlloc, Mmu, PageTableManager};

/// Kernel-side state, guarded by one lock.
pub(crate) struct KernelPool<'m> {
    pub(crate) frames: RefCell<FramePool<'m>>,
    pub(crate) space: RefCell<VirtualAddressSpace<'m>>,
    pub(crate) ladder: RefCell<BlockLadder>,
}

pub(crate) struct UserPool<'m> {
    pub(crate) frames: RefCell<FramePool<'m>>,
}

/// Snapshot of pool usage.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub kernel_free_frames: u32,
    pub user_free_frames: u32,
    pub kernel_reserved_pages: u32,
}

/// Owns all allocator state. Built once at boot and passed by reference.
///
/// Lock order is user pool before kernel pool: user allocations take page
/// table frames from the kernel pool, kernel allocations never touch the
/// user pool.
pub struct MemoryManager<'m, M, I, S>
where
    M: Mmu,
    I: InterruptControl,
    S: Scheduler<'m>,
{
    pub(crate) layout: MemoryLayout,
    pub(crate) mmu: &'m M,
    pub(crate) irq: &'m I,
    pub(crate) scheduler: &'m S,
    pub(crate) kernel: ReentrantMutex<KernelPool<'m>>,
    pub(crate) user: ReentrantMutex<UserPool<'m>>,
}

impl<'m, M, I, S> MemoryManager<'m, M, I, S>
where
    M: Mmu,
    I: InterruptControl,
    S: Scheduler<'m>,
{
    /// Sets up both pools and the kernel heap space from `layout`.
    ///
    /// # Safety
    /// - The bitmap ranges of `layout` must be mapped and writable in the
    ///   active address space and not used by anything else.
    /// - The pools of `layout` must be unused physical memory.
    /// - Only one manager may exist for a layout.
    pub unsafe fn new(layout: MemoryLayout, mmu: &'m M, irq: &'m I, scheduler: &'m S) -> Self {
        let bitmap = |placement: BitmapPlacement| {
            let bytes = unsafe { mmu.virt_to_slice(placement.address(), placement.bytes() as usize) };
            Bitmap::new(bytes, placement.bits())
        };

        let kernel_frames = FramePool::new(
            PoolKind::Kernel,
            layout.kernel_pool(),
            bitmap(layout.kernel_frame_bitmap()),
        );
        let user_frames = FramePool::new(
            PoolKind::User,
            layout.user_pool(),
            bitmap(layout.user_frame_bitmap()),
        );
        let space = VirtualAddressSpace::new(
            layout.kernel_heap_start(),
            bitmap(layout.kernel_space_bitmap()),
        );

        log::info!(
            "kernel pool: {} frames at {}, bitmap at {}",
            layout.kernel_pool().frames(),
            layout.kernel_pool().start(),
            layout.kernel_frame_bitmap().address()
        );
        log::info!(
            "user pool: {} frames at {}, bitmap at {}",
            layout.user_pool().frames(),
            layout.user_pool().start(),
            layout.user_frame_bitmap().address()
        );
        log::info!(
            "kernel heap: {} pages from {}",
            layout.kernel_space_bitmap().bits(),
            layout.kernel_heap_start()
        );

        Self {
            layout,
            mmu,
            irq,
            scheduler,
            kernel: ReentrantMutex::new(KernelPool {
                frames: RefCell::new(kernel_frames),
                space: RefCell::new(space),
                ladder: RefCell::new(BlockLadder::new()),
            }),
            user: ReentrantMutex::new(UserPool {
                frames: RefCell::new(user_frames),
            }),
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let owner = self.owner();
        let user = self.user.lock(owner);
        let kernel = self.kernel.lock(owner);
        let user_free_frames = user.frames.borrow().free_frames();
        let kernel_free_frames = kernel.frames.borrow().free_frames();
        let kernel_reserved_pages = kernel.space.borrow().reserved_pages();
        MemoryStats {
            kernel_free_frames,
            user_free_frames,
            kernel_reserved_pages,
        }
    }

    pub(crate) fn owner(&self) -> OwnerId {
        self.scheduler.current_task()
    }

    pub(crate) fn page_tables(&self) -> PageTableManager<'m, M> {
        PageTableManager::new(self.mmu)
    }

    pub(crate) fn kernel_pool(&self) -> ReentrantMutexGuard<'_, KernelPool<'m>, RawTicket> {
        self.kernel.lock(self.owner())
    }

    /// Holds the locks `kind` needs for the whole of `f`.
    pub(crate) fn locked<R>(&self, kind: PoolKind, f: impl FnOnce() -> R) -> R {
        let owner = self.owner();
        let _user = (kind == PoolKind::User).then(|| self.user.lock(owner));
        let _kernel = self.kernel.lock(owner);
        f()
    }

    pub(crate) fn with_frames<R>(&self, kind: PoolKind, f: impl FnOnce(&mut FramePool<'m>) -> R) -> R {
        match kind {
            PoolKind::Kernel => {
                let pool = self.kernel_pool();
                let mut frames = pool.frames.borrow_mut();
                f(&mut frames)
            }
            PoolKind::User => {
                let pool = self.user.lock(self.owner());
                let mut frames = pool.frames.borrow_mut();
                f(&mut frames)
            }
        }
    }

    pub(crate) const fn pool_region(&self, kind: PoolKind) -> FrameRegion {
        match kind {
            PoolKind::Kernel => self.layout.kernel_pool(),
            PoolKind::User => self.layout.user_pool(),
        }
    }

    /// Pool a physical address is accounted to.
    pub(crate) fn pool_of(&self, pa: PhysicalAddress) -> PoolKind {
        if pa >= self.layout.user_pool().start() {
            PoolKind::User
        } else {
            PoolKind::Kernel
        }
    }

    /// User memory when a process is running, kernel memory otherwise.
    pub(crate) fn context_kind(&self) -> PoolKind {
        self.scheduler.with_current_process(|process| {
            if process.is_some() {
                PoolKind::User
            } else {
                PoolKind::Kernel
            }
        })
    }

    /// Runs `f` on the virtual space `kind` allocates from.
    pub(crate) fn with_space<R>(
        &self,
        kind: PoolKind,
        f: impl FnOnce(&mut VirtualAddressSpace<'m>) -> Result<R, AllocError>,
    ) -> Result<R, AllocError> {
        self.with_heap(kind, |space, _| f(space))
    }

    /// Runs `f` on the virtual space and block ladder of `kind`.
    pub(crate) fn with_heap<R>(
        &self,
        kind: PoolKind,
        f: impl FnOnce(&mut VirtualAddressSpace<'m>, &mut BlockLadder) -> Result<R, AllocError>,
    ) -> Result<R, AllocError> {
        match kind {
            PoolKind::Kernel => {
                let pool = self.kernel_pool();
                let mut space = pool.space.borrow_mut();
                let mut ladder = pool.ladder.borrow_mut();
                f(&mut space, &mut ladder)
            }
            PoolKind::User => self.scheduler.with_current_process(|process| match process {
                Some(process) => f(&mut process.space, &mut process.ladder),
                None => Err(InvariantViolation::WrongContext { kind }.into()),
            }),
        }
    }
}

/// Hands out kernel frames for new page tables.
pub(crate) struct TableFrames<'a, 'm>(pub(crate) &'a RefCell<FramePool<'m>>);

impl FrameAlloc for TableFrames<'_, '_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.0.borrow_mut().allocate_frame()
    }
}
