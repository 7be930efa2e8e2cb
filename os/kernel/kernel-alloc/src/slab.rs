//! The general-purpose heap.
//!
//! Requests up to [`LARGE_THRESHOLD`] bytes are served from arenas: single
//! pages that start with an [`ArenaHeader`] and are carved into blocks of one
//! size class. Free blocks are chained through their first word. Larger
//! requests get a run of whole pages with a header in front.
//!
//! ```text
//! small arena (one page)                 large allocation (n pages)
//! ┌────────┬───────┬───────┬─────┐       ┌────────┬──────────────────────┐
//! │ header │ block │ block │ ... │       │ header │ payload ...          │
//! └────────┴───────┴───────┴─────┘       └────────┴──────────────────────┘
//!  class, free count                      page count
//! ```

use crate::error::{AllocError, InvariantViolation, ensure, settle};
use crate::frame_pool::PoolKind;
use crate::manager::MemoryManager;
use crate::scheduler::Scheduler;
use crate::vaddr_space::VirtualAddressSpace;
use bitfield_struct::bitfield;
use kernel_info::memory::{KERNEL_BASE, MAX_PAGES_PER_REQUEST, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, IrqGuard};
use kernel_vmem::Mmu;

/// Block sizes of the ladder, smallest first.
pub const BLOCK_SIZES: [u32; 7] = [16, 32, 64, 128, 256, 512, 1024];

/// Requests above this size bypass the ladder.
pub const LARGE_THRESHOLD: u32 = 1024;

/// Marks a page as an arena.
pub const ARENA_MAGIC: u16 = 0xa4e5;

/// Size of [`ArenaHeader`] at the start of every arena.
pub const HEADER_BYTES: u32 = size_of::<u64>() as u32;

/// Header at the start of every arena page.
///
/// | Bits  | Field | Meaning |
/// |-------|-------|---------|
/// | 0–15  | magic | [`ARENA_MAGIC`] |
/// | 16–23 | class | Index into [`BLOCK_SIZES`] (small arenas) |
/// | 24    | large | Set for a run of whole pages |
/// | 32–63 | count | Free blocks (small) or pages owned (large) |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct ArenaHeader {
    pub magic: u16,
    pub class: u8,
    pub large: bool,
    #[bits(7)]
    __: u8,
    pub count: u32,
}

/// Decoded view of an arena, as returned by
/// [`MemoryManager::describe_arena`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ArenaInfo {
    pub arena: VirtualAddress,
    /// Block size of the class, `None` for large allocations.
    pub block_size: Option<u32>,
    /// Free blocks, or pages for large allocations.
    pub count: u32,
    pub large: bool,
}

/// The arena page a block or large allocation lives in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Arena(VirtualAddress);

impl Arena {
    #[must_use]
    pub const fn of(address: VirtualAddress) -> Self {
        Self(address.align_down::<Size4K>())
    }

    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.0
    }

    #[must_use]
    pub const fn first_block(self) -> VirtualAddress {
        VirtualAddress::new(self.0.as_u32() + HEADER_BYTES)
    }

    #[must_use]
    pub fn contains(self, address: VirtualAddress) -> bool {
        Self::of(address) == self
    }
}

/// One size class and its free list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockDescriptor {
    block_size: u32,
    blocks_per_arena: u32,
    free_head: Option<VirtualAddress>,
    free_len: u32,
}

impl BlockDescriptor {
    #[must_use]
    pub const fn new(block_size: u32) -> Self {
        Self {
            block_size,
            blocks_per_arena: (PAGE_SIZE - HEADER_BYTES) / block_size,
            free_head: None,
            free_len: 0,
        }
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub const fn blocks_per_arena(&self) -> u32 {
        self.blocks_per_arena
    }

    /// Free blocks on the list, across all arenas of this class.
    #[must_use]
    pub const fn free_blocks(&self) -> u32 {
        self.free_len
    }
}

/// The size classes of one heap (the kernel's or a process').
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockLadder {
    classes: [BlockDescriptor; BLOCK_SIZES.len()],
}

impl Default for BlockLadder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockLadder {
    #[must_use]
    pub const fn new() -> Self {
        let mut classes = [BlockDescriptor::new(BLOCK_SIZES[0]); BLOCK_SIZES.len()];
        let mut i = 1;
        while i < BLOCK_SIZES.len() {
            classes[i] = BlockDescriptor::new(BLOCK_SIZES[i]);
            i += 1;
        }
        Self { classes }
    }

    /// Smallest class holding `size` bytes; `None` above [`LARGE_THRESHOLD`].
    #[must_use]
    pub fn class_for(&self, size: u32) -> Option<usize> {
        self.classes.iter().position(|c| c.block_size >= size)
    }

    #[must_use]
    pub fn descriptor(&self, class: usize) -> Option<&BlockDescriptor> {
        self.classes.get(class)
    }

    /// Empties every free list. Only valid once all arenas are gone.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl<'m, M, I, S> MemoryManager<'m, M, I, S>
where
    M: Mmu,
    I: InterruptControl,
    S: Scheduler<'m>,
{
    /// `size` zeroed bytes from the heap of the running context.
    pub fn allocate(&self, size: u32) -> Option<VirtualAddress> {
        settle(self.try_allocate(size))
    }

    /// Returns memory obtained from [`allocate`](Self::allocate).
    pub fn free(&self, address: VirtualAddress) {
        let _ = settle(self.try_free(address));
    }

    /// # Errors
    /// - [`AllocError::InvalidSize`] for zero, for at least the size of the
    ///   pool, or for more pages than one request may take.
    /// - [`AllocError::Exhausted`] if no memory is left.
    pub fn try_allocate(&self, size: u32) -> Result<VirtualAddress, AllocError> {
        let kind = self.context_kind();
        if size == 0 || size >= self.pool_region(kind).size_bytes() {
            return Err(AllocError::InvalidSize { size });
        }

        self.locked(kind, || {
            self.with_heap(kind, |space, ladder| match ladder.class_for(size) {
                Some(class) => self.allocate_block(kind, space, ladder, class),
                None => self.allocate_large(kind, space, size),
            })
        })
    }

    /// # Errors
    /// [`AllocError::Invariant`] if `address` is not a live heap allocation.
    pub fn try_free(&self, address: VirtualAddress) -> Result<(), AllocError> {
        let kind = if address.as_u32() >= KERNEL_BASE {
            PoolKind::Kernel
        } else {
            PoolKind::User
        };

        self.locked(kind, || {
            self.with_heap(kind, |space, ladder| {
                let arena = Arena::of(address);
                let header = self.read_header(arena)?;
                if header.large() {
                    ensure(
                        address == arena.first_block(),
                        InvariantViolation::NotABlock { va: address },
                    )?;
                    self.free_in(kind, space, arena.base(), header.count())
                } else {
                    self.free_block(kind, space, ladder, address, header)
                }
            })
        })
    }

    /// Decodes the header of the arena `address` lies in.
    ///
    /// # Errors
    /// [`AllocError::Invariant`] if the page is unmapped or not an arena.
    pub fn describe_arena(&self, address: VirtualAddress) -> Result<ArenaInfo, AllocError> {
        let arena = Arena::of(address);
        let header = self.read_header(arena)?;
        Ok(ArenaInfo {
            arena: arena.base(),
            block_size: (!header.large()).then(|| BLOCK_SIZES[usize::from(header.class())]),
            count: header.count(),
            large: header.large(),
        })
    }

    /// Size class `class` of the running context's heap, `None` past the
    /// last class.
    #[must_use]
    pub fn heap_class(&self, class: usize) -> Option<BlockDescriptor> {
        let kind = self.context_kind();
        self.locked(kind, || {
            self.with_heap(kind, |_, ladder| Ok(ladder.descriptor(class).copied()))
                .ok()
                .flatten()
        })
    }

    fn allocate_large(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        size: u32,
    ) -> Result<VirtualAddress, AllocError> {
        let pages = size
            .checked_add(HEADER_BYTES)
            .map(|bytes| bytes.div_ceil(PAGE_SIZE))
            .filter(|&pages| pages <= MAX_PAGES_PER_REQUEST)
            .ok_or(AllocError::InvalidSize { size })?;

        let base = self.allocate_in(kind, space, pages)?;
        self.zero_pages(base, pages);

        let arena = Arena::of(base);
        self.write_header(
            arena,
            ArenaHeader::new()
                .with_magic(ARENA_MAGIC)
                .with_large(true)
                .with_count(pages),
        );
        log::trace!("{kind}: large allocation of {size} bytes, {pages} pages at {base}");
        Ok(arena.first_block())
    }

    fn allocate_block(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        ladder: &mut BlockLadder,
        class: usize,
    ) -> Result<VirtualAddress, AllocError> {
        let descriptor = &mut ladder.classes[class];
        let block = match descriptor.free_head {
            Some(block) => block,
            None => self.new_arena(kind, space, descriptor, class)?,
        };

        let _irq = IrqGuard::new(self.irq);
        descriptor.free_head = self.next_block(block);
        descriptor.free_len -= 1;

        let arena = Arena::of(block);
        let header = self.read_header(arena)?;
        self.write_header(arena, header.with_count(header.count() - 1));

        let bytes = unsafe { self.mmu.virt_to_slice(block, descriptor.block_size as usize) };
        bytes.fill(0);
        Ok(block)
    }

    /// Takes one page and puts all of its blocks on the free list. Returns
    /// the new list head.
    fn new_arena(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        descriptor: &mut BlockDescriptor,
        class: usize,
    ) -> Result<VirtualAddress, AllocError> {
        let page = self.allocate_in(kind, space, 1)?;
        self.zero_pages(page, 1);

        let _irq = IrqGuard::new(self.irq);
        let arena = Arena::of(page);
        self.write_header(
            arena,
            ArenaHeader::new()
                .with_magic(ARENA_MAGIC)
                .with_class(u8::try_from(class).unwrap_or(u8::MAX))
                .with_count(descriptor.blocks_per_arena),
        );
        // Pushed from the back so the lowest block is handed out first.
        for index in (0..descriptor.blocks_per_arena).rev() {
            let block = arena.first_block() + index * descriptor.block_size;
            self.set_next_block(block, descriptor.free_head);
            descriptor.free_head = Some(block);
        }
        descriptor.free_len += descriptor.blocks_per_arena;

        log::trace!(
            "{kind}: arena of {} x {} bytes at {page}",
            descriptor.blocks_per_arena,
            descriptor.block_size
        );
        Ok(arena.first_block())
    }

    fn free_block(
        &self,
        kind: PoolKind,
        space: &mut VirtualAddressSpace<'m>,
        ladder: &mut BlockLadder,
        address: VirtualAddress,
        header: ArenaHeader,
    ) -> Result<(), AllocError> {
        let arena = Arena::of(address);
        let class = usize::from(header.class());
        let descriptor = ladder
            .classes
            .get_mut(class)
            .ok_or(InvariantViolation::CorruptArena { arena: arena.base() })?;

        let offset = address.checked_offset_from(arena.first_block());
        let on_boundary = offset.is_some_and(|offset| {
            offset % descriptor.block_size == 0
                && offset / descriptor.block_size < descriptor.blocks_per_arena
        });
        ensure(on_boundary, InvariantViolation::NotABlock { va: address })?;
        ensure(
            header.count() < descriptor.blocks_per_arena
                && !self.is_free(descriptor, address, header.count()),
            InvariantViolation::DoubleFree { va: address },
        )?;

        {
            let _irq = IrqGuard::new(self.irq);
            self.set_next_block(address, descriptor.free_head);
            descriptor.free_head = Some(address);
            descriptor.free_len += 1;
            self.write_header(arena, header.with_count(header.count() + 1));
        }

        if header.count() + 1 == descriptor.blocks_per_arena {
            self.unlink_arena(descriptor, arena);
            log::trace!("{kind}: arena at {} is empty, reclaiming", arena.base());
            self.free_in(kind, space, arena.base(), 1)?;
        }
        Ok(())
    }

    /// Whether `address` is already on the free list. The walk ends once the
    /// `free_in_arena` free blocks of its arena have all been passed.
    fn is_free(&self, descriptor: &BlockDescriptor, address: VirtualAddress, free_in_arena: u32) -> bool {
        let arena = Arena::of(address);
        let mut seen = 0;
        let mut current = descriptor.free_head;
        while seen < free_in_arena
            && let Some(block) = current
        {
            if block == address {
                return true;
            }
            if arena.contains(block) {
                seen += 1;
            }
            current = self.next_block(block);
        }
        false
    }

    /// Drops every block of `arena` from the free list.
    fn unlink_arena(&self, descriptor: &mut BlockDescriptor, arena: Arena) {
        let _irq = IrqGuard::new(self.irq);
        let mut previous: Option<VirtualAddress> = None;
        let mut current = descriptor.free_head;
        while let Some(block) = current {
            let next = self.next_block(block);
            if arena.contains(block) {
                match previous {
                    Some(previous) => self.set_next_block(previous, next),
                    None => descriptor.free_head = next,
                }
                descriptor.free_len -= 1;
            } else {
                previous = Some(block);
            }
            current = next;
        }
    }

    fn read_header(&self, arena: Arena) -> Result<ArenaHeader, AllocError> {
        let base = arena.base();
        ensure(
            self.translate(base).is_some(),
            InvariantViolation::NotMapped { va: base },
        )?;
        let header = ArenaHeader::from_bits(*unsafe { self.mmu.virt_to_mut::<u64>(base) });
        let valid = header.magic() == ARENA_MAGIC
            && (header.large() || usize::from(header.class()) < BLOCK_SIZES.len());
        ensure(valid, InvariantViolation::CorruptArena { arena: base })?;
        Ok(header)
    }

    fn write_header(&self, arena: Arena, header: ArenaHeader) {
        let slot = unsafe { self.mmu.virt_to_mut::<u64>(arena.base()) };
        *slot = header.into_bits();
    }

    fn next_block(&self, block: VirtualAddress) -> Option<VirtualAddress> {
        let link = *unsafe { self.mmu.virt_to_mut::<u32>(block) };
        (link != 0).then(|| VirtualAddress::new(link))
    }

    fn set_next_block(&self, block: VirtualAddress, next: Option<VirtualAddress>) {
        let link = unsafe { self.mmu.virt_to_mut::<u32>(block) };
        *link = next.map_or(0, VirtualAddress::as_u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = ArenaHeader::new()
            .with_magic(ARENA_MAGIC)
            .with_class(3)
            .with_count(31);
        assert_eq!(header.into_bits(), 0x0000_001f_0003_a4e5);
        assert!(!header.large());

        let large = ArenaHeader::from_bits(0x0000_0002_0100_a4e5);
        assert!(large.large());
        assert_eq!(large.count(), 2);
        assert_eq!(HEADER_BYTES, 8);
    }

    #[test]
    fn classes_round_up_to_the_next_size() {
        let ladder = BlockLadder::new();
        let size_of_class = |size| ladder.class_for(size).map(|c| BLOCK_SIZES[c]);

        assert_eq!(size_of_class(1), Some(16));
        assert_eq!(size_of_class(16), Some(16));
        assert_eq!(size_of_class(20), Some(32));
        assert_eq!(size_of_class(513), Some(1024));
        assert_eq!(size_of_class(1024), Some(1024));
        assert_eq!(size_of_class(LARGE_THRESHOLD + 1), None);
    }

    #[test]
    fn blocks_per_arena_leave_room_for_the_header() {
        let ladder = BlockLadder::new();
        let per_arena: [u32; 7] =
            core::array::from_fn(|c| ladder.descriptor(c).unwrap().blocks_per_arena());
        assert_eq!(per_arena, [255, 127, 63, 31, 15, 7, 3]);
    }

    #[test]
    fn arena_of_masks_to_the_page() {
        let arena = Arena::of(VirtualAddress::new(0xc010_2abc));
        assert_eq!(arena.base(), VirtualAddress::new(0xc010_2000));
        assert_eq!(arena.first_block(), VirtualAddress::new(0xc010_2008));
        assert!(arena.contains(VirtualAddress::new(0xc010_2fff)));
        assert!(!arena.contains(VirtualAddress::new(0xc010_3000)));
    }
}
