//! Physical frame pools.
//!
//! Free memory is split into a kernel and a user pool at boot. Each pool is
//! a bitmap over a contiguous run of frames; bit `i` is set while the frame
//! at `start + i * PAGE_SIZE` is handed out.

use crate::bitmap::Bitmap;
use crate::error::{InvariantViolation, ensure};
use core::fmt;
use kernel_info::layout::FrameRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// Which side of the split a frame or page belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PoolKind {
    Kernel,
    User,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kernel => "kernel",
            Self::User => "user",
        })
    }
}

pub struct FramePool<'a> {
    kind: PoolKind,
    region: FrameRegion,
    bitmap: Bitmap<'a>,
}

impl<'a> FramePool<'a> {
    /// A pool over `region` with every frame free.
    pub fn new(kind: PoolKind, region: FrameRegion, mut bitmap: Bitmap<'a>) -> Self {
        debug_assert_eq!(bitmap.bits(), region.frames());
        bitmap.clear_all();
        Self {
            kind,
            region,
            bitmap,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PoolKind {
        self.kind
    }

    #[must_use]
    pub const fn region(&self) -> FrameRegion {
        self.region
    }

    #[must_use]
    pub fn free_frames(&self) -> u32 {
        self.region.frames() - self.bitmap.count_set()
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa >= self.region.start() && pa < self.region.end()
    }

    /// First free frame, now marked allocated.
    pub fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let index = self.bitmap.scan(1)?;
        self.bitmap.set(index, true);
        Some(self.region.start() + index * PAGE_SIZE)
    }

    /// Returns the frame at `pa` to the pool.
    ///
    /// # Errors
    /// The frame is not a frame of this pool or was not allocated.
    pub fn free_frame(&mut self, pa: PhysicalAddress) -> Result<(), InvariantViolation> {
        ensure(
            self.contains(pa) && pa.is_aligned::<Size4K>(),
            InvariantViolation::ForeignFrame { pa, kind: self.kind },
        )?;
        let index = (pa.as_u32() - self.region.start().as_u32()) / PAGE_SIZE;
        ensure(self.bitmap.test(index), InvariantViolation::FrameNotAllocated { pa })?;
        self.bitmap.set(index, false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::layout::LayoutConfig;
    use kernel_info::memory::BOOT_RESERVED_BYTES;

    fn kernel_region() -> FrameRegion {
        LayoutConfig::new(BOOT_RESERVED_BYTES + 16 * PAGE_SIZE)
            .build()
            .unwrap()
            .kernel_pool()
    }

    #[test]
    fn frames_are_handed_out_lowest_first() {
        let mut storage = [0xffu8; 1];
        let mut pool = FramePool::new(PoolKind::Kernel, kernel_region(), Bitmap::new(&mut storage, 8));
        let start = PhysicalAddress::new(BOOT_RESERVED_BYTES);

        assert_eq!(pool.free_frames(), 8);
        assert_eq!(pool.allocate_frame(), Some(start));
        assert_eq!(pool.allocate_frame(), Some(start + PAGE_SIZE));
        pool.free_frame(start).unwrap();
        assert_eq!(pool.allocate_frame(), Some(start));
        assert_eq!(pool.free_frames(), 6);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut storage = [0u8; 1];
        let mut pool = FramePool::new(PoolKind::Kernel, kernel_region(), Bitmap::new(&mut storage, 8));
        for _ in 0..8 {
            assert!(pool.allocate_frame().is_some());
        }
        assert_eq!(pool.allocate_frame(), None);
        assert_eq!(pool.free_frames(), 0);
    }

    #[test]
    fn foreign_and_double_frees_are_violations() {
        let mut storage = [0u8; 1];
        let mut pool = FramePool::new(PoolKind::Kernel, kernel_region(), Bitmap::new(&mut storage, 8));
        let outside = PhysicalAddress::new(BOOT_RESERVED_BYTES + 8 * PAGE_SIZE);
        let inside = PhysicalAddress::new(BOOT_RESERVED_BYTES);

        assert_eq!(
            pool.free_frame(outside),
            Err(InvariantViolation::ForeignFrame { pa: outside, kind: PoolKind::Kernel })
        );
        assert_eq!(
            pool.free_frame(inside),
            Err(InvariantViolation::FrameNotAllocated { pa: inside })
        );
        assert!(!pool.contains(PhysicalAddress::new(BOOT_RESERVED_BYTES - PAGE_SIZE)));
    }
}
