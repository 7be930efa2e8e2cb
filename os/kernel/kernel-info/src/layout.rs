//! # Runtime Memory Layout
//!
//! The split of physical memory into pools and the placement of the
//! allocator bitmaps both depend on how much memory the loader detected.
//! [`LayoutConfig`] collects the inputs (defaulting to the fixed addresses in
//! [`memory`](crate::memory)) and [`LayoutConfig::build`] derives the
//! [`MemoryLayout`] the allocator is initialized from.
//!
//! ```text
//! Physical                               Virtual (kernel half)
//! 0x0000_0000 ┌──────────────────┐       0xc000_0000 ┌──────────────────┐
//!             │ low 1 MiB        │ ◄──────────────── │ low 1 MiB        │
//! 0x0010_0000 ├──────────────────┤       0xc009_a000 │  ├ bitmaps       │
//!             │ directory+tables │       0xc010_0000 ├──────────────────┤
//! 0x0020_0000 ├──────────────────┤                   │ kernel heap      │
//!             │ kernel pool      │                   │ (one bit per     │
//!             ├──────────────────┤                   │  kernel frame)   │
//!             │ user pool        │                   └──────────────────┘
//!             └──────────────────┘
//! ```

use crate::boot::LoaderMemoryReport;
use crate::memory::{
    BOOT_RESERVED_BYTES, KERNEL_BASE, KERNEL_HEAP_START, MEM_BITMAP_BASE,
    MEM_BITMAP_REGION_BYTES, PAGE_SIZE, RECURSIVE_WINDOW_BASE, USER_VADDR_END, USER_VADDR_START,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use utils_accessors_derive::{Getters, Setters};

/// Inputs to the layout computation.
///
/// ```rust
/// # use kernel_info::layout::LayoutConfig;
/// # use kernel_memory_addresses::VirtualAddress;
/// let layout = LayoutConfig::new(32 * 1024 * 1024)
///     .with_user_space_end(VirtualAddress::new(0x0884_8000))
///     .build()
///     .unwrap();
/// assert_eq!(layout.kernel_pool().frames(), 3840);
/// assert_eq!(layout.user_space_pages(), 2048);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq, Setters, Getters)]
pub struct LayoutConfig {
    /// Total physical memory in bytes.
    total_memory: u32,
    /// Physical memory below the pools, owned by the loader's structures.
    reserved_memory: u32,
    /// Where the three allocator bitmaps are placed back to back.
    bitmap_base: VirtualAddress,
    /// Bytes available at `bitmap_base`.
    bitmap_region_bytes: u32,
    /// First address of the kernel heap.
    kernel_heap_start: VirtualAddress,
    /// First address of each process' private space.
    user_space_start: VirtualAddress,
    /// End (exclusive) of each process' private space.
    user_space_end: VirtualAddress,
}

impl LayoutConfig {
    #[must_use]
    pub const fn new(total_memory: u32) -> Self {
        Self {
            total_memory,
            reserved_memory: BOOT_RESERVED_BYTES,
            bitmap_base: VirtualAddress::new(MEM_BITMAP_BASE),
            bitmap_region_bytes: MEM_BITMAP_REGION_BYTES,
            kernel_heap_start: VirtualAddress::new(KERNEL_HEAP_START),
            user_space_start: VirtualAddress::new(USER_VADDR_START),
            user_space_end: VirtualAddress::new(USER_VADDR_END),
        }
    }

    #[must_use]
    pub const fn from_report(report: &LoaderMemoryReport) -> Self {
        Self::new(report.total_memory_bytes)
    }

    /// Splits the free memory evenly between the kernel and the user pool and
    /// places the bitmaps.
    ///
    /// # Errors
    /// See [`LayoutError`].
    pub fn build(self) -> Result<MemoryLayout, LayoutError> {
        let (start, end) = (self.user_space_start, self.user_space_end);
        if !start.is_aligned::<Size4K>()
            || !end.is_aligned::<Size4K>()
            || start >= end
            || end.as_u32() > KERNEL_BASE
        {
            return Err(LayoutError::InvalidUserSpace { start, end });
        }

        let free_frames = self.total_memory.saturating_sub(self.reserved_memory) / PAGE_SIZE;
        if free_frames < 2 {
            return Err(LayoutError::InsufficientMemory {
                total: self.total_memory,
                reserved: self.reserved_memory,
            });
        }

        let kernel_frames = free_frames / 2;
        let user_frames = free_frames - kernel_frames;

        let kernel_pool = FrameRegion {
            start: PhysicalAddress::new(self.reserved_memory),
            frames: kernel_frames,
        };
        let user_pool = FrameRegion {
            start: kernel_pool.end(),
            frames: user_frames,
        };

        let kernel_frame_bitmap = BitmapPlacement {
            address: self.bitmap_base,
            bits: kernel_frames,
        };
        let user_frame_bitmap = BitmapPlacement {
            address: kernel_frame_bitmap.end(),
            bits: user_frames,
        };
        // The kernel heap can never hold more pages than there are kernel frames.
        let kernel_space_bitmap = BitmapPlacement {
            address: user_frame_bitmap.end(),
            bits: kernel_frames,
        };

        let needed =
            kernel_frame_bitmap.bytes() + user_frame_bitmap.bytes() + kernel_space_bitmap.bytes();
        if needed > self.bitmap_region_bytes {
            return Err(LayoutError::BitmapRegionOverflow {
                needed,
                available: self.bitmap_region_bytes,
            });
        }

        let heap_fits = self
            .kernel_heap_start
            .checked_add(kernel_frames * PAGE_SIZE)
            .is_some_and(|end| end.as_u32() <= RECURSIVE_WINDOW_BASE);
        if !heap_fits {
            return Err(LayoutError::KernelSpaceOverflow {
                start: self.kernel_heap_start,
                pages: kernel_frames,
            });
        }

        Ok(MemoryLayout {
            total_memory: self.total_memory,
            kernel_pool,
            user_pool,
            kernel_frame_bitmap,
            user_frame_bitmap,
            kernel_space_bitmap,
            kernel_heap_start: self.kernel_heap_start,
            user_space_start: start,
            user_space_end: end,
        })
    }
}

/// A contiguous run of physical frames managed by one pool.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Getters)]
pub struct FrameRegion {
    start: PhysicalAddress,
    frames: u32,
}

impl FrameRegion {
    #[must_use]
    pub const fn size_bytes(&self) -> u32 {
        self.frames * PAGE_SIZE
    }

    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u32() + self.size_bytes())
    }
}

/// Location and length of one allocator bitmap.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Getters)]
pub struct BitmapPlacement {
    address: VirtualAddress,
    /// Number of tracked pages.
    bits: u32,
}

impl BitmapPlacement {
    /// Backing storage in bytes (rounded up, no page lost to truncation).
    #[must_use]
    pub const fn bytes(&self) -> u32 {
        self.bits.div_ceil(8)
    }

    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.address.as_u32() + self.bytes())
    }
}

/// Result of [`LayoutConfig::build`]; fixed for the lifetime of the kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Getters)]
pub struct MemoryLayout {
    total_memory: u32,
    kernel_pool: FrameRegion,
    user_pool: FrameRegion,
    kernel_frame_bitmap: BitmapPlacement,
    user_frame_bitmap: BitmapPlacement,
    /// One bit per page of the kernel heap.
    kernel_space_bitmap: BitmapPlacement,
    kernel_heap_start: VirtualAddress,
    user_space_start: VirtualAddress,
    user_space_end: VirtualAddress,
}

impl MemoryLayout {
    /// Pages in a process' private space.
    #[must_use]
    pub const fn user_space_pages(&self) -> u32 {
        (self.user_space_end.as_u32() - self.user_space_start.as_u32()) / PAGE_SIZE
    }

    /// Bytes of the per-process space bitmap.
    #[must_use]
    pub const fn user_space_bitmap_bytes(&self) -> u32 {
        self.user_space_pages().div_ceil(8)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("{total:#x} bytes of memory leave no frames beyond the {reserved:#x} reserved bytes")]
    InsufficientMemory { total: u32, reserved: u32 },
    #[error("allocator bitmaps need {needed} bytes but only {available} are reserved")]
    BitmapRegionOverflow { needed: u32, available: u32 },
    #[error("kernel heap of {pages} pages at {start} collides with the recursive window")]
    KernelSpaceOverflow { start: VirtualAddress, pages: u32 },
    #[error("invalid user address range {start}..{end}")]
    InvalidUserSpace {
        start: VirtualAddress,
        end: VirtualAddress,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u32 = 1024 * 1024;

    #[test]
    fn splits_32mib_evenly() {
        let layout = LayoutConfig::new(32 * MIB).build().unwrap();

        assert_eq!(layout.kernel_pool().start(), PhysicalAddress::new(0x20_0000));
        assert_eq!(layout.kernel_pool().frames(), 3840);
        assert_eq!(layout.user_pool().start(), PhysicalAddress::new(0x110_0000));
        assert_eq!(layout.user_pool().frames(), 3840);
        assert_eq!(layout.user_pool().end(), PhysicalAddress::new(32 * MIB));

        assert_eq!(layout.kernel_frame_bitmap().address(), VirtualAddress::new(0xc009_a000));
        assert_eq!(layout.kernel_frame_bitmap().bytes(), 480);
        assert_eq!(layout.user_frame_bitmap().address(), VirtualAddress::new(0xc009_a1e0));
        assert_eq!(layout.kernel_space_bitmap().address(), VirtualAddress::new(0xc009_a3c0));
        assert_eq!(layout.kernel_heap_start(), VirtualAddress::new(0xc010_0000));
    }

    #[test]
    fn odd_frame_count_goes_to_user_pool() {
        let layout = LayoutConfig::new(BOOT_RESERVED_BYTES + 17 * PAGE_SIZE)
            .build()
            .unwrap();
        assert_eq!(layout.kernel_pool().frames(), 8);
        assert_eq!(layout.user_pool().frames(), 9);
        assert_eq!(layout.kernel_frame_bitmap().bytes(), 1);
        assert_eq!(layout.user_frame_bitmap().bytes(), 2);
        assert_eq!(layout.kernel_space_bitmap().bits(), 8);
    }

    #[test]
    fn full_user_space_bitmap_size() {
        let layout = LayoutConfig::new(32 * MIB).build().unwrap();
        assert_eq!(layout.user_space_pages(), 753_592);
        assert_eq!(layout.user_space_bitmap_bytes(), 94_199);
    }

    #[test]
    fn rejects_too_little_memory() {
        assert_eq!(
            LayoutConfig::new(BOOT_RESERVED_BYTES).build(),
            Err(LayoutError::InsufficientMemory {
                total: BOOT_RESERVED_BYTES,
                reserved: BOOT_RESERVED_BYTES
            })
        );
    }

    #[test]
    fn rejects_bitmaps_larger_than_region() {
        let err = LayoutConfig::new(512 * MIB).build().unwrap_err();
        assert!(matches!(err, LayoutError::BitmapRegionOverflow { available: 0x4000, .. }));
    }

    #[test]
    fn rejects_user_space_reaching_into_kernel() {
        let config = LayoutConfig::new(32 * MIB).with_user_space_end(VirtualAddress::new(0xc000_1000));
        assert!(matches!(config.build(), Err(LayoutError::InvalidUserSpace { .. })));

        let mut config = LayoutConfig::new(32 * MIB);
        config.set_user_space_start(VirtualAddress::new(0x0804_8123));
        assert!(matches!(config.build(), Err(LayoutError::InvalidUserSpace { .. })));
    }

    #[test]
    fn reads_loader_report() {
        let report = LoaderMemoryReport {
            total_memory_bytes: 32 * MIB,
        };
        assert_eq!(LayoutConfig::from_report(&report).total_memory(), 32 * MIB);
    }
}
