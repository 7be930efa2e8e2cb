//! # Memory Layout
//!
//! Fixed addresses agreed upon between the loader and the kernel. Everything
//! here is a raw `u32`; typed wrappers are built where the values are used.

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Start of the kernel half; everything above is shared by all address spaces.
pub const KERNEL_BASE: u32 = 0xc000_0000;

/// Low memory (BIOS, loader, kernel image) mapped 1:1 into the kernel half.
pub const LOW_MEMORY_BYTES: u32 = 0x10_0000; // 1 MiB

/// Physical frame of the kernel page directory set up by the loader.
pub const PAGE_DIRECTORY_PHYS: u32 = 0x10_0000;

/// Frames the loader uses for paging: the directory, the table shared by
/// slots 0 and 768, and the pre-built tables for slots 769..=1022.
pub const BOOT_PAGING_FRAMES: u32 = 256;

/// Physical memory never handed to the frame pools.
pub const BOOT_RESERVED_BYTES: u32 = LOW_MEMORY_BYTES + BOOT_PAGING_FRAMES * PAGE_SIZE;

/// Virtual address of the allocator bitmaps (kernel frames, user frames, kernel heap).
pub const MEM_BITMAP_BASE: u32 = 0xc009_a000;

/// Bytes available for the bitmaps before the main thread's control block at `0xc009e000`.
pub const MEM_BITMAP_REGION_BYTES: u32 = 0x4000;

/// First address of the kernel heap, right past the low-memory mapping.
pub const KERNEL_HEAP_START: u32 = 0xc010_0000;

/// Lowest address of a process' private space (classic ELF load address).
pub const USER_VADDR_START: u32 = 0x0804_8000;

/// End (exclusive) of a process' private space.
pub const USER_VADDR_END: u32 = KERNEL_BASE;

/// Top page of the user stack.
pub const USER_STACK_PAGE: u32 = USER_VADDR_END - PAGE_SIZE;

/// Upper bound of a single page request (15 MiB).
pub const MAX_PAGES_PER_REQUEST: u32 = 3840;

/// Number of entries in a page directory or a page table.
pub const ENTRIES_PER_TABLE: u32 = 1024;

/// First page directory slot of the kernel half.
pub const KERNEL_DIRECTORY_SLOT: u32 = KERNEL_BASE >> 22;

/// Page directory slot that points back at the directory itself.
pub const RECURSIVE_SLOT: u32 = ENTRIES_PER_TABLE - 1;

/// Where the recursive slot exposes all page tables of the active directory.
pub const RECURSIVE_WINDOW_BASE: u32 = RECURSIVE_SLOT << 22;

const _: () = {
    assert!(BOOT_RESERVED_BYTES == 0x20_0000);
    assert!(KERNEL_HEAP_START == KERNEL_BASE + LOW_MEMORY_BYTES);
    assert!(MEM_BITMAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_VADDR_START < USER_VADDR_END);
    assert!(KERNEL_DIRECTORY_SLOT == 768);
    assert!(RECURSIVE_WINDOW_BASE == 0xffc0_0000);
};
