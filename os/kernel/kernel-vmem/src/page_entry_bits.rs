use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// A single 32-bit i386 page directory or page table entry in raw bitfield form.
///
/// Both levels share this layout. A directory entry points at a page table;
/// a table entry maps one 4 KiB frame.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (table entries only) |
/// | 7     | `PS` / `PAT`    | 4 MiB page in a directory entry; never used here |
/// | 8     | `G`             | Global (table entries only) |
/// | 9–11  | AVL             | Free for OS use |
/// | 12–31 | frame           | Physical frame bits \[31:12\] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::user_rw(PhysicalAddress::new(0x0030_0000));
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.into_bits(), 0x0030_0007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set on every entry; kernel pages are protected by living above
    /// `KERNEL_BASE`, which user code cannot reach through its own tables
    /// without the kernel handing them out.
    pub user_access: bool,

    /// Page-level write-through (PWT, bit 3).
    pub write_through: bool,

    /// Page-level cache disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on write.
    pub dirty: bool,

    /// Page size (PS, bit 7).
    pub large_page: bool,

    /// Global (G, bit 8).
    pub global: bool,

    /// Available to software (bits 9–11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12–31).
    #[bits(20)]
    frame_4k: u32,
}

impl PageEntryBits {
    /// Present, writable, user-accessible entry for `frame`, the flags the
    /// kernel uses for both directory and table entries.
    #[must_use]
    pub fn user_rw(frame: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame(frame)
    }

    /// Physical base address of the referenced frame or table.
    #[must_use]
    pub const fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_4k() << Size4K::SHIFT)
    }

    #[must_use]
    pub fn with_frame(self, frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned::<Size4K>(), "unaligned frame {frame:?}");
        self.with_frame_4k(frame.as_u32() >> Size4K::SHIFT)
    }
}
