//! Failure classes of the allocator.
//!
//! Running out of something is an ordinary outcome and surfaces as `None`.
//! A broken invariant means the allocator's state can no longer be trusted:
//! the `try_*` entry points hand it back as [`AllocError::Invariant`], the
//! plain ones halt through [`halt`].

use crate::frame_pool::PoolKind;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MapError;

/// What ran out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Resource {
    Frames,
    PageTables,
    VirtualSpace,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frames => "physical frames",
            Self::PageTables => "frames for page tables",
            Self::VirtualSpace => "virtual address space",
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("request of {count} pages is outside 1..={max}")]
    RequestSize { count: u32, max: u32 },
    #[error("{va} is not page aligned")]
    Misaligned { va: VirtualAddress },
    #[error("{va} lies outside the address space")]
    OutsideSpace { va: VirtualAddress },
    #[error("{va} is already reserved")]
    AlreadyReserved { va: VirtualAddress },
    #[error("{va} is not reserved")]
    NotReserved { va: VirtualAddress },
    #[error("{va} is not mapped")]
    NotMapped { va: VirtualAddress },
    #[error("{pa} does not belong to the {kind} pool")]
    ForeignFrame { pa: PhysicalAddress, kind: PoolKind },
    #[error("{pa} is not allocated")]
    FrameNotAllocated { pa: PhysicalAddress },
    #[error("page table update failed: {0}")]
    Mapping(MapError),
    #[error("{kind} memory requested from the wrong context")]
    WrongContext { kind: PoolKind },
    #[error("corrupted arena header at {arena}")]
    CorruptArena { arena: VirtualAddress },
    #[error("{va} is not a block of its arena")]
    NotABlock { va: VirtualAddress },
    #[error("double free of {va}")]
    DoubleFree { va: VirtualAddress },
    #[error("directory {directory} is still active")]
    ProcessActive { directory: PhysicalAddress },
    #[error("directory {directory} is not active")]
    ProcessInactive { directory: PhysicalAddress },
    #[error("directory {directory} still has user mappings")]
    UserMappingsRemain { directory: PhysicalAddress },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AllocError {
    #[error("out of {0}")]
    Exhausted(Resource),
    #[error("heap request of {size} bytes cannot be served")]
    InvalidSize { size: u32 },
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl From<MapError> for AllocError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfFrames => Self::Exhausted(Resource::PageTables),
            e => Self::Invariant(InvariantViolation::Mapping(e)),
        }
    }
}

/// The single place invariants are checked.
///
/// # Errors
/// `violation` when `condition` does not hold.
#[inline]
pub const fn ensure(condition: bool, violation: InvariantViolation) -> Result<(), InvariantViolation> {
    if condition { Ok(()) } else { Err(violation) }
}

/// Stops the kernel on a broken invariant.
#[cold]
pub fn halt(violation: InvariantViolation) -> ! {
    log::error!("memory manager invariant violated: {violation}");
    panic!("memory manager invariant violated: {violation}");
}

/// Maps a `try_*` result onto the public surface: exhaustion becomes `None`,
/// violations halt.
pub(crate) fn settle<T>(result: Result<T, AllocError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(AllocError::Invariant(violation)) => halt(violation),
        Err(e) => {
            log::warn!("{e}");
            None
        }
    }
}
