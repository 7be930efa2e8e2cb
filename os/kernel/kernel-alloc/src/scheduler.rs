//! What the allocator needs to know about the running task.

use crate::process::ProcessMemory;
use kernel_sync::OwnerId;

/// The scheduler as seen by the memory manager.
///
/// `'m` is the lifetime of the memory manager the processes were created by.
pub trait Scheduler<'m> {
    /// The running task; used as lock owner.
    fn current_task(&self) -> OwnerId;

    /// Runs `f` with the memory of the running process, `None` for kernel
    /// threads.
    ///
    /// Implementations may assume `f` never calls back into this method.
    fn with_current_process<R>(&self, f: impl FnOnce(Option<&mut ProcessMemory<'m>>) -> R) -> R;
}
