use crate::{RawLock, RawTicket, RawUnlock};
use core::marker::PhantomData;
use core::num::NonZeroUsize;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

const NO_HOLDER: usize = 0;

/// Identity of a lock holder, usually the address or id of the running task.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OwnerId(NonZeroUsize);

impl OwnerId {
    /// `None` for zero, which marks an unheld lock.
    #[must_use]
    pub const fn new(id: usize) -> Option<Self> {
        match NonZeroUsize::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

/// A mutex the holding owner may lock again.
///
/// The first acquisition by an owner takes the raw lock; further acquisitions
/// by the same owner only bump the repeat counter. The raw lock is released
/// when the last guard is dropped. Because several guards of one owner can be
/// alive at once, the guard hands out `&T` only; pair with `RefCell`/`Cell`
/// for mutation.
///
/// ```rust
/// # use core::cell::Cell;
/// # use kernel_sync::{OwnerId, ReentrantMutex};
/// let task = OwnerId::new(1).unwrap();
/// let m: ReentrantMutex<Cell<u32>> = ReentrantMutex::new(Cell::new(0));
/// let outer = m.lock(task);
/// let inner = m.lock(task);
/// inner.set(inner.get() + 1);
/// assert_eq!(m.depth(), 2);
/// drop(inner);
/// drop(outer);
/// assert!(m.holder().is_none());
/// ```
pub struct ReentrantMutex<T, R = RawTicket> {
    raw: R,
    holder: AtomicUsize,
    depth: AtomicUsize,
    data: T,
}

unsafe impl<T: Send, R: Sync> Sync for ReentrantMutex<T, R> {}

impl<T> ReentrantMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

impl<T, R> ReentrantMutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            holder: AtomicUsize::new(NO_HOLDER),
            depth: AtomicUsize::new(0),
            data: value,
        }
    }

    /// Current holder (racy snapshot unless asked by the holder itself).
    pub fn holder(&self) -> Option<OwnerId> {
        OwnerId::new(self.holder.load(Ordering::Relaxed))
    }

    /// Whether `owner` holds the lock. Exact when `owner` is the caller.
    pub fn is_held_by(&self, owner: OwnerId) -> bool {
        self.holder.load(Ordering::Relaxed) == owner.get()
    }

    /// Number of live guards of the current holder.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_inner(self) -> T {
        self.data
    }
}

impl<T, R> ReentrantMutex<T, R>
where
    R: RawLock + RawUnlock,
{
    pub fn lock(&self, owner: OwnerId) -> ReentrantMutexGuard<'_, T, R> {
        if !self.is_held_by(owner) {
            self.raw.raw_lock();
            self.holder.store(owner.get(), Ordering::Relaxed);
        }
        self.enter()
    }

    pub fn try_lock(&self, owner: OwnerId) -> Option<ReentrantMutexGuard<'_, T, R>> {
        if !self.is_held_by(owner) {
            if !self.raw.raw_try_lock() {
                return None;
            }
            self.holder.store(owner.get(), Ordering::Relaxed);
        }
        Some(self.enter())
    }

    /// Lock, run `f`, unlock.
    pub fn with_lock<U>(&self, owner: OwnerId, f: impl FnOnce(&T) -> U) -> U {
        let guard = self.lock(owner);
        f(&guard)
    }

    fn enter(&self) -> ReentrantMutexGuard<'_, T, R> {
        let previous = self.depth.fetch_add(1, Ordering::Relaxed);
        assert!(previous < usize::MAX / 2, "reentrant lock depth overflow");
        ReentrantMutexGuard {
            m: self,
            _not_send: PhantomData,
        }
    }
}

pub struct ReentrantMutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a ReentrantMutex<T, R>,
    _not_send: PhantomData<*const ()>,
}

impl<T, R> Deref for ReentrantMutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.m.data
    }
}

impl<T, R> Drop for ReentrantMutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        if self.m.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.m.holder.store(NO_HOLDER, Ordering::Relaxed);
            unsafe { self.m.raw.raw_unlock() }
        }
    }
}
