//! Reentrant mutual exclusion with explicit owner tracking.
//!
//! The primitive exclusion comes from a `parking_lot` mutex: a thread that has
//! to wait parks until the holder releases it. Reentrancy is layered on top with
//! an owner field and a recursion depth, so the platform lock is never asked to
//! be recursive itself.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::errors::LockOwnershipViolation;

const NO_OWNER: usize = 0;

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(NO_OWNER + 1);

/// Nonzero identity of the calling thread, never reused by a later thread.
fn current_thread_id() -> usize {
    thread_local!(static ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
    ID.with(|id| *id)
}

/// Something with plain acquire/release semantics.
pub trait Locker {
    fn acquire(&self);
    fn release(&self);
}

/// A mutual-exclusion lock that its owning thread may acquire again without
/// blocking.
///
/// Every acquire by the owner bumps a recursion depth; the lock is handed to
/// other threads only once the owner has released as many times as it acquired.
/// Releasing from any thread but the owner is a programming error and panics
/// with [`LockOwnershipViolation`].
///
/// The lock can guard data of type `T`. Guards only hand out `&T`, since the
/// owner may hold several of them at once; wrap the data in a `RefCell` to
/// mutate it.
pub struct ReentrantLock<T: ?Sized = ()> {
    raw: Mutex<()>,
    owner: AtomicUsize,
    depth: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a guard, and guards exist only on
// the owning thread, so at most one thread touches `T` at a time.
unsafe impl<T: ?Sized + Send> Send for ReentrantLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            raw: Mutex::new(()),
            owner: AtomicUsize::new(NO_OWNER),
            depth: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> ReentrantLock<T> {
    /// Acquires the lock, parking the calling thread while another thread owns it.
    pub fn lock(&self) -> ReentrantLockGuard<'_, T> {
        self.lock_raw();
        ReentrantLockGuard::new(self)
    }

    pub fn try_lock(&self) -> Option<ReentrantLockGuard<'_, T>> {
        if self.try_lock_raw() {
            Some(ReentrantLockGuard::new(self))
        } else {
            None
        }
    }

    /// Exclusive access without locking; `&mut self` already rules out other users.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != NO_OWNER
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    /// Recursion depth held by the calling thread; 0 if it is not the owner.
    pub fn depth(&self) -> usize {
        if self.is_owned_by_current_thread() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    // `owner` can only equal our id if this thread stored it, so relaxed loads
    // suffice; the raw mutex carries the happens-before edges for `data`.
    fn lock_raw(&self) {
        let me = current_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.bump_depth();
            return;
        }

        let guard = match self.raw.try_lock() {
            Some(guard) => guard,
            None => {
                trace!("lock contended, parking");
                self.raw.lock()
            }
        };
        // the raw mutex stays locked until the owner's depth drops back to 0
        mem::forget(guard);
        self.owner.store(me, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
    }

    fn try_lock_raw(&self) -> bool {
        let me = current_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.bump_depth();
            return true;
        }

        match self.raw.try_lock() {
            Some(guard) => {
                mem::forget(guard);
                self.owner.store(me, Ordering::Relaxed);
                self.depth.store(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn bump_depth(&self) {
        let depth = self.depth.load(Ordering::Relaxed);
        self.depth.store(depth + 1, Ordering::Relaxed);
    }

    #[track_caller]
    fn unlock_raw(&self) {
        if self.owner.load(Ordering::Relaxed) != current_thread_id() {
            panic!("{}", LockOwnershipViolation);
        }

        let depth = self.depth.load(Ordering::Relaxed) - 1;
        self.depth.store(depth, Ordering::Relaxed);
        if depth == 0 {
            self.owner.store(NO_OWNER, Ordering::Relaxed);
            // SAFETY: this thread is the owner, so it has held `raw` since the
            // outermost acquire and its guard was forgotten there.
            unsafe { self.raw.force_unlock() };
        }
    }
}

impl ReentrantLock<()> {
    /// Acquires without a guard. Pair every call with [`ReentrantLock::release`].
    pub fn acquire(&self) {
        self.lock_raw();
    }

    pub fn try_acquire(&self) -> bool {
        self.try_lock_raw()
    }

    /// Undoes one `acquire` by the owning thread.
    ///
    /// # Panics
    ///
    /// With [`LockOwnershipViolation`] if the calling thread does not own the
    /// lock, including release of an unlocked lock and double release.
    #[track_caller]
    pub fn release(&self) {
        self.unlock_raw();
    }
}

impl Locker for ReentrantLock<()> {
    fn acquire(&self) {
        self.lock_raw();
    }

    #[track_caller]
    fn release(&self) {
        self.unlock_raw();
    }
}

impl<T: Default> Default for ReentrantLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for ReentrantLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("locked", &self.is_locked())
            .field("owned_by_current_thread", &self.is_owned_by_current_thread())
            .finish_non_exhaustive()
    }
}

/// RAII guard for one level of a [`ReentrantLock`]; releases that level on drop.
///
/// Neither `Send` nor `Sync`: a guard is always released by the thread that
/// acquired it.
#[must_use = "if unused the ReentrantLock will immediately unlock"]
pub struct ReentrantLockGuard<'a, T: ?Sized> {
    lock: &'a ReentrantLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> ReentrantLockGuard<'a, T> {
    fn new(lock: &'a ReentrantLock<T>) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for ReentrantLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves this thread owns the lock; only shared
        // references are handed out, so nested guards may coexist.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReentrantLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_raw();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::thread;

    #[test]
    fn test_depth_tracks_nested_acquires() {
        let lock = ReentrantLock::new(());
        assert_eq!(lock.depth(), 0);

        lock.acquire();
        lock.acquire();
        lock.acquire();
        assert_eq!(lock.depth(), 3);

        lock.release();
        assert_eq!(lock.depth(), 2);
        assert!(lock.is_locked());

        lock.release();
        lock.release();
        assert_eq!(lock.depth(), 0);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_nested_guards_share_data() {
        let lock = ReentrantLock::new(RefCell::new(vec![1]));

        let outer = lock.lock();
        {
            let inner = lock.lock();
            inner.borrow_mut().push(2);
        }
        outer.borrow_mut().push(3);

        assert_eq!(*outer.borrow(), vec![1, 2, 3]);
        assert_eq!(lock.depth(), 1);
    }

    #[test]
    fn test_try_lock_fails_from_other_thread_while_held() {
        let lock = ReentrantLock::new(());
        let guard = lock.lock();

        thread::scope(|s| {
            s.spawn(|| {
                assert!(lock.try_lock().is_none());
                assert!(!lock.is_owned_by_current_thread());
                assert_eq!(lock.depth(), 0);
            });
        });

        drop(guard);

        thread::scope(|s| {
            s.spawn(|| {
                let guard = lock.try_lock();
                assert!(guard.is_some());
            });
        });
    }

    #[test]
    fn test_try_acquire_reenters_for_owner() {
        let lock = ReentrantLock::default();
        assert!(lock.try_acquire());
        assert!(lock.try_acquire());
        assert_eq!(lock.depth(), 2);
        lock.release();
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut lock = ReentrantLock::new(5);
        *lock.get_mut() += 1;
        assert_eq!(*lock.lock(), 6);
        assert_eq!(lock.into_inner(), 6);
    }

    #[test]
    #[should_panic(expected = "unlock from non-owner thread")]
    fn test_double_release_panics() {
        let lock = ReentrantLock::new(());
        lock.acquire();
        lock.release();
        lock.release();
    }
}
