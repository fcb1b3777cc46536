//! A data-owning mutex built on a [`RawMutex`].
//!
//! The [`FutexMutex`] type provides the raw locking operations, but does not
//! protect any data itself, and requires the caller to pair every
//! [`acquire`](FutexMutex::acquire) with an `unsafe`
//! [`release`](FutexMutex::release). This module provides a [`Mutex`] type
//! which owns the data it protects and hands out RAII guards, in the style of
//! [`std::sync::Mutex`].
//!
//! This module provides the following APIs:
//!
//! - [`Mutex`]: a blocking [mutual exclusion] lock protecting a value.
//! - [`MutexGuard`]: the RAII guard returned by locking a [`Mutex`].
//! - [`RawMutex`]: the trait abstracting over the raw lock used by a
//!   [`Mutex`].
//!
//! [mutual exclusion]: https://en.wikipedia.org/wiki/Mutual_exclusion
//! [`std::sync::Mutex`]: https://doc.rust-lang.org/std/sync/struct.Mutex.html
use crate::{
    futex::Futex,
    loom::cell::{MutPtr, UnsafeCell},
    FutexMutex,
};
use core::{
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

/// A blocking mutual exclusion lock for protecting shared data.
///
/// Each mutex has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the RAII guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only ever
/// accessed when the mutex is locked.
///
/// By default, the raw lock is a [`FutexMutex`], which blocks contending
/// threads in the kernel after spinning briefly. With a [`FutexMutex`], a
/// thread may also wait for the mutex to become unlocked without locking it,
/// using [`wait_until_unlocked`].
///
/// # Fairness
///
/// This is *not* a fair mutex.
///
/// # Loom-specific behavior
///
/// When `cfg(loom)` is enabled, this mutex uses Loom's checked `UnsafeCell`,
/// so that concurrent accesses to the protected data are detected.
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
/// [`wait_until_unlocked`]: Mutex::wait_until_unlocked
pub struct Mutex<T, Lock = FutexMutex> {
    lock: Lock,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard via its
/// [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`].
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
#[must_use = "if unused, the `Mutex` will immediately unlock"]
pub struct MutexGuard<'a, T, Lock: RawMutex = FutexMutex> {
    // Dropped before the lock is released, so that Loom does not see the
    // access overlap with the next holder's.
    ptr: ManuallyDrop<MutPtr<T>>,
    lock: &'a Lock,
}

/// Trait abstracting over raw mutex implementations.
///
/// This trait is essentially a duplicate of the [`lock_api::RawMutex`] trait,
/// without the requirement that implementations be constructible in a `const`
/// context (which Loom's simulated primitives cannot be).
///
/// # Safety
///
/// Implementations of this trait must ensure that the mutex is actually
/// exclusive: a lock can't be acquired while the mutex is already locked.
///
/// [`lock_api::RawMutex`]: https://docs.rs/lock_api/latest/lock_api/trait.RawMutex.html
pub unsafe trait RawMutex {
    /// Marker type which determines whether a lock guard should be [`Send`].
    type GuardMarker;

    /// Acquires this mutex, blocking the current thread until it is able to do
    /// so.
    fn lock(&self);

    /// Attempts to acquire this mutex without blocking. Returns `true`
    /// if the lock was successfully acquired and `false` otherwise.
    fn try_lock(&self) -> bool;

    /// Unlocks this mutex.
    ///
    /// # Safety
    ///
    /// This method may only be called if the mutex is held in the current
    /// context, i.e. it must be paired with a successful call to [`lock`] or
    /// [`try_lock`].
    ///
    /// [`lock`]: RawMutex::lock
    /// [`try_lock`]: RawMutex::try_lock
    unsafe fn unlock(&self);

    /// Returns `true` if the mutex is currently locked.
    fn is_locked(&self) -> bool;
}

unsafe impl<F: Futex> RawMutex for FutexMutex<F> {
    type GuardMarker = ();

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn lock(&self) {
        let _slow = self.acquire();
        test_debug!(slow = _slow, "FutexMutex::lock");
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    #[inline]
    #[cfg_attr(test, track_caller)]
    unsafe fn unlock(&self) {
        self.release()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.subscribe()
    }
}

impl<T> Mutex<T> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`.
        ///
        /// The returned `Mutex` is in an unlocked state, ready for use.
        ///
        /// # Examples
        ///
        /// ```
        /// use morel::blocking::Mutex;
        ///
        /// let mutex = Mutex::new(0);
        /// ```
        #[must_use]
        pub fn new(data: T) -> Self {
            Self {
                lock: FutexMutex::new(),
                data: UnsafeCell::new(data),
            }
        }
    }
}

impl<T, Lock> Mutex<T, Lock> {
    loom_const_fn! {
        /// Returns a new `Mutex` protecting the provided `data`, using `lock`
        /// as the raw mutex implementation.
        ///
        /// This can be used to provide a [`FutexMutex`] with non-default
        /// [spin budgets](crate::Spins) or [`Futex`] implementation, or a
        /// different [`RawMutex`] entirely.
        ///
        /// The returned `Mutex` is in an unlocked state, ready for use.
        #[must_use]
        pub fn with_raw_mutex(data: T, lock: Lock) -> Self {
            Self {
                lock,
                data: UnsafeCell::new(data),
            }
        }
    }

    /// Consumes this `Mutex`, returning the guarded data.
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place -- the mutable borrow statically guarantees no locks exist.
    ///
    /// # Examples
    ///
    /// ```
    /// let mut lock = morel::blocking::Mutex::new(0);
    /// *lock.get_mut() = 10;
    /// assert_eq!(*lock.lock(), 10);
    /// ```
    pub fn get_mut(&mut self) -> &mut T {
        unsafe {
            // Safety: since this call borrows the `Mutex` mutably, no actual
            // locking needs to take place -- the mutable borrow statically
            // guarantees no locks exist.
            self.data.with_mut(|data| &mut *data)
        }
    }
}

impl<T, Lock> Mutex<T, Lock>
where
    Lock: RawMutex,
{
    fn guard(&self) -> MutexGuard<'_, T, Lock> {
        MutexGuard {
            ptr: ManuallyDrop::new(self.data.get_mut()),
            lock: &self.lock,
        }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// If the lock could not be acquired at this time, then [`None`] is returned.
    /// Otherwise, an RAII guard is returned. The lock will be unlocked when the
    /// guard is dropped.
    #[must_use]
    #[cfg_attr(test, track_caller)]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, Lock>> {
        if self.lock.try_lock() {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Acquires the mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// Upon returning, the thread is the only thread with the lock held. An
    /// RAII guard is returned to allow scoped unlock of the lock. When the
    /// guard goes out of scope, the mutex will be unlocked.
    #[cfg_attr(test, track_caller)]
    pub fn lock(&self) -> MutexGuard<'_, T, Lock> {
        self.lock.lock();
        self.guard()
    }

    /// Locks the mutex, calls `f` with a mutable reference to the protected
    /// data, and unlocks the mutex again, returning the result of `f`.
    #[cfg_attr(test, track_caller)]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Returns `true` if the mutex is currently locked.
    ///
    /// The result is a snapshot, and may be stale by the time it is used.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Forcibly unlock the mutex.
    ///
    /// If a lock is currently held, it will be released, regardless of who's
    /// holding it. Of course, this is **outrageously, disgustingly unsafe** and
    /// you should never do it.
    ///
    /// # Safety
    ///
    /// This deliberately violates mutual exclusion.
    ///
    /// Only call this method when it is _guaranteed_ that no stack frame that
    /// has previously locked the mutex will ever continue executing, and that
    /// the mutex is in fact locked.
    pub unsafe fn force_unlock(&self) {
        self.lock.unlock()
    }
}

impl<T, F: Futex> Mutex<T, FutexMutex<F>> {
    /// Blocks the current thread until the mutex is observed to be unlocked,
    /// *without* locking it.
    ///
    /// Returns `true` if the thread had to block in the kernel. See
    /// [`FutexMutex::wait_for_free`] for details.
    #[cfg_attr(test, track_caller)]
    pub fn wait_until_unlocked(&self) -> bool {
        self.lock.wait_for_free()
    }
}

impl<T: Default, Lock: Default> Default for Mutex<T, Lock> {
    fn default() -> Self {
        Self {
            lock: Default::default(),
            data: UnsafeCell::new(Default::default()),
        }
    }
}

impl<T, Lock> fmt::Debug for Mutex<T, Lock>
where
    T: fmt::Debug,
    Lock: fmt::Debug + RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => s.field("data", &&*guard),
            None => s.field("data", &format_args!("<locked>")),
        };
        s.field("lock", &self.lock).finish()
    }
}

unsafe impl<T: Send, Lock: Send> Send for Mutex<T, Lock> {}
unsafe impl<T: Send, Lock: Sync> Sync for Mutex<T, Lock> {}

// === impl MutexGuard ===

impl<T, Lock: RawMutex> Deref for MutexGuard<'_, T, Lock> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            &*MutPtr::deref(&self.ptr)
        }
    }
}

impl<T, Lock: RawMutex> DerefMut for MutexGuard<'_, T, Lock> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // Safety: we are holding the lock, so it is okay to dereference the
            // mut pointer.
            MutPtr::deref(&self.ptr)
        }
    }
}

impl<T, Lock> Drop for MutexGuard<'_, T, Lock>
where
    Lock: RawMutex,
{
    #[inline]
    #[cfg_attr(test, track_caller)]
    fn drop(&mut self) {
        unsafe {
            // Safety: `ptr` is never used again after this.
            ManuallyDrop::drop(&mut self.ptr);
            self.lock.unlock()
        }
    }
}

impl<T, Lock> fmt::Debug for MutexGuard<'_, T, Lock>
where
    T: fmt::Debug,
    Lock: RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

impl<T, Lock> fmt::Display for MutexGuard<'_, T, Lock>
where
    T: fmt::Display,
    Lock: RawMutex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

unsafe impl<T, Lock> Send for MutexGuard<'_, T, Lock>
where
    T: Send,
    Lock: RawMutex + Sync,
    Lock::GuardMarker: Send,
{
}
unsafe impl<T, Lock> Sync for MutexGuard<'_, T, Lock>
where
    T: Sync,
    Lock: RawMutex + Sync,
{
}
