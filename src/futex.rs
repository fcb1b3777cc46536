//! Wait/wake services keyed by the address of an atomic word.
//!
//! A [`FutexMutex`] never talks to the operating system directly. Instead, it
//! is generic over an implementation of the [`Futex`] trait, which provides
//! the two kernel primitives the mutex is built on:
//!
//! - *wait on an address while it holds an expected value*, and
//! - *wake one or all of the threads blocked on an address*.
//!
//! This module provides the following implementations:
//!
//! - [`OsFutex`]: the operating system's futex (`futex(2)` on Linux,
//!   `WaitOnAddress` on Windows, `__ulock_wait` on macOS), via the
//!   [`atomic-wait`] crate.
//! - [`ParkingFutex`]: a portable emulation of a futex using a mutex and a
//!   condition variable. Under `cfg(loom)`, this uses Loom's simulated `Mutex`
//!   and `Condvar`, so that the mutex's wait/wake protocol can be
//!   model-checked.
//! - [`DefaultFutex`]: whichever of the above is appropriate for the current
//!   build. This is the default type parameter of [`FutexMutex`].
//!
//! [`FutexMutex`]: crate::FutexMutex
//! [`atomic-wait`]: https://docs.rs/atomic-wait
use crate::loom::sync::atomic::AtomicU32;

/// Blocking wait/wake operations on the address of an [`AtomicU32`].
///
/// # Implementing `Futex`
///
/// Implementations must not lose wakeups: if [`wake_one`] or [`wake_all`] is
/// called on an address *after* the value at that address was changed, a
/// thread blocked in [`wait`] on that address with the old value must
/// eventually return. [`wait`] must not block at all if the value no longer
/// equals `expected` by the time the implementation checks it.
///
/// Implementations *may* return from [`wait`] spuriously, and may wake more
/// threads than requested. Callers re-check their condition after every
/// return from [`wait`].
///
/// [`wait`]: Futex::wait
/// [`wake_one`]: Futex::wake_one
/// [`wake_all`]: Futex::wake_all
pub trait Futex {
    /// Blocks the current thread while `atomic` holds `expected`.
    fn wait(&self, atomic: &AtomicU32, expected: u32);

    /// Wakes at most one thread blocked in [`Futex::wait`] on `atomic`.
    fn wake_one(&self, atomic: &AtomicU32);

    /// Wakes every thread blocked in [`Futex::wait`] on `atomic`.
    fn wake_all(&self, atomic: &AtomicU32);
}

/// The [`Futex`] implementation used when none is specified.
///
/// This is [`OsFutex`], except when `cfg(loom)` is enabled, where it is a
/// [`ParkingFutex`] built on Loom's simulated primitives.
#[cfg(not(loom))]
pub type DefaultFutex = OsFutex;

/// The [`Futex`] implementation used when none is specified.
///
/// This is [`OsFutex`], except when `cfg(loom)` is enabled, where it is a
/// [`ParkingFutex`] built on Loom's simulated primitives.
#[cfg(loom)]
pub type DefaultFutex = ParkingFutex;

impl<F: Futex + ?Sized> Futex for &F {
    #[inline]
    fn wait(&self, atomic: &AtomicU32, expected: u32) {
        F::wait(self, atomic, expected)
    }

    #[inline]
    fn wake_one(&self, atomic: &AtomicU32) {
        F::wake_one(self, atomic)
    }

    #[inline]
    fn wake_all(&self, atomic: &AtomicU32) {
        F::wake_all(self, atomic)
    }
}

feature! {
    #![not(loom)]

    /// The operating system's futex.
    ///
    /// Waits and wakes are private to the current process. Interrupted and
    /// "value already changed" waits simply return, and are treated as
    /// spurious wakeups by the caller.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct OsFutex {
        _p: (),
    }

    impl OsFutex {
        /// Returns a new `OsFutex`.
        #[must_use]
        pub const fn new() -> Self {
            Self { _p: () }
        }
    }

    impl Futex for OsFutex {
        #[inline]
        fn wait(&self, atomic: &AtomicU32, expected: u32) {
            atomic_wait::wait(atomic, expected);
        }

        #[inline]
        fn wake_one(&self, atomic: &AtomicU32) {
            atomic_wait::wake_one(atomic);
        }

        #[inline]
        fn wake_all(&self, atomic: &AtomicU32) {
            atomic_wait::wake_all(atomic);
        }
    }
}

feature! {
    #![any(loom, feature = "std")]

    pub use self::parking::ParkingFutex;
}

#[cfg(any(loom, feature = "std"))]
mod parking {
    use super::Futex;
    use crate::loom::sync::{
        atomic::{AtomicU32, Ordering::SeqCst},
        Condvar, Mutex,
    };
    use core::fmt;
    use std::sync::PoisonError;

    /// A [`Futex`] emulated with a [`Mutex`] and a [`Condvar`].
    ///
    /// Every address waited on through the same `ParkingFutex` shares one
    /// wait queue, so a single `ParkingFutex` may be shared (by reference)
    /// between several [`FutexMutex`]es. Because the queue is shared, a
    /// [`wake_one`](Futex::wake_one) wakes every waiting thread; the woken
    /// threads that were not meant to proceed observe an unchanged value and
    /// wait again.
    ///
    /// [`FutexMutex`]: crate::FutexMutex
    pub struct ParkingFutex {
        lock: Mutex<()>,
        parked: Condvar,
    }

    impl ParkingFutex {
        loom_const_fn! {
            /// Returns a new `ParkingFutex` with no waiting threads.
            #[must_use]
            pub fn new() -> Self {
                Self {
                    lock: Mutex::new(()),
                    parked: Condvar::new(),
                }
            }
        }

        fn notify(&self) {
            // The notification is sent while holding the lock, so a waiter
            // that has checked the value is guaranteed to already be parked.
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.parked.notify_all();
        }
    }

    impl Futex for ParkingFutex {
        fn wait(&self, atomic: &AtomicU32, expected: u32) {
            let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            if test_dbg!(atomic.load(SeqCst)) != expected {
                return;
            }

            let _guard = self
                .parked
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }

        fn wake_one(&self, _: &AtomicU32) {
            self.notify();
        }

        fn wake_all(&self, _: &AtomicU32) {
            self.notify();
        }
    }

    impl Default for ParkingFutex {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Debug for ParkingFutex {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ParkingFutex").finish_non_exhaustive()
        }
    }
}
