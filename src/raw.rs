//! The raw futex-based mutex.
//!
//! See the [`FutexMutex`] type-level documentation for details.
use crate::{
    futex::{DefaultFutex, Futex},
    loom::{
        hint,
        sync::atomic::{
            AtomicU32,
            Ordering::{Acquire, Relaxed, SeqCst},
        },
    },
};
use core::fmt;


/// A mutual exclusion lock that spins briefly and then blocks in the kernel,
/// and which also lets threads wait for it to become unlocked *without*
/// acquiring it.
///
/// A `FutexMutex` does not protect any data by itself. It provides four
/// operations:
///
/// - [`acquire`](Self::acquire) blocks until the calling thread holds the
///   mutex,
/// - [`release`](Self::release) unlocks a held mutex and wakes whichever
///   blocked threads should observe the change,
/// - [`subscribe`](Self::subscribe) peeks at whether the mutex is currently
///   held, and
/// - [`wait_for_free`](Self::wait_for_free) blocks until the mutex is observed
///   to be unlocked, without locking it.
///
/// For a mutex that owns the data it protects and releases itself on drop,
/// see [`blocking::Mutex`](crate::blocking::Mutex), which uses a `FutexMutex`
/// by default.
///
/// # Implementation Notes
///
/// The mutex's state is two 32-bit words. The `lock` word packs the lock bit
/// (bit 0) together with a count of contending threads: every thread that
/// gives up spinning and commits to blocking adds 2 to the word, and removes
/// those 2 again in the same compare-and-swap that sets the lock bit. So:
///
/// | `lock`   | meaning                                         |
/// |----------|-------------------------------------------------|
/// | `0`      | unlocked, uncontended                           |
/// | `1`      | locked, uncontended                             |
/// | `2N + 1` | locked, `N` threads blocked (or about to block) |
/// | `2N`     | unlocked, `N` contenders racing to take it      |
///
/// Acquiring threads wait on the `lock` word's address and are woken one at a
/// time, since only one of them can win the following compare-and-swap.
///
/// The `wait` word is a separate wakeup channel for
/// [`wait_for_free`](Self::wait_for_free). It is `1` while some thread may be
/// blocked waiting for the mutex to become free. Those threads never count
/// themselves as contenders; all of them are woken together when an
/// uncontended release returns the `lock` word to `0`.
///
/// The kernel wait/wake calls are provided by the `F` type parameter; see the
/// [`futex`](crate::futex) module.
///
/// # Fairness
///
/// This is *not* a fair mutex. A spinning thread may take the lock ahead of a
/// thread that was just woken.
///
/// # Loom-specific behavior
///
/// When `cfg(loom)` is enabled, this mutex uses Loom's simulated atomics and
/// spin loop hints, and the [`DefaultFutex`] is a
/// [`ParkingFutex`](crate::futex::ParkingFutex) built on Loom's `Mutex` and
/// `Condvar`.
pub struct FutexMutex<F = DefaultFutex> {
    lock: AtomicU32,
    wait: AtomicU32,
    spins: Spins,
    futex: F,
}

/// Spin budgets for a [`FutexMutex`].
///
/// Before blocking in the kernel, [`FutexMutex::acquire`] and
/// [`FutexMutex::wait_for_free`] spin for a bounded number of iterations,
/// issuing a [spin loop hint] on each one. These values only affect latency
/// under contention; a `FutexMutex` is correct with any budget, including
/// zero.
///
/// [spin loop hint]: core::hint::spin_loop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Spins {
    /// The number of times [`FutexMutex::acquire`] will observe the mutex
    /// locked before registering as a contender and blocking.
    pub lock: u32,

    /// The number of times [`FutexMutex::wait_for_free`] will observe the
    /// mutex locked before blocking until it is released.
    pub wait: u32,
}

/// Bit 0 of the `lock` word: set while the mutex is held.
const LOCKED: u32 = 1;

/// The amount each contending thread adds to the `lock` word.
const CONTENDER: u32 = 2;

/// Values of the `wait` word.
const NO_WAITERS: u32 = 0;
const WAITERS: u32 = 1;

// === impl Spins ===

impl Spins {
    /// The default spin budgets: 20 iterations each.
    pub const DEFAULT: Self = Self::new(20, 20);

    /// Never spin: block in the kernel as soon as the mutex is observed to be
    /// locked.
    pub const NONE: Self = Self::new(0, 0);

    /// Returns a new set of spin budgets.
    #[must_use]
    pub const fn new(lock: u32, wait: u32) -> Self {
        Self { lock, wait }
    }
}

impl Default for Spins {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// === impl FutexMutex ===

impl FutexMutex {
    loom_const_fn! {
        /// Returns a new `FutexMutex`, in the unlocked state, using the
        /// [default spin budgets](Spins::DEFAULT) and the [`DefaultFutex`].
        ///
        /// # Examples
        ///
        /// ```
        /// use morel::FutexMutex;
        ///
        /// static LOCK: FutexMutex = FutexMutex::new();
        ///
        /// LOCK.acquire();
        /// assert!(LOCK.subscribe());
        /// unsafe { LOCK.release() };
        /// assert!(!LOCK.subscribe());
        /// ```
        #[must_use]
        pub fn new() -> Self {
            Self::with_spins_and_futex(Spins::DEFAULT, DefaultFutex::new())
        }
    }

    loom_const_fn! {
        /// Returns a new `FutexMutex`, in the unlocked state, using the
        /// provided spin budgets and the [`DefaultFutex`].
        #[must_use]
        pub fn with_spins(spins: Spins) -> Self {
            Self::with_spins_and_futex(spins, DefaultFutex::new())
        }
    }
}

impl<F> FutexMutex<F> {
    loom_const_fn! {
        /// Returns a new `FutexMutex`, in the unlocked state, which blocks and
        /// wakes threads using the provided [`Futex`] implementation.
        #[must_use]
        pub fn with_futex(futex: F) -> Self {
            Self::with_spins_and_futex(Spins::DEFAULT, futex)
        }
    }

    loom_const_fn! {
        /// Returns a new `FutexMutex`, in the unlocked state, with the provided
        /// spin budgets and [`Futex`] implementation.
        #[must_use]
        pub fn with_spins_and_futex(spins: Spins, futex: F) -> Self {
            Self {
                lock: AtomicU32::new(0),
                wait: AtomicU32::new(NO_WAITERS),
                spins,
                futex,
            }
        }
    }

    /// Returns `true` if the mutex is currently held.
    ///
    /// This performs a single atomic load and never blocks. The result is
    /// advisory: by the time the caller acts on it, the mutex may have been
    /// acquired or released by another thread.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> bool {
        self.lock.load(Relaxed) & LOCKED == LOCKED
    }

    /// Returns the number of threads currently registered as contenders,
    /// i.e. threads which stopped spinning in [`acquire`](Self::acquire) and
    /// have not yet taken the lock.
    ///
    /// Like [`subscribe`](Self::subscribe), this is a snapshot.
    #[inline]
    #[must_use]
    pub fn contenders(&self) -> u32 {
        self.lock.load(Relaxed) / CONTENDER
    }

    /// Returns the spin budgets this mutex was constructed with.
    #[inline]
    #[must_use]
    pub fn spins(&self) -> Spins {
        self.spins
    }

    /// Attempts to acquire the mutex without spinning or blocking.
    ///
    /// Returns `true` if the lock was acquired, in which case the caller must
    /// eventually [`release`](Self::release) it.
    #[cfg_attr(test, track_caller)]
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let state = test_dbg!(self.lock.load(Relaxed));
        state & LOCKED == 0
            && test_dbg!(self
                .lock
                .compare_exchange(state, state + LOCKED, SeqCst, Relaxed)
                .is_ok())
    }
}

impl<F: Futex> FutexMutex<F> {
    /// Acquires the mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// The calling thread first spins for up to [`Spins::lock`] iterations
    /// while the mutex is held by someone else. If it is still unable to take
    /// the lock, it registers itself as a contender and blocks in the kernel
    /// until it is woken by a [`release`](Self::release).
    ///
    /// Returns `true` if the thread blocked in the kernel at least once before
    /// acquiring the lock, or `false` if the lock was taken by spinning. This
    /// is intended for diagnostics and tuning only.
    #[cfg_attr(test, track_caller)]
    pub fn acquire(&self) -> bool {
        let mut spins = 0;
        while spins < self.spins.lock {
            let state = test_dbg!(self.lock.load(Relaxed));
            if state & LOCKED == LOCKED {
                hint::spin_loop();
                spins += 1;
                continue;
            }

            // A lost race here does not count against the spin budget.
            if test_dbg!(self
                .lock
                .compare_exchange(state, state + LOCKED, SeqCst, Relaxed)
                .is_ok())
            {
                return false;
            }
        }

        self.acquire_slow()
    }

    #[cold]
    #[cfg_attr(test, track_caller)]
    fn acquire_slow(&self) -> bool {
        // Once registered, this thread stays a contender until it owns the
        // lock.
        let mut state = test_dbg!(self.lock.fetch_add(CONTENDER, SeqCst)) + CONTENDER;
        trace!(
            contenders = state / CONTENDER,
            "FutexMutex::acquire: registered as a contender"
        );

        let mut waited = false;
        loop {
            if state & LOCKED == LOCKED {
                trace!(state, "FutexMutex::acquire: waiting...");
                self.futex.wait(&self.lock, state);
                waited = true;
                state = test_dbg!(self.lock.load(Relaxed));
                continue;
            }

            debug_assert!(
                state >= CONTENDER,
                "contender observed an unlocked mutex with no contenders (state = {state:#x})"
            );

            // Subtracting one from an even, unlocked state both drops this
            // thread's contender count and sets the lock bit.
            match test_dbg!(self
                .lock
                .compare_exchange(state, state - LOCKED, SeqCst, Relaxed))
            {
                Ok(_) => {
                    trace!(waited, "FutexMutex::acquire: locked");
                    return waited;
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Releases the mutex.
    ///
    /// If any threads are blocked in [`acquire`](Self::acquire), exactly one
    /// of them is woken to retry. Otherwise, if any threads are blocked in
    /// [`wait_for_free`](Self::wait_for_free), all of them are woken.
    ///
    /// # Safety
    ///
    /// This method may only be called while the mutex is held in the current
    /// context, i.e. it must be paired with a successful call to
    /// [`acquire`](Self::acquire) or [`try_acquire`](Self::try_acquire).
    /// Releasing an unlocked mutex corrupts its contender count.
    #[cfg_attr(test, track_caller)]
    pub unsafe fn release(&self) {
        let state = test_dbg!(self.lock.fetch_sub(LOCKED, SeqCst));
        debug_assert_eq!(
            state & LOCKED,
            LOCKED,
            "FutexMutex::release called on an unlocked mutex (state = {state:#x})"
        );

        if state != LOCKED {
            trace!(
                contenders = state / CONTENDER,
                "FutexMutex::release: waking a contender"
            );
            self.futex.wake_one(&self.lock);
            return;
        }

        // The mutex is now free and uncontended; release anyone waiting to see
        // that happen.
        if test_dbg!(self.wait.load(SeqCst)) == WAITERS {
            self.wake_waiters();
        }
    }

    /// Blocks the current thread until the mutex is observed to be unlocked,
    /// *without* acquiring it.
    ///
    /// The calling thread spins for up to [`Spins::wait`] iterations, then
    /// blocks until an uncontended [`release`](Self::release) wakes it, and
    /// repeats until it sees the mutex unlocked with no contenders.
    ///
    /// Returns `true` if the thread blocked in the kernel at least once, or
    /// `false` if the mutex was seen to be free while spinning. As with
    /// [`subscribe`](Self::subscribe), the mutex may already have been
    /// re-acquired by the time this returns.
    #[cfg_attr(test, track_caller)]
    pub fn wait_for_free(&self) -> bool {
        let mut waited = false;
        loop {
            for _ in 0..self.spins.wait {
                if test_dbg!(self.lock.load(Acquire)) == 0 {
                    // A spurious wakeup may have left our registration behind.
                    if waited && test_dbg!(self.wait.load(SeqCst)) == WAITERS {
                        self.wake_waiters();
                    }
                    return waited;
                }
                hint::spin_loop();
            }

            // Register as a waiter *before* the final check. `release`
            // decrements the lock word before it reads `wait`, so if this
            // load still sees the mutex held, the releasing thread is
            // guaranteed to see `WAITERS` and wake us.
            test_dbg!(self.wait.swap(WAITERS, SeqCst));
            if test_dbg!(self.lock.load(SeqCst)) == 0 {
                // The release that freed the mutex may already have cleared
                // `wait` on behalf of a thread that has not yet blocked, in
                // which case our registration would park it on a free mutex.
                self.wake_waiters();
                return waited;
            }

            trace!("FutexMutex::wait_for_free: waiting...");
            self.futex.wait(&self.wait, WAITERS);
            waited = true;
        }
    }

    /// Clears the `wait` word, waking every thread blocked in
    /// [`wait_for_free`](Self::wait_for_free) if any had registered.
    ///
    /// `wait` only ever goes from `WAITERS` to `NO_WAITERS` here, so a thread
    /// that registered is either woken or sees the word change before it
    /// blocks.
    fn wake_waiters(&self) {
        if test_dbg!(self.wait.swap(NO_WAITERS, SeqCst)) == WAITERS {
            trace!("FutexMutex: waking all waiters");
            self.futex.wake_all(&self.wait);
        }
    }
}

impl<F: Default> Default for FutexMutex<F> {
    fn default() -> Self {
        Self::with_spins_and_futex(Spins::DEFAULT, F::default())
    }
}

impl<F: fmt::Debug> fmt::Debug for FutexMutex<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock.load(Relaxed);
        f.debug_struct("FutexMutex")
            .field("locked", &(state & LOCKED == LOCKED))
            .field("contenders", &(state / CONTENDER))
            .field("wait", &(self.wait.load(Relaxed) == WAITERS))
            .field("spins", &self.spins)
            .field("futex", &self.futex)
            .finish()
    }
}

feature! {
    #![all(feature = "lock_api", not(loom))]

    unsafe impl lock_api::RawMutex for FutexMutex<crate::futex::OsFutex> {
        // As usual, clippy is totally wrong about this --- the whole point of
        // this constant is to create a *new* mutex every time.
        #[allow(clippy::declare_interior_mutable_const)]
        const INIT: Self = Self::new();

        type GuardMarker = lock_api::GuardSend;

        #[inline]
        fn lock(&self) {
            self.acquire();
        }

        #[inline]
        fn try_lock(&self) -> bool {
            self.try_acquire()
        }

        #[inline]
        unsafe fn unlock(&self) {
            self.release()
        }

        #[inline]
        fn is_locked(&self) -> bool {
            self.subscribe()
        }
    }
}
