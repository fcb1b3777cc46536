//! Deterministic, single-threaded tests of the lock state machine.
//!
//! These use a [`Futex`] that records every call, and runs a hook in place of
//! blocking, which stands in for "some other thread" acting on the mutex while
//! the caller is parked.
use super::*;
use proptest::prelude::*;
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Call {
    Wait { addr: usize, expected: u32 },
    WakeOne(usize),
    WakeAll(usize),
}

#[derive(Debug)]
struct ScriptedFutex {
    calls: Mutex<Vec<Call>>,
    on_wait: fn(),
}

impl ScriptedFutex {
    const fn new(on_wait: fn()) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            on_wait,
        }
    }

    fn record(&self, call: Call) {
        tracing::debug!(?call, "futex call");
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl Futex for ScriptedFutex {
    fn wait(&self, atomic: &AtomicU32, expected: u32) {
        self.record(Call::Wait {
            addr: addr(atomic),
            expected,
        });
        if atomic.load(SeqCst) == expected {
            (self.on_wait)();
        }
    }

    fn wake_one(&self, atomic: &AtomicU32) {
        self.record(Call::WakeOne(addr(atomic)));
    }

    fn wake_all(&self, atomic: &AtomicU32) {
        self.record(Call::WakeAll(addr(atomic)));
    }
}

fn addr(atomic: &AtomicU32) -> usize {
    atomic as *const AtomicU32 as usize
}

fn nothing() {}

fn scripted(spins: Spins) -> FutexMutex<ScriptedFutex> {
    FutexMutex::with_spins_and_futex(spins, ScriptedFutex::new(nothing))
}

impl FutexMutex<ScriptedFutex> {
    fn lock_addr(&self) -> usize {
        addr(&self.lock)
    }

    fn wait_addr(&self) -> usize {
        addr(&self.wait)
    }

    fn calls(&self) -> Vec<Call> {
        self.futex.calls()
    }
}

#[test]
fn uncontended_acquire_is_fast() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);

    assert!(!lock.acquire());
    assert_eq!(lock.lock.load(SeqCst), 1);
    assert!(lock.subscribe());

    unsafe { lock.release() };
    assert_eq!(lock.lock.load(SeqCst), 0);
    assert!(!lock.subscribe());
    assert!(lock.calls().is_empty());
}

#[test]
fn acquire_takes_a_free_mutex_with_contenders() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);
    // Free, with one contender that has not yet retried its CAS.
    lock.lock.store(2, SeqCst);

    assert!(!lock.acquire());
    assert_eq!(lock.lock.load(SeqCst), 3);
    assert_eq!(lock.contenders(), 1);
    assert!(lock.calls().is_empty());
}

#[test]
fn zero_spins_escalates_immediately() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::NONE);

    // Registers as a contender, then takes the free lock on the first CAS.
    assert!(!lock.acquire());
    assert_eq!(lock.lock.load(SeqCst), 1);
    assert_eq!(lock.contenders(), 0);
    assert!(lock.calls().is_empty());
}

#[test]
fn release_with_contenders_wakes_one() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);
    // Held, with one contender blocked.
    lock.lock.store(3, SeqCst);
    lock.wait.store(WAITERS, SeqCst);

    unsafe { lock.release() };
    assert_eq!(lock.lock.load(SeqCst), 2);
    assert!(!lock.subscribe());
    // Waiters for a free mutex are left alone until the contenders are done.
    assert_eq!(lock.wait.load(SeqCst), WAITERS);
    assert_eq!(lock.calls(), [Call::WakeOne(lock.lock_addr())]);
}

#[test]
fn release_to_free_wakes_all_waiters() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);
    lock.lock.store(1, SeqCst);
    lock.wait.store(WAITERS, SeqCst);

    unsafe { lock.release() };
    assert_eq!(lock.lock.load(SeqCst), 0);
    assert_eq!(lock.wait.load(SeqCst), NO_WAITERS);
    assert_eq!(lock.calls(), [Call::WakeAll(lock.wait_addr())]);
}

#[test]
fn release_to_free_without_waiters_wakes_nobody() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);
    assert!(lock.try_acquire());

    unsafe { lock.release() };
    assert!(lock.calls().is_empty());
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "release called on an unlocked mutex")]
fn release_unlocked_panics_in_debug() {
    let lock = scripted(Spins::DEFAULT);
    unsafe { lock.release() };
}

#[test]
fn acquire_slow_path_waits_then_locks() {
    static LOCK: FutexMutex<ScriptedFutex> =
        FutexMutex::with_spins_and_futex(Spins::new(3, 0), ScriptedFutex::new(release_other));

    // Stands in for the thread that held the lock releasing it.
    fn release_other() {
        unsafe { LOCK.release() }
    }

    let _trace = crate::util::test::trace_init();
    assert!(LOCK.try_acquire());

    assert!(LOCK.acquire(), "acquire should report blocking");
    assert_eq!(LOCK.lock.load(SeqCst), 1);
    assert_eq!(LOCK.contenders(), 0);
    assert_eq!(
        LOCK.calls(),
        [
            Call::Wait {
                addr: LOCK.lock_addr(),
                expected: 3,
            },
            Call::WakeOne(LOCK.lock_addr()),
        ]
    );

    unsafe { LOCK.release() };
    assert!(!LOCK.subscribe());
}

#[test]
fn wait_for_free_returns_immediately_when_free() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::DEFAULT);

    assert!(!lock.wait_for_free());
    assert_eq!(lock.wait.load(SeqCst), NO_WAITERS);
    assert!(lock.calls().is_empty());
}

#[test]
fn wait_for_free_blocks_until_release() {
    static LOCK: FutexMutex<ScriptedFutex> =
        FutexMutex::with_spins_and_futex(Spins::new(0, 5), ScriptedFutex::new(release_other));

    fn release_other() {
        unsafe { LOCK.release() }
    }

    let _trace = crate::util::test::trace_init();
    assert!(LOCK.try_acquire());

    assert!(LOCK.wait_for_free(), "wait_for_free should report blocking");
    // Waiting for the lock to be free must not acquire it.
    assert!(!LOCK.subscribe());
    assert_eq!(LOCK.wait.load(SeqCst), NO_WAITERS);
    assert_eq!(
        LOCK.calls(),
        [
            Call::Wait {
                addr: LOCK.wait_addr(),
                expected: WAITERS,
            },
            Call::WakeAll(LOCK.wait_addr()),
        ]
    );
}

#[test]
fn wait_for_free_retries_after_spurious_wakeup() {
    static LOCK: FutexMutex<ScriptedFutex> =
        FutexMutex::with_spins_and_futex(Spins::new(0, 1), ScriptedFutex::new(release_second));
    static WAITS: AtomicUsize = AtomicUsize::new(0);

    // The first wait returns without anything having changed.
    fn release_second() {
        if WAITS.fetch_add(1, SeqCst) == 1 {
            unsafe { LOCK.release() }
        }
    }

    let _trace = crate::util::test::trace_init();
    assert!(LOCK.try_acquire());

    assert!(LOCK.wait_for_free());
    assert_eq!(WAITS.load(SeqCst), 2);
    let wait = Call::Wait {
        addr: LOCK.wait_addr(),
        expected: WAITERS,
    };
    assert_eq!(
        LOCK.calls(),
        [wait, wait, Call::WakeAll(LOCK.wait_addr())]
    );
}

#[test]
fn wait_for_free_rechecks_after_registering() {
    let _trace = crate::util::test::trace_init();
    let lock = scripted(Spins::NONE);

    // With no spin budget, the only check of the lock word is the one made
    // after registering in `wait`; it must not block on a free mutex.
    assert!(!lock.wait_for_free());

    // The registration is withdrawn before returning.
    assert_eq!(lock.wait.load(SeqCst), NO_WAITERS);
    assert_eq!(lock.calls(), [Call::WakeAll(lock.wait_addr())]);

    // So the next uncontended release has nobody to wake.
    assert!(lock.try_acquire());
    unsafe { lock.release() };
    assert_eq!(lock.calls(), [Call::WakeAll(lock.wait_addr())]);
}

#[test]
fn wait_for_free_second_waiter_does_not_strand_the_first() {
    static LOCK: FutexMutex<ScriptedFutex> =
        FutexMutex::with_spins_and_futex(Spins::NONE, ScriptedFutex::new(release_then_wait));

    // Runs after the first waiter has registered and seen the mutex held, but
    // before it blocks: the holder releases, then a second waiter comes and
    // goes.
    fn release_then_wait() {
        unsafe { LOCK.release() };
        assert!(!LOCK.wait_for_free());
        assert_eq!(
            LOCK.wait.load(SeqCst),
            NO_WAITERS,
            "the first waiter would block on a free mutex with no wakeup pending"
        );
    }

    let _trace = crate::util::test::trace_init();
    assert!(LOCK.try_acquire());

    assert!(LOCK.wait_for_free());
    assert!(!LOCK.subscribe());
    assert_eq!(LOCK.wait.load(SeqCst), NO_WAITERS);
    let wake_all = Call::WakeAll(LOCK.wait_addr());
    assert_eq!(
        LOCK.calls(),
        [
            Call::Wait {
                addr: LOCK.wait_addr(),
                expected: WAITERS,
            },
            // The release, then each waiter withdrawing its registration.
            wake_all,
            wake_all,
            wake_all,
        ]
    );
}

#[derive(Copy, Clone, Debug)]
enum Op {
    Acquire,
    TryAcquire,
    Release,
    Subscribe,
    WaitForFree,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Acquire),
        Just(Op::TryAcquire),
        Just(Op::Release),
        Just(Op::Subscribe),
        Just(Op::WaitForFree),
    ]
}

proptest! {
    /// Without other threads, no operation ever has to block, and the lock
    /// word only ever holds the lock bit.
    #[test]
    fn single_threaded_ops_match_model(
        lock_spins in 0u32..4,
        wait_spins in 0u32..4,
        ops in proptest::collection::vec(op(), 0..64),
    ) {
        let lock = scripted(Spins::new(lock_spins, wait_spins));
        let mut held = false;

        for op in ops {
            match op {
                Op::Acquire if !held => {
                    prop_assert!(!lock.acquire());
                    held = true;
                }
                Op::TryAcquire => {
                    prop_assert_eq!(lock.try_acquire(), !held);
                    held = true;
                }
                Op::Release if held => {
                    unsafe { lock.release() };
                    held = false;
                }
                Op::Subscribe => prop_assert_eq!(lock.subscribe(), held),
                Op::WaitForFree if !held => prop_assert!(!lock.wait_for_free()),
                // Would block forever, or release an unheld lock.
                _ => {}
            }

            prop_assert_eq!(lock.lock.load(SeqCst), held as u32);
            prop_assert_eq!(lock.contenders(), 0);
            prop_assert_eq!(lock.wait.load(SeqCst), NO_WAITERS);
        }

        let blocked = lock
            .calls()
            .into_iter()
            .any(|call| matches!(call, Call::Wait { .. } | Call::WakeOne(_)));
        prop_assert!(!blocked);
    }
}
