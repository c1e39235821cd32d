//! Cooperative event dispatcher.
//!
//! One thread owns the dispatched value (`T`, the application core) and
//! blocks in [`EventDispatcher::wait`] until something wakes it:
//!
//! - producers in "interrupt" context (audio ready callbacks) only call
//!   [`WakeSignal::raise`], which is an atomic `fetch_or` plus an unpark.
//!   No locks, no allocation.
//! - any thread may [`Scheduler::schedule`] a closure; closures run on the
//!   dispatcher thread with `&mut T`, in FIFO order.
//!
//! Wake reasons are level-triggered: raising the same reason twice before
//! the dispatcher wakes collapses into one.

use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, Thread};

/// A deferred action executed on the dispatcher thread.
pub type Task<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

/// Small coalescing set of reasons for the dispatcher to wake up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WakeReasons(u8);

impl WakeReasons {
    pub const SCHEDULE: Self = Self(1 << 0);
    pub const AUDIO_INPUT_READY: Self = Self(1 << 1);
    pub const AUDIO_OUTPUT_READY: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for WakeReasons {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Default)]
struct WakeFlags {
    bits: AtomicU8,
    waiter: OnceLock<Thread>,
}

/// Producer endpoint for wake reasons. Cheap to clone, safe to call from any
/// context that may not block.
#[derive(Clone)]
pub struct WakeSignal {
    flags: Arc<WakeFlags>,
}

impl WakeSignal {
    pub fn raise(&self, reasons: WakeReasons) {
        self.flags.bits.fetch_or(reasons.bits(), Ordering::AcqRel);
        if let Some(waiter) = self.flags.waiter.get() {
            waiter.unpark();
        }
    }
}

struct Shared<T> {
    flags: Arc<WakeFlags>,
    tasks: Mutex<Vec<Task<T>>>,
    /// Set when the dispatcher goes away; later tasks are dropped unrun.
    closed: AtomicBool,
}

impl<T> Shared<T> {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<Task<T>>> {
        // a panicking task never holds this lock, so poisoning carries no broken invariant
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Thread-safe handle used to enqueue work for the dispatcher thread.
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> Scheduler<T> {
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        {
            let mut tasks = self.shared.lock_tasks();
            if self.shared.closed.load(Ordering::Acquire) {
                return;
            }
            tasks.push(Box::new(task));
        }
        WakeSignal { flags: self.shared.flags.clone() }.raise(WakeReasons::SCHEDULE);
    }

    pub fn wake_signal(&self) -> WakeSignal {
        WakeSignal { flags: self.shared.flags.clone() }
    }
}

pub struct EventDispatcher<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventDispatcher<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                flags: Arc::new(WakeFlags::default()),
                tasks: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn scheduler(&self) -> Scheduler<T> {
        Scheduler { shared: self.shared.clone() }
    }

    pub fn wake_signal(&self) -> WakeSignal {
        WakeSignal { flags: self.shared.flags.clone() }
    }

    /// Block until at least one wake reason is pending, then capture and
    /// clear all of them at once.
    ///
    /// The first thread to call this becomes the dispatcher thread; producers
    /// unpark that thread.
    pub fn wait(&self) -> WakeReasons {
        let current = thread::current();
        let _ = self.shared.flags.waiter.set(current);
        loop {
            let pending = self.take_pending();
            if !pending.is_empty() {
                return pending;
            }
            thread::park();
        }
    }

    /// Capture and clear pending wake reasons without blocking.
    pub fn take_pending(&self) -> WakeReasons {
        WakeReasons(self.shared.flags.bits.swap(0, Ordering::AcqRel))
    }

    /// Swap out the whole pending task list. The lock is released before the
    /// caller runs anything, so tasks may schedule more tasks.
    pub fn take_tasks(&self) -> Vec<Task<T>> {
        std::mem::take(&mut *self.shared.lock_tasks())
    }

    /// Run one drain cycle: every task queued before this call, in order.
    /// Returns how many ran.
    pub fn drain(&self, target: &mut T) -> usize {
        let tasks = self.take_tasks();
        let count = tasks.len();
        for task in tasks {
            task(target);
        }
        count
    }

    /// Stop accepting tasks and drop the ones still queued.
    pub fn close(&self) {
        let dropped = {
            let mut tasks = self.shared.lock_tasks();
            self.shared.closed.store(true, Ordering::Release);
            std::mem::take(&mut *tasks)
        };
        drop(dropped);
    }
}

impl<T> Drop for EventDispatcher<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tasks_run_in_enqueue_order() {
        let dispatcher = EventDispatcher::<Vec<u32>>::new();
        let scheduler = dispatcher.scheduler();
        for i in 0..5 {
            scheduler.schedule(move |log: &mut Vec<u32>| log.push(i));
        }
        let mut log = Vec::new();
        assert!(dispatcher.take_pending().contains(WakeReasons::SCHEDULE));
        assert_eq!(dispatcher.drain(&mut log), 5);
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn tasks_enqueued_during_drain_wait_for_next_cycle() {
        let dispatcher = EventDispatcher::<Vec<u32>>::new();
        let scheduler = dispatcher.scheduler();
        let inner = scheduler.clone();
        scheduler.schedule(move |log: &mut Vec<u32>| {
            log.push(1);
            inner.schedule(|log: &mut Vec<u32>| log.push(3));
        });
        scheduler.schedule(|log: &mut Vec<u32>| log.push(2));

        let mut log = Vec::new();
        dispatcher.take_pending();
        dispatcher.drain(&mut log);
        assert_eq!(log, vec![1, 2]);

        // the nested schedule raised the flag again
        assert!(dispatcher.take_pending().contains(WakeReasons::SCHEDULE));
        dispatcher.drain(&mut log);
        assert_eq!(log, vec![1, 2, 3]);
    }

    #[test]
    fn repeated_signals_coalesce() {
        let dispatcher = EventDispatcher::<()>::new();
        let signal = dispatcher.wake_signal();
        for _ in 0..10 {
            signal.raise(WakeReasons::AUDIO_INPUT_READY);
        }
        signal.raise(WakeReasons::AUDIO_OUTPUT_READY);

        let pending = dispatcher.take_pending();
        assert!(pending.contains(WakeReasons::AUDIO_INPUT_READY));
        assert!(pending.contains(WakeReasons::AUDIO_OUTPUT_READY));
        assert!(!pending.contains(WakeReasons::SCHEDULE));
        assert!(dispatcher.take_pending().is_empty());
    }

    #[test]
    fn wait_wakes_on_signal_from_other_thread() {
        let dispatcher = EventDispatcher::<()>::new();
        let signal = dispatcher.wake_signal();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.raise(WakeReasons::AUDIO_OUTPUT_READY);
        });
        let reasons = dispatcher.wait();
        assert!(reasons.contains(WakeReasons::AUDIO_OUTPUT_READY));
        producer.join().unwrap();
    }

    #[test]
    fn closed_dispatcher_drops_tasks() {
        let dispatcher = EventDispatcher::<Vec<u32>>::new();
        let scheduler = dispatcher.scheduler();
        scheduler.schedule(|log: &mut Vec<u32>| log.push(1));
        dispatcher.close();
        scheduler.schedule(|log: &mut Vec<u32>| log.push(2));

        let mut log = Vec::new();
        assert_eq!(dispatcher.drain(&mut log), 0);
        assert!(log.is_empty());
    }

    #[test]
    fn empty_reason_is_never_contained() {
        assert!(!WakeReasons::SCHEDULE.contains(WakeReasons::default()));
        let both = WakeReasons::SCHEDULE | WakeReasons::AUDIO_INPUT_READY;
        assert!(both.contains(WakeReasons::SCHEDULE));
        assert!(!both.contains(WakeReasons::AUDIO_OUTPUT_READY));
    }
}
