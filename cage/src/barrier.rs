use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::TaskRunner;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Default = 0,
    CollectionRequested = 1,
    CollectionStarted = 2,
    Shutdown = 3,
}

impl From<u8> for BarrierState {
    fn from(val: u8) -> Self {
        match val {
            1 => BarrierState::CollectionRequested,
            2 => BarrierState::CollectionStarted,
            3 => BarrierState::Shutdown,
            _ => BarrierState::Default,
        }
    }
}

/// The side of the heap that performs collections on the main thread.
pub trait CollectionHost: Send + Sync {
    /// Runs on the main thread from the posted interrupt task.
    fn check_collection_requested(&self);
}

#[derive(Debug)]
struct Protected {
    /// Bumped every time waiters are released.
    cycle: u64,
    collection_performed: bool,
    timer: Option<Instant>,
}

/// Parks background threads that need a collection until the main thread
/// has performed one.
pub struct CollectionBarrier {
    state: AtomicU8,
    /// Poll-for-GC flag checked by the main thread at safe points.
    interrupt: AtomicBool,
    protected: Mutex<Protected>,
    wakeup: Condvar,
    last_time_to_collection: Mutex<Option<Duration>>,
    runner: Arc<dyn TaskRunner>,
    host: Weak<dyn CollectionHost>,
}

impl CollectionBarrier {
    pub fn new(runner: Arc<dyn TaskRunner>, host: Weak<dyn CollectionHost>) -> Self {
        Self {
            state: AtomicU8::new(BarrierState::Default as u8),
            interrupt: AtomicBool::new(false),
            protected: Mutex::new(Protected {
                cycle: 0,
                collection_performed: false,
                timer: None,
            }),
            wakeup: Condvar::new(),
            last_time_to_collection: Mutex::new(None),
            runner,
            host,
        }
    }

    #[inline]
    pub fn state(&self) -> BarrierState {
        self.state.load(Ordering::Acquire).into()
    }

    #[inline]
    fn set_state(&self, state: BarrierState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn was_collection_requested(&self) -> bool {
        self.state() == BarrierState::CollectionRequested
    }

    #[inline]
    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Consumes the poll flag; true if an interrupt was pending.
    #[inline]
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    pub fn last_time_to_collection(&self) -> Option<Duration> {
        *self.last_time_to_collection.lock()
    }

    /// Moves Default to CollectionRequested. Returns whether this call made
    /// the transition, which makes the caller responsible for interrupting
    /// the main thread.
    fn request_locked(&self, protected: &mut Protected) -> bool {
        if self.state() != BarrierState::Default {
            return false;
        }
        debug_assert!(protected.timer.is_none());
        protected.timer = Some(Instant::now());
        protected.collection_performed = false;
        self.set_state(BarrierState::CollectionRequested);
        true
    }

    fn interrupt_main_thread(&self) {
        log::trace!("interrupting main thread for background collection request");
        let host = self.host.clone();
        self.runner.post_task(Box::new(move || {
            if let Some(host) = host.upgrade() {
                host.check_collection_requested();
            }
        }));
        // raised after posting so a poller that sees it finds the task queued
        self.interrupt.store(true, Ordering::Release);
    }

    /// Requests a collection without waiting for it. Returns false once
    /// shutdown has been requested.
    pub fn try_request_collection(&self) -> bool {
        let first = {
            let mut protected = self.protected.lock();
            if self.state() == BarrierState::Shutdown {
                return false;
            }
            self.request_locked(&mut protected)
        };
        if first {
            self.interrupt_main_thread();
        }
        true
    }

    /// Called by a background thread that cannot continue without a
    /// collection. Blocks until the main thread resumes waiters. Returns
    /// whether a collection was actually performed.
    pub fn await_collection_background(&self) -> bool {
        let (first, cycle) = {
            let mut protected = self.protected.lock();
            if self.state() == BarrierState::Shutdown {
                return false;
            }
            (self.request_locked(&mut protected), protected.cycle)
        };

        if first {
            self.interrupt_main_thread();
        }

        let mut protected = self.protected.lock();
        while protected.cycle == cycle {
            if self.state() == BarrierState::Shutdown {
                return false;
            }
            self.wakeup.wait(&mut protected);
        }
        protected.collection_performed
    }

    /// Called by the main thread as the collection begins.
    pub fn stop_time_to_collection_timer(&self) {
        let mut protected = self.protected.lock();
        if self.state() != BarrierState::CollectionRequested {
            return;
        }
        if let Some(start) = protected.timer.take() {
            let elapsed = start.elapsed();
            log::debug!("time to collection on background request: {elapsed:?}");
            *self.last_time_to_collection.lock() = Some(elapsed);
        }
        self.set_state(BarrierState::CollectionStarted);
    }

    /// Called by the main thread after the collection finished.
    pub fn resume_threads_awaiting_collection(&self) {
        self.release_waiters(true);
    }

    /// Drops a pending request without collecting. Waiters return false.
    pub fn cancel_collection_and_resume_threads(&self) {
        self.release_waiters(false);
    }

    fn release_waiters(&self, performed: bool) {
        let mut protected = self.protected.lock();
        if self.state() == BarrierState::Shutdown {
            return;
        }
        protected.timer = None;
        protected.collection_performed = performed;
        protected.cycle = protected.cycle.wrapping_add(1);
        self.interrupt.store(false, Ordering::Release);
        self.set_state(BarrierState::Default);
        self.wakeup.notify_all();
    }

    /// Terminal. Every current and future waiter returns immediately.
    pub fn shutdown_requested(&self) {
        let mut protected = self.protected.lock();
        protected.timer = None;
        protected.collection_performed = false;
        self.set_state(BarrierState::Shutdown);
        self.wakeup.notify_all();
        log::debug!("collection barrier shut down");
    }
}
