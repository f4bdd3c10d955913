//! Deadline timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::ThreadMessage;
use crate::element::ElementIndex;
use crate::router::Router;

pub(crate) struct TimerInner {
    element: ElementIndex,
    router: Weak<Router>,
    home_thread: usize,
    deadline: Mutex<Option<Instant>>,
    /// Bumped on every (re)arm or cancel; stale heap entries carry an
    /// old generation and are discarded when popped.
    generation: AtomicU64,
    mailbox: Sender<ThreadMessage>,
}

/// A deadline plus a callable, owned by one thread's timer heap.
/// Re-arming replaces the deadline; the heap discards superseded
/// entries lazily.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    pub(crate) fn new(
        router: Weak<Router>,
        element: ElementIndex,
        home_thread: usize,
        mailbox: Sender<ThreadMessage>,
    ) -> Self {
        Timer {
            inner: Arc::new(TimerInner {
                element,
                router,
                home_thread,
                deadline: Mutex::new(None),
                generation: AtomicU64::new(0),
                mailbox,
            }),
        }
    }

    pub fn element(&self) -> ElementIndex {
        self.inner.element
    }

    pub fn home_thread(&self) -> usize {
        self.inner.home_thread
    }

    pub(crate) fn router(&self) -> Option<Arc<Router>> {
        self.inner.router.upgrade()
    }

    pub fn scheduled(&self) -> bool {
        self.inner.deadline.lock().is_some()
    }

    pub fn expiry(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    /// Arm (or re-arm) the timer for an absolute deadline.
    pub fn schedule_at(&self, deadline: Instant) {
        let generation;
        {
            let mut slot = self.inner.deadline.lock();
            *slot = Some(deadline);
            generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        }
        // before the router activates, the deadline just sits recorded;
        // activation pushes every armed timer onto its thread's heap
        if let Some(router) = self.inner.router.upgrade() {
            if router.runcount() > 0 {
                let _ = self
                    .inner
                    .mailbox
                    .send(ThreadMessage::ArmTimer(self.clone(), generation));
            }
        }
    }

    pub fn schedule_after(&self, delay: Duration) {
        self.schedule_at(Instant::now() + delay);
    }

    pub fn unschedule(&self) {
        let mut slot = self.inner.deadline.lock();
        *slot = None;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Push onto the heap at activation time, for timers armed while
    /// the router was still being initialized.
    pub(crate) fn flush_pending_arm(&self) {
        let (deadline, generation) = {
            let slot = self.inner.deadline.lock();
            (*slot, self.generation())
        };
        if deadline.is_some() {
            let _ = self
                .inner
                .mailbox
                .send(ThreadMessage::ArmTimer(self.clone(), generation));
        }
    }

    /// Driver-side: claim an expired heap entry. Clears the deadline
    /// and reports whether the entry was still current.
    pub(crate) fn begin_fire(&self, entry_generation: u64) -> bool {
        let mut slot = self.inner.deadline.lock();
        if self.generation() != entry_generation || slot.is_none() {
            return false;
        }
        *slot = None;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("element", &self.inner.element)
            .field("thread", &self.inner.home_thread)
            .field("expiry", &self.expiry())
            .finish()
    }
}
