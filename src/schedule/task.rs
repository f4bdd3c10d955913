//! Schedulable tasks.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;

use super::ThreadMessage;
use crate::element::ElementIndex;
use crate::router::Router;

/// Stride-scheduling unit: a task with `tickets` tickets advances its
/// pass by `STRIDE1 / tickets` per run, so higher-ticket tasks run
/// proportionally more often.
pub(crate) const STRIDE1: u64 = 1 << 16;
pub const DEFAULT_TICKETS: u32 = 1024;

const UNSCHEDULED: u8 = 0;
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
const RUNNING_RESCHEDULED: u8 = 3;

pub(crate) struct TaskInner {
    element: ElementIndex,
    router: Weak<Router>,
    home_thread: usize,
    tickets: AtomicU32,
    pass: AtomicU64,
    state: AtomicU8,
    mailbox: Sender<ThreadMessage>,
}

/// A callable bound to an element, cooperatively scheduled on one
/// RouterThread. Cloning yields another handle to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub(crate) fn new(
        router: Weak<Router>,
        element: ElementIndex,
        home_thread: usize,
        mailbox: Sender<ThreadMessage>,
    ) -> Self {
        Task {
            inner: Arc::new(TaskInner {
                element,
                router,
                home_thread,
                tickets: AtomicU32::new(DEFAULT_TICKETS),
                pass: AtomicU64::new(0),
                state: AtomicU8::new(UNSCHEDULED),
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

    pub fn tickets(&self) -> u32 {
        self.inner.tickets.load(Ordering::Relaxed)
    }

    pub fn set_tickets(&self, tickets: u32) {
        self.inner.tickets.store(tickets.max(1), Ordering::Relaxed);
    }

    pub fn scheduled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != UNSCHEDULED
    }

    /// Make the task runnable. A no-op once the owning router's
    /// runcount has gone non-positive, and idempotent while the task
    /// is already queued. Rescheduling a task owned by another thread
    /// wakes that thread through its mailbox.
    pub fn reschedule(&self) {
        let Some(router) = self.inner.router.upgrade() else {
            return;
        };
        if router.runcount() <= 0 {
            return;
        }
        loop {
            let state = self.inner.state.load(Ordering::Acquire);
            let (target, send) = match state {
                UNSCHEDULED => (SCHEDULED, true),
                RUNNING => (RUNNING_RESCHEDULED, false),
                _ => return,
            };
            if self
                .inner
                .state
                .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if send {
                    // the driver drains its mailbox into the runnable
                    // list; a send also wakes a sleeping thread
                    let _ = self.inner.mailbox.send(ThreadMessage::RunTask(self.clone()));
                }
                return;
            }
        }
    }

    /// Park the task: a queued entry is skipped when popped.
    pub fn unschedule(&self) {
        let _ = self.inner.state.compare_exchange(
            SCHEDULED,
            UNSCHEDULED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let _ = self.inner.state.compare_exchange(
            RUNNING_RESCHEDULED,
            RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn pass(&self) -> u64 {
        self.inner.pass.load(Ordering::Relaxed)
    }

    fn advance_pass(&self) {
        let stride = STRIDE1 / u64::from(self.tickets().max(1));
        self.inner.pass.fetch_add(stride.max(1), Ordering::Relaxed);
    }

    /// Driver-side: claim a queued task for running. Returns false if
    /// the entry is stale (task was unscheduled since it was queued).
    pub(crate) fn begin_run(&self) -> bool {
        self.inner
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Driver-side: back out of a claimed run without invoking the
    /// element (dead or stopped router).
    pub(crate) fn abort_run(&self) {
        self.inner.state.store(UNSCHEDULED, Ordering::Release);
    }

    /// Driver-side: finish a run. Returns true when the task should be
    /// requeued — it did work, or something rescheduled it mid-run.
    pub(crate) fn finish_run(&self, did_work: bool) -> bool {
        self.advance_pass();
        let rescheduled_midrun = self
            .inner
            .state
            .compare_exchange(RUNNING, UNSCHEDULED, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        if did_work || rescheduled_midrun {
            self.inner.state.store(SCHEDULED, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("element", &self.inner.element)
            .field("thread", &self.inner.home_thread)
            .field("scheduled", &self.scheduled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_task() -> Task {
        let (tx, _rx) = crossbeam_channel::unbounded();
        Task::new(Weak::new(), 0, 0, tx)
    }

    #[test]
    fn test_reschedule_is_noop_without_router() {
        // the owning router is gone (or its runcount non-positive):
        // reschedule must do nothing
        let task = orphan_task();
        task.reschedule();
        assert!(!task.scheduled());
    }

    #[test]
    fn test_finish_run_requeues_on_work_or_midrun_reschedule() {
        let task = orphan_task();

        // claimed run that did work stays runnable
        task.inner.state.store(super::SCHEDULED, Ordering::Release);
        assert!(task.begin_run());
        assert!(task.finish_run(true));

        // idle run parks
        assert!(task.begin_run());
        assert!(!task.finish_run(false));
        assert!(!task.scheduled());

        // idle run with a mid-run reschedule stays runnable
        task.inner.state.store(super::SCHEDULED, Ordering::Release);
        assert!(task.begin_run());
        task.inner
            .state
            .store(super::RUNNING_RESCHEDULED, Ordering::Release);
        assert!(task.finish_run(false));
    }

    #[test]
    fn test_pass_advances_by_stride() {
        let task = orphan_task();
        task.set_tickets(1024);
        let before = task.pass();
        task.advance_pass();
        assert_eq!(task.pass() - before, STRIDE1 / 1024);

        // more tickets, smaller stride, more frequent turns
        task.set_tickets(2048);
        let before = task.pass();
        task.advance_pass();
        assert_eq!(task.pass() - before, STRIDE1 / 2048);
    }
}
