//! Level-triggered availability signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Task;

struct SignalInner {
    active: AtomicBool,
    /// A constant signal never changes and carries no listeners.
    constant: bool,
    listeners: Mutex<Vec<Task>>,
}

/// A lightweight level-triggered flag. An upstream element (a queue,
/// typically) raises it while it has packets; a downstream puller
/// polls it to decide whether a pull is worth attempting, and parks
/// its task when the signal is inactive. Activation wakes every
/// listening task.
#[derive(Clone)]
pub struct NotifierSignal {
    inner: Arc<SignalInner>,
}

impl NotifierSignal {
    pub fn new(active: bool) -> Self {
        NotifierSignal {
            inner: Arc::new(SignalInner {
                active: AtomicBool::new(active),
                constant: false,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The signal used when no upstream element exports one: always
    /// active, so pullers pace themselves by task yields alone.
    pub fn always_active() -> Self {
        NotifierSignal {
            inner: Arc::new(SignalInner {
                active: AtomicBool::new(true),
                constant: true,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Set the level. An inactive-to-active transition wakes every
    /// listener.
    pub fn set_active(&self, active: bool) {
        if self.inner.constant {
            return;
        }
        let was = self.inner.active.swap(active, Ordering::AcqRel);
        if active && !was {
            for task in self.inner.listeners.lock().iter() {
                task.reschedule();
            }
        }
    }

    /// Register a task to wake on activation.
    pub fn add_listener(&self, task: Task) {
        if self.inner.constant {
            return;
        }
        self.inner.listeners.lock().push(task);
    }
}

impl std::fmt::Debug for NotifierSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierSignal")
            .field("active", &self.active())
            .field("constant", &self.inner.constant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_changes() {
        let s = NotifierSignal::new(false);
        assert!(!s.active());
        s.set_active(true);
        assert!(s.active());
        // clones observe the same level
        let view = s.clone();
        s.set_active(false);
        assert!(!view.active());
    }

    #[test]
    fn test_constant_signal_ignores_writes() {
        let s = NotifierSignal::always_active();
        s.set_active(false);
        assert!(s.active());
    }
}
