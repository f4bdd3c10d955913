//! The Master: process-wide owner of driver threads, the active
//! router, and the hot-swap slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{driver_loop, ThreadMessage};
use crate::router::Router;

/// Per-thread driver counters, exported by the root `threads` handler.
#[derive(Default)]
pub struct ThreadStats {
    tasks_run: AtomicU64,
    timers_fired: AtomicU64,
    wakeups: AtomicU64,
}

impl ThreadStats {
    pub(crate) fn note_task(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_timer(&self) {
        self.timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
pub struct ThreadStatsSnapshot {
    pub thread: usize,
    pub tasks_run: u64,
    pub timers_fired: u64,
    pub wakeups: u64,
}

/// Owns the RouterThread mailboxes, the currently active router
/// (refcount ≥ 1 while live) and at most one pending hot-swap
/// candidate. Not a global: construct one per driver, so independent
/// drivers coexist in tests.
pub struct Master {
    senders: Vec<Sender<ThreadMessage>>,
    receivers: Mutex<Vec<Option<Receiver<ThreadMessage>>>>,
    stats: Vec<Arc<ThreadStats>>,
    current: RwLock<Option<Arc<Router>>>,
    pending: Mutex<Option<Arc<Router>>>,
}

impl Master {
    pub fn new(nthreads: usize) -> Arc<Master> {
        let nthreads = nthreads.max(1);
        let mut senders = Vec::with_capacity(nthreads);
        let mut receivers = Vec::with_capacity(nthreads);
        let mut stats = Vec::with_capacity(nthreads);
        for _ in 0..nthreads {
            let (tx, rx) = crossbeam_channel::unbounded();
            senders.push(tx);
            receivers.push(Some(rx));
            stats.push(Arc::new(ThreadStats::default()));
        }
        Arc::new(Master {
            senders,
            receivers: Mutex::new(receivers),
            stats,
            current: RwLock::new(None),
            pending: Mutex::new(None),
        })
    }

    pub fn nthreads(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn sender(&self, thread: usize) -> Sender<ThreadMessage> {
        self.senders[thread.min(self.senders.len() - 1)].clone()
    }

    pub(crate) fn take_receiver(&self, thread: usize) -> Option<Receiver<ThreadMessage>> {
        self.receivers.lock().get_mut(thread)?.take()
    }

    pub(crate) fn stats_handle(&self, thread: usize) -> Arc<ThreadStats> {
        Arc::clone(&self.stats[thread])
    }

    pub fn current_router(&self) -> Option<Arc<Router>> {
        self.current.read().clone()
    }

    /// Install the first router. Hot-swap replacements go through
    /// [`Master::request_hotswap`] instead.
    pub fn install(&self, router: Arc<Router>) {
        *self.current.write() = Some(router);
    }

    /// Ask the active router to stop; driver loops exit once its
    /// runcount goes non-positive.
    pub fn please_stop_current(&self) {
        if let Some(router) = self.current_router() {
            router.please_stop();
        }
    }

    /// True while any driver loop still has a reason to spin.
    pub(crate) fn work_remaining(&self) -> bool {
        if self.pending.lock().is_some() {
            return true;
        }
        match self.current_router() {
            Some(router) => router.runcount() > 0,
            None => false,
        }
    }

    /// Queue a hot-swap candidate and wake the master thread to
    /// perform it between task invocations. Concurrent requests
    /// serialize: while one candidate is pending, further requests
    /// are refused so the loser hears about it.
    pub fn request_hotswap(&self, candidate: Arc<Router>) -> Result<(), String> {
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err("another hot-swap is already pending".to_string());
            }
            *pending = Some(candidate);
        }
        let _ = self.senders[0].send(ThreadMessage::HotSwap);
        Ok(())
    }

    /// Runs on the master thread between task invocations: activate
    /// the candidate, stop the outgoing router, rebind the current
    /// pointer, release the old reference.
    pub(crate) fn perform_hotswap(self: &Arc<Self>) {
        let Some(candidate) = self.pending.lock().take() else {
            return;
        };
        let old = self.current_router();
        candidate.activate();
        if let Some(old) = &old {
            old.please_stop();
        }
        *self.current.write() = Some(candidate);
        info!("hot-swap complete");
        // `old` drops here; the router is destroyed once in-flight
        // references are released
    }

    /// Wake every thread, e.g. after installing a router outside the
    /// normal activation path.
    pub fn wake_all(&self) {
        for tx in &self.senders {
            let _ = tx.send(ThreadMessage::Wake);
        }
    }

    /// Run the driver loops to completion: threads 1..N spawned,
    /// thread 0 inline. Returns when the active router stops.
    pub fn run(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for id in 1..self.nthreads() {
            let master = Arc::clone(self);
            match thread::Builder::new()
                .name(format!("weft-rt{}", id))
                .spawn(move || driver_loop(&master, id))
            {
                Ok(h) => handles.push(h),
                Err(e) => warn!(thread = id, error = %e, "failed to spawn driver thread"),
            }
        }

        driver_loop(self, 0);

        // once thread 0 is done, the rest observe the same runcount
        self.wake_all();
        for h in handles {
            if h.join().is_err() {
                warn!("driver thread panicked");
            }
        }
        debug!("all driver threads joined");
    }

    pub fn thread_stats(&self) -> Vec<ThreadStatsSnapshot> {
        self.stats
            .iter()
            .enumerate()
            .map(|(thread, s)| ThreadStatsSnapshot {
                thread,
                tasks_run: s.tasks_run.load(Ordering::Relaxed),
                timers_fired: s.timers_fired.load(Ordering::Relaxed),
                wakeups: s.wakeups.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("nthreads", &self.nthreads())
            .field("has_router", &self.current_router().is_some())
            .field("swap_pending", &self.pending.lock().is_some())
            .finish()
    }
}
