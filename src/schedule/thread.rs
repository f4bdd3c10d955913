//! RouterThread: the per-thread driver loop.
//!
//! Each thread owns a runnable task heap (stride-ordered, FIFO within
//! equal passes) and a timer heap, plus a mailbox other threads use to
//! hand it work and wake it from sleep. The loop fires due timers,
//! runs one task, and sleeps on the mailbox until the next deadline
//! when idle.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use super::{Master, Task, ThreadStats, Timer};

/// Upper bound on one sleep, so stop requests and signal flags are
/// observed promptly even with no timers armed.
pub const MAX_SLEEP: Duration = Duration::from_millis(100);

pub(crate) enum ThreadMessage {
    RunTask(Task),
    ArmTimer(Timer, u64),
    HotSwap,
    Wake,
}

struct RunnableEntry {
    pass: u64,
    seq: u64,
    task: Task,
}

impl PartialEq for RunnableEntry {
    fn eq(&self, other: &Self) -> bool {
        self.pass == other.pass && self.seq == other.seq
    }
}
impl Eq for RunnableEntry {}
impl PartialOrd for RunnableEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for RunnableEntry {
    // BinaryHeap is a max-heap; invert so the smallest pass pops first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.pass, other.seq).cmp(&(self.pass, self.seq))
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    generation: u64,
    timer: Timer,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

pub(crate) struct RouterThread {
    id: usize,
    receiver: Receiver<ThreadMessage>,
    runnable: BinaryHeap<RunnableEntry>,
    timers: BinaryHeap<TimerEntry>,
    seq: u64,
    stats: Arc<ThreadStats>,
}

/// Entry point for one driver thread. Thread 0 runs inline in
/// [`Master::run`]; the rest are spawned OS threads.
pub(crate) fn driver_loop(master: &Arc<Master>, id: usize) {
    let Some(receiver) = master.take_receiver(id) else {
        debug!(thread = id, "driver already ran on this master");
        return;
    };
    let mut thread = RouterThread {
        id,
        receiver,
        runnable: BinaryHeap::new(),
        timers: BinaryHeap::new(),
        seq: 0,
        stats: master.stats_handle(id),
    };
    debug!(thread = id, "driver starting");
    thread.driver(master);
    debug!(thread = id, "driver exiting");
}

impl RouterThread {
    fn driver(&mut self, master: &Arc<Master>) {
        loop {
            if crate::driver::stop_pending() {
                master.please_stop_current();
            }

            while let Ok(msg) = self.receiver.try_recv() {
                self.handle(msg, master);
            }

            self.fire_due_timers();
            let ran = self.run_one_task();

            if !master.work_remaining() {
                break;
            }

            if !ran && self.runnable.is_empty() {
                let timeout = self
                    .timers
                    .peek()
                    .map(|t| t.deadline.saturating_duration_since(Instant::now()))
                    .unwrap_or(MAX_SLEEP)
                    .min(MAX_SLEEP);
                match self.receiver.recv_timeout(timeout) {
                    Ok(msg) => self.handle(msg, master),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
    }

    fn handle(&mut self, msg: ThreadMessage, master: &Arc<Master>) {
        self.stats.note_wakeup();
        match msg {
            ThreadMessage::RunTask(task) => self.push_runnable(task),
            ThreadMessage::ArmTimer(timer, generation) => {
                // stale arms (superseded or cancelled) are dropped here
                // or at pop time, whichever notices first
                if timer.generation() == generation {
                    if let Some(deadline) = timer.expiry() {
                        self.seq += 1;
                        self.timers.push(TimerEntry {
                            deadline,
                            seq: self.seq,
                            generation,
                            timer,
                        });
                    }
                }
            }
            ThreadMessage::HotSwap => {
                if self.id == 0 {
                    master.perform_hotswap();
                } else {
                    debug!(thread = self.id, "hot-swap request on non-master thread");
                }
            }
            ThreadMessage::Wake => {}
        }
    }

    fn push_runnable(&mut self, task: Task) {
        self.seq += 1;
        self.runnable.push(RunnableEntry {
            pass: task.pass(),
            seq: self.seq,
            task,
        });
    }

    /// Fire every timer whose deadline has passed. Deadlines are
    /// monotonic instants; equal deadlines fire in arming order.
    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().expect("peeked timer entry");
            if !entry.timer.begin_fire(entry.generation) {
                continue;
            }
            let Some(router) = entry.timer.router() else {
                continue;
            };
            if router.runcount() <= 0 {
                trace!(element = entry.timer.element(), "timer on stopped router");
                continue;
            }
            router.run_timer_for(entry.timer.element());
            self.stats.note_timer();
        }
    }

    /// Pop and run the lowest-pass runnable task, if any. Tasks whose
    /// router has stopped are quietly retired.
    fn run_one_task(&mut self) -> bool {
        while let Some(entry) = self.runnable.pop() {
            let task = entry.task;
            if !task.begin_run() {
                continue; // unscheduled since it was queued
            }
            let Some(router) = task.router() else {
                task.abort_run();
                continue;
            };
            if router.runcount() <= 0 {
                task.abort_run();
                continue;
            }
            let did_work = router.run_task_for(task.element());
            self.stats.note_task();
            if task.finish_run(did_work) {
                self.push_runnable(task);
            }
            return true;
        }
        false
    }
}
