//! Unqueue: pull-to-push pump.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::args::{parse_bool, Args};
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::router::{HandlerBuilder, HandlerError, InitContext, Ports};
use crate::schedule::{NotifierSignal, Task};

const DEFAULT_BURST: usize = 8;

/// Pulls packets from its input and pushes them out, `BURST` per task
/// invocation, parking on the upstream-empty signal so an empty queue
/// costs nothing.
pub struct Unqueue {
    burst: usize,
    limit: AtomicI64,
    active: AtomicBool,
    count: AtomicU64,
    task: Mutex<Option<Task>>,
    signal: Mutex<Option<NotifierSignal>>,
}

impl Default for Unqueue {
    fn default() -> Self {
        Unqueue {
            burst: DEFAULT_BURST,
            limit: AtomicI64::new(-1),
            active: AtomicBool::new(true),
            count: AtomicU64::new(0),
            task: Mutex::new(None),
            signal: Mutex::new(None),
        }
    }
}

impl Unqueue {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn limit_reached(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        limit >= 0 && self.count() >= limit as u64
    }
}

impl Element for Unqueue {
    fn class_name(&self) -> &'static str {
        "Unqueue"
    }

    fn port_count(&self) -> PortCount {
        PortCount::exact(1, 1)
    }

    fn processing(&self) -> Processing {
        Processing::Spec("l/h")
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(0, &["BURST", "LIMIT", "ACTIVE"])?;
        self.burst = args.get_usize("BURST", DEFAULT_BURST)?.max(1);
        self.limit
            .store(args.get_i64("LIMIT", -1)?, Ordering::Relaxed);
        self.active
            .store(args.get_bool("ACTIVE", true)?, Ordering::Relaxed);
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        let task = ctx.add_task();
        let signal = ctx.upstream_signal(0);
        signal.add_listener(task.clone());
        *self.task.lock() = Some(task);
        *self.signal.lock() = Some(signal);
        Ok(())
    }

    fn run_task(&self, ports: &Ports<'_>) -> bool {
        if !self.active.load(Ordering::Relaxed) || self.limit_reached() {
            return false;
        }
        let mut worked = false;
        for _ in 0..self.burst {
            if self.limit_reached() {
                break;
            }
            match ports.pull(0) {
                Some(packet) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
                    ports.push(0, packet);
                    worked = true;
                }
                None => break,
            }
        }
        let upstream_live = self
            .signal
            .lock()
            .as_ref()
            .map(|s| s.active())
            .unwrap_or(true);
        worked || (upstream_live && !self.limit_reached())
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("count", |u: &Unqueue| u.count().to_string());
        handlers.read("active", |u: &Unqueue| {
            u.active.load(Ordering::Relaxed).to_string()
        });
        handlers.write("active", |u: &Unqueue, value| {
            let active = parse_bool(value.trim())
                .ok_or_else(|| HandlerError::message("expected a boolean"))?;
            u.active.store(active, Ordering::Relaxed);
            if active {
                if let Some(task) = u.task.lock().as_ref() {
                    task.reschedule();
                }
            }
            Ok(())
        });
        handlers.write("reset", |u: &Unqueue, _| {
            u.count.store(0, Ordering::Relaxed);
            if let Some(task) = u.task.lock().as_ref() {
                task.reschedule();
            }
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
