//! InfiniteSource: task-driven packet generator.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::args::{parse_bool, Args};
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError, InitContext, Ports};
use crate::schedule::Task;

const DEFAULT_LENGTH: usize = 64;
const DEFAULT_BURST: usize = 8;

/// Pushes generated packets from a scheduled task, `BURST` per
/// invocation, until `LIMIT` packets have been emitted (`-1` for
/// unbounded). With `STOP true` the router is asked to stop once the
/// limit is reached. `DATA` supplies a payload template; otherwise
/// packets are `LENGTH` zero bytes.
pub struct InfiniteSource {
    data: Vec<u8>,
    burst: usize,
    stop: bool,
    limit: AtomicI64,
    active: AtomicBool,
    count: AtomicU64,
    task: Mutex<Option<Task>>,
}

impl Default for InfiniteSource {
    fn default() -> Self {
        InfiniteSource {
            data: vec![0; DEFAULT_LENGTH],
            burst: DEFAULT_BURST,
            stop: false,
            limit: AtomicI64::new(-1),
            active: AtomicBool::new(true),
            count: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }
}

impl InfiniteSource {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn limit_reached(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        limit >= 0 && self.count() >= limit as u64
    }

    fn make_packet(&self) -> Packet {
        let mut packet = Packet::new(&self.data);
        let usec = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        packet.anno_mut().set_timestamp_usec(usec);
        packet
    }
}

impl Element for InfiniteSource {
    fn class_name(&self) -> &'static str {
        "InfiniteSource"
    }

    fn port_count(&self) -> PortCount {
        PortCount::source(1)
    }

    fn processing(&self) -> Processing {
        Processing::Push
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(0, &["DATA", "LENGTH", "LIMIT", "BURST", "ACTIVE", "STOP"])?;
        let length = args.get_usize("LENGTH", DEFAULT_LENGTH)?;
        self.data = match args.keyword("DATA") {
            Some(_) => args.get_string("DATA", "").into_bytes(),
            None => vec![0; length],
        };
        self.limit
            .store(args.get_i64("LIMIT", -1)?, Ordering::Relaxed);
        self.burst = args.get_usize("BURST", DEFAULT_BURST)?.max(1);
        self.active
            .store(args.get_bool("ACTIVE", true)?, Ordering::Relaxed);
        self.stop = args.get_bool("STOP", false)?;
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        *self.task.lock() = Some(ctx.add_task());
        Ok(())
    }

    fn run_task(&self, ports: &Ports<'_>) -> bool {
        if !self.active.load(Ordering::Relaxed) {
            return false;
        }
        let mut sent = 0;
        while sent < self.burst && !self.limit_reached() {
            self.count.fetch_add(1, Ordering::Relaxed);
            ports.push(0, self.make_packet());
            sent += 1;
        }
        if sent == 0 {
            if self.stop {
                ports.router().please_stop();
            }
            return false;
        }
        true
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("count", |s: &InfiniteSource| s.count().to_string());
        handlers.read("active", |s: &InfiniteSource| {
            s.active.load(Ordering::Relaxed).to_string()
        });
        handlers.write("active", |s: &InfiniteSource, value| {
            let active = parse_bool(value.trim())
                .ok_or_else(|| HandlerError::message("expected a boolean"))?;
            s.active.store(active, Ordering::Relaxed);
            if active {
                if let Some(task) = s.task.lock().as_ref() {
                    task.reschedule();
                }
            }
            Ok(())
        });
        handlers.write("limit", |s: &InfiniteSource, value| {
            let limit: i64 = value
                .trim()
                .parse()
                .map_err(|_| HandlerError::message("expected an integer"))?;
            s.limit.store(limit, Ordering::Relaxed);
            if let Some(task) = s.task.lock().as_ref() {
                task.reschedule();
            }
            Ok(())
        });
        handlers.write("reset", |s: &InfiniteSource, _| {
            s.count.store(0, Ordering::Relaxed);
            if let Some(task) = s.task.lock().as_ref() {
                task.reschedule();
            }
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
