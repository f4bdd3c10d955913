//! TimedSource: timer-driven packet generator.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::args::{parse_bool, parse_duration, Args};
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError, InitContext, Ports};
use crate::schedule::Timer;

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Pushes one packet per `INTERVAL` from a timer. `LIMIT` bounds the
/// emission count (`-1` unbounded); `STOP true` stops the router at
/// the limit.
pub struct TimedSource {
    data: Vec<u8>,
    stop: bool,
    interval: Mutex<Duration>,
    limit: AtomicI64,
    active: AtomicBool,
    count: AtomicU64,
    timer: Mutex<Option<Timer>>,
}

impl Default for TimedSource {
    fn default() -> Self {
        TimedSource {
            data: vec![0; 64],
            stop: false,
            interval: Mutex::new(DEFAULT_INTERVAL),
            limit: AtomicI64::new(-1),
            active: AtomicBool::new(true),
            count: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }
}

impl TimedSource {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn limit_reached(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        limit >= 0 && self.count() >= limit as u64
    }
}

impl Element for TimedSource {
    fn class_name(&self) -> &'static str {
        "TimedSource"
    }

    fn port_count(&self) -> PortCount {
        PortCount::source(1)
    }

    fn processing(&self) -> Processing {
        Processing::Push
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(1, &["INTERVAL", "DATA", "LENGTH", "LIMIT", "ACTIVE", "STOP"])?;
        let mut interval = args.get_duration("INTERVAL", DEFAULT_INTERVAL)?;
        if let Some(first) = args.positional().first() {
            interval = parse_duration(first)
                .ok_or_else(|| ElementError::configure(format!("bad interval '{}'", first)))?;
        }
        if interval.is_zero() {
            return Err(ElementError::configure("INTERVAL must be positive"));
        }
        *self.interval.lock() = interval;
        let length = args.get_usize("LENGTH", 64)?;
        self.data = match args.keyword("DATA") {
            Some(_) => args.get_string("DATA", "").into_bytes(),
            None => vec![0; length],
        };
        self.limit
            .store(args.get_i64("LIMIT", -1)?, Ordering::Relaxed);
        self.active
            .store(args.get_bool("ACTIVE", true)?, Ordering::Relaxed);
        self.stop = args.get_bool("STOP", false)?;
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        let timer = ctx.add_timer();
        timer.schedule_after(*self.interval.lock());
        *self.timer.lock() = Some(timer);
        Ok(())
    }

    fn run_timer(&self, ports: &Ports<'_>) {
        if self.active.load(Ordering::Relaxed) && !self.limit_reached() {
            self.count.fetch_add(1, Ordering::Relaxed);
            ports.push(0, Packet::new(&self.data));
        }
        if self.limit_reached() {
            if self.stop {
                ports.router().please_stop();
            }
            return;
        }
        if let Some(timer) = self.timer.lock().as_ref() {
            timer.schedule_after(*self.interval.lock());
        }
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("count", |s: &TimedSource| s.count().to_string());
        handlers.read("interval", |s: &TimedSource| {
            format!("{}ms", s.interval.lock().as_millis())
        });
        handlers.write("interval", |s: &TimedSource, value| {
            let interval = parse_duration(value.trim())
                .filter(|d| !d.is_zero())
                .ok_or_else(|| HandlerError::message("expected a positive duration"))?;
            *s.interval.lock() = interval;
            Ok(())
        });
        handlers.write("active", |s: &TimedSource, value| {
            let active = parse_bool(value.trim())
                .ok_or_else(|| HandlerError::message("expected a boolean"))?;
            s.active.store(active, Ordering::Relaxed);
            if active {
                if let Some(timer) = s.timer.lock().as_ref() {
                    if !timer.scheduled() {
                        timer.schedule_after(*s.interval.lock());
                    }
                }
            }
            Ok(())
        });
        handlers.write("reset", |s: &TimedSource, _| {
            s.count.store(0, Ordering::Relaxed);
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
