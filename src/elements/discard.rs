//! Discard: drop everything.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError, InitContext, Ports};
use crate::schedule::{NotifierSignal, Task};

/// Absorbs packets. Agnostic: on a push input it swallows what
/// arrives; when its input resolves pull it registers a task that
/// drains upstream, parking on the upstream-empty signal.
#[derive(Default)]
pub struct Discard {
    count: AtomicU64,
    task: Mutex<Option<Task>>,
    signal: Mutex<Option<NotifierSignal>>,
}

const PULL_BURST: usize = 8;

impl Discard {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Element for Discard {
    fn class_name(&self) -> &'static str {
        "Discard"
    }

    fn port_count(&self) -> PortCount {
        PortCount::sink(1)
    }

    fn processing(&self) -> Processing {
        Processing::Agnostic
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        let pull_input = ctx
            .router()
            .input_link(ctx.element_index(), 0)
            .map(|l| l.kind == crate::element::PortKind::Pull)
            .unwrap_or(false);
        if pull_input {
            let task = ctx.add_task();
            let signal = ctx.upstream_signal(0);
            signal.add_listener(task.clone());
            *self.task.lock() = Some(task);
            *self.signal.lock() = Some(signal);
        }
        Ok(())
    }

    fn push(&self, _port: usize, _packet: Packet, _ports: &Ports<'_>) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn run_task(&self, ports: &Ports<'_>) -> bool {
        let mut worked = false;
        for _ in 0..PULL_BURST {
            match ports.pull(0) {
                Some(_) => {
                    self.count.fetch_add(1, Ordering::Relaxed);
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
            .unwrap_or(false);
        worked || upstream_live
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("count", |d: &Discard| d.count().to_string());
        handlers.write("reset_counts", |d: &Discard, _| {
            d.count.store(0, Ordering::Relaxed);
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
