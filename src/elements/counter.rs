//! Counter: count packets and bytes flowing through.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::args::Args;
use crate::element::{Element, ElementError};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError};

/// Passes packets through unchanged, counting packets and payload
/// bytes. `HOTSWAP true` carries the counts across a hot-swap from the
/// same-named predecessor; the default starts from zero.
#[derive(Default)]
pub struct Counter {
    count: AtomicU64,
    byte_count: AtomicU64,
    hotswap: bool,
}

impl Counter {
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.byte_count.store(0, Ordering::Relaxed);
    }
}

impl Element for Counter {
    fn class_name(&self) -> &'static str {
        "Counter"
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(0, &["HOTSWAP"])?;
        self.hotswap = args.get_bool("HOTSWAP", false)?;
        Ok(())
    }

    fn simple_action(&self, packet: Packet) -> Option<Packet> {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        Some(packet)
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("count", |c: &Counter| c.count().to_string());
        handlers.read("byte_count", |c: &Counter| c.byte_count().to_string());
        handlers.write("reset_counts", |c: &Counter, _| {
            c.reset();
            Ok::<_, HandlerError>(())
        });
    }

    fn take_state(&self, predecessor: &dyn Element) {
        if !self.hotswap {
            return;
        }
        if let Some(old) = predecessor.as_any().downcast_ref::<Counter>() {
            self.count.store(old.count(), Ordering::Relaxed);
            self.byte_count.store(old.byte_count(), Ordering::Relaxed);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
