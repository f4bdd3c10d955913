//! Queue: the push-to-pull boundary.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::args::Args;
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError, Ports};
use crate::schedule::NotifierSignal;

const DEFAULT_CAPACITY: usize = 1000;

/// Bounded FIFO: packets pushed on the input wait until downstream
/// pulls them. Overflow drops at the tail and counts the drop; the
/// non-empty state is exported as a [`NotifierSignal`] so pullers can
/// park while the queue is dry.
pub struct Queue {
    ring: Mutex<VecDeque<Packet>>,
    capacity: AtomicUsize,
    drops: AtomicU64,
    highwater: AtomicUsize,
    signal: NotifierSignal,
}

impl Default for Queue {
    fn default() -> Self {
        Queue {
            ring: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(DEFAULT_CAPACITY),
            drops: AtomicU64::new(0),
            highwater: AtomicUsize::new(0),
            signal: NotifierSignal::new(false),
        }
    }
}

impl Queue {
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn enqueue(&self, packet: Packet) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity() {
            drop(ring);
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        ring.push_back(packet);
        let len = ring.len();
        drop(ring);
        self.highwater.fetch_max(len, Ordering::Relaxed);
        self.signal.set_active(true);
    }

    fn dequeue(&self) -> Option<Packet> {
        let mut ring = self.ring.lock();
        let packet = ring.pop_front();
        let now_empty = ring.is_empty();
        drop(ring);
        if now_empty {
            self.signal.set_active(false);
        }
        packet
    }
}

impl Element for Queue {
    fn class_name(&self) -> &'static str {
        "Queue"
    }

    fn port_count(&self) -> PortCount {
        PortCount::exact(1, 1)
    }

    fn processing(&self) -> Processing {
        // push in, pull out
        Processing::Spec("h/l")
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(1, &["CAPACITY"])?;
        let mut capacity = args.get_usize("CAPACITY", DEFAULT_CAPACITY)?;
        if let Some(first) = args.positional().first() {
            capacity = first
                .parse()
                .map_err(|_| ElementError::configure(format!("bad capacity '{}'", first)))?;
        }
        if capacity == 0 {
            return Err(ElementError::configure("capacity must be at least 1"));
        }
        self.capacity.store(capacity, Ordering::Relaxed);
        Ok(())
    }

    fn push(&self, _port: usize, packet: Packet, _ports: &Ports<'_>) {
        self.enqueue(packet);
    }

    fn pull(&self, _port: usize, _ports: &Ports<'_>) -> Option<Packet> {
        self.dequeue()
    }

    fn notifier_signal(&self) -> Option<NotifierSignal> {
        Some(self.signal.clone())
    }

    /// Hot-swap: drain the predecessor queue in order so in-flight
    /// packets survive the swap.
    fn take_state(&self, predecessor: &dyn Element) {
        if let Some(old) = predecessor.as_any().downcast_ref::<Queue>() {
            while let Some(packet) = old.dequeue() {
                self.enqueue(packet);
            }
        }
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("length", |q: &Queue| q.len().to_string());
        handlers.read("highwater_length", |q: &Queue| {
            q.highwater.load(Ordering::Relaxed).to_string()
        });
        handlers.read("capacity", |q: &Queue| q.capacity().to_string());
        handlers.read("drops", |q: &Queue| q.drops().to_string());
        handlers.write("reset", |q: &Queue, _| {
            q.ring.lock().clear();
            q.signal.set_active(false);
            q.drops.store(0, Ordering::Relaxed);
            q.highwater.store(0, Ordering::Relaxed);
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
