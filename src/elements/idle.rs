//! Idle: the inert stub.

use std::any::Any;

use crate::element::{Element, PortCount, Processing};
use crate::packet::Packet;
use crate::router::Ports;
use crate::schedule::NotifierSignal;

/// Accepts any number of connections on any port, discards pushed
/// packets, never yields to pulls, and exports a never-active signal
/// so downstream pullers park instead of spinning.
pub struct Idle {
    dead: NotifierSignal,
}

impl Default for Idle {
    fn default() -> Self {
        Idle {
            dead: NotifierSignal::new(false),
        }
    }
}

impl Element for Idle {
    fn class_name(&self) -> &'static str {
        "Idle"
    }

    fn port_count(&self) -> PortCount {
        PortCount::new(0, usize::MAX, 0, usize::MAX)
    }

    fn processing(&self) -> Processing {
        Processing::Agnostic
    }

    fn allow_unconnected(&self) -> bool {
        true
    }

    fn push(&self, _port: usize, _packet: Packet, _ports: &Ports<'_>) {}

    fn pull(&self, _port: usize, _ports: &Ports<'_>) -> Option<Packet> {
        None
    }

    fn notifier_signal(&self) -> Option<NotifierSignal> {
        Some(self.dead.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
