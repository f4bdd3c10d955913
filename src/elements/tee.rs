//! Tee: duplicate a push stream.

use std::any::Any;

use crate::args::Args;
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::Ports;

/// Pushes a copy of each input packet to every output. Copies are
/// cheap shared views; the last output receives the original, so a
/// single-output Tee never clones.
#[derive(Default)]
pub struct Tee {
    configured_outputs: Option<usize>,
}

impl Element for Tee {
    fn class_name(&self) -> &'static str {
        "Tee"
    }

    fn port_count(&self) -> PortCount {
        let min = self.configured_outputs.unwrap_or(1);
        let max = self.configured_outputs.unwrap_or(usize::MAX);
        PortCount::new(1, 1, min, max)
    }

    fn processing(&self) -> Processing {
        Processing::Push
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(1, &[])?;
        if let Some(n) = args.positional().first() {
            let n: usize = n
                .parse()
                .map_err(|_| ElementError::configure(format!("bad output count '{}'", n)))?;
            if n == 0 {
                return Err(ElementError::configure("output count must be at least 1"));
            }
            self.configured_outputs = Some(n);
        }
        Ok(())
    }

    fn push(&self, _port: usize, packet: Packet, ports: &Ports<'_>) {
        let n = ports.noutputs();
        for port in 0..n.saturating_sub(1) {
            ports.push(port, packet.clone());
        }
        if n > 0 {
            ports.push(n - 1, packet);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
