//! LinkUnqueue: serial-link emulator.

use std::any::Any;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::args::Args;
use crate::element::{Element, ElementError, PortCount, Processing};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, HandlerError, InitContext, Ports};
use crate::schedule::{NotifierSignal, Task, Timer};

/// Emulates a serial link with `LATENCY` and `BANDWIDTH`: every packet
/// is delayed by the latency plus its serialization time at the
/// configured bandwidth, behind whatever is already on the wire. The
/// packet's extra-length annotation counts toward its wire size.
/// Pulls from upstream only while the wire has room; pushes packets
/// out when their departure time comes. Pair with an upstream `Queue`
/// to emulate a queued link.
pub struct LinkUnqueue {
    latency: Duration,
    /// bits per second
    bandwidth: u64,
    state: Mutex<LinkState>,
    task: Mutex<Option<Task>>,
    timer: Mutex<Option<Timer>>,
    signal: Mutex<Option<NotifierSignal>>,
}

#[derive(Default)]
struct LinkState {
    /// packets in transit, keyed by departure instant, arrival order
    flight: VecDeque<(Instant, Packet)>,
    /// when the wire finishes its current transmission
    wire_free: Option<Instant>,
}

impl Default for LinkUnqueue {
    fn default() -> Self {
        LinkUnqueue {
            latency: Duration::ZERO,
            bandwidth: 1_000_000,
            state: Mutex::new(LinkState::default()),
            task: Mutex::new(None),
            timer: Mutex::new(None),
            signal: Mutex::new(None),
        }
    }
}

impl LinkUnqueue {
    pub fn size(&self) -> usize {
        self.state.lock().flight.len()
    }

    fn serialization_time(&self, packet: &Packet) -> Duration {
        let bits = (packet.len() as u64 + u64::from(packet.anno().extra_length())) * 8;
        Duration::from_secs_f64(bits as f64 / self.bandwidth as f64)
    }
}

impl Element for LinkUnqueue {
    fn class_name(&self) -> &'static str {
        "LinkUnqueue"
    }

    fn port_count(&self) -> PortCount {
        PortCount::exact(1, 1)
    }

    fn processing(&self) -> Processing {
        Processing::Spec("l/h")
    }

    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        args.check(0, &["LATENCY", "BANDWIDTH"])?;
        self.latency = args.get_duration("LATENCY", Duration::ZERO)?;
        self.bandwidth = args.get_bandwidth("BANDWIDTH", 1_000_000)?;
        if self.bandwidth == 0 {
            return Err(ElementError::configure("BANDWIDTH must be positive"));
        }
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        let task = ctx.add_task();
        let signal = ctx.upstream_signal(0);
        signal.add_listener(task.clone());
        *self.task.lock() = Some(task);
        *self.timer.lock() = Some(ctx.add_timer());
        *self.signal.lock() = Some(signal);
        Ok(())
    }

    fn run_task(&self, ports: &Ports<'_>) -> bool {
        let now = Instant::now();
        let mut due: Vec<Packet> = Vec::new();
        let mut worked = false;

        {
            let mut st = self.state.lock();
            while let Some((depart, _)) = st.flight.front() {
                if *depart > now {
                    break;
                }
                let (_, packet) = st.flight.pop_front().expect("peeked flight entry");
                due.push(packet);
            }

            // refill the wire while it is free and upstream has work
            let signal_active = self
                .signal
                .lock()
                .as_ref()
                .map(|s| s.active())
                .unwrap_or(true);
            if signal_active {
                loop {
                    let start = st.wire_free.map_or(now, |t| t.max(now));
                    if start > now {
                        break; // wire busy; the timer drives the next step
                    }
                    let Some(packet) = ports.pull(0) else {
                        break;
                    };
                    let end = start + self.serialization_time(&packet);
                    let depart = end + self.latency;
                    st.wire_free = Some(end);
                    st.flight.push_back((depart, packet));
                    worked = true;
                }
            }

            // wake when the next event is due: a departure, or the
            // wire freeing up for another pull
            let next_depart = st.flight.front().map(|(t, _)| *t);
            let next_free = st.wire_free.filter(|t| *t > now);
            let wake = match (next_depart, next_free) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if let Some(wake) = wake {
                if let Some(timer) = self.timer.lock().as_ref() {
                    timer.schedule_at(wake);
                }
            }
        }

        worked |= !due.is_empty();
        for packet in due {
            ports.push(0, packet);
        }
        worked
    }

    fn run_timer(&self, _ports: &Ports<'_>) {
        if let Some(task) = self.task.lock().as_ref() {
            task.reschedule();
        }
    }

    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {
        handlers.read("latency", |l: &LinkUnqueue| {
            format!("{}ms", l.latency.as_millis())
        });
        handlers.read("bandwidth", |l: &LinkUnqueue| {
            format!("{}kbps", l.bandwidth / 1000)
        });
        handlers.read("size", |l: &LinkUnqueue| l.size().to_string());
        handlers.write("reset", |l: &LinkUnqueue, _| {
            let mut st = l.state.lock();
            st.flight.clear();
            st.wire_free = None;
            Ok::<_, HandlerError>(())
        });
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_time_uses_extra_length() {
        let mut link = LinkUnqueue::default();
        link.configure(&Args::parse("LATENCY 10ms, BANDWIDTH 1000kbps").unwrap())
            .unwrap();

        // 1000 bytes at 1 Mbit/s is 8 ms on the wire
        let packet = Packet::zeroed(1000);
        assert_eq!(link.serialization_time(&packet), Duration::from_millis(8));

        // virtual padding counts toward wire time
        let mut padded = Packet::zeroed(500);
        padded.anno_mut().set_extra_length(500);
        assert_eq!(link.serialization_time(&padded), Duration::from_millis(8));
    }

    #[test]
    fn test_bandwidth_zero_rejected() {
        let mut link = LinkUnqueue::default();
        assert!(link
            .configure(&Args::parse("BANDWIDTH 0").unwrap())
            .is_err());
    }
}
