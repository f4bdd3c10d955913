//! Element base contract
//!
//! An element is one node of the packet graph: a narrow, reusable
//! packet function with typed input/output ports. The engine owns
//! elements through [`Element`] trait objects; concrete classes are
//! constructed by name through an [`ElementRegistry`].
//!
//! Packet entry points take `&self`: an element's mutable state lives
//! behind its own synchronization, and its packet callbacks run only
//! on its home thread. Configuration and lifecycle hooks run before
//! the graph is live and take `&mut self`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::args::{ArgError, Args};
use crate::packet::Packet;
use crate::router::{HandlerBuilder, InitContext, Ports};
use crate::schedule::NotifierSignal;

/// Stable handle to an element inside its router.
pub type ElementIndex = usize;

#[derive(Debug, Error)]
pub enum ElementError {
    #[error(transparent)]
    Args(#[from] ArgError),

    #[error("{0}")]
    Configure(String),

    #[error("{0}")]
    Initialize(String),
}

impl ElementError {
    pub fn configure(msg: impl Into<String>) -> Self {
        ElementError::Configure(msg.into())
    }

    pub fn initialize(msg: impl Into<String>) -> Self {
        ElementError::Initialize(msg.into())
    }
}

/// Direction of one resolved port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Push,
    Pull,
    Agnostic,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Push => write!(f, "push"),
            PortKind::Pull => write!(f, "pull"),
            PortKind::Agnostic => write!(f, "agnostic"),
        }
    }
}

/// Per-class port direction constraints.
///
/// `Spec` uses a compact code: input constraints, `/`, output
/// constraints, one letter per port (`h` push, `l` pull, `a`
/// agnostic), the last letter repeating for any further ports. So a
/// queue is `"h/l"` and a pull-to-push pump is `"l/h"`.
#[derive(Debug, Clone, Copy)]
pub enum Processing {
    Push,
    Pull,
    Agnostic,
    Spec(&'static str),
}

impl Processing {
    pub fn input_kind(&self, port: usize) -> PortKind {
        match self {
            Processing::Push => PortKind::Push,
            Processing::Pull => PortKind::Pull,
            Processing::Agnostic => PortKind::Agnostic,
            Processing::Spec(code) => Self::spec_kind(code, false, port),
        }
    }

    pub fn output_kind(&self, port: usize) -> PortKind {
        match self {
            Processing::Push => PortKind::Push,
            Processing::Pull => PortKind::Pull,
            Processing::Agnostic => PortKind::Agnostic,
            Processing::Spec(code) => Self::spec_kind(code, true, port),
        }
    }

    fn spec_kind(code: &str, output: bool, port: usize) -> PortKind {
        let (inputs, outputs) = match code.split_once('/') {
            Some(pair) => pair,
            None => (code, code),
        };
        let side = if output { outputs } else { inputs };
        let ch = side
            .chars()
            .nth(port)
            .or_else(|| side.chars().last())
            .unwrap_or('a');
        match ch {
            'h' => PortKind::Push,
            'l' => PortKind::Pull,
            _ => PortKind::Agnostic,
        }
    }
}

/// Input/output port count ranges a class accepts.
#[derive(Debug, Clone, Copy)]
pub struct PortCount {
    pub imin: usize,
    pub imax: usize,
    pub omin: usize,
    pub omax: usize,
}

impl PortCount {
    pub fn new(imin: usize, imax: usize, omin: usize, omax: usize) -> Self {
        PortCount {
            imin,
            imax,
            omin,
            omax,
        }
    }

    pub fn exact(inputs: usize, outputs: usize) -> Self {
        Self::new(inputs, inputs, outputs, outputs)
    }

    pub fn source(outputs: usize) -> Self {
        Self::new(0, 0, outputs, outputs)
    }

    pub fn sink(inputs: usize) -> Self {
        Self::new(inputs, inputs, 0, 0)
    }
}

/// How far initialization got before teardown, so `cleanup` can undo
/// exactly what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// `configure` ran (possibly unsuccessfully); `initialize` did not.
    Configured,
    /// `initialize` ran and failed.
    InitializeFailed,
    /// `initialize` succeeded; the element may have gone live.
    Initialized,
}

/// The element contract. Defaults make a pass-through agnostic
/// element; concrete classes override the subset they need.
#[allow(unused_variables)]
pub trait Element: Send + Sync {
    /// Stable class name, as written in configurations.
    fn class_name(&self) -> &'static str;

    fn port_count(&self) -> PortCount {
        PortCount::exact(1, 1)
    }

    fn processing(&self) -> Processing {
        Processing::Agnostic
    }

    /// Whether ports may be left unconnected in a configuration.
    fn allow_unconnected(&self) -> bool {
        false
    }

    /// Parse the configuration string. Runs once, before the graph is
    /// linked; errors are collected and fail the load.
    fn configure(&mut self, args: &Args) -> Result<(), ElementError> {
        Ok(())
    }

    /// Late setup: resolve peers, register tasks and timers. Runs in
    /// dependency order after every port is resolved.
    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> Result<(), ElementError> {
        Ok(())
    }

    fn cleanup(&mut self, stage: CleanupStage) {}

    /// Push entry point: a packet arrives on `port`, ownership
    /// transfers in. The default adapts [`Element::simple_action`],
    /// forwarding on the same-numbered output.
    fn push(&self, port: usize, packet: Packet, ports: &Ports<'_>) {
        if let Some(p) = self.simple_action(packet) {
            ports.push(port, p);
        }
    }

    /// Pull entry point: downstream requests a packet from output
    /// `port`; a returned packet transfers out. The default adapts
    /// [`Element::simple_action`] over the same-numbered input.
    fn pull(&self, port: usize, ports: &Ports<'_>) -> Option<Packet> {
        let p = ports.pull(port)?;
        self.simple_action(p)
    }

    /// One-packet transform for agnostic elements. Returning `None`
    /// drops the packet.
    fn simple_action(&self, packet: Packet) -> Option<Packet> {
        Some(packet)
    }

    /// Body of a task registered in `initialize`. Returns whether any
    /// work was done; an idle return parks the task until something
    /// reschedules it.
    fn run_task(&self, ports: &Ports<'_>) -> bool {
        false
    }

    /// Body of a timer registered in `initialize`.
    fn run_timer(&self, ports: &Ports<'_>) {}

    /// Publish named read/write handlers.
    fn add_handlers(&self, handlers: &mut HandlerBuilder<'_>) {}

    /// During hot-swap activation, adopt state from the same-named
    /// element of the outgoing router.
    fn take_state(&self, predecessor: &dyn Element) {}

    /// Level-triggered availability signal exported to downstream
    /// pullers, if this element has one (queues do).
    fn notifier_signal(&self) -> Option<NotifierSignal> {
        None
    }

    /// Downcast support for handlers and `take_state`.
    fn as_any(&self) -> &dyn Any;
}

type Factory = Arc<dyn Fn() -> Box<dyn Element> + Send + Sync>;

/// Maps class names to constructors. The driver installs the standard
/// library; tests may register their own classes.
#[derive(Clone, Default)]
pub struct ElementRegistry {
    factories: HashMap<String, Factory>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, class: &str, factory: F)
    where
        F: Fn() -> Box<dyn Element> + Send + Sync + 'static,
    {
        self.factories.insert(class.to_string(), Arc::new(factory));
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn class_names(&self) -> std::collections::HashSet<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn make(&self, class: &str) -> Option<Box<dyn Element>> {
        let factory = self.factories.get(class)?;
        Some(factory())
    }
}

impl fmt::Debug for ElementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ElementRegistry")
            .field("classes", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_spec_codes() {
        let queue = Processing::Spec("h/l");
        assert_eq!(queue.input_kind(0), PortKind::Push);
        assert_eq!(queue.output_kind(0), PortKind::Pull);

        // last letter repeats for extra ports
        let fan = Processing::Spec("h/hh");
        assert_eq!(fan.output_kind(5), PortKind::Push);

        let pump = Processing::Spec("l/h");
        assert_eq!(pump.input_kind(0), PortKind::Pull);
        assert_eq!(pump.output_kind(0), PortKind::Push);
    }

    #[test]
    fn test_processing_wholesale() {
        assert_eq!(Processing::Push.input_kind(3), PortKind::Push);
        assert_eq!(Processing::Agnostic.output_kind(0), PortKind::Agnostic);
    }

    #[test]
    fn test_port_count_constructors() {
        let pc = PortCount::source(1);
        assert_eq!((pc.imin, pc.imax, pc.omin, pc.omax), (0, 0, 1, 1));
        let pc = PortCount::new(1, 2, 0, 8);
        assert_eq!(pc.omax, 8);
    }
}
