//! weft: a modular packet-processing runtime.
//!
//! A declarative configuration assembles a directed graph of small
//! packet-handling elements; cooperative driver threads move packets
//! through the graph with push/pull transfer resolved statically at
//! load time. Running routers expose named handlers for introspection
//! and control, and can be hot-swapped for a newly parsed
//! configuration without dropping in-flight packets.

pub mod args;
pub mod driver;
pub mod element;
pub mod elements;
pub mod lang;
pub mod logger;
pub mod packet;
pub mod router;
pub mod schedule;

pub use element::{Element, ElementIndex, ElementRegistry, PortKind, Processing};
pub use packet::Packet;
pub use router::{Router, STOP_RUNCOUNT};
pub use schedule::{Master, NotifierSignal, Task, Timer};
