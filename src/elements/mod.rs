//! The standard element library.
//!
//! Small, reusable packet functions wired together by configurations:
//! sources, counters, queues, pull-to-push pumps, a link emulator, a
//! duplicator, sinks, and the control socket. The engine itself never
//! interprets packet contents; these elements do the packet work.

mod control_socket;
mod counter;
mod discard;
mod idle;
mod infinite_source;
mod link_unqueue;
mod queue;
mod tee;
mod timed_source;
mod unqueue;

pub use control_socket::ControlSocket;
pub use counter::Counter;
pub use discard::Discard;
pub use idle::Idle;
pub use infinite_source::InfiniteSource;
pub use link_unqueue::LinkUnqueue;
pub use queue::Queue;
pub use tee::Tee;
pub use timed_source::TimedSource;
pub use unqueue::Unqueue;

use crate::element::ElementRegistry;

/// Registry with every standard class installed. The driver starts
/// from this; tests may extend it with their own classes.
pub fn default_registry() -> ElementRegistry {
    let mut registry = ElementRegistry::new();
    registry.register("ControlSocket", || Box::new(ControlSocket::default()));
    registry.register("Counter", || Box::new(Counter::default()));
    registry.register("Discard", || Box::new(Discard::default()));
    registry.register("Idle", || Box::new(Idle::default()));
    registry.register("InfiniteSource", || Box::new(InfiniteSource::default()));
    registry.register("LinkUnqueue", || Box::new(LinkUnqueue::default()));
    registry.register("Queue", || Box::new(Queue::default()));
    registry.register("Tee", || Box::new(Tee::default()));
    registry.register("TimedSource", || Box::new(TimedSource::default()));
    registry.register("Unqueue", || Box::new(Unqueue::default()));
    registry
}
