//! The two driver styles a socket can be attached to: a readiness-based
//! [`reactor`] or a completion-based [`proactor`]. Sockets are generic
//! over neither; they hold a `Box<dyn Driver>`-style handle appropriate
//! to their transport, per §4.F/§4.G.

pub mod mpsc_queue;
pub mod proactor;
pub mod reactor;
pub mod waker;

pub use proactor::{OpKind, Proactor};
pub use reactor::{Backend, Reactor};
pub use waker::Waker;
