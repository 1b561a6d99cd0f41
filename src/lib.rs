//! A network transport library's event-loop kernel and socket lifecycle
//! engine: a reactor/proactor-agnostic driver, timer wheel, and the
//! datagram/stream/listener state machines built on top of it.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! transcore = "0.1"
//! ```
//!
//! # Example
//!
//! ```text
//! let reactor = Reactor::new(Box::new(my_backend));
//! let token = reactor.attach(descriptor, Box::new(my_handler), Trigger::Edge)?;
//! reactor.run_once(None)?;
//! ```

extern crate libc;
#[macro_use]
extern crate log;

mod sys;

pub mod chronology;
pub mod driver;
pub mod error;
pub mod event;
pub mod external;
pub mod flow;
pub mod options;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod socket;
pub mod strand;
pub mod token;

pub use error::{Result, TransportError};
pub use event::{Event, EventKind};
pub use options::{DriverConfig, SocketOptions, Transport, Trigger};
pub use registry::{Descriptor, Registry};
pub use socket::{DatagramSocket, ListenerSocket, StreamSocket};
pub use token::Token;
