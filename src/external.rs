//! §6 external interfaces: the three seams the core consumes but never
//! implements. A concrete binary wires in a real DNS resolver, token-bucket
//! limiter, and buffer pool; the core only ever calls through these traits.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Resolves names to endpoints and back. The core uses only these two
/// entry points; the resolution strategy (system resolver, DoH, a static
/// table) is entirely up to the implementation.
pub trait Resolver: Send + Sync {
    fn resolve_endpoint(
        &self,
        name: &str,
        callback: Box<dyn FnOnce(Result<Vec<SocketAddr>>) + Send>,
    );

    fn resolve_name(
        &self,
        endpoint: SocketAddr,
        callback: Box<dyn FnOnce(Result<String>) + Send>,
    );
}

/// A token-bucket-shaped rate limiter consumed by [`crate::socket::listener::ListenerSocket`]'s
/// accept throttle.
pub trait RateLimiter: Send + Sync {
    /// Would submitting now exceed the configured bandwidth?
    fn would_exceed_bandwidth(&self, now: Instant) -> bool;

    /// How long to wait before the next unit may be submitted.
    fn calculate_time_to_submit(&self, now: Instant) -> Duration;

    /// Record that `units` were consumed.
    fn submit(&self, units: u64);
}

/// Supplies buffers for incoming or outgoing data, so a socket never
/// allocates directly. Two instances are held per socket: one for reads,
/// one for writes.
pub trait BufferFactory: Send + Sync {
    fn allocate(&self, hint: usize) -> Vec<u8>;
}

/// A [`BufferFactory`] that always allocates a fresh, zeroed `Vec`. The
/// default when no pooling factory is supplied.
pub struct HeapBufferFactory;

impl BufferFactory for HeapBufferFactory {
    fn allocate(&self, hint: usize) -> Vec<u8> {
        vec![0u8; hint]
    }
}
