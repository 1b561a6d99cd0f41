//! User-facing events.
//!
//! The original design expressed these as a deep class hierarchy (one type
//! per event category). Per the redesign flag in §9 of the spec, that
//! collapses here into one tagged variant, `Event { kind, context }`, with
//! callers matching on `kind`.

use std::time::Instant;

use crate::token::Token;

/// The kind of a user-facing event, as enumerated in §3.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Readable,
    Writable,
    Error,
    Accept,
    Connect,
    Send,
    Receive,
    Shutdown,
    ReadQueueHighWatermark,
    ReadQueueLowWatermark,
    ReadQueueDiscarded,
    WriteQueueHighWatermark,
    WriteQueueLowWatermark,
    WriteQueueDiscarded,
    FlowControlApplied,
    FlowControlRelaxed,
    RateLimitApplied,
    RateLimitRelaxed,
    ConnectionLimit,
    DowngradeInitiated,
    DowngradeComplete,
    UpgradeInitiated,
    UpgradeComplete,
}

/// Timing and depth metadata attached to an [`Event`].
#[derive(Copy, Clone, Debug)]
pub struct EventContext {
    /// When the condition that produced this event was first observed.
    pub observed_at: Instant,
    /// Queue depth at the time of the event, when applicable (byte count
    /// for read/write queues, pending count for the accept queue).
    pub queue_depth: usize,
}

impl EventContext {
    pub fn new(queue_depth: usize) -> EventContext {
        EventContext {
            observed_at: Instant::now(),
            queue_depth,
        }
    }
}

/// A single user-facing event, as announced through a socket's callbacks.
#[derive(Copy, Clone, Debug)]
pub struct Event {
    kind: EventKind,
    token: Token,
    context: EventContext,
}

impl Event {
    pub fn new(kind: EventKind, token: Token, context: EventContext) -> Event {
        Event { kind, token, context }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn context(&self) -> &EventContext {
        &self.context
    }
}

/// A readiness signal reported by a reactor [`Backend`](crate::driver::reactor::Backend)
/// poll round. Kept distinct from [`Event`]: readiness is a driver-internal
/// concept consumed by a socket's handler, which then re-derives the
/// user-facing [`Event`]s (if any) that readiness implies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Readiness {
    bits: u8,
}

const READABLE: u8 = 0b001;
const WRITABLE: u8 = 0b010;
const ERROR: u8 = 0b100;

impl Readiness {
    pub fn empty() -> Readiness {
        Readiness { bits: 0 }
    }

    pub fn readable() -> Readiness {
        Readiness { bits: READABLE }
    }

    pub fn writable() -> Readiness {
        Readiness { bits: WRITABLE }
    }

    pub fn error() -> Readiness {
        Readiness { bits: ERROR }
    }

    pub fn is_readable(&self) -> bool {
        self.bits & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & WRITABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.bits & ERROR != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn insert(&mut self, other: Readiness) {
        self.bits |= other.bits;
    }
}

impl std::ops::BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, other: Readiness) -> Readiness {
        Readiness { bits: self.bits | other.bits }
    }
}
