//! Component G: the proactor driver, completion-based dispatch.
//!
//! No reactor counterpart in this crate to generalize from; grounded on
//! `compio-driver`'s completion-queue submission model and on the
//! per-operation-kind single in-flight slot used to keep completion
//! ordering well-defined without a full io_uring SQE/CQE pair on hand
//! (concrete proactor backends, io_uring and IOCP among them, are out of
//! scope; only the interface and the in-flight bookkeeping live here).

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use crate::registry::Descriptor;
use crate::token::Token;

/// The kind of an asynchronous operation a socket may have in flight.
/// A socket has at most one outstanding operation per kind at a time
/// (§4.G); starting a second of the same kind before the first completes
/// is a programmer error the caller must serialize against (typically via
/// the socket's strand).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Send,
    Receive,
    Accept,
    Connect,
}

/// A finished asynchronous operation, carrying the monotonic sequence
/// number it completed at so callers can detect and discard stale
/// completions (e.g. a cancelled-then-retried operation whose original
/// completion lands after the retry already finished).
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub kind: OpKind,
    pub sequence: u64,
    pub result: io::Result<usize>,
}

struct InFlight {
    sequence: u64,
}

/// Tracks in-flight operations and assigns completion sequence numbers.
/// A concrete proactor backend calls [`submit`](Self::submit) when
/// launching an operation and [`complete`](Self::complete) when the
/// kernel reports it done; [`Proactor`] itself performs no I/O.
pub struct Proactor {
    in_flight: Mutex<HashMap<(Token, OpKind), InFlight>>,
    next_sequence: std::sync::atomic::AtomicU64,
}

impl Proactor {
    pub fn new() -> Proactor {
        Proactor {
            in_flight: Mutex::new(HashMap::new()),
            next_sequence: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Record that `token` now has a `kind` operation in flight, returning
    /// the sequence number assigned to it. Panics if one is already in
    /// flight for the same `(token, kind)`; callers must serialize per
    /// socket per op-kind before calling this.
    pub fn submit(&self, token: Token, kind: OpKind) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut in_flight = self.in_flight.lock().unwrap();
        let prior = in_flight.insert((token, kind), InFlight { sequence });
        assert!(prior.is_none(), "operation of kind {kind:?} already in flight for {token:?}");
        sequence
    }

    /// Report a completion. Returns `None` if `sequence` does not match
    /// the currently in-flight operation for `(token, kind)`: a stale
    /// completion from a cancelled operation, to be silently discarded by
    /// the caller.
    pub fn complete(&self, token: Token, kind: OpKind, sequence: u64, result: io::Result<usize>) -> Option<Completion> {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.get(&(token, kind)) {
            Some(entry) if entry.sequence == sequence => {
                in_flight.remove(&(token, kind));
                Some(Completion { token, kind, sequence, result })
            }
            _ => None,
        }
    }

    /// Cancel the in-flight operation for `(token, kind)`, if any, so a
    /// late completion with the old sequence is recognized as stale.
    pub fn cancel(&self, token: Token, kind: OpKind) {
        self.in_flight.lock().unwrap().remove(&(token, kind));
    }

    pub fn is_in_flight(&self, token: Token, kind: OpKind) -> bool {
        self.in_flight.lock().unwrap().contains_key(&(token, kind))
    }
}

impl Default for Proactor {
    fn default() -> Proactor {
        Proactor::new()
    }
}

/// A completion-queue-backed attachment, mirroring [`crate::registry::Descriptor`]
/// but for proactor-style backends where the descriptor itself carries no
/// readiness semantics (only completions arrive).
pub fn descriptor_key(descriptor: Descriptor) -> usize {
    descriptor.0
}
