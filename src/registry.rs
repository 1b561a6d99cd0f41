//! Component B: the descriptor → per-socket record index shared by a
//! driver and the sockets attached to it.
//!
//! Grounded on this crate's existing fd-keyed `add`/`modify`/`delete`
//! convention (`epoll::Epoll`) and on the `attach`/`detach` asynchronous
//! protocol of a reactor's registry: `detach` is asynchronous, transitions
//! the entry to `detach-initiated` immediately, and only reaches
//! `detach-complete` (invoking `on_detached`) once the driver confirms no
//! further events will be dispatched for the descriptor.

use std::fmt;
use std::sync::Mutex;

use slab::Slab;

use crate::event::Readiness;
use crate::token::Token;

/// An opaque OS handle identifying an open socket. A thin newtype over the
/// raw fd so the registry never depends on a concrete backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor(pub usize);

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd({})", self.0)
    }
}

/// Detachment lifecycle of a [`RegistryEntry`] (§4.B).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DetachState {
    Idle,
    Initiated,
    Complete,
}

/// A per-socket handler invoked by the driver when readiness or a
/// completion arrives for the socket's descriptor. Boxed as a trait object
/// so the registry stays agnostic to the concrete socket state machine
/// (datagram/stream/listener) above it.
pub trait Handler: Send {
    fn handle_readiness(&mut self, readiness: Readiness);
}

struct Entry {
    descriptor: Descriptor,
    token: Token,
    interest: Readiness,
    handler: Box<dyn Handler>,
    detach_state: DetachState,
    on_detached: Option<Box<dyn FnOnce() + Send>>,
    notifications: bool,
}

/// Error returned by [`Registry::attach`] when the descriptor is already
/// registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("descriptor already registered")]
pub struct AlreadyExists;

/// The shared index mapping [`Descriptor`] to its registration state.
/// Guarded by a single mutex per the §5 "driver holds a separate mutex for
/// the registry" rule; callers must never hold a socket lock while calling
/// into the registry (lock order is always socket-then-driver).
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    entries: Slab<Entry>,
    by_descriptor: std::collections::HashMap<Descriptor, usize>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(RegistryInner {
                entries: Slab::new(),
                by_descriptor: std::collections::HashMap::new(),
            }),
        }
    }

    /// Register `descriptor` with `handler`, zero initial interest. Fails
    /// with [`AlreadyExists`] if the descriptor is already registered.
    pub fn attach(
        &self,
        descriptor: Descriptor,
        handler: Box<dyn Handler>,
    ) -> Result<Token, AlreadyExists> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_descriptor.contains_key(&descriptor) {
            return Err(AlreadyExists);
        }

        let key = inner.entries.insert(Entry {
            descriptor,
            token: Token(0),
            interest: Readiness::empty(),
            handler,
            detach_state: DetachState::Idle,
            on_detached: None,
            notifications: false,
        });
        inner.entries[key].token = Token(key);
        inner.by_descriptor.insert(descriptor, key);

        log::trace!("registry: attached {descriptor} as {:?}", Token(key));
        Ok(Token(key))
    }

    /// Update the interest mask recorded for `token`. Does not touch the
    /// driver's kernel structure; callers (the driver) are responsible
    /// for reflecting this into the backend.
    pub fn set_interest(&self, token: Token, interest: Readiness) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            entry.interest = interest;
        }
    }

    pub fn interest(&self, token: Token) -> Option<Readiness> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(token.0).map(|e| e.interest)
    }

    pub fn set_notifications(&self, token: Token, on: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            entry.notifications = on;
        }
    }

    /// Begin asynchronous detachment. The entry moves to
    /// [`DetachState::Initiated`] immediately; `on_detached` is invoked
    /// later, from [`complete_detach`](Self::complete_detach), once the
    /// driver confirms no further events will be dispatched.
    pub fn detach(&self, token: Token, on_detached: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            entry.detach_state = DetachState::Initiated;
            entry.on_detached = Some(on_detached);
            log::debug!("registry: detach initiated for {:?}", token);
        }
    }

    /// Called by the driver once it has confirmed no further events will
    /// ever be dispatched for `token`'s descriptor. Transitions to
    /// [`DetachState::Complete`], removes the entry, and fires
    /// `on_detached`.
    pub fn complete_detach(&self, token: Token) {
        let (descriptor, callback) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(mut entry) = inner.entries.try_remove(token.0) else {
                return;
            };
            entry.detach_state = DetachState::Complete;
            inner.by_descriptor.remove(&entry.descriptor);
            (entry.descriptor, entry.on_detached.take())
        };

        log::debug!("registry: detach complete for {descriptor}");
        if let Some(cb) = callback {
            cb();
        }
    }

    /// Find the entry for `descriptor`, if attached.
    pub fn find(&self, descriptor: Descriptor) -> Option<Token> {
        let inner = self.inner.lock().unwrap();
        inner.by_descriptor.get(&descriptor).map(|&key| Token(key))
    }

    pub fn detach_state(&self, token: Token) -> Option<DetachState> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(token.0).map(|e| e.detach_state)
    }

    /// Dispatch `readiness` to `token`'s handler, unless the entry is in
    /// `detach-initiated` or has already been removed, per §4.B: any
    /// event processor encountering such an entry must discard the event.
    pub fn dispatch(&self, token: Token, readiness: Readiness) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            if entry.detach_state != DetachState::Idle {
                log::trace!("registry: discarding event for detaching {:?}", token);
                return;
            }
            entry.handler.handle_readiness(readiness);
        }
    }

    /// Iterate every live (non-detaching) descriptor.
    pub fn for_each(&self, mut f: impl FnMut(Descriptor, Token)) {
        let inner = self.inner.lock().unwrap();
        for (key, entry) in inner.entries.iter() {
            if entry.detach_state == DetachState::Idle {
                f(entry.descriptor, Token(key));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}
