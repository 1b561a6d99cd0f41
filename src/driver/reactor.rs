//! Component F: the reactor driver, readiness-based dispatch over a
//! pluggable [`Backend`].
//!
//! Grounded on `epoll::Epoll`'s `add`/`modify`/`delete` plus `Source`
//! trait, generalized here into a `Backend` trait so the reactor itself
//! never depends on a concrete poller (concrete backends, epoll, kqueue,
//! and IOCP-as-reactor among them, are out of scope; only the interface
//! and a loopback test backend live here).

use std::io;
use std::time::{Duration, Instant};

use crate::chronology::Chronology;
use crate::event::Readiness;
use crate::options::Trigger;
use crate::registry::{Descriptor, Handler, Registry};
use crate::token::Token;

/// A pluggable readiness multiplexer. A concrete implementation owns the
/// OS polling primitive (epoll, kqueue, ...); the reactor only ever calls
/// through this trait.
pub trait Backend: Send {
    fn register(&self, descriptor: Descriptor, interest: Readiness, trigger: Trigger) -> io::Result<()>;
    fn reregister(&self, descriptor: Descriptor, interest: Readiness, trigger: Trigger) -> io::Result<()>;
    fn deregister(&self, descriptor: Descriptor) -> io::Result<()>;
    /// Block for up to `timeout` (`None` = forever) and report every
    /// descriptor with new readiness.
    fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<(Descriptor, Readiness)>>;
}

/// Readiness-based driver: owns a [`Registry`], a [`Chronology`], and a
/// [`Backend`], and drives one poll-dispatch-announce cycle per
/// [`run_once`](Self::run_once) call.
pub struct Reactor {
    registry: Registry,
    chronology: std::sync::Mutex<Chronology>,
    backend: Box<dyn Backend>,
}

impl Reactor {
    pub fn new(backend: Box<dyn Backend>) -> Reactor {
        Reactor {
            registry: Registry::new(),
            chronology: std::sync::Mutex::new(Chronology::new()),
            backend,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn chronology(&self) -> &std::sync::Mutex<Chronology> {
        &self.chronology
    }

    /// Attach `descriptor` with zero initial interest; callers then call
    /// [`set_interest`](Self::set_interest) to arm it.
    pub fn attach(
        &self,
        descriptor: Descriptor,
        handler: Box<dyn Handler>,
        trigger: Trigger,
    ) -> io::Result<Token> {
        let token = self
            .registry
            .attach(descriptor, handler)
            .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;
        self.backend.register(descriptor, Readiness::empty(), trigger)?;
        Ok(token)
    }

    pub fn set_interest(
        &self,
        descriptor: Descriptor,
        interest: Readiness,
        trigger: Trigger,
    ) -> io::Result<()> {
        self.backend.reregister(descriptor, interest, trigger)
    }

    /// Begin detachment. Since a single-threaded reactor never dispatches
    /// concurrently with this call, `deregister` succeeding is sufficient
    /// confirmation that no further events will arrive; detach completes
    /// synchronously instead of waiting for a separate driver round.
    pub fn detach(&self, token: Token, descriptor: Descriptor, on_detached: Box<dyn FnOnce() + Send>) -> io::Result<()> {
        self.registry.detach(token, on_detached);
        self.backend.deregister(descriptor)?;
        self.registry.complete_detach(token);
        Ok(())
    }

    /// One iteration: compute a timeout bounded by the earliest live
    /// timer, poll the backend, dispatch readiness to each token's
    /// handler, then announce elapsed timers.
    pub fn run_once(&self, max_wait: Option<Duration>) -> io::Result<usize> {
        let now = Instant::now();
        let timer_wait = {
            let chrono = self.chronology.lock().unwrap();
            chrono.earliest_deadline().map(|deadline| deadline.saturating_duration_since(now))
        };
        let timeout = match (max_wait, timer_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let ready = self.backend.poll(timeout)?;
        for (descriptor, readiness) in &ready {
            if let Some(token) = self.registry.find(*descriptor) {
                self.registry.dispatch(token, *readiness);
            }
        }

        self.chronology.lock().unwrap().announce(Instant::now());
        Ok(ready.len())
    }
}

/// An in-memory [`Backend`] for tests: readiness is set directly by the
/// test rather than observed from the kernel. `poll` returns whatever
/// readiness has been marked since the last call and then clears it
/// (edge-triggered semantics only, for simplicity).
#[cfg(any(test, feature = "loopback-backend"))]
pub struct LoopbackBackend {
    pending: std::sync::Mutex<Vec<(Descriptor, Readiness)>>,
}

#[cfg(any(test, feature = "loopback-backend"))]
impl LoopbackBackend {
    pub fn new() -> LoopbackBackend {
        LoopbackBackend { pending: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn mark_ready(&self, descriptor: Descriptor, readiness: Readiness) {
        self.pending.lock().unwrap().push((descriptor, readiness));
    }
}

#[cfg(any(test, feature = "loopback-backend"))]
impl Default for LoopbackBackend {
    fn default() -> LoopbackBackend {
        LoopbackBackend::new()
    }
}

#[cfg(any(test, feature = "loopback-backend"))]
impl Backend for std::sync::Arc<LoopbackBackend> {
    fn register(&self, _descriptor: Descriptor, _interest: Readiness, _trigger: Trigger) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&self, _descriptor: Descriptor, _interest: Readiness, _trigger: Trigger) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&self, _descriptor: Descriptor) -> io::Result<()> {
        Ok(())
    }

    fn poll(&self, _timeout: Option<Duration>) -> io::Result<Vec<(Descriptor, Readiness)>> {
        Ok(std::mem::take(&mut *self.pending.lock().unwrap()))
    }
}
