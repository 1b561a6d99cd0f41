//! Component J: `ListenerSocket`.
//!
//! Grounded on `ntcp_listenersocket.cpp`'s accept-backlog/throttle sequence
//! for the rate-limiter and `limit`-error back-off behavior, and on this
//! crate's [`crate::chronology`] for the re-arm timer that drives both.
//! The accept queue's watermark alternation mirrors [`crate::queue`]'s
//! byte queue, sized by accepted-connection count instead of bytes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::chronology::{Chronology, TimerEvent, TimerId};
use crate::error::{Result, TransportError};
use crate::external::RateLimiter;
use crate::options::{SocketOptions, Watermarks};
use crate::queue::WatermarkCrossing;

/// The transport operation a concrete listening backend must provide.
/// `ListenerSocket` never touches an OS handle directly.
pub trait ListenerIo: Send {
    type Connection: Send;

    fn accept(&self) -> std::io::Result<(Self::Connection, SocketAddr)>;
}

#[cfg(any(test, feature = "std-net-io"))]
impl ListenerIo for std::net::TcpListener {
    type Connection = std::net::TcpStream;

    fn accept(&self) -> std::io::Result<(std::net::TcpStream, SocketAddr)> {
        std::net::TcpListener::accept(self)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unopened,
    Bound,
    Listening,
    Closed,
}

const BACKLOG_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

struct Inner<Conn> {
    state: State,
    accept_queue: VecDeque<(Conn, SocketAddr)>,
    watermarks: Watermarks,
    above_high: bool,
    backoff_timer: Option<TimerId>,
}

/// A listening socket driven by an abstract [`ListenerIo`] backend, with
/// an optional [`RateLimiter`] throttling how fast accepted connections
/// are admitted.
pub struct ListenerSocket<Io: ListenerIo> {
    io: Io,
    inner: Mutex<Inner<Io::Connection>>,
    // Kept outside `Inner` (rather than generic over `Io::Connection`) so
    // the back-off timer's callback can hold its own clone and flip it
    // without needing a handle back into the listener itself.
    paused: Arc<AtomicBool>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    chronology: Option<Arc<Mutex<Chronology>>>,
}

impl<Io: ListenerIo> ListenerSocket<Io> {
    pub fn new(io: Io, options: &SocketOptions) -> ListenerSocket<Io> {
        ListenerSocket {
            io,
            inner: Mutex::new(Inner {
                state: State::Listening,
                accept_queue: VecDeque::new(),
                watermarks: options.get_read_watermarks(),
                above_high: false,
                backoff_timer: None,
            }),
            paused: Arc::new(AtomicBool::new(false)),
            rate_limiter: None,
            chronology: None,
        }
    }

    /// Attach a rate limiter consulted after every successful accept.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> ListenerSocket<Io> {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Attach the chronology used to schedule backlog/rate-limit re-arm
    /// timers. Without one, throttling still pauses accepts but never
    /// automatically resumes them.
    pub fn with_chronology(mut self, chronology: Arc<Mutex<Chronology>>) -> ListenerSocket<Io> {
        self.chronology = Some(chronology);
        self
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Called by the driver on acceptability: pull one connection from
    /// the kernel into the accept queue, applying the §4.J throttle
    /// rules. A `limit` error backs off for a fixed interval instead of
    /// being treated as fatal.
    pub fn on_acceptable(&self) -> Result<Option<WatermarkCrossing>> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(None);
        }
        {
            let inner = self.inner.lock().unwrap();
            if inner.state == State::Closed {
                return Ok(None);
            }
        }

        match self.io.accept() {
            Ok((connection, addr)) => {
                let crossing = self.admit(connection, addr);
                if let Some(limiter) = &self.rate_limiter {
                    limiter.submit(1);
                    let now = Instant::now();
                    if limiter.would_exceed_bandwidth(now) {
                        self.pause();
                        self.arm_backoff(limiter.calculate_time_to_submit(now));
                    }
                }
                Ok(crossing)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                let err = TransportError::from(e);
                if matches!(err, TransportError::Limit) {
                    self.pause();
                    self.arm_backoff(BACKLOG_BACKOFF);
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn admit(&self, connection: Io::Connection, addr: SocketAddr) -> Option<WatermarkCrossing> {
        let mut inner = self.inner.lock().unwrap();
        inner.accept_queue.push_back((connection, addr));
        if !inner.above_high && inner.accept_queue.len() > inner.watermarks.high() {
            inner.above_high = true;
            return Some(WatermarkCrossing::High);
        }
        None
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Schedule the listener's own relaxation: the timer callback holds
    /// its own clone of `paused` and clears it directly on expiry, so
    /// accepting resumes without any external caller having to drive it.
    fn arm_backoff(&self, delay: std::time::Duration) {
        let Some(chronology) = self.chronology.clone() else { return };
        let mut chron = chronology.lock().unwrap();
        let deadline = Instant::now() + delay;
        let paused = self.paused.clone();
        let timer = chron.create_timer(Box::new(move |event: TimerEvent| {
            if event == TimerEvent::Deadline {
                paused.store(false, Ordering::SeqCst);
            }
        }));
        chron.schedule(timer, deadline);
    }

    /// Remove and return the next accepted connection, if any.
    pub fn accept(&self) -> Result<(Io::Connection, SocketAddr)> {
        let mut inner = self.inner.lock().unwrap();
        match inner.accept_queue.pop_front() {
            Some(item) => {
                if inner.above_high && inner.accept_queue.len() <= inner.watermarks.low() {
                    inner.above_high = false;
                }
                Ok(item)
            }
            None => Err(TransportError::WouldBlock),
        }
    }

    /// Resume accepting. Normally driven by the back-off timer itself;
    /// exposed so a caller without a chronology attached can still
    /// relax the throttle manually.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Closed;
        inner.accept_queue.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().state == State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeListenerIo {
        pending: Mutex<VecDeque<std::io::Result<(u32, SocketAddr)>>>,
    }

    impl FakeListenerIo {
        fn new() -> FakeListenerIo {
            FakeListenerIo { pending: Mutex::new(VecDeque::new()) }
        }

        fn push(&self, result: std::io::Result<(u32, SocketAddr)>) {
            self.pending.lock().unwrap().push_back(result);
        }
    }

    impl ListenerIo for FakeListenerIo {
        type Connection = u32;

        fn accept(&self) -> std::io::Result<(u32, SocketAddr)> {
            self.pending
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)))
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn accepted_connection_is_queued_then_dequeued() {
        let io = FakeListenerIo::new();
        io.push(Ok((1, addr())));
        let listener = ListenerSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));

        listener.on_acceptable().unwrap();
        let (conn, _) = listener.accept().unwrap();
        assert_eq!(conn, 1);
        assert!(listener.accept().is_err());
    }

    #[test]
    fn limit_error_pauses_accepting_then_self_resumes_on_timer() {
        let io = FakeListenerIo::new();
        io.push(Err(std::io::Error::from_raw_os_error(libc::EMFILE)));
        let chronology = Arc::new(Mutex::new(Chronology::new()));
        let listener = ListenerSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4))
            .with_chronology(chronology.clone());

        listener.on_acceptable().unwrap();
        assert!(listener.is_paused());

        // Announce past the back-off deadline instead of calling `resume`
        // directly: the back-off timer's own callback must clear `paused`.
        chronology
            .lock()
            .unwrap()
            .announce(Instant::now() + BACKLOG_BACKOFF + std::time::Duration::from_millis(1));
        assert!(!listener.is_paused());
    }

    #[test]
    fn limit_error_without_chronology_stays_paused_until_manual_resume() {
        let io = FakeListenerIo::new();
        io.push(Err(std::io::Error::from_raw_os_error(libc::EMFILE)));
        let listener = ListenerSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));

        listener.on_acceptable().unwrap();
        assert!(listener.is_paused());
        listener.resume();
        assert!(!listener.is_paused());
    }

    struct AlwaysOverLimiter {
        calls: AtomicUsize,
    }

    impl RateLimiter for AlwaysOverLimiter {
        fn would_exceed_bandwidth(&self, _now: Instant) -> bool {
            true
        }

        fn calculate_time_to_submit(&self, _now: Instant) -> std::time::Duration {
            std::time::Duration::from_millis(10)
        }

        fn submit(&self, _units: u64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rate_limiter_over_bandwidth_pauses_then_self_resumes_on_timer() {
        let io = FakeListenerIo::new();
        io.push(Ok((1, addr())));
        let limiter = Arc::new(AlwaysOverLimiter { calls: AtomicUsize::new(0) });
        let chronology = Arc::new(Mutex::new(Chronology::new()));
        let listener = ListenerSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4))
            .with_rate_limiter(limiter.clone())
            .with_chronology(chronology.clone());

        listener.on_acceptable().unwrap();
        assert!(listener.is_paused());
        assert_eq!(limiter.calls.load(Ordering::SeqCst), 1);

        chronology
            .lock()
            .unwrap()
            .announce(Instant::now() + std::time::Duration::from_millis(11));
        assert!(!listener.is_paused());
    }

    #[test]
    fn close_drains_accept_queue() {
        let io = FakeListenerIo::new();
        io.push(Ok((1, addr())));
        let listener = ListenerSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));
        listener.on_acceptable().unwrap();
        listener.close();
        assert!(listener.is_closed());
        assert!(listener.accept().is_err());
    }
}
