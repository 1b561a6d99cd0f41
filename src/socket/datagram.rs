//! Component H: `DatagramSocket`.
//!
//! Grounded on this crate's old (trimmed) `net::udp` wrapper for the shape
//! of a datagram socket's send/receive pair, and on `ntcr_streamsocket.h`'s
//! connect-callback guarding for the exactly-once connect semantics (§9,
//! resolved).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::flow::{Direction, FlowControlState};
use crate::options::SocketOptions;
use crate::queue::{ByteQueue, WatermarkCrossing};
use crate::registry::Registry;
use crate::shutdown::{Origin, ShutdownState};
use crate::token::Token;

use super::CallbackSlot;

/// The transport operations a concrete datagram backend (UDP, a Unix
/// datagram socket, ...) must provide. `DatagramSocket` never touches an
/// OS handle directly.
pub trait DatagramIo: Send {
    fn send_to(&self, data: &[u8], remote: Option<SocketAddr>) -> std::io::Result<usize>;
    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, Option<SocketAddr>)>;
}

#[cfg(any(test, feature = "std-net-io"))]
impl DatagramIo for std::net::UdpSocket {
    fn send_to(&self, data: &[u8], remote: Option<SocketAddr>) -> std::io::Result<usize> {
        match remote {
            Some(addr) => std::net::UdpSocket::send_to(self, data, addr),
            None => std::net::UdpSocket::send(self, data),
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, Option<SocketAddr>)> {
        std::net::UdpSocket::recv_from(self, buf).map(|(n, addr)| (n, Some(addr)))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unopened,
    Open,
    ShutSend,
    ShutReceive,
    Closed,
}

struct Inner {
    state: State,
    remote: Option<SocketAddr>,
    write_queue: ByteQueue,
    read_queue: ByteQueue,
    flow: FlowControlState,
    shutdown: ShutdownState,
    pending_receive_max: Option<usize>,
}

/// A datagram socket driven by an abstract [`DatagramIo`] backend.
pub struct DatagramSocket<Io: DatagramIo> {
    io: Io,
    inner: Mutex<Inner>,
    connect_callback: CallbackSlot<Result<()>>,
    receive_callback: CallbackSlot<Result<Vec<u8>>>,
    // Arc'd (rather than held inline) so the registry's `on_detached`
    // closure can hold its own clone without a handle back into `Self`,
    // the same reasoning as `ListenerSocket`'s `paused` flag.
    close_callback: Arc<CallbackSlot<()>>,
    detach: Option<(Arc<Registry>, Token)>,
}

impl<Io: DatagramIo> DatagramSocket<Io> {
    pub fn new(io: Io, options: &SocketOptions) -> DatagramSocket<Io> {
        DatagramSocket {
            io,
            inner: Mutex::new(Inner {
                state: State::Open,
                remote: None,
                write_queue: ByteQueue::new(options.get_write_watermarks()),
                read_queue: ByteQueue::new(options.get_read_watermarks()),
                flow: FlowControlState::new(),
                shutdown: ShutdownState::new(),
                pending_receive_max: None,
            }),
            connect_callback: CallbackSlot::empty(),
            receive_callback: CallbackSlot::empty(),
            close_callback: Arc::new(CallbackSlot::empty()),
            detach: None,
        }
    }

    /// Attach the registry/token this socket was registered under, so
    /// `close` can drive the §5 two-phase detach instead of completing
    /// synchronously. Without one, `close` has no driver to wait on and
    /// fires its callback immediately.
    pub fn with_detach(mut self, registry: Arc<Registry>, token: Token) -> DatagramSocket<Io> {
        self.detach = Some((registry, token));
        self
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Record the remote endpoint and fire `callback` with success. If
    /// [`cancel_connect`](Self::cancel_connect) races this call, exactly
    /// one of the two fires, whichever acquires the slot first.
    pub fn connect(&self, remote: SocketAddr, callback: Box<dyn FnOnce(Result<()>) + Send>) {
        self.connect_callback.set(callback);
        self.inner.lock().unwrap().remote = Some(remote);
        self.connect_callback.fire(Ok(()));
    }

    pub fn cancel_connect(&self) {
        self.connect_callback.fire(Err(TransportError::Cancelled));
    }

    /// Synchronous send. Enqueues instead of calling into `io` if the
    /// write queue already holds data or the send direction is flow-locked;
    /// otherwise attempts the syscall immediately, re-enqueuing any
    /// unsent remainder.
    pub fn send(&self, data: &[u8]) -> Result<Option<WatermarkCrossing>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed || inner.state == State::ShutSend {
            return Err(TransportError::Invalid);
        }

        if !inner.write_queue.is_empty() || !inner.flow.wants(Direction::Send) {
            let (crossing, discarded) = inner.write_queue.enqueue(data);
            if discarded.is_some() {
                return Err(TransportError::Limit);
            }
            if crossing == Some(WatermarkCrossing::High) {
                inner.flow.apply(Direction::Send, false);
            }
            return Ok(crossing);
        }

        let remote = inner.remote;
        match self.io.send_to(data, remote) {
            Ok(sent) if sent == data.len() => Ok(None),
            Ok(sent) => {
                let (crossing, _) = inner.write_queue.enqueue(&data[sent..]);
                if crossing == Some(WatermarkCrossing::High) {
                    inner.flow.apply(Direction::Send, false);
                }
                Ok(crossing)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let (crossing, _) = inner.write_queue.enqueue(data);
                if crossing == Some(WatermarkCrossing::High) {
                    inner.flow.apply(Direction::Send, false);
                }
                Ok(crossing)
            }
            Err(e) => Err(TransportError::from(e)),
        }
    }

    /// Drain queued writes once the driver reports writability again. The
    /// watermark crossing reported is the one the dequeue itself produced.
    pub fn on_writable(&self) -> Result<Option<WatermarkCrossing>> {
        let mut inner = self.inner.lock().unwrap();
        let (chunk, dequeue_crossing) = inner.write_queue.dequeue(usize::MAX);
        if chunk.is_empty() {
            return Ok(None);
        }
        if dequeue_crossing == Some(WatermarkCrossing::Low) {
            inner.flow.relax(Direction::Send, false);
        }
        let remote = inner.remote;
        match self.io.send_to(&chunk, remote) {
            Ok(sent) if sent < chunk.len() => {
                let (crossing, _) = inner.write_queue.enqueue(&chunk[sent..]);
                if crossing == Some(WatermarkCrossing::High) {
                    inner.flow.apply(Direction::Send, false);
                }
                Ok(dequeue_crossing)
            }
            Ok(_) => Ok(dequeue_crossing),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                inner.write_queue.enqueue(&chunk);
                Ok(dequeue_crossing)
            }
            Err(e) => Err(TransportError::from(e)),
        }
    }

    /// Non-blocking receive: fills from the read queue only, never issues
    /// a syscall. Returns `WouldBlock` if the queue is empty.
    pub fn receive(&self, max: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_queue.is_empty() {
            return Err(TransportError::WouldBlock);
        }
        let (data, crossing) = inner.read_queue.dequeue(max);
        if crossing == Some(WatermarkCrossing::Low) {
            inner.flow.relax(Direction::Receive, false);
        }
        Ok(data)
    }

    /// Queued receive: if data is already available, the callback fires
    /// immediately with it; otherwise it is armed and fires from the next
    /// [`on_readable`](Self::on_readable) that delivers at least one byte,
    /// from [`cancel_receive`](Self::cancel_receive), or from
    /// [`timeout_receive`](Self::timeout_receive), whichever comes first.
    /// Exactly one of those fires it, per the same [`CallbackSlot`]
    /// discipline as `connect`/`cancel_connect`.
    pub fn receive_deferred(&self, max: usize, callback: Box<dyn FnOnce(Result<Vec<u8>>) + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.read_queue.is_empty() {
            let (data, crossing) = inner.read_queue.dequeue(max);
            if crossing == Some(WatermarkCrossing::Low) {
                inner.flow.relax(Direction::Receive, false);
            }
            drop(inner);
            callback(Ok(data));
            return;
        }
        inner.pending_receive_max = Some(max);
        drop(inner);
        self.receive_callback.set(callback);
    }

    /// Fail a pending [`receive_deferred`](Self::receive_deferred) with
    /// `cancelled`. A no-op if no receive is armed or it already fired.
    pub fn cancel_receive(&self) {
        self.inner.lock().unwrap().pending_receive_max = None;
        self.receive_callback.fire(Err(TransportError::Cancelled));
    }

    /// Fail a pending [`receive_deferred`](Self::receive_deferred) with
    /// `timeout`. Driven by whatever deadline timer the caller scheduled;
    /// this type owns no chronology of its own.
    pub fn timeout_receive(&self) {
        self.inner.lock().unwrap().pending_receive_max = None;
        self.receive_callback.fire(Err(TransportError::Timeout));
    }

    /// Called by the driver when the descriptor becomes readable: pulls
    /// one datagram from the OS into the read queue, satisfying an armed
    /// deferred receive if one is waiting.
    pub fn on_readable(&self) -> Result<Option<WatermarkCrossing>> {
        let mut buf = vec![0u8; 64 * 1024];
        let (n, _from) = match self.io.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(TransportError::from(e)),
        };
        buf.truncate(n);
        let mut inner = self.inner.lock().unwrap();
        let (crossing, _) = inner.read_queue.enqueue(&buf);
        if crossing == Some(WatermarkCrossing::High) {
            inner.flow.apply(Direction::Receive, false);
        }
        if let Some(max) = inner.pending_receive_max.take() {
            let (data, drain_crossing) = inner.read_queue.dequeue(max);
            if drain_crossing == Some(WatermarkCrossing::Low) {
                inner.flow.relax(Direction::Receive, false);
            }
            drop(inner);
            self.receive_callback.fire(Ok(data));
            return Ok(crossing);
        }
        Ok(crossing)
    }

    /// Drive the §4.D shutdown sequence for `direction`.
    pub fn shutdown(&self, direction: Direction, origin: Origin) {
        let mut inner = self.inner.lock().unwrap();
        let ctx = match direction {
            Direction::Send => inner.shutdown.try_shutdown_send(origin),
            Direction::Receive => inner.shutdown.try_shutdown_receive(origin),
        };
        let Some(ctx) = ctx else { return };

        inner.flow.apply(direction, true);
        if direction == Direction::Send {
            inner.write_queue.close();
        } else {
            inner.read_queue.close();
            inner.pending_receive_max = None;
        }

        inner.state = match (inner.shutdown.is_send_shut(), inner.shutdown.is_receive_shut()) {
            (true, false) => State::ShutSend,
            (false, true) => State::ShutReceive,
            _ => inner.state,
        };

        if ctx.completed {
            inner.flow.close();
            inner.state = State::Closed;
        }
        drop(inner);
        if direction == Direction::Receive {
            self.receive_callback.fire(Err(TransportError::Eof));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().state == State::Closed
    }

    /// Force both directions shut immediately and begin detachment.
    /// Idempotent: a `close` on an already-closed socket is a no-op on
    /// the socket's own state, so the `closed` announcement this drives
    /// fires at most once across any number of `close` calls.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// As [`close`](Self::close), but `callback` runs once detachment
    /// completes: immediately, if no registry was attached via
    /// [`with_detach`](Self::with_detach), or once the driver calls
    /// [`Registry::complete_detach`] otherwise.
    pub fn close_with_callback(&self, callback: Box<dyn FnOnce() + Send>) {
        self.close_inner(Some(callback));
    }

    fn close_inner(&self, callback: Option<Box<dyn FnOnce() + Send>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed {
            drop(inner);
            if let Some(callback) = callback {
                callback();
            }
            return;
        }

        inner.shutdown.try_shutdown_send(Origin::Source);
        inner.shutdown.try_shutdown_receive(Origin::Source);
        inner.flow.close();
        inner.write_queue.close();
        inner.read_queue.close();
        inner.pending_receive_max = None;
        inner.state = State::Closed;
        drop(inner);

        self.receive_callback.fire(Err(TransportError::Eof));
        if let Some(callback) = callback {
            self.close_callback.set(callback);
        }

        match &self.detach {
            Some((registry, token)) => {
                let close_callback = self.close_callback.clone();
                registry.detach(*token, Box::new(move || close_callback.fire(())));
            }
            None => self.close_callback.fire(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FakeIo {
        sent: StdMutex<Vec<Vec<u8>>>,
        send_result: StdMutex<Option<std::io::Result<usize>>>,
        incoming: StdMutex<std::collections::VecDeque<Vec<u8>>>,
    }

    impl FakeIo {
        fn new() -> FakeIo {
            FakeIo {
                sent: StdMutex::new(Vec::new()),
                send_result: StdMutex::new(None),
                incoming: StdMutex::new(std::collections::VecDeque::new()),
            }
        }

        fn push_incoming(&self, datagram: &[u8]) {
            self.incoming.lock().unwrap().push_back(datagram.to_vec());
        }
    }

    impl DatagramIo for FakeIo {
        fn send_to(&self, data: &[u8], _remote: Option<SocketAddr>) -> std::io::Result<usize> {
            if let Some(result) = self.send_result.lock().unwrap().take() {
                return result;
            }
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, Option<SocketAddr>)> {
            match self.incoming.lock().unwrap().pop_front() {
                Some(datagram) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok((n, None))
                }
                None => Err(std::io::Error::from(std::io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[test]
    fn send_goes_straight_through_when_queue_empty() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let crossing = socket.send(b"hello").unwrap();
        assert!(crossing.is_none());
    }

    #[test]
    fn connect_then_cancel_fires_exactly_once() {
        let socket = Arc::new(DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4)));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        socket.connect("127.0.0.1:9000".parse().unwrap(), Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        socket.cancel_connect();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_receive_fires_immediately_when_data_already_queued() {
        let io = FakeIo::new();
        io.push_incoming(b"already here");
        let socket = DatagramSocket::new(io, &SocketOptions::new(crate::options::Transport::UdpIpv4));
        socket.on_readable().unwrap();

        let fired = Arc::new(StdMutex::new(None));
        let fired2 = fired.clone();
        socket.receive_deferred(64, Box::new(move |result| *fired2.lock().unwrap() = Some(result)));
        assert_eq!(fired.lock().unwrap().take().unwrap().unwrap(), b"already here");
    }

    #[test]
    fn deferred_receive_fires_from_next_readable_event() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let fired = Arc::new(StdMutex::new(None));
        let fired2 = fired.clone();
        socket.receive_deferred(64, Box::new(move |result| *fired2.lock().unwrap() = Some(result)));
        assert!(fired.lock().unwrap().is_none());

        socket.io.push_incoming(b"late arrival");
        socket.on_readable().unwrap();
        assert_eq!(fired.lock().unwrap().take().unwrap().unwrap(), b"late arrival");
    }

    #[test]
    fn deferred_receive_timeout_then_later_data_fires_no_second_callback() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let fired = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(StdMutex::new(None));
        let (fired2, last2) = (fired.clone(), last.clone());
        socket.receive_deferred(
            64,
            Box::new(move |result| {
                fired2.fetch_add(1, Ordering::SeqCst);
                *last2.lock().unwrap() = Some(result);
            }),
        );

        socket.timeout_receive();
        assert!(matches!(last.lock().unwrap().take(), Some(Err(TransportError::Timeout))));

        socket.io.push_incoming(b"too late");
        socket.on_readable().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1, "callback must not fire twice");
    }

    #[test]
    fn shutdown_receive_fails_pending_deferred_receive_with_eof() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let outcome = Arc::new(StdMutex::new(None));
        let outcome2 = outcome.clone();
        socket.receive_deferred(64, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)));

        socket.shutdown(Direction::Receive, Origin::Destination);
        assert!(matches!(outcome.lock().unwrap().take(), Some(Err(TransportError::Eof))));
    }

    #[test]
    fn shutdown_send_is_idempotent() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        socket.shutdown(Direction::Send, Origin::Source);
        assert_eq!(socket.state(), State::ShutSend);
        socket.shutdown(Direction::Send, Origin::Source);
        assert_eq!(socket.state(), State::ShutSend);
    }

    #[test]
    fn shutdown_both_directions_closes_socket() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        socket.shutdown(Direction::Send, Origin::Source);
        socket.shutdown(Direction::Receive, Origin::Source);
        assert!(socket.is_closed());
    }

    #[test]
    fn send_after_shutdown_send_is_rejected() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        socket.shutdown(Direction::Send, Origin::Source);
        assert!(socket.send(b"x").is_err());
    }

    #[test]
    fn close_without_registry_completes_synchronously_and_is_idempotent() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let fired = Arc::new(AtomicUsize::new(0));
        let (f1, f2) = (fired.clone(), fired.clone());

        socket.close_with_callback(Box::new(move || {
            f1.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(socket.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A second close is a no-op on socket state but still tells its
        // own caller the socket is closed.
        socket.close_with_callback(Box::new(move || {
            f2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_waits_for_registry_to_confirm_detach() {
        use crate::event::Readiness;
        use crate::registry::{Descriptor, Handler, Registry};

        struct NoopHandler;
        impl Handler for NoopHandler {
            fn handle_readiness(&mut self, _readiness: Readiness) {}
        }

        let registry = Arc::new(Registry::new());
        let token = registry.attach(Descriptor(1), Box::new(NoopHandler)).unwrap();
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4))
            .with_detach(registry.clone(), token);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        socket.close_with_callback(Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(socket.is_closed(), "the socket's own state closes immediately");
        assert_eq!(fired.load(Ordering::SeqCst), 0, "callback waits on the driver");

        registry.complete_detach(token);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn receive_deferred_pending_at_close_fails_with_eof() {
        let socket = DatagramSocket::new(FakeIo::new(), &SocketOptions::new(crate::options::Transport::UdpIpv4));
        let outcome = Arc::new(StdMutex::new(None));
        let outcome2 = outcome.clone();
        socket.receive_deferred(64, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)));

        socket.close();
        assert!(matches!(outcome.lock().unwrap().take(), Some(Err(TransportError::Eof))));
    }
}
