//! Component I: `StreamSocket`.
//!
//! Grounded on this crate's old (trimmed) `net::tcp` wrapper for the
//! byte-stream read/write shape, and on `ntcr_streamsocket.h` for the
//! connect-retry loop and the separate upgrade/downgrade callback slots
//! kept distinct from ordinary send/receive callbacks.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{Result, TransportError};
use crate::flow::{Direction, FlowControlState};
use crate::options::SocketOptions;
use crate::queue::{ByteQueue, WatermarkCrossing};
use crate::registry::Registry;
use crate::shutdown::{Origin, ShutdownState};
use crate::token::Token;

use super::CallbackSlot;

/// The transport operations a concrete stream backend must provide.
pub trait StreamIo: Send {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write(&self, buf: &[u8]) -> std::io::Result<usize>;
    fn shutdown(&self, direction: Direction) -> std::io::Result<()>;
}

#[cfg(any(test, feature = "std-net-io"))]
impl StreamIo for std::net::TcpStream {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        (&mut &*self).read(buf)
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        (&mut &*self).write(buf)
    }

    fn shutdown(&self, direction: Direction) -> std::io::Result<()> {
        let how = match direction {
            Direction::Send => std::net::Shutdown::Write,
            Direction::Receive => std::net::Shutdown::Read,
        };
        std::net::TcpStream::shutdown(self, how)
    }
}

/// A filter interposed between the byte queues and the kernel socket
/// during a TLS-style upgrade. Kept out of `send`/`receive`'s ordinary
/// path: it is driven by [`StreamSocket::on_readable`]/[`StreamSocket::on_writable`]
/// once installed.
pub trait EncryptionFilter: Send {
    /// Decrypt ciphertext freshly read from the kernel into plaintext for
    /// the read queue.
    fn feed(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>>;
    /// Encrypt plaintext from the write queue into ciphertext for the
    /// kernel.
    fn drain(&mut self, plaintext: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Unopened,
    Opened,
    Connecting,
    Connected,
    Upgrading,
    Upgraded,
    ShuttingDown,
    Closed,
}

/// Attempt each endpoint in order, retrying the whole list until
/// `deadline` (if any) elapses. Returns the connected transport plus the
/// number of attempts made, per §4.I's connect protocol.
pub fn connect_with_retry<Io>(
    endpoints: &[SocketAddr],
    deadline: Option<Instant>,
    mut connector: impl FnMut(SocketAddr) -> std::io::Result<Io>,
) -> (Result<Io>, u32) {
    let mut attempts = 0u32;
    loop {
        for &endpoint in endpoints {
            attempts += 1;
            if let Ok(io) = connector(endpoint) {
                return (Ok(io), attempts);
            }
        }
        match deadline {
            Some(d) if Instant::now() < d => continue,
            _ => break,
        }
    }
    (Err(TransportError::ConnectionRefused), attempts)
}

struct Inner {
    state: State,
    write_queue: ByteQueue,
    read_queue: ByteQueue,
    flow: FlowControlState,
    shutdown: ShutdownState,
    encryption: Option<Box<dyn EncryptionFilter>>,
    pending_receive_max: Option<usize>,
}

pub struct StreamSocket<Io: StreamIo> {
    io: Io,
    inner: Mutex<Inner>,
    upgrade_callback: CallbackSlot<Result<()>>,
    downgrade_callback: CallbackSlot<Result<()>>,
    receive_callback: CallbackSlot<Result<Vec<u8>>>,
    // Arc'd so the registry's `on_detached` closure can hold its own
    // clone without a handle back into `Self`.
    close_callback: Arc<CallbackSlot<()>>,
    detach: Option<(Arc<Registry>, Token)>,
}

impl<Io: StreamIo> StreamSocket<Io> {
    pub fn new(io: Io, options: &SocketOptions) -> StreamSocket<Io> {
        StreamSocket {
            io,
            inner: Mutex::new(Inner {
                state: State::Connected,
                write_queue: ByteQueue::new(options.get_write_watermarks()),
                read_queue: ByteQueue::new(options.get_read_watermarks()),
                flow: FlowControlState::new(),
                shutdown: ShutdownState::new(),
                encryption: None,
                pending_receive_max: None,
            }),
            upgrade_callback: CallbackSlot::empty(),
            downgrade_callback: CallbackSlot::empty(),
            receive_callback: CallbackSlot::empty(),
            close_callback: Arc::new(CallbackSlot::empty()),
            detach: None,
        }
    }

    /// Attach the registry/token this socket was registered under, so
    /// `close` can drive the §5 two-phase detach instead of completing
    /// synchronously.
    pub fn with_detach(mut self, registry: Arc<Registry>, token: Token) -> StreamSocket<Io> {
        self.detach = Some((registry, token));
        self
    }

    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Enqueue (or, if the queue is empty and send isn't flow-locked,
    /// attempt immediately) `data`. Consecutive queued entries are
    /// coalesced by [`on_writable`](Self::on_writable), not here.
    pub fn send(&self, data: &[u8]) -> Result<Option<WatermarkCrossing>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Closed || inner.shutdown.is_send_shut() {
            return Err(TransportError::Invalid);
        }

        if !inner.write_queue.is_empty() || !inner.flow.wants(Direction::Send) {
            let (crossing, discarded) = inner.write_queue.enqueue(data);
            if discarded.is_some() {
                return Err(TransportError::Limit);
            }
            return self.check_send_watermark(&mut *inner, crossing);
        }

        match self.io.write(data) {
            Ok(sent) if sent == data.len() => Ok(None),
            Ok(sent) => {
                let (crossing, _) = inner.write_queue.enqueue(&data[sent..]);
                self.check_send_watermark(&mut *inner, crossing)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let (crossing, _) = inner.write_queue.enqueue(data);
                self.check_send_watermark(&mut *inner, crossing)
            }
            Err(e) => Err(TransportError::from(e)),
        }
    }

    fn check_send_watermark(
        &self,
        inner: &mut Inner,
        crossing: Option<WatermarkCrossing>,
    ) -> Result<Option<WatermarkCrossing>> {
        if crossing == Some(WatermarkCrossing::High) {
            inner.flow.apply(Direction::Send, false);
        }
        Ok(crossing)
    }

    /// Drain as much of the write queue as the kernel will accept,
    /// coalescing consecutive entries into one write. The watermark
    /// crossing reported is the one the dequeue itself produced; a
    /// partial or failed kernel write re-enqueues the remainder, which
    /// may re-cross high on its own future dequeue.
    pub fn on_writable(&self) -> Result<Option<WatermarkCrossing>> {
        let mut inner = self.inner.lock().unwrap();
        let (chunk, dequeue_crossing) = inner.write_queue.dequeue(usize::MAX);
        if chunk.is_empty() {
            return Ok(None);
        }
        if dequeue_crossing == Some(WatermarkCrossing::Low) {
            inner.flow.relax(Direction::Send, false);
        }

        let outgoing = match &mut inner.encryption {
            Some(filter) => filter.drain(&chunk)?,
            None => chunk.clone(),
        };

        match self.io.write(&outgoing) {
            Ok(sent) if sent < outgoing.len() => {
                let (crossing, _) = inner.write_queue.enqueue(&outgoing[sent..]);
                if crossing == Some(WatermarkCrossing::High) {
                    inner.flow.apply(Direction::Send, false);
                }
                Ok(dequeue_crossing)
            }
            Ok(_) => Ok(dequeue_crossing),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                inner.write_queue.enqueue(&outgoing);
                Ok(dequeue_crossing)
            }
            Err(e) => Err(TransportError::from(e)),
        }
    }

    pub fn receive(&self, max: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_queue.is_empty() {
            if inner.shutdown.is_receive_shut() {
                return Err(TransportError::Eof);
            }
            return Err(TransportError::WouldBlock);
        }
        let (data, crossing) = inner.read_queue.dequeue(max);
        if crossing == Some(WatermarkCrossing::Low) {
            inner.flow.relax(Direction::Receive, false);
        }
        Ok(data)
    }

    /// Queued receive: if data is already available, the callback fires
    /// immediately; otherwise it is armed and fires from the next
    /// [`on_readable`](Self::on_readable) that delivers bytes or observes
    /// peer EOF, from [`cancel_receive`](Self::cancel_receive), or from
    /// [`timeout_receive`](Self::timeout_receive), whichever comes first.
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
        if inner.shutdown.is_receive_shut() {
            drop(inner);
            callback(Err(TransportError::Eof));
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

    /// Called by the driver on readability: reads into the read queue,
    /// applying receive-direction flow control on a high-watermark
    /// crossing. `n == 0` signals peer EOF and drives the read-shutdown
    /// half of §4.I's shutdown sequence, failing an armed deferred receive
    /// with `eof` rather than leaving it to time out.
    pub fn on_readable(&self) -> Result<Option<WatermarkCrossing>> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = match self.io.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(TransportError::from(e)),
        };

        if n == 0 {
            self.shutdown(Direction::Receive, Origin::Destination);
            return Ok(None);
        }

        buf.truncate(n);
        let mut inner = self.inner.lock().unwrap();
        let plaintext = match &mut inner.encryption {
            Some(filter) => filter.feed(&buf)?,
            None => buf,
        };
        let (crossing, _) = inner.read_queue.enqueue(&plaintext);
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

    /// Begin a TLS-style upgrade. Simplified to a single synchronous
    /// step: a real handshake would alternate `feed`/`drain` across
    /// several readable/writable rounds before firing `callback`.
    pub fn upgrade(&self, filter: Box<dyn EncryptionFilter>, callback: Box<dyn FnOnce(Result<()>) + Send>) {
        self.upgrade_callback.set(callback);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.encryption = Some(filter);
            inner.state = State::Upgraded;
        }
        self.upgrade_callback.fire(Ok(()));
    }

    pub fn downgrade(&self, callback: Box<dyn FnOnce(Result<()>) + Send>) {
        self.downgrade_callback.set(callback);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.encryption = None;
            inner.state = State::Connected;
        }
        self.downgrade_callback.fire(Ok(()));
    }

    /// Drive the §4.I shutdown sequence for `direction`.
    pub fn shutdown(&self, direction: Direction, origin: Origin) {
        let mut inner = self.inner.lock().unwrap();
        let ctx = match direction {
            Direction::Send => inner.shutdown.try_shutdown_send(origin),
            Direction::Receive => inner.shutdown.try_shutdown_receive(origin),
        };
        let Some(ctx) = ctx else { return };

        inner.flow.apply(direction, true);
        let _ = self.io.shutdown(direction);

        if direction == Direction::Send {
            inner.write_queue.close();
        } else {
            inner.read_queue.close();
            inner.pending_receive_max = None;
        }

        inner.state = State::ShuttingDown;
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
        let _ = self.io.shutdown(Direction::Send);
        let _ = self.io.shutdown(Direction::Receive);
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
        outbound: StdMutex<Vec<u8>>,
        inbound: StdMutex<std::collections::VecDeque<u8>>,
        write_cap: Arc<AtomicUsize>,
    }

    impl FakeIo {
        fn new(write_cap: usize) -> FakeIo {
            FakeIo {
                outbound: StdMutex::new(Vec::new()),
                inbound: StdMutex::new(std::collections::VecDeque::new()),
                write_cap: Arc::new(AtomicUsize::new(write_cap)),
            }
        }

        fn with_shared_cap(write_cap: Arc<AtomicUsize>) -> FakeIo {
            FakeIo {
                outbound: StdMutex::new(Vec::new()),
                inbound: StdMutex::new(std::collections::VecDeque::new()),
                write_cap,
            }
        }
    }

    impl StreamIo for FakeIo {
        fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            let n = inbound.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.write_cap.load(Ordering::SeqCst));
            self.outbound.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown(&self, _direction: Direction) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn send_past_high_watermark_applies_flow_control_then_relaxes() {
        // Capacity starts at 0 so every send is forced through the write
        // queue instead of the empty-queue direct-write fast path, letting
        // the watermarks actually accumulate before being drained.
        let cap = Arc::new(AtomicUsize::new(0));
        let io = FakeIo::with_shared_cap(cap.clone());
        let options = SocketOptions::new(crate::options::Transport::TcpIpv4).write_watermarks(2, 4);
        let socket = StreamSocket::new(io, &options);

        let c1 = socket.send(&[1, 2, 3, 4]).unwrap();
        assert!(c1.is_none());
        let c2 = socket.send(&[5, 6, 7, 8]).unwrap();
        assert_eq!(c2, Some(WatermarkCrossing::High));

        let c3 = socket.send(&[9]).unwrap();
        assert_eq!(c3, None, "still above high, no repeat report");

        cap.store(64, Ordering::SeqCst);
        let drain = socket.on_writable().unwrap();
        assert_eq!(drain, Some(WatermarkCrossing::Low));
    }

    #[test]
    fn peer_eof_drives_receive_shutdown() {
        let io = FakeIo::new(64);
        let options = SocketOptions::new(crate::options::Transport::TcpIpv4);
        let socket = StreamSocket::new(io, &options);

        socket.on_readable().unwrap();
        assert!(matches!(socket.receive(16), Err(TransportError::Eof)));
    }

    #[test]
    fn deferred_receive_fires_from_next_readable_event() {
        let io = FakeIo::new(64);
        let socket = StreamSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));
        let fired = Arc::new(StdMutex::new(None));
        let fired2 = fired.clone();
        socket.receive_deferred(64, Box::new(move |result| *fired2.lock().unwrap() = Some(result)));
        assert!(fired.lock().unwrap().is_none());

        socket.io.inbound.lock().unwrap().extend(b"late arrival".iter().copied());
        socket.on_readable().unwrap();
        assert_eq!(fired.lock().unwrap().take().unwrap().unwrap(), b"late arrival");
    }

    #[test]
    fn shutdown_receive_fails_pending_deferred_receive_with_eof() {
        let io = FakeIo::new(64);
        let socket = StreamSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));
        let outcome = Arc::new(StdMutex::new(None));
        let outcome2 = outcome.clone();
        socket.receive_deferred(64, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)));

        socket.shutdown(Direction::Receive, Origin::Destination);
        assert!(matches!(outcome.lock().unwrap().take(), Some(Err(TransportError::Eof))));
    }

    #[test]
    fn deferred_receive_peer_eof_fires_with_eof_not_timeout() {
        let io = FakeIo::new(64);
        let socket = StreamSocket::new(io, &SocketOptions::new(crate::options::Transport::TcpIpv4));
        let fired = Arc::new(StdMutex::new(None));
        let fired2 = fired.clone();
        socket.receive_deferred(64, Box::new(move |result| *fired2.lock().unwrap() = Some(result)));

        socket.on_readable().unwrap(); // 0 bytes -> peer EOF
        assert!(matches!(fired.lock().unwrap().take(), Some(Err(TransportError::Eof))));
    }

    #[test]
    fn connect_retry_counts_attempts() {
        let endpoint: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut call = 0;
        let (result, attempts) = connect_with_retry(
            &[endpoint],
            Some(Instant::now() + std::time::Duration::from_secs(2)),
            |_addr| {
                call += 1;
                if call == 1 {
                    Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn close_without_registry_completes_synchronously_and_is_idempotent() {
        let socket = StreamSocket::new(FakeIo::new(64), &SocketOptions::new(crate::options::Transport::TcpIpv4));
        let fired = Arc::new(AtomicUsize::new(0));
        let (f1, f2) = (fired.clone(), fired.clone());

        socket.close_with_callback(Box::new(move || {
            f1.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(socket.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

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
        let socket = StreamSocket::new(FakeIo::new(64), &SocketOptions::new(crate::options::Transport::TcpIpv4))
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
        let socket = StreamSocket::new(FakeIo::new(64), &SocketOptions::new(crate::options::Transport::TcpIpv4));
        let outcome = Arc::new(StdMutex::new(None));
        let outcome2 = outcome.clone();
        socket.receive_deferred(64, Box::new(move |result| *outcome2.lock().unwrap() = Some(result)));

        socket.close();
        assert!(matches!(outcome.lock().unwrap().take(), Some(Err(TransportError::Eof))));
    }
}
