//! The typed error taxonomy used throughout the socket lifecycle engine.
//!
//! Every public operation in this crate either returns a [`Result`]
//! synchronously or delivers a [`TransportError`] through a callback; there
//! is no exception-style control flow. Raw OS errors are classified into
//! this taxonomy at the syscall boundary (see the `From<io::Error>` impl)
//! so the rest of the crate never matches on [`io::ErrorKind`] directly.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TransportError>;

/// The abstract error taxonomy of the transport core.
///
/// Transient kinds ([`WouldBlock`](TransportError::WouldBlock),
/// [`Interrupted`](TransportError::Interrupted)) are recovered locally by
/// re-arming interest or retrying and should rarely escape to a caller.
/// [`Eof`](TransportError::Eof) is surfaced once as the terminal read
/// result. [`Cancelled`](TransportError::Cancelled) and
/// [`Timeout`](TransportError::Timeout) are surfaced to the specific
/// pending operation they belong to. [`Limit`](TransportError::Limit)
/// triggers throttling, not failure. All other kinds mark a connection
/// unrecoverable and initiate close.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The operation would have blocked the calling thread; retry once
    /// readiness (or a completion) is observed.
    #[error("operation would block")]
    WouldBlock,

    /// The underlying syscall was interrupted; retry is safe and silent.
    #[error("operation interrupted")]
    Interrupted,

    /// The peer has shut down its write side; this is the terminal result
    /// of a read, not a failure.
    #[error("end of file")]
    Eof,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline elapsed before it completed.
    #[error("operation timed out")]
    Timeout,

    /// A capacity limit (accept backlog, handle reservation, rate limiter)
    /// was reached; the caller should back off and retry, not treat this
    /// as a hard failure.
    #[error("resource limit reached")]
    Limit,

    /// The peer actively refused the connection attempt.
    #[error("connection refused")]
    ConnectionRefused,

    /// The peer reset the connection.
    #[error("connection reset")]
    ConnectionReset,

    /// The connection is no longer usable for any I/O.
    #[error("connection is dead")]
    ConnectionDead,

    /// The requested local address is already in use.
    #[error("address already in use")]
    AddressInUse,

    /// The requested address could not be reached.
    #[error("address unreachable")]
    AddressUnreachable,

    /// No route exists to the peer.
    #[error("network unreachable")]
    Unreachable,

    /// The caller supplied an invalid argument or called an operation in
    /// a state that does not permit it.
    #[error("invalid argument or state")]
    Invalid,

    /// The backend does not implement this operation.
    #[error("operation not implemented")]
    NotImplemented,

    /// An OS error that does not map to a more specific kind above.
    #[error("transport error: {0}")]
    Os(#[source] io::Error),
}

impl TransportError {
    /// True for kinds that should be recovered locally (re-arm interest,
    /// retry) rather than surfaced to the user as a failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::WouldBlock | TransportError::Interrupted)
    }

    /// True for kinds that mark the connection unrecoverable and should
    /// initiate close of the owning socket.
    pub fn is_fatal(&self) -> bool {
        !self.is_transient()
            && !matches!(
                self,
                TransportError::Eof
                    | TransportError::Cancelled
                    | TransportError::Timeout
                    | TransportError::Limit
            )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> TransportError {
        match err.kind() {
            io::ErrorKind::WouldBlock => TransportError::WouldBlock,
            io::ErrorKind::Interrupted => TransportError::Interrupted,
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                TransportError::ConnectionReset
            }
            io::ErrorKind::AddrInUse => TransportError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => TransportError::AddressUnreachable,
            io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => {
                TransportError::ConnectionDead
            }
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => TransportError::Invalid,
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => classify_raw_os_error(&err).unwrap_or(TransportError::Os(err)),
        }
    }
}

#[cfg(unix)]
fn classify_raw_os_error(err: &io::Error) -> Option<TransportError> {
    match err.raw_os_error() {
        Some(libc::ENETUNREACH) | Some(libc::EHOSTUNREACH) => {
            Some(TransportError::Unreachable)
        }
        Some(libc::EMFILE) | Some(libc::ENFILE) => Some(TransportError::Limit),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_raw_os_error(_err: &io::Error) -> Option<TransportError> {
    None
}
