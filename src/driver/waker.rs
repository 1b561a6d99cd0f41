//! Cross-thread wakeup, generalized from `awakener::Awakener` /
//! `waker::Waker` (the two near-duplicate eventfd wrappers this crate
//! carried). A driver blocked in its backend's wait call needs a way for
//! another thread (submitting work, arming a timer, posting to a strand)
//! to interrupt it.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::EventFd;

#[derive(Debug, Clone)]
pub struct Waker {
    inner: std::sync::Arc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker { inner: std::sync::Arc::new(EventFd::new()?) })
    }

    /// Interrupt a blocked wait call. Idempotent: waking an already-woken
    /// waker is a no-op (`WouldBlock` from a saturated eventfd counter is
    /// swallowed).
    pub fn wake(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain the wakeup signal after observing it, so the backend doesn't
    /// immediately return again with no new work.
    pub fn reset(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
