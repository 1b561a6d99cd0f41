//! Multi-producer submission queue paired with a [`Waker`], kept from this
//! crate's original `Queue<T>` for exactly the purpose it already served:
//! letting other threads hand work to a driver blocked in its backend's
//! wait call. Not to be confused with [`crate::queue::ByteQueue`], which
//! is single-writer and sized in bytes, not items.

use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

pub use concurrent_queue::{ConcurrentQueue, PopError, PushError};

use super::waker::Waker;

pub struct MpscQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    queue: ConcurrentQueue<T>,
    pending: AtomicUsize,
    waker: Waker,
}

impl<T: Send> MpscQueue<T> {
    pub fn bounded(cap: usize) -> io::Result<MpscQueue<T>> {
        Ok(MpscQueue {
            inner: Arc::new(QueueInner {
                queue: ConcurrentQueue::bounded(cap),
                pending: AtomicUsize::new(0),
                waker: Waker::new()?,
            }),
        })
    }

    pub fn unbounded() -> io::Result<MpscQueue<T>> {
        Ok(MpscQueue {
            inner: Arc::new(QueueInner {
                queue: ConcurrentQueue::unbounded(),
                pending: AtomicUsize::new(0),
                waker: Waker::new()?,
            }),
        })
    }

    fn inc(&self) -> io::Result<()> {
        let cnt = self.inner.pending.fetch_add(1, Acquire);
        if cnt == 0 {
            self.inner.waker.wake()?;
        }
        Ok(())
    }

    fn dec(&self) -> io::Result<()> {
        let remaining = self.inner.pending.fetch_sub(1, AcqRel);
        if remaining == 1 {
            self.inner.waker.reset()?;
        }
        Ok(())
    }

    pub fn push(&self, value: T) -> Result<(), PushError<T>> {
        self.inner.queue.push(value).inspect(|_| {
            let _ = self.inc();
        })
    }

    pub fn pop(&self) -> Result<T, PopError> {
        self.inner.queue.pop().inspect(|_| {
            let _ = self.dec();
        })
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.is_empty()
    }

    pub fn waker(&self) -> &Waker {
        &self.inner.waker
    }
}

impl<T: Send> Clone for MpscQueue<T> {
    fn clone(&self) -> MpscQueue<T> {
        MpscQueue { inner: self.inner.clone() }
    }
}
