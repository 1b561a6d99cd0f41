//! Components H/I/J: the three socket state machines built on top of
//! [`crate::chronology`], [`crate::queue`], [`crate::flow`], and
//! [`crate::shutdown`]. Each socket type owns its state under a single
//! mutex per §5's shared-resource policy and drives an abstract transport
//! trait (`DatagramIo`/`StreamIo`/`ListenerIo`) so the state machine logic
//! here never depends on a concrete poller.

pub mod datagram;
pub mod listener;
pub mod stream;

pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

use std::sync::Mutex;

/// A single callback slot that fires at most once, resolving the §9 Open
/// Question on simultaneous success/cancellation races: both paths call
/// [`fire`](Self::fire), but only the first to acquire the slot's lock and
/// find it occupied actually invokes the callback.
pub(crate) struct CallbackSlot<T> {
    slot: Mutex<Option<Box<dyn FnOnce(T) + Send>>>,
}

impl<T> CallbackSlot<T> {
    pub fn empty() -> CallbackSlot<T> {
        CallbackSlot { slot: Mutex::new(None) }
    }

    pub fn set(&self, callback: Box<dyn FnOnce(T) + Send>) {
        *self.slot.lock().unwrap() = Some(callback);
    }

    /// Invoke the held callback with `value`, if one is still present.
    /// A concurrent `fire` for the same logical event is a no-op.
    pub fn fire(&self, value: T) {
        let callback = self.slot.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(value);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_exactly_once_under_concurrent_attempts() {
        let slot = Arc::new(CallbackSlot::empty());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        slot.set(Box::new(move |_: ()| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            handles.push(std::thread::spawn(move || slot.fire(())));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unarmed_slot_fire_is_noop() {
        let slot: CallbackSlot<()> = CallbackSlot::empty();
        slot.fire(());
        assert!(!slot.is_armed());
    }
}
