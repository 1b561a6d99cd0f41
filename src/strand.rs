//! §5 concurrency model: a per-socket serializer ensuring callbacks for a
//! given socket run one at a time and in submission order, even when
//! multiple driver threads observe readiness for it concurrently.
//!
//! Grounded on `plus::block_queue::BlockQueue`'s mutex-guarded intrusive
//! queue, adapted from a blocking consumer (`pop` parks the calling thread)
//! to a drain-flag design: the thread that finds the strand idle runs the
//! queued work itself instead of waking a dedicated consumer thread, since
//! a driver thread pool has no thread to spare for blocking.

use std::collections::VecDeque;
use std::sync::Mutex;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct StrandInner {
    queue: VecDeque<Job>,
    running: bool,
}

/// FIFO single-at-a-time serializer. Submitting a job while the strand is
/// idle runs it (and any jobs submitted while it runs) on the calling
/// thread; submitting while busy only enqueues, deferring execution to
/// whichever thread is currently draining.
pub struct Strand {
    inner: Mutex<StrandInner>,
}

impl Strand {
    pub fn new() -> Strand {
        Strand {
            inner: Mutex::new(StrandInner::default()),
        }
    }

    /// Submit `job` for execution on this strand. Never blocks: either the
    /// calling thread drains the strand inline, or the job is queued for a
    /// thread already draining it.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let mut guard = self.inner.lock().unwrap();
        guard.queue.push_back(Box::new(job));

        if guard.running {
            return;
        }
        guard.running = true;
        drop(guard);

        self.drain();
    }

    fn drain(&self) {
        loop {
            let next = {
                let mut guard = self.inner.lock().unwrap();
                match guard.queue.pop_front() {
                    Some(job) => job,
                    None => {
                        guard.running = false;
                        return;
                    }
                }
            };
            next();
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.lock().unwrap().running
    }
}

impl Default for Strand {
    fn default() -> Strand {
        Strand::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_in_submission_order() {
        let strand = Strand::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            strand.post(move || order.lock().unwrap().push(i));
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(strand.is_idle());
    }

    #[test]
    fn job_submitted_from_within_a_job_runs_after_current_drain() {
        let strand = Arc::new(Strand::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let strand2 = strand.clone();
        let order2 = order.clone();
        strand.post(move || {
            order2.lock().unwrap().push("outer");
            let order3 = order2.clone();
            strand2.post(move || order3.lock().unwrap().push("inner"));
        });

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn concurrent_posts_serialize_without_interleaving() {
        let strand = Arc::new(Strand::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let strand = strand.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                strand.post(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
