//! A per-call FIFO serializer for entering a filter/transport stack.
//!
//! `callcore` funnels every piece of filter-stack interaction for a single
//! call through exactly one [`CallCombiner`] so that, even though surface
//! batches and transport callbacks arrive concurrently from arbitrary
//! threads, the stack itself only ever sees one caller at a time, in
//! enqueue order.
//!
//! This mirrors the role `ic-cdk-executor` plays for `ic-cdk`'s
//! `CallFuture`: a small, separately-versioned crate the call object
//! depends on rather than implements itself. Unlike `ic-cdk-executor`,
//! which schedules cooperative, single-threaded, thread-local tasks (a
//! WASM canister has no real threads), this combiner must admit genuine
//! concurrent callers, so its queue and "currently running" flag are
//! guarded with [`std::sync::Mutex`] and [`std::sync::atomic::AtomicBool`]
//! instead of `thread_local!`/`RefCell`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A type-erased error handed to a queued continuation or a cancel hook.
pub type CombinerError = Arc<dyn std::error::Error + Send + Sync>;

/// Work queued on a combiner. Runs once, on whichever thread happens to be
/// draining the queue when its turn comes up.
pub type Continuation = Box<dyn FnOnce(Option<CombinerError>) + Send>;

/// The contract the core requires of a per-call serializer (§4.2).
///
/// All three operations may be called from any thread. `start` and `stop`
/// always come in matched pairs from the continuation's own perspective:
/// a continuation that was started keeps the combiner until it calls
/// `stop`, even if that happens long after `start` returns (e.g. after an
/// asynchronous transport callback fires).
pub trait CallCombiner: Send + Sync + fmt::Debug {
    /// Enqueue `continuation`. Runs in FIFO order, one at a time. If the
    /// combiner is idle, `continuation` runs before `start` returns.
    fn start(&self, continuation: Continuation, error: Option<CombinerError>, reason: &'static str);

    /// Release the combiner from the continuation currently running,
    /// allowing the next queued continuation (if any) to start.
    fn stop(&self, reason: &'static str);

    /// Record a cancellation error. If a "notify on cancel" continuation
    /// is currently registered, invoke it now with `error`; otherwise the
    /// next call to [`CallCombiner::set_notify_on_cancel`] invokes
    /// immediately.
    fn cancel(&self, error: CombinerError);

    /// Register a continuation to be invoked the moment the combiner is
    /// cancelled. If already cancelled, invokes immediately.
    fn set_notify_on_cancel(&self, continuation: Continuation);
}

struct QueuedItem {
    continuation: Continuation,
    error: Option<CombinerError>,
    reason: &'static str,
}

/// Default multi-threaded [`CallCombiner`].
///
/// A `VecDeque` of pending work drained one item at a time, generalized to
/// cross-thread use: `running` takes the place of a single
/// mutable-borrow-of-the-queue invariant, enforced here with an atomic
/// flag plus a queue mutex rather than `thread_local!`.
pub struct FifoCombiner {
    queue: Mutex<VecDeque<QueuedItem>>,
    running: AtomicBool,
    notify_on_cancel: Mutex<Option<Continuation>>,
    cancelled: Mutex<Option<CombinerError>>,
}

impl fmt::Debug for FifoCombiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FifoCombiner")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("queue_len", &self.queue.lock().unwrap().len())
            .finish()
    }
}

impl Default for FifoCombiner {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoCombiner {
    /// Creates an idle combiner.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            notify_on_cancel: Mutex::new(None),
            cancelled: Mutex::new(None),
        }
    }
}

impl CallCombiner for FifoCombiner {
    fn start(&self, continuation: Continuation, error: Option<CombinerError>, reason: &'static str) {
        let item = QueuedItem {
            continuation,
            error,
            reason,
        };
        // Only the caller that flips `running` false->true may execute
        // immediately; everyone else just enqueues and relies on a future
        // `stop()` to pop them.
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!(reason, "combiner: starting continuation immediately");
            (item.continuation)(item.error);
        } else {
            tracing::trace!(reason, "combiner: queuing continuation");
            self.queue.lock().unwrap().push_back(item);
        }
    }

    fn stop(&self, reason: &'static str) {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(item) => {
                tracing::trace!(reason, "combiner: stop, running next queued continuation");
                (item.continuation)(item.error);
            }
            None => {
                tracing::trace!(reason, "combiner: stop, queue empty, going idle");
                self.running.store(false, Ordering::Release);
            }
        }
    }

    fn cancel(&self, error: CombinerError) {
        *self.cancelled.lock().unwrap() = Some(error.clone());
        if let Some(continuation) = self.notify_on_cancel.lock().unwrap().take() {
            continuation(Some(error));
        }
    }

    fn set_notify_on_cancel(&self, continuation: Continuation) {
        let already_cancelled = self.cancelled.lock().unwrap().clone();
        match already_cancelled {
            Some(error) => continuation(Some(error)),
            None => {
                *self.notify_on_cancel.lock().unwrap() = Some(continuation);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Debug)]
    struct BoomError;
    impl fmt::Display for BoomError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }
    impl std::error::Error for BoomError {}

    #[test]
    fn runs_single_continuation_immediately() {
        let combiner = FifoCombiner::new();
        let (tx, rx) = mpsc::channel();
        combiner.start(
            Box::new(move |_err| tx.send(()).unwrap()),
            None,
            "test",
        );
        rx.try_recv().expect("continuation ran synchronously");
    }

    #[test]
    fn queues_second_start_until_stop() {
        let combiner = Arc::new(FifoCombiner::new());
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        combiner.start(Box::new(move |_| tx1.send(1).unwrap()), None, "first");
        rx1.try_recv().unwrap();
        // first continuation "holds" the combiner until it calls stop().
        combiner.start(Box::new(move |_| tx2.send(2).unwrap()), None, "second");
        assert!(rx2.try_recv().is_err(), "second must not run until stop()");
        combiner.stop("first done");
        assert_eq!(rx2.try_recv().unwrap(), 2);
    }

    #[test]
    fn fifo_order_preserved_across_many_queued_items() {
        let combiner = Arc::new(FifoCombiner::new());
        let (tx, rx) = mpsc::channel();
        let tx0 = tx.clone();
        combiner.start(Box::new(move |_| tx0.send(0).unwrap()), None, "0");
        for i in 1..5 {
            let txi = tx.clone();
            combiner.start(Box::new(move |_| txi.send(i).unwrap()), None, "n");
        }
        for expected in 0..5 {
            if expected > 0 {
                combiner.stop("advance");
            }
            assert_eq!(rx.recv().unwrap(), expected);
        }
    }

    #[test]
    fn cancel_wakes_pending_notify_hook() {
        let combiner = FifoCombiner::new();
        let (tx, rx) = mpsc::channel();
        combiner.set_notify_on_cancel(Box::new(move |err| {
            tx.send(err.is_some()).unwrap();
        }));
        combiner.cancel(Arc::new(BoomError));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn notify_on_cancel_after_cancel_fires_immediately() {
        let combiner = FifoCombiner::new();
        combiner.cancel(Arc::new(BoomError));
        let (tx, rx) = mpsc::channel();
        combiner.set_notify_on_cancel(Box::new(move |err| {
            tx.send(err.is_some()).unwrap();
        }));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn concurrent_starts_from_multiple_threads_never_run_together() {
        let combiner = Arc::new(FifoCombiner::new());
        let active = Arc::new(AtomicBool::new(false));
        let overlap = Arc::new(AtomicBool::new(false));
        let mut handles = vec![];
        for _ in 0..8 {
            let combiner = combiner.clone();
            let active = active.clone();
            let overlap = overlap.clone();
            handles.push(thread::spawn(move || {
                let active = active.clone();
                let overlap = overlap.clone();
                combiner.start(
                    Box::new(move |_| {
                        if active.swap(true, Ordering::SeqCst) {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        thread::yield_now();
                        active.store(false, Ordering::SeqCst);
                    }),
                    None,
                    "concurrent",
                );
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // Drain anything left queued (whichever thread didn't win start()'s race).
        loop {
            let len = {
                let q = combiner.queue.lock().unwrap();
                q.len()
            };
            if len == 0 {
                break;
            }
            combiner.stop("drain");
        }
        assert!(!overlap.load(Ordering::SeqCst));
    }
}
