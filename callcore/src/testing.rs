//! In-memory mock implementations of the §6 consumed interfaces
//! ([`FilterStack`], [`CompletionQueue`], [`ByteStream`]), the same role
//! `ic-cdk-executor`'s testing harness plays for `ic-cdk`'s `CallFuture`
//! tests. [`MockFilterStack`] hands back the [`TransportCallbacks`] it
//! was given so a test can drive initial-metadata/message/complete
//! callbacks in whatever order a scenario calls for.

use std::sync::Mutex;

use crate::error::Status;
use crate::transport::{
    ByteStream, CompletionQueue, FilterStack, StreamContinuation, Tag, TransportCallbacks, TransportOpBatch,
};

/// Records every `end_op` posting, keyed by tag, for test assertions.
#[derive(Debug, Default)]
pub struct MockCompletionQueue {
    postings: Mutex<Vec<(Tag, Option<Status>)>>,
}

impl MockCompletionQueue {
    /// A completion queue with no postings yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every posting recorded so far, in posting order.
    pub fn postings(&self) -> Vec<(Tag, Option<Status>)> {
        self.postings.lock().unwrap().clone()
    }
}

impl CompletionQueue for MockCompletionQueue {
    fn begin_op(&self, _tag: Tag) {}

    fn end_op(&self, tag: Tag, error: Option<Status>) {
        self.postings.lock().unwrap().push((tag, error));
    }
}

/// A [`ByteStream`] over an in-memory buffer, available immediately (no
/// deferred continuation path) — sufficient to exercise [`crate::inbound`]
/// without a real transport.
#[derive(Debug)]
pub struct InMemoryByteStream {
    data: Vec<u8>,
    consumed: bool,
}

impl InMemoryByteStream {
    /// Wraps `data` as a stream that yields it whole, once.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            consumed: false,
        }
    }
}

impl ByteStream for InMemoryByteStream {
    fn length(&self) -> usize {
        self.data.len()
    }

    fn next(&mut self, _max_bytes: usize, _continuation: StreamContinuation) -> bool {
        true
    }

    fn pull(&mut self) -> Result<Vec<u8>, Status> {
        if self.consumed {
            return Ok(Vec::new());
        }
        self.consumed = true;
        Ok(std::mem::take(&mut self.data))
    }
}

/// A [`FilterStack`] that records whatever batch it is handed and lets a
/// test pull out the [`TransportCallbacks`] to drive by hand, rather than
/// simulating a real transport's asynchronous firing order.
pub struct MockFilterStack {
    last_batch: Mutex<Option<TransportOpBatch>>,
    last_callbacks: Mutex<Option<TransportCallbacks>>,
    init_result: Mutex<Result<(), Status>>,
}

impl std::fmt::Debug for MockFilterStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockFilterStack").finish()
    }
}

impl Default for MockFilterStack {
    fn default() -> Self {
        Self {
            last_batch: Mutex::new(None),
            last_callbacks: Mutex::new(None),
            init_result: Mutex::new(Ok(())),
        }
    }
}

impl MockFilterStack {
    /// A stack whose `init_call` succeeds and which records batches.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack whose `init_call` fails with `status`, for exercising
    /// [`crate::call::Call::create`]'s init-failure path.
    pub fn failing_init(status: Status) -> Self {
        let stack = Self::default();
        *stack.init_result.lock().unwrap() = Err(status);
        stack
    }

    /// Takes the callbacks handed to the most recent `start_transport_op`
    /// call, if any, consuming them so a test can invoke each exactly
    /// once, matching the real contract.
    pub fn take_callbacks(&self) -> Option<TransportCallbacks> {
        self.last_callbacks.lock().unwrap().take()
    }

    /// Takes the most recently submitted batch, for inspecting its
    /// sub-ops.
    pub fn take_last_batch(&self) -> Option<TransportOpBatch> {
        self.last_batch.lock().unwrap().take()
    }
}

impl FilterStack for MockFilterStack {
    fn init_call(&self) -> Result<(), Status> {
        self.init_result.lock().unwrap().clone()
    }

    fn start_transport_op(&self, batch: TransportOpBatch, callbacks: TransportCallbacks) {
        *self.last_batch.lock().unwrap() = Some(batch);
        *self.last_callbacks.lock().unwrap() = Some(callbacks);
    }
}
