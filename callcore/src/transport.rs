//! The filter/channel stack and transport are out of scope (§1) but the
//! core consumes a narrow interface from them (§6). This module defines
//! that interface as traits plus the concrete payload types the core
//! builds and hands across it; [`crate::testing`] provides an in-memory
//! implementation for tests.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Status;

/// An ordered metadata batch with a named-index side table (§6). Both the
/// application-visible metadata and the synthetic elements the core
/// injects (`grpc-status`, a chosen compression algorithm, ...) live here.
#[derive(Debug, Clone, Default)]
pub struct MetadataBatch {
    elements: Vec<(String, Vec<u8>)>,
    deadline: Option<Instant>,
}

impl MetadataBatch {
    /// An empty batch with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first value linked under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.elements
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_slice())
    }

    /// Removes and returns the first value linked under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Vec<u8>> {
        let idx = self.elements.iter().position(|(key, _)| key == name)?;
        Some(self.elements.remove(idx).1)
    }

    /// Links a new element onto the end of the batch.
    pub fn link(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.elements.push((name.into(), value.into()));
    }

    /// Iterates the batch's elements in link order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.elements.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of elements currently linked.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the batch has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Sets the deadline carried by this batch (send-side only; §4.10).
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// The deadline carried by this batch, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// A continuation the transport invokes once more bytes of a
/// [`ByteStream`] become available (§4.8, §6 `next(bytes, continuation)`).
pub type StreamContinuation = Box<dyn FnOnce() + Send>;

/// A byte-stream of known total length (§6). [`MessageReceiver`] pulls
/// slices from it until it is exhausted.
///
/// [`MessageReceiver`]: crate::inbound::MessageReceiver
pub trait ByteStream: Send + fmt::Debug {
    /// Total length of the stream, in bytes.
    fn length(&self) -> usize;

    /// Requests that at least one more slice (up to `max_bytes`) become
    /// available. Returns `true` if data is ready now (caller should call
    /// [`ByteStream::pull`] immediately); otherwise `continuation` is
    /// invoked later, once, when data is ready.
    fn next(&mut self, max_bytes: usize, continuation: StreamContinuation) -> bool;

    /// Pulls one ready slice. Must only be called after `next` indicated
    /// readiness (directly or via `continuation`).
    fn pull(&mut self) -> Result<Vec<u8>, Status>;
}

/// A tag identifying one pending completion-queue posting (§6).
pub type Tag = u64;

/// The completion queue a call may be bound to instead of a
/// caller-supplied continuation (§4.10 `set_completion_queue`, §6).
pub trait CompletionQueue: Send + Sync + fmt::Debug {
    /// Reserves `tag` for an upcoming posting.
    fn begin_op(&self, tag: Tag);

    /// Posts the completion for `tag`, at most once per tag.
    fn end_op(&self, tag: Tag, error: Option<Status>);
}

/// One sub-operation inside a single transport stream-op batch (§6).
#[derive(Debug)]
pub enum TransportSubOp {
    /// Send the initial outbound metadata batch.
    SendInitialMetadata(MetadataBatch),
    /// Send one message, as a byte-stream the transport pulls from.
    SendMessage(Box<dyn ByteStream>),
    /// Send the trailing metadata batch (close-from-client, or
    /// status-from-server).
    SendTrailingMetadata(MetadataBatch),
    /// Arm the initial-metadata-ready callback.
    RecvInitialMetadata,
    /// Arm the message-ready callback.
    RecvMessage,
    /// Arm the trailing-metadata/close callback.
    RecvTrailingMetadata,
    /// Request stats collection alongside the above.
    CollectStats,
    /// Cancel the underlying stream, carrying the cancellation status.
    CancelStream(Status),
}

/// A single transport-level stream operation, translated from a surface
/// batch (§4.4) or synthesized directly (cancellation, §4.9).
pub struct TransportOpBatch {
    /// The sub-ops making up this batch, order is not significant to the
    /// transport (§5: "transport callbacks may fire in any order").
    pub sub_ops: Vec<TransportSubOp>,
}

impl fmt::Debug for TransportOpBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOpBatch")
            .field("sub_ops", &self.sub_ops)
            .finish()
    }
}

/// A [`ByteStream`] over an in-memory buffer, already fully available.
/// Used to wrap an outbound `SEND_MESSAGE` payload (§4.4) before handing
/// it to the transport.
#[derive(Debug)]
pub struct SliceByteStream {
    data: Vec<u8>,
    consumed: bool,
}

impl SliceByteStream {
    /// Wraps `data` as a stream that yields it in one slice.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            consumed: false,
        }
    }
}

impl ByteStream for SliceByteStream {
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

/// The four independent continuations the filter stack yields per batch
/// (§6): initial-metadata-ready, message-ready, and trailing-metadata-ready
/// only fire if the batch armed the corresponding recv op; on-complete
/// always fires, exactly once, after every armed callback has.
pub struct TransportCallbacks {
    /// Fires once, if `RECV_INITIAL_METADATA` was armed.
    pub on_initial_metadata_ready: Option<Box<dyn FnOnce(MetadataBatch, Option<Status>) + Send>>,
    /// Fires once, if `RECV_MESSAGE` was armed.
    pub on_message_ready: Option<Box<dyn FnOnce(Option<Box<dyn ByteStream>>, Option<Status>) + Send>>,
    /// Fires once, if `RECV_TRAILING_METADATA` was armed (i.e. for
    /// `RECV_STATUS_ON_CLIENT` / `RECV_CLOSE_ON_SERVER`).
    pub on_trailing_metadata_ready: Option<Box<dyn FnOnce(MetadataBatch, Option<Status>) + Send>>,
    /// Fires once, always, after every armed callback above has fired.
    pub on_complete: Box<dyn FnOnce(Option<Status>) + Send>,
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCallbacks")
            .field("has_initial_metadata_ready", &self.on_initial_metadata_ready.is_some())
            .field("has_message_ready", &self.on_message_ready.is_some())
            .field("has_trailing_metadata_ready", &self.on_trailing_metadata_ready.is_some())
            .finish()
    }
}

/// The filter/channel stack and transport (§1, §6): out of scope to
/// implement, consumed only through this trait plus the callbacks it
/// drives back into [`crate::call::Call`].
pub trait FilterStack: Send + Sync + fmt::Debug {
    /// Initializes per-call transport state. Called once from
    /// [`crate::call::Call::create`].
    fn init_call(&self) -> Result<(), Status>;

    /// Hands one translated batch to the transport. The transport is
    /// responsible for eventually firing `callbacks`, asynchronously,
    /// from any thread, inside the call's combiner.
    fn start_transport_op(&self, batch: TransportOpBatch, callbacks: TransportCallbacks);
}
