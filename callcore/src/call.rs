//! The `Call` data model and lifecycle (§3, §4.10): the entity every other
//! module in this crate operates on.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use callcore_combiner::CallCombiner;

use crate::batch::{BatchControl, BatchTranslator, Completion, SurfaceOp, TranslateOutcome, MAX_SEND_EXTRA_METADATA};
use crate::error::{ArbiterSource, BatchSubmitStatus, CallError, Status, StatusCode};
use crate::inbound::{InboundRaceGate, InitialMetadataAction, MessageReadyAction, MessageReceiver, PendingMessage, ReceivedMessage};
use crate::metadata::{self, CompressionAlgorithm, CompressionBitset, EnabledCompression};
use crate::parent_child::{self, ChildLink, ParentCall, ParentRecordCell, PropagationMask};
use crate::status::StatusArbiter;
use crate::transport::{ByteStream, CompletionQueue, FilterStack, MetadataBatch, Tag, TransportCallbacks, TransportOpBatch};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// The six per-flag booleans from §3's data model, each monotonic
/// false→true for one-shot ops (`SentInitialMetadata`, `SentFinalOp`,
/// `ReceivedInitialMetadata`, `RequestedFinalOp`) and reset back to false
/// on batch completion for the two slots a streamed call may reuse
/// (`SendingMessage`, `ReceivingMessage`) — see [`BatchControl`]'s
/// `reusable_flags`.
///
/// [`BatchControl`]: crate::batch::BatchControl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    /// `sent_initial_metadata`.
    SentInitialMetadata,
    /// `sending_message`.
    SendingMessage,
    /// `sent_final_op`.
    SentFinalOp,
    /// `received_initial_metadata`.
    ReceivedInitialMetadata,
    /// `receiving_message`.
    ReceivingMessage,
    /// `requested_final_op`.
    RequestedFinalOp,
}

impl FlagKind {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        self as usize
    }
}

/// Which of the small fixed set of per-call context kinds a slot belongs
/// to (§9 "per-call context slots"). The slot kinds named here are the
/// ones this crate defines; the array itself is ambient plumbing any
/// context-carrying call object needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Distributed-tracing span context.
    Tracing,
    /// Census/stats accumulator context.
    Stats,
    /// Security/auth context (peer identity, credentials).
    Security,
    /// Cost-attribution context for load reporting.
    LoadReportingCostContext,
    /// Reserved for a future slot kind.
    Reserved,
}

impl ContextKind {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        self as usize
    }
}

/// One per-call context slot: an opaque value plus an optional destructor,
/// run when the slot is overwritten or the call is destroyed (§9). The
/// destructor takes no arguments — a deliberate simplification of the
/// original's `(value, destroy_fn(value))` pair, since the value's own
/// `Drop` (through `Box<dyn Any + Send>`) already does the job a
/// value-taking destructor would; only *additional* teardown (e.g.
/// decrementing an external counter) needs a callback at all.
pub struct ContextSlot {
    /// The opaque value stored in this slot.
    pub value: Box<dyn Any + Send>,
    destructor: Option<Box<dyn FnOnce() + Send>>,
}

impl ContextSlot {
    /// A slot holding `value`, with no extra teardown.
    pub fn new(value: Box<dyn Any + Send>) -> Self {
        Self {
            value,
            destructor: None,
        }
    }

    /// A slot holding `value`, running `destructor` when cleared.
    pub fn with_destructor(value: Box<dyn Any + Send>, destructor: impl FnOnce() + Send + 'static) -> Self {
        Self {
            value,
            destructor: Some(Box::new(destructor)),
        }
    }
}

impl Drop for ContextSlot {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.take() {
            destructor();
        }
    }
}

/// The channel-level knobs §3/§4.10 leave to "the channel": enabled
/// compression algorithms, the default outbound level, and an arena
/// size-estimate hint. Constructed in-process by the owning channel; no
/// file format, no `serde` (§1.3).
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Algorithms the channel will negotiate at all.
    pub enabled_compression: CompressionBitset,
    /// The level applied when an op doesn't specify one explicitly.
    pub default_outbound_compression: CompressionAlgorithm,
    /// A size hint for the call's backing allocation; purely advisory
    /// here, since this crate doesn't implement the arena allocator
    /// itself (§1's "byte-stream / byte-buffer abstractions... out of
    /// scope").
    pub arena_size_hint: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            enabled_compression: CompressionBitset::identity_only(),
            default_outbound_compression: CompressionAlgorithm::Identity,
            arena_size_hint: 4096,
        }
    }
}

/// Arguments to [`Call::create`] (§4.10).
pub struct CallCreateArgs {
    /// Whether this is a client call (`false` means server).
    pub is_client: bool,
    /// The parent call, if this call should attach to one (client calls
    /// with a server parent only, §4.3).
    pub parent: Option<Arc<Call>>,
    /// What to propagate from `parent`, if any.
    pub propagation_mask: PropagationMask,
    /// The per-call serializer.
    pub combiner: Arc<dyn CallCombiner>,
    /// The filter/transport stack.
    pub filter_stack: Arc<dyn FilterStack>,
    /// Channel-level configuration.
    pub config: ChannelConfig,
    /// Up to [`MAX_SEND_EXTRA_METADATA`] extra initial-metadata elements
    /// the client wants linked ahead of application metadata (e.g. the
    /// `:path` pseudo-header); ignored on a server call.
    pub initial_send_extra_metadata: Vec<(String, Vec<u8>)>,
    /// The deadline to put into the first outbound metadata batch.
    pub deadline: Option<Instant>,
}

/// The per-call RPC state machine (§3). Exclusively owns everything
/// listed in §3's data model except the arena allocator and filter-stack
/// storage, which are the transport's concern per §1.
pub struct Call {
    id: u64,
    is_client: bool,
    config: ChannelConfig,
    combiner: Arc<dyn CallCombiner>,
    filter_stack: Arc<dyn FilterStack>,

    send_deadline: Mutex<Option<Instant>>,
    send_extra_metadata: Mutex<Vec<(String, Vec<u8>)>>,
    peer_string: Mutex<Option<String>>,
    context: [Mutex<Option<ContextSlot>>; ContextKind::COUNT],
    completion_queue: OnceLock<Arc<dyn CompletionQueue>>,

    flags: [AtomicBool; FlagKind::COUNT],
    any_ops_sent: AtomicBool,
    received_final_op: AtomicBool,
    cancel_issued: AtomicBool,

    status_arbiter: StatusArbiter,
    race_gate: InboundRaceGate,
    inbound_compression: Mutex<Option<CompressionAlgorithm>>,
    encodings_accepted_by_peer: Mutex<CompressionBitset>,

    /// Diagnostic mirrors of what the application would normally read
    /// through a channel-owned surface API (out of scope per §1); kept so
    /// this crate's own tests can observe the effect of processing.
    received_initial_metadata: Mutex<Option<MetadataBatch>>,
    received_message: Mutex<Option<ReceivedMessage>>,

    parent_link: Mutex<Option<ChildLink>>,
    parent_record: ParentRecordCell,

    external_refcount: AtomicUsize,
    internal_refcount: AtomicUsize,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("is_client", &self.is_client)
            .field("any_ops_sent", &self.any_ops_sent.load(Ordering::Relaxed))
            .field("received_final_op", &self.received_final_op.load(Ordering::Relaxed))
            .field("external_refcount", &self.external_refcount.load(Ordering::Relaxed))
            .field("internal_refcount", &self.internal_refcount.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        // Cleared in reverse, per §9 "per-call context slots".
        for slot in self.context.iter().rev() {
            drop(slot.lock().unwrap().take());
        }
    }
}

impl Call {
    /// Allocates and initializes a call (§4.10 `create`). Attaches to
    /// `args.parent` if present, applies the propagation mask, and asks
    /// the filter stack to initialize. On init failure, cancels with the
    /// composite init error (source=SURFACE) and returns it; the call
    /// itself is still usable (its combiner and arbiter are live) but
    /// will observe itself as cancelled.
    pub fn create(args: CallCreateArgs) -> Result<Arc<Call>, CallError> {
        let id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("call", call_id = id, is_client = args.is_client);
        let _entered = span.enter();

        let mut extra = args.initial_send_extra_metadata;
        extra.truncate(MAX_SEND_EXTRA_METADATA);

        let call = Arc::new(Call {
            id,
            is_client: args.is_client,
            config: args.config,
            combiner: args.combiner,
            filter_stack: args.filter_stack,
            send_deadline: Mutex::new(args.deadline),
            send_extra_metadata: Mutex::new(extra),
            peer_string: Mutex::new(None),
            context: std::array::from_fn(|_| Mutex::new(None)),
            completion_queue: OnceLock::new(),
            flags: std::array::from_fn(|_| AtomicBool::new(false)),
            any_ops_sent: AtomicBool::new(false),
            received_final_op: AtomicBool::new(false),
            cancel_issued: AtomicBool::new(false),
            status_arbiter: StatusArbiter::new(),
            race_gate: InboundRaceGate::new(),
            inbound_compression: Mutex::new(None),
            encodings_accepted_by_peer: Mutex::new(CompressionBitset::identity_only()),
            received_initial_metadata: Mutex::new(None),
            received_message: Mutex::new(None),
            parent_link: Mutex::new(None),
            parent_record: OnceLock::new(),
            external_refcount: AtomicUsize::new(1),
            internal_refcount: AtomicUsize::new(1),
        });

        let mut needs_immediate_cancel = false;
        if let Some(parent) = &args.parent {
            match parent_child::attach(parent, &call, args.propagation_mask) {
                Ok(immediate) => needs_immediate_cancel = immediate,
                Err(error) => return Err(error),
            }
        }

        if let Err(status) = call.filter_stack.init_call() {
            let error = CallError::InitFailure(vec![Arc::new(CallError::Transport(status))]);
            call.cancel_with_error(ArbiterSource::Surface, error.clone());
            return Err(error);
        }

        if needs_immediate_cancel {
            call.cancel_with_error(
                ArbiterSource::ApiOverride,
                CallError::Cancelled(Status::explicit(StatusCode::CANCELLED, None)),
            );
        }

        Ok(call)
    }

    /// This call's arena-assigned id, used only for tracing/diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this is a client call.
    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Whether this is a server call.
    pub fn is_server(&self) -> bool {
        !self.is_client
    }

    /// Binds `cq`, exactly once (§6 `set_completion_queue`).
    pub fn set_completion_queue(&self, cq: Arc<dyn CompletionQueue>) -> Result<(), CallError> {
        self.completion_queue.set(cq).map_err(|_| {
            CallError::Transport(Status::explicit(
                StatusCode::INTERNAL,
                Some("completion queue already bound".into()),
            ))
        })
    }

    /// Stores `slot` (running the previous occupant's destructor, if any)
    /// in the context slot for `kind` (§6 `context_set`).
    pub fn context_set(&self, kind: ContextKind, slot: ContextSlot) {
        *self.context[kind.index()].lock().unwrap() = Some(slot);
    }

    /// Looks up the context slot for `kind` and, if present, hands its
    /// value to `f` (§6 `context_get`). Returning a reference directly
    /// isn't possible past the lock guard, so lookups are done via
    /// callback rather than an `Option<&dyn Any>`.
    pub fn context_get<R>(&self, kind: ContextKind, f: impl FnOnce(&(dyn Any + Send)) -> R) -> Option<R> {
        let guard = self.context[kind.index()].lock().unwrap();
        guard.as_ref().map(|slot| f(slot.value.as_ref()))
    }

    /// The peer's address/identity, if known (§6 `get_peer`).
    pub fn get_peer(&self) -> String {
        self.peer_string.lock().unwrap().clone().unwrap_or_default()
    }

    /// Sets the peer string, replacing any previous value (§5 `peer_string`
    /// "atomic pointer; prior value is freed only on destruction" —
    /// reimplemented here as a plain [`Mutex`], since safe Rust's ordinary
    /// drop-on-overwrite already frees the prior value exactly once with
    /// no reader able to observe a freed value, which is the guarantee the
    /// original's atomic-pointer contract exists to provide).
    pub fn set_peer(&self, peer: impl Into<String>) {
        *self.peer_string.lock().unwrap() = Some(peer.into());
    }

    pub(crate) fn send_deadline(&self) -> Option<Instant> {
        *self.send_deadline.lock().unwrap()
    }

    pub(crate) fn default_outbound_compression(&self) -> CompressionAlgorithm {
        self.config.default_outbound_compression
    }

    pub(crate) fn encodings_accepted_by_peer(&self) -> CompressionBitset {
        *self.encodings_accepted_by_peer.lock().unwrap()
    }

    pub(crate) fn take_send_extra_metadata(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut self.send_extra_metadata.lock().unwrap())
    }

    pub(crate) fn set_flag_once(&self, flag: FlagKind) -> bool {
        self.flags[flag.index()]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn reset_flag(&self, flag: FlagKind) {
        self.flags[flag.index()].store(false, Ordering::Release);
    }

    pub(crate) fn mark_any_ops_sent(&self) {
        self.any_ops_sent.store(true, Ordering::Release);
    }

    fn any_ops_sent(&self) -> bool {
        self.any_ops_sent.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cancel_issued(&self) {
        self.cancel_issued.store(true, Ordering::Release);
    }

    pub(crate) fn has_cancelled(&self) -> bool {
        self.cancel_issued.load(Ordering::Acquire)
    }

    pub(crate) fn status_arbiter(&self) -> &StatusArbiter {
        &self.status_arbiter
    }

    pub(crate) fn combiner(&self) -> &Arc<dyn CallCombiner> {
        &self.combiner
    }

    pub(crate) fn filter_stack(&self) -> &Arc<dyn FilterStack> {
        &self.filter_stack
    }

    pub(crate) fn set_parent_link(&self, link: ChildLink) {
        *self.parent_link.lock().unwrap() = Some(link);
    }

    pub(crate) fn take_parent_link(&self) -> Option<ChildLink> {
        self.parent_link.lock().unwrap().take()
    }

    pub(crate) fn parent_record_cell(&self) -> &ParentRecordCell {
        &self.parent_record
    }

    pub(crate) fn parent_record_if_present(&self) -> Option<&ParentCall> {
        self.parent_record.get()
    }

    /// Whether this call has already observed its own final op (§4.3
    /// `received_final_op`, read by [`parent_child::attach`] to decide
    /// whether a newly-attached child needs immediate cancellation).
    pub(crate) fn received_final_op(&self) -> bool {
        self.received_final_op.load(Ordering::Acquire)
    }

    /// Transitions `received_final_op` to true and fans cancellation out
    /// to children (§4.9). Invoked once, from the batch that reports the
    /// call's final status.
    pub(crate) fn on_trailing_metadata_complete(self: &Arc<Self>) {
        self.received_final_op.store(true, Ordering::Release);
        parent_child::on_parent_final_op(self);
    }

    /// Acquires an internal reference, keeping the call's storage alive
    /// across an in-flight asynchronous operation (§3 "internal
    /// refcount").
    pub(crate) fn internal_ref(self: &Arc<Self>) {
        self.internal_refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases an internal reference. Transport-owned storage teardown
    /// is the transport's concern (§1), not this crate's; reaching zero
    /// here is logged only.
    pub(crate) fn internal_unref(self: &Arc<Self>) {
        let previous = self.internal_refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "call: internal_unref called too many times");
        if previous == 1 {
            tracing::debug!(call_id = self.id, "call: internal refcount reached zero");
        }
    }

    /// Cancels this call, attributing the status to `source` (§4.9).
    pub(crate) fn cancel_with_error(self: &Arc<Self>, source: ArbiterSource, error: CallError) {
        crate::cancel::cancel_with_error(self, source, error);
    }

    /// The arbiter's current selection (§4.1). Stable once all relevant
    /// sources have recorded; may change before then.
    pub fn final_status(&self) -> Status {
        self.status_arbiter.final_status(self.is_client)
    }

    /// On the server, "cancelled" is a boolean derived from the arbiter's
    /// selection being non-OK (§7).
    pub fn is_cancelled(&self) -> bool {
        self.final_status().code() != StatusCode::OK
    }

    /// The last message [`MessageReceiver`] assembled, if any — a
    /// diagnostic mirror of what the application would read through the
    /// channel's surface API.
    pub fn last_received_message(&self) -> Option<ReceivedMessage> {
        self.received_message.lock().unwrap().clone()
    }

    /// The last initial-metadata batch published to the application,
    /// after [`metadata::filter_initial`] removed the compression-related
    /// elements.
    pub fn last_received_initial_metadata(&self) -> Option<MetadataBatch> {
        self.received_initial_metadata.lock().unwrap().clone()
    }

    /// Surface `cancel()` (§6): cancels with a bare CANCELLED status,
    /// attributed to API_OVERRIDE.
    pub fn cancel(self: &Arc<Self>) {
        self.cancel_with_error(
            ArbiterSource::ApiOverride,
            CallError::Cancelled(Status::explicit(StatusCode::CANCELLED, None)),
        );
    }

    /// Surface `cancel_with_status(code, description)` (§6).
    pub fn cancel_with_status(self: &Arc<Self>, code: StatusCode, description: impl Into<String>) {
        crate::cancel::cancel_with_status(self, ArbiterSource::ApiOverride, code, description);
    }

    /// Adds an external reference (§6 `ref`).
    pub fn ref_external(self: &Arc<Self>) {
        self.external_refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Releases an external reference (§6 `unref`). On the last external
    /// unref: detaches from any parent, clears the combiner's
    /// notify-on-cancel hook, issues a cancel if ops were sent but the
    /// call never completed, then drops the internal "destroy" reference
    /// acquired at [`Call::create`].
    pub fn unref_external(self: &Arc<Self>) {
        let previous = self.external_refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "call: unref_external called too many times");
        if previous != 1 {
            return;
        }
        parent_child::detach(self);
        self.combiner.set_notify_on_cancel(Box::new(|_| {}));
        if self.any_ops_sent() && !self.received_final_op() {
            self.cancel_with_error(
                ArbiterSource::ApiOverride,
                CallError::Cancelled(Status::explicit(StatusCode::CANCELLED, None)),
            );
        }
        self.internal_unref();
    }

    /// Surface `start_batch(ops, tag)` (§6): posts to the bound
    /// completion queue.
    pub fn start_batch(self: &Arc<Self>, ops: Vec<SurfaceOp>, tag: Tag) -> BatchSubmitStatus {
        let Some(cq) = self.completion_queue.get().cloned() else {
            return BatchSubmitStatus::Error;
        };
        cq.begin_op(tag);
        self.dispatch(ops, Completion::Queue { cq, tag })
    }

    /// Surface `start_batch_and_execute(ops, continuation)` (§6): invokes
    /// `continuation` on completion instead of posting to a queue.
    pub fn start_batch_and_execute(
        self: &Arc<Self>,
        ops: Vec<SurfaceOp>,
        continuation: impl FnOnce(Status) + Send + 'static,
    ) -> BatchSubmitStatus {
        self.dispatch(ops, Completion::Continuation(Mutex::new(Some(Box::new(continuation)))))
    }

    fn dispatch(self: &Arc<Self>, ops: Vec<SurfaceOp>, completion: Completion) -> BatchSubmitStatus {
        match BatchTranslator::translate(self, ops, completion) {
            Ok(TranslateOutcome::CompletedImmediately) => BatchSubmitStatus::Ok,
            Ok(TranslateOutcome::Dispatch(bctl, batch)) => {
                self.dispatch_through_combiner(bctl, batch);
                BatchSubmitStatus::Ok
            }
            Err((status, error)) => {
                tracing::debug!(?status, %error, "call: batch submission rejected");
                status
            }
        }
    }

    fn dispatch_through_combiner(self: &Arc<Self>, bctl: Arc<BatchControl>, batch: TransportOpBatch) {
        let call = self.clone();
        self.combiner.start(
            Box::new(move |_cancel_error| {
                let callbacks = call.build_callbacks(bctl);
                call.filter_stack.start_transport_op(batch, callbacks);
            }),
            None,
            "start_batch dispatch",
        );
    }

    fn build_callbacks(self: &Arc<Self>, bctl: Arc<BatchControl>) -> TransportCallbacks {
        let call_initial = self.clone();
        let bctl_initial = bctl.clone();
        let call_message = self.clone();
        let bctl_message = bctl.clone();
        let call_trailing = self.clone();
        let bctl_trailing = bctl.clone();
        let call_complete = self.clone();
        TransportCallbacks {
            on_initial_metadata_ready: Some(Box::new(move |metadata, error| {
                call_initial.handle_initial_metadata_ready(bctl_initial, metadata, error);
            })),
            on_message_ready: Some(Box::new(move |stream, error| {
                call_message.handle_message_ready(bctl_message, stream, error);
            })),
            on_trailing_metadata_ready: Some(Box::new(move |metadata, error| {
                call_trailing.handle_trailing_metadata_ready(bctl_trailing, metadata, error);
            })),
            on_complete: Box::new(move |_error| {
                call_complete.combiner.stop("batch on_complete");
                bctl.complete_step();
            }),
        }
    }

    /// §4.5 `initial_metadata_ready`: runs MetadataFilters and §4.7
    /// validation, then resolves the race gate.
    fn handle_initial_metadata_ready(self: &Arc<Self>, bctl: Arc<BatchControl>, mut metadata: MetadataBatch, error: Option<Status>) {
        match error {
            Some(status) => {
                // A transport-level delivery error does not cancel the
                // call; the batch carries the failure (§4.5 step 1).
                bctl.record_error_no_cancel(CallError::Transport(status));
            }
            None => {
                let outcome = metadata::filter_initial(&mut metadata);
                match metadata::validate_compression(&outcome, EnabledCompression(self.config.enabled_compression)) {
                    Ok(composite) => {
                        *self.inbound_compression.lock().unwrap() = Some(composite);
                        *self.encodings_accepted_by_peer.lock().unwrap() = outcome.encodings_accepted_by_peer;
                    }
                    Err(validation_error) => {
                        // §4.7: compression validation failures DO cancel
                        // the call, unlike a bare delivery error above.
                        self.cancel_with_error(ArbiterSource::Surface, validation_error);
                    }
                }
                *self.received_initial_metadata.lock().unwrap() = Some(metadata);
            }
        }

        match self.race_gate.on_initial_metadata_ready() {
            InitialMetadataAction::NoMessagePending => {}
            InitialMetadataAction::ProcessDeferredMessage(pending) => {
                self.process_pending_message(pending);
            }
        }

        bctl.complete_step();
    }

    /// §4.5 `message_ready`: on error or a missing stream, propagates the
    /// error and cancels (source=SURFACE) without touching the race gate
    /// at all; otherwise resolves the race.
    fn handle_message_ready(self: &Arc<Self>, bctl: Arc<BatchControl>, stream: Option<Box<dyn ByteStream>>, error: Option<Status>) {
        if error.is_some() || stream.is_none() {
            let status = error.unwrap_or_else(|| Status::explicit(StatusCode::INTERNAL, Some("message stream missing".into())));
            bctl.record_error(CallError::Transport(status.clone()));
            self.cancel_with_error(ArbiterSource::Surface, CallError::Transport(status));
            bctl.complete_step();
            return;
        }

        let pending = PendingMessage {
            bctl,
            stream,
            error: None,
        };
        match self.race_gate.on_message_ready(pending) {
            MessageReadyAction::Defer => {}
            MessageReadyAction::ProcessNow(pending) => self.process_pending_message(pending),
        }
    }

    /// §4.6 "Trailing": decodes and removes `grpc-status`/`grpc-message`,
    /// recording a non-OK status on the arbiter with `source=WIRE`.
    /// Fires for `RECV_STATUS_ON_CLIENT` / `RECV_CLOSE_ON_SERVER`.
    fn handle_trailing_metadata_ready(self: &Arc<Self>, bctl: Arc<BatchControl>, mut metadata: MetadataBatch, error: Option<Status>) {
        match error {
            Some(status) => {
                bctl.record_error(CallError::Transport(status));
            }
            None => {
                if let Some(status) = metadata::filter_trailing(&mut metadata) {
                    self.status_arbiter.record(ArbiterSource::Wire, status);
                }
            }
        }
        bctl.complete_step();
    }

    /// Reads a deferred-or-immediate message to completion via
    /// [`MessageReceiver`] (§4.8), then completes the batch's
    /// message-arming step exactly once.
    fn process_pending_message(self: &Arc<Self>, pending: PendingMessage) {
        let PendingMessage { bctl, stream, .. } = pending;
        let Some(stream) = stream else {
            bctl.complete_step();
            return;
        };

        let message_algorithm = self.inbound_compression.lock().unwrap().unwrap_or(CompressionAlgorithm::Identity);
        let call = self.clone();
        MessageReceiver::receive(stream, false, message_algorithm, move |result| {
            match result {
                Ok(received) => {
                    *call.received_message.lock().unwrap() = Some(received);
                }
                Err(status) => {
                    bctl.record_error(CallError::Transport(status));
                }
            }
            bctl.complete_step();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SurfaceOp;
    use crate::testing::{InMemoryByteStream, MockCompletionQueue, MockFilterStack};
    use callcore_combiner::FifoCombiner;

    fn new_call(is_client: bool, filter_stack: Arc<MockFilterStack>) -> Arc<Call> {
        Call::create(CallCreateArgs {
            is_client,
            parent: None,
            propagation_mask: PropagationMask::NONE,
            combiner: Arc::new(FifoCombiner::new()),
            filter_stack,
            config: ChannelConfig::default(),
            initial_send_extra_metadata: Vec::new(),
            deadline: None,
        })
        .expect("call creation should succeed against a healthy mock stack")
    }

    #[test]
    fn scenario_1_empty_batch_completes_immediately_with_ok_no_filter_stack_entry() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq.clone()).unwrap();

        let status = call.start_batch(Vec::new(), 42);
        assert_eq!(status, BatchSubmitStatus::Ok);
        assert_eq!(cq.postings(), vec![(42, None)]);
        assert!(stack.take_last_batch().is_none(), "empty batch must not reach the filter stack");
    }

    #[test]
    fn scenario_2_duplicate_send_initial_metadata_is_too_many_operations() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq).unwrap();

        let first = call.start_batch(
            vec![SurfaceOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
                compression_level: None,
            }],
            1,
        );
        assert_eq!(first, BatchSubmitStatus::Ok);

        let second = call.start_batch(
            vec![SurfaceOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
                compression_level: None,
            }],
            2,
        );
        assert_eq!(second, BatchSubmitStatus::TooManyOperations);
        assert!(
            !call.set_flag_once(FlagKind::SentInitialMetadata),
            "the flag must remain set (unchanged) after the rejected duplicate"
        );
    }

    #[test]
    fn scenario_3_message_ready_before_initial_metadata_ready_is_deferred_then_assembled() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq.clone()).unwrap();

        call.start_batch(vec![SurfaceOp::RecvInitialMetadata, SurfaceOp::RecvMessage], 7);
        let callbacks = stack.take_callbacks().expect("batch reached the filter stack");
        let on_message_ready = callbacks.on_message_ready.expect("RECV_MESSAGE armed a callback");
        let on_initial_metadata_ready = callbacks.on_initial_metadata_ready.expect("RECV_INITIAL_METADATA armed a callback");

        on_message_ready(Some(Box::new(InMemoryByteStream::new(vec![1, 2, 3, 4, 5, 6, 7]))), None);
        assert!(call.last_received_message().is_none(), "must stay deferred until initial metadata arrives");

        on_initial_metadata_ready(MetadataBatch::new(), None);
        (callbacks.on_complete)(None);

        let received = call.last_received_message().expect("deferred message was processed");
        assert_eq!(received.bytes, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(cq.postings(), vec![(7, None)]);
    }

    #[test]
    fn init_failure_is_reported_as_init_failure_composite() {
        let stack = Arc::new(MockFilterStack::failing_init(Status::explicit(StatusCode::UNKNOWN, Some("boom".into()))));
        let result = Call::create(CallCreateArgs {
            is_client: true,
            parent: None,
            propagation_mask: PropagationMask::NONE,
            combiner: Arc::new(FifoCombiner::new()),
            filter_stack: stack,
            config: ChannelConfig::default(),
            initial_send_extra_metadata: Vec::new(),
            deadline: None,
        });
        assert!(matches!(result, Err(CallError::InitFailure(_))));
    }

    #[test]
    fn context_slot_destructor_runs_on_overwrite() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack);
        let (tx, rx) = std::sync::mpsc::channel();
        call.context_set(
            ContextKind::Tracing,
            ContextSlot::with_destructor(Box::new(1u32), move || tx.send(()).unwrap()),
        );
        call.context_set(ContextKind::Tracing, ContextSlot::new(Box::new(2u32)));
        rx.try_recv().expect("overwriting a slot must run its destructor");

        let value = call
            .context_get(ContextKind::Tracing, |v| *v.downcast_ref::<u32>().unwrap())
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn unref_external_without_completed_ops_does_not_self_cancel() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack);
        call.unref_external();
        assert_eq!(call.final_status().code(), StatusCode::UNKNOWN);
    }

    #[test]
    fn unref_external_after_ops_sent_without_final_op_issues_cancel() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq).unwrap();
        call.start_batch(
            vec![SurfaceOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0,
                compression_level: None,
            }],
            1,
        );
        call.unref_external();
        assert_eq!(call.final_status().code(), StatusCode::CANCELLED);
    }

    #[test]
    fn scenario_4_server_status_propagation_records_on_both_sides() {
        let server_stack = Arc::new(MockFilterStack::new());
        let server = new_call(false, server_stack);
        let status = server.start_batch_and_execute(
            vec![SurfaceOp::SendStatusFromServer {
                status: StatusCode(5),
                message: Some("boom".into()),
                trailing_metadata: vec![("x".to_string(), b"y".to_vec())],
            }],
            |_| {},
        );
        assert_eq!(status, BatchSubmitStatus::Ok);
        assert_eq!(server.final_status().code(), StatusCode(5));
        assert_eq!(server.final_status().message(), Some("boom"));

        let client_stack = Arc::new(MockFilterStack::new());
        let client = new_call(true, client_stack.clone());
        client.start_batch_and_execute(vec![SurfaceOp::RecvStatusOnClient], |_| {});
        let callbacks = client_stack.take_callbacks().expect("batch reached the filter stack");
        let on_trailing = callbacks
            .on_trailing_metadata_ready
            .expect("RECV_STATUS_ON_CLIENT armed a trailing-metadata callback");

        let mut trailing = MetadataBatch::new();
        trailing.link("grpc-status", b"5".to_vec());
        trailing.link("grpc-message", b"boom".to_vec());
        trailing.link("x", b"y".to_vec());
        on_trailing(trailing, None);
        (callbacks.on_complete)(None);

        assert_eq!(client.final_status().code(), StatusCode(5));
        assert_eq!(client.final_status().message(), Some("boom"));
    }

    #[test]
    fn scenario_5_parent_cancellation_propagates_to_inherited_children() {
        let server_stack = Arc::new(MockFilterStack::new());
        let parent = new_call(false, server_stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        parent.set_completion_queue(cq).unwrap();

        let child_stack = Arc::new(MockFilterStack::new());
        let child = Call::create(CallCreateArgs {
            is_client: true,
            parent: Some(parent.clone()),
            propagation_mask: PropagationMask::CANCELLATION,
            combiner: Arc::new(FifoCombiner::new()),
            filter_stack: child_stack,
            config: ChannelConfig::default(),
            initial_send_extra_metadata: Vec::new(),
            deadline: None,
        })
        .unwrap();
        assert!(!child.is_cancelled());

        parent.start_batch(vec![SurfaceOp::RecvCloseOnServer], 9);
        let callbacks = server_stack.take_callbacks().expect("parent batch reached the filter stack");
        (callbacks.on_trailing_metadata_ready.unwrap())(MetadataBatch::new(), None);
        (callbacks.on_complete)(None);

        assert!(parent.received_final_op());
        assert!(child.is_cancelled());
        assert_eq!(child.final_status().code(), StatusCode::CANCELLED);
    }

    #[test]
    fn parent_final_op_before_attach_cancels_child_immediately() {
        let server_stack = Arc::new(MockFilterStack::new());
        let parent = new_call(false, server_stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        parent.set_completion_queue(cq).unwrap();
        parent.start_batch(vec![SurfaceOp::RecvCloseOnServer], 1);
        let callbacks = server_stack.take_callbacks().unwrap();
        (callbacks.on_trailing_metadata_ready.unwrap())(MetadataBatch::new(), None);
        (callbacks.on_complete)(None);
        assert!(parent.received_final_op());

        let child_stack = Arc::new(MockFilterStack::new());
        let child = Call::create(CallCreateArgs {
            is_client: true,
            parent: Some(parent.clone()),
            propagation_mask: PropagationMask::CANCELLATION,
            combiner: Arc::new(FifoCombiner::new()),
            filter_stack: child_stack,
            config: ChannelConfig::default(),
            initial_send_extra_metadata: Vec::new(),
            deadline: None,
        })
        .unwrap();

        assert!(child.is_cancelled());
    }

    #[test]
    fn initial_metadata_ready_transport_error_does_not_cancel_the_call() {
        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq).unwrap();

        call.start_batch(vec![SurfaceOp::RecvInitialMetadata], 3);
        let callbacks = stack.take_callbacks().expect("batch reached the filter stack");
        (callbacks.on_initial_metadata_ready.unwrap())(MetadataBatch::new(), Some(Status::explicit(StatusCode::INTERNAL, Some("conn reset".into()))));
        (callbacks.on_complete)(None);

        assert_eq!(
            call.final_status().code(),
            StatusCode::UNKNOWN,
            "a bare transport delivery error must not cancel the call (client default, not CANCELLED)"
        );
    }

    #[test]
    fn cancel_dispatch_queues_behind_a_still_running_batch() {
        use crate::transport::TransportSubOp;

        let stack = Arc::new(MockFilterStack::new());
        let call = new_call(true, stack.clone());
        let cq = Arc::new(MockCompletionQueue::new());
        call.set_completion_queue(cq).unwrap();

        call.start_batch(vec![SurfaceOp::RecvInitialMetadata], 1);
        let first_callbacks = stack.take_callbacks().expect("first batch reached the filter stack");
        stack.take_last_batch();

        call.cancel();
        assert!(
            stack.take_last_batch().is_none(),
            "cancel's synthetic batch must queue behind the still-running first batch, not jump the combiner"
        );

        (first_callbacks.on_initial_metadata_ready.unwrap())(MetadataBatch::new(), None);
        (first_callbacks.on_complete)(None);

        let cancel_batch = stack.take_last_batch().expect("cancel's batch runs once the combiner frees up");
        assert!(matches!(cancel_batch.sub_ops.as_slice(), [TransportSubOp::CancelStream(_)]));
    }
}
