//! BatchControl and BatchTranslator (§3, §4.4): the translation from a
//! caller-submitted vector of surface ops into one transport batch, and
//! the per-batch completion bookkeeping that drives it home.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::call::{Call, FlagKind};
use crate::error::{ArbiterSource, BatchSubmitStatus, CallError, Status, StatusCode};
use crate::metadata::CompressionAlgorithm;
use crate::transport::{CompletionQueue, MetadataBatch, SliceByteStream, Tag, TransportOpBatch, TransportSubOp};

/// Maximum concurrent batches the call supports, one per op slot.
pub const MAX_CONCURRENT_BATCHES: usize = 6;
/// Maximum extra metadata elements the call will prepend/append to a
/// batch (`:path`, or a server's `grpc-status`/`grpc-message` pair).
pub const MAX_SEND_EXTRA_METADATA: usize = 3;
/// Per-batch sub-error accumulation bound (§4.4, §7).
pub const MAX_ERRORS_PER_BATCH: usize = 4;

/// Flag bits legal on a `SEND_INITIAL_METADATA` op.
pub const INITIAL_METADATA_USED_MASK: u32 = 0b0000_1111;
/// Client-only flag: the request is idempotent and may be retried by the
/// transport. Forbidden on a server call (§4.4 table).
pub const IDEMPOTENT_REQUEST: u32 = 0b0001_0000;
/// Flag bits legal on a `SEND_MESSAGE` op (application-visible half).
pub const WRITE_USED_MASK: u32 = 0b0000_0011;
/// Flag bits legal on a `SEND_MESSAGE` op (core-internal half).
pub const WRITE_INTERNAL_USED_MASK: u32 = 0b0000_1100;
/// Set on the outbound byte-stream when the buffer is already compressed.
pub const WRITE_INTERNAL_COMPRESS: u32 = 0b0000_0100;

/// One surface-level op, as submitted in a `start_batch` vector (§4.4).
#[derive(Debug)]
pub enum SurfaceOp {
    /// Send the initial outbound metadata batch.
    SendInitialMetadata {
        /// Application-supplied metadata elements.
        metadata: Vec<(String, Vec<u8>)>,
        /// Raw flag bits; validated against [`INITIAL_METADATA_USED_MASK`]
        /// / [`IDEMPOTENT_REQUEST`].
        flags: u32,
        /// Explicit per-call compression level override, if any.
        compression_level: Option<CompressionAlgorithm>,
    },
    /// Send one message.
    SendMessage {
        /// The message bytes.
        bytes: Vec<u8>,
        /// Raw flag bits; validated against [`WRITE_USED_MASK`] /
        /// [`WRITE_INTERNAL_USED_MASK`].
        flags: u32,
        /// Whether `bytes` is already compressed by the caller.
        pre_compressed: bool,
    },
    /// Close the send side (client only).
    SendCloseFromClient,
    /// Finish the call with a status (server only).
    SendStatusFromServer {
        /// The status code to report.
        status: StatusCode,
        /// An optional human-readable message.
        message: Option<String>,
        /// Application trailing metadata.
        trailing_metadata: Vec<(String, Vec<u8>)>,
    },
    /// Arm the initial-metadata-ready callback.
    RecvInitialMetadata,
    /// Arm the message-ready callback.
    RecvMessage,
    /// Request the final status (client only).
    RecvStatusOnClient,
    /// Request the final close (server only).
    RecvCloseOnServer,
}

/// Where a finished batch reports its completion (§3 "completion
/// descriptor tagged as either 'queue tag' or 'continuation'").
pub enum Completion {
    /// Post to a bound completion queue.
    Queue {
        /// The completion queue to post to.
        cq: Arc<dyn CompletionQueue>,
        /// The tag to post with.
        tag: Tag,
    },
    /// Invoke a caller-supplied continuation exactly once.
    Continuation(Mutex<Option<Box<dyn FnOnce(Status) + Send>>>),
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Queue { tag, .. } => f.debug_struct("Completion::Queue").field("tag", tag).finish(),
            Completion::Continuation(_) => f.debug_tuple("Completion::Continuation").finish(),
        }
    }
}

/// Per-batch record (§3 "BatchControl"). Borrows the call via a [`Weak`]
/// reference rather than owning it — the call's arena owns the batch
/// controls, not the other way around.
#[derive(Debug)]
pub struct BatchControl {
    call: Weak<Call>,
    remaining_steps: AtomicUsize,
    errors: Mutex<Vec<CallError>>,
    completion: Completion,
    /// Set for the batch that arms `RECV_STATUS_ON_CLIENT` /
    /// `RECV_CLOSE_ON_SERVER`: on completion, its result is the arbiter's
    /// `final_status`, not the batch's own consolidated sub-errors (§7).
    reports_final_status: bool,
    /// The per-batch (not per-call) flags this batch occupied — unlike the
    /// one-shot flags (`SentInitialMetadata`, `SentFinalOp`, ...), a
    /// streamed call's `SEND_MESSAGE`/`RECV_MESSAGE` slot is reusable: the
    /// original frees the slot's `BatchControl` back to a pool on
    /// completion (§9 "sentinel-based reuse"); here that's reused as
    /// "clear the flag so the next batch on this slot is accepted".
    reusable_flags: Vec<FlagKind>,
}

impl BatchControl {
    fn new(
        call: &Arc<Call>,
        steps: usize,
        completion: Completion,
        reports_final_status: bool,
        reusable_flags: Vec<FlagKind>,
    ) -> Arc<Self> {
        Arc::new(BatchControl {
            call: Arc::downgrade(call),
            remaining_steps: AtomicUsize::new(steps),
            errors: Mutex::new(Vec::new()),
            completion,
            reports_final_status,
            reusable_flags,
        })
    }

    /// A batch control with no call, no completion target, and a single
    /// already-complete step, used to exercise components that merely
    /// need *a* batch control, such as the inbound race gate.
    #[cfg(test)]
    pub(crate) fn test_stub() -> Arc<Self> {
        Arc::new(BatchControl {
            call: Weak::new(),
            remaining_steps: AtomicUsize::new(1),
            errors: Mutex::new(Vec::new()),
            completion: Completion::Continuation(Mutex::new(None)),
            reports_final_status: false,
            reusable_flags: Vec::new(),
        })
    }

    /// Records a sub-error (§7: bounded to [`MAX_ERRORS_PER_BATCH`]). The
    /// first error on a batch also triggers a call-wide cancel with
    /// `source=CORE`, unless the call was already cancelled by something
    /// else.
    pub fn record_error(self: &Arc<Self>, error: CallError) {
        self.record_error_impl(error, true);
    }

    /// Records a sub-error without ever triggering the generic auto-cancel
    /// (§4.5 `initial_metadata_ready`: a transport-level delivery error is
    /// surfaced on the batch but must not fan out a call-wide cancel). Use
    /// this instead of [`BatchControl::record_error`] on paths where the
    /// error belongs to the batch alone.
    pub fn record_error_no_cancel(self: &Arc<Self>, error: CallError) {
        self.record_error_impl(error, false);
    }

    fn record_error_impl(self: &Arc<Self>, error: CallError, cancels_call: bool) {
        let is_first = {
            let mut errors = self.errors.lock().unwrap();
            let is_first = errors.is_empty();
            if errors.len() < MAX_ERRORS_PER_BATCH {
                errors.push(error.clone());
            }
            is_first
        };
        if is_first && cancels_call {
            if let Some(call) = self.call.upgrade() {
                if !call.has_cancelled() {
                    crate::cancel::cancel_with_error(&call, ArbiterSource::Core, error);
                }
            }
        }
    }

    /// Completes one of this batch's `1 + arming_callbacks` steps. When
    /// the count reaches zero, consolidates errors and posts completion.
    pub fn complete_step(self: &Arc<Self>) {
        let previous = self.remaining_steps.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "batch control: complete_step called too many times");
        if previous == 1 {
            self.finish();
        }
    }

    fn finish(self: &Arc<Self>) {
        let errors = std::mem::take(&mut *self.errors.lock().unwrap());
        let consolidated = match errors.len() {
            0 => None,
            1 => Some(errors.into_iter().next().unwrap()),
            _ => Some(CallError::Composite(errors.into_iter().map(Arc::new).collect())),
        };

        if let Some(call) = self.call.upgrade() {
            for flag in &self.reusable_flags {
                call.reset_flag(*flag);
            }
        }

        if self.reports_final_status {
            if let Some(call) = self.call.upgrade() {
                call.on_trailing_metadata_complete();
                let status = call.status_arbiter().final_status(call.is_client());
                self.post(status);
                return;
            }
        }

        let status = consolidated.map(|e| e.to_status()).unwrap_or_else(Status::ok);
        self.post(status);
    }

    fn post(&self, status: Status) {
        post_completion(&self.completion, status);
    }
}

/// Posts `status` to `completion`, either end-opping the bound queue tag or
/// invoking the caller-supplied continuation. Used both by
/// [`BatchControl::post`] and directly for the empty-batch fast path
/// (§4.4 "Empty batch"), which never allocates a `BatchControl`.
fn post_completion(completion: &Completion, status: Status) {
    match completion {
        Completion::Queue { cq, tag } => cq.end_op(*tag, if status.code() == StatusCode::OK { None } else { Some(status) }),
        Completion::Continuation(slot) => {
            if let Some(continuation) = slot.lock().unwrap().take() {
                continuation(status);
            }
        }
    }
}

fn validate_metadata_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
}

/// Translates a vector of [`SurfaceOp`]s into a single transport batch
/// (§4.4). `completion` is where the finished batch reports.
pub struct BatchTranslator;

/// What [`BatchTranslator::translate`] produced.
pub enum TranslateOutcome {
    /// N=0: already completed with OK, nothing to dispatch (§4.4 "Empty
    /// batch").
    CompletedImmediately,
    /// A batch ready to dispatch through the combiner.
    Dispatch(Arc<BatchControl>, TransportOpBatch),
}

impl BatchTranslator {
    /// Validates and translates `ops`. On success, every per-op flag this
    /// batch touches has been durably flipped on `call` and a
    /// [`BatchControl`] is ready to dispatch. On failure, every such flag
    /// flipped *by this call to `translate`* has been reverted, and no
    /// [`BatchControl`] was allocated (§4.4 "REVERTS every mutation").
    pub fn translate(
        call: &Arc<Call>,
        ops: Vec<SurfaceOp>,
        completion: Completion,
    ) -> Result<TranslateOutcome, (BatchSubmitStatus, CallError)> {
        if ops.is_empty() {
            post_completion(&completion, Status::ok());
            return Ok(TranslateOutcome::CompletedImmediately);
        }

        let mut applied_flags: Vec<FlagKind> = Vec::new();
        let mut reusable_flags: Vec<FlagKind> = Vec::new();
        let mut sub_ops = Vec::new();
        let mut reports_final_status = false;
        let mut arming_callbacks = 0usize;

        macro_rules! fail {
            ($status:expr, $error:expr) => {{
                for flag in applied_flags.drain(..) {
                    call.reset_flag(flag);
                }
                return Err(($status, $error));
            }};
        }

        for op in ops {
            match op {
                SurfaceOp::SendInitialMetadata {
                    metadata,
                    flags,
                    compression_level,
                } => {
                    if !call.set_flag_once(FlagKind::SentInitialMetadata) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate SEND_INITIAL_METADATA".into())))
                        );
                    }
                    applied_flags.push(FlagKind::SentInitialMetadata);

                    if flags & !INITIAL_METADATA_USED_MASK != 0 || (call.is_server() && flags & IDEMPOTENT_REQUEST != 0) {
                        fail!(
                            BatchSubmitStatus::InvalidFlags,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("invalid SEND_INITIAL_METADATA flags".into())))
                        );
                    }

                    let mut batch = MetadataBatch::new();
                    for (key, value) in &metadata {
                        if !validate_metadata_key(key) {
                            fail!(
                                BatchSubmitStatus::InvalidMetadata,
                                CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some(format!("invalid metadata key {key:?}"))))
                            );
                        }
                        batch.link(key.clone(), value.clone());
                    }
                    if call.is_client() {
                        batch.set_deadline(call.send_deadline());
                    }

                    let effective_level = compression_level.unwrap_or_else(|| call.default_outbound_compression());
                    if call.is_server() && effective_level != CompressionAlgorithm::Identity {
                        let accepted = call.encodings_accepted_by_peer();
                        let chosen = if accepted.contains(effective_level) {
                            effective_level
                        } else {
                            CompressionAlgorithm::Identity
                        };
                        if chosen != CompressionAlgorithm::Identity {
                            batch.link("grpc-encoding", format!("{chosen:?}").to_lowercase().into_bytes());
                        }
                    }
                    for (key, value) in call.take_send_extra_metadata() {
                        batch.link(key, value);
                    }
                    sub_ops.push(TransportSubOp::SendInitialMetadata(batch));
                }

                SurfaceOp::SendMessage {
                    bytes,
                    flags,
                    pre_compressed,
                } => {
                    if !call.set_flag_once(FlagKind::SendingMessage) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate SEND_MESSAGE".into())))
                        );
                    }
                    applied_flags.push(FlagKind::SendingMessage);
                    reusable_flags.push(FlagKind::SendingMessage);

                    if flags & !(WRITE_USED_MASK | WRITE_INTERNAL_USED_MASK) != 0 {
                        fail!(
                            BatchSubmitStatus::InvalidFlags,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("invalid SEND_MESSAGE flags".into())))
                        );
                    }

                    // `pre_compressed` corresponds to WRITE_INTERNAL_COMPRESS: the
                    // transport is told not to re-apply stream compression to
                    // a buffer the caller already compressed.
                    let _ = pre_compressed;
                    let stream = SliceByteStream::new(bytes);
                    sub_ops.push(TransportSubOp::SendMessage(Box::new(stream)));
                }

                SurfaceOp::SendCloseFromClient => {
                    if !call.is_client() {
                        fail!(
                            BatchSubmitStatus::NotOnClient,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("SEND_CLOSE_FROM_CLIENT on server call".into())))
                        );
                    }
                    if !call.set_flag_once(FlagKind::SentFinalOp) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate final send op".into())))
                        );
                    }
                    applied_flags.push(FlagKind::SentFinalOp);
                    sub_ops.push(TransportSubOp::SendTrailingMetadata(MetadataBatch::new()));
                }

                SurfaceOp::SendStatusFromServer {
                    status,
                    message,
                    trailing_metadata,
                } => {
                    if call.is_client() {
                        fail!(
                            BatchSubmitStatus::NotOnServer,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("SEND_STATUS_FROM_SERVER on client call".into())))
                        );
                    }
                    if !call.set_flag_once(FlagKind::SentFinalOp) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate final send op".into())))
                        );
                    }
                    applied_flags.push(FlagKind::SentFinalOp);

                    call.status_arbiter().record(
                        ArbiterSource::ApiOverride,
                        Status::explicit(status, message.clone()),
                    );

                    let mut trailing = MetadataBatch::new();
                    trailing.link("grpc-status", status.0.to_string().into_bytes());
                    if let Some(message) = &message {
                        trailing.link("grpc-message", message.clone().into_bytes());
                    }
                    for (key, value) in &trailing_metadata {
                        if !validate_metadata_key(key) {
                            fail!(
                                BatchSubmitStatus::InvalidMetadata,
                                CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some(format!("invalid metadata key {key:?}"))))
                            );
                        }
                        trailing.link(key.clone(), value.clone());
                    }
                    sub_ops.push(TransportSubOp::SendTrailingMetadata(trailing));
                }

                SurfaceOp::RecvInitialMetadata => {
                    if !call.set_flag_once(FlagKind::ReceivedInitialMetadata) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate RECV_INITIAL_METADATA".into())))
                        );
                    }
                    applied_flags.push(FlagKind::ReceivedInitialMetadata);
                    arming_callbacks += 1;
                    sub_ops.push(TransportSubOp::RecvInitialMetadata);
                }

                SurfaceOp::RecvMessage => {
                    if !call.set_flag_once(FlagKind::ReceivingMessage) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate RECV_MESSAGE".into())))
                        );
                    }
                    applied_flags.push(FlagKind::ReceivingMessage);
                    reusable_flags.push(FlagKind::ReceivingMessage);
                    arming_callbacks += 1;
                    sub_ops.push(TransportSubOp::RecvMessage);
                }

                SurfaceOp::RecvStatusOnClient => {
                    if !call.is_client() {
                        fail!(
                            BatchSubmitStatus::NotOnClient,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("RECV_STATUS_ON_CLIENT on server call".into())))
                        );
                    }
                    if !call.set_flag_once(FlagKind::RequestedFinalOp) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate final recv op".into())))
                        );
                    }
                    applied_flags.push(FlagKind::RequestedFinalOp);
                    arming_callbacks += 1;
                    reports_final_status = true;
                    sub_ops.push(TransportSubOp::RecvTrailingMetadata);
                    sub_ops.push(TransportSubOp::CollectStats);
                }

                SurfaceOp::RecvCloseOnServer => {
                    if call.is_client() {
                        fail!(
                            BatchSubmitStatus::NotOnServer,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("RECV_CLOSE_ON_SERVER on client call".into())))
                        );
                    }
                    if !call.set_flag_once(FlagKind::RequestedFinalOp) {
                        fail!(
                            BatchSubmitStatus::TooManyOperations,
                            CallError::Transport(Status::explicit(StatusCode::INTERNAL, Some("duplicate final recv op".into())))
                        );
                    }
                    applied_flags.push(FlagKind::RequestedFinalOp);
                    arming_callbacks += 1;
                    reports_final_status = true;
                    sub_ops.push(TransportSubOp::RecvTrailingMetadata);
                    sub_ops.push(TransportSubOp::CollectStats);
                }
            }
        }

        call.mark_any_ops_sent();
        let bctl = BatchControl::new(call, 1 + arming_callbacks, completion, reports_final_status, reusable_flags);
        Ok(TranslateOutcome::Dispatch(bctl, TransportOpBatch { sub_ops }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallCreateArgs, ChannelConfig};
    use crate::parent_child::PropagationMask;
    use crate::testing::MockFilterStack;
    use callcore_combiner::FifoCombiner;

    fn new_call(is_client: bool) -> Arc<Call> {
        Call::create(CallCreateArgs {
            is_client,
            parent: None,
            propagation_mask: PropagationMask::NONE,
            combiner: Arc::new(FifoCombiner::new()),
            filter_stack: Arc::new(MockFilterStack::new()),
            config: ChannelConfig::default(),
            initial_send_extra_metadata: Vec::new(),
            deadline: None,
        })
        .unwrap()
    }

    #[test]
    fn invalid_flags_roll_back_only_the_flags_this_call_applied() {
        let call = new_call(true);
        call.set_flag_once(FlagKind::ReceivedInitialMetadata);

        let result = BatchTranslator::translate(
            &call,
            vec![SurfaceOp::SendInitialMetadata {
                metadata: Vec::new(),
                flags: 0xFFFF,
                compression_level: None,
            }],
            Completion::Continuation(Mutex::new(None)),
        );
        assert!(matches!(result, Err((BatchSubmitStatus::InvalidFlags, _))));

        assert!(
            call.set_flag_once(FlagKind::SentInitialMetadata),
            "the rejected op's own flag must have been reverted"
        );
        assert!(
            !call.set_flag_once(FlagKind::ReceivedInitialMetadata),
            "a flag set before translate() started must survive untouched"
        );
    }

    #[test]
    fn send_status_from_server_on_client_call_is_not_on_server() {
        let call = new_call(true);
        let result = BatchTranslator::translate(
            &call,
            vec![SurfaceOp::SendStatusFromServer {
                status: StatusCode::OK,
                message: None,
                trailing_metadata: Vec::new(),
            }],
            Completion::Continuation(Mutex::new(None)),
        );
        assert!(matches!(result, Err((BatchSubmitStatus::NotOnServer, _))));
    }

    #[test]
    fn invalid_metadata_key_is_rejected() {
        let call = new_call(true);
        let result = BatchTranslator::translate(
            &call,
            vec![SurfaceOp::SendInitialMetadata {
                metadata: vec![("Invalid-Key".to_string(), Vec::new())],
                flags: 0,
                compression_level: None,
            }],
            Completion::Continuation(Mutex::new(None)),
        );
        assert!(matches!(result, Err((BatchSubmitStatus::InvalidMetadata, _))));
    }

    #[test]
    fn errors_beyond_the_bound_are_dropped_but_do_not_panic() {
        let call = new_call(true);
        let bctl = BatchControl::new(&call, MAX_ERRORS_PER_BATCH + 2, Completion::Continuation(Mutex::new(None)), false, Vec::new());
        for _ in 0..(MAX_ERRORS_PER_BATCH + 2) {
            bctl.record_error(CallError::Transport(Status::explicit(StatusCode::UNKNOWN, None)));
        }
        assert_eq!(bctl.errors.lock().unwrap().len(), MAX_ERRORS_PER_BATCH);
    }
}
