//! Cancellation (§4.9): unwedges an in-flight combiner holder and drives a
//! synthetic `cancel_stream` transport op.

use std::sync::Arc;

use crate::call::Call;
use crate::error::{ArbiterSource, CallError, Status, StatusCode};
use crate::transport::{TransportCallbacks, TransportOpBatch, TransportSubOp};

/// Cancels `call` with `error`, attributed to `source` on the arbiter.
///
/// Safe to call from any thread, at any time, concurrently with other
/// cancellations: the arbiter's `record` is write-once per source, so a
/// losing writer here simply contributes nothing beyond unblocking the
/// combiner. If `source` has already recorded a status, this is a no-op:
/// the synthetic batch below was already dispatched by whichever call
/// won that race. Acquires an internal reference for the duration of the
/// synthetic batch, released when the transport reports it complete.
///
/// Like every other piece of filter-stack interaction, the synthetic
/// `cancel_stream` op is dispatched through the combiner rather than
/// straight to the filter stack, so it can never overlap with a batch
/// that is still legitimately holding it.
pub fn cancel_with_error(call: &Arc<Call>, source: ArbiterSource, error: CallError) {
    if call.status_arbiter().is_recorded(source) {
        return;
    }

    call.mark_cancel_issued();
    call.internal_ref();

    let status = error.to_status();
    call.status_arbiter().record(source, status.clone());

    let combiner_error: Arc<dyn std::error::Error + Send + Sync> = Arc::new(error);
    call.combiner().cancel(combiner_error);

    let batch = TransportOpBatch {
        sub_ops: vec![TransportSubOp::CancelStream(status)],
    };
    let call_for_dispatch = call.clone();
    call.combiner().start(
        Box::new(move |_cancel_error| {
            let call_for_complete = call_for_dispatch.clone();
            call_for_dispatch.filter_stack().start_transport_op(
                batch,
                TransportCallbacks {
                    on_initial_metadata_ready: None,
                    on_message_ready: None,
                    on_trailing_metadata_ready: None,
                    on_complete: Box::new(move |_error| {
                        call_for_complete.combiner().stop("cancel_stream complete");
                        call_for_complete.internal_unref();
                    }),
                },
            );
        }),
        None,
        "cancel_with_error dispatch",
    );
}

/// Synthesizes a transport-status error from `code`/`description` and
/// delegates to [`cancel_with_error`] (§4.9 `cancel_with_status`).
pub fn cancel_with_status(call: &Arc<Call>, source: ArbiterSource, code: StatusCode, description: impl Into<String>) {
    let status = Status::explicit(code, Some(description.into()));
    cancel_with_error(call, source, CallError::Cancelled(status));
}
