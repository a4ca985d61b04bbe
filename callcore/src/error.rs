//! Status and error types shared across the call object.
//!
//! Mirrors the shape of `ic-cdk`'s [`SystemError`]/[`CallError`] pair: a
//! plain status/message value (here [`Status`]) and a `thiserror`-derived
//! enum of the ways a call can ultimately fail.
//!
//! [`SystemError`]: https://docs.rs/ic-cdk/latest/ic_cdk/call/struct.SystemError.html
//! [`CallError`]: https://docs.rs/ic-cdk/latest/ic_cdk/call/enum.CallError.html

use std::sync::Arc;

/// A transport-status integer, in the grpc-status numbering space used by
/// `grpc-status`/`grpc-message` metadata (§4.6). Not a closed enum: the
/// filter stack and application code may produce values this crate does
/// not name, so it is carried as a transparent wrapper rather than a
/// fixed-variant enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub i32);

impl StatusCode {
    /// The call completed successfully.
    pub const OK: StatusCode = StatusCode(0);
    /// The call was cancelled, typically by the caller.
    pub const CANCELLED: StatusCode = StatusCode(1);
    /// No more specific status applies; the default for "something failed
    /// but no source attached a status" on a client.
    pub const UNKNOWN: StatusCode = StatusCode(2);
    /// Unimplemented composite-compression algorithm (§4.7).
    pub const UNIMPLEMENTED: StatusCode = StatusCode(12);
    /// Internal invariant violation (§4.7's "both non-identity" case).
    pub const INTERNAL: StatusCode = StatusCode(13);

    /// Fast-path decode for the `grpc-status` tokens the wire format sends
    /// most often (§4.6); falls back to a full integer parse otherwise.
    pub fn parse(token: &[u8]) -> Option<StatusCode> {
        match token {
            b"0" => Some(StatusCode::OK),
            b"1" => Some(StatusCode::CANCELLED),
            b"2" => Some(StatusCode::UNKNOWN),
            other => std::str::from_utf8(other)
                .ok()?
                .parse::<i32>()
                .ok()
                .map(StatusCode),
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The result of arbitrating or propagating a call's outcome: a status
/// code, an optional message, and whether the code was stated explicitly
/// by whoever produced this `Status` (as opposed to merely derived).
///
/// `has_explicit_status` (§9) is a field on the type rather than an
/// implicit property inferred elsewhere, so any call site that cares can
/// test it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: Option<String>,
    has_explicit_status: bool,
}

impl Status {
    /// A status with an explicit code, as produced by a transport error or
    /// a `grpc-status` element.
    pub fn explicit(code: StatusCode, message: impl Into<Option<String>>) -> Self {
        Status {
            code,
            message: message.into(),
            has_explicit_status: true,
        }
    }

    /// A status derived without an explicit wire code (e.g. a plain
    /// cancellation not carrying its own status).
    pub fn derived(code: StatusCode, message: impl Into<Option<String>>) -> Self {
        Status {
            code,
            message: message.into(),
            has_explicit_status: false,
        }
    }

    /// The canonical OK status.
    pub fn ok() -> Self {
        Status::explicit(StatusCode::OK, None)
    }

    /// The code carried by this status.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// The optional human-readable message.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether `code` was stated explicitly rather than derived.
    pub fn has_explicit_status(&self) -> bool {
        self.has_explicit_status
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "status {}: {}", self.code, msg),
            None => write!(f, "status {}", self.code),
        }
    }
}

/// The origin of a recorded status (§4.1, §GLOSSARY "Arbiter source").
/// Declaration order is priority order, smallest (first-declared) wins;
/// [`Ord`]/[`PartialOrd`] are derived from it so [`crate::status::StatusArbiter`]
/// can sort sources directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArbiterSource {
    /// An explicit application override (e.g. `SEND_STATUS_FROM_SERVER`,
    /// or cancellation fanned out from a parent).
    ApiOverride,
    /// A status decoded off the wire (`grpc-status` trailing metadata).
    Wire,
    /// An error surfaced by the core itself (e.g. too many per-batch
    /// sub-errors).
    Core,
    /// An error raised by surface-level validation (bad flags, bad
    /// metadata, compression mismatches).
    Surface,
    /// The status a server handler explicitly set on the call before it
    /// was superseded — kept distinct from `ApiOverride` so multiple
    /// server-side writers still arbitrate deterministically.
    ServerStatus,
}

impl ArbiterSource {
    /// All sources, already in priority order.
    pub const ALL: [ArbiterSource; 5] = [
        ArbiterSource::ApiOverride,
        ArbiterSource::Wire,
        ArbiterSource::Core,
        ArbiterSource::Surface,
        ArbiterSource::ServerStatus,
    ];
}

/// The four error kinds from §7, modeled as `thiserror` variants over a
/// single status/message pair.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// A single transport-status error.
    #[error("{0}")]
    Transport(Status),

    /// Several sub-errors accumulated on one batch (§7: "many → composite"),
    /// bounded to [`crate::batch::MAX_ERRORS_PER_BATCH`].
    #[error("{} sub-errors", .0.len())]
    Composite(Vec<Arc<CallError>>),

    /// The filter stack failed to initialize the call (§4.10 `create`).
    #[error("call initialization failed ({} errors)", .0.len())]
    InitFailure(Vec<Arc<CallError>>),

    /// A cancellation synthesized by [`crate::cancel`], not decoded off
    /// the wire.
    #[error("cancelled: {0}")]
    Cancelled(Status),
}

impl CallError {
    /// The [`Status`] this error ultimately reduces to, for recording on
    /// the [`crate::status::StatusArbiter`] or returning to a caller.
    pub fn to_status(&self) -> Status {
        match self {
            CallError::Transport(status) | CallError::Cancelled(status) => status.clone(),
            CallError::Composite(children) => children
                .first()
                .map(|c| c.to_status())
                .unwrap_or_else(Status::ok),
            CallError::InitFailure(_) => {
                Status::explicit(StatusCode::INTERNAL, Some("call initialization failed".into()))
            }
        }
    }
}

/// The status-code taxonomy returned by `start_batch` itself (§6), distinct
/// from the transport [`StatusCode`] carried inside a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSubmitStatus {
    /// The batch was accepted and dispatched (or, for an empty batch,
    /// completed immediately).
    Ok,
    /// An unspecified per-batch error.
    Error,
    /// An op carried flag bits it is not allowed to carry.
    InvalidFlags,
    /// Application metadata failed key/value validation.
    InvalidMetadata,
    /// A message buffer failed validation.
    InvalidMessage,
    /// A client-only op was submitted on a server call.
    NotOnClient,
    /// A server-only op was submitted on a client call.
    NotOnServer,
    /// A slot already had an outstanding (or previously completed,
    /// monotonic) op of that kind.
    TooManyOperations,
}
