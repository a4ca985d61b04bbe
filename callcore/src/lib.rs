//! `callcore`: the per-call RPC state machine behind a bidirectional call
//! object, handling status arbitration, metadata and compression
//! negotiation, inbound message/metadata ordering, and parent/child
//! cancellation propagation for one in-flight call.
//!
//! A [`call::Call`] owns the per-call pieces described in its module docs:
//! status arbitration ([`status`]), inbound receive coordination
//! ([`inbound`]), metadata filtering and compression negotiation
//! ([`metadata`]), parent/child cancellation propagation
//! ([`parent_child`]), batch validation and dispatch ([`batch`]), and
//! cancellation ([`cancel`]). The wire transport, filter stack, and
//! completion queue are consumed as traits ([`transport`]); this crate
//! implements none of them, only an in-memory mock ([`testing`]) for its
//! own tests.
//!
//! The per-call serializer each batch dispatches through lives in the
//! sibling [`callcore_combiner`] crate.
#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    unsafe_op_in_unsafe_fn,
    clippy::undocumented_unsafe_blocks,
    clippy::missing_safety_doc
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod batch;
pub mod call;
pub mod cancel;
pub mod error;
pub mod inbound;
pub mod metadata;
pub mod parent_child;
pub mod status;
pub mod transport;

#[cfg(test)]
pub mod testing;

#[doc(inline)]
pub use call::{Call, CallCreateArgs, ChannelConfig};
#[doc(inline)]
pub use error::{ArbiterSource, BatchSubmitStatus, CallError, Status, StatusCode};
