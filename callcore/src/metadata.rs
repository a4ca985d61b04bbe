//! MetadataFilters (§4.6) and the post-metadata compression validation
//! that follows it (§4.7).

use crate::error::{CallError, Status, StatusCode};
use crate::transport::MetadataBatch;

/// A compression algorithm token, as carried in `content-encoding` /
/// `grpc-encoding` / the `*-accept-encoding` lists. Closed to the set the
/// channel actually knows how to negotiate; unrecognized tokens are
/// skipped, not erroring, per §4.6 ("invalid tokens are reported and
/// skipped, not fatal").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// No compression. Always implicitly accepted (§4.6).
    Identity,
    /// DEFLATE message/stream compression.
    Deflate,
    /// Gzip message/stream compression.
    Gzip,
}

impl CompressionAlgorithm {
    /// Every algorithm this crate knows about, identity first.
    pub const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::Identity,
        CompressionAlgorithm::Deflate,
        CompressionAlgorithm::Gzip,
    ];

    fn parse(token: &str) -> Option<CompressionAlgorithm> {
        match token.trim().to_ascii_lowercase().as_str() {
            "identity" => Some(CompressionAlgorithm::Identity),
            "deflate" => Some(CompressionAlgorithm::Deflate),
            "gzip" => Some(CompressionAlgorithm::Gzip),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// A set of accepted [`CompressionAlgorithm`]s, composed from the
/// `*-accept-encoding` lists (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionBitset(u8);

impl CompressionBitset {
    /// A bitset containing only identity.
    pub fn identity_only() -> Self {
        let mut set = CompressionBitset::default();
        set.insert(CompressionAlgorithm::Identity);
        set
    }

    /// Adds `algorithm` to the set.
    pub fn insert(&mut self, algorithm: CompressionAlgorithm) {
        self.0 |= algorithm.bit();
    }

    /// Whether `algorithm` is in the set.
    pub fn contains(&self, algorithm: CompressionAlgorithm) -> bool {
        self.0 & algorithm.bit() != 0
    }

    /// Parses a comma-separated list of algorithm tokens (§4.6). Always
    /// includes identity regardless of whether the list names it.
    /// Unrecognized tokens are skipped.
    pub fn parse_list(list: &str) -> Self {
        let mut set = CompressionBitset::identity_only();
        for token in list.split(',') {
            if token.trim().is_empty() {
                continue;
            }
            match CompressionAlgorithm::parse(token) {
                Some(algorithm) => set.insert(algorithm),
                None => tracing::debug!(token, "metadata filters: skipping unrecognized compression token"),
            }
        }
        set
    }

    /// The cross-product composition of a message-compression bitset and
    /// a stream-compression bitset into the call's single
    /// `encodings_accepted_by_peer` set (§4.6). Implemented as a union:
    /// the composite algorithm chosen by §4.7 is always a single
    /// non-identity algorithm from one of the two lists, so membership in
    /// either original list is what §4.7's peer-acceptance check needs.
    pub fn compose(self, other: CompressionBitset) -> CompressionBitset {
        CompressionBitset(self.0 | other.0)
    }
}

/// The result of running [`filter_initial`] on an inbound initial-metadata
/// batch.
#[derive(Debug, Clone, Copy)]
pub struct InitialMetadataOutcome {
    /// Stream-level compression (`content-encoding`), identity if absent.
    pub stream_compression: CompressionAlgorithm,
    /// Message-level compression (`grpc-encoding`), identity if absent.
    pub message_compression: CompressionAlgorithm,
    /// The composed set of algorithms the peer declared it accepts.
    pub encodings_accepted_by_peer: CompressionBitset,
}

/// Processes an inbound initial-metadata batch in place (§4.6 "Initial"):
/// decodes and removes the compression-related elements, leaving the
/// application-visible remainder linked in `batch`.
pub fn filter_initial(batch: &mut MetadataBatch) -> InitialMetadataOutcome {
    let stream_compression = batch
        .remove("content-encoding")
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| CompressionAlgorithm::parse(&s))
        .unwrap_or(CompressionAlgorithm::Identity);

    let message_compression = batch
        .remove("grpc-encoding")
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| CompressionAlgorithm::parse(&s))
        .unwrap_or(CompressionAlgorithm::Identity);

    let message_accept = batch
        .remove("grpc-accept-encoding")
        .and_then(|v| String::from_utf8(v).ok())
        .map(|s| CompressionBitset::parse_list(&s))
        .unwrap_or_else(CompressionBitset::identity_only);

    let stream_accept = batch
        .remove("accept-encoding")
        .and_then(|v| String::from_utf8(v).ok())
        .map(|s| CompressionBitset::parse_list(&s))
        .unwrap_or_else(CompressionBitset::identity_only);

    InitialMetadataOutcome {
        stream_compression,
        message_compression,
        encodings_accepted_by_peer: message_accept.compose(stream_accept),
    }
}

/// Processes an inbound trailing-metadata batch in place (§4.6
/// "Trailing"): if `grpc-status` is present and non-OK, returns the
/// synthesized [`Status`] to be recorded on the arbiter with
/// `source=WIRE`; always removes `grpc-status`/`grpc-message` regardless
/// of their value.
pub fn filter_trailing(batch: &mut MetadataBatch) -> Option<Status> {
    let status_bytes = batch.remove("grpc-status")?;
    let message = batch.remove("grpc-message").and_then(|b| String::from_utf8(b).ok());
    let code = StatusCode::parse(&status_bytes).unwrap_or(StatusCode::UNKNOWN);
    if code == StatusCode::OK {
        return None;
    }
    Some(Status::explicit(code, message))
}

/// Set of compression algorithms the channel is configured to accept
/// (§1.3 [`crate::call::ChannelConfig`]).
#[derive(Debug, Clone, Copy)]
pub struct EnabledCompression(pub CompressionBitset);

/// Validates the composite (message, stream) compression choice after
/// [`filter_initial`] (§4.7). Returns the single algorithm this call will
/// treat as "the" compression in effect, or the `CallError` to cancel
/// with.
pub fn validate_compression(
    outcome: &InitialMetadataOutcome,
    enabled: EnabledCompression,
) -> Result<CompressionAlgorithm, CallError> {
    let (message, stream) = (outcome.message_compression, outcome.stream_compression);

    if message != CompressionAlgorithm::Identity && stream != CompressionAlgorithm::Identity {
        return Err(CallError::Transport(Status::explicit(
            StatusCode::INTERNAL,
            Some("both stream and message compression set to non-identity".into()),
        )));
    }

    let composite = if message != CompressionAlgorithm::Identity {
        message
    } else {
        stream
    };

    if !enabled.0.contains(composite) {
        return Err(CallError::Transport(Status::explicit(
            StatusCode::UNIMPLEMENTED,
            Some(format!("{composite:?} disabled by channel configuration")),
        )));
    }

    if !outcome.encodings_accepted_by_peer.contains(composite) {
        tracing::warn!(?composite, "compression algorithm not in peer's accepted encodings bitset");
    }

    Ok(composite)
}
