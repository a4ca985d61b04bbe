//! StatusArbiter (§4.1): arbitrates the authoritative call status across
//! several competing sources.
//!
//! Each source gets one [`OnceLock`] rather than a hand-rolled atomic
//! `(is_set, error)` word (§9): `OnceLock::set` already gives write-once
//! semantics with the right memory ordering (an initializing store
//! happens-before any later `get`), so no unsafe bit-packing is needed to
//! get the same guarantee.

use std::sync::OnceLock;

use crate::error::{ArbiterSource, Status, StatusCode};

/// A fixed-size array of write-once status slots, one per [`ArbiterSource`].
#[derive(Debug, Default)]
pub struct StatusArbiter {
    slots: [OnceLock<Status>; ArbiterSource::ALL.len()],
}

impl StatusArbiter {
    /// Creates an arbiter with no source yet recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `status` for `source`, write-once. If `source` already has a
    /// recorded status, `status` is simply dropped (the "release the
    /// losing error" step — in safe Rust this is just letting it go out of
    /// scope) and `false` is returned.
    pub fn record(&self, source: ArbiterSource, status: Status) -> bool {
        let slot = &self.slots[source as usize];
        let accepted = slot.set(status).is_ok();
        if !accepted {
            tracing::trace!(?source, "status arbiter: source already recorded, dropping");
        }
        accepted
    }

    /// Whether `source` has already recorded a status.
    pub fn is_recorded(&self, source: ArbiterSource) -> bool {
        self.slots[source as usize].get().is_some()
    }

    /// The deterministic selection algorithm (§4.1): two passes, each
    /// preferring explicit-status entries over merely-derived ones, first
    /// disallowing OK and then allowing it. Calling this repeatedly with
    /// the same recorded set always yields the same answer.
    pub fn final_status(&self, is_client: bool) -> Status {
        for allow_ok in [false, true] {
            if let Some(status) = self.scan(allow_ok, true) {
                return status;
            }
            if let Some(status) = self.scan(allow_ok, false) {
                return status;
            }
        }
        if is_client {
            Status::derived(StatusCode::UNKNOWN, None)
        } else {
            Status::ok()
        }
    }

    fn scan(&self, allow_ok: bool, require_explicit: bool) -> Option<Status> {
        for source in ArbiterSource::ALL {
            let Some(status) = self.slots[source as usize].get() else {
                continue;
            };
            if require_explicit && !status.has_explicit_status() {
                continue;
            }
            if acceptable(status.code(), allow_ok) {
                return Some(status.clone());
            }
        }
        None
    }
}

fn acceptable(code: StatusCode, allow_ok: bool) -> bool {
    allow_ok || code != StatusCode::OK
}
