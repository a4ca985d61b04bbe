//! ParentChildTree (§4.3): cancellation fan-out from a parent call to its
//! children through a circular sibling ring.
//!
//! The ring is a [`slotmap`] arena of [`ChildEntry`] nodes linked by
//! [`ChildId`] under the parent's mutex (§9: "an arena + stable indices
//! work as well as pointers"), giving O(1) splice/unsplice without raw
//! pointer arithmetic.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use slotmap::{new_key_type, SlotMap};

use crate::call::Call;
use crate::error::{ArbiterSource, CallError, Status, StatusCode};

new_key_type! {
    /// Stable handle to one child within a parent's sibling ring.
    pub struct ChildId;
}

/// Flags controlling parent-to-child inheritance (§9, §GLOSSARY
/// "Propagation mask"). A plain bitset: a small `Copy` value type,
/// no `bitflags` dependency needed for four bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PropagationMask(u8);

impl PropagationMask {
    /// No propagation.
    pub const NONE: PropagationMask = PropagationMask(0);
    /// Propagate the deadline to the child.
    pub const DEADLINE: PropagationMask = PropagationMask(1 << 0);
    /// Propagate census/stats context.
    pub const CENSUS_STATS: PropagationMask = PropagationMask(1 << 1);
    /// Propagate census/tracing context. Requires [`PropagationMask::CENSUS_STATS`].
    pub const CENSUS_TRACING: PropagationMask = PropagationMask(1 << 2);
    /// Propagate cancellation: when the parent observes its final op, the
    /// child is cancelled too.
    pub const CANCELLATION: PropagationMask = PropagationMask(1 << 3);

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: PropagationMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for PropagationMask {
    type Output = PropagationMask;
    fn bitor(self, rhs: PropagationMask) -> PropagationMask {
        PropagationMask(self.0 | rhs.0)
    }
}

struct ChildEntry {
    call: Arc<Call>,
    cancellation_is_inherited: bool,
    prev: ChildId,
    next: ChildId,
}

#[derive(Default)]
struct ParentInner {
    children: SlotMap<ChildId, ChildEntry>,
    head: Option<ChildId>,
}

/// A lazily-allocated record attached to any call that becomes a parent
/// (§3 "ParentCall record"). Published into [`Call`] via [`OnceLock`],
/// which already gives a release-store/acquire-load pair for free.
#[derive(Default)]
pub struct ParentCall {
    inner: Mutex<ParentInner>,
}

impl ParentCall {
    fn splice(&self, child: Arc<Call>, cancellation_is_inherited: bool) -> ChildId {
        let mut inner = self.inner.lock().unwrap();
        match inner.head {
            None => {
                let id = inner.children.insert(ChildEntry {
                    call: child,
                    cancellation_is_inherited,
                    prev: ChildId::default(),
                    next: ChildId::default(),
                });
                inner.children[id].prev = id;
                inner.children[id].next = id;
                inner.head = Some(id);
                id
            }
            Some(head) => {
                let tail = inner.children[head].prev;
                let id = inner.children.insert(ChildEntry {
                    call: child,
                    cancellation_is_inherited,
                    prev: tail,
                    next: head,
                });
                inner.children[tail].next = id;
                inner.children[head].prev = id;
                id
            }
        }
    }

    fn unsplice(&self, id: ChildId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.children.remove(id) else {
            return;
        };
        if entry.prev == id {
            // was the only node in the ring
            inner.head = None;
        } else {
            let (prev, next) = (entry.prev, entry.next);
            inner.children[prev].next = next;
            inner.children[next].prev = prev;
            if inner.head == Some(id) {
                inner.head = Some(next);
            }
        }
    }

    /// Walks the ring under the parent's mutex and returns the children
    /// that inherit cancellation, as strong references taken while the
    /// lock is held (the "acquire an internal reference" step). The lock
    /// is dropped before the caller invokes `cancel` on any of them, so a
    /// child's own `detach` (which also locks `self.inner`) cannot
    /// deadlock against this walk.
    fn cancellation_targets(&self) -> Vec<Arc<Call>> {
        let inner = self.inner.lock().unwrap();
        let Some(head) = inner.head else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut cur = head;
        loop {
            let entry = &inner.children[cur];
            if entry.cancellation_is_inherited {
                out.push(entry.call.clone());
            }
            cur = entry.next;
            if cur == head {
                break;
            }
        }
        out
    }
}

/// Where a child call records its attachment, so it can detach itself on
/// last external unref (§4.10) without the parent needing to track it by
/// any other key.
pub struct ChildLink {
    parent: Weak<Call>,
    id: ChildId,
}

/// Attaches `child` to `parent`'s sibling ring (§4.3 `attach`).
///
/// Validates the propagation mask (`CENSUS_TRACING` requires
/// `CENSUS_STATS`) and the client/server constraint (only a client call
/// may have a server parent) before splicing. If cancellation is
/// propagated and the parent has already observed its final op, the
/// returned link's child is marked so the caller (`Call::create`) issues
/// an immediate cancellation.
pub fn attach(parent: &Arc<Call>, child: &Arc<Call>, mask: PropagationMask) -> Result<bool, CallError> {
    if mask.contains(PropagationMask::CENSUS_TRACING) && !mask.contains(PropagationMask::CENSUS_STATS) {
        return Err(CallError::Transport(Status::explicit(
            StatusCode::INTERNAL,
            Some("CENSUS_TRACING propagation requires CENSUS_STATS".into()),
        )));
    }
    if !child.is_client() {
        return Err(CallError::Transport(Status::explicit(
            StatusCode::INTERNAL,
            Some("only a client call may have a parent".into()),
        )));
    }
    if parent.is_client() {
        return Err(CallError::Transport(Status::explicit(
            StatusCode::INTERNAL,
            Some("only a server call may be a parent".into()),
        )));
    }

    let cancellation_is_inherited = mask.contains(PropagationMask::CANCELLATION);
    let record: &ParentCall = parent_record(parent);
    let id = record.splice(child.clone(), cancellation_is_inherited);
    child.set_parent_link(ChildLink {
        parent: Arc::downgrade(parent),
        id,
    });

    let needs_immediate_cancel = cancellation_is_inherited && parent.received_final_op();
    Ok(needs_immediate_cancel)
}

/// Detaches `child` from whatever parent it is attached to, if any
/// (§4.3 `detach`, invoked from `Call::unref_external`'s last-unref path).
pub fn detach(child: &Call) {
    let Some(link) = child.take_parent_link() else {
        return;
    };
    if let Some(parent) = link.parent.upgrade() {
        if let Some(record) = parent.parent_record_if_present() {
            record.unsplice(link.id);
        }
    }
}

/// Fans cancellation out to every child with inherited cancellation
/// (§4.3 `on_parent_final_op`, invoked when trailing-metadata completion
/// sets `received_final_op` on a server call).
pub fn on_parent_final_op(parent: &Arc<Call>) {
    let Some(record) = parent.parent_record_if_present() else {
        return;
    };
    for child in record.cancellation_targets() {
        child.cancel_with_error(
            ArbiterSource::ApiOverride,
            CallError::Cancelled(Status::explicit(StatusCode::CANCELLED, None)),
        );
    }
}

fn parent_record(parent: &Arc<Call>) -> &ParentCall {
    parent.parent_record_cell().get_or_init(ParentCall::default)
}

/// Storage embedded in [`Call`] for its (possible) role as a parent.
/// A type alias kept here so the splice/lookup logic above and
/// [`Call`]'s field declaration agree on the lazy-init primitive.
pub type ParentRecordCell = OnceLock<ParentCall>;
