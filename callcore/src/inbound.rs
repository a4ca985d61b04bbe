//! InboundRaceGate (§4.5) and MessageReceiver (§4.8).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::batch::BatchControl;
use crate::error::Status;
use crate::metadata::CompressionAlgorithm;
use crate::transport::ByteStream;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    None = 0,
    InitialMetadataFirst = 1,
    MessagePending = 2,
    MessageConsumed = 3,
}

/// A message that arrived before initial metadata, deferred until the
/// race gate resolves (§4.5).
pub struct PendingMessage {
    /// The batch this message belongs to.
    pub bctl: Arc<BatchControl>,
    /// The stream to read, or `None` if `error` is set.
    pub stream: Option<Box<dyn ByteStream>>,
    /// An error already observed for this message, if any.
    pub error: Option<Status>,
}

/// What the caller of [`InboundRaceGate::on_message_ready`] should do.
pub enum MessageReadyAction {
    /// Initial metadata has not arrived yet; processing is deferred until
    /// [`InboundRaceGate::on_initial_metadata_ready`] extracts it.
    Defer,
    /// Initial metadata already won the race; process the message now.
    ProcessNow(PendingMessage),
}

/// What the caller of [`InboundRaceGate::on_initial_metadata_ready`]
/// should do.
pub enum InitialMetadataAction {
    /// No message was deferred; nothing further to do.
    NoMessagePending,
    /// A message arrived first and was deferred; process it now.
    ProcessDeferredMessage(PendingMessage),
}

/// A single atomic word resolving the race between
/// `initial_metadata_ready` and `message_ready` (§4.5, §GLOSSARY "Inbound
/// race gate").
///
/// An explicit [`AtomicU8`] discriminant resolves *which side won the
/// race* (§9), paired with a plain [`Mutex`] that holds the deferred
/// payload: the mutex's own lock/unlock already gives the happens-before
/// edge needed to hand the payload off safely, no pointer tagging needed.
#[derive(Debug, Default)]
pub struct InboundRaceGate {
    state: AtomicU8,
    pending_message: Mutex<Option<PendingMessage>>,
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("has_stream", &self.stream.is_some())
            .field("error", &self.error)
            .finish()
    }
}

impl InboundRaceGate {
    /// A gate in its initial, unresolved state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when `message_ready` fires. If initial metadata has not yet
    /// been seen, defers `pending`; otherwise signals the caller to
    /// process it immediately.
    pub fn on_message_ready(&self, pending: PendingMessage) -> MessageReadyAction {
        match self.state.compare_exchange(
            GateState::None as u8,
            GateState::MessagePending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                *self.pending_message.lock().unwrap() = Some(pending);
                MessageReadyAction::Defer
            }
            Err(actual) => {
                debug_assert_eq!(actual, GateState::InitialMetadataFirst as u8);
                MessageReadyAction::ProcessNow(pending)
            }
        }
    }

    /// Called when `initial_metadata_ready` fires, after its own
    /// MetadataFilters/validation work is done. Single-shot: calling this
    /// twice on the same gate is an invariant violation.
    pub fn on_initial_metadata_ready(&self) -> InitialMetadataAction {
        loop {
            let current = self.state.load(Ordering::Acquire);
            assert_ne!(
                current,
                GateState::InitialMetadataFirst as u8,
                "inbound race gate: initial metadata observed twice"
            );
            if current == GateState::None as u8 {
                if self
                    .state
                    .compare_exchange(
                        GateState::None as u8,
                        GateState::InitialMetadataFirst as u8,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return InitialMetadataAction::NoMessagePending;
                }
                continue;
            }
            self.state.store(GateState::MessageConsumed as u8, Ordering::Release);
            let pending = self
                .pending_message
                .lock()
                .unwrap()
                .take()
                .expect("inbound race gate: message pending but no payload published");
            return InitialMetadataAction::ProcessDeferredMessage(pending);
        }
    }
}

/// A fully-assembled inbound message (§4.8).
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The message bytes.
    pub bytes: Vec<u8>,
    /// The algorithm the bytes are still compressed with, if the
    /// receiving side requested pass-through rather than decompression.
    pub compressed_with: Option<CompressionAlgorithm>,
}

struct ReceiveLoopState {
    stream: Box<dyn ByteStream>,
    buffer: Vec<u8>,
    tagged_algorithm: Option<CompressionAlgorithm>,
    on_done: Option<Box<dyn FnOnce(Result<ReceivedMessage, Status>) + Send>>,
}

fn drive(state: Arc<Mutex<ReceiveLoopState>>) {
    loop {
        let mut guard = state.lock().unwrap();
        let remaining = guard.stream.length().saturating_sub(guard.buffer.len());
        if remaining == 0 {
            let algorithm = guard.tagged_algorithm;
            let bytes = std::mem::take(&mut guard.buffer);
            let on_done = guard.on_done.take();
            drop(guard);
            if let Some(on_done) = on_done {
                on_done(Ok(ReceivedMessage {
                    bytes,
                    compressed_with: algorithm,
                }));
            }
            return;
        }
        let continuation_state = state.clone();
        let ready_now = guard
            .stream
            .next(remaining, Box::new(move || drive(continuation_state)));
        if !ready_now {
            return;
        }
        match guard.stream.pull() {
            Ok(slice) => {
                guard.buffer.extend_from_slice(&slice);
                // loop again with the lock re-acquired next iteration
            }
            Err(error) => {
                let on_done = guard.on_done.take();
                drop(guard);
                if let Some(on_done) = on_done {
                    on_done(Err(error));
                }
                return;
            }
        }
    }
}

/// Pulls slices from a [`ByteStream`] into a buffer until the stream is
/// exhausted (§4.8).
pub struct MessageReceiver;

impl MessageReceiver {
    /// Begins receiving `stream`. `on_done` is invoked exactly once, from
    /// whichever thread happens to deliver the last needed slice (possibly
    /// the calling thread, if every slice was ready immediately).
    ///
    /// If `write_internal_compress` is set and `message_algorithm` is
    /// non-identity, the assembled buffer is tagged with that algorithm
    /// rather than decompressed (§4.8's "compressed buffer" path).
    pub fn receive(
        stream: Box<dyn ByteStream>,
        write_internal_compress: bool,
        message_algorithm: CompressionAlgorithm,
        on_done: impl FnOnce(Result<ReceivedMessage, Status>) + Send + 'static,
    ) {
        let tagged_algorithm = if write_internal_compress && message_algorithm != CompressionAlgorithm::Identity {
            Some(message_algorithm)
        } else {
            None
        };
        let state = Arc::new(Mutex::new(ReceiveLoopState {
            stream,
            buffer: Vec::new(),
            tagged_algorithm,
            on_done: Some(Box::new(on_done)),
        }));
        drive(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[derive(Debug)]
    struct ReadyStream {
        chunks: Vec<Vec<u8>>,
        total_len: usize,
        delivered: usize,
    }

    impl ReadyStream {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            let total_len = chunks.iter().map(|c| c.len()).sum();
            Self {
                chunks,
                total_len,
                delivered: 0,
            }
        }
    }

    impl ByteStream for ReadyStream {
        fn length(&self) -> usize {
            self.total_len
        }

        fn next(&mut self, _max_bytes: usize, _continuation: crate::transport::StreamContinuation) -> bool {
            true
        }

        fn pull(&mut self) -> Result<Vec<u8>, Status> {
            if self.delivered >= self.chunks.len() {
                return Ok(Vec::new());
            }
            let chunk = self.chunks[self.delivered].clone();
            self.delivered += 1;
            Ok(chunk)
        }
    }

    #[test]
    fn assembles_message_from_multiple_ready_chunks() {
        let stream = ReadyStream::new(vec![vec![1, 2, 3], vec![4, 5, 6, 7]]);
        let (tx, rx) = mpsc::channel();
        MessageReceiver::receive(Box::new(stream), false, CompressionAlgorithm::Identity, move |result| {
            tx.send(result).unwrap();
        });
        let received = rx.recv().unwrap().unwrap();
        assert_eq!(received.bytes, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(received.compressed_with.is_none());
    }

    #[test]
    fn race_gate_initial_metadata_first_yields_no_message_pending() {
        let gate = InboundRaceGate::new();
        assert!(matches!(
            gate.on_initial_metadata_ready(),
            InitialMetadataAction::NoMessagePending
        ));
    }

    #[test]
    fn race_gate_message_first_is_deferred_then_released_by_initial_metadata() {
        let gate = InboundRaceGate::new();
        let pending = PendingMessage {
            bctl: BatchControl::test_stub(),
            stream: Some(Box::new(ReadyStream::new(vec![vec![7, 7, 7]]))),
            error: None,
        };
        assert!(matches!(gate.on_message_ready(pending), MessageReadyAction::Defer));

        match gate.on_initial_metadata_ready() {
            InitialMetadataAction::ProcessDeferredMessage(deferred) => {
                let stream = deferred.stream.expect("deferred stream");
                assert_eq!(stream.length(), 3);
            }
            InitialMetadataAction::NoMessagePending => panic!("expected deferred message"),
        }
    }

    #[test]
    fn race_gate_initial_metadata_first_then_message_ready_processes_immediately() {
        let gate = InboundRaceGate::new();
        assert!(matches!(
            gate.on_initial_metadata_ready(),
            InitialMetadataAction::NoMessagePending
        ));
        let pending = PendingMessage {
            bctl: BatchControl::test_stub(),
            stream: Some(Box::new(ReadyStream::new(vec![vec![1]]))),
            error: None,
        };
        match gate.on_message_ready(pending) {
            MessageReadyAction::ProcessNow(deferred) => {
                assert!(deferred.stream.is_some());
            }
            MessageReadyAction::Defer => panic!("expected immediate processing"),
        }
    }
}
