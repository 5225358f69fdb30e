//! Stream reassembly.
//!
//! Accumulates ordered partial-content chunks tagged with a message id and
//! content kind into one final message. Pure state machine, no I/O, so
//! ordering and edge cases are unit-testable without a live transport.
//!
//! At most one stream is active at a time. A chunk whose message id differs
//! from the current accumulator starts a fresh stream; the interrupted
//! accumulation is dropped without emitting anything for it (the done-marker
//! for the superseded stream, should it ever arrive, is a no-op).

use tracing::warn;

use crate::protocol::{ContentKind, Message};

/// Output of one `ingest`/`finish` step.
#[derive(Debug, Clone, PartialEq)]
pub enum ReassemblyEvent {
    /// First chunk of a new stream.
    Started {
        id: String,
        chunk: String,
        kind: ContentKind,
    },
    /// Subsequent chunk, with the concatenated content so far.
    Chunk {
        id: String,
        chunk: String,
        accumulated: String,
        kind: ContentKind,
    },
    /// The stream finished; carries the full content as a final message.
    Done { message: Message },
}

#[derive(Debug)]
struct Accumulator {
    id: String,
    content: String,
    kind: ContentKind,
}

/// Reassembles server-pushed token streams. Resets per message.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    current: Option<Accumulator>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the stream currently being accumulated, if any.
    pub fn active_id(&self) -> Option<&str> {
        self.current.as_ref().map(|a| a.id.as_str())
    }

    /// Feed one chunk. Assumes in-order delivery per message id (the
    /// transport is ordered and reliable).
    pub fn ingest(&mut self, id: &str, chunk: &str, kind: ContentKind) -> ReassemblyEvent {
        match &mut self.current {
            Some(acc) if acc.id == id => {
                acc.content.push_str(chunk);
                ReassemblyEvent::Chunk {
                    id: id.to_string(),
                    chunk: chunk.to_string(),
                    accumulated: acc.content.clone(),
                    kind: acc.kind,
                }
            }
            other => {
                if let Some(dropped) = other.take() {
                    warn!(
                        dropped = %dropped.id,
                        superseded_by = %id,
                        partial_len = dropped.content.len(),
                        "incomplete stream superseded by new message id, discarding"
                    );
                }
                *other = Some(Accumulator {
                    id: id.to_string(),
                    content: chunk.to_string(),
                    kind,
                });
                ReassemblyEvent::Started {
                    id: id.to_string(),
                    chunk: chunk.to_string(),
                    kind,
                }
            }
        }
    }

    /// Close the stream identified by `id`. A done-marker for anything other
    /// than the tracked id (already superseded, or no stream at all) is a
    /// no-op.
    pub fn finish(&mut self, id: &str) -> Option<ReassemblyEvent> {
        match &self.current {
            Some(acc) if acc.id == id => {
                let acc = self.current.take()?;
                Some(ReassemblyEvent::Done {
                    message: Message::assistant(acc.id, acc.content, acc.kind),
                })
            }
            _ => None,
        }
    }
}
