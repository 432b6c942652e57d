//! Conversation record built from the merged output.
//!
//! Each released segment becomes one entry whose text starts with its
//! voice marker on a line of its own, the same convention the generator
//! used to tag its response. Feeding the entries back as context keeps
//! the model writing in that convention.

use crate::error::Result;
use crate::pipeline::sink::FrameSink;
use crate::pipeline::types::{FrameBody, ResultFrame, SegmentKey, TurnId, VoiceMarker};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One spoken segment of an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub turn: TurnId,
    pub ordinal: u64,
    pub voice: VoiceMarker,
    /// `"<marker>\n<spoken text>"`.
    pub text: String,
}

impl HistoryEntry {
    /// Spoken text without the marker line.
    pub fn spoken(&self) -> &str {
        self.text
            .split_once('\n')
            .map_or(self.text.as_str(), |(_, rest)| rest)
    }
}

/// Shared, append-only list of history entries.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory(Arc<Mutex<Vec<HistoryEntry>>>);

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: HistoryEntry) {
        self.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    /// Entries of one turn, in segment order.
    pub fn turn(&self, turn: TurnId) -> Vec<HistoryEntry> {
        self.lock()
            .iter()
            .filter(|e| e.turn == turn)
            .cloned()
            .collect()
    }

    /// A whole turn re-joined into one tagged response.
    pub fn tagged_response(&self, turn: TurnId) -> String {
        self.turn(turn)
            .into_iter()
            .map(|e| e.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

struct OpenEntry {
    key: SegmentKey,
    voice: VoiceMarker,
    spoken: String,
}

/// Sink that turns released segments into history entries.
///
/// Only transcript payloads contribute text. Segments that end up with no
/// spoken text (failed or empty synthesis) leave no entry.
pub struct HistoryRecorder {
    history: ConversationHistory,
    open: Option<OpenEntry>,
}

impl HistoryRecorder {
    pub fn new(history: ConversationHistory) -> Self {
        Self {
            history,
            open: None,
        }
    }
}

impl FrameSink for HistoryRecorder {
    fn handle(&mut self, frame: &ResultFrame) -> Result<()> {
        match &frame.body {
            FrameBody::Start => {
                self.open = Some(OpenEntry {
                    key: frame.key,
                    voice: frame.voice.clone(),
                    spoken: String::new(),
                });
            }
            FrameBody::Payload(payload) => {
                if let Some(open) = self.open.as_mut().filter(|o| o.key == frame.key)
                    && let Some(text) = payload.as_transcript()
                {
                    open.spoken.push_str(text);
                }
            }
            FrameBody::End => {
                let Some(open) = self.open.take().filter(|o| o.key == frame.key) else {
                    return Ok(());
                };
                let spoken = open.spoken.trim();
                if spoken.is_empty() {
                    tracing::debug!(key = %open.key, "segment without spoken text left out of history");
                    return Ok(());
                }
                self.history.push(HistoryEntry {
                    turn: open.key.turn,
                    ordinal: open.key.ordinal,
                    text: format!("{}\n{}", open.voice, spoken),
                    voice: open.voice,
                });
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "history"
    }
}
