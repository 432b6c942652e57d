//! Data types flowing between pipeline stations.
//!
//! Token → Tagger → [`Dispatch`] → Gate → Synthesis → [`SynthEvent`] →
//! Retagger → [`BranchOutput`] → Sequencer → [`ResultFrame`] → sinks.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Per-turn sequence number of a segment.
pub type Ordinal = u64;

/// Sequence number of a generation turn.
pub type TurnId = u64;

/// Reordering key: the turn a segment belongs to and its ordinal within it.
///
/// Keys order by turn first, so every segment of turn `n` sorts before any
/// segment of turn `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentKey {
    pub turn: TurnId,
    pub ordinal: Ordinal,
}

impl SegmentKey {
    pub const fn new(turn: TurnId, ordinal: Ordinal) -> Self {
        Self { turn, ordinal }
    }

    /// Key of the first segment of `turn`.
    pub const fn first_of(turn: TurnId) -> Self {
        Self { turn, ordinal: 0 }
    }

    /// Key of the following segment in the same turn.
    pub const fn next_in_turn(self) -> Self {
        Self {
            turn: self.turn,
            ordinal: self.ordinal + 1,
        }
    }
}

impl fmt::Display for SegmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.turn, self.ordinal)
    }
}

/// Label of a voice, as it appears inline in generated text (e.g. `AA`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceMarker(String);

impl VoiceMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VoiceMarker {
    fn from(marker: &str) -> Self {
        Self::new(marker)
    }
}

impl Borrow<str> for VoiceMarker {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One element of the upstream token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Generated text chunk. May contain inline voice markers.
    Text(String),
    /// Explicit voice marker delivered out of band.
    Voice(VoiceMarker),
    /// The generator started a new response.
    StartOfResponse,
    /// The generator finished the current response.
    EndOfResponse,
    /// The current turn was interrupted.
    Cancel,
}

impl Token {
    pub fn text(text: impl Into<String>) -> Self {
        Token::Text(text.into())
    }

    pub fn voice(marker: impl Into<String>) -> Self {
        Token::Voice(VoiceMarker::new(marker))
    }
}

/// Turn-level control signal broadcast to every branch.
///
/// Branches forward these untouched so the sequencer learns turn
/// boundaries no matter which branch finishes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnSignal {
    /// Turn `turn` is closed and produced `segments` segments.
    TurnEnd { turn: TurnId, segments: u64 },
    /// Everything up to and including `turn` is discarded.
    Cancel { turn: TurnId },
}

/// Body of a content frame emitted by the tagger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBody {
    /// A segment starts; its voice owns the following text.
    Begin,
    /// Segment text.
    Text(String),
    /// The segment is closed; no more text follows.
    End,
}

/// A piece of segment content handed to the gates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFrame {
    pub key: SegmentKey,
    pub voice: VoiceMarker,
    pub body: ContentBody,
    /// True when forwarded as it arrived, false when released from the
    /// tagger's holding buffer in a burst.
    pub live: bool,
}

/// Tagger output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Content(ContentFrame),
    Signal(TurnSignal),
}

impl Dispatch {
    /// Voice owning this frame. Signals belong to every voice.
    pub fn voice(&self) -> Option<&VoiceMarker> {
        match self {
            Dispatch::Content(frame) => Some(&frame.voice),
            Dispatch::Signal(_) => None,
        }
    }
}

/// Result data produced by a synthesis collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// PCM audio.
    Audio { samples: Vec<i16>, sample_rate: u32 },
    /// Text actually spoken, used for the conversation record.
    Transcript { text: String },
}

impl Payload {
    pub fn transcript(text: impl Into<String>) -> Self {
        Payload::Transcript { text: text.into() }
    }

    /// Spoken text carried by this payload, if any.
    pub fn as_transcript(&self) -> Option<&str> {
        match self {
            Payload::Transcript { text } => Some(text),
            Payload::Audio { .. } => None,
        }
    }
}

/// Synthesis stage output. Carries no voice: the synthesizer only
/// understands raw content.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthEvent {
    Begin(SegmentKey),
    Chunk(SegmentKey, Payload),
    /// The segment is done. `failed` is set when the collaborator failed
    /// or timed out; the segment is still complete.
    Complete { key: SegmentKey, failed: bool },
    Signal(TurnSignal),
}

/// Body of a result frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FrameBody {
    Start,
    Payload(Payload),
    End,
}

/// Retagged synthesis result: the sequencer's unit of reordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFrame {
    pub key: SegmentKey,
    pub voice: VoiceMarker,
    pub body: FrameBody,
}

impl ResultFrame {
    pub fn new(key: SegmentKey, voice: VoiceMarker, body: FrameBody) -> Self {
        Self { key, voice, body }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.body, FrameBody::Start)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.body, FrameBody::End)
    }
}

/// Retagger output: what the sequencer inbox receives from each branch.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchOutput {
    Frame(ResultFrame),
    Signal(TurnSignal),
}
