//! Tagger station: splits the token stream into voice segments.
//!
//! Every run of content between two voice markers becomes a segment with a
//! turn-scoped ordinal. Content of the frontmost segment streams straight
//! through; content of any later segment is held until that segment
//! becomes frontmost and is then flushed in one burst.

use crate::pipeline::error::StationError;
use crate::pipeline::marker::{MarkerScanner, Piece};
use crate::pipeline::reorder::ReorderBuffer;
use crate::pipeline::segment::{OrdinalCounter, Segment, SegmentState, TurnLedger};
use crate::pipeline::station::{FeedbackStation, Station};
use crate::pipeline::types::{
    ContentBody, ContentFrame, Dispatch, SegmentKey, Token, TurnId, TurnSignal, VoiceMarker,
};
use crate::synth::AbortHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// When the frontmost segment hands the front over to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// As soon as the frontmost segment closes. Dispatch order equals
    /// arrival order; only completion order may differ.
    #[default]
    OnClose,
    /// Only after the sequencer reports the frontmost segment fully
    /// released. At most one segment is in synthesis at a time.
    OnRelease,
}

impl std::str::FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-close" | "close" => Ok(DispatchPolicy::OnClose),
            "on-release" | "release" => Ok(DispatchPolicy::OnRelease),
            other => Err(format!(
                "unknown dispatch policy '{other}' (expected on-close or on-release)"
            )),
        }
    }
}

/// Station that detects voice markers and assigns segment ordinals.
pub struct TaggerStation {
    scanner: MarkerScanner,
    default_voice: VoiceMarker,
    policy: DispatchPolicy,
    /// Id the next opened turn gets.
    next_turn: TurnId,
    /// Ordinal source of the open turn.
    turn: Option<OrdinalCounter>,
    /// Voice announced by the last marker, waiting for its first content.
    pending_voice: Option<VoiceMarker>,
    /// Whitespace at the start of a turn, before any marker or content.
    leading: String,
    /// Segment currently receiving content.
    current: Option<SegmentKey>,
    /// Segments the tagger still owns.
    segments: BTreeMap<SegmentKey, Segment>,
    /// Content of segments that are not frontmost yet.
    held: ReorderBuffer<SegmentKey, ContentFrame>,
    /// Only this segment may stream to the gates.
    frontier: SegmentKey,
    ledger: TurnLedger,
    /// Branches to stop directly on cancel.
    aborts: Vec<AbortHandle>,
}

impl TaggerStation {
    /// Creates a tagger recognizing `markers`; unmarked text goes to `default_voice`.
    pub fn new(markers: impl IntoIterator<Item = VoiceMarker>, default_voice: VoiceMarker) -> Self {
        Self {
            scanner: MarkerScanner::new(markers),
            default_voice,
            policy: DispatchPolicy::default(),
            next_turn: 0,
            turn: None,
            pending_voice: None,
            leading: String::new(),
            current: None,
            segments: BTreeMap::new(),
            held: ReorderBuffer::new(),
            frontier: SegmentKey::first_of(0),
            ledger: TurnLedger::new(),
            aborts: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Branches whose running synthesis a cancel stops at once, without
    /// waiting for the cancel signal to travel down the branch.
    pub fn with_abort_handles(mut self, aborts: Vec<AbortHandle>) -> Self {
        self.aborts = aborts;
        self
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Segment currently allowed to stream.
    pub fn frontier(&self) -> SegmentKey {
        self.frontier
    }

    /// Turn currently receiving tokens.
    pub fn open_turn(&self) -> Option<TurnId> {
        self.turn.as_ref().map(OrdinalCounter::turn)
    }

    /// State of a segment the tagger still owns, `Dispatched` for segments
    /// it already handed over, `None` for keys it never assigned.
    pub fn segment_state(&self, key: SegmentKey) -> Option<SegmentState> {
        if let Some(segment) = self.segments.get(&key) {
            return Some(segment.state);
        }
        let assigned = match &self.turn {
            Some(counter) if counter.turn() == key.turn => key.ordinal < counter.assigned(),
            _ => key.turn < self.next_turn && !self.ledger.is_cancelled(key.turn),
        };
        assigned.then_some(SegmentState::Dispatched)
    }

    /// Number of content frames held back.
    pub fn held_frames(&self) -> usize {
        self.held.len()
    }

    /// Feeds one token; returns what goes out to the gates.
    pub fn handle_token(&mut self, token: Token) -> Vec<Dispatch> {
        let mut out = Vec::new();
        match token {
            Token::Text(text) => self.on_text(&text, &mut out),
            Token::Voice(marker) => {
                if self.scanner.lookup(marker.as_str()).is_some() {
                    self.ensure_turn();
                    self.on_marker(marker, &mut out);
                } else {
                    tracing::debug!(marker = %marker, "unknown voice marker kept as content");
                    self.ensure_turn();
                    self.append(marker.as_str(), &mut out);
                }
            }
            Token::StartOfResponse | Token::EndOfResponse => self.end_turn(&mut out),
            Token::Cancel => self.cancel(&mut out),
        }
        out
    }

    /// The sequencer fully released `key`.
    pub fn handle_release(&mut self, key: SegmentKey) -> Vec<Dispatch> {
        let mut out = Vec::new();
        if self.policy != DispatchPolicy::OnRelease {
            return out;
        }
        if key < self.frontier {
            tracing::trace!(%key, frontier = %self.frontier, "stale release ignored");
            return out;
        }
        self.segments.remove(&key);
        self.frontier = self.ledger.successor(key);
        tracing::trace!(%key, frontier = %self.frontier, "release advanced frontier");
        self.promote(&mut out);
        self.ledger.prune_below(self.frontier.turn);
        out
    }

    fn on_text(&mut self, text: &str, out: &mut Vec<Dispatch>) {
        self.ensure_turn();
        for piece in self.scanner.scan(text) {
            match piece {
                Piece::Text(content) => self.append(content, out),
                Piece::Marker(marker) => self.on_marker(marker, out),
            }
        }
    }

    fn ensure_turn(&mut self) -> &mut OrdinalCounter {
        let next_turn = &mut self.next_turn;
        self.turn.get_or_insert_with(|| {
            let counter = OrdinalCounter::new(*next_turn);
            *next_turn += 1;
            tracing::debug!(turn = counter.turn(), "turn opened");
            counter
        })
    }

    fn on_marker(&mut self, marker: VoiceMarker, out: &mut Vec<Dispatch>) {
        self.close_current(out);
        self.leading.clear();
        self.pending_voice = Some(marker);
    }

    fn append(&mut self, content: &str, out: &mut Vec<Dispatch>) {
        if let Some(key) = self.current {
            if !content.is_empty() {
                self.emit(key, ContentBody::Text(content.to_string()), out);
            }
            return;
        }

        if self.pending_voice.is_some() {
            // Whitespace separating a marker from its content is not content.
            let trimmed = content.trim_start();
            if !trimmed.is_empty() {
                let key = self.open_segment(out);
                self.emit(key, ContentBody::Text(trimmed.to_string()), out);
            }
            return;
        }

        // Unmarked text. Leading whitespace waits until real content shows
        // whether it opens a default-voice segment or precedes a marker.
        self.leading.push_str(content);
        if self.leading.trim().is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.leading);
        let key = self.open_segment(out);
        self.emit(key, ContentBody::Text(text), out);
    }

    fn open_segment(&mut self, out: &mut Vec<Dispatch>) -> SegmentKey {
        let key = self.ensure_turn().next_key();
        let voice = self
            .pending_voice
            .take()
            .unwrap_or_else(|| self.default_voice.clone());
        tracing::debug!(%key, voice = %voice, live = key == self.frontier, "segment opened");
        self.segments.insert(key, Segment::open(key, voice));
        self.current = Some(key);
        self.emit(key, ContentBody::Begin, out);
        key
    }

    fn close_current(&mut self, out: &mut Vec<Dispatch>) {
        let Some(key) = self.current.take() else {
            return;
        };
        if let Some(segment) = self.segments.get_mut(&key) {
            segment.close();
            tracing::debug!(%key, voice = %segment.voice, "segment closed");
        }
        self.emit(key, ContentBody::End, out);

        if key == self.frontier {
            self.segments.remove(&key);
            if self.policy == DispatchPolicy::OnClose {
                self.frontier = self.ledger.successor(key);
                self.promote(out);
            }
        }
    }

    /// Sends a frame of `key` out if it is frontmost, holds it otherwise.
    fn emit(&mut self, key: SegmentKey, body: ContentBody, out: &mut Vec<Dispatch>) {
        let Some(segment) = self.segments.get(&key) else {
            return;
        };
        let live = key == self.frontier;
        let frame = ContentFrame {
            key,
            voice: segment.voice.clone(),
            body,
            live,
        };
        if live {
            out.push(Dispatch::Content(frame));
        } else {
            tracing::trace!(%key, frontier = %self.frontier, "content held");
            self.held.push(key, frame);
        }
    }

    /// Flushes whatever became frontmost, stepping on while frontmost
    /// segments are already closed (on-close policy only).
    fn promote(&mut self, out: &mut Vec<Dispatch>) {
        loop {
            let key = self.frontier;
            if self.held.contains(&key) {
                self.flush(key, out);
            }
            let closed = self.segments.get(&key).is_some_and(|s| !s.is_open());
            if !closed {
                break;
            }
            self.segments.remove(&key);
            if self.policy != DispatchPolicy::OnClose {
                break;
            }
            self.frontier = self.ledger.successor(key);
        }
    }

    /// Releases the held content of `key` as one burst.
    fn flush(&mut self, key: SegmentKey, out: &mut Vec<Dispatch>) {
        let frames = self.held.take(&key);
        tracing::debug!(%key, frames = frames.len(), "flushing held segment");

        let mut text = String::new();
        let mut template: Option<ContentFrame> = None;
        for frame in frames {
            match frame.body {
                ContentBody::Text(chunk) => {
                    text.push_str(&chunk);
                    template.get_or_insert(ContentFrame {
                        body: ContentBody::Begin,
                        ..frame
                    });
                }
                ContentBody::Begin | ContentBody::End => {
                    if let Some(base) = template.take()
                        && !text.is_empty()
                    {
                        out.push(Dispatch::Content(ContentFrame {
                            body: ContentBody::Text(std::mem::take(&mut text)),
                            ..base
                        }));
                    }
                    out.push(Dispatch::Content(frame));
                }
            }
        }
        if let Some(base) = template
            && !text.is_empty()
        {
            out.push(Dispatch::Content(ContentFrame {
                body: ContentBody::Text(text),
                ..base
            }));
        }
    }

    fn end_turn(&mut self, out: &mut Vec<Dispatch>) {
        if self.turn.is_none() {
            return;
        }
        self.close_current(out);
        self.pending_voice = None;
        self.leading.clear();
        let Some(counter) = self.turn.take() else {
            return;
        };

        let (turn, segments) = (counter.turn(), counter.assigned());
        self.ledger.close_turn(turn, segments);
        out.push(Dispatch::Signal(TurnSignal::TurnEnd { turn, segments }));
        tracing::debug!(turn, segments, "turn closed");

        let normalized = self.ledger.normalize(self.frontier);
        if normalized != self.frontier {
            self.frontier = normalized;
            self.promote(out);
        }
        self.ledger.prune_below(self.frontier.turn);
    }

    fn cancel(&mut self, out: &mut Vec<Dispatch>) {
        let turn = match self.turn.take() {
            Some(counter) => counter.turn(),
            None if self.next_turn > 0 => self.next_turn - 1,
            None => return,
        };

        self.current = None;
        self.pending_voice = None;
        self.leading.clear();
        self.segments.clear();
        let dropped = self.held.clear();

        if !self.ledger.cancel_through(turn) {
            return;
        }
        let aborted = self
            .aborts
            .iter()
            .filter(|branch| branch.cancel_through(turn))
            .count();
        out.push(Dispatch::Signal(TurnSignal::Cancel { turn }));
        self.frontier = self.ledger.normalize(self.frontier);
        self.ledger.prune_below(self.frontier.turn);
        tracing::debug!(turn, dropped, aborted, frontier = %self.frontier, "turn cancelled");
    }
}

impl Station for TaggerStation {
    type Input = Token;
    type Output = Dispatch;

    fn name(&self) -> &'static str {
        "tagger"
    }

    fn process(&mut self, token: Token) -> Result<Vec<Dispatch>, StationError> {
        Ok(self.handle_token(token))
    }
}

impl FeedbackStation for TaggerStation {
    type Feedback = SegmentKey;

    fn feedback(&mut self, released: SegmentKey) -> Result<Vec<Dispatch>, StationError> {
        Ok(self.handle_release(released))
    }

    fn is_settled(&self) -> bool {
        self.held.is_empty()
    }
}
