//! Segment and turn bookkeeping shared by the tagger and the sequencer.

use crate::pipeline::types::{Ordinal, SegmentKey, TurnId, VoiceMarker};
use std::collections::BTreeMap;

/// Lifecycle of a segment.
///
/// The tagger owns a segment while it is `Open` or `Closed`; from
/// `Dispatched` on the branch owns it, and it is `Completed` once its
/// retagger emitted the end frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Open,
    Closed,
    Dispatched,
    Completed,
}

/// A run of content owned by one voice.
#[derive(Debug, Clone)]
pub struct Segment {
    pub key: SegmentKey,
    pub voice: VoiceMarker,
    pub state: SegmentState,
}

impl Segment {
    pub fn open(key: SegmentKey, voice: VoiceMarker) -> Self {
        Self {
            key,
            voice,
            state: SegmentState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SegmentState::Open
    }

    pub fn close(&mut self) {
        if self.state == SegmentState::Open {
            self.state = SegmentState::Closed;
        }
    }
}

/// Records where turns end so a cursor can step across turn boundaries.
///
/// A cursor walking `(turn, 0), (turn, 1), …` only knows it has left a
/// turn once that turn's segment count is known. Cancelled turns are
/// skipped entirely.
#[derive(Debug, Default)]
pub struct TurnLedger {
    /// Segment count of every closed turn not yet pruned.
    closed: BTreeMap<TurnId, u64>,
    /// Every turn up to and including this one is cancelled.
    cancelled_through: Option<TurnId>,
}

impl TurnLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `turn` produced `segments` segments.
    ///
    /// Returns false when the turn was already closed or cancelled.
    pub fn close_turn(&mut self, turn: TurnId, segments: u64) -> bool {
        if self.is_cancelled(turn) || self.closed.contains_key(&turn) {
            return false;
        }
        self.closed.insert(turn, segments);
        true
    }

    /// Cancels every turn up to and including `turn`.
    ///
    /// Returns false when those turns were already cancelled.
    pub fn cancel_through(&mut self, turn: TurnId) -> bool {
        if self.is_cancelled(turn) {
            return false;
        }
        self.cancelled_through = Some(turn);
        self.closed = self.closed.split_off(&(turn + 1));
        true
    }

    pub fn is_cancelled(&self, turn: TurnId) -> bool {
        self.cancelled_through.is_some_and(|through| turn <= through)
    }

    /// Segment count of a closed turn.
    pub fn segments_in(&self, turn: TurnId) -> Option<u64> {
        self.closed.get(&turn).copied()
    }

    /// Moves `key` past cancelled turns and past the end of closed turns.
    pub fn normalize(&self, mut key: SegmentKey) -> SegmentKey {
        loop {
            if let Some(through) = self.cancelled_through
                && key.turn <= through
            {
                key = SegmentKey::first_of(through + 1);
                continue;
            }
            match self.closed.get(&key.turn) {
                Some(&count) if key.ordinal >= count => {
                    key = SegmentKey::first_of(key.turn + 1);
                }
                _ => return key,
            }
        }
    }

    /// Key released right after `key`.
    pub fn successor(&self, key: SegmentKey) -> SegmentKey {
        self.normalize(key.next_in_turn())
    }

    /// Forgets closed turns below `turn`.
    pub fn prune_below(&mut self, turn: TurnId) {
        self.closed = self.closed.split_off(&turn);
    }
}

/// Hands out ordinals for one turn.
///
/// Dropped and recreated at every turn boundary, so no ordinal of a
/// finished or cancelled turn can leak into the next one.
#[derive(Debug)]
pub struct OrdinalCounter {
    turn: TurnId,
    next: Ordinal,
}

impl OrdinalCounter {
    pub fn new(turn: TurnId) -> Self {
        Self { turn, next: 0 }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    /// Number of ordinals assigned so far.
    pub fn assigned(&self) -> u64 {
        self.next
    }

    pub fn next_key(&mut self) -> SegmentKey {
        let key = SegmentKey::new(self.turn, self.next);
        self.next += 1;
        key
    }
}
