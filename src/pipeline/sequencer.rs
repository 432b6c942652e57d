//! Sequencer station: merges all branches back into segment order.
//!
//! Frames of the segment under the release cursor stream out as they
//! arrive. Frames of later segments wait in a pending buffer until the
//! cursor reaches them. The cursor moves on when the end frame of its
//! segment is seen, or when turn bookkeeping shows its segment can never
//! exist (end of turn, cancellation).
//!
//! A branch that never delivers its end frame stalls the cursor. That is
//! treated as waiting, not as an error; the synthesis watchdog is what
//! guarantees end frames.

use crate::pipeline::error::StationError;
use crate::pipeline::reorder::ReorderBuffer;
use crate::pipeline::segment::TurnLedger;
use crate::pipeline::station::Station;
use crate::pipeline::types::{BranchOutput, ResultFrame, SegmentKey, TurnSignal};
use crossbeam_channel::Sender;

/// Release progress of a segment as seen by the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    /// Behind the cursor; frames are buffered.
    Waiting,
    /// Under the cursor; frames stream out live.
    Streaming,
    /// Fully emitted, or skipped by cancellation.
    Released,
}

pub struct SequencerStation {
    cursor: SegmentKey,
    pending: ReorderBuffer<SegmentKey, ResultFrame>,
    ledger: TurnLedger,
    feedback: Option<Sender<SegmentKey>>,
    released: u64,
    emitted: u64,
    discarded: u64,
}

impl SequencerStation {
    pub fn new() -> Self {
        Self {
            cursor: SegmentKey::first_of(0),
            pending: ReorderBuffer::new(),
            ledger: TurnLedger::new(),
            feedback: None,
            released: 0,
            emitted: 0,
            discarded: 0,
        }
    }

    /// Reports every released segment on `feedback`.
    pub fn with_feedback(mut self, feedback: Sender<SegmentKey>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    /// Segment currently allowed to stream.
    pub fn cursor(&self) -> SegmentKey {
        self.cursor
    }

    /// Frames waiting for the cursor.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Segments released so far.
    pub fn released_segments(&self) -> u64 {
        self.released
    }

    pub fn release_state(&self, key: SegmentKey) -> ReleaseState {
        if key < self.cursor || self.ledger.is_cancelled(key.turn) {
            ReleaseState::Released
        } else if key == self.cursor {
            ReleaseState::Streaming
        } else {
            ReleaseState::Waiting
        }
    }

    /// Records one branch output; returns the frames now releasable, in order.
    pub fn handle(&mut self, input: BranchOutput) -> Vec<ResultFrame> {
        let mut out = Vec::new();
        match input {
            BranchOutput::Frame(frame) => self.on_frame(frame, &mut out),
            BranchOutput::Signal(TurnSignal::TurnEnd { turn, segments }) => {
                // Every branch forwards the signal; only the first one counts.
                if self.ledger.close_turn(turn, segments) {
                    tracing::debug!(turn, segments, "turn end recorded");
                    self.normalize(&mut out);
                }
            }
            BranchOutput::Signal(TurnSignal::Cancel { turn }) => {
                if self.ledger.cancel_through(turn) {
                    let dropped = self
                        .pending
                        .discard_below(&SegmentKey::first_of(turn + 1));
                    self.discarded += dropped as u64;
                    tracing::debug!(turn, dropped, "cancelled turn discarded");
                    self.normalize(&mut out);
                }
            }
        }
        self.emitted += out.len() as u64;
        out
    }

    fn on_frame(&mut self, frame: ResultFrame, out: &mut Vec<ResultFrame>) {
        let key = frame.key;
        if key < self.cursor || self.ledger.is_cancelled(key.turn) {
            self.discarded += 1;
            tracing::trace!(%key, cursor = %self.cursor, "late frame discarded");
            return;
        }
        if key != self.cursor {
            tracing::trace!(%key, cursor = %self.cursor, "frame buffered");
            self.pending.push(key, frame);
            return;
        }

        let ended = frame.is_end();
        out.push(frame);
        if ended {
            self.release(out);
        }
    }

    /// Releases the cursor segment and every complete run behind it.
    fn release(&mut self, out: &mut Vec<ResultFrame>) {
        loop {
            let done = self.cursor;
            self.released += 1;
            if let Some(feedback) = &self.feedback
                && feedback.send(done).is_err()
            {
                self.feedback = None;
            }
            self.cursor = self.ledger.successor(done);
            self.ledger.prune_below(self.cursor.turn);
            tracing::debug!(released = %done, cursor = %self.cursor, "segment released");

            if !self.drain(out) {
                return;
            }
        }
    }

    /// Emits what is pending for the cursor. Returns true when that
    /// included the segment's end frame.
    fn drain(&mut self, out: &mut Vec<ResultFrame>) -> bool {
        let frames = self.pending.take(&self.cursor);
        if frames.is_empty() {
            return false;
        }
        tracing::trace!(key = %self.cursor, frames = frames.len(), "draining pending frames");

        for frame in frames {
            let ended = frame.is_end();
            out.push(frame);
            if ended {
                return true;
            }
        }
        false
    }

    /// Moves the cursor past closed and cancelled turns.
    fn normalize(&mut self, out: &mut Vec<ResultFrame>) {
        let normalized = self.ledger.normalize(self.cursor);
        if normalized == self.cursor {
            return;
        }
        tracing::trace!(from = %self.cursor, to = %normalized, "cursor crossed turn boundary");
        self.cursor = normalized;
        self.ledger.prune_below(self.cursor.turn);
        if self.drain(out) {
            self.release(out);
        }
    }
}

impl Default for SequencerStation {
    fn default() -> Self {
        Self::new()
    }
}

impl Station for SequencerStation {
    type Input = BranchOutput;
    type Output = ResultFrame;

    fn name(&self) -> &'static str {
        "sequencer"
    }

    fn process(&mut self, input: BranchOutput) -> Result<Vec<ResultFrame>, StationError> {
        Ok(self.handle(input))
    }

    fn shutdown(&mut self) {
        self.feedback = None;
        if !self.pending.is_empty() {
            tracing::warn!(
                cursor = %self.cursor,
                pending = self.pending.len(),
                "sequencer stopped with unreleased frames"
            );
        }
        tracing::debug!(
            released = self.released,
            emitted = self.emitted,
            discarded = self.discarded,
            "sequencer closed"
        );
    }
}
