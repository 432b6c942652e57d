//! Cancelling synthesis from outside the branch thread.
//!
//! A synthesis station that is blocked inside a call only sees the cancel
//! signal queued behind that call once the call returns. The tagger holds
//! an [`AbortHandle`] per branch instead and cancels directly while it
//! processes the cancel token. The station checks its [`AbortWatch`] before
//! every call, and the watchdog wakes on it while waiting.

use crate::pipeline::types::TurnId;
use crate::synth::synthesizer::Synthesizer;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// `in_flight` value while no call runs.
const IDLE: u64 = 0;

#[derive(Debug, Default)]
struct AbortState {
    /// Every turn below this one is cancelled.
    cancelled_below: AtomicU64,
    /// Turn of the running call plus one, or `IDLE`.
    in_flight: AtomicU64,
}

/// Cancels one branch's synthesis. Clonable, usable from any thread.
#[derive(Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
    synthesizer: Arc<dyn Synthesizer>,
    wake: Sender<TurnId>,
}

/// Branch side of an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortWatch {
    state: Arc<AbortState>,
    wake: Receiver<TurnId>,
}

/// Creates the two ends for the branch driving `synthesizer`.
pub fn abort_pair(synthesizer: Arc<dyn Synthesizer>) -> (AbortHandle, AbortWatch) {
    let state = Arc::new(AbortState::default());
    let (wake_tx, wake_rx) = unbounded();
    (
        AbortHandle {
            state: Arc::clone(&state),
            synthesizer,
            wake: wake_tx,
        },
        AbortWatch {
            state,
            wake: wake_rx,
        },
    )
}

impl AbortHandle {
    pub fn voice_name(&self) -> &str {
        self.synthesizer.voice_name()
    }

    /// Cancels every turn up to and including `turn`.
    ///
    /// A running call of a cancelled turn is aborted at the collaborator.
    /// Returns true when that happened.
    pub fn cancel_through(&self, turn: TurnId) -> bool {
        let below = turn + 1;
        if self.state.cancelled_below.fetch_max(below, Ordering::SeqCst) >= below {
            return false;
        }
        if self.wake.send(turn).is_err() {
            tracing::trace!(voice = self.voice_name(), "branch already gone");
        }

        let in_flight = self.state.in_flight.load(Ordering::SeqCst);
        if in_flight == IDLE || in_flight > below {
            return false;
        }
        tracing::debug!(voice = self.voice_name(), turn, "aborting synthesis in flight");
        self.synthesizer.abort();
        true
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("voice", &self.voice_name())
            .field("state", &self.state)
            .finish()
    }
}

impl AbortWatch {
    pub fn is_cancelled(&self, turn: TurnId) -> bool {
        turn < self.state.cancelled_below.load(Ordering::SeqCst)
    }

    /// Marks a call for `turn` as running.
    ///
    /// Returns false, and marks nothing, when the turn is already cancelled.
    pub fn begin(&self, turn: TurnId) -> bool {
        // Publish before checking, so a concurrent cancel either sees the
        // call or is seen here.
        self.state.in_flight.store(turn + 1, Ordering::SeqCst);
        if self.is_cancelled(turn) {
            self.end();
            return false;
        }
        true
    }

    pub fn end(&self) {
        self.state.in_flight.store(IDLE, Ordering::SeqCst);
    }

    /// Receives the turn of every new cancellation.
    pub fn wakeups(&self) -> &Receiver<TurnId> {
        &self.wake
    }
}
