//! Watchdog around a synthesizer.
//!
//! A collaborator that never answers would stall ordered release forever.
//! The guard runs the collaborator on its own worker thread and turns an
//! overdue call into a `SynthesisTimeout` error, and a call whose turn is
//! cancelled meanwhile into `SynthesisAborted`.

use crate::error::{PolyvoxError, Result};
use crate::pipeline::types::{Payload, TurnId};
use crate::synth::abort::AbortWatch;
use crate::synth::synthesizer::{SynthesisRequest, Synthesizer};
use crossbeam_channel::{Receiver, Sender, bounded, never, select, unbounded};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = (u64, SynthesisRequest);
type Outcome = (u64, Result<Vec<Payload>>);

/// Runs synthesis calls with a deadline.
///
/// Calls are served in order by one worker. A call that misses its
/// deadline is reported as failed and the collaborator is asked to abort;
/// its late result is discarded when it eventually arrives.
pub struct SynthesisGuard {
    synthesizer: Arc<dyn Synthesizer>,
    timeout: Duration,
    jobs: Option<Sender<Job>>,
    outcomes: Receiver<Outcome>,
    abort: Option<AbortWatch>,
    next_id: u64,
}

impl SynthesisGuard {
    /// Starts the worker thread for `synthesizer`.
    pub fn spawn(synthesizer: Arc<dyn Synthesizer>, timeout: Duration) -> std::io::Result<Self> {
        let (jobs_tx, jobs_rx) = bounded::<Job>(1);
        let (outcomes_tx, outcomes_rx) = unbounded::<Outcome>();

        let worker = Arc::clone(&synthesizer);
        thread::Builder::new()
            .name(format!("polyvox-synth-{}", synthesizer.voice_name()))
            .spawn(move || {
                for (id, request) in jobs_rx {
                    let outcome = worker.synthesize(&request);
                    if outcomes_tx.send((id, outcome)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            synthesizer,
            timeout,
            jobs: Some(jobs_tx),
            outcomes: outcomes_rx,
            abort: None,
            next_id: 0,
        })
    }

    /// Stops waiting as soon as the turn of the running call is cancelled.
    pub fn watching(mut self, abort: AbortWatch) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Synthesizes `request`, failing once the deadline passes.
    pub fn synthesize(&mut self, request: SynthesisRequest) -> Result<Vec<Payload>> {
        let deadline = Instant::now() + self.timeout;
        let turn = request.key.turn;
        self.next_id += 1;
        let id = self.next_id;

        let jobs = self.jobs.as_ref().ok_or_else(|| self.worker_gone())?;
        // The worker may still be busy with an abandoned call.
        match jobs.send_deadline((id, request), deadline) {
            Ok(()) => {}
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => return Err(self.overdue()),
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                return Err(self.worker_gone());
            }
        }

        enum Wait {
            Done(Result<Vec<Payload>>),
            Stale(u64),
            Cancelled,
            Woken,
            Unwatched,
            WorkerGone,
            Overdue,
        }

        let mut wakeups = self.abort.as_ref().map_or_else(never, |a| a.wakeups().clone());
        loop {
            let wait = select! {
                recv(self.outcomes) -> msg => match msg {
                    Ok((done, outcome)) if done == id => Wait::Done(outcome),
                    Ok((stale, _)) => Wait::Stale(stale),
                    Err(_) => Wait::WorkerGone,
                },
                recv(wakeups) -> msg => match msg {
                    Ok(_) if self.is_cancelled(turn) => Wait::Cancelled,
                    Ok(_) => Wait::Woken,
                    Err(_) => Wait::Unwatched,
                },
                default(deadline.saturating_duration_since(Instant::now())) => Wait::Overdue,
            };

            match wait {
                Wait::Done(outcome) => return outcome,
                Wait::Stale(call) => {
                    tracing::trace!(
                        voice = self.synthesizer.voice_name(),
                        call,
                        "discarding late synthesis result"
                    );
                }
                Wait::Cancelled => {
                    return Err(PolyvoxError::SynthesisAborted {
                        voice: self.synthesizer.voice_name().to_string(),
                    });
                }
                Wait::Woken => {}
                Wait::Unwatched => wakeups = never(),
                Wait::WorkerGone => return Err(self.worker_gone()),
                Wait::Overdue => return Err(self.overdue()),
            }
        }
    }

    fn is_cancelled(&self, turn: TurnId) -> bool {
        self.abort.as_ref().is_some_and(|a| a.is_cancelled(turn))
    }

    fn overdue(&self) -> PolyvoxError {
        self.synthesizer.abort();
        PolyvoxError::SynthesisTimeout {
            voice: self.synthesizer.voice_name().to_string(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn worker_gone(&self) -> PolyvoxError {
        PolyvoxError::Synthesis {
            voice: self.synthesizer.voice_name().to_string(),
            message: "synthesis worker stopped".to_string(),
        }
    }
}

impl Drop for SynthesisGuard {
    fn drop(&mut self) {
        // Closing the job channel lets the worker exit after its current
        // call; a hung collaborator keeps it alive, so it is not joined.
        self.jobs.take();
    }
}
