//! Multi-voice pipeline that runs for the whole conversation.

use crate::defaults;
use crate::error::{PolyvoxError, Result};
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::gate::GateStation;
use crate::pipeline::history::{ConversationHistory, HistoryEntry, HistoryRecorder};
use crate::pipeline::retagger::RetaggerStation;
use crate::pipeline::sequencer::SequencerStation;
use crate::pipeline::sink::{FrameSink, SinkStation, SinkSummary};
use crate::pipeline::station::{StationRunner, spawn_broadcast};
use crate::pipeline::synthesis::{SynthesisMode, SynthesisStation};
use crate::pipeline::tagger::{DispatchPolicy, TaggerStation};
use crate::pipeline::types::{Dispatch, Token, VoiceMarker};
use crate::synth::Synthesizer;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Every valid voice marker; each needs exactly one branch.
    pub voices: Vec<VoiceMarker>,
    /// Voice owning text that precedes any marker.
    pub default_voice: VoiceMarker,
    pub dispatch: DispatchPolicy,
    pub synthesis_mode: SynthesisMode,
    /// Watchdog for synthesis calls. `None` trusts the collaborator.
    pub synthesis_timeout: Option<Duration>,
    /// How long `finish` waits for in-flight segments.
    pub shutdown_timeout: Duration,
    /// Channel buffer sizes
    pub token_buffer: usize,
    pub branch_buffer: usize,
    pub sequencer_buffer: usize,
    pub output_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            voices: vec![
                VoiceMarker::from(defaults::NARRATOR_MARKER),
                VoiceMarker::from(defaults::CHARACTER_MARKER),
            ],
            default_voice: VoiceMarker::from(defaults::DEFAULT_VOICE),
            dispatch: DispatchPolicy::default(),
            synthesis_mode: SynthesisMode::default(),
            synthesis_timeout: Some(Duration::from_millis(defaults::SYNTHESIS_TIMEOUT_MS)),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
            token_buffer: defaults::TOKEN_BUFFER,
            branch_buffer: defaults::BRANCH_BUFFER,
            sequencer_buffer: defaults::SEQUENCER_BUFFER,
            output_buffer: defaults::OUTPUT_BUFFER,
        }
    }
}

/// Synthesis branch of one voice.
#[derive(Clone)]
pub struct Branch {
    pub voice: VoiceMarker,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Branch {
    pub fn new(voice: VoiceMarker, synthesizer: Arc<dyn Synthesizer>) -> Self {
        Self { voice, synthesizer }
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("voice", &self.voice)
            .field("synthesizer", &self.synthesizer.voice_name())
            .finish()
    }
}

/// Outcome of a finished pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Frames released to the sinks.
    pub frames: u64,
    /// Segments released to the sinks.
    pub segments: u64,
    /// Conversation record, one entry per spoken segment.
    pub history: Vec<HistoryEntry>,
    /// False when the pipeline had to be abandoned at the shutdown deadline.
    pub drained: bool,
}

/// Clonable token input of a running pipeline.
#[derive(Debug, Clone)]
pub struct TokenSender(Sender<Token>);

impl TokenSender {
    pub fn send(&self, token: Token) -> Result<()> {
        self.0.send(token).map_err(|_| PolyvoxError::PipelineClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Token::text(text))
    }

    /// Closes the current turn.
    pub fn end_response(&self) -> Result<()> {
        self.send(Token::EndOfResponse)
    }

    /// Discards the current turn, or the last one if none is open.
    pub fn cancel(&self) -> Result<()> {
        self.send(Token::Cancel)
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    tokens: Option<TokenSender>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    summary_rx: Option<Receiver<SinkSummary>>,
    history: ConversationHistory,
    shutdown_timeout: Duration,
}

impl PipelineHandle {
    fn input(&self) -> Result<&TokenSender> {
        self.tokens.as_ref().ok_or(PolyvoxError::PipelineClosed)
    }

    pub fn send(&self, token: Token) -> Result<()> {
        self.input()?.send(token)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.input()?.send_text(text)
    }

    pub fn end_response(&self) -> Result<()> {
        self.input()?.end_response()
    }

    pub fn cancel(&self) -> Result<()> {
        self.input()?.cancel()
    }

    /// Extra token input, e.g. for an interrupt handler.
    ///
    /// `finish` only completes once every clone is dropped.
    pub fn token_sender(&self) -> Option<TokenSender> {
        self.tokens.clone()
    }

    /// Live view of the conversation record.
    pub fn history(&self) -> ConversationHistory {
        self.history.clone()
    }

    /// Closes the input and waits for everything in flight to be released.
    ///
    /// An open turn is ended first. Waits up to the configured shutdown
    /// timeout for the sinks to drain, then 1s for threads to finish.
    /// After the deadline, remaining threads are detached.
    pub fn finish(mut self) -> PipelineReport {
        if let Some(tokens) = self.tokens.take()
            && tokens.end_response().is_err()
        {
            tracing::debug!("pipeline input already closed");
        }
        self.running.store(false, Ordering::SeqCst);

        let summary = self
            .summary_rx
            .as_ref()
            .and_then(|rx| rx.recv_timeout(self.shutdown_timeout).ok());
        if summary.is_none() {
            tracing::warn!(
                timeout = ?self.shutdown_timeout,
                "pipeline did not drain before the shutdown deadline"
            );
        }

        let joined = self.join_threads(Duration::from_secs(1));
        let summary_ok = summary.is_some();
        let summary = summary.unwrap_or_default();
        PipelineReport {
            frames: summary.frames,
            segments: summary.segments,
            history: self.history.entries(),
            drained: summary_ok && joined,
        }
    }

    /// Joins finished threads until none is left or `grace` runs out.
    fn join_threads(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let poll_interval = Duration::from_millis(10);

        loop {
            let mut remaining = Vec::new();
            for handle in self.threads.drain(..) {
                if handle.is_finished() {
                    if let Err(panic_info) = handle.join() {
                        let msg = panic_info
                            .downcast_ref::<&str>()
                            .copied()
                            .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                            .unwrap_or("unknown panic");
                        tracing::error!("pipeline thread panicked: {msg}");
                    }
                } else {
                    remaining.push(handle);
                }
            }
            self.threads = remaining;

            if self.threads.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    threads = self.threads.len(),
                    "shutdown timeout, detaching pipeline threads"
                );
                // Dropping JoinHandles detaches threads; they die with the process.
                return false;
            }
            thread::sleep(poll_interval);
        }
    }

    /// Returns true while the pipeline accepts input and has live threads.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.threads.iter().any(|t| !t.is_finished())
    }
}

/// Multi-voice pipeline:
/// tokens → Tagger → {Gate → Synthesis → Retagger per voice} → Sequencer → sinks.
pub struct Pipeline {
    config: PipelineConfig,
    error_reporter: Arc<dyn ErrorReporter>,
}

impl Pipeline {
    /// Creates a new pipeline with default error reporter.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            error_reporter: Arc::new(LogReporter),
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Checks that every configured voice has exactly one branch.
    pub fn validate(&self, branches: &[Branch]) -> Result<()> {
        let voices: HashSet<&str> = self.config.voices.iter().map(VoiceMarker::as_str).collect();
        if voices.is_empty() {
            return Err(PolyvoxError::ConfigInvalidValue {
                key: "voices".to_string(),
                message: "at least one voice is required".to_string(),
            });
        }
        if !voices.contains(self.config.default_voice.as_str()) {
            return Err(PolyvoxError::UnknownVoice {
                marker: self.config.default_voice.to_string(),
            });
        }

        let mut seen = HashSet::new();
        for branch in branches {
            if !voices.contains(branch.voice.as_str()) {
                return Err(PolyvoxError::UnknownVoice {
                    marker: branch.voice.to_string(),
                });
            }
            if !seen.insert(branch.voice.as_str()) {
                return Err(PolyvoxError::DuplicateBranch {
                    marker: branch.voice.to_string(),
                });
            }
        }
        if let Some(missing) = self
            .config
            .voices
            .iter()
            .find(|v| !seen.contains(v.as_str()))
        {
            return Err(PolyvoxError::MissingBranch {
                marker: missing.to_string(),
            });
        }
        Ok(())
    }

    /// Starts the pipeline.
    ///
    /// # Arguments
    /// * `branches` - One synthesis branch per configured voice
    /// * `sinks` - Output handlers for the ordered result stream
    ///
    /// # Returns
    /// Handle to feed tokens and finish the pipeline
    pub fn start(
        self,
        branches: Vec<Branch>,
        mut sinks: Vec<Box<dyn FrameSink>>,
    ) -> Result<PipelineHandle> {
        self.validate(&branches)?;
        let config = &self.config;
        let reporter = &self.error_reporter;
        let mut threads: Vec<JoinHandle<()>> = Vec::new();

        let (token_tx, token_rx) = bounded::<Token>(config.token_buffer);
        let (dispatch_tx, dispatch_rx) = bounded::<Dispatch>(config.branch_buffer);
        let (sequencer_tx, sequencer_rx) = bounded(config.sequencer_buffer);
        let (output_tx, output_rx) = bounded(config.output_buffer);

        // One branch per voice. Gate inboxes are unbounded so the fanout
        // never blocks on a busy branch; a slow voice backs up in its own gate.
        let mut gate_inputs = Vec::with_capacity(branches.len());
        let mut aborts = Vec::with_capacity(branches.len());
        for branch in branches {
            let (gate_tx, gate_rx) = unbounded();
            let (synth_tx, synth_rx) = bounded(config.branch_buffer);
            let (retag_tx, retag_rx) = bounded(config.branch_buffer);
            gate_inputs.push(gate_tx);

            let mut synthesis = SynthesisStation::new(branch.voice.clone(), branch.synthesizer)
                .with_mode(config.synthesis_mode)
                .with_error_reporter(reporter.clone());
            if let Some(timeout) = config.synthesis_timeout {
                synthesis = synthesis.with_timeout(timeout)?;
            }
            aborts.push(synthesis.abort_handle());

            threads.push(supervise(StationRunner::spawn(
                GateStation::new(branch.voice.clone()),
                gate_rx,
                synth_tx,
                reporter.clone(),
            )));
            threads.push(supervise(StationRunner::spawn(
                synthesis,
                synth_rx,
                retag_tx,
                reporter.clone(),
            )));
            threads.push(supervise(StationRunner::spawn(
                RetaggerStation::new(branch.voice),
                retag_rx,
                sequencer_tx.clone(),
                reporter.clone(),
            )));
        }
        // The sequencer inbox closes once every retagger is done.
        drop(sequencer_tx);
        threads.push(spawn_broadcast("fanout", dispatch_rx, gate_inputs)?);

        // Tagger, with the sequencer's release feedback when dispatch waits for it
        let tagger = TaggerStation::new(config.voices.iter().cloned(), config.default_voice.clone())
            .with_policy(config.dispatch)
            .with_abort_handles(aborts);
        let mut sequencer = SequencerStation::new();
        let tagger_runner = match config.dispatch {
            DispatchPolicy::OnClose => {
                StationRunner::spawn(tagger, token_rx, dispatch_tx, reporter.clone())
            }
            DispatchPolicy::OnRelease => {
                let (feedback_tx, feedback_rx) = unbounded();
                sequencer = sequencer.with_feedback(feedback_tx);
                StationRunner::spawn_with_feedback(
                    tagger,
                    token_rx,
                    feedback_rx,
                    dispatch_tx,
                    reporter.clone(),
                )
            }
        };
        threads.push(supervise(tagger_runner));

        threads.push(supervise(StationRunner::spawn(
            sequencer,
            sequencer_rx,
            output_tx,
            reporter.clone(),
        )));

        // Sinks, with the conversation record always attached
        let history = ConversationHistory::new();
        sinks.push(Box::new(HistoryRecorder::new(history.clone())));
        let (summary_tx, summary_rx) = bounded(1);
        // The sink station is terminal and never produces output.
        let (sink_out_tx, _) = bounded::<()>(1);
        threads.push(supervise(StationRunner::spawn(
            SinkStation::new(sinks, summary_tx),
            output_rx,
            sink_out_tx,
            reporter.clone(),
        )));

        tracing::debug!(
            voices = config.voices.len(),
            dispatch = ?config.dispatch,
            mode = ?config.synthesis_mode,
            "pipeline started"
        );

        Ok(PipelineHandle {
            tokens: Some(TokenSender(token_tx)),
            running: Arc::new(AtomicBool::new(true)),
            threads,
            summary_rx: Some(summary_rx),
            history,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// Joins a station runner on a thread of its own, logging panics.
fn supervise<S: crate::pipeline::station::Station>(runner: StationRunner<S>) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(msg) = runner.join() {
            tracing::error!("{msg}");
        }
    })
}
