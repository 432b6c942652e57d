//! Synthesis station: drives one branch's synthesizer.

use crate::error::{PolyvoxError, Result};
use crate::pipeline::error::{ErrorReporter, LogReporter, StationError};
use crate::pipeline::station::Station;
use crate::pipeline::types::{
    ContentBody, ContentFrame, Dispatch, Payload, SegmentKey, SynthEvent, TurnSignal, VoiceMarker,
};
use crate::synth::{AbortHandle, AbortWatch, SynthesisGuard, SynthesisRequest, Synthesizer, abort_pair};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How segment content is handed to the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SynthesisMode {
    /// One call per content chunk, as chunks arrive.
    #[default]
    Streamed,
    /// One call per segment, once the segment is closed.
    Batched,
}

impl std::str::FromStr for SynthesisMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streamed" | "stream" => Ok(SynthesisMode::Streamed),
            "batched" | "batch" => Ok(SynthesisMode::Batched),
            other => Err(format!(
                "unknown synthesis mode '{other}' (expected streamed or batched)"
            )),
        }
    }
}

/// Segment currently being synthesized.
struct ActiveSegment {
    key: SegmentKey,
    voice: VoiceMarker,
    /// Batched mode only.
    text: String,
    failed: bool,
}

/// Station that turns segment content into synthesis events.
///
/// Every segment that begins also completes: a failing or timed-out
/// synthesizer yields `Complete { failed: true }` instead of a stall.
/// Segments of cancelled turns are dropped without completing.
pub struct SynthesisStation {
    voice: VoiceMarker,
    synthesizer: Arc<dyn Synthesizer>,
    guard: Option<SynthesisGuard>,
    abort: AbortHandle,
    watch: AbortWatch,
    mode: SynthesisMode,
    reporter: Arc<dyn ErrorReporter>,
    active: Option<ActiveSegment>,
    segments: u64,
    failures: u64,
}

impl SynthesisStation {
    pub fn new(voice: VoiceMarker, synthesizer: Arc<dyn Synthesizer>) -> Self {
        let (abort, watch) = abort_pair(Arc::clone(&synthesizer));
        Self {
            voice,
            synthesizer,
            guard: None,
            abort,
            watch,
            mode: SynthesisMode::default(),
            reporter: Arc::new(LogReporter),
            active: None,
            segments: 0,
            failures: 0,
        }
    }

    pub fn with_mode(mut self, mode: SynthesisMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fails synthesis calls that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> std::io::Result<Self> {
        let guard = SynthesisGuard::spawn(Arc::clone(&self.synthesizer), timeout)?
            .watching(self.watch.clone());
        self.guard = Some(guard);
        Ok(self)
    }

    /// Cancels this branch's work from another thread, e.g. the tagger's.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Reporter for synthesis failures.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn voice(&self) -> &VoiceMarker {
        &self.voice
    }

    pub fn mode(&self) -> SynthesisMode {
        self.mode
    }

    fn on_content(&mut self, frame: ContentFrame, out: &mut Vec<SynthEvent>) {
        match frame.body {
            ContentBody::Begin => {
                if let Some(previous) = &self.active {
                    tracing::warn!(
                        voice = %self.voice,
                        key = %previous.key,
                        "segment began before previous one ended"
                    );
                    self.finish(out);
                }
                self.segments += 1;
                self.active = Some(ActiveSegment {
                    key: frame.key,
                    voice: frame.voice,
                    text: String::new(),
                    failed: false,
                });
                out.push(SynthEvent::Begin(frame.key));
            }
            ContentBody::Text(text) => {
                let Some(active) = self.active.as_mut().filter(|a| a.key == frame.key) else {
                    tracing::warn!(voice = %self.voice, key = %frame.key, "content for inactive segment dropped");
                    return;
                };
                match self.mode {
                    SynthesisMode::Batched => active.text.push_str(&text),
                    SynthesisMode::Streamed => self.synthesize_chunk(text, out),
                }
            }
            ContentBody::End => {
                if self.active.as_ref().is_some_and(|a| a.key == frame.key) {
                    self.finish(out);
                } else {
                    tracing::warn!(voice = %self.voice, key = %frame.key, "end for inactive segment dropped");
                }
            }
        }
    }

    fn synthesize_chunk(&mut self, text: String, out: &mut Vec<SynthEvent>) {
        let Some(active) = &self.active else {
            return;
        };
        if active.failed {
            return;
        }
        let (key, voice) = (active.key, active.voice.clone());
        let outcome = self.call(SynthesisRequest::new(key, voice, text));
        if !self.settle(key, outcome, out)
            && let Some(active) = self.active.as_mut()
        {
            active.failed = true;
        }
    }

    /// Completes the active segment.
    fn finish(&mut self, out: &mut Vec<SynthEvent>) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if self.mode == SynthesisMode::Batched && !active.failed && !active.text.is_empty() {
            let text = std::mem::take(&mut active.text);
            let outcome = self.call(SynthesisRequest::new(active.key, active.voice.clone(), text));
            if !self.settle(active.key, outcome, out) {
                active.failed = true;
            }
        }
        out.push(SynthEvent::Complete {
            key: active.key,
            failed: active.failed,
        });
    }

    fn call(&mut self, request: SynthesisRequest) -> Result<Vec<Payload>> {
        if !self.watch.begin(request.key.turn) {
            return Err(PolyvoxError::SynthesisAborted {
                voice: self.synthesizer.voice_name().to_string(),
            });
        }
        let outcome = match &mut self.guard {
            Some(guard) => guard.synthesize(request),
            None => self.synthesizer.synthesize(&request),
        };
        self.watch.end();
        outcome
    }

    /// Emits payloads. Returns false when synthesis failed.
    fn settle(&mut self, key: SegmentKey, outcome: Result<Vec<Payload>>, out: &mut Vec<SynthEvent>) -> bool {
        match outcome {
            Ok(payloads) => {
                out.extend(payloads.into_iter().map(|p| SynthEvent::Chunk(key, p)));
                true
            }
            Err(e) if self.watch.is_cancelled(key.turn) => {
                tracing::debug!(voice = %self.voice, %key, "synthesis abandoned: {e}");
                false
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(voice = %self.voice, %key, "synthesis failed: {e}");
                self.reporter.report(
                    "synthesis",
                    &StationError::Recoverable(format!("segment {key}: {e}")),
                );
                false
            }
        }
    }

    fn on_signal(&mut self, signal: TurnSignal, out: &mut Vec<SynthEvent>) {
        if let TurnSignal::Cancel { turn } = signal {
            // Normally a no-op: the tagger cancelled this branch already.
            self.abort.cancel_through(turn);
            if let Some(active) = self.active.take_if(|a| a.key.turn <= turn) {
                tracing::debug!(voice = %self.voice, key = %active.key, "cancelled segment dropped");
            }
        }
        out.push(SynthEvent::Signal(signal));
    }
}

impl Station for SynthesisStation {
    type Input = Dispatch;
    type Output = SynthEvent;

    fn name(&self) -> &'static str {
        "synthesis"
    }

    fn process(&mut self, input: Dispatch) -> std::result::Result<Vec<SynthEvent>, StationError> {
        let mut out = Vec::new();
        match input {
            Dispatch::Content(frame) => self.on_content(frame, &mut out),
            Dispatch::Signal(signal) => self.on_signal(signal, &mut out),
        }
        Ok(out)
    }

    fn shutdown(&mut self) {
        if let Some(active) = &self.active {
            tracing::warn!(voice = %self.voice, key = %active.key, "synthesis stopped mid-segment");
        }
        tracing::debug!(
            voice = %self.voice,
            segments = self.segments,
            failures = self.failures,
            "synthesis station closed"
        );
    }
}
