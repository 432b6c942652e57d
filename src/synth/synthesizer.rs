use crate::error::{PolyvoxError, Result};
use crate::pipeline::types::{Payload, SegmentKey, VoiceMarker};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Content handed to a synthesizer: a whole segment or one streamed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub key: SegmentKey,
    pub voice: VoiceMarker,
    pub text: String,
}

impl SynthesisRequest {
    pub fn new(key: SegmentKey, voice: VoiceMarker, text: impl Into<String>) -> Self {
        Self {
            key,
            voice,
            text: text.into(),
        }
    }
}

/// Trait for per-voice speech synthesis.
///
/// This trait allows swapping implementations (real TTS engine vs mock).
/// Implementations only see raw content; voice markers and ordinals are
/// restored downstream.
pub trait Synthesizer: Send + Sync {
    /// Synthesize `request.text`.
    ///
    /// # Returns
    /// Zero or more payloads in playback order, or an error. An error still
    /// completes the segment.
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Payload>>;

    /// Name of the voice this synthesizer speaks with.
    fn voice_name(&self) -> &str;

    /// Abandon any synthesis in flight. Called when a turn is cancelled.
    fn abort(&self) {}
}

/// Implement Synthesizer for Arc<T> to allow sharing across branches.
impl<T: Synthesizer + ?Sized> Synthesizer for Arc<T> {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Payload>> {
        (**self).synthesize(request)
    }

    fn voice_name(&self) -> &str {
        (**self).voice_name()
    }

    fn abort(&self) {
        (**self).abort()
    }
}

/// Synthesizer that speaks nothing and returns the text as a transcript.
///
/// Stands in for a TTS engine in the CLI and in tests, optionally with a
/// fixed per-call latency.
#[derive(Debug, Clone)]
pub struct EchoSynthesizer {
    voice_name: String,
    latency: Duration,
}

impl EchoSynthesizer {
    pub fn new(voice_name: &str) -> Self {
        Self {
            voice_name: voice_name.to_string(),
            latency: Duration::ZERO,
        }
    }

    /// Sleep this long before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Synthesizer for EchoSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Payload>> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if request.text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Payload::transcript(request.text.clone())])
    }

    fn voice_name(&self) -> &str {
        &self.voice_name
    }
}

/// Mock synthesizer for testing
#[derive(Debug)]
pub struct MockSynthesizer {
    voice_name: String,
    response: Option<Payload>,
    latency: Duration,
    should_fail: bool,
    should_hang: bool,
    calls: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockSynthesizer {
    /// Create a mock that echoes its input as a transcript
    pub fn new(voice_name: &str) -> Self {
        Self {
            voice_name: voice_name.to_string(),
            response: None,
            latency: Duration::ZERO,
            should_fail: false,
            should_hang: false,
            calls: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Configure the mock to return a fixed payload
    pub fn with_response(mut self, payload: Payload) -> Self {
        self.response = Some(payload);
        self
    }

    /// Configure the mock to sleep before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Configure the mock to fail on synthesize
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Configure the mock to block until aborted
    pub fn with_hang(mut self) -> Self {
        self.should_hang = true;
        self
    }

    /// Number of synthesize calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of abort calls so far.
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl Synthesizer for MockSynthesizer {
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Payload>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.should_hang {
            let seen = self.aborts();
            while self.aborts() == seen {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(PolyvoxError::Synthesis {
                voice: self.voice_name.clone(),
                message: "aborted".to_string(),
            });
        }
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.should_fail {
            return Err(PolyvoxError::Synthesis {
                voice: self.voice_name.clone(),
                message: "mock synthesis failure".to_string(),
            });
        }
        Ok(vec![
            self.response
                .clone()
                .unwrap_or_else(|| Payload::transcript(request.text.clone())),
        ])
    }

    fn voice_name(&self) -> &str {
        &self.voice_name
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}
