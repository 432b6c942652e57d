//! polyvox - Multi-voice dispatch and ordered reassembly for streaming TTS
//!
//! Splits a generated token stream into voice-tagged segments, synthesizes
//! each voice on its own branch, and merges the results back in order.

// Enforce error handling discipline: propagate, don't panic
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod app;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
#[cfg(feature = "cli")]
pub mod output;
pub mod pipeline;
pub mod synth;

// Core traits (tokens → branches → sink)
pub use pipeline::sink::{CollectorSink, FrameSink};
pub use synth::{EchoSynthesizer, MockSynthesizer, SynthesisRequest, Synthesizer};

// Pipeline
pub use pipeline::orchestrator::{
    Branch, Pipeline, PipelineConfig, PipelineHandle, PipelineReport, TokenSender,
};
pub use pipeline::history::{ConversationHistory, HistoryEntry};
pub use pipeline::types::{Payload, ResultFrame, SegmentKey, Token, VoiceMarker};

// Error handling
pub use error::{PolyvoxError, Result};

// Config
pub use config::Config;

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
