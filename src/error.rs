//! Error types for polyvox.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolyvoxError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Voice routing errors
    #[error("Unknown voice marker: {marker}")]
    UnknownVoice { marker: String },

    #[error("No synthesis branch configured for voice {marker}")]
    MissingBranch { marker: String },

    #[error("Voice {marker} has more than one synthesis branch")]
    DuplicateBranch { marker: String },

    // Synthesis collaborator errors
    #[error("Synthesis failed for voice {voice}: {message}")]
    Synthesis { voice: String, message: String },

    #[error("Synthesis for voice {voice} did not complete within {timeout_ms}ms")]
    SynthesisTimeout { voice: String, timeout_ms: u64 },

    #[error("Synthesis for voice {voice} aborted: turn cancelled")]
    SynthesisAborted { voice: String },

    // Pipeline lifecycle errors
    #[error("Pipeline is closed")]
    PipelineClosed,

    #[error("Pipeline error: {message}")]
    Pipeline { message: String },

    #[error("Interrupted")]
    Interrupted,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PolyvoxError>;
