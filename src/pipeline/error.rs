//! Station failures and where they are reported.

use thiserror::Error;

/// Failure of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StationError {
    /// The item is lost but the station keeps serving its input.
    #[error("Recoverable error: {0}")]
    Recoverable(String),
    /// The station stops and closes its output.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl StationError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StationError::Fatal(_))
    }
}

/// Receives every error a station runner sees.
///
/// Injected into `Pipeline` so embedders can surface synthesis and sink
/// failures without parsing logs.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, station: &str, error: &StationError);
}

/// Default reporter: recoverable errors as warnings, fatal ones as errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(msg) => tracing::warn!(station, "{msg}"),
            StationError::Fatal(msg) => tracing::error!(station, "{msg}"),
        }
    }
}
