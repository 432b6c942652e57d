//! Default configuration constants for polyvox.
//!
//! Shared by the configuration types and the pipeline so the two never
//! disagree about a default.

/// Marker of the narrator voice in the default two-voice setup.
pub const NARRATOR_MARKER: &str = "AA";

/// Branch identity the narrator marker maps to by default.
pub const NARRATOR_BRANCH: &str = "narrator";

/// Marker of the main character voice in the default two-voice setup.
pub const CHARACTER_MARKER: &str = "BB";

/// Branch identity the character marker maps to by default.
pub const CHARACTER_BRANCH: &str = "character";

/// Voice that owns text appearing before any marker in a turn.
pub const DEFAULT_VOICE: &str = NARRATOR_MARKER;

/// Capacity of the token inbox feeding the tagger.
pub const TOKEN_BUFFER: usize = 256;

/// Capacity of the tagger's output and of each branch behind its gate.
///
/// Gate inboxes themselves are unbounded: one slow voice must not hold up
/// the others.
pub const BRANCH_BUFFER: usize = 64;

/// Capacity of the sequencer inbox shared by all branches.
pub const SEQUENCER_BUFFER: usize = 256;

/// Capacity of the channel between sequencer and output sinks.
pub const OUTPUT_BUFFER: usize = 256;

/// Synthesis watchdog in milliseconds. 0 disables the watchdog.
///
/// A collaborator that neither answers nor fails would stall the
/// sequencer forever; 30s is far above any sane TTS round trip.
pub const SYNTHESIS_TIMEOUT_MS: u64 = 30_000;

/// How long `PipelineHandle::finish` waits for in-flight segments.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 60_000;

/// Sample rate reported by synthesizers that do not choose their own.
pub const SAMPLE_RATE: u32 = 24_000;
