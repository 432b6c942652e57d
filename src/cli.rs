//! Command-line interface for polyvox
//!
//! Provides argument parsing using clap derive macros.

use crate::pipeline::{DispatchPolicy, SynthesisMode};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Multi-voice dispatch and ordered reassembly for streaming TTS
#[derive(Parser, Debug)]
#[command(
    name = "polyvox",
    version,
    about = "Multi-voice dispatch and ordered reassembly for streaming TTS"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only report errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: segment events, -vv: every frame)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream tagged text through the pipeline and print the ordered output
    Run(RunArgs),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments of `polyvox run`.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Text to stream (stdin when omitted). A line of `---` ends a turn.
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Delay between streamed words (e.g. 20ms, 1s; bare numbers are ms)
    #[arg(long, value_name = "DURATION", value_parser = parse_delay, default_value = "0")]
    pub token_delay: Duration,

    /// Simulated synthesis latency of one voice, repeatable (e.g. AA=300ms)
    #[arg(long, value_name = "VOICE=DURATION", value_parser = parse_voice_latency)]
    pub latency: Vec<VoiceLatency>,

    /// Dispatch policy override (on-close, on-release)
    #[arg(long, value_name = "POLICY")]
    pub dispatch: Option<DispatchPolicy>,

    /// Synthesis mode override (streamed, batched)
    #[arg(long, value_name = "MODE")]
    pub mode: Option<SynthesisMode>,

    /// Synthesis watchdog override (0 disables it)
    #[arg(long, value_name = "DURATION", value_parser = parse_delay)]
    pub timeout: Option<Duration>,

    /// Print the conversation history after the run
    #[arg(long)]
    pub history: bool,

    /// Print frames and history entries as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Synthesis latency for one voice marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceLatency {
    pub voice: String,
    pub latency: Duration,
}

/// Parse a duration, treating bare numbers as milliseconds.
///
/// Anything else goes through `humantime` (`250ms`, `2s`, `1m30s`).
fn parse_delay(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Parse `VOICE=DURATION`.
fn parse_voice_latency(s: &str) -> Result<VoiceLatency, String> {
    let (voice, latency) = s
        .split_once('=')
        .ok_or_else(|| format!("expected VOICE=DURATION, got '{s}'"))?;
    let voice = voice.trim();
    if voice.is_empty() {
        return Err(format!("missing voice in '{s}'"));
    }
    Ok(VoiceLatency {
        voice: voice.to_string(),
        latency: parse_delay(latency)?,
    })
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the built-in default configuration as TOML
    Dump,
    /// Print the effective configuration (file plus environment overrides)
    Show,
    /// Print the configuration file path
    Path,
}
