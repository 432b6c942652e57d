//! `polyvox run`: stream tagged text through the pipeline.
//!
//! Reads generated text → streams it word by word → prints the ordered,
//! voice-labelled output as it is released.

use crate::cli::{RunArgs, VoiceLatency};
use crate::config::Config;
use crate::error::{PolyvoxError, Result};
use crate::output::{OutputFormat, StdoutSink, render_history};
use crate::pipeline::orchestrator::{Branch, Pipeline, PipelineHandle, PipelineReport, TokenSender};
use crate::pipeline::sink::FrameSink;
use crate::pipeline::types::VoiceMarker;
use crate::synth::EchoSynthesizer;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Line separating two turns in the input.
const TURN_SEPARATOR: &str = "---";

/// Run the stream command: read text → tag → synthesize → print in order.
///
/// # Arguments
/// * `config` - Validated base configuration (CLI flags override it)
/// * `args` - Parsed `run` arguments
/// * `quiet` - Suppress status messages on stderr
pub async fn run_stream_command(mut config: Config, args: RunArgs, quiet: bool) -> Result<()> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    let input = read_input(&args).await?;
    let turns = split_turns(&input);
    let branches = build_branches(&config, &args.latency)?;

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let color = format == OutputFormat::Text && std::io::stdout().is_terminal();
    let sink = StdoutSink::new(config.voices.markers())
        .with_format(format)
        .with_color(color);
    let sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(sink)];

    let pipeline = Pipeline::new(config.pipeline_config());
    let handle = pipeline.start(branches, sinks)?;
    let tokens = handle.token_sender().ok_or(PolyvoxError::PipelineClosed)?;

    let streamed = stream_turns(&tokens, &turns, args.token_delay, quiet).await;
    // The clone keeps the token channel open; finish waits for it to close.
    drop(tokens);
    streamed?;

    let report = finish_or_interrupt(handle, tokio::signal::ctrl_c(), quiet).await?;

    print_report(&report, &args, format, quiet)
}

/// Apply `run` flag overrides on top of the loaded configuration.
fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(dispatch) = args.dispatch {
        config.pipeline.dispatch = dispatch;
    }
    if let Some(mode) = args.mode {
        config.pipeline.synthesis_mode = mode;
    }
    if let Some(timeout) = args.timeout {
        config.pipeline.synthesis_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }
}

async fn read_input(args: &RunArgs) -> Result<String> {
    match &args.file {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            Ok(input)
        }
    }
}

/// Split input text into turns at separator lines.
///
/// Turns holding only whitespace are kept: they exercise the empty-turn
/// path and release nothing.
pub fn split_turns(input: &str) -> Vec<String> {
    let mut turns = vec![String::new()];
    for line in input.lines() {
        if line.trim() == TURN_SEPARATOR {
            turns.push(String::new());
            continue;
        }
        if let Some(turn) = turns.last_mut() {
            turn.push_str(line);
            turn.push('\n');
        }
    }
    if turns.len() > 1 && turns.last().is_some_and(|t| t.trim().is_empty()) {
        turns.pop();
    }
    turns
}

/// Words of a turn as the generator would stream them, each followed by
/// its separating space.
pub fn stream_words(turn: &str) -> impl Iterator<Item = String> + '_ {
    turn.split_whitespace().map(|word| format!("{word} "))
}

/// One echo synthesis branch per configured voice.
///
/// Fails when a latency names a voice that is not configured.
pub fn build_branches(config: &Config, latencies: &[VoiceLatency]) -> Result<Vec<Branch>> {
    if let Some(unknown) = latencies
        .iter()
        .find(|l| config.voices.branch_for(&l.voice).is_none())
    {
        return Err(PolyvoxError::UnknownVoice {
            marker: unknown.voice.clone(),
        });
    }

    Ok(config
        .voices
        .branches
        .iter()
        .map(|entry| {
            let latency = latencies
                .iter()
                .rev()
                .find(|l| l.voice == entry.marker)
                .map_or(Duration::ZERO, |l| l.latency);
            let synthesizer = EchoSynthesizer::new(&entry.branch).with_latency(latency);
            Branch::new(VoiceMarker::new(entry.marker.as_str()), Arc::new(synthesizer))
        })
        .collect())
}

/// Stream every turn. Ctrl+C cancels the turn being streamed and moves on
/// to the next one.
async fn stream_turns(
    tokens: &TokenSender,
    turns: &[String],
    delay: Duration,
    quiet: bool,
) -> Result<()> {
    for (idx, turn) in turns.iter().enumerate() {
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        let mut cancelled = false;
        for word in stream_words(turn) {
            if !delay.is_zero() {
                tokio::select! {
                    _ = &mut interrupt => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tokens.send_text(word)?;
        }

        if cancelled {
            tracing::info!(turn = idx, "turn interrupted");
            if !quiet {
                eprintln!("\nTurn {} cancelled", idx);
            }
            tokens.cancel()?;
        } else {
            tokens.end_response()?;
        }
    }
    Ok(())
}

/// Wait for the pipeline to drain. An interrupt abandons the wait, leaving
/// the pipeline threads to die with the process.
async fn finish_or_interrupt<I>(handle: PipelineHandle, interrupt: I, quiet: bool) -> Result<PipelineReport>
where
    I: Future<Output = std::io::Result<()>>,
{
    let finish = tokio::task::spawn_blocking(move || handle.finish());
    tokio::select! {
        joined = finish => joined.map_err(|e| PolyvoxError::Pipeline {
            message: format!("pipeline shutdown task failed: {e}"),
        }),
        signal = interrupt => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "interrupt listener failed");
            }
            tracing::info!("interrupted while draining");
            if !quiet {
                eprintln!("\nInterrupted, abandoning queued output");
            }
            Err(PolyvoxError::Interrupted)
        }
    }
}

fn print_report(
    report: &PipelineReport,
    args: &RunArgs,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    if !report.drained {
        tracing::warn!("pipeline abandoned before all segments were released");
    }

    if args.history {
        print!("{}", render_history(&report.history, format)?);
    }

    if !quiet {
        eprintln!(
            "{} segments, {} frames released",
            report.segments, report.frames
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DispatchPolicy;
    use crate::pipeline::SynthesisMode;
    use std::io::Write;
    use std::path::PathBuf;

    fn args(file: Option<PathBuf>) -> RunArgs {
        RunArgs {
            file,
            token_delay: Duration::ZERO,
            latency: Vec::new(),
            dispatch: None,
            mode: None,
            timeout: None,
            history: false,
            json: false,
        }
    }

    fn latency(voice: &str, ms: u64) -> VoiceLatency {
        VoiceLatency {
            voice: voice.to_string(),
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_split_turns_on_separator_lines() {
        let turns = split_turns("AA hello\nBB hi\n---\nAA bye\n");
        assert_eq!(turns, vec!["AA hello\nBB hi\n", "AA bye\n"]);
    }

    #[test]
    fn test_split_turns_keeps_empty_middle_turn() {
        let turns = split_turns("one\n---\n---\ntwo\n---\n");
        assert_eq!(turns.len(), 3);
        assert!(turns[1].trim().is_empty());
        assert_eq!(turns[2], "two\n");
    }

    #[test]
    fn test_split_turns_without_separator() {
        assert_eq!(split_turns("just text"), vec!["just text\n"]);
        assert_eq!(split_turns(""), vec![""]);
    }

    #[test]
    fn test_stream_words_keep_separators() {
        let words: Vec<String> = stream_words("AA  hello\nBB hi").collect();
        assert_eq!(words, vec!["AA ", "hello ", "BB ", "hi "]);
    }

    #[test]
    fn test_build_branches_one_per_voice() {
        let config = Config::default();
        let branches = build_branches(&config, &[latency("BB", 300)]).unwrap();
        let voices: Vec<&str> = branches.iter().map(|b| b.voice.as_str()).collect();
        assert_eq!(voices, vec!["AA", "BB"]);
        assert_eq!(branches[1].synthesizer.voice_name(), "character");
    }

    #[test]
    fn test_build_branches_rejects_unknown_latency_voice() {
        let config = Config::default();
        let err = build_branches(&config, &[latency("CC", 10)]).unwrap_err();
        assert!(matches!(err, PolyvoxError::UnknownVoice { marker } if marker == "CC"));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        let mut run = args(None);
        run.dispatch = Some(DispatchPolicy::OnRelease);
        run.mode = Some(SynthesisMode::Batched);
        run.timeout = Some(Duration::from_millis(1500));
        apply_overrides(&mut config, &run);
        assert_eq!(config.pipeline.dispatch, DispatchPolicy::OnRelease);
        assert_eq!(config.pipeline.synthesis_mode, SynthesisMode::Batched);
        assert_eq!(config.pipeline.synthesis_timeout_ms, 1500);
    }

    #[test]
    fn test_apply_overrides_keeps_config_without_flags() {
        let mut config = Config::default();
        let before = config.pipeline.synthesis_timeout_ms;
        apply_overrides(&mut config, &args(None));
        assert_eq!(config.pipeline.dispatch, DispatchPolicy::OnClose);
        assert_eq!(config.pipeline.synthesis_timeout_ms, before);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_stream_command_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "AA hello BB hi there AA goodbye").unwrap();
        writeln!(file, "---").unwrap();
        writeln!(file, "BB again").unwrap();

        let mut run = args(Some(file.path().to_path_buf()));
        run.latency = vec![latency("BB", 20)];
        run_stream_command(Config::default(), run, true)
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interrupt_abandons_the_drain() {
        let slow = |voice: &str| Arc::new(EchoSynthesizer::new(voice).with_latency(Duration::from_millis(1500)));
        let branches = vec![
            Branch::new(VoiceMarker::from("AA"), slow("narrator")),
            Branch::new(VoiceMarker::from("BB"), slow("character")),
        ];
        let handle = Pipeline::new(Config::default().pipeline_config())
            .start(branches, vec![])
            .unwrap();
        handle.send_text("AA slow words ").unwrap();

        let started = std::time::Instant::now();
        let result = finish_or_interrupt(handle, std::future::ready(Ok(())), true).await;
        assert!(matches!(result, Err(PolyvoxError::Interrupted)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_finish_without_interrupt_reports() {
        let handle = Pipeline::new(Config::default().pipeline_config())
            .start(build_branches(&Config::default(), &[]).unwrap(), vec![])
            .unwrap();
        handle.send_text("AA hello BB hi ").unwrap();

        let report = finish_or_interrupt(handle, std::future::pending(), true)
            .await
            .unwrap();
        assert!(report.drained);
        assert_eq!(report.segments, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_stream_command_missing_file() {
        let run = args(Some(PathBuf::from("/nonexistent/polyvox/input.txt")));
        let err = run_stream_command(Config::default(), run, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PolyvoxError::Io(_)));
    }
}
