//! Terminal rendering of the merged result stream.
//! Used by `polyvox run`.

use crate::error::Result;
use crate::pipeline::history::HistoryEntry;
use crate::pipeline::sink::FrameSink;
use crate::pipeline::types::{FrameBody, Payload, ResultFrame, VoiceMarker};
use owo_colors::{AnsiColors, OwoColorize};
use std::io::{self, Write};

/// Label colors, assigned to voices in configuration order.
const PALETTE: [AnsiColors; 6] = [
    AnsiColors::Cyan,
    AnsiColors::Magenta,
    AnsiColors::Green,
    AnsiColors::Yellow,
    AnsiColors::Blue,
    AnsiColors::Red,
];

/// How frames are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One line per segment, prefixed with its voice label.
    #[default]
    Text,
    /// One JSON object per frame.
    Json,
}

/// Sink printing released frames as they arrive.
pub struct StdoutSink<W: Write + Send + 'static = io::Stdout> {
    out: W,
    voices: Vec<VoiceMarker>,
    format: OutputFormat,
    color: bool,
}

impl StdoutSink {
    pub fn new(voices: Vec<VoiceMarker>) -> Self {
        Self::with_writer(io::stdout(), voices)
    }
}

impl<W: Write + Send + 'static> StdoutSink<W> {
    pub fn with_writer(out: W, voices: Vec<VoiceMarker>) -> Self {
        Self {
            out,
            voices,
            format: OutputFormat::Text,
            color: false,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    fn label(&self, voice: &VoiceMarker) -> String {
        let label = format!("[{voice}]");
        if !self.color {
            return label;
        }
        match self.voices.iter().position(|v| v == voice) {
            Some(idx) => label.color(PALETTE[idx % PALETTE.len()]).bold().to_string(),
            None => label.bold().to_string(),
        }
    }

    fn write_text(&mut self, frame: &ResultFrame) -> io::Result<()> {
        match &frame.body {
            FrameBody::Start => {
                let label = self.label(&frame.voice);
                write!(self.out, "{label} ")?;
            }
            FrameBody::Payload(Payload::Transcript { text }) => {
                write!(self.out, "{text}")?;
            }
            FrameBody::Payload(Payload::Audio {
                samples,
                sample_rate,
            }) => {
                let note = format!("<{} samples @ {}Hz>", samples.len(), sample_rate);
                if self.color {
                    write!(self.out, "{} ", note.dimmed())?;
                } else {
                    write!(self.out, "{note} ")?;
                }
            }
            FrameBody::End => {
                writeln!(self.out)?;
            }
        }
        self.out.flush()
    }

    fn write_json(&mut self, frame: &ResultFrame) -> Result<()> {
        let line = serde_json::to_string(frame).map_err(io::Error::other)?;
        writeln!(self.out, "{line}")?;
        Ok(())
    }
}

impl<W: Write + Send + 'static> FrameSink for StdoutSink<W> {
    fn handle(&mut self, frame: &ResultFrame) -> Result<()> {
        match self.format {
            OutputFormat::Text => Ok(self.write_text(frame)?),
            OutputFormat::Json => self.write_json(frame),
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!("flushing output failed: {e}");
        }
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}

/// Render history entries for printing after a run.
pub fn render_history(entries: &[HistoryEntry], format: OutputFormat) -> Result<String> {
    let mut rendered = String::new();
    for entry in entries {
        match format {
            OutputFormat::Json => {
                let line = serde_json::to_string(entry).map_err(io::Error::other)?;
                rendered.push_str(&line);
                rendered.push('\n');
            }
            OutputFormat::Text => {
                rendered.push_str(&format!("# turn {} segment {}\n", entry.turn, entry.ordinal));
                rendered.push_str(&entry.text);
                rendered.push('\n');
            }
        }
    }
    Ok(rendered)
}
