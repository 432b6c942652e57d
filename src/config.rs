use crate::defaults;
use crate::error::{PolyvoxError, Result};
use crate::pipeline::orchestrator::PipelineConfig;
use crate::pipeline::synthesis::SynthesisMode;
use crate::pipeline::tagger::DispatchPolicy;
use crate::pipeline::types::VoiceMarker;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Voice set plus the runtime settings around it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub voices: VoicesConfig,
    pub pipeline: PipelineSection,
}

/// Voice set and the branch each marker routes to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoicesConfig {
    /// Voice for text that precedes any marker in a turn
    pub default: String,
    #[serde(rename = "branch")]
    pub branches: Vec<VoiceBranch>,
}

/// One `[[voices.branch]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceBranch {
    pub marker: String,
    pub branch: String,
}

/// Runtime around the core: dispatch policy, channels, watchdog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSection {
    pub dispatch: DispatchPolicy,
    pub synthesis_mode: SynthesisMode,
    /// 0 disables the synthesis watchdog
    pub synthesis_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub token_buffer: usize,
    pub branch_buffer: usize,
    pub sequencer_buffer: usize,
    pub output_buffer: usize,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            default: defaults::DEFAULT_VOICE.to_string(),
            branches: vec![
                VoiceBranch {
                    marker: defaults::NARRATOR_MARKER.to_string(),
                    branch: defaults::NARRATOR_BRANCH.to_string(),
                },
                VoiceBranch {
                    marker: defaults::CHARACTER_MARKER.to_string(),
                    branch: defaults::CHARACTER_BRANCH.to_string(),
                },
            ],
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::default(),
            synthesis_mode: SynthesisMode::default(),
            synthesis_timeout_ms: defaults::SYNTHESIS_TIMEOUT_MS,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
            token_buffer: defaults::TOKEN_BUFFER,
            branch_buffer: defaults::BRANCH_BUFFER,
            sequencer_buffer: defaults::SEQUENCER_BUFFER,
            output_buffer: defaults::OUTPUT_BUFFER,
        }
    }
}

impl VoicesConfig {
    /// Every configured marker, in configuration order.
    pub fn markers(&self) -> Vec<VoiceMarker> {
        self.branches
            .iter()
            .map(|b| VoiceMarker::new(b.marker.as_str()))
            .collect()
    }

    /// Branch identity `marker` routes to.
    pub fn branch_for(&self, marker: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|b| b.marker == marker)
            .map(|b| b.branch.as_str())
    }
}

impl Config {
    /// Reads `path` as TOML. Absent keys take their defaults; a missing
    /// file is `ConfigFileNotFound`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PolyvoxError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                PolyvoxError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the built-in voice
    /// set. Malformed TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(PolyvoxError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Overrides from the environment:
    /// - POLYVOX_DEFAULT_VOICE → voices.default
    /// - POLYVOX_DISPATCH → pipeline.dispatch
    /// - POLYVOX_SYNTHESIS_TIMEOUT_MS → pipeline.synthesis_timeout_ms
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(voice) = std::env::var("POLYVOX_DEFAULT_VOICE")
            && !voice.is_empty()
        {
            self.voices.default = voice;
        }

        if let Ok(dispatch) = std::env::var("POLYVOX_DISPATCH")
            && !dispatch.is_empty()
        {
            match dispatch.parse() {
                Ok(policy) => self.pipeline.dispatch = policy,
                Err(e) => tracing::warn!("ignoring POLYVOX_DISPATCH: {e}"),
            }
        }

        if let Ok(timeout) = std::env::var("POLYVOX_SYNTHESIS_TIMEOUT_MS")
            && !timeout.is_empty()
        {
            match timeout.trim().parse() {
                Ok(ms) => self.pipeline.synthesis_timeout_ms = ms,
                Err(e) => tracing::warn!("ignoring POLYVOX_SYNTHESIS_TIMEOUT_MS={timeout}: {e}"),
            }
        }

        self
    }

    /// Where `polyvox` looks for its configuration when `--config` is absent.
    ///
    /// Returns ~/.config/polyvox/config.toml on Linux, or `None` when the
    /// platform has no configuration directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("polyvox").join("config.toml"))
    }

    /// Checks the voice set and runtime settings.
    pub fn validate(&self) -> Result<()> {
        if self.voices.branches.is_empty() {
            return Err(invalid("voices.branch", "at least one voice is required"));
        }

        let mut seen = HashSet::new();
        for entry in &self.voices.branches {
            if entry.marker.is_empty() {
                return Err(invalid("voices.branch.marker", "marker must not be empty"));
            }
            if entry.marker.chars().any(char::is_whitespace) {
                return Err(invalid(
                    "voices.branch.marker",
                    &format!("marker '{}' contains whitespace", entry.marker),
                ));
            }
            if entry.branch.trim().is_empty() {
                return Err(invalid(
                    "voices.branch.branch",
                    &format!("marker '{}' has no branch", entry.marker),
                ));
            }
            if !seen.insert(entry.marker.as_str()) {
                return Err(PolyvoxError::DuplicateBranch {
                    marker: entry.marker.clone(),
                });
            }
        }

        if !seen.contains(self.voices.default.as_str()) {
            return Err(invalid(
                "voices.default",
                &format!("'{}' is not a configured marker", self.voices.default),
            ));
        }

        let buffers = [
            ("pipeline.token_buffer", self.pipeline.token_buffer),
            ("pipeline.branch_buffer", self.pipeline.branch_buffer),
            ("pipeline.sequencer_buffer", self.pipeline.sequencer_buffer),
            ("pipeline.output_buffer", self.pipeline.output_buffer),
        ];
        if let Some((key, _)) = buffers.iter().find(|(_, size)| *size == 0) {
            return Err(invalid(key, "buffer size must be at least 1"));
        }
        Ok(())
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PolyvoxError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Pipeline settings derived from this configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let section = &self.pipeline;
        PipelineConfig {
            voices: self.voices.markers(),
            default_voice: VoiceMarker::new(self.voices.default.as_str()),
            dispatch: section.dispatch,
            synthesis_mode: section.synthesis_mode,
            synthesis_timeout: (section.synthesis_timeout_ms > 0)
                .then(|| Duration::from_millis(section.synthesis_timeout_ms)),
            shutdown_timeout: Duration::from_millis(section.shutdown_timeout_ms),
            token_buffer: section.token_buffer,
            branch_buffer: section.branch_buffer,
            sequencer_buffer: section.sequencer_buffer,
            output_buffer: section.output_buffer,
        }
    }
}

fn invalid(key: &str, message: &str) -> PolyvoxError {
    PolyvoxError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
