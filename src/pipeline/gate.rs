//! Gate station: lets one voice into its branch.

use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{Dispatch, VoiceMarker};

/// Passes content owned by its voice, plus every turn signal.
///
/// Gates sit behind a broadcast of the tagger output, so each branch sees
/// the whole stream and keeps only its part. Content of any other voice is
/// dropped silently.
pub struct GateStation {
    voice: VoiceMarker,
    passed: u64,
    dropped: u64,
}

impl GateStation {
    pub fn new(voice: VoiceMarker) -> Self {
        Self {
            voice,
            passed: 0,
            dropped: 0,
        }
    }

    pub fn voice(&self) -> &VoiceMarker {
        &self.voice
    }

    /// True when `dispatch` belongs to this gate's branch.
    pub fn admits(&self, dispatch: &Dispatch) -> bool {
        dispatch.voice().is_none_or(|voice| *voice == self.voice)
    }
}

impl Station for GateStation {
    type Input = Dispatch;
    type Output = Dispatch;

    fn name(&self) -> &'static str {
        "gate"
    }

    fn process(&mut self, input: Dispatch) -> Result<Vec<Dispatch>, StationError> {
        if self.admits(&input) {
            self.passed += 1;
            Ok(vec![input])
        } else {
            self.dropped += 1;
            Ok(vec![])
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!(
            voice = %self.voice,
            passed = self.passed,
            dropped = self.dropped,
            "gate closed"
        );
    }
}
