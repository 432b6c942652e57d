//! Retagger station: restores voice and ordinal on synthesis results.
//!
//! The synthesizer only sees raw content. Its results get the branch's
//! voice marker back here, so the marker survives into the merged output
//! and into the conversation record.

use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{
    BranchOutput, FrameBody, ResultFrame, SegmentKey, SynthEvent, VoiceMarker,
};

pub struct RetaggerStation {
    voice: VoiceMarker,
    frames: u64,
}

impl RetaggerStation {
    pub fn new(voice: VoiceMarker) -> Self {
        Self { voice, frames: 0 }
    }

    pub fn voice(&self) -> &VoiceMarker {
        &self.voice
    }

    fn frame(&mut self, key: SegmentKey, body: FrameBody) -> BranchOutput {
        self.frames += 1;
        BranchOutput::Frame(ResultFrame::new(key, self.voice.clone(), body))
    }
}

impl Station for RetaggerStation {
    type Input = SynthEvent;
    type Output = BranchOutput;

    fn name(&self) -> &'static str {
        "retagger"
    }

    fn process(&mut self, event: SynthEvent) -> Result<Vec<BranchOutput>, StationError> {
        let output = match event {
            SynthEvent::Begin(key) => self.frame(key, FrameBody::Start),
            SynthEvent::Chunk(key, payload) => self.frame(key, FrameBody::Payload(payload)),
            SynthEvent::Complete { key, failed } => {
                if failed {
                    tracing::debug!(voice = %self.voice, %key, "segment completed after synthesis failure");
                }
                self.frame(key, FrameBody::End)
            }
            SynthEvent::Signal(signal) => BranchOutput::Signal(signal),
        };
        Ok(vec![output])
    }

    fn shutdown(&mut self) {
        tracing::debug!(voice = %self.voice, frames = self.frames, "retagger closed");
    }
}
