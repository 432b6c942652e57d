//! Multi-voice segmentation, dispatch and ordered reassembly.
//!
//! Implements a multi-station pipeline where each station runs in its own thread,
//! connected by bounded crossbeam channels for backpressure.

pub mod error;
pub mod gate;
pub mod history;
pub mod marker;
pub mod orchestrator;
pub mod reorder;
pub mod retagger;
pub mod segment;
pub mod sequencer;
pub mod sink;
pub mod station;
pub mod synthesis;
pub mod tagger;
pub mod types;

pub use error::{ErrorReporter, LogReporter, StationError};
pub use gate::GateStation;
pub use history::{ConversationHistory, HistoryEntry, HistoryRecorder};
pub use orchestrator::{
    Branch, Pipeline, PipelineConfig, PipelineHandle, PipelineReport, TokenSender,
};
pub use retagger::RetaggerStation;
pub use segment::{SegmentState, TurnLedger};
pub use sequencer::{ReleaseState, SequencerStation};
pub use sink::{CollectedFrames, CollectorSink, FrameSink, SinkSummary};
pub use station::{FeedbackStation, Station, StationRunner};
pub use synthesis::{SynthesisMode, SynthesisStation};
pub use tagger::{DispatchPolicy, TaggerStation};
pub use types::{
    BranchOutput, ContentBody, ContentFrame, Dispatch, FrameBody, Payload, ResultFrame,
    SegmentKey, SynthEvent, Token, TurnId, TurnSignal, VoiceMarker,
};
