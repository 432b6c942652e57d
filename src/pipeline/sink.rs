use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{FrameBody, ResultFrame};
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pluggable output handler for the merged, ordered frame stream.
pub trait FrameSink: Send + 'static {
    /// Handle one released frame. Frames arrive in segment order.
    fn handle(&mut self, frame: &ResultFrame) -> crate::error::Result<()>;

    /// Called on pipeline shutdown.
    fn finish(&mut self) {}

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// What the sink station saw before it shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub frames: u64,
    pub segments: u64,
}

/// Terminal station fanning released frames out to every sink.
pub(crate) struct SinkStation {
    sinks: Vec<Box<dyn FrameSink>>,
    summary: SinkSummary,
    summary_tx: Option<Sender<SinkSummary>>,
}

impl SinkStation {
    pub(crate) fn new(sinks: Vec<Box<dyn FrameSink>>, summary_tx: Sender<SinkSummary>) -> Self {
        Self {
            sinks,
            summary: SinkSummary::default(),
            summary_tx: Some(summary_tx),
        }
    }
}

impl Station for SinkStation {
    type Input = ResultFrame;
    type Output = ();

    fn name(&self) -> &'static str {
        "sink"
    }

    fn process(&mut self, frame: ResultFrame) -> Result<Vec<()>, StationError> {
        self.summary.frames += 1;
        if frame.is_end() {
            self.summary.segments += 1;
        }

        // One failing sink must not starve the others.
        let failures: Vec<String> = self
            .sinks
            .iter_mut()
            .filter_map(|sink| {
                sink.handle(&frame)
                    .err()
                    .map(|e| format!("{} sink: {e}", sink.name()))
            })
            .collect();

        if failures.is_empty() {
            Ok(Vec::new())
        } else {
            Err(StationError::Recoverable(failures.join("; ")))
        }
    }

    fn shutdown(&mut self) {
        for sink in &mut self.sinks {
            sink.finish();
        }
        if let Some(tx) = self.summary_tx.take()
            && tx.send(self.summary).is_err()
        {
            tracing::debug!("sink shutdown: summary receiver already dropped");
        }
    }
}

/// Shared view of the frames a `CollectorSink` received.
#[derive(Debug, Clone, Default)]
pub struct CollectedFrames(Arc<Mutex<Vec<ResultFrame>>>);

impl CollectedFrames {
    fn lock(&self) -> MutexGuard<'_, Vec<ResultFrame>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every frame received so far, in release order.
    pub fn frames(&self) -> Vec<ResultFrame> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Transcript payloads concatenated in release order.
    pub fn transcript(&self) -> String {
        self.lock()
            .iter()
            .filter_map(|f| match &f.body {
                FrameBody::Payload(payload) => payload.as_transcript(),
                FrameBody::Start | FrameBody::End => None,
            })
            .collect()
    }
}

/// Collects released frames for tests and library use.
#[derive(Debug, Default)]
pub struct CollectorSink {
    collected: CollectedFrames,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that stays readable after the sink moved into the pipeline.
    pub fn collected(&self) -> CollectedFrames {
        self.collected.clone()
    }
}

impl FrameSink for CollectorSink {
    fn handle(&mut self, frame: &ResultFrame) -> crate::error::Result<()> {
        self.collected.lock().push(frame.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}
