//! Thread-per-station runtime.
//!
//! Every tagger, gate, synthesis stage, retagger, sequencer and sink runs as
//! a [`Station`] on its own thread, fed by a bounded channel.

use crate::pipeline::error::{ErrorReporter, StationError};
use crossbeam_channel::{Receiver, Sender, never, select};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One step of the pipeline.
pub trait Station: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Handles one input. Outputs are forwarded in the returned order;
    /// a recoverable error skips the item, a fatal one stops the station.
    fn process(&mut self, input: Self::Input) -> Result<Vec<Self::Output>, StationError>;

    /// Thread name suffix and error-report label.
    fn name(&self) -> &'static str;

    /// Runs once after the input closed, before the output is dropped.
    fn shutdown(&mut self) {}
}

/// A station that also listens to a feedback channel from further downstream.
pub trait FeedbackStation: Station {
    /// Message type arriving on the feedback channel.
    type Feedback: Send + 'static;

    /// Processes one feedback message.
    fn feedback(&mut self, feedback: Self::Feedback) -> Result<Vec<Self::Output>, StationError>;

    /// True when the station holds nothing that still waits for feedback.
    ///
    /// After the input channel closes the runner keeps serving feedback
    /// until this returns true or the feedback channel closes.
    fn is_settled(&self) -> bool {
        true
    }
}

/// Owns the thread a station runs on.
pub struct StationRunner<S: Station> {
    /// `None` when the thread could not be spawned.
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _station: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Starts `station` on a thread named `polyvox-<name>`.
    ///
    /// The station runs until its input closes, its output is dropped, or
    /// it returns a fatal error.
    pub fn spawn(
        mut station: S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("polyvox-{station_name}"))
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            });

        Self::from_spawn(handle, station_name)
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();

        while let Ok(input) = input_rx.recv() {
            let result = station.process(input);
            if !deliver(station_name, result, &output_tx, error_reporter.as_ref()) {
                break;
            }
        }

        station.shutdown();
        tracing::trace!(station = station_name, "station stopped");
    }

    fn from_spawn(handle: std::io::Result<JoinHandle<()>>, station_name: &'static str) -> Self {
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(station = station_name, "failed to spawn station thread: {e}");
                None
            }
        };
        Self {
            handle,
            station_name,
            _station: PhantomData,
        }
    }

    /// Blocks until the station thread exits. Errors only on panic.
    pub fn join(mut self) -> Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("station '{}' panicked", self.station_name)),
            None => Ok(()),
        }
    }

    /// True once the station thread has exited (or never started).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}

impl<S: FeedbackStation> StationRunner<S> {
    /// Spawns a station that serves both its input and a feedback channel.
    pub fn spawn_with_feedback(
        mut station: S,
        input_rx: Receiver<S::Input>,
        feedback_rx: Receiver<S::Feedback>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(format!("polyvox-{station_name}"))
            .spawn(move || {
                Self::run_feedback_station(
                    &mut station,
                    input_rx,
                    feedback_rx,
                    output_tx,
                    error_reporter,
                );
            });

        Self::from_spawn(handle, station_name)
    }

    fn run_feedback_station(
        station: &mut S,
        mut input_rx: Receiver<S::Input>,
        mut feedback_rx: Receiver<S::Feedback>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        enum Step<I, F> {
            Input(I),
            Feedback(F),
            InputClosed,
            FeedbackClosed,
        }

        let station_name = station.name();
        let mut input_open = true;
        let mut feedback_open = true;

        loop {
            if !input_open && (!feedback_open || station.is_settled()) {
                break;
            }

            let step = select! {
                recv(input_rx) -> msg => match msg {
                    Ok(input) => Step::Input(input),
                    Err(_) => Step::InputClosed,
                },
                recv(feedback_rx) -> msg => match msg {
                    Ok(feedback) => Step::Feedback(feedback),
                    Err(_) => Step::FeedbackClosed,
                },
            };

            let result = match step {
                Step::Input(input) => station.process(input),
                Step::Feedback(feedback) => station.feedback(feedback),
                Step::InputClosed => {
                    input_open = false;
                    input_rx = never();
                    continue;
                }
                Step::FeedbackClosed => {
                    feedback_open = false;
                    feedback_rx = never();
                    continue;
                }
            };

            if !deliver(station_name, result, &output_tx, error_reporter.as_ref()) {
                break;
            }
        }

        station.shutdown();
        tracing::trace!(station = station_name, "station stopped");
    }
}

/// Sends a station result downstream. Returns false when the station must stop.
fn deliver<T>(
    station_name: &str,
    result: Result<Vec<T>, StationError>,
    output_tx: &Sender<T>,
    error_reporter: &dyn ErrorReporter,
) -> bool {
    match result {
        Ok(outputs) => outputs.into_iter().all(|output| output_tx.send(output).is_ok()),
        Err(error) => {
            error_reporter.report(station_name, &error);
            !error.is_fatal()
        }
    }
}

/// Copies every item from `input_rx` to each of `outputs`.
///
/// Outputs whose receiver is gone are dropped from the set; the thread
/// exits when the input closes or no output is left.
pub fn spawn_broadcast<T: Clone + Send + 'static>(
    name: &'static str,
    input_rx: Receiver<T>,
    mut outputs: Vec<Sender<T>>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("polyvox-{name}"))
        .spawn(move || {
            while let Ok(item) = input_rx.recv() {
                outputs.retain(|tx| tx.send(item.clone()).is_ok());
                if outputs.is_empty() {
                    tracing::debug!(station = name, "all broadcast outputs closed");
                    break;
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::LogReporter;
    use crossbeam_channel::{bounded, unbounded};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Splits text into words; rejects empty input, stops on "halt".
    struct WordSplitter {
        stopped: Arc<AtomicBool>,
    }

    impl WordSplitter {
        fn new() -> (Self, Arc<AtomicBool>) {
            let stopped = Arc::new(AtomicBool::new(false));
            (
                Self {
                    stopped: stopped.clone(),
                },
                stopped,
            )
        }
    }

    impl Station for WordSplitter {
        type Input = String;
        type Output = String;

        fn process(&mut self, text: String) -> Result<Vec<String>, StationError> {
            match text.trim() {
                "" => Err(StationError::Recoverable("empty chunk".to_string())),
                "halt" => Err(StationError::Fatal("halt requested".to_string())),
                words => Ok(words.split_whitespace().map(str::to_string).collect()),
            }
        }

        fn name(&self) -> &'static str {
            "splitter"
        }

        fn shutdown(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Holds ordinals back until feedback releases them one by one.
    #[derive(Default)]
    struct ReleaseGate {
        held: Vec<u64>,
        released: usize,
    }

    impl ReleaseGate {
        fn drain(&mut self) -> Vec<u64> {
            let count = self.released.min(self.held.len());
            self.released -= count;
            self.held.drain(..count).collect()
        }
    }

    impl Station for ReleaseGate {
        type Input = u64;
        type Output = u64;

        fn process(&mut self, ordinal: u64) -> Result<Vec<u64>, StationError> {
            self.held.push(ordinal);
            Ok(self.drain())
        }

        fn name(&self) -> &'static str {
            "release-gate"
        }
    }

    impl FeedbackStation for ReleaseGate {
        type Feedback = usize;

        fn feedback(&mut self, released: usize) -> Result<Vec<u64>, StationError> {
            self.released += released;
            Ok(self.drain())
        }

        fn is_settled(&self) -> bool {
            self.held.is_empty()
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<(String, StationError)>>,
    }

    impl RecordingReporter {
        fn reports(&self) -> Vec<(String, StationError)> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, station: &str, error: &StationError) {
            self.reports
                .lock()
                .unwrap()
                .push((station.to_string(), error.clone()));
        }
    }

    #[test]
    fn outputs_follow_input_order() {
        let (input_tx, input_rx) = bounded(8);
        let (output_tx, output_rx) = bounded(8);
        let (splitter, stopped) = WordSplitter::new();
        let runner =
            StationRunner::spawn(splitter, input_rx, output_tx, Arc::new(LogReporter));
        assert_eq!(runner.name(), "splitter");

        input_tx.send("once upon".to_string()).unwrap();
        input_tx.send("a time".to_string()).unwrap();
        drop(input_tx);

        let words: Vec<String> = output_rx.iter().collect();
        assert_eq!(words, vec!["once", "upon", "a", "time"]);
        runner.join().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn recoverable_error_skips_item() {
        let (input_tx, input_rx) = bounded(8);
        let (output_tx, output_rx) = bounded(8);
        let reporter = Arc::new(RecordingReporter::default());
        let (splitter, _) = WordSplitter::new();
        let runner = StationRunner::spawn(splitter, input_rx, output_tx, reporter.clone());

        for chunk in ["hello", "   ", "there"] {
            input_tx.send(chunk.to_string()).unwrap();
        }
        drop(input_tx);

        assert_eq!(output_rx.iter().collect::<Vec<_>>(), vec!["hello", "there"]);
        runner.join().unwrap();
        assert_eq!(
            reporter.reports(),
            vec![(
                "splitter".to_string(),
                StationError::Recoverable("empty chunk".to_string())
            )]
        );
    }

    #[test]
    fn fatal_error_stops_station() {
        let (input_tx, input_rx) = bounded(8);
        let (output_tx, output_rx) = bounded(8);
        let reporter = Arc::new(RecordingReporter::default());
        let (splitter, stopped) = WordSplitter::new();
        let runner = StationRunner::spawn(splitter, input_rx, output_tx, reporter.clone());

        input_tx.send("before".to_string()).unwrap();
        input_tx.send("halt".to_string()).unwrap();
        // May land after the station is gone.
        let _ = input_tx.send("after".to_string());
        drop(input_tx);

        assert_eq!(output_rx.iter().collect::<Vec<_>>(), vec!["before"]);
        runner.join().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(reporter.reports()[0].1.is_fatal());
    }

    #[test]
    fn dropped_output_stops_station() {
        let (input_tx, input_rx) = bounded(8);
        let (output_tx, output_rx) = bounded::<String>(8);
        let (splitter, stopped) = WordSplitter::new();
        let runner =
            StationRunner::spawn(splitter, input_rx, output_tx, Arc::new(LogReporter));

        drop(output_rx);
        input_tx.send("nobody listens".to_string()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !runner.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(runner.is_finished());
        runner.join().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn feedback_releases_held_items_after_input_closes() {
        let (input_tx, input_rx) = bounded(8);
        let (feedback_tx, feedback_rx) = unbounded();
        let (output_tx, output_rx) = bounded(8);
        let runner = StationRunner::spawn_with_feedback(
            ReleaseGate::default(),
            input_rx,
            feedback_rx,
            output_tx,
            Arc::new(LogReporter),
        );

        for ordinal in 0..3 {
            input_tx.send(ordinal).unwrap();
        }
        feedback_tx.send(1).unwrap();
        assert_eq!(output_rx.recv().unwrap(), 0);

        // Two ordinals still held: the runner waits for feedback.
        drop(input_tx);
        feedback_tx.send(2).unwrap();
        assert_eq!(output_rx.recv().unwrap(), 1);
        assert_eq!(output_rx.recv().unwrap(), 2);

        runner.join().unwrap();
        assert!(output_rx.recv().is_err());
    }

    #[test]
    fn closed_feedback_ends_unsettled_station() {
        let (input_tx, input_rx) = bounded(8);
        let (feedback_tx, feedback_rx) = unbounded::<usize>();
        let (output_tx, output_rx) = bounded::<u64>(8);
        let runner = StationRunner::spawn_with_feedback(
            ReleaseGate::default(),
            input_rx,
            feedback_rx,
            output_tx,
            Arc::new(LogReporter),
        );

        input_tx.send(7).unwrap();
        drop(feedback_tx);
        drop(input_tx);

        runner.join().unwrap();
        assert!(output_rx.recv().is_err());
    }

    #[test]
    fn broadcast_copies_to_every_branch() {
        let (input_tx, input_rx) = bounded(8);
        let (aa_tx, aa_rx) = bounded(8);
        let (bb_tx, bb_rx) = bounded(8);

        let handle = spawn_broadcast("fanout", input_rx, vec![aa_tx, bb_tx]).unwrap();
        input_tx.send("AA").unwrap();
        input_tx.send("BB").unwrap();
        drop(input_tx);
        handle.join().unwrap();

        assert_eq!(aa_rx.iter().collect::<Vec<_>>(), vec!["AA", "BB"]);
        assert_eq!(bb_rx.iter().collect::<Vec<_>>(), vec!["AA", "BB"]);
    }

    #[test]
    fn broadcast_skips_closed_branch() {
        let (input_tx, input_rx) = bounded(8);
        let (aa_tx, aa_rx) = bounded(8);
        let (bb_tx, bb_rx) = bounded::<u8>(8);
        drop(bb_rx);

        let handle = spawn_broadcast("fanout", input_rx, vec![aa_tx, bb_tx]).unwrap();
        input_tx.send(1).unwrap();
        input_tx.send(2).unwrap();
        drop(input_tx);
        handle.join().unwrap();

        assert_eq!(aa_rx.iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
