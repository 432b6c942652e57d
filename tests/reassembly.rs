//! End-to-end reassembly tests: tokens in, ordered voice-tagged frames out.

use crossbeam_channel::{Receiver, Sender, unbounded};
use polyvox::pipeline::{DispatchPolicy, FrameBody, SynthesisMode};
use polyvox::{
    Branch, CollectorSink, EchoSynthesizer, ErrorReporter, MockSynthesizer, Payload, Pipeline,
    PipelineConfig, PipelineHandle, ResultFrame, SegmentKey, StationError, SynthesisRequest,
    Synthesizer, VoiceMarker,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One released segment, rebuilt from its frames.
#[derive(Debug, Clone, PartialEq)]
struct Released {
    key: SegmentKey,
    voice: String,
    text: String,
}

/// Groups frames into segments, asserting each segment is contiguous:
/// Start, payloads, End, with no other segment's frames in between.
fn released(frames: &[ResultFrame]) -> Vec<Released> {
    let mut out = Vec::new();
    let mut open: Option<Released> = None;
    for frame in frames {
        match &frame.body {
            FrameBody::Start => {
                assert!(open.is_none(), "segment {} started inside another", frame.key);
                open = Some(Released {
                    key: frame.key,
                    voice: frame.voice.to_string(),
                    text: String::new(),
                });
            }
            FrameBody::Payload(payload) => {
                let segment = open.as_mut().expect("payload outside a segment");
                assert_eq!(segment.key, frame.key, "frames of two segments interleaved");
                assert_eq!(segment.voice, frame.voice.as_str());
                if let Some(text) = payload.as_transcript() {
                    segment.text.push_str(text);
                }
            }
            FrameBody::End => {
                let segment = open.take().expect("end outside a segment");
                assert_eq!(segment.key, frame.key, "segment ended by another key");
                out.push(segment);
            }
        }
    }
    assert!(open.is_none(), "segment left open");
    out
}

fn seg(turn: u64, ordinal: u64, voice: &str, text: &str) -> Released {
    Released {
        key: SegmentKey::new(turn, ordinal),
        voice: voice.to_string(),
        text: text.to_string(),
    }
}

fn echo_branches(aa_latency: Duration, bb_latency: Duration) -> Vec<Branch> {
    vec![
        Branch::new(
            VoiceMarker::from("AA"),
            Arc::new(EchoSynthesizer::new("narrator").with_latency(aa_latency)),
        ),
        Branch::new(
            VoiceMarker::from("BB"),
            Arc::new(EchoSynthesizer::new("character").with_latency(bb_latency)),
        ),
    ]
}

fn start(
    config: PipelineConfig,
    branches: Vec<Branch>,
) -> (PipelineHandle, polyvox::pipeline::CollectedFrames) {
    let collector = CollectorSink::new();
    let collected = collector.collected();
    let handle = Pipeline::new(config)
        .start(branches, vec![Box::new(collector)])
        .unwrap();
    (handle, collected)
}

fn send_all(handle: &PipelineHandle, chunks: &[&str]) {
    for chunk in chunks {
        handle.send_text(*chunk).unwrap();
    }
}

#[derive(Default)]
struct CapturingReporter {
    errors: Mutex<Vec<(String, String)>>,
}

impl CapturingReporter {
    fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorReporter for CapturingReporter {
    fn report(&self, station: &str, error: &StationError) {
        self.errors
            .lock()
            .unwrap()
            .push((station.to_string(), error.to_string()));
    }
}

#[test]
fn slow_middle_segment_holds_back_later_one() {
    // BB takes far longer than AA, so AA finishes ordinal 2 first.
    let (handle, collected) = start(
        PipelineConfig::default(),
        echo_branches(Duration::ZERO, Duration::from_millis(200)),
    );
    send_all(&handle, &["AA hello ", "BB hi there ", "AA goodbye"]);
    let report = handle.finish();

    assert!(report.drained);
    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "hello "),
            seg(0, 1, "BB", "hi there "),
            seg(0, 2, "AA", "goodbye"),
        ]
    );
    assert_eq!(report.segments, 3);
}

#[test]
fn ordinals_are_gapless_for_many_segments() {
    let (handle, collected) = start(
        PipelineConfig::default(),
        echo_branches(Duration::from_millis(3), Duration::from_millis(11)),
    );
    let mut expected = String::new();
    for i in 0..20 {
        let voice = if i % 3 == 0 { "BB" } else { "AA" };
        let text = format!("line{i} ");
        handle.send_text(format!("{voice} {text}")).unwrap();
        expected.push_str(&text);
    }
    handle.finish();

    let segments = released(&collected.frames());
    let ordinals: Vec<u64> = segments.iter().map(|s| s.key.ordinal).collect();
    let voices: Vec<&str> = segments.iter().map(|s| s.voice.as_str()).collect();
    // Consecutive same-voice markers still open a new segment each.
    assert_eq!(ordinals, (0..20).collect::<Vec<u64>>());
    for (i, voice) in voices.iter().enumerate() {
        assert_eq!(*voice, if i % 3 == 0 { "BB" } else { "AA" });
    }
    assert_eq!(collected.transcript(), expected);
}

#[test]
fn content_survives_markers_split_across_chunks() {
    let (handle, collected) = start(PipelineConfig::default(), echo_branches(Duration::ZERO, Duration::ZERO));
    send_all(
        &handle,
        &["Once upon ", "a time ", "BB", " Who", " is it? ", "AA The ", "wind."],
    );
    handle.finish();

    let segments = released(&collected.frames());
    assert_eq!(
        segments.iter().map(|s| s.voice.as_str()).collect::<Vec<_>>(),
        vec!["AA", "BB", "AA"]
    );
    assert_eq!(collected.transcript(), "Once upon a time Who is it? The wind.");
}

#[test]
fn single_voice_turn_is_one_segment() {
    let (handle, collected) = start(PipelineConfig::default(), echo_branches(Duration::ZERO, Duration::ZERO));
    send_all(&handle, &["No markers ", "at all."]);
    handle.end_response().unwrap();
    let report = handle.finish();

    assert_eq!(
        released(&collected.frames()),
        vec![seg(0, 0, "AA", "No markers at all.")]
    );
    assert_eq!(report.history.len(), 1);
    assert_eq!(report.history[0].text, "AA\nNo markers at all.");
}

#[test]
fn empty_turn_produces_nothing() {
    let (handle, collected) = start(PipelineConfig::default(), echo_branches(Duration::ZERO, Duration::ZERO));
    handle.end_response().unwrap();
    let report = handle.finish();

    assert!(collected.is_empty());
    assert_eq!(report.segments, 0);
    assert!(report.history.is_empty());
}

#[test]
fn marker_without_content_consumes_no_ordinal() {
    let (handle, collected) = start(PipelineConfig::default(), echo_branches(Duration::ZERO, Duration::ZERO));
    send_all(&handle, &["AA BB hi ", "AA"]);
    handle.finish();

    assert_eq!(released(&collected.frames()), vec![seg(0, 0, "BB", "hi ")]);
}

#[test]
fn turns_restart_ordinals_and_stay_in_order() {
    let (handle, collected) = start(
        PipelineConfig::default(),
        echo_branches(Duration::from_millis(30), Duration::ZERO),
    );
    send_all(&handle, &["AA first ", "BB second "]);
    handle.end_response().unwrap();
    // Nothing open: consumes no turn id.
    handle.end_response().unwrap();
    send_all(&handle, &["BB third ", "AA fourth"]);
    let report = handle.finish();

    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "first "),
            seg(0, 1, "BB", "second "),
            seg(1, 0, "BB", "third "),
            seg(1, 1, "AA", "fourth"),
        ]
    );
    let entries: Vec<(u64, u64)> = report.history.iter().map(|e| (e.turn, e.ordinal)).collect();
    assert_eq!(entries, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
}

#[test]
fn history_keeps_one_tagged_entry_per_segment() {
    let (handle, _collected) = start(PipelineConfig::default(), echo_branches(Duration::ZERO, Duration::ZERO));
    let history = handle.history();
    send_all(&handle, &["AA The door opened. ", "BB Who's there?"]);
    handle.finish();

    assert_eq!(
        history.tagged_response(0),
        "AA\nThe door opened.\nBB\nWho's there?"
    );
}

#[test]
fn cancel_discards_turn_and_next_turn_starts_at_zero() {
    // AA is slow, so its payload is still in flight when the cancel lands.
    let (handle, collected) = start(
        PipelineConfig::default(),
        echo_branches(Duration::from_millis(300), Duration::ZERO),
    );
    send_all(&handle, &["AA hello ", "BB hi "]);
    handle.cancel().unwrap();
    send_all(&handle, &["BB fresh start"]);
    let report = handle.finish();

    let frames = collected.frames();
    // At most the start of the cursor segment escaped before the cancel.
    let cancelled: Vec<&ResultFrame> = frames.iter().filter(|f| f.key.turn == 0).collect();
    assert!(cancelled.iter().all(|f| f.key == SegmentKey::new(0, 0) && f.is_start()));

    let fresh: Vec<&ResultFrame> = frames.iter().filter(|f| f.key.turn == 1).collect();
    assert_eq!(fresh.len(), 3);
    assert!(fresh.iter().all(|f| f.key.ordinal == 0 && f.voice.as_str() == "BB"));
    assert_eq!(collected.transcript(), "fresh start");
    assert_eq!(report.history.len(), 1);
    assert_eq!(report.history[0].turn, 1);
}

#[test]
fn failed_synthesis_completes_segment_and_reports() {
    let reporter = Arc::new(CapturingReporter::default());
    let collector = CollectorSink::new();
    let collected = collector.collected();
    let branches = vec![
        Branch::new(VoiceMarker::from("AA"), Arc::new(EchoSynthesizer::new("narrator"))),
        Branch::new(
            VoiceMarker::from("BB"),
            Arc::new(MockSynthesizer::new("character").with_failure()),
        ),
    ];
    let handle = Pipeline::new(PipelineConfig::default())
        .with_error_reporter(reporter.clone())
        .start(branches, vec![Box::new(collector)])
        .unwrap();
    send_all(&handle, &["AA before ", "BB broken ", "AA after"]);
    let report = handle.finish();

    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "before "),
            seg(0, 1, "BB", ""),
            seg(0, 2, "AA", "after"),
        ]
    );
    // The empty segment leaves no history entry.
    assert_eq!(report.history.len(), 2);
    let errors = reporter.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "synthesis");
    assert!(errors[0].1.contains("0:1"));
}

#[test]
fn hung_synthesizer_is_cut_off_by_watchdog() {
    let hanging = Arc::new(MockSynthesizer::new("character").with_hang());
    let config = PipelineConfig {
        synthesis_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let branches = vec![
        Branch::new(VoiceMarker::from("AA"), Arc::new(EchoSynthesizer::new("narrator"))),
        Branch::new(VoiceMarker::from("BB"), hanging.clone()),
    ];
    let (handle, collected) = start(config, branches);
    send_all(&handle, &["AA one ", "BB two ", "AA three"]);
    let report = handle.finish();

    assert!(report.drained);
    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "one "),
            seg(0, 1, "BB", ""),
            seg(0, 2, "AA", "three"),
        ]
    );
    assert!(hanging.aborts() >= 1);
}

#[test]
fn batched_mode_makes_one_call_per_segment() {
    let narrator = Arc::new(MockSynthesizer::new("narrator"));
    let character = Arc::new(MockSynthesizer::new("character"));
    let config = PipelineConfig {
        synthesis_mode: SynthesisMode::Batched,
        ..Default::default()
    };
    let branches = vec![
        Branch::new(VoiceMarker::from("AA"), narrator.clone()),
        Branch::new(VoiceMarker::from("BB"), character.clone()),
    ];
    let (handle, collected) = start(config, branches);
    send_all(&handle, &["AA a ", "b ", "c ", "BB d ", "e ", "AA f"]);
    handle.finish();

    assert_eq!(narrator.calls(), 2);
    assert_eq!(character.calls(), 1);
    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "a b c "),
            seg(0, 1, "BB", "d e "),
            seg(0, 2, "AA", "f"),
        ]
    );
}

#[test]
fn audio_payloads_keep_their_tags() {
    let audio = Payload::Audio {
        samples: vec![7; 16],
        sample_rate: 24_000,
    };
    let branches = vec![
        Branch::new(
            VoiceMarker::from("AA"),
            Arc::new(MockSynthesizer::new("narrator").with_response(audio.clone())),
        ),
        Branch::new(VoiceMarker::from("BB"), Arc::new(EchoSynthesizer::new("character"))),
    ];
    let (handle, collected) = start(PipelineConfig::default(), branches);
    send_all(&handle, &["AA x ", "BB y"]);
    handle.finish();

    let frames = collected.frames();
    let audio_frames: Vec<&ResultFrame> = frames
        .iter()
        .filter(|f| matches!(&f.body, FrameBody::Payload(Payload::Audio { .. })))
        .collect();
    assert_eq!(audio_frames.len(), 1);
    assert_eq!(audio_frames[0].key, SegmentKey::new(0, 0));
    assert_eq!(audio_frames[0].voice.as_str(), "AA");
}

/// Pair of synthesizers that detect whether the second voice was called
/// while the first was still synthesizing.
struct OverlapRecorder {
    name: &'static str,
    waits: bool,
    started_tx: Sender<()>,
    started_rx: Receiver<()>,
    overlapped: Arc<AtomicBool>,
}

impl OverlapRecorder {
    fn pair() -> (OverlapRecorder, OverlapRecorder, Arc<AtomicBool>) {
        let (tx, rx) = unbounded();
        let overlapped = Arc::new(AtomicBool::new(false));
        let first = OverlapRecorder {
            name: "first",
            waits: true,
            started_tx: tx.clone(),
            started_rx: rx.clone(),
            overlapped: overlapped.clone(),
        };
        let second = OverlapRecorder {
            name: "second",
            waits: false,
            started_tx: tx,
            started_rx: rx,
            overlapped: overlapped.clone(),
        };
        (first, second, overlapped)
    }
}

impl Synthesizer for OverlapRecorder {
    fn synthesize(&self, request: &SynthesisRequest) -> polyvox::Result<Vec<Payload>> {
        if self.waits {
            let seen = self.started_rx.recv_timeout(Duration::from_millis(500)).is_ok();
            self.overlapped.store(seen, Ordering::SeqCst);
        } else {
            self.started_tx.send(()).unwrap();
        }
        Ok(vec![Payload::transcript(request.text.clone())])
    }

    fn voice_name(&self) -> &str {
        self.name
    }
}

fn run_overlapping(dispatch: DispatchPolicy) -> (bool, Vec<Released>) {
    let (first, second, overlapped) = OverlapRecorder::pair();
    let config = PipelineConfig {
        dispatch,
        ..Default::default()
    };
    let branches = vec![
        Branch::new(VoiceMarker::from("AA"), Arc::new(first)),
        Branch::new(VoiceMarker::from("BB"), Arc::new(second)),
    ];
    let (handle, collected) = start(config, branches);
    send_all(&handle, &["AA opening ", "BB reply"]);
    let report = handle.finish();
    assert!(report.drained);
    (overlapped.load(Ordering::SeqCst), released(&collected.frames()))
}

#[test]
fn on_close_dispatches_next_segment_while_first_synthesizes() {
    let (overlapped, segments) = run_overlapping(DispatchPolicy::OnClose);
    assert!(overlapped);
    assert_eq!(
        segments,
        vec![seg(0, 0, "AA", "opening "), seg(0, 1, "BB", "reply")]
    );
}

#[test]
fn on_release_holds_next_segment_until_first_is_released() {
    let (overlapped, segments) = run_overlapping(DispatchPolicy::OnRelease);
    assert!(!overlapped);
    assert_eq!(
        segments,
        vec![seg(0, 0, "AA", "opening "), seg(0, 1, "BB", "reply")]
    );
}

#[test]
fn on_release_keeps_order_across_turns() {
    let config = PipelineConfig {
        dispatch: DispatchPolicy::OnRelease,
        ..Default::default()
    };
    let (handle, collected) = start(
        config,
        echo_branches(Duration::from_millis(5), Duration::from_millis(20)),
    );
    send_all(&handle, &["AA a ", "BB b ", "AA c "]);
    handle.end_response().unwrap();
    send_all(&handle, &["BB d ", "AA e"]);
    let report = handle.finish();

    assert!(report.drained);
    assert_eq!(
        released(&collected.frames()),
        vec![
            seg(0, 0, "AA", "a "),
            seg(0, 1, "BB", "b "),
            seg(0, 2, "AA", "c "),
            seg(1, 0, "BB", "d "),
            seg(1, 1, "AA", "e"),
        ]
    );
}

/// Echoes, and tells the test when its first call starts.
struct FirstCallSignal {
    started: Sender<()>,
}

impl Synthesizer for FirstCallSignal {
    fn synthesize(&self, request: &SynthesisRequest) -> polyvox::Result<Vec<Payload>> {
        let _ = self.started.send(());
        Ok(vec![Payload::transcript(request.text.clone())])
    }

    fn voice_name(&self) -> &str {
        "character"
    }
}

#[test]
fn slow_branch_does_not_hold_back_the_other_voice() {
    let (started_tx, started_rx) = unbounded();
    let config = PipelineConfig {
        branch_buffer: 2,
        shutdown_timeout: Duration::from_secs(15),
        ..Default::default()
    };
    let branches = vec![
        Branch::new(
            VoiceMarker::from("AA"),
            Arc::new(EchoSynthesizer::new("narrator").with_latency(Duration::from_millis(20))),
        ),
        Branch::new(
            VoiceMarker::from("BB"),
            Arc::new(FirstCallSignal { started: started_tx }),
        ),
    ];
    let (handle, collected) = start(config, branches);

    let words: Vec<String> = (0..150).map(|i| format!("w{i} ")).collect();
    handle.send_text("AA ").unwrap();
    for word in &words {
        handle.send_text(word.as_str()).unwrap();
    }
    handle.send_text("BB reply ").unwrap();

    // AA needs about three seconds for its backlog.
    assert!(
        started_rx.recv_timeout(Duration::from_secs(1)).is_ok(),
        "BB was not called while AA worked through its backlog"
    );

    let report = handle.finish();
    assert!(report.drained);
    assert_eq!(
        released(&collected.frames()),
        vec![seg(0, 0, "AA", &words.concat()), seg(0, 1, "BB", "reply ")]
    );
}

/// Blocks its first call until aborted, then behaves like an echo.
#[derive(Default)]
struct StuckOnce {
    calls: AtomicUsize,
    aborts: AtomicUsize,
}

impl StuckOnce {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl Synthesizer for StuckOnce {
    fn synthesize(&self, request: &SynthesisRequest) -> polyvox::Result<Vec<Payload>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.aborts() == 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(polyvox::PolyvoxError::Synthesis {
                voice: "character".to_string(),
                message: "aborted".to_string(),
            });
        }
        Ok(vec![Payload::transcript(request.text.clone())])
    }

    fn voice_name(&self) -> &str {
        "character"
    }

    fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn cancel_aborts_the_call_in_flight() {
    let stuck = Arc::new(StuckOnce::default());
    let reporter = Arc::new(CapturingReporter::default());
    let collector = CollectorSink::new();
    let collected = collector.collected();
    let config = PipelineConfig {
        synthesis_timeout: None,
        ..Default::default()
    };
    let branches = vec![
        Branch::new(VoiceMarker::from("AA"), Arc::new(EchoSynthesizer::new("narrator"))),
        Branch::new(VoiceMarker::from("BB"), stuck.clone()),
    ];
    let handle = Pipeline::new(config)
        .with_error_reporter(reporter.clone())
        .start(branches, vec![Box::new(collector)])
        .unwrap();

    handle.send_text("BB stuck ").unwrap();
    assert!(wait_until(Duration::from_secs(1), || stuck.calls() == 1));

    handle.cancel().unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || stuck.aborts() >= 1),
        "cancel did not reach the running call"
    );

    handle.send_text("BB next ").unwrap();
    let started = Instant::now();
    let report = handle.finish();

    assert!(report.drained);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(released(&collected.frames()), vec![seg(1, 0, "BB", "next ")]);
    assert_eq!(stuck.aborts(), 1);
    assert!(reporter.errors().is_empty());
}
