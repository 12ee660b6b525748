//! End-to-end looper scenarios driven through the interrupt entry
//! point, the way a device callback would.

use std::sync::Arc;

use ouro_engine::audio::CHANNELS;
use ouro_engine::config::{EngineConfig, WindowUnit};
use ouro_engine::functions::LoopAction;
use ouro_engine::layer::LayerContext;
use ouro_engine::mode::Mode;
use ouro_engine::recorder::{AudioStream, Recorder};
use ouro_engine::sync::{MidiQueue, MidiStatus, Synchronizer};

const BLOCK: usize = 100;

struct TestStream {
    frames: usize,
    input: Vec<f32>,
    outputs: Vec<Vec<f32>>,
    ms: i64,
}

impl TestStream {
    fn new(frames: usize) -> Self {
        TestStream {
            frames,
            input: vec![0.0; frames * CHANNELS],
            outputs: vec![vec![0.0; frames * CHANNELS]; 2],
            ms: 0,
        }
    }

    fn set_input(&mut self, value: f32) {
        self.input.fill(value);
    }
}

impl AudioStream for TestStream {
    fn interrupt_frames(&self) -> usize {
        self.frames
    }

    fn input(&self, _port: usize) -> &[f32] {
        &self.input
    }

    fn output(&mut self, port: usize) -> &mut [f32] {
        let port = port.min(self.outputs.len() - 1);
        &mut self.outputs[port]
    }

    fn millisecond(&self) -> i64 {
        self.ms
    }
}

/// Latency-free configuration so scenario frame numbers are exact:
/// events scheduled "now" fire at the frame where the press arrived.
fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.input_latency = 0;
    config.output_latency = 0;
    config
}

fn recorder_with(config: EngineConfig) -> Recorder {
    let queue = Arc::new(MidiQueue::new());
    let sync = Synchronizer::new(queue, config.sample_rate);
    Recorder::new(Arc::new(config), sync)
}

fn press(recorder: &Recorder, function: &str) {
    let f = recorder.functions.by_name(function).unwrap().id;
    recorder.track(0).unwrap().action_queue().push(LoopAction::press(f));
}

fn press_args(recorder: &Recorder, function: &str, args: Vec<ouro_engine::event::EventArg>) {
    let f = recorder.functions.by_name(function).unwrap().id;
    recorder.track(0).unwrap().action_queue().push(LoopAction {
        function: f,
        down: true,
        args,
    });
}

fn drive(recorder: &mut Recorder, stream: &mut TestStream, interrupts: usize) {
    for _ in 0..interrupts {
        for out in stream.outputs.iter_mut() {
            out.fill(0.0);
        }
        recorder.process_stream(stream);
        stream.ms += (stream.frames * 1000 / 44_100) as i64;
    }
}

fn drive_frames(recorder: &mut Recorder, stream: &mut TestStream, frames: usize) {
    assert_eq!(frames % stream.frames, 0, "test frames must align to blocks");
    drive(recorder, stream, frames / stream.frames);
}

/// Record a loop of exactly `frames` frames: the stop press is drained
/// at the start of the interrupt where the cursor sits at `frames`.
fn record_loop(recorder: &mut Recorder, stream: &mut TestStream, frames: usize) {
    press(recorder, "Record");
    drive_frames(recorder, stream, frames);
    press(recorder, "Record");
    drive(recorder, stream, 1);
}

fn play_frames(recorder: &Recorder) -> i64 {
    let track = recorder.track(0).unwrap();
    track.lp.loop_frames(&recorder.layers)
}

fn play_layer_info(recorder: &Recorder) -> (i64, u32) {
    let track = recorder.track(0).unwrap();
    let play = track.lp.play_layer.unwrap();
    let layer = recorder.layers.get(play).unwrap();
    (layer.frames(), layer.cycles())
}

fn layer_chain_len(recorder: &Recorder) -> usize {
    let mut count = 0;
    let mut cursor = recorder.track(0).unwrap().lp.play_layer;
    while let Some(id) = cursor {
        count += 1;
        cursor = recorder.layers.get(id).and_then(|l| l.prev);
    }
    count
}

fn render_play(recorder: &Recorder, at: i64, frames: usize) -> Vec<f32> {
    let play = recorder.track(0).unwrap().lp.play_layer.unwrap();
    let mut out = vec![0.0f32; frames * CHANNELS];
    let mut ctx = LayerContext::new(&mut out, frames);
    recorder.layers.get_no_reflect(play, &mut ctx, at, false, false);
    out
}

#[test]
fn basic_record_then_play() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 44_100);

    let (frames, cycles) = play_layer_info(&recorder);
    assert_eq!(frames, 44_100);
    assert_eq!(cycles, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Play);

    // the frame wraps at the loop length: a whole pass returns to the
    // same position
    let before = recorder.track(0).unwrap().lp.frame;
    drive_frames(&mut recorder, &mut stream, 44_100);
    let after = recorder.track(0).unwrap().lp.frame;
    assert_eq!(after, before);
    // and replaying recorded silence leaves no history behind
    assert_eq!(layer_chain_len(&recorder), 1);
}

#[test]
fn recorded_content_plays_back() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    stream.set_input(0.25);
    record_loop(&mut recorder, &mut stream, 1000);
    stream.set_input(0.0);

    // drive a block; the output carries the recorded tone
    for out in stream.outputs.iter_mut() {
        out.fill(0.0);
    }
    recorder.process_stream(&mut stream);
    let out = &stream.outputs[0];
    let sample = out[(BLOCK / 2) * CHANNELS];
    assert!((sample - 0.25).abs() < 0.01, "expected tone, got {sample}");
}

#[test]
fn overdub_with_feedback_layers_and_undo() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    stream.set_input(0.25);
    record_loop(&mut recorder, &mut stream, 1000);
    let loop_frames = play_frames(&recorder) as usize;
    assert_eq!(loop_frames, 1000);
    let chain_one = layer_chain_len(&recorder);

    // feedback 64 decays the carried content through the log ramp
    recorder.set_track_feedback(0, 64);
    press(&recorder, "Overdub");
    stream.set_input(0.5);
    drive_frames(&mut recorder, &mut stream, loop_frames);
    press(&recorder, "Overdub");
    drive(&mut recorder, &mut stream, 1);
    stream.set_input(0.0);

    assert!(layer_chain_len(&recorder) > chain_one);
    let (frames, _) = play_layer_info(&recorder);
    assert_eq!(frames as usize, loop_frames);

    // output is previous content through the ramp plus the new tone
    let ramp = {
        let i = 64.0f32 / 127.0;
        i * i
    };
    let expected = 0.25 * ramp + 0.5;
    let out = render_play(&recorder, (loop_frames / 2) as i64, 4);
    assert!(
        (out[0] - expected).abs() < 0.02,
        "expected {expected}, got {}",
        out[0]
    );

    // undo steps back toward the original recording
    recorder.set_track_feedback(0, 127);
    while layer_chain_len(&recorder) > chain_one {
        press(&recorder, "Undo");
        drive(&mut recorder, &mut stream, 1);
    }
    let out = render_play(&recorder, (loop_frames / 2) as i64, 4);
    assert!((out[0] - 0.25).abs() < 0.01, "undo left {}", out[0]);

    // redo brings the overdub back
    press(&recorder, "Redo");
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(layer_chain_len(&recorder), chain_one + 1);
}

#[test]
fn multiply_with_unrounded_ending() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 1000);
    assert_eq!(play_frames(&recorder), 1000);
    // the stop interrupt advanced one block into the loop
    assert_eq!(recorder.track(0).unwrap().lp.frame, BLOCK as i64);

    press(&recorder, "Multiply");
    // multiply begins at frame 2*BLOCK; run until the record content
    // spans 2500 frames past the multiply origin
    drive_frames(&mut recorder, &mut stream, 2400);
    // Record is the unrounded ending
    press(&recorder, "Record");
    drive(&mut recorder, &mut stream, 1);

    let (frames, cycles) = play_layer_info(&recorder);
    assert_eq!(frames, 2500);
    assert_eq!(cycles, 1);
    // the wrapped cursor carries straight through the restructure
    assert_eq!(recorder.track(0).unwrap().lp.frame, 500 + BLOCK as i64);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Play);
}

#[test]
fn divide_keeps_the_current_division() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 2000);
    assert_eq!(play_frames(&recorder), 2000);

    press(&recorder, "InstantMultiply4");
    drive(&mut recorder, &mut stream, 1);
    let (frames, cycles) = play_layer_info(&recorder);
    assert_eq!(frames, 8000);
    assert_eq!(cycles, 4);

    // advance the cursor to frame 5200
    let at = recorder.track(0).unwrap().lp.frame;
    drive_frames(&mut recorder, &mut stream, (5200 - at) as usize);
    assert_eq!(recorder.track(0).unwrap().lp.frame, 5200);

    press(&recorder, "Divide4");
    drive(&mut recorder, &mut stream, 1);

    let (frames, cycles) = play_layer_info(&recorder);
    assert_eq!(frames, 2000);
    assert_eq!(cycles, 1);
    // 5200 lands at 1200 inside the kept division at offset 4000
    assert_eq!(recorder.track(0).unwrap().lp.frame, 1200 + BLOCK as i64);
    let play = recorder.track(0).unwrap().lp.play_layer.unwrap();
    let seg = &recorder.layers.get(play).unwrap().segments()[0];
    assert_eq!(seg.start_frame, 4000);
}

#[test]
fn insert_extends_and_unrounded_end_truncates() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 1000);
    assert_eq!(play_frames(&recorder), 1000);

    press(&recorder, "Insert");
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Insert);
    // output is muted during the insert
    assert!(recorder.track(0).unwrap().lp.mute);

    // partway into the gap, end unrounded: release of the SUS variant
    drive(&mut recorder, &mut stream, 3);
    let f = recorder.functions.by_name("SUSUnroundedInsert").unwrap().id;
    recorder
        .track(0)
        .unwrap()
        .action_queue()
        .push(LoopAction::release(f));
    drive(&mut recorder, &mut stream, 1);

    let (frames, cycles) = play_layer_info(&recorder);
    assert!(frames > 1000 && frames < 2000, "unrounded insert length {frames}");
    assert_eq!(cycles, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Play);
    assert!(!recorder.track(0).unwrap().lp.mute);
}

#[test]
fn mute_is_sticky_and_unmute_restarts_in_start_mode() {
    let mut config = test_config();
    config.preset.mute_mode = ouro_engine::config::MuteMode::Start;
    let mut recorder = recorder_with(config);
    let mut stream = TestStream::new(BLOCK);

    stream.set_input(0.25);
    record_loop(&mut recorder, &mut stream, 1000);
    stream.set_input(0.0);

    press(&recorder, "Mute");
    drive(&mut recorder, &mut stream, 2);
    {
        let track = recorder.track(0).unwrap();
        assert_eq!(track.lp.mode, Mode::Mute);
        assert!(track.lp.mute_mode);
    }
    // muted output is silent (the masking tail has already drained)
    for out in stream.outputs.iter_mut() {
        out.fill(0.0);
    }
    recorder.process_stream(&mut stream);
    assert!(stream.outputs[0].iter().all(|s| *s == 0.0));

    // advance somewhere into the loop, then unmute: start mode
    // restarts from frame zero
    drive(&mut recorder, &mut stream, 2);
    press(&recorder, "Mute");
    drive(&mut recorder, &mut stream, 1);
    let track = recorder.track(0).unwrap();
    assert!(!track.lp.mute_mode);
    assert_eq!(track.lp.mode, Mode::Play);
    assert!(track.lp.frame <= BLOCK as i64);
}

#[test]
fn stutter_repeats_the_current_cycle() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 1000);
    press(&recorder, "InstantMultiply");
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(play_frames(&recorder), 2000);

    press(&recorder, "Stutter");
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Stutter);

    // each pass over the stuttered cycle appends a copy
    drive_frames(&mut recorder, &mut stream, 2000);
    press(&recorder, "Stutter");
    drive_frames(&mut recorder, &mut stream, 1500);

    let (frames, _cycles) = play_layer_info(&recorder);
    assert!(frames > 2000, "stutter extended the loop to {frames}");
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Play);
}

#[test]
fn shuffle_reorders_and_resizes() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    record_loop(&mut recorder, &mut stream, 8000);
    assert_eq!(play_frames(&recorder), 8000);

    use ouro_engine::event::EventArg;
    // 8 granules; keep only the first four, reversed order
    press_args(
        &recorder,
        "Shuffle",
        vec![
            EventArg::Int(8),
            EventArg::Int(4),
            EventArg::Int(3),
            EventArg::Int(2),
            EventArg::Int(1),
            EventArg::Str("e".to_string()),
        ],
    );
    drive(&mut recorder, &mut stream, 1);

    let (frames, _) = play_layer_info(&recorder);
    assert_eq!(frames, 4000);
    let play = recorder.track(0).unwrap().lp.play_layer.unwrap();
    let segs = recorder.layers.get(play).unwrap().segments();
    assert_eq!(segs.len(), 4);
    assert_eq!(segs[0].start_frame, 3000);
    assert_eq!(segs[3].start_frame, 0);
    // the granule order is discontiguous, so every seam fades
    assert!(segs[0].fade_left);
    assert!(segs[0].fade_right);
}

#[test]
fn window_slides_backward_through_history() {
    let mut config = test_config();
    config.preset.window_slide_unit = WindowUnit::Cycle;
    let mut recorder = recorder_with(config);
    let mut stream = TestStream::new(BLOCK);

    // several generations of history, 1000 frames each
    stream.set_input(0.2);
    record_loop(&mut recorder, &mut stream, 1000);
    for pass in 0..2 {
        press(&recorder, "Overdub");
        stream.set_input(0.1 * (pass + 1) as f32);
        drive_frames(&mut recorder, &mut stream, 1000);
        press(&recorder, "Overdub");
        drive(&mut recorder, &mut stream, 1);
    }
    stream.set_input(0.0);
    // settle past the loop point so the last generation is committed
    drive_frames(&mut recorder, &mut stream, 1000);
    assert!(layer_chain_len(&recorder) >= 3);

    press(&recorder, "WindowBackward");
    drive(&mut recorder, &mut stream, 1);

    let history_end;
    {
        let track = recorder.track(0).unwrap();
        let play = track.lp.play_layer.unwrap();
        let layer = recorder.layers.get(play).unwrap();
        assert!(layer.is_windowing());
        assert_eq!(layer.frames(), 1000);
        history_end = track.lp.history_frames(&recorder.layers);
        let offset = layer.window_offset.unwrap();
        // slid one cycle back from the end of history
        assert_eq!(history_end - offset - layer.frames(), 1000);
        // slide restarts the loop frame
        assert!(track.lp.frame <= BLOCK as i64);
        assert!(!layer.segments().is_empty());
    }

    // window forward returns toward the end of history
    press(&recorder, "WindowForward");
    drive(&mut recorder, &mut stream, 1);
    let play = recorder.track(0).unwrap().lp.play_layer.unwrap();
    let layer = recorder.layers.get(play).unwrap();
    assert_eq!(layer.window_offset.unwrap(), history_end - layer.frames());
}

#[test]
fn synchronized_record_waits_for_a_pulse() {
    let mut config = test_config();
    config.setup.tracks[0].sync_source = ouro_engine::config::SyncSource::Midi;
    config.preset.sync_unit = ouro_engine::config::SyncUnit::Beat;
    let queue = Arc::new(MidiQueue::new());
    let sync = Synchronizer::new(queue.clone(), config.sample_rate);
    let mut recorder = Recorder::new(Arc::new(config), sync);
    let mut stream = TestStream::new(BLOCK);

    // a running clock stream
    queue.add(MidiStatus::Start, 0, 0);
    for i in 0..48 {
        queue.add(MidiStatus::Clock, i, 0);
    }
    drive(&mut recorder, &mut stream, 1);
    assert!(recorder.sync.receiving_clocks());

    press(&recorder, "Record");
    // no pulse this interrupt: the record event stays pending
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Synchronize);

    // the next beat pulse activates it
    for i in 0..24 {
        queue.add(MidiStatus::Clock, 48 + i, 0);
    }
    drive(&mut recorder, &mut stream, 1);
    assert_eq!(recorder.track(0).unwrap().lp.mode, Mode::Record);
}

#[test]
fn global_mute_restores_only_playing_tracks() {
    let mut config = test_config();
    config.setup.tracks.push(ouro_engine::config::TrackSetup::default());
    config.setup.tracks.push(ouro_engine::config::TrackSetup::default());
    let mut recorder = recorder_with(config);
    let mut stream = TestStream::new(BLOCK);

    // record on tracks 0 and 1; track 2 stays empty
    for t in 0..2 {
        let f = recorder.functions.by_name("Record").unwrap().id;
        recorder.track(t).unwrap().action_queue().push(LoopAction::press(f));
        drive_frames(&mut recorder, &mut stream, 1000);
        recorder.track(t).unwrap().action_queue().push(LoopAction::press(f));
        drive(&mut recorder, &mut stream, 1);
    }
    // track 1 manually muted
    let mute = recorder.functions.by_name("Mute").unwrap().id;
    recorder.track(1).unwrap().action_queue().push(LoopAction::press(mute));
    drive(&mut recorder, &mut stream, 2);
    assert!(recorder.track(1).unwrap().lp.mute_mode);

    let global = recorder.functions.by_name("GlobalMute").unwrap().id;
    recorder.global_queue().push(LoopAction::press(global));
    drive(&mut recorder, &mut stream, 2);
    assert!(recorder.track(0).unwrap().lp.mute_mode);
    assert!(recorder.track(1).unwrap().lp.mute_mode);

    // the second global mute restores only what it muted
    recorder.global_queue().push(LoopAction::press(global));
    drive(&mut recorder, &mut stream, 2);
    assert!(!recorder.track(0).unwrap().lp.mute_mode);
    assert!(recorder.track(1).unwrap().lp.mute_mode);
}

#[test]
fn replace_overwrites_the_background() {
    let mut recorder = recorder_with(test_config());
    let mut stream = TestStream::new(BLOCK);

    stream.set_input(0.25);
    record_loop(&mut recorder, &mut stream, 1000);

    press(&recorder, "Replace");
    stream.set_input(0.5);
    drive_frames(&mut recorder, &mut stream, 400);
    press(&recorder, "Replace");
    drive(&mut recorder, &mut stream, 1);
    stream.set_input(0.0);
    // cross the loop point to commit the generation
    drive_frames(&mut recorder, &mut stream, 1000);

    // the replaced region carries only the new tone; outside it the
    // original remains
    let replaced = render_play(&recorder, (BLOCK * 3) as i64, 2);
    assert!((replaced[0] - 0.5).abs() < 0.02, "replaced region reads {}", replaced[0]);
    let original = render_play(&recorder, 900, 2);
    assert!((original[0] - 0.25).abs() < 0.02, "original region reads {}", original[0]);
}
