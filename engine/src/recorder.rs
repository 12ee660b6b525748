//! The interrupt entry point: fan interrupt buffers out to tracks,
//! priority tracks first, with reentry detection and the optional
//! latency calibration ping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, error, info, warn};

use crate::audio::{AudioPool, CHANNELS, MAX_INTERRUPT_FRAMES};
use crate::config::EngineConfig;
use crate::functions::{FunctionKind, Functions, LoopAction};
use crate::layer::LayerPool;
use crate::mutex::UnsafeMutex;
use crate::sync::Synchronizer;
use crate::track::{ActionQueue, Track};

/// Stereo ports one device exposes.
pub const MAX_PORTS: usize = 16;

/// Supplied by the device layer: interleaved float buffers per port.
pub trait AudioStream {
    fn interrupt_frames(&self) -> usize;
    fn input(&self, port: usize) -> &[f32];
    fn output(&mut self, port: usize) -> &mut [f32];
    /// Millisecond clock for sync bookkeeping.
    fn millisecond(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CalibrationResult {
    pub latency_frames: i64,
    pub timeout: bool,
}

#[derive(Debug, Clone, Copy)]
enum Calibration {
    Idle,
    /// Emit the ping on the next interrupt.
    Arm,
    /// Counting frames until the ping returns.
    Listening { elapsed: i64 },
    Done(CalibrationResult),
}

/// A global action aimed at every track at once.
pub struct GlobalQueue {
    inner: ActionQueue,
}

impl GlobalQueue {
    fn new() -> Self {
        GlobalQueue { inner: ActionQueue::new() }
    }

    pub fn push(&self, action: LoopAction) {
        self.inner.push(action);
    }

    fn pop(&self) -> Option<LoopAction> {
        self.inner.pop()
    }
}

pub struct Recorder {
    tracks: Vec<Track>,
    pub layers: LayerPool,
    pub audio_pool: AudioPool,
    pub sync: Synchronizer,
    pub functions: Functions,
    config: UnsafeMutex<Arc<EngineConfig>>,
    global_actions: Arc<GlobalQueue>,
    running: bool,
    in_interrupt: AtomicBool,
    interrupt_count: Arc<AtomicUsize>,
    frame: i64,
    calibration: Calibration,
}

impl Recorder {
    pub fn new(config: Arc<EngineConfig>, sync: Synchronizer) -> Self {
        let audio_pool = AudioPool::new();
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(32);
        let mut tracks = Vec::new();
        for (i, setup) in config.setup.tracks.iter().enumerate() {
            let name = if setup.name.is_empty() {
                format!("track {}", i + 1)
            } else {
                setup.name.clone()
            };
            tracks.push(Track::new(i, name, &config));
        }
        Recorder {
            tracks,
            layers,
            audio_pool,
            sync,
            functions: Functions::new(),
            config: UnsafeMutex::new(config),
            global_actions: Arc::new(GlobalQueue::new()),
            running: true,
            in_interrupt: AtomicBool::new(false),
            interrupt_count: Arc::new(AtomicUsize::new(0)),
            frame: 0,
            calibration: Calibration::Idle,
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }

    pub fn track(&self, number: usize) -> Option<&Track> {
        self.tracks.get(number)
    }

    pub fn track_mut(&mut self, number: usize) -> Option<&mut Track> {
        self.tracks.get_mut(number)
    }

    pub fn set_track_feedback(&mut self, track: usize, value: u8) {
        let Recorder { tracks, layers, .. } = self;
        if let Some(t) = tracks.get_mut(track) {
            t.set_feedback(layers, value.min(127));
        }
    }

    pub fn add_track(&mut self, name: String) -> usize {
        let number = self.tracks.len();
        let config = self.config.lock().clone();
        self.tracks.push(Track::new(number, name, &config));
        number
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.lock().clone()
    }

    /// Swap the configuration snapshot the next interrupt reads.
    pub fn set_config(&self, config: Arc<EngineConfig>) {
        *self.config.lock() = config;
    }

    pub fn global_queue(&self) -> Arc<GlobalQueue> {
        self.global_actions.clone()
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Watchdog handle for the maintenance task.
    pub fn interrupt_counter(&self) -> Arc<AtomicUsize> {
        self.interrupt_count.clone()
    }

    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.load(Ordering::Relaxed)
    }

    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn begin_calibration(&mut self) {
        self.calibration = Calibration::Arm;
        info!("latency calibration armed");
    }

    pub fn calibration_result(&self) -> Option<CalibrationResult> {
        match self.calibration {
            Calibration::Done(result) => Some(result),
            _ => None,
        }
    }

    /// Declared dead by the maintenance watchdog.
    pub fn emergency_exit(&mut self) {
        error!("stuck interrupt, emergency exit");
        self.running = false;
    }

    /// The device interrupt.
    pub fn process_stream(&mut self, stream: &mut dyn AudioStream) {
        if self.in_interrupt.swap(true, Ordering::Relaxed) {
            error!("interrupt reentry");
            return;
        }
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);

        if self.running {
            let frames = stream.interrupt_frames().min(MAX_INTERRUPT_FRAMES);
            let millisecond = stream.millisecond();
            let config = self.config.lock().clone();
            self.sync.interrupt_start(millisecond, &config);

            if matches!(self.calibration, Calibration::Idle | Calibration::Done(_)) {
                self.drain_global_actions();
                self.process_tracks(stream, &config, frames);
            } else {
                self.calibrate(stream, frames);
            }
            self.frame += frames as i64;
        }

        self.in_interrupt.store(false, Ordering::Relaxed);
    }

    fn process_tracks(&mut self, stream: &mut dyn AudioStream, config: &EngineConfig, frames: usize) {
        // sync masters first so their pulses are visible to followers
        let order: Vec<usize> = {
            let mut priority: Vec<usize> = Vec::new();
            let mut normal: Vec<usize> = Vec::new();
            for (i, track) in self.tracks.iter().enumerate() {
                if track.priority {
                    priority.push(i);
                } else {
                    normal.push(i);
                }
            }
            priority.into_iter().chain(normal).collect()
        };

        let mut input_scratch = [0.0f32; MAX_INTERRUPT_FRAMES * CHANNELS];
        let mut output_scratch = [0.0f32; MAX_INTERRUPT_FRAMES * CHANNELS];
        let samples = frames * CHANNELS;
        for i in order {
            let track = &mut self.tracks[i];
            let input = stream.input(track.input_port.min(MAX_PORTS - 1));
            let take = samples.min(input.len());
            input_scratch[..take].copy_from_slice(&input[..take]);
            input_scratch[take..samples].fill(0.0);
            output_scratch[..samples].fill(0.0);
            track.process(
                &mut self.layers,
                &mut self.sync,
                config,
                &self.functions,
                &input_scratch[..samples],
                &mut output_scratch[..samples],
                frames,
            );
            let out = stream.output(track.output_port.min(MAX_PORTS - 1));
            for (d, s) in out.iter_mut().zip(output_scratch[..samples].iter()) {
                *d += *s;
            }
        }
    }

    /// Latency ping: emit an impulse on port zero and count frames
    /// until it returns above the detection threshold.
    fn calibrate(&mut self, stream: &mut dyn AudioStream, frames: usize) {
        const THRESHOLD: f32 = 0.1;
        const TIMEOUT_FRAMES: i64 = 96_000;
        match self.calibration {
            Calibration::Arm => {
                let out = stream.output(0);
                if !out.is_empty() {
                    out[0] = 1.0;
                    if out.len() > 1 {
                        out[1] = 1.0;
                    }
                }
                self.calibration = Calibration::Listening { elapsed: 0 };
                debug!("calibration ping sent");
            }
            Calibration::Listening { elapsed } => {
                let input = stream.input(0);
                let mut found = None;
                for frame in 0..frames.min(input.len() / CHANNELS) {
                    if input[frame * CHANNELS].abs() >= THRESHOLD {
                        found = Some(frame as i64);
                        break;
                    }
                }
                match found {
                    Some(offset) => {
                        let latency = elapsed + offset;
                        info!(latency, "calibration complete");
                        self.calibration = Calibration::Done(CalibrationResult {
                            latency_frames: latency,
                            timeout: false,
                        });
                    }
                    None => {
                        let elapsed = elapsed + frames as i64;
                        if elapsed > TIMEOUT_FRAMES {
                            warn!("calibration timed out");
                            self.calibration = Calibration::Done(CalibrationResult {
                                latency_frames: 0,
                                timeout: true,
                            });
                        } else {
                            self.calibration = Calibration::Listening { elapsed };
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Global functions span tracks and carry restore state.
    fn drain_global_actions(&mut self) {
        let queue = self.global_actions.clone();
        while let Some(action) = queue.pop() {
            let kind = self.functions.get(action.function).map(|f| f.kind);
            match kind {
                Some(FunctionKind::GlobalMute) => self.global_mute(),
                Some(FunctionKind::GlobalPause) => self.global_pause(),
                Some(FunctionKind::Solo) => {
                    let target = action
                        .args
                        .first()
                        .and_then(|a| a.as_int())
                        .unwrap_or(0)
                        .clamp(0, self.tracks.len().saturating_sub(1) as i64)
                        as usize;
                    self.solo(target);
                }
                _ => {
                    // not global after all; hand it to every track
                    for track in self.tracks.iter() {
                        track.action_queue().push(action.clone());
                    }
                }
            }
        }
    }

    fn mute_function(&self, name: &str) -> Option<crate::functions::FunctionId> {
        self.functions.by_name(name).map(|f| f.id)
    }

    /// First press mutes everything playing, remembering the set; the
    /// second restores exactly that set. An active solo is cancelled
    /// first.
    fn global_mute(&mut self) {
        let (Some(mute_on), Some(mute_off)) = (self.mute_function("MuteOn"), self.mute_function("MuteOff")) else {
            return;
        };
        if self.tracks.iter().any(|t| t.lp.solo_restore) {
            self.unsolo();
        }
        let restoring = self.tracks.iter().any(|t| t.lp.global_mute_restore);
        if restoring {
            for track in self.tracks.iter_mut() {
                if track.lp.global_mute_restore {
                    track.lp.global_mute_restore = false;
                    track.action_queue().push(LoopAction::press(mute_off));
                }
            }
            info!("global mute restored");
        } else {
            for track in self.tracks.iter_mut() {
                if !track.lp.mute_mode && !track.lp.is_reset() {
                    track.lp.global_mute_restore = true;
                    track.action_queue().push(LoopAction::press(mute_on));
                }
            }
            info!("global mute");
        }
    }

    fn global_pause(&mut self) {
        let Some(pause) = self.mute_function("Pause") else {
            return;
        };
        for track in self.tracks.iter() {
            if !track.lp.is_reset() {
                track.action_queue().push(LoopAction::press(pause));
            }
        }
        info!("global pause");
    }

    /// Solo mutes every other track, remembering their states.
    fn solo(&mut self, target: usize) {
        let (Some(mute_on), Some(mute_off)) = (self.mute_function("MuteOn"), self.mute_function("MuteOff")) else {
            return;
        };
        let soloing = self.tracks.iter().any(|t| t.lp.solo_restore);
        if soloing {
            self.unsolo();
            return;
        }
        for (i, track) in self.tracks.iter_mut().enumerate() {
            if i == target {
                if track.lp.mute_mode {
                    track.action_queue().push(LoopAction::press(mute_off));
                }
                continue;
            }
            if !track.lp.is_reset() {
                track.lp.solo_restore = !track.lp.mute_mode;
                if !track.lp.mute_mode {
                    track.action_queue().push(LoopAction::press(mute_on));
                }
            }
        }
        info!(target, "solo");
    }

    fn unsolo(&mut self) {
        let Some(mute_off) = self.mute_function("MuteOff") else {
            return;
        };
        for track in self.tracks.iter_mut() {
            if track.lp.solo_restore {
                track.lp.solo_restore = false;
                track.action_queue().push(LoopAction::press(mute_off));
            }
        }
        info!("solo cancelled");
    }

    /// Full engine reset: every track back to empty.
    pub fn global_reset(&mut self) {
        let config = self.config.lock().clone();
        for track in self.tracks.iter_mut() {
            track.reset(&mut self.layers, &mut self.sync, &config, &self.functions);
        }
        info!("global reset");
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// Loopback-free stream with constant input on every port.
    pub struct TestStream {
        pub frames: usize,
        pub input: Vec<f32>,
        pub outputs: Vec<Vec<f32>>,
        pub ms: i64,
    }

    impl TestStream {
        pub fn set_input(&mut self, value: f32) {
            self.input.fill(value);
        }

        pub fn zero_outputs(&mut self) {
            for out in self.outputs.iter_mut() {
                out.fill(0.0);
            }
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

    pub fn silent_stream(frames: usize, input_value: f32) -> TestStream {
        TestStream {
            frames,
            input: vec![input_value; frames * CHANNELS],
            outputs: vec![vec![0.0; frames * CHANNELS]; 2],
            ms: 0,
        }
    }

    /// Run a number of interrupts, zeroing outputs between them like a
    /// real device would.
    pub fn drive(recorder: &mut Recorder, stream: &mut TestStream, interrupts: usize) {
        for _ in 0..interrupts {
            stream.zero_outputs();
            recorder.process_stream(stream);
            stream.ms += (stream.frames as i64 * 1000) / 44_100;
        }
    }
}
