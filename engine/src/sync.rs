//! Sync pulse routing and loop/clock coordination.
//!
//! The synchronizer drains the MIDI queue once per interrupt, promotes
//! beat pulses to bar pulses using the setup's beats-per-bar, activates
//! events that were waiting on a pulse, and drives outgoing transport
//! messages when a track is the sync master.

pub mod queue;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{EngineConfig, SyncUnit};

pub use queue::{
    CLOCKS_PER_BEAT, MAX_CLOCK_GAP_MS, MAX_SYNC_EVENTS, MidiQueue, MidiState, MidiStatus,
    MidiSyncEvent, PulseType, SyncEvent, SyncEventType,
};

/// Outgoing MIDI transport, implemented by the device layer.
pub trait MidiTransport: Send {
    fn start(&mut self);
    fn stop(&mut self);
    fn continue_transport(&mut self);
    fn set_tempo(&mut self, bpm: f32);
}

/// A transport that goes nowhere, for headless and test use.
#[derive(Default)]
pub struct NullTransport;

impl MidiTransport for NullTransport {
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn continue_transport(&mut self) {}
    fn set_tempo(&mut self, _bpm: f32) {}
}

pub struct Synchronizer {
    queue: Arc<MidiQueue>,
    transport: Box<dyn MidiTransport>,
    /// Events drained this interrupt, delivered to every track.
    events: Vec<SyncEvent>,
    /// Estimated frames between beat pulses.
    beat_frames: f64,
    last_beat_millisecond: i64,
    sample_rate: u32,
    beats_per_bar: u32,
    clocks_started: bool,
}

impl Synchronizer {
    pub fn new(queue: Arc<MidiQueue>, sample_rate: u32) -> Self {
        Synchronizer {
            queue,
            transport: Box::new(NullTransport),
            events: Vec::with_capacity(MAX_SYNC_EVENTS),
            beat_frames: 0.0,
            last_beat_millisecond: -1,
            sample_rate,
            beats_per_bar: 4,
            clocks_started: false,
        }
    }

    pub fn set_transport(&mut self, transport: Box<dyn MidiTransport>) {
        self.transport = transport;
    }

    pub fn queue(&self) -> Arc<MidiQueue> {
        self.queue.clone()
    }

    pub fn receiving_clocks(&self) -> bool {
        self.queue.state().receiving_clocks
    }

    /// Drain and cook the queue at the start of an interrupt. Beat
    /// pulses falling on a bar boundary are promoted to bar pulses.
    pub fn interrupt_start(&mut self, millisecond: i64, config: &EngineConfig) {
        self.beats_per_bar = config.setup.beats_per_bar.max(1);
        self.queue.interrupt_start(millisecond);
        self.events.clear();
        self.queue.get_events(&mut self.events);
        for event in self.events.iter_mut() {
            if event.pulse == PulseType::Beat {
                let on_bar = event.beat % self.beats_per_bar as i64 == 0;
                if on_bar || event.etype == SyncEventType::Start {
                    event.pulse = PulseType::Bar;
                }
                if self.last_beat_millisecond >= 0 {
                    let delta_ms = event.millisecond - self.last_beat_millisecond;
                    if delta_ms > 0 {
                        self.beat_frames = delta_ms as f64 * self.sample_rate as f64 / 1000.0;
                    }
                }
                self.last_beat_millisecond = event.millisecond;
            }
        }
    }

    pub fn events(&self) -> &[SyncEvent] {
        &self.events
    }

    /// Host-transport pulse, delivered by a plugin-host wrapper after
    /// `interrupt_start` for the interrupt it falls in.
    pub fn host_pulse(&mut self, beat: i64, on_bar: bool, millisecond: i64) {
        let pulse = if on_bar { PulseType::Bar } else { PulseType::Beat };
        self.events.push(SyncEvent {
            etype: SyncEventType::Pulse,
            pulse,
            beat,
            continue_pulse: 0,
            millisecond,
        });
        if self.last_beat_millisecond >= 0 {
            let delta_ms = millisecond - self.last_beat_millisecond;
            if delta_ms > 0 {
                self.beat_frames = delta_ms as f64 * self.sample_rate as f64 / 1000.0;
            }
        }
        self.last_beat_millisecond = millisecond;
    }

    /// Does this interrupt carry a pulse a pending event may latch to?
    pub fn pulse_this_interrupt(&self, unit: SyncUnit) -> bool {
        self.events.iter().any(|e| match unit {
            SyncUnit::Beat => matches!(e.pulse, PulseType::Beat | PulseType::Bar),
            SyncUnit::Bar => e.pulse == PulseType::Bar,
        })
    }

    /// Round a freely recorded length to a whole number of beat pulses
    /// when a beat estimate exists.
    pub fn round_recorded_frames(&self, frames: i64, unit: SyncUnit) -> i64 {
        if self.beat_frames <= 0.0 || frames <= 0 {
            return frames;
        }
        let unit_frames = match unit {
            SyncUnit::Beat => self.beat_frames,
            SyncUnit::Bar => self.beat_frames * self.beats_per_bar as f64,
        };
        let units = (frames as f64 / unit_frames).round().max(1.0);
        (units * unit_frames).round() as i64
    }

    /// Tempo implied by a loop length, for the outgoing clock timer.
    pub fn loop_tempo(&self, loop_frames: i64, cycles: u32) -> f32 {
        if loop_frames <= 0 {
            return 0.0;
        }
        let beats = (cycles.max(1) * self.beats_per_bar) as f32;
        let seconds = loop_frames as f32 / self.sample_rate as f32;
        beats * 60.0 / seconds
    }

    /// A master loop was resized; retune outgoing clocks.
    pub fn loop_resize(&mut self, loop_frames: i64, cycles: u32, restart: bool) {
        let tempo = self.loop_tempo(loop_frames, cycles);
        if tempo > 0.0 {
            debug!(tempo, "sync master resized");
            self.transport.set_tempo(tempo);
            if restart {
                self.transport.start();
                self.clocks_started = true;
            }
        }
    }

    /// A master loop restarted from the top.
    pub fn loop_restart(&mut self) {
        info!("sync master restarted, sending start");
        self.transport.start();
        self.clocks_started = true;
    }

    /// A master loop was muted in a mode that stops clocks.
    pub fn loop_mute(&mut self) {
        if self.clocks_started {
            self.transport.stop();
            self.clocks_started = false;
        }
    }

    pub fn loop_pause(&mut self) {
        if self.clocks_started {
            self.transport.stop();
            self.clocks_started = false;
        }
    }

    pub fn loop_resume(&mut self) {
        if !self.clocks_started {
            self.transport.continue_transport();
            self.clocks_started = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn synchronizer() -> Synchronizer {
        Synchronizer::new(Arc::new(MidiQueue::new()), 44_100)
    }

    #[test]
    fn beats_promote_to_bars() {
        let mut sync = synchronizer();
        let config = EngineConfig::default();
        let queue = sync.queue();
        queue.add(MidiStatus::Start, 0, 0);
        // four beats of clocks: 1 + 96 clocks
        for i in 0..97 {
            queue.add(MidiStatus::Clock, i, 0);
        }
        sync.interrupt_start(100, &config);
        let bars: Vec<_> = sync
            .events()
            .iter()
            .filter(|e| e.pulse == PulseType::Bar)
            .collect();
        // the start pulse (beat 0) and beat 4 land on bars
        assert_eq!(bars.len(), 2);
        assert!(sync.pulse_this_interrupt(SyncUnit::Bar));
        assert!(sync.pulse_this_interrupt(SyncUnit::Beat));
    }

    #[test]
    fn beat_estimate_rounds_recordings() {
        let mut sync = synchronizer();
        let config = EngineConfig::default();
        let queue = sync.queue();
        queue.add(MidiStatus::Start, 0, 0);
        // 500 ms per beat = 120 bpm = 22050 frames per beat
        for beat in 0..3 {
            for clock in 0..24 {
                let ms = beat * 500 + clock * 500 / 24;
                queue.add(MidiStatus::Clock, ms, 0);
            }
        }
        sync.interrupt_start(2000, &config);
        let rounded = sync.round_recorded_frames(23_000, SyncUnit::Beat);
        assert_eq!(rounded, 22_050);
        let bar = sync.round_recorded_frames(80_000, SyncUnit::Bar);
        assert_eq!(bar, 88_200);
    }

    #[test]
    fn loop_tempo_from_length() {
        let sync = synchronizer();
        // 88200 frames, one cycle of four beats at 44.1k = 2 seconds
        let tempo = sync.loop_tempo(88_200, 1);
        assert!((tempo - 120.0).abs() < 0.01);
    }
}
