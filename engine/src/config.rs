//! Engine configuration: per-loop behavior (Preset), per-track routing
//! (Setup), and global options.
//!
//! The engine task owns the mutable configuration; the interrupt reads
//! an immutable snapshot behind an `Arc` that is swapped between
//! interrupts, never mutated in place.

use serde::{Deserialize, Serialize};

use crate::audio::{DEFAULT_SAMPLE_RATE, WriteFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuantizeMode {
    #[default]
    Off,
    Subcycle,
    Cycle,
    Loop,
}

/// How unmute resumes playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MuteMode {
    /// Resume from wherever the output would be now.
    #[default]
    Continue,
    /// Restart from frame zero with latency compensation.
    Start,
    /// Stop the transport entirely; unmute continues and restarts clocks.
    Pause,
}

/// Pull-pattern generator used when Shuffle is invoked without an
/// explicit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShuffleMode {
    #[default]
    Reverse,
    Shift,
    Swap,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowUnit {
    Loop,
    #[default]
    Cycle,
    Subcycle,
    Msec,
    Frame,
    Start,
    End,
}

/// Unit a synchronized recording is rounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncUnit {
    #[default]
    Beat,
    Bar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncSource {
    #[default]
    None,
    Midi,
    Host,
}

/// Per-loop behavioral parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub subcycles: u32,
    pub quantize: QuantizeMode,
    pub mute_mode: MuteMode,
    pub shuffle_mode: ShuffleMode,
    pub window_slide_unit: WindowUnit,
    pub window_slide_amount: u32,
    pub window_edge_unit: WindowUnit,
    pub window_edge_amount: u32,
    /// Names of functions converted to sustain behavior.
    pub sustain_functions: Vec<String>,
    /// History layers kept before trimming; zero keeps everything.
    pub max_undo: u32,
    /// Rounded multiply/insert endings wait for the cycle boundary.
    pub round_mode: bool,
    pub sync_unit: SyncUnit,
    pub feedback: u8,
}

impl Default for Preset {
    fn default() -> Self {
        Preset {
            name: "default".to_string(),
            subcycles: 4,
            quantize: QuantizeMode::Off,
            mute_mode: MuteMode::Continue,
            shuffle_mode: ShuffleMode::Reverse,
            window_slide_unit: WindowUnit::Loop,
            window_slide_amount: 1,
            window_edge_unit: WindowUnit::Subcycle,
            window_edge_amount: 1,
            sustain_functions: Vec::new(),
            max_undo: 0,
            round_mode: true,
            sync_unit: SyncUnit::Bar,
            feedback: 127,
        }
    }
}

impl Preset {
    pub fn is_sustain_function(&self, name: &str) -> bool {
        self.sustain_functions.iter().any(|f| f == name)
    }
}

/// Per-track routing and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSetup {
    pub name: String,
    pub sync_source: SyncSource,
    pub input_port: usize,
    pub output_port: usize,
    pub feedback: u8,
    pub level: f32,
    pub pan: f32,
}

impl Default for TrackSetup {
    fn default() -> Self {
        TrackSetup {
            name: String::new(),
            sync_source: SyncSource::None,
            input_port: 0,
            output_port: 0,
            feedback: 127,
            level: 1.0,
            pan: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setup {
    pub name: String,
    pub tracks: Vec<TrackSetup>,
    pub beats_per_bar: u32,
    /// Track whose loop drives outgoing clocks and pulse rounding.
    pub sync_master: Option<usize>,
}

impl Default for Setup {
    fn default() -> Self {
        Setup {
            name: "default".to_string(),
            tracks: vec![TrackSetup::default()],
            beats_per_bar: 4,
            sync_master: None,
        }
    }
}

/// The immutable snapshot handed to the interrupt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub preset: Preset,
    pub setup: Setup,
    pub isolate_overdubs: bool,
    pub input_latency: i64,
    pub output_latency: i64,
    pub sample_rate: u32,
    pub write_format: WriteFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            preset: Preset::default(),
            setup: Setup::default(),
            isolate_overdubs: false,
            input_latency: 289,
            output_latency: 282,
            sample_rate: DEFAULT_SAMPLE_RATE,
            write_format: WriteFormat::Float32,
        }
    }
}

impl EngineConfig {
    /// The loop cannot shrink below the latency sum; windows and
    /// divides refuse to go smaller.
    pub fn minimum_frames(&self) -> i64 {
        (self.input_latency + self.output_latency).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_json() {
        let mut config = EngineConfig::default();
        config.preset.quantize = QuantizeMode::Cycle;
        config.preset.sustain_functions.push("Insert".to_string());
        config.setup.tracks.push(TrackSetup {
            name: "two".to_string(),
            ..TrackSetup::default()
        });
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.preset.quantize, QuantizeMode::Cycle);
        assert!(back.preset.is_sustain_function("Insert"));
        assert_eq!(back.setup.tracks.len(), 2);
    }
}
