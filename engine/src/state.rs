//! Read-only state snapshots published to clients on request and on
//! maintenance ticks.

use serde::{Deserialize, Serialize};

use crate::mode::Mode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackState {
    pub number: usize,
    pub name: String,
    pub mode: Mode,
    pub frame: i64,
    pub frames: i64,
    pub cycles: u32,
    pub layer_count: usize,
    pub redo_count: usize,
    pub mute: bool,
    pub overdub: bool,
    pub pause: bool,
    pub feedback: u8,
    pub level: f32,
    pub pan: f32,
    pub output_meter: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub tracks: Vec<TrackState>,
    pub receiving_clocks: bool,
    pub sample_rate: u32,
    pub buffer_starvation: usize,
    pub midi_overflows: usize,
}
