//! Control-plane messages between clients, the engine task, and the
//! maintenance task.

use tokio::sync::mpsc::Sender;

use crate::config::{EngineConfig, Preset, Setup};
use crate::event::EventArg;
use crate::state::{EngineState, TrackState};

#[derive(Clone, Debug)]
pub enum Action {
    Quit,
    /// Invoke a looper function on one track.
    Invoke {
        track: usize,
        function: String,
        down: bool,
        args: Vec<EventArg>,
    },
    /// Invoke a global function (GlobalMute, GlobalPause, Solo).
    InvokeGlobal {
        function: String,
        args: Vec<EventArg>,
    },
    AddTrack {
        name: String,
    },
    RenameTrack {
        track: usize,
        new_name: String,
    },
    TrackFeedback {
        track: usize,
        value: u8,
    },
    TrackLevel {
        track: usize,
        value: f32,
    },
    TrackPan {
        track: usize,
        value: f32,
    },
    GlobalReset,
    Calibrate,
    SetPreset(Preset),
    SetSetup(Setup),
    SetConfig(EngineConfig),
    SaveProject(String),
    LoadProject(String),
    GetState,
    MidiBytes {
        bytes: Vec<u8>,
        millisecond: i64,
    },
}

#[derive(Clone, Debug)]
pub enum Message {
    Request(Action),
    Response(Result<Action, String>),
    Channel(Sender<Self>),
    State(EngineState),
    Tracks(Vec<TrackState>),
    Prompt(String),
    ProjectSaved(Result<String, String>),
    ProjectLoaded(Result<String, String>),
    EngineStalled,
}
