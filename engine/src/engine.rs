//! The engine task: owns the recorder, dispatches client actions, and
//! publishes state. All mutation of engine structure (tracks, config)
//! happens here, between interrupts; the audio path only ever sees
//! immutable snapshots and lock-free queues.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{Receiver, Sender, channel};
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::event::EventArg;
use crate::functions::LoopAction;
use crate::maintenance::{self, Job};
use crate::message::{Action, Message};
use crate::mutex::UnsafeMutex;
use crate::recorder::Recorder;
use crate::state::{EngineState, TrackState};
use crate::sync::{MidiQueue, Synchronizer};

const METER_PUBLISH_INTERVAL: Duration = Duration::from_millis(200);

pub struct Engine {
    clients: Vec<Sender<Message>>,
    rx: Receiver<Message>,
    tx: Sender<Message>,
    recorder: Arc<UnsafeMutex<Recorder>>,
    midi_queue: Arc<MidiQueue>,
    jobs: Option<Sender<Job>>,
}

impl Engine {
    pub fn new(rx: Receiver<Message>, tx: Sender<Message>) -> Self {
        let config = Arc::new(EngineConfig::default());
        let midi_queue = Arc::new(MidiQueue::new());
        let sync = Synchronizer::new(midi_queue.clone(), config.sample_rate);
        let recorder = Arc::new(UnsafeMutex::new(Recorder::new(config, sync)));
        Engine {
            clients: vec![],
            rx,
            tx,
            recorder,
            midi_queue,
            jobs: None,
        }
    }

    pub fn recorder(&self) -> Arc<UnsafeMutex<Recorder>> {
        self.recorder.clone()
    }

    pub async fn init(&mut self) {
        let (jobs_tx, jobs_rx) = channel::<Job>(16);
        let _ = maintenance::spawn(self.recorder.clone(), jobs_rx, self.tx.clone());
        self.jobs = Some(jobs_tx);
        info!("engine initialized");
    }

    pub async fn work(&mut self) {
        let mut meters = tokio::time::interval(METER_PUBLISH_INTERVAL);
        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    if !self.dispatch(message).await {
                        break;
                    }
                }
                _ = meters.tick() => {
                    self.publish_meters().await;
                }
            }
        }
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(Job::Quit).await;
        }
        info!("engine stopped");
    }

    async fn dispatch(&mut self, message: Message) -> bool {
        match message {
            Message::Request(action) => {
                if matches!(action, Action::Quit) {
                    self.notify(Message::Response(Ok(Action::Quit))).await;
                    return false;
                }
                let result = self.handle(action).await;
                self.notify(Message::Response(result)).await;
            }
            Message::Channel(client) => {
                self.clients.push(client);
            }
            // maintenance completions flow through to clients
            m @ (Message::ProjectSaved(_) | Message::ProjectLoaded(_) | Message::Prompt(_) | Message::EngineStalled) => {
                self.notify(m).await;
            }
            other => {
                debug!(?other, "unhandled engine message");
            }
        }
        true
    }

    async fn handle(&mut self, action: Action) -> Result<Action, String> {
        match &action {
            Action::Invoke { track, function, down, args } => {
                self.invoke(*track, function, *down, args.clone())?;
            }
            Action::InvokeGlobal { function, args } => {
                let recorder = self.recorder.lock();
                let f = recorder
                    .functions
                    .by_name(function)
                    .ok_or_else(|| format!("unknown function {function}"))?;
                if !f.global {
                    return Err(format!("{function} is not a global function"));
                }
                recorder.global_queue().push(LoopAction {
                    function: f.id,
                    down: true,
                    args: args.clone(),
                });
            }
            Action::AddTrack { name } => {
                self.recorder.lock().add_track(name.clone());
            }
            Action::RenameTrack { track, new_name } => {
                let recorder = self.recorder.lock();
                let t = recorder
                    .track_mut(*track)
                    .ok_or_else(|| format!("no track {track}"))?;
                t.set_name(new_name.clone());
            }
            Action::TrackFeedback { track, value } => {
                self.recorder.lock().set_track_feedback(*track, *value);
            }
            Action::TrackLevel { track, value } => {
                let recorder = self.recorder.lock();
                let t = recorder
                    .track_mut(*track)
                    .ok_or_else(|| format!("no track {track}"))?;
                t.set_level(*value);
            }
            Action::TrackPan { track, value } => {
                let recorder = self.recorder.lock();
                let t = recorder
                    .track_mut(*track)
                    .ok_or_else(|| format!("no track {track}"))?;
                t.set_pan(*value);
            }
            Action::GlobalReset => {
                self.recorder.lock().global_reset();
            }
            Action::Calibrate => {
                self.recorder.lock().begin_calibration();
            }
            Action::SetPreset(preset) => {
                let recorder = self.recorder.lock();
                let mut config = (*recorder.config()).clone();
                config.preset = preset.clone();
                recorder.set_config(Arc::new(config));
            }
            Action::SetSetup(setup) => {
                let recorder = self.recorder.lock();
                let mut config = (*recorder.config()).clone();
                config.setup = setup.clone();
                recorder.set_config(Arc::new(config));
            }
            Action::SetConfig(config) => {
                self.recorder.lock().set_config(Arc::new(config.clone()));
            }
            Action::SaveProject(path) => {
                self.send_job(Job::SaveProject(PathBuf::from(path))).await?;
            }
            Action::LoadProject(path) => {
                self.send_job(Job::LoadProject(PathBuf::from(path))).await?;
            }
            Action::GetState => {
                let state = self.snapshot();
                self.notify(Message::State(state)).await;
            }
            Action::MidiBytes { bytes, millisecond } => {
                self.midi_queue.add_bytes(bytes, *millisecond);
            }
            Action::Quit => {}
        }
        Ok(action)
    }

    fn invoke(&mut self, track: usize, function: &str, down: bool, args: Vec<EventArg>) -> Result<(), String> {
        let recorder = self.recorder.lock();
        let f = recorder
            .functions
            .by_name(function)
            .ok_or_else(|| format!("unknown function {function}"))?;
        if f.script_only {
            return Err(format!("{function} is script only"));
        }
        let action = LoopAction {
            function: f.id,
            down,
            args,
        };
        if f.global {
            recorder.global_queue().push(action);
            return Ok(());
        }
        let t = recorder.track(track).ok_or_else(|| format!("no track {track}"))?;
        t.action_queue().push(action);
        Ok(())
    }

    async fn send_job(&self, job: Job) -> Result<(), String> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).await.map_err(|e| format!("maintenance is gone: {e}")),
            None => Err("engine not initialized".to_string()),
        }
    }

    fn snapshot(&self) -> EngineState {
        let recorder = self.recorder.lock();
        let config = recorder.config();
        let tracks = recorder
            .tracks()
            .iter()
            .map(|t| {
                let mut layer_count = 0;
                let mut cursor = t.lp.play_layer;
                while let Some(id) = cursor {
                    layer_count += 1;
                    cursor = recorder.layers.get(id).and_then(|l| l.prev);
                }
                let mut redo_count = 0;
                let mut cursor = t.lp.redo_layer;
                while let Some(id) = cursor {
                    redo_count += 1;
                    cursor = recorder.layers.get(id).and_then(|l| l.redo);
                }
                TrackState {
                    number: t.number(),
                    name: t.name(),
                    mode: t.lp.mode,
                    frame: t.lp.frame,
                    frames: t.lp.loop_frames(&recorder.layers),
                    cycles: t.lp.play_layer.and_then(|id| recorder.layers.get(id)).map(|l| l.cycles()).unwrap_or(0),
                    layer_count,
                    redo_count,
                    mute: t.lp.mute_mode,
                    overdub: t.lp.overdub,
                    pause: t.lp.pause,
                    feedback: t.lp.feedback,
                    level: t.level(),
                    pan: t.pan(),
                    output_meter: t.output_meter(),
                }
            })
            .collect();
        EngineState {
            tracks,
            receiving_clocks: recorder.sync.receiving_clocks(),
            sample_rate: config.sample_rate,
            buffer_starvation: recorder.audio_pool.starvation_count(),
            midi_overflows: self.midi_queue.overflows(),
        }
    }

    async fn publish_meters(&mut self) {
        if self.clients.is_empty() {
            return;
        }
        let tracks = self.snapshot().tracks;
        self.notify(Message::Tracks(tracks)).await;
    }

    async fn notify(&mut self, message: Message) {
        let mut dead = Vec::new();
        for (i, client) in self.clients.iter().enumerate() {
            if client.send(message.clone()).await.is_err() {
                dead.push(i);
            }
        }
        for i in dead.into_iter().rev() {
            error!("dropping dead client");
            self.clients.remove(i);
        }
    }
}
