mod logging;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ouro_engine::audio::CHANNELS;
use ouro_engine::event::EventArg;
use ouro_engine::message::{Action, Message};
use ouro_engine::mutex::UnsafeMutex;
use ouro_engine::recorder::{AudioStream, Recorder};
use tokio::sync::mpsc::{Sender, channel};
use tracing::{error, info};

const FRAMES_PER_INTERRUPT: usize = 256;
const SAMPLE_RATE: usize = 44_100;

/// A silent device: no capture hardware, discarded playback. Stands in
/// for a real driver so the engine can be exercised headless.
struct NullStream {
    input: Vec<f32>,
    outputs: Vec<Vec<f32>>,
    started: std::time::Instant,
}

impl NullStream {
    fn new() -> Self {
        NullStream {
            input: vec![0.0; FRAMES_PER_INTERRUPT * CHANNELS],
            outputs: vec![vec![0.0; FRAMES_PER_INTERRUPT * CHANNELS]; 2],
            started: std::time::Instant::now(),
        }
    }
}

impl AudioStream for NullStream {
    fn interrupt_frames(&self) -> usize {
        FRAMES_PER_INTERRUPT
    }

    fn input(&self, _port: usize) -> &[f32] {
        &self.input
    }

    fn output(&mut self, port: usize) -> &mut [f32] {
        let port = port.min(self.outputs.len() - 1);
        &mut self.outputs[port]
    }

    fn millisecond(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

fn spawn_driver(recorder: Arc<UnsafeMutex<Recorder>>, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut stream = NullStream::new();
        let period = Duration::from_micros((FRAMES_PER_INTERRUPT * 1_000_000 / SAMPLE_RATE) as u64);
        while running.load(Ordering::Relaxed) {
            for out in stream.outputs.iter_mut() {
                out.fill(0.0);
            }
            recorder.lock().process_stream(&mut stream);
            std::thread::sleep(period);
        }
    })
}

fn parse_command(line: &str) -> Option<Action> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    let rest: Vec<&str> = words.collect();
    let track = rest
        .first()
        .and_then(|w| w.parse::<usize>().ok())
        .unwrap_or(0);
    match command {
        "quit" | "exit" => Some(Action::Quit),
        "reset" => Some(Action::GlobalReset),
        "save" => Some(Action::SaveProject(
            rest.first().unwrap_or(&"ouro-project").to_string(),
        )),
        "load" => Some(Action::LoadProject(
            rest.first().unwrap_or(&"ouro-project").to_string(),
        )),
        "state" => Some(Action::GetState),
        "feedback" => {
            let value = rest.get(1).and_then(|w| w.parse::<u8>().ok()).unwrap_or(127);
            Some(Action::TrackFeedback { track, value })
        }
        "globalmute" => Some(Action::InvokeGlobal {
            function: "GlobalMute".to_string(),
            args: vec![],
        }),
        "solo" => Some(Action::InvokeGlobal {
            function: "Solo".to_string(),
            args: vec![EventArg::Int(track as i64)],
        }),
        name => Some(Action::Invoke {
            track,
            function: name.to_string(),
            down: true,
            args: rest
                .iter()
                .skip(1)
                .map(|w| match w.parse::<i64>() {
                    Ok(i) => EventArg::Int(i),
                    Err(_) => EventArg::Str(w.to_string()),
                })
                .collect(),
        }),
    }
}

/// Reads commands on a plain thread; stdin has no async story worth
/// the trouble here.
fn spawn_stdin_commands(tx: Sender<Message>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let Some(action) = parse_command(&line) else {
                continue;
            };
            let quit = matches!(action, Action::Quit);
            if tx.blocking_send(Message::Request(action)).is_err() {
                break;
            }
            if quit {
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() {
    logging::init();

    let (tx, engine_handle, recorder) = ouro_engine::init_with_recorder();

    let (client_tx, mut client_rx) = channel::<Message>(32);
    if tx.send(Message::Channel(client_tx)).await.is_err() {
        error!("engine refused the client channel");
        return;
    }

    if let Some(path) = std::env::args().nth(1) {
        let _ = tx.send(Message::Request(Action::LoadProject(path))).await;
    }

    let running = Arc::new(AtomicBool::new(true));
    let driver = spawn_driver(recorder, running.clone());

    let printer = tokio::spawn(async move {
        while let Some(message) = client_rx.recv().await {
            match message {
                Message::Response(Err(e)) => error!("engine: {e}"),
                Message::State(state) => {
                    for t in state.tracks {
                        info!(
                            "track {}: {} frame {}/{} layers {} {}",
                            t.number + 1,
                            t.mode.name(),
                            t.frame,
                            t.frames,
                            t.layer_count,
                            if t.mute { "muted" } else { "" }
                        );
                    }
                }
                Message::ProjectSaved(Ok(path)) => info!("saved {path}"),
                Message::ProjectSaved(Err(e)) => error!("save failed: {e}"),
                Message::ProjectLoaded(Ok(path)) => info!("loaded {path}"),
                Message::ProjectLoaded(Err(e)) => error!("load failed: {e}"),
                Message::EngineStalled => error!("audio interrupt stalled"),
                _ => {}
            }
        }
    });

    info!("ouro ready; commands: Record, Overdub, Multiply, Divide, Insert, Mute, Shuffle, Undo, state, save, load, quit");
    let stdin_thread = spawn_stdin_commands(tx.clone());

    // the engine task ends when a quit request comes through
    let _ = engine_handle.await;
    running.store(false, Ordering::Relaxed);
    let _ = driver.join();
    printer.abort();
    drop(stdin_thread);
}
