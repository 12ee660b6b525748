pub mod audio;
pub mod config;
mod engine;
pub mod event;
pub mod functions;
pub mod layer;
pub mod loops;
pub mod maintenance;
pub mod message;
pub mod mode;
pub mod mutex;
pub mod pool;
pub mod project;
pub mod recorder;
pub mod state;
pub mod stream;
pub mod sync;
pub mod track;

use std::sync::Arc;

use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;

use mutex::UnsafeMutex;
use recorder::Recorder;

pub fn init() -> (Sender<message::Message>, JoinHandle<()>) {
    let (tx, handle, _recorder) = init_with_recorder();
    (tx, handle)
}

/// Start the engine and also hand back the recorder so a device layer
/// can drive the audio interrupt.
pub fn init_with_recorder() -> (
    Sender<message::Message>,
    JoinHandle<()>,
    Arc<UnsafeMutex<Recorder>>,
) {
    let (tx, rx) = channel::<message::Message>(32);
    let mut engine = engine::Engine::new(rx, tx.clone());
    let recorder = engine.recorder();
    let handle = tokio::spawn(async move {
        engine.init().await;
        engine.work().await;
    });
    (tx, handle, recorder)
}
