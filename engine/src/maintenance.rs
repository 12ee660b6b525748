//! The maintenance task: pool refills, deferred file I/O, and the
//! stuck-interrupt watchdog. Everything here may touch the heap and
//! the disk; nothing here runs on the audio thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::message::Message;
use crate::mutex::UnsafeMutex;
use crate::project;
use crate::recorder::Recorder;

/// Wake interval when nothing signals earlier.
const TICK: Duration = Duration::from_millis(100);

/// Ticks the interrupt counter may stall mid-interrupt before the
/// engine is declared stuck.
const STUCK_TICKS: u32 = 20;

/// Work queued by the engine task for execution off the audio thread.
#[derive(Debug)]
pub enum Job {
    SaveProject(PathBuf),
    LoadProject(PathBuf),
    /// Deliver a prompt back to the engine clients once pending work
    /// has drained.
    Prompt(String),
    Quit,
}

pub fn spawn(
    recorder: Arc<UnsafeMutex<Recorder>>,
    mut jobs: Receiver<Job>,
    tx: Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (audio_pool, notify, counter) = {
            let r = recorder.lock();
            (r.audio_pool.clone(), r.audio_pool.notifier(), r.interrupt_counter())
        };
        let mut last_count = counter.load(Ordering::Relaxed);
        let mut stalled_ticks = 0u32;

        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(TICK) => {}
                job = jobs.recv() => {
                    match job {
                        Some(Job::Quit) | None => {
                            debug!("maintenance task stopping");
                            return;
                        }
                        Some(job) => run_job(&recorder, &tx, job).await,
                    }
                }
            }

            // keep the interrupt's allocation ring full
            audio_pool.maintain();

            // stuck-interrupt watchdog: the counter must move while a
            // callback claims to be inside the interrupt
            let count = counter.load(Ordering::Relaxed);
            let inside = recorder.lock().in_interrupt();
            if inside && count == last_count {
                stalled_ticks += 1;
                if stalled_ticks >= STUCK_TICKS {
                    error!("interrupt stalled for {STUCK_TICKS} maintenance ticks");
                    recorder.lock().emergency_exit();
                    let _ = tx.send(Message::EngineStalled).await;
                    stalled_ticks = 0;
                }
            } else {
                stalled_ticks = 0;
            }
            last_count = count;
        }
    })
}

async fn run_job(recorder: &Arc<UnsafeMutex<Recorder>>, tx: &Sender<Message>, job: Job) {
    match job {
        Job::SaveProject(path) => {
            let result = project::save(recorder.lock(), &path);
            match &result {
                Ok(()) => info!(path = %path.display(), "deferred save complete"),
                Err(e) => error!("deferred save failed: {e}"),
            }
            let _ = tx
                .send(Message::ProjectSaved(result.map(|_| path.display().to_string())))
                .await;
        }
        Job::LoadProject(path) => {
            let result = project::load(recorder.lock(), &path);
            match &result {
                Ok(()) => info!(path = %path.display(), "deferred load complete"),
                Err(e) => error!("deferred load failed: {e}"),
            }
            let _ = tx
                .send(Message::ProjectLoaded(result.map(|_| path.display().to_string())))
                .await;
        }
        Job::Prompt(text) => {
            let _ = tx.send(Message::Prompt(text)).await;
        }
        Job::Quit => {}
    }
}
