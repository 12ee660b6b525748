//! Project persistence: each history layer rendered to a WAV file plus
//! a JSON manifest describing the layer graph. Only the maintenance
//! task touches the disk; the interrupt never does.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::{Audio, CHANNELS, MAX_INTERRUPT_FRAMES};
use crate::config::EngineConfig;
use crate::layer::{Checkpoint, LayerContext, LayerId, LayerPool};
use crate::recorder::Recorder;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerManifest {
    pub file: String,
    pub frames: i64,
    pub cycles: u32,
    pub checkpoint: Checkpoint,
    pub history_offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackManifest {
    pub name: String,
    pub feedback: u8,
    pub level: f32,
    pub pan: f32,
    /// Newest first; the first entry is the play layer.
    pub layers: Vec<LayerManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub config: EngineConfig,
    pub tracks: Vec<TrackManifest>,
}

/// Flatten one layer's audible content into a standalone Audio.
fn render_layer(layers: &LayerPool, id: LayerId) -> Audio {
    let mut audio = Audio::new(layers.audio_pool());
    let Some(layer) = layers.get(id) else {
        return audio;
    };
    let frames = layer.frames().max(0);
    let mut buffer = [0.0f32; MAX_INTERRUPT_FRAMES * CHANNELS];
    let mut at = 0i64;
    while at < frames {
        let chunk = ((frames - at) as usize).min(MAX_INTERRUPT_FRAMES);
        let samples = chunk * CHANNELS;
        buffer[..samples].fill(0.0);
        let mut ctx = LayerContext::new(&mut buffer[..samples], chunk);
        layers.get_no_reflect(id, &mut ctx, at, false, false);
        audio.put(&buffer[..samples], chunk, at);
        at += chunk as i64;
    }
    audio.set_frames(frames);
    audio
}

/// Write the whole engine state under `root`. Layer audio is flattened,
/// so loading reproduces the sound and the history shape, not the
/// segment sharing.
pub fn save(recorder: &Recorder, root: &Path) -> Result<(), String> {
    fs::create_dir_all(root).map_err(|e| format!("failed to create {}: {e}", root.display()))?;
    let audio_dir = root.join("audio");
    fs::create_dir_all(&audio_dir).map_err(|e| format!("failed to create {}: {e}", audio_dir.display()))?;

    let config = recorder.config();
    let mut manifest = ProjectManifest {
        config: (*config).clone(),
        tracks: Vec::new(),
    };

    for track in recorder.tracks() {
        let mut layers_out = Vec::new();
        let mut cursor = track.lp.play_layer;
        let mut index = 0usize;
        while let Some(id) = cursor {
            let Some(layer) = recorder.layers.get(id) else { break };
            if layer.is_windowing() {
                // windows are a view, not content
                cursor = layer.prev;
                continue;
            }
            let file = format!("track{}_layer{}.wav", track.number() + 1, index);
            let audio = render_layer(&recorder.layers, id);
            audio.write(&audio_dir.join(&file), config.write_format)?;
            layers_out.push(LayerManifest {
                file: format!("audio/{file}"),
                frames: layer.frames(),
                cycles: layer.cycles(),
                checkpoint: layer.checkpoint,
                history_offset: layer.history_offset,
            });
            cursor = layer.prev;
            index += 1;
        }
        manifest.tracks.push(TrackManifest {
            name: track.name(),
            feedback: track.lp.feedback,
            level: track.level(),
            pan: track.pan(),
            layers: layers_out,
        });
    }

    let json = serde_json::to_string_pretty(&manifest).map_err(|e| format!("manifest encoding failed: {e}"))?;
    let manifest_path = root.join("project.json");
    fs::write(&manifest_path, json).map_err(|e| format!("failed to write {}: {e}", manifest_path.display()))?;
    info!(path = %root.display(), "project saved");
    Ok(())
}

/// Load a project saved by [`save`], rebuilding each track's layer
/// chain.
pub fn load(recorder: &mut Recorder, root: &Path) -> Result<(), String> {
    let manifest_path = root.join("project.json");
    let json = fs::read_to_string(&manifest_path)
        .map_err(|e| format!("failed to read {}: {e}", manifest_path.display()))?;
    let manifest: ProjectManifest =
        serde_json::from_str(&json).map_err(|e| format!("manifest decoding failed: {e}"))?;

    recorder.global_reset();
    recorder.set_config(std::sync::Arc::new(manifest.config.clone()));

    for (i, track_manifest) in manifest.tracks.iter().enumerate() {
        if recorder.track(i).is_none() {
            recorder.add_track(track_manifest.name.clone());
        }
        // build oldest first so prev links point backward
        let mut prev: Option<LayerId> = None;
        for layer_manifest in track_manifest.layers.iter().rev() {
            let path: PathBuf = root.join(&layer_manifest.file);
            let id = recorder.layers.alloc();
            let Some(layer) = recorder.layers.get_mut(id) else { continue };
            if let Err(e) = layer.audio.read(&path) {
                warn!(file = %path.display(), "skipping unreadable layer: {e}");
                recorder.layers.free(id);
                continue;
            }
            layer.resize(layer_manifest.frames);
            layer.set_cycles(layer_manifest.cycles);
            layer.checkpoint = layer_manifest.checkpoint;
            layer.history_offset = layer_manifest.history_offset;
            layer.prev = prev;
            layer.set_finalized(true);
            prev = Some(id);
        }
        let Some(track) = recorder.track_mut(i) else { continue };
        track.set_level(track_manifest.level);
        track.set_pan(track_manifest.pan);
        track.lp.play_layer = prev;
        track.lp.feedback = track_manifest.feedback;
        if let Some(play) = prev {
            let record = recorder.layers.alloc();
            recorder.layers.rebase_record(record, play, track_manifest.feedback);
            recorder.track_mut(i).map(|t| {
                t.lp.record_layer = Some(record);
                t.lp.mode = crate::mode::Mode::Play;
                t.lp.frame = 0;
                t.lp.record_cursor = 0;
            });
        }
    }
    info!(path = %root.display(), "project loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::LoopAction;
    use crate::recorder::tests_support::{drive, silent_stream};
    use std::sync::Arc;

    #[test]
    fn project_round_trip_preserves_history() {
        let config = Arc::new(EngineConfig::default());
        let queue = Arc::new(crate::sync::MidiQueue::new());
        let sync = crate::sync::Synchronizer::new(queue.clone(), 44_100);
        let mut recorder = Recorder::new(config.clone(), sync);

        // record a loop of a constant tone, then overdub once
        let record = recorder.functions.by_name("Record").unwrap().id;
        let overdub = recorder.functions.by_name("Overdub").unwrap().id;
        let track_queue = recorder.track(0).unwrap().action_queue();
        track_queue.push(LoopAction::press(record));
        let mut stream = silent_stream(256, 0.25);
        drive(&mut recorder, &mut stream, 4);
        track_queue.push(LoopAction::press(record));
        drive(&mut recorder, &mut stream, 8);
        track_queue.push(LoopAction::press(overdub));
        drive(&mut recorder, &mut stream, 8);
        track_queue.push(LoopAction::press(overdub));
        drive(&mut recorder, &mut stream, 16);

        let chain_before = {
            let mut count = 0;
            let mut cursor = recorder.track(0).unwrap().lp.play_layer;
            while let Some(id) = cursor {
                count += 1;
                cursor = recorder.layers.get(id).and_then(|l| l.prev);
            }
            count
        };
        assert!(chain_before >= 2);
        let frames_before = recorder
            .layers
            .get(recorder.track(0).unwrap().lp.play_layer.unwrap())
            .unwrap()
            .frames();

        let root = std::env::temp_dir().join("ouro_project_roundtrip");
        let _ = std::fs::remove_dir_all(&root);
        save(&recorder, &root).unwrap();

        let sync2 = crate::sync::Synchronizer::new(queue, 44_100);
        let mut loaded = Recorder::new(config, sync2);
        load(&mut loaded, &root).unwrap();

        let mut chain_after = 0;
        let mut cursor = loaded.track(0).unwrap().lp.play_layer;
        while let Some(id) = cursor {
            chain_after += 1;
            cursor = loaded.layers.get(id).and_then(|l| l.prev);
        }
        assert_eq!(chain_after, chain_before);
        let play = loaded.track(0).unwrap().lp.play_layer.unwrap();
        assert_eq!(loaded.layers.get(play).unwrap().frames(), frames_before);
        assert_eq!(loaded.layers.get(play).unwrap().cycles(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }
}
