//! Record, RecordStop and Overdub handlers.
//!
//! Record in an empty loop begins a new recording at the input-latency
//! frame (or waits for a sync pulse when following an external clock).
//! Record again schedules the stop, rounded to whole pulse units when
//! synchronized. The finished recording becomes a new generation whose
//! `prev` is whatever played before, so a re-record is undoable.

use tracing::{debug, info};

use crate::config::SyncSource;
use crate::event::{EventId, EventType};
use crate::functions::{self, Function, LoopAction};
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

fn track_synced(lp: &Loop, s: &LoopServices) -> bool {
    let source = s
        .config
        .setup
        .tracks
        .get(lp.number())
        .map(|t| t.sync_source)
        .unwrap_or(SyncSource::None);
    source == SyncSource::Midi && s.sync.receiving_clocks()
}

pub fn schedule(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    match lp.mode {
        Mode::Record | Mode::Threshold | Mode::Synchronize => {
            if !action.down {
                return None;
            }
            // already recording: this press schedules the stop
            if let Some(existing) = s.events.find(EventType::RecordStop) {
                return Some(existing);
            }
            let synced = track_synced(lp, s);
            let id = s.events.alloc(EventType::RecordStop);
            let frame = if synced {
                lp.frame
            } else {
                lp.frame + s.input.latency
            };
            if let Some(e) = s.events.get_mut(id) {
                e.function = Some(f.id);
                e.frame = frame;
                e.pending = synced;
            }
            s.events.add(id);
            functions::schedule_play_jump(lp, s, id);
            debug!(frame, synced, "record stop scheduled");
            Some(id)
        }
        // Record is the unrounded ending for the extending modes
        Mode::Multiply => super::multiply::schedule_end(lp, s, true),
        Mode::Insert => super::insert::schedule_end(lp, s, true),
        _ => {
            if !action.down {
                return None;
            }
            let synced = track_synced(lp, s);
            let id = s.events.alloc(EventType::Record);
            if let Some(e) = s.events.get_mut(id) {
                e.function = Some(f.id);
                e.frame = lp.frame + s.input.latency;
                e.pending = synced;
            }
            s.events.add(id);
            if synced {
                lp.mode = Mode::Synchronize;
                info!(loop_number = lp.number(), "record waiting for sync pulse");
            }
            Some(id)
        }
    }
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    match event.etype {
        EventType::Record => start_recording(lp, s),
        EventType::RecordStop => finish_recording(lp, s, event.frame),
        _ => {}
    }
}

fn start_recording(lp: &mut Loop, s: &mut LoopServices) {
    // the old loop, if any, stays in history beneath the new recording
    let old_play = lp.play_layer.take();
    if let Some(record) = lp.record_layer.take() {
        s.layers.free(record);
    }
    let fresh = s.layers.alloc();
    let history = old_play
        .and_then(|id| s.layers.get(id))
        .map(|l| l.history_offset + l.frames())
        .unwrap_or(0);
    if let Some(layer) = s.layers.get_mut(fresh) {
        layer.prev = old_play;
        layer.history_offset = history;
        layer.isolated_overdub = s.config.isolate_overdubs;
    }
    lp.record_layer = Some(fresh);
    lp.frame = 0;
    lp.record_cursor = 0;
    lp.play_frame = 0;
    lp.mode = Mode::Record;
    lp.overdub = false;
    lp.mute = false;
    lp.mute_mode = false;
    s.output.drop_tail();
    info!(loop_number = lp.number(), "recording started");
}

fn finish_recording(lp: &mut Loop, s: &mut LoopServices, stop_frame: i64) {
    let Some(record) = lp.record_layer else {
        return;
    };
    let synced = track_synced(lp, s);
    let mut frames = stop_frame.max(lp.frame);
    if synced {
        frames = s.sync.round_recorded_frames(frames, s.config.preset.sync_unit);
    }
    if frames <= 0 {
        debug!("empty recording discarded");
        lp.reset(s);
        return;
    }
    if let Some(layer) = s.layers.get_mut(record) {
        layer.resize(frames);
        layer.set_cycles(1);
        layer.set_finalized(true);
    }
    lp.play_layer = Some(record);
    let fresh = s.layers.alloc();
    s.layers.rebase_record(fresh, record, lp.feedback);
    if let Some(layer) = s.layers.get_mut(fresh) {
        layer.isolated_overdub = s.config.isolate_overdubs;
    }
    lp.record_layer = Some(fresh);
    lp.frame = lp.wrap_frame(lp.frame, frames);
    lp.record_cursor = lp.frame;
    lp.mode = Mode::Play;
    lp.recalculate_play_frame(s);
    s.output.set_layer_shift(true);

    let master = s.config.setup.sync_master == Some(lp.number());
    if master {
        s.sync.loop_resize(frames, 1, true);
    }
    info!(loop_number = lp.number(), frames, "recording finished");
    lp.validate(s);
}

/// Overdub toggles the minor mode; entry and exit edges are deferred
/// and committed at the loop point if the seam turns out discontinuous.
pub fn do_overdub(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        debug!("overdub with no loop");
        return;
    }
    lp.overdub = !lp.overdub;
    if lp.overdub {
        if lp.mode == Mode::Play {
            lp.mode = Mode::Overdub;
        }
        lp.check_mute_cancel(s, event.function);
    } else if lp.mode == Mode::Overdub {
        lp.resume_play();
    }
    debug!(loop_number = lp.number(), overdub = lp.overdub, "overdub toggled");
    lp.validate(s);
}
