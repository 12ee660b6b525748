//! Insert: open a gap in the loop and record into it; also the Replace
//! handler, which records over the background instead of alongside it.

use tracing::{debug, info};

use crate::event::{EventId, EventType};
use crate::functions::{self, Function, FunctionKind, LoopAction};
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

pub fn schedule(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    match lp.mode {
        Mode::Record => {
            // Insert is an alternate ending for recording; the stop
            // event carries the behavior
            if action.down { s.events.find(EventType::RecordStop) } else { None }
        }
        Mode::Insert => {
            let sustained = functions::is_sustain(f, s);
            if sustained && action.down {
                return None;
            }
            let unrounded = matches!(f.kind, FunctionKind::Insert { unrounded: true, .. });
            schedule_end(lp, s, unrounded)
        }
        _ => {
            if !action.down {
                return None;
            }
            let id = functions::default_schedule(lp, s, f, action)?;
            // output mutes at the insert point
            if !lp.mute_mode {
                functions::schedule_play_jump(lp, s, id);
            }
            Some(id)
        }
    }
}

/// Rounded endings wait for the end of the inserted cycle; unrounded
/// endings truncate at input latency.
pub fn schedule_end(lp: &mut Loop, s: &mut LoopServices, unrounded: bool) -> Option<EventId> {
    if let Some(existing) = s.events.find(EventType::InsertEnd) {
        return Some(existing);
    }
    let frame = if unrounded {
        lp.frame + s.input.latency
    } else {
        lp.record_layer
            .and_then(|id| s.layers.get(id))
            .map(|l| l.insert_end())
            .unwrap_or(lp.frame)
    };
    let id = s.events.alloc(EventType::InsertEnd);
    if let Some(e) = s.events.get_mut(id) {
        e.frame = frame;
        e.down = !unrounded;
    }
    s.events.add(id);
    functions::schedule_play_jump(lp, s, id);
    debug!(frame, unrounded, "insert end scheduled");
    Some(id)
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    match event.etype {
        EventType::Insert => begin(lp, s, event),
        EventType::InsertEnd => end(lp, s, event),
        _ => {}
    }
}

fn begin(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        debug!("insert with no loop");
        return;
    }
    // clean generation first: the gap is then pure segment surgery
    lp.shift(s, false);
    let Some(record) = lp.record_layer else {
        return;
    };
    let cycle = lp.cycle_frames(s.layers).max(1);
    s.layers.start_insert(record, lp.frame, cycle);
    lp.mode = Mode::Insert;
    lp.mode_start_frame = lp.frame;
    lp.record_cursor = lp.frame;
    lp.check_mute_cancel(s, event.function);
    info!(loop_number = lp.number(), frame = lp.frame, "insert");
    lp.validate(s);
}

fn end(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.mode != Mode::Insert {
        debug!("insert end outside insert");
        return;
    }
    let Some(record) = lp.record_layer else {
        return;
    };
    let unrounded = !event.down;
    s.layers.end_insert(record, lp.frame, unrounded);
    lp.shift(s, true);
    lp.resume_play();
    let frames = lp.loop_frames(s.layers);
    lp.frame = lp.wrap_frame(lp.frame, frames.max(1));
    lp.record_cursor = lp.frame;
    lp.recalculate_play_frame(s);
    let cycles = lp.play_layer.and_then(|id| s.layers.get(id)).map(|l| l.cycles()).unwrap_or(1);
    s.sync.loop_resize(frames, cycles, false);
    info!(loop_number = lp.number(), frames, unrounded, "insert ended");
    lp.validate(s);
}

/// Replace is scheduled like a mode toggle; the jump silences the old
/// content at the audible instant it stops being part of the loop.
pub fn schedule_replace(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    if !action.down && !functions::is_sustain(f, s) {
        return None;
    }
    let id = functions::default_schedule(lp, s, f, action)?;
    functions::schedule_play_jump(lp, s, id);
    Some(id)
}

/// Replace toggles a mode that occludes the background while the input
/// records in its place.
pub fn do_replace(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        debug!("replace with no loop");
        return;
    }
    if lp.mode == Mode::Replace {
        lp.resume_play();
        info!(loop_number = lp.number(), "replace ended");
    } else {
        lp.shift(s, false);
        lp.mode = Mode::Replace;
        lp.mode_start_frame = lp.frame;
        lp.record_cursor = lp.frame;
        lp.check_mute_cancel(s, event.function);
        info!(loop_number = lp.number(), frame = lp.frame, "replace");
    }
    lp.validate(s);
}
