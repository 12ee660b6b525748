//! Multiply: the extending mode that appends source cycles, and the
//! instant whole-loop multiplication.

use tracing::{debug, info, warn};

use crate::event::{EventId, EventType};
use crate::functions::{self, Function, LoopAction};
use crate::layer::Segment;
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

pub fn schedule(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    if lp.mode == Mode::Multiply {
        if functions::is_sustain(f, s) && action.down {
            return None;
        }
        // a second press (or the release of a sustained press) ends the
        // mode, rounded up to the cycle boundary
        return schedule_end(lp, s, false);
    }
    if !action.down {
        return None;
    }
    if lp.record_layer.is_none() {
        debug!("multiply with no loop");
        return None;
    }
    functions::default_schedule(lp, s, f, action)
}

/// Schedule the mode ending. Rounded endings land on the next source
/// cycle boundary; unrounded endings (Record) fire at input latency.
pub fn schedule_end(lp: &mut Loop, s: &mut LoopServices, unrounded: bool) -> Option<EventId> {
    if let Some(existing) = s.events.find(EventType::MultiplyEnd) {
        return Some(existing);
    }
    let cycle = lp.cycle_frames(s.layers).max(1);
    let frame = if unrounded {
        lp.frame + s.input.latency
    } else {
        (lp.frame / cycle + 1) * cycle
    };
    let id = s.events.alloc(EventType::MultiplyEnd);
    if let Some(e) = s.events.get_mut(id) {
        e.frame = frame;
        e.down = !unrounded;
    }
    s.events.add(id);
    functions::schedule_play_jump(lp, s, id);
    debug!(frame, unrounded, "multiply end scheduled");
    Some(id)
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    match event.etype {
        EventType::Multiply => begin(lp, s, event),
        EventType::MultiplyEnd => end(lp, s, event),
        _ => {}
    }
}

fn begin(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        return;
    }
    // work from a clean generation so the multiplied region is exactly
    // one backing segment
    lp.shift(s, false);
    lp.mode = Mode::Multiply;
    lp.mode_start_frame = lp.frame;
    lp.record_cursor = lp.frame;
    lp.check_mute_cancel(s, event.function);
    info!(loop_number = lp.number(), frame = lp.frame, "multiply");
    lp.validate(s);
}

/// `event.down` false marks an unrounded ending.
fn end(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.mode != Mode::Stutter && lp.mode != Mode::Multiply {
        debug!("multiply end outside multiply");
        return;
    }
    let Some(record) = lp.record_layer else {
        return;
    };
    let unrounded = !event.down;
    let total = lp.record_cursor.max(1);
    let cycle = lp.cycle_frames(s.layers).max(1);

    if unrounded {
        // keep everything recorded so far as a single cycle
        s.layers.splice(record, 0, total, 1);
        info!(loop_number = lp.number(), frames = total, "unrounded multiply");
    } else {
        let cycles = (total / cycle).max(1) as u32;
        if total % cycle != 0 {
            warn!(total, cycle, "rounded multiply off the cycle grid");
        }
        if let Some(layer) = s.layers.get_mut(record) {
            layer.resize(total);
            layer.set_cycles(cycles);
            layer.set_structure_changed(true);
        }
        info!(loop_number = lp.number(), cycles, "multiply rounded");
    }

    lp.shift(s, true);
    lp.resume_play();
    let frames = lp.loop_frames(s.layers);
    lp.frame = lp.wrap_frame(lp.frame, frames.max(1));
    lp.record_cursor = lp.frame;
    lp.recalculate_play_frame(s);
    s.sync.loop_resize(frames, s.layers.get(record).map(|l| l.cycles()).unwrap_or(1), false);
    lp.validate(s);
}

pub fn do_instant(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    let multiple = match event
        .function
        .and_then(|f| s.functions.get(f))
        .map(|f| f.kind)
    {
        Some(crate::functions::FunctionKind::InstantMultiply { multiple }) => {
            let base = if multiple == 0 { 2 } else { multiple };
            match event.int_argument() {
                Some(n) if n > 0 => {
                    if multiple == 0 {
                        n as u32
                    } else {
                        multiple * n as u32
                    }
                }
                _ => base,
            }
        }
        _ => 2,
    };
    // keep scripted multiples sane
    if multiple < 2 || multiple > 512 {
        debug!(multiple, "ignoring instant multiply");
        return;
    }
    lp.shift(s, false);
    let (Some(record), Some(play)) = (lp.record_layer, lp.play_layer) else {
        return;
    };
    let (play_frames, play_cycles) = match s.layers.get(play) {
        Some(l) => (l.frames(), l.cycles()),
        None => return,
    };
    if play_frames <= 0 {
        return;
    }
    for i in 1..multiple {
        let mut seg = Segment::for_layer(play, play_frames);
        seg.offset = i as i64 * play_frames;
        s.layers.add_segment(record, seg);
    }
    if let Some(layer) = s.layers.get_mut(record) {
        layer.resize(play_frames * multiple as i64);
        layer.set_cycles(play_cycles * multiple);
        layer.set_structure_changed(true);
    }
    s.layers.compile_segment_fades(record, false);
    lp.shift(s, true);
    lp.check_mute_cancel(s, event.function);
    lp.resume_play();
    let cycles = s.layers.get(lp.record_layer.unwrap_or(record)).map(|l| l.cycles()).unwrap_or(1);
    s.sync.loop_resize(play_frames * multiple as i64, cycles, false);
    info!(loop_number = lp.number(), multiple, "instant multiply");
    lp.validate(s);
}
