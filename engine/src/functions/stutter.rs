//! Stutter: repeat the current cycle, appending each repetition to the
//! record layer, then resume at the cycle after the stuttered one.

use tracing::{debug, info};

use crate::event::{EventId, EventType};
use crate::functions::{self, Function, LoopAction};
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

pub fn schedule(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    if lp.mode == Mode::Stutter {
        if functions::is_sustain(f, s) && action.down {
            return None;
        }
        if let Some(existing) = s.events.find(EventType::StutterEnd) {
            return Some(existing);
        }
        // resume at the end of the cycle currently stuttering
        let cycle = lp.cycle_frames(s.layers).max(1);
        let id = s.events.alloc(EventType::StutterEnd);
        if let Some(e) = s.events.get_mut(id) {
            e.frame = lp.mode_start_frame + cycle;
        }
        s.events.add(id);
        functions::schedule_play_jump(lp, s, id);
        return Some(id);
    }
    if !action.down {
        return None;
    }
    functions::default_schedule(lp, s, f, action)
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    match event.etype {
        EventType::Stutter => begin(lp, s, event),
        EventType::StutterEnd => end(lp, s, event),
        _ => {}
    }
}

fn begin(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        debug!("stutter with no loop");
        return;
    }
    let cycle = lp.cycle_frames(s.layers);
    if cycle <= 0 {
        lp.resume_play();
        return;
    }
    lp.shift(s, false);
    lp.check_mute_cancel(s, event.function);
    // always stutter from the base of the current cycle
    lp.mode_start_frame = (lp.frame / cycle) * cycle;
    lp.mode = Mode::Stutter;
    lp.record_cursor = lp.frame;
    info!(loop_number = lp.number(), base = lp.mode_start_frame, "stutter");
    lp.validate(s);
}

fn end(lp: &mut Loop, s: &mut LoopServices, _event: &crate::event::Event) {
    if lp.mode != Mode::Stutter {
        debug!("stutter end outside stutter");
        return;
    }
    lp.shift(s, false);
    let frames = lp.loop_frames(s.layers);
    let cycles = lp.play_layer.and_then(|id| s.layers.get(id)).map(|l| l.cycles()).unwrap_or(1);
    s.sync.loop_resize(frames, cycles, false);
    // play continues into the cycle after the stuttered one
    let cycle = lp.cycle_frames(s.layers).max(1);
    lp.frame = lp.wrap_frame(lp.mode_start_frame + cycle, frames.max(1));
    lp.record_cursor = lp.frame;
    lp.resume_play();
    lp.recalculate_play_frame(s);
    info!(loop_number = lp.number(), frames, "stutter ended");
    lp.validate(s);
}
