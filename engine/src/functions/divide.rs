//! Instant divide: keep the division the cursor is in, drop the rest.

use tracing::{debug, info, warn};

use crate::functions::FunctionKind;
use crate::loops::{Loop, LoopServices};

/// Prevent runaway multiples from scripts.
const MAX_MULTIPLE: i64 = 512;

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    let base = match event.function.and_then(|f| s.functions.get(f)).map(|f| f.kind) {
        Some(FunctionKind::Divide { multiple }) => multiple as i64,
        _ => 0,
    };
    let mut multiple = if base == 0 { 2 } else { base };
    if let Some(arg) = event.int_argument() {
        if arg > 0 {
            multiple = if base == 0 { arg } else { base * arg };
        }
    }
    if multiple > MAX_MULTIPLE {
        multiple = 0;
    }
    if multiple <= 1 {
        debug!(multiple, "ignoring divide");
        return;
    }

    // shift immediately so there is only one backing segment
    lp.shift(s, false);
    let Some(record) = lp.record_layer else {
        return;
    };
    let min_frames = s.input.latency.max(s.output.latency);
    let new_frame = divide(s, record, multiple, lp.frame, min_frames);
    lp.frame = new_frame;
    lp.record_cursor = new_frame;
    lp.recalculate_play_frame(s);

    let frames = lp.loop_frames(s.layers);
    let cycles = s.layers.get(record).map(|l| l.cycles()).unwrap_or(1);
    s.sync.loop_resize(frames, cycles, false);

    // and again so the divide can be undone right away
    lp.shift(s, true);
    lp.check_mute_cancel(s, event.function);
    lp.resume_play();
    info!(loop_number = lp.number(), multiple, cycles, "divide");
    lp.validate(s);
}

/// Trim off a multiple of the loop, returning where `start_frame` lands
/// afterwards. The division containing the cursor is preserved; cycle
/// count is kept when it divides evenly, else the layer restructures to
/// one cycle.
fn divide(s: &mut LoopServices, record: crate::layer::LayerId, multiples: i64, start_frame: i64, min_frames: i64) -> i64 {
    let Some(layer) = s.layers.get(record) else {
        return start_frame;
    };
    if layer.segments().is_empty() {
        warn!("divide with no backing layer");
        return start_frame;
    }
    if layer.segments().len() > 1 {
        warn!("divide with more than one segment");
        return start_frame;
    }
    let frames = layer.segments()[0].frames;
    let cur_cycles = layer.cycles() as i64;
    if frames <= multiples {
        warn!(multiples, frames, "divisor larger than layer");
        return start_frame;
    }
    if start_frame >= frames {
        warn!(start_frame, frames, "divide cursor out of range");
        return start_frame;
    }
    // the divided size may round down; a few frames can be lost
    let seg_frames = frames / multiples;
    if seg_frames < min_frames {
        warn!(seg_frames, "ignoring divide, resulting loop too small");
        return start_frame;
    }

    let seg_number = start_frame / seg_frames;
    let mut seg_offset = seg_number * seg_frames;
    let seg_max = seg_offset + seg_frames;
    if seg_max > frames {
        // cursor in the rounded-off zone at the end; work backward
        seg_offset = (start_frame - seg_frames + 1).max(0);
    }

    let new_cycles = cur_cycles / multiples;
    let cycles = if new_cycles * multiples == cur_cycles && new_cycles > 0 {
        new_cycles
    } else {
        debug!(cur_cycles, "restructuring divided layer to one cycle");
        1
    };

    s.layers.splice(record, seg_offset, seg_frames, cycles as u32);
    debug!(seg_offset, seg_frames, "divide spliced");

    let landed = start_frame - seg_offset;
    if landed < 0 || landed >= seg_frames {
        warn!("divide cursor calculation error");
        return 0;
    }
    landed
}
