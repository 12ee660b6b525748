//! Loop windowing: rebuild the play layer so its content is a
//! contiguous sub-range of the entire recorded history.
//!
//! Windowing happens on a dedicated layer spliced between the record
//! layer and the history; it is recognizable by its window offset and
//! is the only layer windowing mutates. Like undo, any pending record
//! changes are discarded.

use tracing::{debug, info, warn};

use crate::config::WindowUnit;
use crate::event::EventArg;
use crate::functions::FunctionKind;
use crate::layer::{LayerId, Segment};
use crate::loops::{Loop, LoopServices};

/// How an edge overflow is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverflowStyle {
    /// Shrink the window against the hit edge (edge resize).
    Truncate,
    /// Shift the window back into range (slide, the default).
    Push,
    /// Cancel the whole move. Not wired to a function yet; scripts
    /// could expose it as a style argument.
    #[allow(dead_code)]
    Ignore,
}

struct WindowState {
    offset: i64,
    frames: i64,
    style: OverflowStyle,
    new_frame: i64,
    continuity: bool,
    ignore: bool,
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    let Some(play) = lp.play_layer else {
        debug!("window with no loop");
        return;
    };
    let (edge, start, direction) = match event.function.and_then(|f| s.functions.get(f)).map(|f| f.kind) {
        Some(FunctionKind::Window { edge, start, direction }) => (edge, start, direction),
        _ => return,
    };

    let (window_offset, history_offset, frames) = match s.layers.get(play) {
        Some(l) => (l.window_offset, l.history_offset, l.frames()),
        None => return,
    };
    let mut state = WindowState {
        offset: window_offset.unwrap_or(history_offset),
        frames,
        style: OverflowStyle::Push,
        new_frame: 0,
        continuity: false,
        ignore: false,
    };

    if edge {
        state.style = OverflowStyle::Truncate;
        resize_window(lp, s, event, &mut state, start, direction);
    } else {
        move_window(lp, s, event, &mut state, direction);
    }

    constrain_window(lp, s, &mut state);
    if state.ignore {
        return;
    }
    let Some(segments) = build_segments(lp, s, &state) else {
        return;
    };
    install_segments(lp, s, &mut state, segments, edge);
    lp.check_mute_cancel(s, event.function);
    info!(
        loop_number = lp.number(),
        offset = state.offset,
        frames = state.frames,
        "window"
    );
}

fn slide_argument(event: &crate::event::Event) -> (Option<WindowUnit>, Option<i64>) {
    let mut unit = None;
    let mut amount = None;
    for arg in &event.arguments {
        match arg {
            EventArg::Str(text) => {
                unit = match text.to_ascii_lowercase().as_str() {
                    "loop" => Some(WindowUnit::Loop),
                    "cycle" => Some(WindowUnit::Cycle),
                    "subcycle" => Some(WindowUnit::Subcycle),
                    "msec" => Some(WindowUnit::Msec),
                    "frame" => Some(WindowUnit::Frame),
                    "start" => Some(WindowUnit::Start),
                    "end" => Some(WindowUnit::End),
                    _ => {
                        warn!(unit = %text, "invalid window unit");
                        unit
                    }
                };
            }
            other => {
                if let Some(i) = other.as_int() {
                    amount = Some(i);
                }
            }
        }
    }
    (unit, amount)
}

fn unit_frames(lp: &Loop, s: &LoopServices, unit: WindowUnit) -> i64 {
    match unit {
        WindowUnit::Loop => lp.loop_frames(s.layers),
        WindowUnit::Cycle => lp.cycle_frames(s.layers),
        WindowUnit::Subcycle => {
            // window resizing changes the subcycle too, so the window
            // layer remembers the size it started with
            let remembered = lp
                .play_layer
                .and_then(|id| s.layers.get(id))
                .filter(|l| l.is_windowing())
                .map(|l| l.window_subcycle_frames)
                .filter(|f| *f > 0);
            remembered.unwrap_or_else(|| lp.subcycle_frames(s.layers, s.config.preset.subcycles))
        }
        WindowUnit::Msec => s.config.sample_rate as i64 / 1000,
        WindowUnit::Frame => 1,
        WindowUnit::Start | WindowUnit::End => 0,
    }
}

fn move_window(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event, state: &mut WindowState, direction: i32) {
    let preset = &s.config.preset;
    let (arg_unit, arg_amount) = slide_argument(event);
    let unit = arg_unit.unwrap_or(preset.window_slide_unit);
    let mut amount = arg_amount.unwrap_or(preset.window_slide_amount.max(1) as i64);
    if amount == 0 {
        amount = 1;
    }

    match unit {
        WindowUnit::Start => state.offset = 0,
        WindowUnit::End => {
            state.offset = lp.history_frames(s.layers) - state.frames;
        }
        _ => {
            let frames_per_unit = unit_frames(lp, s, unit);
            let slide = amount.abs() * frames_per_unit;
            let forward = if direction == 0 { amount >= 0 } else { direction > 0 };
            if forward {
                state.offset += slide;
            } else {
                state.offset -= slide;
            }
        }
    }
}

fn resize_window(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event, state: &mut WindowState, start: bool, direction: i32) {
    let preset = &s.config.preset;
    let (arg_unit, arg_amount) = slide_argument(event);
    let unit = arg_unit.unwrap_or(preset.window_edge_unit);
    if matches!(unit, WindowUnit::Start | WindowUnit::End | WindowUnit::Loop) {
        warn!("invalid window resize unit");
        return;
    }
    let mut amount = arg_amount.unwrap_or(preset.window_edge_amount.max(1) as i64);
    if amount == 0 {
        return;
    }
    let mut start = start;
    // WindowResize takes the edge from an argument
    if direction == 0 {
        if let Some(EventArg::Str(text)) = event.arguments.first() {
            if text.eq_ignore_ascii_case("start") {
                start = true;
            } else if !text.eq_ignore_ascii_case("end") {
                warn!("window resize with invalid edge");
                return;
            }
        }
    }
    let forward = if direction == 0 { amount > 0 } else { direction > 0 };
    amount = amount.abs();
    let resize = amount * unit_frames(lp, s, unit);

    if start {
        if forward {
            state.offset += resize;
            state.frames -= resize;
        } else {
            state.offset -= resize;
            state.frames += resize;
        }
    } else if forward {
        state.frames += resize;
    } else {
        state.frames -= resize;
    }
}

fn constrain_window(lp: &mut Loop, s: &mut LoopServices, state: &mut WindowState) {
    let history_frames = lp.history_frames(s.layers);
    if history_frames <= 0 {
        state.ignore = true;
        return;
    }
    debug!(
        offset = state.offset,
        frames = state.frames,
        history_frames,
        "constraining window"
    );

    if state.offset < 0 {
        match state.style {
            OverflowStyle::Ignore => {
                state.ignore = true;
                return;
            }
            OverflowStyle::Truncate => {
                state.frames += state.offset;
                state.offset = 0;
            }
            OverflowStyle::Push => state.offset = 0,
        }
    }

    let max_frame = history_frames - 1;
    let end_frame = state.offset + state.frames - 1;
    if end_frame < state.offset {
        warn!("window with negative length ignored");
        state.ignore = true;
        return;
    }
    if end_frame > max_frame {
        match state.style {
            OverflowStyle::Ignore => {
                state.ignore = true;
                return;
            }
            OverflowStyle::Truncate => state.frames -= end_frame - max_frame,
            OverflowStyle::Push => {
                state.offset -= end_frame - max_frame;
                if state.offset < 0 {
                    // window larger than the whole history
                    state.offset = 0;
                }
            }
        }
    }

    if state.frames < s.config.minimum_frames() {
        debug!("window smaller than the minimum size ignored");
        state.ignore = true;
        return;
    }

    // no-op check
    if let Some(play) = lp.play_layer.and_then(|id| s.layers.get(id)) {
        let current_offset = play.window_offset.unwrap_or(play.history_offset);
        if state.frames == play.frames() && state.offset == current_offset {
            debug!("no-op window change ignored");
            state.ignore = true;
        }
    }
}

/// Synthesize one segment per history layer covering the window range.
fn build_segments(lp: &mut Loop, s: &mut LoopServices, state: &WindowState) -> Option<Vec<Segment>> {
    let play = lp.play_layer?;
    let last_layer = {
        let layer = s.layers.get(play)?;
        if layer.is_windowing() { layer.prev? } else { play }
    };

    // find the history layer containing the window offset
    let mut start_layer = Some(last_layer);
    while let Some(id) = start_layer {
        let layer = s.layers.get(id)?;
        if layer.history_offset > state.offset {
            start_layer = layer.prev;
        } else {
            break;
        }
    }
    let Some(start_layer) = start_layer else {
        warn!(offset = state.offset, "no layer contains the window offset");
        return None;
    };

    let mut segments = Vec::new();
    let mut cursor = Some(start_layer);
    let mut ref_offset = state.offset - s.layers.get(start_layer)?.history_offset;
    let mut need = state.frames;
    let mut layer_frame = 0i64;
    while need > 0 {
        let Some(id) = cursor else { break };
        let layer = s.layers.get(id)?;
        let avail = layer.frames() - ref_offset;
        let take = avail.min(need);
        if take <= 0 {
            warn!("invalid window layer take");
            return None;
        }
        let mut seg = Segment::for_layer(id, take);
        seg.offset = layer_frame;
        seg.start_frame = ref_offset;
        segments.push(seg);
        layer_frame += take;
        need -= take;
        if need > 0 {
            cursor = next_layer(s, last_layer, id);
        }
        ref_offset = 0;
    }
    if need > 0 {
        warn!("unable to fill window segments");
        return None;
    }
    Some(segments)
}

/// History only links backward; walk from the newest layer to find the
/// one after `from`.
fn next_layer(s: &LoopServices, newest: LayerId, from: LayerId) -> Option<LayerId> {
    let mut cursor = Some(newest);
    while let Some(id) = cursor {
        let prev = s.layers.get(id)?.prev;
        if prev == Some(from) {
            return Some(id);
        }
        cursor = prev;
    }
    None
}

fn install_segments(lp: &mut Loop, s: &mut LoopServices, state: &mut WindowState, segments: Vec<Segment>, edge: bool) {
    calculate_new_frame(lp, s, state, edge);

    if state.continuity {
        // the same content keeps playing; suppress the fade bump
        s.output.set_layer_shift(true);
    } else if let Some(play) = lp.play_layer {
        s.output.capture_tail(s.layers, play, lp.play_frame, lp.reverse, 1.0);
    }

    // like redo, pending events no longer apply
    s.events.flush();

    let Some(play) = lp.play_layer else { return };
    let window = if s.layers.get(play).map(|l| l.is_windowing()).unwrap_or(false) {
        play
    } else {
        debug!("inserting window layer");
        let window = s.layers.alloc();
        let subcycle = lp.subcycle_frames(s.layers, s.config.preset.subcycles);
        if let Some(layer) = s.layers.get_mut(window) {
            layer.prev = Some(play);
            layer.window_subcycle_frames = subcycle;
        }
        lp.play_layer = Some(window);
        window
    };

    s.layers.reset_segments(window);
    if let Some(layer) = s.layers.get_mut(window) {
        layer.audio.reset();
        layer.window_offset = Some(state.offset);
        layer.resize(state.frames);
        layer.set_cycles(1);
    }
    for seg in segments {
        s.layers.add_segment(window, seg);
    }
    // fades were built from scratch, no consistency pass needed
    s.layers.compile_segment_fades(window, false);
    if let Some(layer) = s.layers.get_mut(window) {
        layer.set_finalized(true);
        layer.set_structure_changed(false);
    }

    // the record layer follows the window
    if let Some(record) = lp.record_layer {
        s.layers.rebase_record(record, window, lp.feedback);
    }

    lp.frame = state.new_frame;
    lp.record_cursor = state.new_frame;
    lp.recalculate_play_frame(s);
    lp.resume_play();
    let cycles = s.layers.get(window).map(|l| l.cycles()).unwrap_or(1);
    s.sync.loop_resize(state.frames, cycles, false);
}

/// After a slide, restart from zero. After an edge resize, keep the
/// relative position when it is still inside the window.
fn calculate_new_frame(lp: &mut Loop, s: &LoopServices, state: &mut WindowState, edge: bool) {
    state.new_frame = 0;
    state.continuity = false;
    let Some(play) = lp.play_layer.and_then(|id| s.layers.get(id)) else {
        return;
    };
    let history_offset = play.window_offset.unwrap_or(play.history_offset);
    let history_frame = history_offset + lp.frame;
    if edge {
        if lp.frame < state.frames && history_frame >= state.offset {
            let left_delta = history_offset - state.offset;
            let new_frame = lp.frame + left_delta;
            if new_frame != lp.frame {
                debug!(from = lp.frame, to = new_frame, "window adjusted loop frame");
            }
            state.new_frame = new_frame;
            state.continuity = true;
        } else {
            debug!("restarting from zero after resize");
        }
    } else {
        debug!("restarting from zero after slide");
    }
}
