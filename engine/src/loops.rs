//! The loop: per-track record/play state and the per-interrupt advance.
//!
//! One loop owns a record layer (receiving input) and a play layer (its
//! `prev`, feeding output). The advance walks the interrupt buffer in
//! chunks bounded by the next scheduled event and the next structural
//! boundary, firing events in frame order between chunks. All structural
//! mutation happens here or in the function handlers it calls.

use tracing::{debug, info, trace, warn};

use crate::audio::CHANNELS;
use crate::config::EngineConfig;
use crate::event::{EventId, EventType};
use crate::functions::{self, Functions};
use crate::layer::{LayerContext, LayerId, LayerPool};
use crate::mode::Mode;
use crate::stream::{InputStream, OutputStream};
use crate::sync::Synchronizer;

/// Everything a loop needs besides itself during an interrupt.
pub struct LoopServices<'a> {
    pub layers: &'a mut LayerPool,
    pub events: &'a mut crate::event::EventManager,
    pub sync: &'a mut Synchronizer,
    pub config: &'a EngineConfig,
    pub functions: &'a Functions,
    pub input: &'a mut InputStream,
    pub output: &'a mut OutputStream,
}

pub struct Loop {
    number: usize,
    pub record_layer: Option<LayerId>,
    pub play_layer: Option<LayerId>,
    pub redo_layer: Option<LayerId>,
    /// Record cursor within the loop timeline.
    pub frame: i64,
    /// Output cursor, roughly `frame + input latency + output latency`.
    pub play_frame: i64,
    /// Record-layer position where input lands; diverges from `frame`
    /// in the extending modes.
    pub record_cursor: i64,
    pub mode: Mode,
    pub mute: bool,
    /// Sticky minor-mode mute, survives mode changes.
    pub mute_mode: bool,
    pub pause: bool,
    pub overdub: bool,
    pub reverse: bool,
    /// Remembered play state for a later GlobalMute restore.
    pub global_mute_restore: bool,
    /// Remembered mute state while some other track is soloed.
    pub solo_restore: bool,
    pub feedback: u8,
    pub mode_start_frame: i64,
    pub latency_loss: i64,
}

impl Loop {
    pub fn new(number: usize) -> Self {
        Loop {
            number,
            record_layer: None,
            play_layer: None,
            redo_layer: None,
            frame: 0,
            play_frame: 0,
            record_cursor: 0,
            mode: Mode::Reset,
            mute: false,
            mute_mode: false,
            pause: false,
            overdub: false,
            reverse: false,
            global_mute_restore: false,
            solo_restore: false,
            feedback: 127,
            mode_start_frame: 0,
            latency_loss: 0,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn is_reset(&self) -> bool {
        self.mode == Mode::Reset
    }

    /// Loop length as the event timeline sees it: the play layer's
    /// length in the extending modes, the record layer's otherwise.
    /// Zero while empty or initially recording.
    pub fn loop_frames(&self, layers: &LayerPool) -> i64 {
        match self.mode {
            Mode::Record | Mode::Reset | Mode::Threshold | Mode::Synchronize => 0,
            Mode::Multiply | Mode::Stutter => self
                .play_layer
                .and_then(|id| layers.get(id))
                .map(|l| l.frames())
                .unwrap_or(0),
            _ => self
                .record_layer
                .and_then(|id| layers.get(id))
                .map(|l| l.frames())
                .unwrap_or(0),
        }
    }

    pub fn cycle_frames(&self, layers: &LayerPool) -> i64 {
        let id = match self.mode {
            Mode::Multiply | Mode::Stutter => self.play_layer,
            _ => self.record_layer,
        };
        id.and_then(|id| layers.get(id)).map(|l| l.cycle_frames()).unwrap_or(0)
    }

    pub fn subcycle_frames(&self, layers: &LayerPool, subcycles: u32) -> i64 {
        let cycle = self.cycle_frames(layers);
        if subcycles == 0 { cycle } else { cycle / subcycles as i64 }
    }

    /// Total frames across the whole layer history, for windowing.
    pub fn history_frames(&self, layers: &LayerPool) -> i64 {
        self.play_layer
            .and_then(|id| layers.get(id))
            .map(|l| {
                if l.is_windowing() {
                    l.prev
                        .and_then(|p| layers.get(p))
                        .map(|p| p.history_offset + p.frames())
                        .unwrap_or(0)
                } else {
                    l.history_offset + l.frames()
                }
            })
            .unwrap_or(0)
    }

    pub fn wrap_frame(&self, frame: i64, frames: i64) -> i64 {
        if frames <= 0 { 0 } else { frame.rem_euclid(frames) }
    }

    /// Re-derive the output cursor after a non-smooth transition.
    pub fn recalculate_play_frame(&mut self, s: &LoopServices) {
        let frames = self
            .play_layer
            .and_then(|id| s.layers.get(id))
            .map(|l| l.frames())
            .unwrap_or(0);
        if frames > 0 {
            self.play_frame = self.wrap_frame(self.frame + s.input.latency + s.output.latency, frames);
        } else {
            self.play_frame = 0;
        }
    }

    /// Boundary the current chunk must not cross.
    fn boundary(&self, layers: &LayerPool) -> Option<i64> {
        let bound = match self.mode {
            Mode::Reset | Mode::Record | Mode::Threshold | Mode::Synchronize => None,
            Mode::Multiply => {
                // bounded by the source loop point and by the point
                // where the record cursor runs out of appended room
                let loop_frames = self.loop_frames(layers);
                let record_frames = self
                    .record_layer
                    .and_then(|id| layers.get(id))
                    .map(|l| l.frames())
                    .unwrap_or(0);
                let append_at = self.frame + (record_frames - self.record_cursor);
                Some(loop_frames.min(append_at))
            }
            Mode::Stutter => {
                let cycle = self.cycle_frames(layers);
                if cycle > 0 {
                    Some(self.mode_start_frame + cycle)
                } else {
                    None
                }
            }
            Mode::Insert => self.record_layer.and_then(|id| layers.get(id)).map(|l| {
                if l.is_inserting() {
                    l.insert_end()
                } else {
                    l.frames()
                }
            }),
            _ => Some(self.loop_frames(layers)),
        };
        bound.filter(|b| *b > 0)
    }

    /// Advance one interrupt's worth of audio.
    pub fn advance(&mut self, s: &mut LoopServices, input: &[f32], output: &mut [f32], frames: usize) {
        if self.pause {
            // the timeline is frozen, so anything scheduled executes
            // now; this is how the unpause itself gets through
            let mut guard = 0usize;
            while let Some(id) = s.events.next_due(i64::MAX) {
                guard += 1;
                if guard > 256 {
                    warn!("event storm while paused, flushing");
                    s.events.flush();
                    break;
                }
                self.fire(s, id);
                if !self.pause {
                    break;
                }
            }
            if self.pause {
                return;
            }
        }
        let mut offset = 0usize;
        let mut guard = 0usize;
        while offset < frames {
            guard += 1;
            if guard > frames * 4 + 64 {
                warn!(loop_number = self.number, "advance failed to progress, abandoning interrupt");
                break;
            }
            // events land before the boundary they sit on
            self.fire_due(s);
            if let Some(b) = self.boundary(s.layers) {
                if self.frame >= b {
                    self.cross_boundary(s, b);
                    continue;
                }
            }

            let mut chunk = frames - offset;
            if let Some(event_frame) = s.events.next_frame(self.frame) {
                let to_event = (event_frame - self.frame).max(0) as usize;
                chunk = chunk.min(to_event);
            }
            if let Some(b) = self.boundary(s.layers) {
                let to_boundary = (b - self.frame).max(0) as usize;
                chunk = chunk.min(to_boundary);
            }

            if chunk > 0 {
                self.process_chunk(
                    s,
                    &input[offset * CHANNELS..(offset + chunk) * CHANNELS],
                    &mut output[offset * CHANNELS..(offset + chunk) * CHANNELS],
                    chunk,
                );
                offset += chunk;
            } else if s.events.next_due(self.frame + 1).is_none() {
                // an event scheduled exactly here was pending or the
                // timeline is empty; just consume the remainder
                self.frame += (frames - offset) as i64;
                self.record_cursor += (frames - offset) as i64;
                offset = frames;
            }
        }
        self.fire_due(s);
    }

    fn fire_due(&mut self, s: &mut LoopServices) {
        let mut guard = 0usize;
        while let Some(id) = s.events.next_due(self.frame + 1) {
            guard += 1;
            if guard > 256 {
                warn!("event storm, flushing");
                s.events.flush();
                break;
            }
            self.fire(s, id);
        }
    }

    fn fire(&mut self, s: &mut LoopServices, id: EventId) {
        let Some(event) = s.events.get(id) else {
            return;
        };
        let etype = event.etype;
        let is_child = event.parent.is_some();
        functions::do_event(self, s, id);
        if is_child {
            // children are freed along with their parent
            s.events.remove(id);
        } else {
            s.events.free(id);
        }
        trace!(loop_number = self.number, etype = ?etype, "event fired");
    }

    fn process_chunk(&mut self, s: &mut LoopServices, input: &[f32], output: &mut [f32], frames: usize) {
        // record side
        let recording = self.mode.is_recording() || self.overdub;
        if recording {
            if let Some(record) = self.record_layer {
                if self.mode == Mode::Replace {
                    s.layers.occlude(record, self.record_cursor, frames as i64);
                }
                let mut scratch = [0.0f32; crate::layer::MAX_RENDER_SAMPLES];
                let samples = frames * CHANNELS;
                scratch[..samples].copy_from_slice(&input[..samples]);
                let ctx = LayerContext {
                    buffer: &mut scratch[..samples],
                    frames,
                    reverse: self.reverse,
                    level: 1.0,
                };
                if let Some(layer) = s.layers.get_mut(record) {
                    layer.record(&ctx, self.record_cursor, self.feedback);
                }
            }
        }
        // carry the background forward through the flattening pass
        if self.mode != Mode::Record && self.mode != Mode::Reset {
            if let Some(record) = self.record_layer {
                s.layers.advance_record(record, self.record_cursor, frames);
            }
        }

        // play side
        if !self.mute {
            if let Some(play) = self.play_layer {
                let play_frames = s.layers.get(play).map(|l| l.frames()).unwrap_or(0);
                if play_frames > 0 {
                    let mut rendered = 0usize;
                    let mut at = self.wrap_frame(self.play_frame, play_frames);
                    while rendered < frames {
                        let chunk = ((play_frames - at) as usize).min(frames - rendered);
                        if chunk == 0 {
                            break;
                        }
                        let sub = &mut output[rendered * CHANNELS..(rendered + chunk) * CHANNELS];
                        let mut ctx = LayerContext::new(sub, chunk);
                        ctx.reverse = self.reverse;
                        s.layers.render(play, &mut ctx, at, true);
                        rendered += chunk;
                        at = self.wrap_frame(at + chunk as i64, play_frames);
                    }
                }
            }
        }
        s.output.mix_tail(output, frames);

        // cursors
        self.frame += frames as i64;
        self.record_cursor += frames as i64;
        let play_frames = self
            .play_layer
            .and_then(|id| s.layers.get(id))
            .map(|l| l.frames())
            .unwrap_or(0);
        if play_frames > 0 {
            self.play_frame = self.wrap_frame(self.play_frame + frames as i64, play_frames);
        }
    }

    /// The record cursor reached a structural boundary.
    fn cross_boundary(&mut self, s: &mut LoopServices, boundary: i64) {
        match self.mode {
            Mode::Multiply => {
                let record_frames = self
                    .record_layer
                    .and_then(|id| s.layers.get(id))
                    .map(|l| l.frames())
                    .unwrap_or(0);
                if self.record_cursor >= record_frames {
                    // ran out of room: append the cycle being entered
                    if let (Some(record), Some(play)) = (self.record_layer, self.play_layer) {
                        s.layers.multiply_cycle(record, play, self.record_cursor);
                    }
                    debug!(loop_number = self.number, "multiply appended cycle");
                }
                let loop_frames = self.loop_frames(s.layers);
                if loop_frames > 0 && self.frame >= loop_frames {
                    s.events.shift(loop_frames);
                    self.frame -= loop_frames;
                    trace!(loop_number = self.number, "multiply crossed loop point");
                }
            }
            Mode::Stutter => {
                // repeat the stuttered cycle, appending a copy; the
                // record cursor moves into the appended region
                if let (Some(record), Some(play)) = (self.record_layer, self.play_layer) {
                    let offset = s.layers.get(record).map(|l| l.frames()).unwrap_or(0);
                    s.layers.stutter_cycle(record, play, self.mode_start_frame, offset);
                    self.record_cursor = offset;
                }
                self.frame = self.mode_start_frame;
                self.play_frame = self.wrap_frame(
                    self.mode_start_frame + s.input.latency + s.output.latency,
                    self.loop_frames(s.layers).max(1),
                );
            }
            Mode::Insert => {
                let record = self.record_layer;
                let inserting = record
                    .and_then(|id| s.layers.get(id))
                    .map(|l| l.is_inserting())
                    .unwrap_or(false);
                if inserting {
                    let cycle = self.cycle_frames(s.layers).max(1);
                    if let Some(record) = record {
                        s.layers.continue_insert(record, cycle);
                    }
                } else {
                    self.cross_loop_point(s, boundary);
                }
            }
            _ => self.cross_loop_point(s, boundary),
        }
    }

    /// Ordinary loop-point crossing: commit deferred fades when the
    /// seam is discontinuous, shift if this pass changed anything, wrap.
    fn cross_loop_point(&mut self, s: &mut LoopServices, loop_frames: i64) {
        let changed = self
            .record_layer
            .and_then(|id| s.layers.get(id))
            .map(|l| l.is_changed())
            .unwrap_or(false);
        if changed {
            // a seamless overdub straddling the loop point keeps its
            // deferred fades; a recording that stopped earlier in the
            // pass left a discontinuity at its tail
            let seamless = self.mode.is_recording() || self.overdub;
            if !seamless {
                if let Some(record) = self.record_layer {
                    if let Some(layer) = s.layers.get_mut(record) {
                        layer.apply_deferred_fade_right();
                    }
                }
            }
            self.shift(s, false);
        }
        self.frame -= loop_frames;
        self.record_cursor = self.frame;
        s.events.shift(loop_frames);
        trace!(loop_number = self.number, "loop point");
    }

    /// Finalize the record layer into history and begin a new one.
    pub fn shift(&mut self, s: &mut LoopServices, force: bool) {
        let Some(record) = self.record_layer else {
            return;
        };
        let changed = s.layers.get(record).map(|l| l.is_changed()).unwrap_or(false);
        if !changed && !force {
            return;
        }
        // a new generation invalidates the redo chain
        self.flush_redo(s);
        if let Some(layer) = s.layers.get_mut(record) {
            layer.set_finalized(true);
            layer.set_structure_changed(false);
        }
        self.play_layer = Some(record);
        let fresh = s.layers.alloc();
        s.layers.rebase_record(fresh, record, self.feedback);
        if let Some(layer) = s.layers.get_mut(fresh) {
            layer.isolated_overdub = s.config.isolate_overdubs;
        }
        self.record_layer = Some(fresh);
        self.check_max_undo(s);
        s.output.set_layer_shift(true);
        debug!(loop_number = self.number, "layer shift");
    }

    fn check_max_undo(&mut self, s: &mut LoopServices) {
        let max = s.config.preset.max_undo;
        if max == 0 {
            return;
        }
        let mut kept = 0u32;
        let mut cursor = self.play_layer;
        while let Some(id) = cursor {
            let Some(layer) = s.layers.get(id) else { break };
            kept += 1;
            let next = layer.prev;
            if kept >= max {
                if let Some(tail) = next {
                    if s.layers.get(tail).map(|l| l.checkpoint == crate::layer::Checkpoint::On).unwrap_or(false) {
                        // checkpoints are never trimmed
                        return;
                    }
                    if let Some(layer) = s.layers.get_mut(id) {
                        layer.prev = None;
                    }
                    s.layers.free_chain(tail);
                    info!(loop_number = self.number, "trimmed undo history");
                }
                return;
            }
            cursor = next;
        }
    }

    fn flush_redo(&mut self, s: &mut LoopServices) {
        let mut cursor = self.redo_layer.take();
        while let Some(id) = cursor {
            cursor = s.layers.get(id).and_then(|l| l.redo);
            if let Some(layer) = s.layers.get_mut(id) {
                layer.redo = None;
            }
            s.layers.free(id);
        }
    }

    /// Step back one generation.
    pub fn undo(&mut self, s: &mut LoopServices) {
        let changed = self
            .record_layer
            .and_then(|id| s.layers.get(id))
            .map(|l| l.is_changed())
            .unwrap_or(false);
        if changed {
            // discard uncommitted changes in the record layer
            if let (Some(record), Some(play)) = (self.record_layer, self.play_layer) {
                s.layers.rebase_record(record, play, self.feedback);
                info!(loop_number = self.number, "undo discarded record changes");
            }
        } else if let Some(play) = self.play_layer {
            let prev = s.layers.get(play).and_then(|l| l.prev);
            let Some(prev) = prev else {
                debug!(loop_number = self.number, "nothing to undo");
                return;
            };
            if let Some(record) = self.record_layer {
                s.layers.rebase_record(record, prev, self.feedback);
            }
            // the discarded layer heads the redo chain
            if let Some(layer) = s.layers.get_mut(play) {
                layer.redo = self.redo_layer;
            }
            self.redo_layer = Some(play);
            self.play_layer = Some(prev);
            info!(loop_number = self.number, "undo");
        }
        self.after_history_move(s);
    }

    /// Step forward along the redo chain.
    pub fn redo(&mut self, s: &mut LoopServices) {
        let Some(next) = self.redo_layer else {
            debug!(loop_number = self.number, "nothing to redo");
            return;
        };
        self.redo_layer = s.layers.get(next).and_then(|l| l.redo);
        if let Some(layer) = s.layers.get_mut(next) {
            layer.redo = None;
        }
        if let Some(record) = self.record_layer {
            s.layers.rebase_record(record, next, self.feedback);
        }
        self.play_layer = Some(next);
        info!(loop_number = self.number, "redo");
        self.after_history_move(s);
    }

    fn after_history_move(&mut self, s: &mut LoopServices) {
        if let (Some(play), true) = (self.play_layer, !self.mute) {
            s.output.capture_tail(s.layers, play, self.play_frame, self.reverse, 1.0);
        }
        let frames = self.loop_frames(s.layers);
        if frames > 0 {
            self.frame = self.wrap_frame(self.frame, frames);
            self.record_cursor = self.frame;
        }
        self.resume_play();
        self.recalculate_play_frame(s);
        if let Some(play) = self.play_layer {
            if let Some(layer) = s.layers.get(play) {
                layer.arm_play_fade();
            }
        }
    }

    /// Leave any recording mode and return to plain play, preserving
    /// minor modes.
    pub fn resume_play(&mut self) {
        self.mode = if self.mute { Mode::Mute } else { Mode::Play };
        if self.overdub && !self.mute {
            self.mode = Mode::Overdub;
        }
    }

    /// A function that may cancel mute fired while the sticky mute
    /// minor mode was on.
    pub fn check_mute_cancel(&mut self, s: &mut LoopServices, function: Option<crate::functions::FunctionId>) {
        let cancels = function
            .and_then(|f| s.functions.get(f))
            .map(|f| f.may_cancel_mute)
            .unwrap_or(false);
        if cancels && self.mute_mode {
            self.mute = false;
            self.mute_mode = false;
            debug!(loop_number = self.number, "mute canceled by function");
        }
    }

    /// Apply a play jump: the output-side half of a scheduled change.
    pub fn do_jump(&mut self, s: &mut LoopServices, event: &crate::event::Event) {
        let parent = event.parent.and_then(|p| s.events.get(p));
        let parent_type = parent.map(|p| p.etype);
        match parent_type {
            Some(EventType::Mute) | Some(EventType::Pause) => {
                // entering mute fades the output out; leaving just
                // reopens it, the play fade smooths the resume
                if self.mute {
                    self.mute = false;
                    if let Some(play) = self.play_layer.and_then(|id| s.layers.get(id)) {
                        play.arm_play_fade();
                    }
                } else {
                    if let Some(play) = self.play_layer {
                        s.output.capture_tail(s.layers, play, self.play_frame, self.reverse, 1.0);
                    }
                    self.mute = true;
                }
            }
            Some(EventType::Insert) => {
                if let Some(play) = self.play_layer {
                    s.output.capture_tail(s.layers, play, self.play_frame, self.reverse, 1.0);
                }
                self.mute = true;
            }
            Some(EventType::Replace) => {
                if self.mode == Mode::Replace {
                    // leaving: old content resumes
                    self.mute = self.mute_mode;
                    self.recalculate_play_frame(s);
                } else {
                    if let Some(play) = self.play_layer {
                        s.output.capture_tail(s.layers, play, self.play_frame, self.reverse, 1.0);
                    }
                    self.mute = true;
                }
            }
            Some(EventType::InsertEnd) => {
                self.mute = self.mute_mode;
                self.recalculate_play_frame(s);
            }
            Some(EventType::RecordStop) => {
                // output flips to the start of the new loop
                self.play_frame = 0;
                s.output.set_layer_shift(true);
            }
            _ => {
                if event.jump.mute {
                    self.mute = true;
                }
                if event.jump.unmute {
                    self.mute = false;
                }
                if event.jump.layer.is_some() || event.jump.frame != 0 {
                    self.play_frame = event.jump.frame;
                }
            }
        }
    }

    /// Return the loop to an empty state, releasing all history.
    pub fn reset(&mut self, s: &mut LoopServices) {
        self.flush_redo(s);
        if let Some(record) = self.record_layer.take() {
            s.layers.free_chain(record);
        }
        self.play_layer = None;
        self.frame = 0;
        self.play_frame = 0;
        self.record_cursor = 0;
        self.mode = Mode::Reset;
        self.mute = false;
        self.mute_mode = false;
        self.pause = false;
        self.overdub = false;
        self.reverse = false;
        self.mode_start_frame = 0;
        self.latency_loss = 0;
        self.feedback = s.config.preset.feedback;
        s.events.flush();
        s.output.drop_tail();
        info!(loop_number = self.number, "loop reset");
    }

    /// Best-effort consistency check after a function fired.
    pub fn validate(&self, s: &LoopServices) {
        let frames = self.loop_frames(s.layers);
        if frames > 0 && (self.frame < 0 || self.frame >= frames + 1) {
            warn!(loop_number = self.number, frame = self.frame, frames, "record frame out of range");
        }
        if let Some(play) = self.play_layer {
            if s.layers.get(play).map(|l| l.is_pooled()).unwrap_or(true) {
                warn!(loop_number = self.number, "play layer is pooled");
            }
        }
    }
}

