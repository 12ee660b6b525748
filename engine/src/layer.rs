//! Loop history layers.
//!
//! A layer is one generation of a loop: local audio holding material
//! recorded into this generation, plus segments windowing earlier
//! layers. History is append-only and segments only point backward, so
//! the graph is a DAG; layers are reference counted from the segments
//! that window them and freed when the count reaches zero.
//!
//! Layers live in a slab owned by [`LayerPool`] and are addressed by
//! [`LayerId`]. The pool keeps a free list of recycled layers so the
//! interrupt can shift generations without touching the heap once the
//! pool is primed.

pub mod segment;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::audio::fade::FADE_RANGE;
use crate::audio::{Audio, AudioCursor, AudioPool, CHANNELS, Fade, FadeWindow, MAX_INTERRUPT_FRAMES};
use crate::mutex::UnsafeMutex;

pub use segment::{Segment, SegmentSource};

/// Samples in the largest render region one call can request.
pub const MAX_RENDER_SAMPLES: usize = MAX_INTERRUPT_FRAMES * CHANNELS;

/// Handle to a layer in the pool slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayerId(pub usize);

/// Checkpoint status carries tri-state logic so unspecified state can be
/// transferred from the record layer at shift without clobbering an
/// explicit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Checkpoint {
    Off,
    On,
    #[default]
    Unspecified,
}

/// Buffer, direction and level passed down through the render and
/// record paths.
pub struct LayerContext<'a> {
    pub buffer: &'a mut [f32],
    pub frames: usize,
    pub reverse: bool,
    pub level: f32,
}

impl<'a> LayerContext<'a> {
    pub fn new(buffer: &'a mut [f32], frames: usize) -> Self {
        LayerContext {
            buffer,
            frames,
            reverse: false,
            level: 1.0,
        }
    }
}

pub struct Layer {
    pooled: bool,
    number: u32,
    references: u32,
    pub prev: Option<LayerId>,
    pub redo: Option<LayerId>,
    segments: Vec<Segment>,
    pub audio: Audio,
    pub overdub: Option<Audio>,
    frames: i64,
    cycles: u32,
    pub feedback: u8,
    pub starting_feedback: u8,
    pub checkpoint: Checkpoint,
    pub history_offset: i64,
    pub window_offset: Option<i64>,
    pub window_subcycle_frames: i64,
    pub deferred_fade_left: bool,
    pub deferred_fade_right: bool,
    pub contains_deferred_fade_left: bool,
    pub contains_deferred_fade_right: bool,
    pub reverse_record: bool,
    pub no_flattening: bool,
    pub isolated_overdub: bool,
    finalized: bool,
    audio_changed: bool,
    structure_changed: bool,
    inserting: bool,
    insert_start: i64,
    insert_end: i64,
    /// Where the most recent recording burst stopped; deferred tail
    /// fades land here, not at the loop end.
    last_record_end: i64,
    max_sample: f32,
    head_window: FadeWindow,
    tail_window: FadeWindow,
    play_fade: UnsafeMutex<Fade>,
}

impl Layer {
    fn new(pool: &AudioPool) -> Self {
        Layer {
            pooled: false,
            number: 0,
            references: 0,
            prev: None,
            redo: None,
            segments: Vec::new(),
            audio: Audio::new(pool),
            overdub: None,
            frames: 0,
            cycles: 1,
            feedback: 127,
            starting_feedback: 127,
            checkpoint: Checkpoint::Unspecified,
            history_offset: 0,
            window_offset: None,
            window_subcycle_frames: 0,
            deferred_fade_left: false,
            deferred_fade_right: false,
            contains_deferred_fade_left: false,
            contains_deferred_fade_right: false,
            reverse_record: false,
            no_flattening: false,
            isolated_overdub: false,
            finalized: false,
            audio_changed: false,
            structure_changed: false,
            inserting: false,
            insert_start: 0,
            insert_end: 0,
            last_record_end: 0,
            max_sample: 0.0,
            head_window: FadeWindow::default(),
            tail_window: FadeWindow::default(),
            play_fade: UnsafeMutex::new(Fade::default()),
        }
    }

    fn reset(&mut self) {
        // segments must have been released by the pool already
        if !self.segments.is_empty() {
            error!("layer reset with live segments");
            self.segments.clear();
        }
        self.prev = None;
        self.redo = None;
        self.audio.reset();
        self.overdub = None;
        self.frames = 0;
        self.cycles = 1;
        self.feedback = 127;
        self.starting_feedback = 127;
        self.checkpoint = Checkpoint::Unspecified;
        self.history_offset = 0;
        self.window_offset = None;
        self.window_subcycle_frames = 0;
        self.deferred_fade_left = false;
        self.deferred_fade_right = false;
        self.contains_deferred_fade_left = false;
        self.contains_deferred_fade_right = false;
        self.reverse_record = false;
        self.no_flattening = false;
        self.isolated_overdub = false;
        self.finalized = false;
        self.audio_changed = false;
        self.structure_changed = false;
        self.inserting = false;
        self.insert_start = 0;
        self.insert_end = 0;
        self.last_record_end = 0;
        self.max_sample = 0.0;
        self.head_window.reset();
        self.tail_window.reset();
        self.play_fade.lock().cancel();
        self.references = 0;
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn frames(&self) -> i64 {
        self.frames
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn cycle_frames(&self) -> i64 {
        if self.cycles == 0 {
            self.frames
        } else {
            self.frames / self.cycles as i64
        }
    }

    pub fn set_cycles(&mut self, cycles: u32) {
        self.cycles = cycles.max(1);
    }

    pub fn max_sample(&self) -> f32 {
        self.max_sample
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn set_finalized(&mut self, finalized: bool) {
        self.finalized = finalized;
    }

    pub fn is_audio_changed(&self) -> bool {
        self.audio_changed
    }

    pub fn is_structure_changed(&self) -> bool {
        self.structure_changed
    }

    pub fn set_structure_changed(&mut self, changed: bool) {
        self.structure_changed = changed;
    }

    pub fn is_changed(&self) -> bool {
        self.audio_changed || self.structure_changed
    }

    pub fn is_inserting(&self) -> bool {
        self.inserting
    }

    pub fn insert_end(&self) -> i64 {
        self.insert_end
    }

    pub fn is_windowing(&self) -> bool {
        self.window_offset.is_some()
    }

    /// Longest extent claimed by the segment list.
    pub fn segment_frames(&self) -> i64 {
        self.segments
            .iter()
            .map(|s| s.offset + s.frames)
            .max()
            .unwrap_or(0)
    }

    /// Recalculate length from segments and local audio.
    pub fn calc_frames(&self) -> i64 {
        self.segment_frames().max(self.audio.frames())
    }

    /// Set the logical length of the layer and its local audio.
    pub fn resize(&mut self, frames: i64) {
        if self.reverse_record {
            self.audio.set_frames_reverse(frames);
        } else {
            self.audio.set_frames(frames);
        }
        self.frames = frames;
    }

    pub fn resize_from_segments(&mut self) {
        let frames = self.segment_frames();
        self.resize(frames);
    }

    /// Arm a short fade-in for the next play pass.
    pub fn arm_play_fade(&self) {
        self.play_fade.lock().activate(true);
    }

    pub fn cancel_play_fade(&self) {
        self.play_fade.lock().cancel();
    }

    /// Record input into the local audio. `start_frame` is the record
    /// cursor position; in reverse the cursor walks downward.
    pub fn record(&mut self, ctx: &LayerContext, start_frame: i64, feedback: u8) {
        if self.pooled {
            error!("attempt to record into a pooled layer");
            return;
        }
        let mut cursor = AudioCursor::new();
        cursor.set_auto_extend(true);
        cursor.set_reverse(ctx.reverse);
        cursor.set_frame(start_frame);
        cursor.put(&mut self.audio, ctx.buffer, ctx.frames, crate::audio::SampleOp::Add);
        if ctx.frames as i64 + start_frame > self.frames && !ctx.reverse {
            self.frames = start_frame + ctx.frames as i64;
        }
        if ctx.reverse {
            self.reverse_record = true;
            self.frames = self.frames.max(self.audio.frames());
        }

        if self.isolated_overdub {
            if self.overdub.is_none() {
                let pool = self.audio.pool_handle();
                self.overdub = Some(Audio::new(&pool));
            }
            if let Some(overdub) = self.overdub.as_mut() {
                let mut iso = AudioCursor::new();
                iso.set_auto_extend(true);
                iso.set_reverse(ctx.reverse);
                iso.set_frame(start_frame);
                iso.put(overdub, ctx.buffer, ctx.frames, crate::audio::SampleOp::Add);
            }
        }

        for s in ctx.buffer.iter().take(ctx.frames * CHANNELS) {
            let magnitude = s.abs();
            if magnitude > self.max_sample {
                self.max_sample = magnitude;
            }
        }

        // deferred edge fades: capture what lands at the edges so a
        // later discontinuity can be neutralized
        if start_frame < FADE_RANGE as i64 {
            let head_frames = ((FADE_RANGE as i64 - start_frame).min(ctx.frames as i64)).max(0) as usize;
            self.head_window.add(&ctx.buffer[..head_frames * CHANNELS], head_frames);
            self.deferred_fade_left = true;
        }
        self.tail_window.add(ctx.buffer, ctx.frames);
        self.deferred_fade_right = true;
        self.last_record_end = if ctx.reverse {
            self.last_record_end.max(start_frame + 1)
        } else {
            start_frame + ctx.frames as i64
        };

        self.feedback = feedback;
        self.audio_changed = true;
    }

    /// Commit the deferred head fade using the captured window.
    pub fn apply_deferred_fade_left(&mut self) {
        if self.deferred_fade_left {
            self.head_window.apply_head(&mut self.audio);
            self.deferred_fade_left = false;
            debug!(layer = self.number, "applied deferred head fade");
        }
    }

    /// Commit the deferred tail fade using the captured window.
    pub fn apply_deferred_fade_right(&mut self) {
        if self.deferred_fade_right {
            let end = if self.last_record_end > 0 { self.last_record_end } else { self.frames };
            self.tail_window.apply_tail(&mut self.audio, end);
            self.deferred_fade_right = false;
            debug!(layer = self.number, end, "applied deferred tail fade");
        }
    }
}

/// Slab pool of layers plus the cross-layer operations that maintain
/// reference counts and segment invariants.
pub struct LayerPool {
    audio_pool: AudioPool,
    slots: Vec<Option<Box<Layer>>>,
    free_ids: Vec<usize>,
    counter: u32,
    allocated: usize,
    mute_layer: LayerId,
}

impl LayerPool {
    pub fn new(audio_pool: &AudioPool) -> Self {
        let mut pool = LayerPool {
            audio_pool: audio_pool.clone(),
            slots: Vec::new(),
            free_ids: Vec::new(),
            counter: 0,
            allocated: 0,
            mute_layer: LayerId(0),
        };
        // shared sentinel played while muted; never freed
        let mute = pool.alloc();
        pool.mute_layer = mute;
        if let Some(layer) = pool.get_mut(mute) {
            layer.references = 1;
        }
        pool
    }

    /// Pre-construct pooled layers so shifts on the interrupt do not
    /// allocate.
    pub fn prime(&mut self, count: usize) {
        for _ in 0..count {
            let mut layer = Box::new(Layer::new(&self.audio_pool));
            layer.pooled = true;
            let id = self.slots.len();
            self.slots.push(Some(layer));
            self.free_ids.push(id);
            self.allocated += 1;
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.free_ids.len()
    }

    pub fn mute_layer(&self) -> LayerId {
        self.mute_layer
    }

    pub fn audio_pool(&self) -> &AudioPool {
        &self.audio_pool
    }

    pub fn alloc(&mut self) -> LayerId {
        self.counter += 1;
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                trace!("layer pool empty, allocating from the heap");
                let id = self.slots.len();
                self.slots.push(Some(Box::new(Layer::new(&self.audio_pool))));
                self.allocated += 1;
                id
            }
        };
        if let Some(layer) = self.slots[id].as_deref_mut() {
            layer.reset();
            layer.pooled = false;
            layer.number = self.counter;
        }
        LayerId(id)
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.slots.get(id.0).and_then(|s| s.as_deref())
    }

    pub fn get_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.slots.get_mut(id.0).and_then(|s| s.as_deref_mut())
    }

    fn with_taken<R>(&mut self, id: LayerId, default: R, f: impl FnOnce(&mut Self, &mut Layer) -> R) -> R {
        let Some(slot) = self.slots.get_mut(id.0) else {
            error!(id = id.0, "missing layer slot");
            return default;
        };
        let Some(mut layer) = slot.take() else {
            error!(id = id.0, "layer taken twice");
            return default;
        };
        let result = f(self, &mut layer);
        self.slots[id.0] = Some(layer);
        result
    }

    pub fn inc_ref(&mut self, id: LayerId) {
        if let Some(layer) = self.get_mut(id) {
            layer.references += 1;
        }
    }

    /// Drop a reference. Unreferenced layers become freeable; the
    /// actual free happens when the undo chain discards them, so
    /// history layers survive while the loop still walks them.
    pub fn dec_ref(&mut self, id: LayerId) {
        let Some(layer) = self.get_mut(id) else {
            return;
        };
        if layer.references == 0 {
            error!(layer = layer.number, "reference count underflow");
            return;
        }
        layer.references -= 1;
        if layer.references == 0 {
            trace!(layer = layer.number, "layer unreferenced, freeable");
        }
    }

    /// Return a layer to the pool. Releases segments (recursively
    /// dropping references) and audio buffers.
    pub fn free(&mut self, id: LayerId) {
        if id == self.mute_layer {
            return;
        }
        let Some(layer) = self.get_mut(id) else {
            return;
        };
        if layer.pooled {
            error!(layer = layer.number, "double free of layer");
            return;
        }
        if layer.references > 0 {
            trace!(layer = layer.number, references = layer.references, "layer still referenced, not freed");
            return;
        }
        let segments = std::mem::take(&mut layer.segments);
        layer.pooled = true;
        for seg in &segments {
            if let Some(referent) = seg.layer_id() {
                self.dec_ref(referent);
            }
        }
        if let Some(layer) = self.get_mut(id) {
            layer.pooled = false;
            layer.reset();
            layer.pooled = true;
        }
        self.free_ids.push(id.0);
    }

    /// Free a whole undo chain starting at `id`, following `prev` links.
    pub fn free_chain(&mut self, id: LayerId) {
        let mut next = Some(id);
        while let Some(id) = next {
            next = self.get(id).and_then(|l| l.prev);
            self.free(id);
        }
    }

    /// Add a segment to a layer, taking over the referent's reference.
    pub fn add_segment(&mut self, owner: LayerId, segment: Segment) {
        if let Some(referent) = segment.layer_id() {
            self.inc_ref(referent);
        }
        if let Some(layer) = self.get_mut(owner) {
            layer.segments.push(segment);
            layer.segments.sort_by_key(|s| s.offset);
        }
    }

    /// Drop all segments of a layer, releasing references.
    pub fn reset_segments(&mut self, owner: LayerId) {
        let Some(layer) = self.get_mut(owner) else {
            return;
        };
        let segments = std::mem::take(&mut layer.segments);
        for seg in &segments {
            if let Some(referent) = seg.layer_id() {
                self.dec_ref(referent);
            }
        }
    }

    /// Install a new segment list wholesale.
    pub fn set_segments(&mut self, owner: LayerId, segments: Vec<Segment>) {
        self.reset_segments(owner);
        for seg in segments {
            self.add_segment(owner, seg);
        }
    }

    /// Rebuild `record` as a fresh generation backed by `play`.
    pub fn rebase_record(&mut self, record: LayerId, play: LayerId, feedback: u8) {
        self.reset_segments(record);
        let (play_frames, play_cycles, history) = match self.get(play) {
            Some(p) => (p.frames(), p.cycles(), p.history_offset + p.frames()),
            None => (0, 1, 0),
        };
        let mut seg = Segment::for_layer(play, play_frames);
        seg.feedback = feedback;
        self.add_segment(record, seg);
        if let Some(layer) = self.get_mut(record) {
            layer.prev = Some(play);
            layer.audio.reset();
            layer.overdub = None;
            layer.frames = play_frames;
            layer.cycles = play_cycles;
            layer.history_offset = history;
            layer.audio_changed = false;
            layer.structure_changed = false;
            layer.finalized = false;
            layer.inserting = false;
            layer.insert_start = 0;
            layer.insert_end = 0;
            layer.last_record_end = 0;
            layer.head_window.reset();
            layer.tail_window.reset();
            layer.deferred_fade_left = false;
            layer.deferred_fade_right = false;
            layer.starting_feedback = feedback;
            layer.feedback = feedback;
        }
    }

    /// Frame count of a segment's referent, for edge calculations.
    fn referent_frames(&self, seg: &Segment) -> i64 {
        match &seg.source {
            SegmentSource::Layer(id) => self.get(*id).map(|l| l.frames()).unwrap_or(0),
            SegmentSource::Audio(audio) => audio.frames(),
        }
    }

    /// Walk the segment list in offset order, truncating corrupt
    /// entries and recomputing edge fades. Adjacent seams that are
    /// contiguous in the same referent and direction need no fade.
    pub fn compile_segment_fades(&mut self, owner: LayerId, check_consistency: bool) {
        self.with_taken(owner, (), |pool, layer| {
            layer.segments.sort_by_key(|s| s.offset);
            let mut pruned = false;
            for seg in layer.segments.iter_mut() {
                let referent_frames = pool.referent_frames(seg);
                if seg.start_frame + seg.frames > referent_frames {
                    // corrupt reference, maybe a damaged project
                    warn!(layer = layer.number, "segment exceeds its referent, truncating");
                    seg.frames = (referent_frames - seg.start_frame).max(0);
                    pruned = true;
                }
                let range = FADE_RANGE as i64;
                let left_inside = seg.start_frame > 0;
                let right_inside = seg.start_frame + seg.frames < referent_frames;
                seg.fade_left = left_inside && seg.local_copy_left < range;
                seg.fade_right = right_inside && seg.local_copy_right < range;
                // layer-edge segments inherit the deferred-fade policy
                if seg.offset == 0 && !left_inside {
                    seg.fade_left = layer.contains_deferred_fade_left && layer.deferred_fade_left;
                }
                if seg.offset + seg.frames == layer.frames && !right_inside {
                    seg.fade_right = layer.contains_deferred_fade_right && layer.deferred_fade_right;
                }
            }
            // cancel seam fades between contiguous neighbours
            for i in 1..layer.segments.len() {
                let (before, after) = layer.segments.split_at_mut(i);
                let a = &mut before[i - 1];
                let b = &mut after[0];
                let adjacent = a.offset + a.frames == b.offset;
                let contiguous = match (&a.source, &b.source) {
                    (SegmentSource::Layer(la), SegmentSource::Layer(lb)) => la == lb,
                    _ => false,
                } && a.start_frame + a.frames == b.start_frame;
                if adjacent && contiguous && a.reverse == b.reverse {
                    a.fade_right = false;
                    b.fade_left = false;
                }
            }
            if check_consistency && (pruned || Self::segments_overlap(&layer.segments)) {
                Self::prune_overlaps(layer);
            }
        });
    }

    fn segments_overlap(segments: &[Segment]) -> bool {
        segments
            .windows(2)
            .any(|w| w[0].offset + w[0].frames > w[1].offset)
    }

    fn prune_overlaps(layer: &mut Layer) {
        error!(layer = layer.number, "corrupt segment list, pruning");
        let mut last_end = 0i64;
        for seg in layer.segments.iter_mut() {
            if seg.offset < last_end {
                let cut = last_end - seg.offset;
                seg.trim_left(cut.min(seg.frames), false);
            }
            last_end = seg.offset + seg.frames;
        }
        layer.segments.retain(|s| s.frames > 0);
    }

    /// Render with reflection: the entry point used by the output
    /// stream. In reverse, the requested region is reflected into layer
    /// space once, here at the root.
    pub fn render(&self, id: LayerId, ctx: &mut LayerContext, start_frame: i64, play: bool) {
        let Some(layer) = self.get(id) else {
            return;
        };
        let start = if ctx.reverse {
            layer.frames() - (start_frame + ctx.frames as i64)
        } else {
            start_frame
        };
        self.get_no_reflect(id, ctx, start, true, play);
    }

    /// Render `ctx.frames` frames of a layer starting at forward frame
    /// `start_frame`: local audio plus every overlapping segment.
    pub fn get_no_reflect(&self, id: LayerId, ctx: &mut LayerContext, start_frame: i64, root: bool, play: bool) {
        let Some(layer) = self.get(id) else {
            error!(id = id.0, "render of missing layer");
            return;
        };
        if layer.pooled {
            error!(layer = layer.number, "render of pooled layer");
            return;
        }
        let frames = ctx.frames;

        // local audio
        let mut cursor = AudioCursor::new();
        cursor.set_reverse(ctx.reverse);
        cursor.set_frame(if ctx.reverse {
            start_frame + frames as i64 - 1
        } else {
            start_frame
        });
        cursor.get(&layer.audio, ctx.buffer, frames, ctx.level);

        // overlapping segments
        let region_start = start_frame;
        let region_end = start_frame + frames as i64;
        for seg in layer.segments.iter() {
            let seg_start = seg.offset;
            let seg_end = seg.offset + seg.frames;
            let ov_start = seg_start.max(region_start);
            let ov_end = seg_end.min(region_end);
            if ov_start >= ov_end {
                continue;
            }
            let count = (ov_end - ov_start) as usize;
            let mut dest_off = (ov_start - region_start) as usize;
            if ctx.reverse {
                dest_off = frames - (dest_off + count);
            }
            let sub = &mut ctx.buffer[dest_off * CHANNELS..(dest_off + count) * CHANNELS];
            let mut child = LayerContext {
                buffer: sub,
                frames: count,
                reverse: ctx.reverse,
                level: ctx.level,
            };
            seg.get(&mut child, ov_start - seg_start, self, play);
        }

        if root && play {
            layer.play_fade.lock().advance(ctx.buffer, CHANNELS, frames);
        }
    }

    /// One pass of incremental flattening: copy the region the record
    /// cursor just crossed from the backing segments into local audio,
    /// then trim the segments so the region is owned locally. Only a
    /// segment whose left edge sits at the region start is consumed;
    /// copying mid-segment would double content, so coverage the cursor
    /// jumped over waits for the next full pass.
    pub fn advance_record(&mut self, id: LayerId, start_frame: i64, frames: usize) {
        self.with_taken(id, (), |pool, layer| {
            if layer.no_flattening || layer.segments.is_empty() {
                return;
            }
            // full feedback with no isolation carries the background by
            // reference; flattening only runs when the content decays
            // or an isolated overdub copy must stay separable
            let flatten = layer.feedback < 127 || (layer.isolated_overdub && layer.audio_changed);
            if !flatten {
                return;
            }
            let region_start = start_frame;
            let region_end = start_frame + frames as i64;
            let samples = frames * CHANNELS;
            let mut temp = [0.0f32; MAX_RENDER_SAMPLES];
            let mut copied = false;
            for seg in layer.segments.iter() {
                if seg.offset < region_start || seg.offset >= region_end {
                    continue;
                }
                let ov_end = (seg.offset + seg.frames).min(region_end);
                let count = (ov_end - seg.offset) as usize;
                if count == 0 {
                    continue;
                }
                copied = true;
                let dest_off = (seg.offset - region_start) as usize;
                let sub = &mut temp[dest_off * CHANNELS..(dest_off + count) * CHANNELS];
                let mut child = LayerContext {
                    buffer: sub,
                    frames: count,
                    reverse: false,
                    level: 1.0,
                };
                seg.get(&mut child, 0, pool, false);
            }
            if !copied {
                return;
            }
            let mut cursor = AudioCursor::new();
            cursor.set_auto_extend(true);
            cursor.set_frame(start_frame);
            cursor.put(&mut layer.audio, &temp[..samples], frames, crate::audio::SampleOp::Add);
            layer.audio_changed = true;

            // trim consumed coverage
            let mut released: Vec<LayerId> = Vec::new();
            layer.segments.retain_mut(|seg| {
                if seg.offset < region_start || seg.offset >= region_end {
                    return true;
                }
                let seg_end = seg.offset + seg.frames;
                if seg_end <= region_end {
                    if let Some(referent) = seg.layer_id() {
                        released.push(referent);
                    }
                    return false;
                }
                seg.trim_left(region_end - seg.offset, true);
                true
            });
            for referent in released {
                pool.dec_ref(referent);
            }
        });
    }

    /// Append one more cycle of `src` at the end of the record layer.
    pub fn multiply_cycle(&mut self, id: LayerId, src: LayerId, start_frame: i64) {
        let (src_frames, src_cycle) = match self.get(src) {
            Some(s) => (s.frames(), s.cycle_frames()),
            None => return,
        };
        if src_frames <= 0 || src_cycle <= 0 {
            return;
        }
        let Some(layer) = self.get(id) else {
            return;
        };
        let feedback = layer.feedback;
        let offset = layer.frames;
        let cycle_start = (start_frame.rem_euclid(src_frames) / src_cycle) * src_cycle;
        let mut seg = Segment::for_layer(src, src_cycle);
        seg.offset = offset;
        seg.start_frame = cycle_start;
        seg.frames = src_cycle.min(src_frames - cycle_start);
        seg.feedback = feedback;
        self.add_segment(id, seg);
        if let Some(layer) = self.get_mut(id) {
            layer.frames += src_cycle;
            layer.cycles += 1;
            layer.structure_changed = true;
        }
        debug!("multiply appended cycle");
    }

    /// Append one stuttered copy of the cycle containing `start_frame`,
    /// preserving the cycle boundary.
    pub fn stutter_cycle(&mut self, id: LayerId, src: LayerId, start_frame: i64, offset: i64) {
        let (src_frames, src_cycle) = match self.get(src) {
            Some(s) => (s.frames(), s.cycle_frames()),
            None => return,
        };
        if src_frames <= 0 || src_cycle <= 0 {
            return;
        }
        let cycle_start = (start_frame.rem_euclid(src_frames) / src_cycle) * src_cycle;
        let mut seg = Segment::for_layer(src, src_cycle);
        seg.offset = offset;
        seg.start_frame = cycle_start;
        seg.frames = src_cycle.min(src_frames - cycle_start);
        seg.fade_left = true;
        seg.fade_right = true;
        self.add_segment(id, seg);
        if let Some(layer) = self.get_mut(id) {
            layer.frames += src_cycle;
            layer.cycles += 1;
            layer.structure_changed = true;
        }
    }

    /// Remove segment coverage over `[start, start+frames)` so the
    /// region holds only locally recorded material. Used by replace;
    /// the occluded edges get fades.
    pub fn occlude(&mut self, id: LayerId, start: i64, frames: i64) {
        let end = start + frames;
        let mut released: Vec<LayerId> = Vec::new();
        let mut splits: Vec<Segment> = Vec::new();
        {
            let Some(layer) = self.get_mut(id) else {
                return;
            };
            layer.segments.retain_mut(|seg| {
                let seg_end = seg.offset + seg.frames;
                if seg_end <= start || seg.offset >= end {
                    return true;
                }
                if seg.offset >= start && seg_end <= end {
                    if let Some(referent) = seg.layer_id() {
                        released.push(referent);
                    }
                    return false;
                }
                if seg.offset < start && seg_end > end {
                    // region is interior: split around it
                    if let Some(mut right) = seg.clone_window() {
                        right.trim_left(end - right.offset, false);
                        splits.push(right);
                    }
                    seg.trim_right(seg_end - start, false);
                    return true;
                }
                if seg.offset < start {
                    seg.trim_right(seg_end - start, false);
                } else {
                    seg.trim_left(end - seg.offset, false);
                }
                seg.frames > 0
            });
        }
        for seg in splits {
            self.add_segment(id, seg);
        }
        for referent in released {
            self.dec_ref(referent);
        }
    }

    /// Update the carry-forward feedback on the record layer's backing
    /// segments.
    pub fn set_segment_feedback(&mut self, id: LayerId, feedback: u8) {
        if let Some(layer) = self.get_mut(id) {
            for seg in layer.segments.iter_mut() {
                seg.feedback = feedback;
            }
            layer.feedback = feedback;
        }
    }

    /// Retain only `[start, start+frames)`, re-assigning the cycle
    /// count. Implements unrounded multiply and divide.
    pub fn splice(&mut self, id: LayerId, start: i64, frames: i64, cycles: u32) {
        let mut released: Vec<LayerId> = Vec::new();
        {
            let Some(layer) = self.get_mut(id) else {
                return;
            };
            let end = start + frames;
            layer.audio.splice(start, frames);
            layer.segments.retain_mut(|seg| {
                let seg_end = seg.offset + seg.frames;
                if seg_end <= start || seg.offset >= end {
                    if let Some(referent) = seg.layer_id() {
                        released.push(referent);
                    }
                    return false;
                }
                if seg.offset < start {
                    seg.trim_left(start - seg.offset, false);
                }
                let seg_end = seg.offset + seg.frames;
                if seg_end > end {
                    seg.trim_right(seg_end - end, false);
                }
                seg.offset -= start;
                seg.frames > 0
            });
            layer.frames = frames;
            layer.cycles = cycles.max(1);
            layer.structure_changed = true;
        }
        for referent in released {
            self.dec_ref(referent);
        }
    }

    /// Open an insert gap of one cycle at `start_frame`. Segments at or
    /// past the gap shift right; a segment straddling it is split. The
    /// gap itself reads silence and receives the inserted recording.
    pub fn start_insert(&mut self, id: LayerId, start_frame: i64, cycle_frames: i64) {
        let mut split: Option<Segment> = None;
        {
            let Some(layer) = self.get_mut(id) else {
                return;
            };
            for seg in layer.segments.iter_mut() {
                if seg.offset >= start_frame {
                    seg.offset += cycle_frames;
                } else if seg.offset + seg.frames > start_frame {
                    let left_frames = start_frame - seg.offset;
                    if let Some(mut right) = seg.clone_window() {
                        right.trim_left(left_frames, false);
                        right.offset = start_frame + cycle_frames;
                        split = Some(right);
                    }
                    seg.trim_right(seg.frames - left_frames, false);
                }
            }
            layer.frames += cycle_frames;
            layer.cycles += 1;
            layer.inserting = true;
            layer.insert_start = start_frame;
            layer.insert_end = start_frame + cycle_frames;
            layer.structure_changed = true;
            info!(layer = layer.number, start_frame, cycle_frames, "insert opened");
        }
        if let Some(right) = split {
            self.add_segment(id, right);
        }
    }

    /// Extend the insert gap by another cycle once recording reaches
    /// its end.
    pub fn continue_insert(&mut self, id: LayerId, cycle_frames: i64) {
        let Some(layer) = self.get_mut(id) else {
            return;
        };
        if !layer.inserting {
            return;
        }
        let gap_end = layer.insert_end;
        for seg in layer.segments.iter_mut() {
            if seg.offset >= gap_end {
                seg.offset += cycle_frames;
            }
        }
        layer.frames += cycle_frames;
        layer.cycles += 1;
        layer.insert_end += cycle_frames;
    }

    /// Close the insert. Unrounded endings truncate the unrecorded tail
    /// of the gap and restructure to a single cycle.
    pub fn end_insert(&mut self, id: LayerId, end_frame: i64, unrounded: bool) {
        let Some(layer) = self.get_mut(id) else {
            return;
        };
        if !layer.inserting {
            return;
        }
        if unrounded && end_frame < layer.insert_end {
            let excess = layer.insert_end - end_frame;
            for seg in layer.segments.iter_mut() {
                if seg.offset >= layer.insert_end {
                    seg.offset -= excess;
                }
            }
            layer.frames -= excess;
            layer.cycles = 1;
        }
        layer.inserting = false;
        layer.insert_start = 0;
        layer.insert_end = 0;
        layer.structure_changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fade::ramp128;

    fn pools() -> (AudioPool, LayerPool) {
        let audio_pool = AudioPool::with_ring_size(16);
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(16);
        (audio_pool, layers)
    }

    fn record_constant(layers: &mut LayerPool, id: LayerId, frames: usize, value: f32) {
        let mut content = vec![value; frames * CHANNELS];
        let ctx = LayerContext::new(&mut content, frames);
        layers.get_mut(id).unwrap().record(&ctx, 0, 127);
    }

    fn render(layers: &LayerPool, id: LayerId, start: i64, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; frames * CHANNELS];
        let mut ctx = LayerContext::new(&mut out, frames);
        layers.get_no_reflect(id, &mut ctx, start, true, false);
        out
    }

    #[test]
    fn record_then_render() {
        let (_ap, mut layers) = pools();
        let id = layers.alloc();
        record_constant(&mut layers, id, 100, 0.5);
        assert_eq!(layers.get(id).unwrap().frames(), 100);
        let out = render(&layers, id, 0, 100);
        assert_eq!(out[0], 0.5);
        assert_eq!(out[199], 0.5);
    }

    #[test]
    fn rebase_makes_record_play_through() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 64, 0.25);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        assert_eq!(layers.get(record).unwrap().frames(), 64);
        assert_eq!(layers.get(play).unwrap().references(), 1);
        let out = render(&layers, record, 0, 64);
        assert_eq!(out[0], 0.25);
    }

    #[test]
    fn segment_feedback_scales_render() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 64, 1.0);
        let record = layers.alloc();
        layers.rebase_record(record, play, 64);
        let out = render(&layers, record, 0, 64);
        let expected = ramp128(64);
        assert!((out[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn calc_frames_covers_segments() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 1000, 0.1);
        let record = layers.alloc();
        let mut seg = Segment::for_layer(play, 400);
        seg.offset = 600;
        seg.start_frame = 0;
        layers.add_segment(record, seg);
        assert_eq!(layers.get(record).unwrap().segment_frames(), 1000);
        layers.get_mut(record).unwrap().resize_from_segments();
        assert_eq!(layers.get(record).unwrap().frames(), 1000);
    }

    #[test]
    fn free_chain_releases_history() {
        let (_ap, mut layers) = pools();
        let a = layers.alloc();
        record_constant(&mut layers, a, 10, 0.1);
        let b = layers.alloc();
        layers.rebase_record(b, a, 127);
        let c = layers.alloc();
        layers.rebase_record(c, b, 127);
        // freeing newest-first releases each referent in turn
        let available = layers.available();
        layers.free_chain(c);
        assert!(layers.get(c).unwrap().is_pooled());
        assert!(layers.get(b).unwrap().is_pooled());
        assert!(layers.get(a).unwrap().is_pooled());
        assert_eq!(layers.available(), available + 3);
    }

    #[test]
    fn referenced_layer_survives_free() {
        let (_ap, mut layers) = pools();
        let a = layers.alloc();
        record_constant(&mut layers, a, 10, 0.1);
        let b = layers.alloc();
        layers.rebase_record(b, a, 127);
        layers.free(a);
        assert!(!layers.get(a).unwrap().is_pooled());
        assert_eq!(layers.get(a).unwrap().references(), 1);
    }

    #[test]
    fn splice_keeps_selected_region() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 8000, 0.5);
        layers.get_mut(play).unwrap().set_cycles(4);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        layers.splice(record, 4000, 2000, 1);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.frames(), 2000);
        assert_eq!(layer.cycles(), 1);
        let seg = &layer.segments()[0];
        assert_eq!(seg.offset, 0);
        assert_eq!(seg.start_frame, 4000);
        assert_eq!(seg.frames, 2000);
    }

    #[test]
    fn insert_opens_and_closes_gap() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 1000, 0.5);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        layers.start_insert(record, 400, 1000);
        {
            let layer = layers.get(record).unwrap();
            assert_eq!(layer.frames(), 2000);
            assert_eq!(layer.cycles(), 2);
            assert_eq!(layer.segments().len(), 2);
            // gap reads silence
            let out = render(&layers, record, 500, 16);
            assert!(out.iter().all(|s| *s == 0.0));
        }
        // unrounded end at 900: only 500 frames of insert kept
        layers.end_insert(record, 900, true);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.frames(), 1500);
        assert_eq!(layer.cycles(), 1);
        let last = layer.segments().last().unwrap();
        assert_eq!(last.offset, 900);
    }

    #[test]
    fn multiply_cycle_appends() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 1000, 0.5);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        layers.multiply_cycle(record, play, 0);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.frames(), 2000);
        assert_eq!(layer.cycles(), 2);
        let out = render(&layers, record, 1500, 8);
        assert_eq!(out[0], 0.5);
    }

    #[test]
    fn flattening_localizes_decayed_content() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 256, 0.5);
        let record = layers.alloc();
        layers.rebase_record(record, play, 64);
        layers.advance_record(record, 0, 256);
        {
            let layer = layers.get(record).unwrap();
            assert!(layer.segments().is_empty());
            assert_eq!(layer.audio.frames(), 256);
        }
        // play layer no longer referenced by the record layer
        assert_eq!(layers.get(play).unwrap().references(), 0);
        let out = render(&layers, record, 0, 256);
        let expected = 0.5 * crate::audio::fade::ramp128(64);
        assert!((out[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn full_feedback_keeps_reference() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 256, 0.5);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        layers.advance_record(record, 0, 256);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.segments().len(), 1);
        assert!(layer.audio.is_empty());
    }

    #[test]
    fn occlusion_silences_a_region() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 1000, 0.5);
        let record = layers.alloc();
        layers.rebase_record(record, play, 127);
        layers.occlude(record, 300, 200);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.segments().len(), 2);
        let out = render(&layers, record, 350, 16);
        assert!(out.iter().all(|s| *s == 0.0));
        let before = render(&layers, record, 100, 4);
        assert_eq!(before[0], 0.5);
        let after = render(&layers, record, 600, 4);
        assert_eq!(after[0], 0.5);
    }

    #[test]
    fn compile_fades_cancels_contiguous_seams() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 1000, 0.5);
        let record = layers.alloc();
        let mut a = Segment::for_layer(play, 500);
        a.offset = 0;
        a.start_frame = 0;
        let mut b = Segment::for_layer(play, 500);
        b.offset = 500;
        b.start_frame = 500;
        layers.add_segment(record, a);
        layers.add_segment(record, b);
        layers.get_mut(record).unwrap().resize_from_segments();
        layers.compile_segment_fades(record, false);
        let layer = layers.get(record).unwrap();
        assert!(!layer.segments()[0].fade_right);
        assert!(!layer.segments()[1].fade_left);
        // interior seam facing a different region still fades
        assert!(!layer.segments()[0].fade_left);
        assert!(!layer.segments()[1].fade_right);
    }

    #[test]
    fn over_long_segment_is_truncated() {
        let (_ap, mut layers) = pools();
        let play = layers.alloc();
        record_constant(&mut layers, play, 100, 0.5);
        let record = layers.alloc();
        let mut seg = Segment::for_layer(play, 500);
        seg.start_frame = 50;
        layers.add_segment(record, seg);
        layers.compile_segment_fades(record, true);
        let layer = layers.get(record).unwrap();
        assert_eq!(layer.segments()[0].frames, 50);
    }
}
