//! A window into an earlier layer or a raw audio object.
//!
//! Layers describe their content by referencing prior history through
//! segments. A segment carries a feedback amount, an optional reverse
//! flag, and edge-fade state. Edges that sit strictly inside the
//! referent would produce a click if played unfaded, so each edge either
//! fades or is covered by frames already copied into the owning layer's
//! local audio (`local_copy_*`).

use tracing::{trace, warn};

use crate::audio::fade::{self, FADE_RANGE};
use crate::audio::{AUDIBLE_FLOOR, Audio, AudioCursor, CHANNELS};
use crate::layer::{LayerContext, LayerId, LayerPool, MAX_RENDER_SAMPLES};

/// What a segment reads from.
pub enum SegmentSource {
    Layer(LayerId),
    Audio(Audio),
}

pub struct Segment {
    /// Position within the owning layer.
    pub offset: i64,
    pub source: SegmentSource,
    /// Offset into the referent where this window begins.
    pub start_frame: i64,
    pub frames: i64,
    pub feedback: u8,
    pub reverse: bool,
    /// Frames adjacent to each edge already copied into the owning
    /// layer's local audio; such an edge needs no fade.
    pub local_copy_left: i64,
    pub local_copy_right: i64,
    pub fade_left: bool,
    pub fade_right: bool,
}

impl Segment {
    /// Reference a layer. The caller is responsible for incrementing the
    /// layer's reference count (see [`LayerPool::add_segment`]).
    pub fn for_layer(id: LayerId, frames: i64) -> Self {
        Segment {
            offset: 0,
            source: SegmentSource::Layer(id),
            start_frame: 0,
            frames,
            feedback: 127,
            reverse: false,
            local_copy_left: 0,
            local_copy_right: 0,
            fade_left: false,
            fade_right: false,
        }
    }

    pub fn for_audio(audio: Audio) -> Self {
        let frames = audio.frames();
        Segment {
            offset: 0,
            source: SegmentSource::Audio(audio),
            start_frame: 0,
            frames,
            feedback: 127,
            reverse: false,
            local_copy_left: 0,
            local_copy_right: 0,
            fade_left: false,
            fade_right: false,
        }
    }

    /// Copy of this segment's window state referencing the same layer.
    /// The caller increments the reference count.
    pub fn clone_window(&self) -> Option<Segment> {
        match &self.source {
            SegmentSource::Layer(id) => Some(Segment {
                offset: self.offset,
                source: SegmentSource::Layer(*id),
                start_frame: self.start_frame,
                frames: self.frames,
                feedback: self.feedback,
                reverse: self.reverse,
                local_copy_left: self.local_copy_left,
                local_copy_right: self.local_copy_right,
                fade_left: self.fade_left,
                fade_right: self.fade_right,
            }),
            SegmentSource::Audio(_) => {
                warn!("unable to clone segment audio");
                None
            }
        }
    }

    pub fn layer_id(&self) -> Option<LayerId> {
        match &self.source {
            SegmentSource::Layer(id) => Some(*id),
            SegmentSource::Audio(_) => None,
        }
    }

    /// Aligned with both the end of the owning layer and the end of the
    /// referenced content.
    pub fn is_at_end(&self, parent_frames: i64, referent_frames: i64) -> bool {
        self.offset + self.frames == parent_frames && self.start_frame + self.frames == referent_frames
    }

    pub fn is_at_start(&self) -> bool {
        self.offset == 0 && self.start_frame == 0
    }

    /// Truncate on the left, keeping the remainder at the same position
    /// within the owning layer. `copy` means the trimmed frames were
    /// flattened into local audio, so the edge may stop fading once the
    /// copied run covers the fade range.
    pub fn trim_left(&mut self, frames: i64, copy: bool) {
        self.offset += frames;
        self.start_frame += frames;
        self.frames -= frames;
        if copy {
            self.local_copy_left += frames;
            if self.local_copy_left >= FADE_RANGE as i64 {
                self.fade_left = false;
            }
        } else {
            self.local_copy_left = 0;
            self.fade_left = true;
        }
    }

    /// Truncate on the right, keeping the same position.
    pub fn trim_right(&mut self, frames: i64, copy: bool) {
        self.frames -= frames;
        if copy {
            self.local_copy_right += frames;
            if self.local_copy_right >= FADE_RANGE as i64 {
                self.fade_right = false;
            }
        } else {
            self.local_copy_right = 0;
            self.fade_right = true;
        }
    }

    /// Render `ctx.frames` frames of this segment starting at
    /// `start_frame` (segment-local, forward-addressed) into the context
    /// buffer, applying segment feedback and edge fades.
    pub fn get(&self, ctx: &mut LayerContext, start_frame: i64, layers: &LayerPool, play: bool) {
        let mut level = ctx.level;
        if self.feedback < 127 {
            level *= fade::ramp128(self.feedback);
        }
        // past audibility, stop the traversal
        if level <= AUDIBLE_FLOOR {
            return;
        }

        let frames = ctx.frames;
        let samples = frames * CHANNELS;
        let real_start = start_frame + self.start_frame;
        let last_frame = start_frame + frames as i64 - 1;
        let fade_range = FADE_RANGE as i64;

        // reverse direction applies to the referent as well
        let reverse = ctx.reverse != self.reverse;

        let mut fade_left = false;
        let mut fade_right = false;
        let mut left_fade_range = 0;
        let mut right_fade_range = 0;

        if self.fade_left {
            left_fade_range = fade_range - self.local_copy_left;
            if left_fade_range <= 0 {
                trace!("obsolete segment left fade");
            } else {
                fade_left = start_frame < left_fade_range;
            }
        }
        if self.fade_right {
            right_fade_range = fade_range - self.local_copy_right;
            if right_fade_range <= 0 {
                trace!("obsolete segment right fade");
            } else {
                fade_right = last_frame >= self.frames - right_fade_range;
            }
        }

        let mut temp = [0.0f32; MAX_RENDER_SAMPLES];
        let fading = fade_left || fade_right;
        {
            let target: &mut [f32] = if fading {
                &mut temp[..samples]
            } else {
                &mut ctx.buffer[..samples]
            };
            let mut child = LayerContext {
                buffer: target,
                frames,
                reverse,
                level,
            };
            match &self.source {
                SegmentSource::Layer(id) => {
                    // no reflection below the root; reflection happens
                    // once when the loop first addresses the play layer
                    layers.get_no_reflect(*id, &mut child, real_start, false, play);
                }
                SegmentSource::Audio(audio) => {
                    let audio_frame = if reverse {
                        real_start + frames as i64 - 1
                    } else {
                        real_start
                    };
                    let mut cursor = AudioCursor::new();
                    cursor.set_reverse(reverse);
                    cursor.set_frame(audio_frame);
                    cursor.get(audio, child.buffer, frames, child.level);
                }
            }
        }

        if fade_left {
            let mut up = true;
            let mut buffer_offset = 0usize;
            let mut fade_offset = start_frame + self.local_copy_left;
            let mut fade_frames = left_fade_range - start_frame;
            if fade_frames > frames as i64 {
                // close to the end of an interrupt, shorten the range
                fade_frames = frames as i64;
            }
            if reverse {
                up = false;
                buffer_offset = frames - fade_frames as usize;
                let last_fade_offset = fade_offset + fade_frames - 1;
                fade_offset = fade_range - last_fade_offset - 1;
            }
            trace!(buffer_offset, fade_offset, fade_frames, up, "segment left fade");
            fade::fade(
                &mut temp,
                CHANNELS,
                buffer_offset,
                fade_frames.max(0) as usize,
                fade_offset.max(0) as usize,
                up,
            );
        }

        if fade_right {
            let mut up = false;
            let mut buffer_offset = 0usize;
            let mut fade_offset = 0i64;
            let fade_out_start = self.frames - right_fade_range;
            if start_frame < fade_out_start {
                buffer_offset = (fade_out_start - start_frame) as usize;
            } else {
                // part of the fade was done in a previous buffer
                fade_offset = start_frame - fade_out_start;
            }
            let mut fade_frames = frames as i64 - buffer_offset as i64;
            if fade_frames > right_fade_range {
                fade_frames = right_fade_range;
            }
            if reverse {
                up = true;
                buffer_offset = 0;
                let last_fade_offset = fade_offset + fade_frames - 1;
                fade_offset = fade_range - last_fade_offset - 1;
            }
            trace!(buffer_offset, fade_offset, fade_frames, up, "segment right fade");
            fade::fade(
                &mut temp,
                CHANNELS,
                buffer_offset,
                fade_frames.max(0) as usize,
                fade_offset.max(0) as usize,
                up,
            );
        }

        if fading {
            for i in 0..samples {
                ctx.buffer[i] += temp[i];
            }
        }
    }
}
