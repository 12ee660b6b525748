//! Fade ramps and deferred-fade capture windows.
//!
//! All level scaling in the engine goes through one 128-entry ramp:
//! feedback amounts, segment edge fades, and the short fades applied to
//! mask discontinuities. The ramp is quadratic, which reads as roughly
//! logarithmic loudness; index 64 is a comfortable "half".

use crate::audio::{Audio, CHANNELS};

/// Number of frames over which every edge fade operates.
pub const FADE_RANGE: usize = 128;

/// Ramp values below this are inaudible; rendering can stop early.
/// This is `ramp128(1)`, the smallest non-zero ramp entry.
pub const AUDIBLE_FLOOR: f32 = 0.000_062;

/// Level for a 0..=127 ramp index.
pub fn ramp128(index: u8) -> f32 {
    let i = index.min(127) as f32 / 127.0;
    i * i
}

/// Fade a region of an interleaved buffer in place.
///
/// `buffer_offset` is the first frame of `buffer` to touch, `frames` how
/// many to touch, and `fade_offset` where those frames sit within the
/// canonical fade range. `up` fades in, otherwise out.
pub fn fade(buffer: &mut [f32], channels: usize, buffer_offset: usize, frames: usize, fade_offset: usize, up: bool) {
    for i in 0..frames {
        let ramp_index = fade_offset + i;
        if ramp_index >= FADE_RANGE {
            break;
        }
        let mut level = ramp128(ramp_index as u8);
        if !up {
            level = ramp128((FADE_RANGE - 1 - ramp_index) as u8);
        }
        let sample = (buffer_offset + i) * channels;
        for ch in 0..channels {
            if let Some(s) = buffer.get_mut(sample + ch) {
                *s *= level;
            }
        }
    }
}

/// Transient fade state for smoothing a play resume. Armed with a
/// direction, it applies the next `FADE_RANGE` frames of ramp to
/// whatever passes through and then disarms itself.
#[derive(Debug, Default, Clone)]
pub struct Fade {
    enabled: bool,
    up: bool,
    offset: usize,
}

impl Fade {
    pub fn activate(&mut self, up: bool) {
        self.enabled = true;
        self.up = up;
        self.offset = 0;
    }

    pub fn cancel(&mut self) {
        self.enabled = false;
        self.offset = 0;
    }

    pub fn is_active(&self) -> bool {
        self.enabled
    }

    /// Apply the ramp to the start of `buffer`, advancing internal state.
    pub fn advance(&mut self, buffer: &mut [f32], channels: usize, frames: usize) {
        if !self.enabled {
            return;
        }
        let remaining = FADE_RANGE - self.offset;
        let count = frames.min(remaining);
        fade(buffer, channels, 0, count, self.offset, self.up);
        if !self.up {
            // everything after a completed fade-out is silence
            for s in buffer.iter_mut().skip(count * channels).take((frames - count) * channels) {
                *s = 0.0;
            }
        }
        self.offset += count;
        if self.offset >= FADE_RANGE {
            self.enabled = false;
            self.offset = 0;
        }
    }
}

/// Circular capture of the most recent `FADE_RANGE` frames written to one
/// edge of a layer. Edge fades are deferred until the loop point is
/// crossed; if the content turns out to be discontinuous, the captured
/// frames tell us exactly what to neutralize.
#[derive(Debug, Clone)]
pub struct FadeWindow {
    samples: [f32; FADE_RANGE * CHANNELS],
    cursor: usize,
    frames_added: usize,
}

impl Default for FadeWindow {
    fn default() -> Self {
        FadeWindow {
            samples: [0.0; FADE_RANGE * CHANNELS],
            cursor: 0,
            frames_added: 0,
        }
    }
}

impl FadeWindow {
    pub fn reset(&mut self) {
        self.samples = [0.0; FADE_RANGE * CHANNELS];
        self.cursor = 0;
        self.frames_added = 0;
    }

    pub fn is_full(&self) -> bool {
        self.frames_added >= FADE_RANGE
    }

    pub fn frames_added(&self) -> usize {
        self.frames_added
    }

    /// Append recorded frames, keeping only the trailing `FADE_RANGE`.
    pub fn add(&mut self, buffer: &[f32], frames: usize) {
        for frame in 0..frames {
            for ch in 0..CHANNELS {
                self.samples[self.cursor * CHANNELS + ch] = buffer
                    .get(frame * CHANNELS + ch)
                    .copied()
                    .unwrap_or(0.0);
            }
            self.cursor = (self.cursor + 1) % FADE_RANGE;
            self.frames_added += 1;
        }
    }

    /// Captured frames oldest-first.
    fn ordered(&self) -> [f32; FADE_RANGE * CHANNELS] {
        let mut out = [0.0; FADE_RANGE * CHANNELS];
        let start = if self.frames_added >= FADE_RANGE { self.cursor } else { 0 };
        for frame in 0..FADE_RANGE {
            let src = (start + frame) % FADE_RANGE;
            for ch in 0..CHANNELS {
                out[frame * CHANNELS + ch] = self.samples[src * CHANNELS + ch];
            }
        }
        out
    }

    /// Neutralize the captured head region of `audio`: the region was
    /// written unfaded, subtract what the ramp would have removed so the
    /// content ends up fading in from silence.
    pub fn apply_head(&self, audio: &mut Audio) {
        let captured = self.ordered();
        let frames = self.frames_added.min(FADE_RANGE);
        for i in 0..frames {
            let keep = ramp128(i as u8);
            for ch in 0..CHANNELS {
                let original = captured[i * CHANNELS + ch];
                let removed = original * (1.0 - keep);
                audio.add_sample(i as i64, ch, -removed);
            }
        }
    }

    /// Neutralize the captured tail region ending at `end_frame`
    /// (exclusive): the content ends up fading out to silence.
    pub fn apply_tail(&self, audio: &mut Audio, end_frame: i64) {
        let captured = self.ordered();
        let frames = self.frames_added.min(FADE_RANGE);
        let base = end_frame - frames as i64;
        for i in 0..frames {
            let keep = ramp128((FADE_RANGE - 1 - i) as u8);
            for ch in 0..CHANNELS {
                let original = captured[(FADE_RANGE - frames + i) * CHANNELS + ch];
                let removed = original * (1.0 - keep);
                audio.add_sample(base + i as i64, ch, -removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_endpoints() {
        assert_eq!(ramp128(0), 0.0);
        assert_eq!(ramp128(127), 1.0);
        assert!((ramp128(1) - AUDIBLE_FLOOR).abs() < 0.000_001);
    }

    #[test]
    fn ramp_monotonic() {
        for i in 1..128u8 {
            assert!(ramp128(i) > ramp128(i - 1));
        }
    }

    #[test]
    fn fade_in_silences_first_frame() {
        let mut buffer = vec![1.0f32; FADE_RANGE * 2];
        fade(&mut buffer, 2, 0, FADE_RANGE, 0, true);
        assert_eq!(buffer[0], 0.0);
        assert_eq!(buffer[1], 0.0);
        assert_eq!(buffer[(FADE_RANGE - 1) * 2], 1.0);
    }

    #[test]
    fn fade_out_silences_last_frame() {
        let mut buffer = vec![1.0f32; FADE_RANGE * 2];
        fade(&mut buffer, 2, 0, FADE_RANGE, 0, false);
        assert_eq!(buffer[0], 1.0);
        assert_eq!(buffer[(FADE_RANGE - 1) * 2], 0.0);
    }

    #[test]
    fn window_keeps_trailing_frames() {
        let mut w = FadeWindow::default();
        let chunk: Vec<f32> = (0..200 * CHANNELS).map(|i| i as f32).collect();
        w.add(&chunk, 200);
        assert!(w.is_full());
        let ordered = w.ordered();
        // oldest retained frame is frame 72 of the chunk
        assert_eq!(ordered[0], (72 * CHANNELS) as f32);
    }

    #[test]
    fn transient_fade_disarms() {
        let mut f = Fade::default();
        f.activate(true);
        let mut buffer = vec![1.0f32; FADE_RANGE * 2];
        f.advance(&mut buffer, 2, FADE_RANGE);
        assert!(!f.is_active());
        assert_eq!(buffer[0], 0.0);
    }
}
