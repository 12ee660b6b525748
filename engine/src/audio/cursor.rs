//! Positioned reader/writer over an [`Audio`].

use super::fade::{FADE_RANGE, ramp128};
use super::{Audio, CHANNELS};

/// How a write combines with existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOp {
    Add,
    Replace,
}

/// A cursor carries only position and direction; the audio it walks is
/// borrowed per call, so one cursor may serve several objects.
#[derive(Debug, Default, Clone)]
pub struct AudioCursor {
    frame: i64,
    reverse: bool,
    auto_extend: bool,
}

impl AudioCursor {
    pub fn new() -> Self {
        AudioCursor::default()
    }

    pub fn frame(&self) -> i64 {
        self.frame
    }

    pub fn set_frame(&mut self, frame: i64) {
        self.frame = frame;
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    pub fn set_reverse(&mut self, reverse: bool) {
        self.reverse = reverse;
    }

    pub fn set_auto_extend(&mut self, auto_extend: bool) {
        self.auto_extend = auto_extend;
    }

    /// Mix `frames` frames into `dest` scaled by `level`, advancing the
    /// cursor. In reverse the cursor decrements through the content.
    pub fn get(&mut self, audio: &Audio, dest: &mut [f32], frames: usize, level: f32) {
        if self.reverse {
            for i in 0..frames {
                let src = self.frame - i as i64;
                for ch in 0..CHANNELS {
                    if let Some(d) = dest.get_mut(i * CHANNELS + ch) {
                        *d += audio.sample(src, ch) * level;
                    }
                }
            }
            self.frame -= frames as i64;
        } else {
            for i in 0..frames {
                let src = self.frame + i as i64;
                for ch in 0..CHANNELS {
                    if let Some(d) = dest.get_mut(i * CHANNELS + ch) {
                        *d += audio.sample(src, ch) * level;
                    }
                }
            }
            self.frame += frames as i64;
        }
    }

    /// Write `frames` frames from `src`, advancing the cursor. Without
    /// auto-extend, frames outside the existing range are dropped.
    pub fn put(&mut self, audio: &mut Audio, src: &[f32], frames: usize, op: SampleOp) {
        for i in 0..frames {
            let target = if self.reverse {
                self.frame - i as i64
            } else {
                self.frame + i as i64
            };
            if !self.auto_extend && (target < 0 || target >= audio.frames()) {
                continue;
            }
            let (rebased, index, offset) = audio.prepare_frame(target);
            if rebased != target {
                // a left extension moved logical zero; everything we
                // already wrote shifted with it
                self.frame += rebased - target;
            }
            if let Some(buffer) = audio.buffers[index as usize].as_deref_mut() {
                let samples = buffer.samples_mut();
                for ch in 0..CHANNELS {
                    let value = src.get(i * CHANNELS + ch).copied().unwrap_or(0.0);
                    match op {
                        SampleOp::Add => samples[offset + ch] += value,
                        SampleOp::Replace => samples[offset + ch] = value,
                    }
                }
            }
        }
        if self.reverse {
            self.frame -= frames as i64;
        } else {
            self.frame += frames as i64;
        }
    }

    /// Ramp the first `FADE_RANGE` frames of the content up from silence.
    pub fn fade_in(&mut self, audio: &mut Audio) {
        let count = (FADE_RANGE as i64).min(audio.frames());
        for i in 0..count {
            let level = ramp128(i as u8);
            self.scale_frame(audio, i, level);
        }
    }

    /// Ramp the last `FADE_RANGE` frames of the content out to silence.
    pub fn fade_out(&mut self, audio: &mut Audio) {
        let count = (FADE_RANGE as i64).min(audio.frames());
        let base = audio.frames() - count;
        for i in 0..count {
            let level = ramp128((FADE_RANGE as i64 - 1 - i).max(0) as u8);
            self.scale_frame(audio, base + i, level);
        }
    }

    fn scale_frame(&self, audio: &mut Audio, frame: i64, level: f32) {
        let (index, offset) = audio.locate(frame);
        if index < 0 || index >= audio.buffers.len() as i64 {
            return;
        }
        if let Some(buffer) = audio.buffers[index as usize].as_deref_mut() {
            let samples = buffer.samples_mut();
            for ch in 0..CHANNELS {
                samples[offset + ch] *= level;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPool;

    fn audio() -> Audio {
        let pool = AudioPool::with_ring_size(8);
        pool.maintain();
        Audio::new(&pool)
    }

    fn ramp_content(frames: usize) -> Vec<f32> {
        (0..frames).flat_map(|i| [i as f32; CHANNELS]).collect()
    }

    #[test]
    fn get_mixes_at_level() {
        let mut audio = audio();
        audio.put(&ramp_content(8), 8, 0);
        let mut dest = vec![1.0f32; 8 * CHANNELS];
        let mut cursor = AudioCursor::new();
        cursor.get(&audio, &mut dest, 8, 0.5);
        assert_eq!(dest[0], 1.0);
        assert_eq!(dest[2], 1.5);
        assert_eq!(dest[14], 4.5);
        assert_eq!(cursor.frame(), 8);
    }

    #[test]
    fn reverse_get_decrements() {
        let mut audio = audio();
        audio.put(&ramp_content(8), 8, 0);
        let mut dest = vec![0.0f32; 4 * CHANNELS];
        let mut cursor = AudioCursor::new();
        cursor.set_reverse(true);
        cursor.set_frame(7);
        cursor.get(&audio, &mut dest, 4, 1.0);
        assert_eq!(dest[0], 7.0);
        assert_eq!(dest[CHANNELS], 6.0);
        assert_eq!(dest[3 * CHANNELS], 4.0);
        assert_eq!(cursor.frame(), 3);
    }

    #[test]
    fn put_without_extend_drops_outside() {
        let mut audio = audio();
        audio.put(&ramp_content(4), 4, 0);
        let mut cursor = AudioCursor::new();
        cursor.set_frame(2);
        cursor.put(&mut audio, &ramp_content(8), 8, SampleOp::Replace);
        assert_eq!(audio.frames(), 4);
        assert_eq!(audio.sample(3, 0), 1.0);
    }

    #[test]
    fn fades_shape_the_edges() {
        let mut audio = audio();
        let content = vec![1.0f32; 400 * CHANNELS];
        audio.put(&content, 400, 0);
        audio.fade_edges();
        assert_eq!(audio.sample(0, 0), 0.0);
        assert_eq!(audio.sample(200, 0), 1.0);
        assert_eq!(audio.sample(399, 0), 0.0);
        assert!(audio.sample(64, 0) < 1.0);
    }
}
