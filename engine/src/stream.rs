//! Per-track stream state: latency bookkeeping on the input side, tail
//! capture and level smoothing on the output side.

use crate::audio::fade::{FADE_RANGE, ramp128};
use crate::audio::CHANNELS;
use crate::layer::{LayerContext, LayerId, LayerPool};

/// Input side of a track: frames recorded now landed in the device this
/// many frames ago.
#[derive(Debug, Clone)]
pub struct InputStream {
    pub latency: i64,
}

impl InputStream {
    pub fn new(latency: i64) -> Self {
        InputStream { latency }
    }
}

/// Output side of a track. Besides latency it owns the short fade used
/// to mask discontinuities: before an abrupt play change the caller
/// captures a faded copy of what would have played next, and the next
/// block mixes it on top of the new content.
pub struct OutputStream {
    pub latency: i64,
    tail: [f32; FADE_RANGE * CHANNELS],
    tail_frames: usize,
    tail_consumed: usize,
    /// Suppress the next fade bump: the layer changed but the content
    /// is identical at the seam.
    layer_shift: bool,
}

impl OutputStream {
    pub fn new(latency: i64) -> Self {
        OutputStream {
            latency,
            tail: [0.0; FADE_RANGE * CHANNELS],
            tail_frames: 0,
            tail_consumed: 0,
            layer_shift: false,
        }
    }

    pub fn set_layer_shift(&mut self, shift: bool) {
        self.layer_shift = shift;
    }

    pub fn is_layer_shift(&self) -> bool {
        self.layer_shift
    }

    /// Capture a fade-out of what the old play position would have
    /// produced next, to be mixed over the upcoming discontinuity.
    pub fn capture_tail(&mut self, layers: &LayerPool, layer: LayerId, frame: i64, reverse: bool, level: f32) {
        if self.layer_shift {
            // seam is continuous, nothing to mask
            self.layer_shift = false;
            return;
        }
        let Some(l) = layers.get(layer) else {
            return;
        };
        let loop_frames = l.frames();
        if loop_frames <= 0 {
            self.tail_frames = 0;
            return;
        }
        let mut buffer = [0.0f32; FADE_RANGE * CHANNELS];
        let count = FADE_RANGE.min(loop_frames as usize);
        // the region may wrap the loop point
        let mut rendered = 0usize;
        let mut at = frame.rem_euclid(loop_frames);
        while rendered < count {
            let chunk = ((loop_frames - at) as usize).min(count - rendered);
            let sub = &mut buffer[rendered * CHANNELS..(rendered + chunk) * CHANNELS];
            let mut ctx = LayerContext::new(sub, chunk);
            ctx.reverse = reverse;
            ctx.level = level;
            layers.render(layer, &mut ctx, at, true);
            rendered += chunk;
            at = (at + chunk as i64).rem_euclid(loop_frames);
        }
        for i in 0..count {
            let down = ramp128((FADE_RANGE - 1 - i) as u8);
            for ch in 0..CHANNELS {
                self.tail[i * CHANNELS + ch] = buffer[i * CHANNELS + ch] * down;
            }
        }
        self.tail_frames = count;
        self.tail_consumed = 0;
    }

    pub fn drop_tail(&mut self) {
        self.tail_frames = 0;
        self.tail_consumed = 0;
    }

    /// Mix any captured tail into the start of a fresh output block.
    pub fn mix_tail(&mut self, buffer: &mut [f32], frames: usize) {
        if self.tail_consumed >= self.tail_frames {
            return;
        }
        let remaining = self.tail_frames - self.tail_consumed;
        let count = remaining.min(frames);
        for i in 0..count {
            let src = (self.tail_consumed + i) * CHANNELS;
            for ch in 0..CHANNELS {
                if let Some(s) = buffer.get_mut(i * CHANNELS + ch) {
                    *s += self.tail[src + ch];
                }
            }
        }
        self.tail_consumed += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPool;
    use crate::layer::LayerContext;

    #[test]
    fn captured_tail_fades_out() {
        let audio_pool = AudioPool::with_ring_size(8);
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(4);
        let id = layers.alloc();
        let mut content = vec![1.0f32; 1000 * CHANNELS];
        let ctx = LayerContext::new(&mut content, 1000);
        layers.get_mut(id).unwrap().record(&ctx, 0, 127);

        let mut out = OutputStream::new(256);
        out.capture_tail(&layers, id, 0, false, 1.0);
        let mut block = vec![0.0f32; 64 * CHANNELS];
        out.mix_tail(&mut block, 64);
        // fading down from full level
        assert!(block[0] > 0.9);
        let mut second = vec![0.0f32; FADE_RANGE * CHANNELS];
        out.mix_tail(&mut second, FADE_RANGE);
        assert_eq!(second[(FADE_RANGE - 65) * CHANNELS], 0.0);
    }

    #[test]
    fn layer_shift_suppresses_capture() {
        let audio_pool = AudioPool::with_ring_size(8);
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(4);
        let id = layers.alloc();
        let mut out = OutputStream::new(256);
        out.set_layer_shift(true);
        out.capture_tail(&layers, id, 0, false, 1.0);
        let mut block = vec![0.0f32; 8 * CHANNELS];
        out.mix_tail(&mut block, 8);
        assert!(block.iter().all(|s| *s == 0.0));
    }
}
