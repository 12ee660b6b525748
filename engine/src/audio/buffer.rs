//! Pooled sample storage blocks.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use crate::pool::{ObjectPool, PoolConfig, Pooled};

/// Frames in one storage block; about 1.4 seconds of stereo at 44.1 kHz.
pub const FRAMES_PER_BUFFER: usize = 64 * 1024;

/// Channels per frame. Stereo throughout.
pub const CHANNELS: usize = 2;

/// Samples in one storage block.
pub const BUFFER_SAMPLES: usize = FRAMES_PER_BUFFER * CHANNELS;

/// One fixed-size block of float samples, always pool-owned.
pub struct SampleBuffer {
    pooled: bool,
    dirty: bool,
    samples: Vec<f32>,
}

impl SampleBuffer {
    fn new() -> Self {
        SampleBuffer {
            pooled: false,
            dirty: false,
            samples: vec![0.0; BUFFER_SAMPLES],
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [f32] {
        &mut self.samples
    }

    pub fn zero(&mut self) {
        self.samples.fill(0.0);
        self.dirty = false;
    }

    pub fn zero_range(&mut self, start: usize, len: usize) {
        let end = (start + len).min(BUFFER_SAMPLES);
        if start < end {
            self.samples[start..end].fill(0.0);
        }
    }
}

impl Pooled for SampleBuffer {
    fn is_pooled(&self) -> bool {
        self.pooled
    }

    fn set_pooled(&mut self, pooled: bool) {
        self.pooled = pooled;
        if pooled {
            self.dirty = true;
        }
    }

    fn recycle(&mut self) {
        self.zero();
    }
}

/// Pool of [`SampleBuffer`] blocks. Buffers released by the interrupt go
/// through the free ring so the maintenance task zeroes them off the
/// audio thread.
#[derive(Clone)]
pub struct AudioPool {
    inner: Arc<ObjectPool<SampleBuffer>>,
}

impl AudioPool {
    pub fn new() -> Self {
        Self::with_ring_size(crate::pool::DEFAULT_RING_SIZE)
    }

    pub fn with_ring_size(ring_size: usize) -> Self {
        let mut config = PoolConfig::new("audio");
        config.ring_size = ring_size;
        config.warning = ring_size / 2;
        config.list_first = false;
        config.spill_threshold = ring_size;
        AudioPool {
            inner: Arc::new(ObjectPool::new(config, SampleBuffer::new)),
        }
    }

    /// Fill the allocation ring. Maintenance side; also used to prime
    /// the pool before the stream starts.
    pub fn maintain(&self) {
        self.inner.maintain();
    }

    pub fn maintenance_wanted(&self) -> bool {
        self.inner.maintenance_wanted()
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.inner.notifier()
    }

    pub fn starvation_count(&self) -> usize {
        self.inner.starvation_count()
    }

    /// Interrupt side. The returned buffer is silent.
    pub fn alloc_buffer(&self) -> Box<SampleBuffer> {
        let mut buffer = self.inner.alloc();
        if buffer.dirty {
            // only on the free-ring overflow path; maintenance normally
            // zeroes buffers before they reach the allocation ring
            trace!("zeroing dirty buffer on the interrupt path");
            buffer.zero();
        }
        buffer
    }

    /// Interrupt side.
    pub fn free_buffer(&self, buffer: Box<SampleBuffer>) {
        self.inner.free(buffer);
    }
}

impl Default for AudioPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_come_back_silent() {
        let pool = AudioPool::with_ring_size(4);
        pool.maintain();
        let mut buffer = pool.alloc_buffer();
        buffer.samples_mut()[0] = 0.7;
        buffer.samples_mut()[BUFFER_SAMPLES - 1] = -0.3;
        pool.free_buffer(buffer);
        pool.maintain();
        for _ in 0..4 {
            let buffer = pool.alloc_buffer();
            assert_eq!(buffer.samples()[0], 0.0);
            assert_eq!(buffer.samples()[BUFFER_SAMPLES - 1], 0.0);
            pool.free_buffer(buffer);
        }
    }
}
