//! Sparse, logically addressed float PCM storage.
//!
//! An [`Audio`] is a logical interval of stereo frames backed by an index
//! of fixed-size pooled buffers. Index entries may be absent; absent
//! regions read as silence. `start_frame` is the absolute offset into the
//! buffer index where logical frame zero lies, which lets the content be
//! trimmed on the left or extended leftward during reverse recording
//! without moving samples.

pub mod buffer;
pub mod cursor;
pub mod fade;

use std::path::Path;

use tracing::{debug, warn};
use wavers::Wav;
use wavers::write as write_wav;

pub use buffer::{AudioPool, BUFFER_SAMPLES, CHANNELS, FRAMES_PER_BUFFER, SampleBuffer};
pub use cursor::{AudioCursor, SampleOp};
pub use fade::{AUDIBLE_FLOOR, FADE_RANGE, Fade, FadeWindow};

/// Default sample rate; the engine runs at a single fixed rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Largest number of frames one device interrupt may deliver.
pub const MAX_INTERRUPT_FRAMES: usize = 4096;

/// Index slots reserved when an Audio first allocates; roughly a minute.
const INITIAL_INDEX: usize = 60;

/// Buffers of slack reserved before logical zero so short reverse
/// extensions do not have to regrow the index.
const INITIAL_SLACK_BUFFERS: i64 = 10;

/// WAV sample format for saved loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum WriteFormat {
    #[default]
    Float32,
    Pcm16,
}

pub struct Audio {
    pool: AudioPool,
    sample_rate: u32,
    buffer_size: usize,
    buffers: Vec<Option<Box<SampleBuffer>>>,
    start_frame: i64,
    frames: i64,
}

impl Audio {
    pub fn new(pool: &AudioPool) -> Self {
        Audio {
            pool: pool.clone(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: BUFFER_SAMPLES,
            buffers: Vec::new(),
            start_frame: 0,
            frames: 0,
        }
    }

    pub fn pool_handle(&self) -> AudioPool {
        self.pool.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.sample_rate = rate;
    }

    pub fn channels(&self) -> usize {
        CHANNELS
    }

    pub fn frames(&self) -> i64 {
        self.frames
    }

    pub fn samples(&self) -> i64 {
        self.frames * CHANNELS as i64
    }

    pub fn start_frame(&self) -> i64 {
        self.start_frame
    }

    /// True when no buffer holds content. A sized Audio full of silence
    /// is still empty.
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.is_none())
    }

    /// Release all buffers and clear the frame range.
    pub fn reset(&mut self) {
        self.free_buffers();
        self.buffers.clear();
    }

    /// Silence the content but keep the frame counter.
    pub fn zero(&mut self) {
        for slot in self.buffers.iter_mut() {
            if let Some(buffer) = slot.take() {
                self.pool.free_buffer(buffer);
            }
        }
    }

    fn free_buffers(&mut self) {
        for slot in self.buffers.iter_mut() {
            if let Some(buffer) = slot.take() {
                self.pool.free_buffer(buffer);
            }
        }
        self.start_frame = 0;
        self.frames = 0;
    }

    /// Buffer index and sample offset of a logical frame.
    fn locate(&self, frame: i64) -> (i64, usize) {
        let absolute = frame + self.start_frame;
        let sample = absolute * CHANNELS as i64;
        let index = sample.div_euclid(self.buffer_size as i64);
        let offset = sample.rem_euclid(self.buffer_size as i64) as usize;
        (index, offset)
    }

    fn init_index(&mut self) {
        if self.buffers.is_empty() {
            self.buffers.resize_with(INITIAL_INDEX, || None);
            self.start_frame = FRAMES_PER_BUFFER as i64 * INITIAL_SLACK_BUFFERS;
        }
    }

    /// Extend the index. `up` grows on the left (reverse extension) and
    /// shifts existing content toward higher indexes; otherwise the
    /// index grows on the right.
    fn grow_index(&mut self, count: usize, up: bool) {
        if count == 0 {
            return;
        }
        if up {
            let mut grown: Vec<Option<Box<SampleBuffer>>> = Vec::with_capacity(self.buffers.len() + count);
            grown.resize_with(count, || None);
            grown.append(&mut self.buffers);
            self.buffers = grown;
            self.start_frame += (count * FRAMES_PER_BUFFER) as i64;
        } else {
            self.buffers.resize_with(self.buffers.len() + count, || None);
        }
    }

    fn prepare_index(&mut self, index: i64) {
        self.init_index();
        if index >= self.buffers.len() as i64 {
            // always add a few extra
            let count = (index - self.buffers.len() as i64 + 1) as usize + 10;
            self.grow_index(count, false);
        }
    }

    fn buffer(&self, index: i64) -> Option<&SampleBuffer> {
        if index < 0 || index >= self.buffers.len() as i64 {
            return None;
        }
        self.buffers[index as usize].as_deref()
    }

    fn alloc_buffer_at(&mut self, index: i64) -> &mut SampleBuffer {
        self.prepare_index(index);
        let pool = &self.pool;
        self.buffers[index as usize]
            .get_or_insert_with(|| pool.alloc_buffer())
            .as_mut()
    }

    /// Prepare a frame for writing: allocate its buffer, extending the
    /// index and range as needed. Negative frames extend on the left.
    /// Returns the (possibly re-based) frame plus its buffer location.
    pub fn prepare_frame(&mut self, frame: i64) -> (i64, i64, usize) {
        self.init_index();
        let frame = if frame >= 0 {
            if frame >= self.frames {
                self.frames = frame + 1;
            }
            frame
        } else {
            // set_start_frame does the heavy lifting; the resulting
            // relative frame is always zero
            self.set_start_frame(self.start_frame + frame);
            0
        };
        let (index, offset) = self.locate(frame);
        self.alloc_buffer_at(index);
        (frame, index, offset)
    }

    /// Set the logical length, truncating on the right. Freed buffers
    /// return to the pool; the partially covered boundary buffer is
    /// zeroed past the new end.
    pub fn set_frames(&mut self, frames: i64) {
        let mut frames = frames;
        if frames < 0 {
            warn!("negative frame count collapsed to zero");
            frames = 0;
        }
        if frames < self.frames && !self.buffers.is_empty() {
            let (index, offset) = self.locate(frames);
            if index >= 0 && index < self.buffers.len() as i64 {
                if let Some(buffer) = self.buffers[index as usize].as_deref_mut() {
                    buffer.zero_range(offset, BUFFER_SAMPLES - offset);
                }
                let (mut last, _) = self.locate(self.frames);
                if last >= self.buffers.len() as i64 {
                    last = self.buffers.len() as i64 - 1;
                }
                for i in (index + 1)..=last {
                    if let Some(buffer) = self.buffers[i as usize].take() {
                        self.pool.free_buffer(buffer);
                    }
                }
            }
        }
        self.frames = frames;
    }

    /// Set the length while recording in reverse: the content keeps its
    /// ending position and the start moves left.
    pub fn set_frames_reverse(&mut self, frames: i64) {
        let extension = frames - self.frames;
        let new_start = self.start_frame - extension;
        self.set_start_frame(new_start);
        self.frames = frames;
    }

    /// Set the absolute start frame. Moving right truncates on the left
    /// (zeroing the prefix of the boundary buffer, freeing earlier
    /// buffers); moving left extends. A negative target regrows the
    /// index upward so the stored start stays non-negative.
    pub fn set_start_frame(&mut self, frame: i64) {
        self.init_index();
        if frame >= 0 {
            if frame <= self.start_frame {
                // extension on the left within the current index
                self.frames += self.start_frame - frame;
                self.start_frame = frame;
            } else {
                // truncation on the left
                let mut frame = frame;
                let end_frame = self.start_frame + self.frames - 1;
                if frame > end_frame {
                    debug!("start frame beyond content, collapsing to zero length");
                    frame = end_frame + 1;
                }
                let relative = frame - self.start_frame;
                let (index, offset) = self.locate(relative);
                if index >= 0 && index < self.buffers.len() as i64 {
                    if let Some(buffer) = self.buffers[index as usize].as_deref_mut() {
                        buffer.zero_range(0, offset);
                    }
                    let (first, _) = self.locate(0);
                    let last = (index - 1).min(self.buffers.len() as i64 - 1);
                    for i in first.max(0)..=last {
                        if let Some(buffer) = self.buffers[i as usize].take() {
                            self.pool.free_buffer(buffer);
                        }
                    }
                }
                self.start_frame = frame;
                self.frames = (self.frames - relative).max(0);
            }
        } else {
            // index extension on the left; keep the stored start frame
            // non-negative by growing the index upward
            let need_frames = -frame;
            let need_samples = need_frames * CHANNELS as i64;
            let mut need_buffers = need_samples / self.buffer_size as i64;
            if need_samples % self.buffer_size as i64 > 0 {
                need_buffers += 1;
            }
            // in reverse, so add slack to avoid growing one at a time
            need_buffers += 10;

            let old_start = self.start_frame;
            self.grow_index(need_buffers as usize, true);
            let added = self.start_frame - old_start;
            self.start_frame = frame + added;
            self.frames += old_start - frame;
            debug!(buffers = need_buffers, "extended audio index on the left");
        }
    }

    /// Logically splice out a section of frames.
    pub fn splice(&mut self, frame: i64, length: i64) {
        self.set_start_frame(self.start_frame + frame);
        self.set_frames(length);
    }

    /// One sample, silence outside the allocated range.
    pub fn sample(&self, frame: i64, channel: usize) -> f32 {
        if frame < 0 || channel >= CHANNELS {
            return 0.0;
        }
        let (index, offset) = self.locate(frame);
        match self.buffer(index) {
            Some(buffer) => buffer.samples()[offset + channel],
            None => 0.0,
        }
    }

    /// Add into one sample, allocating its buffer if needed.
    pub fn add_sample(&mut self, frame: i64, channel: usize, delta: f32) {
        if frame < 0 || channel >= CHANNELS {
            return;
        }
        let (_, index, offset) = self.prepare_frame(frame);
        let buffer = self.alloc_buffer_at(index);
        buffer.samples_mut()[offset + channel] += delta;
    }

    /// Mix `frames` frames starting at `frame` into `dest`, scaled by
    /// `level`. Out-of-range regions contribute silence.
    pub fn get(&self, dest: &mut [f32], frames: usize, frame: i64, level: f32) {
        let mut cursor = AudioCursor::new();
        cursor.set_frame(frame);
        cursor.get(self, dest, frames, level);
    }

    /// Sum `frames` frames from `src` into the content at `frame`,
    /// extending the range as needed.
    pub fn put(&mut self, src: &[f32], frames: usize, frame: i64) {
        let mut cursor = AudioCursor::new();
        cursor.set_auto_extend(true);
        cursor.set_frame(frame);
        cursor.put(self, src, frames, SampleOp::Add);
    }

    /// Append content (or silence when `src` is `None`) at the end.
    pub fn append(&mut self, src: Option<&[f32]>, frames: usize) {
        match src {
            Some(src) => {
                let at = self.frames;
                self.put(src, frames, at);
            }
            None => self.set_frames(self.frames + frames as i64),
        }
    }

    /// Replace this content with a feedback-scaled copy of `src`.
    pub fn copy_from(&mut self, src: &Audio, feedback: u8) {
        if src.buffer_size != self.buffer_size {
            warn!("mismatched audio buffer size, copy aborted");
            return;
        }
        self.reset();
        self.init_index();
        let modifier = fade::ramp128(feedback);
        for (i, slot) in src.buffers.iter().enumerate() {
            if let Some(source) = slot.as_deref() {
                let dest = self.alloc_buffer_at(i as i64);
                dest.samples_mut().copy_from_slice(source.samples());
                if feedback < 127 {
                    for s in dest.samples_mut() {
                        *s *= modifier;
                    }
                }
            }
        }
        self.start_frame = src.start_frame;
        self.frames = src.frames;
    }

    /// Scale all content by a feedback amount through the level ramp.
    pub fn apply_feedback(&mut self, feedback: u8) {
        if feedback >= 127 {
            return;
        }
        let modifier = fade::ramp128(feedback);
        for slot in self.buffers.iter_mut() {
            if let Some(buffer) = slot.as_deref_mut() {
                for s in buffer.samples_mut() {
                    *s *= modifier;
                }
            }
        }
    }

    /// Fade the edges of a raw recording.
    pub fn fade_edges(&mut self) {
        let mut cursor = AudioCursor::new();
        cursor.fade_in(self);
        cursor.fade_out(self);
    }

    /// Write the content as a WAV file. Maintenance side only.
    pub fn write(&self, path: &Path, format: WriteFormat) -> Result<(), String> {
        let frames = self.frames.max(0) as usize;
        let mut samples = vec![0.0f32; frames * CHANNELS];
        for frame in 0..frames {
            for ch in 0..CHANNELS {
                samples[frame * CHANNELS + ch] = self.sample(frame as i64, ch);
            }
        }
        match format {
            WriteFormat::Float32 => {
                write_wav::<f32, _>(path, &samples, self.sample_rate as i32, CHANNELS as u16)
                    .map_err(|e| format!("failed to write {}: {e}", path.display()))
            }
            WriteFormat::Pcm16 => {
                let pcm: Vec<i16> = samples
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                    .collect();
                write_wav::<i16, _>(path, &pcm, self.sample_rate as i32, CHANNELS as u16)
                    .map_err(|e| format!("failed to write {}: {e}", path.display()))
            }
        }
    }

    /// Load a WAV file, replacing the content. Maintenance side only.
    pub fn read(&mut self, path: &Path) -> Result<(), String> {
        let mut wav = Wav::<f32>::from_path(path)
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
        let channels = wav.n_channels().max(1) as usize;
        if channels != CHANNELS {
            warn!(channels, "ignoring channel count in file");
        }
        let data: wavers::Samples<f32> = wav
            .read()
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        self.reset();
        self.init_index();
        self.sample_rate = wav.sample_rate() as u32;
        let frames = data.len() / channels;
        let mut interleaved = vec![0.0f32; frames * CHANNELS];
        for frame in 0..frames {
            for ch in 0..CHANNELS {
                let src = frame * channels + ch.min(channels - 1);
                interleaved[frame * CHANNELS + ch] = data[src];
            }
        }
        self.append(Some(&interleaved), frames);
        Ok(())
    }
}

impl Drop for Audio {
    fn drop(&mut self) {
        self.free_buffers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> AudioPool {
        let pool = AudioPool::with_ring_size(16);
        pool.maintain();
        pool
    }

    fn frame(value: f32) -> [f32; CHANNELS] {
        [value; CHANNELS]
    }

    #[test]
    fn samples_is_frames_times_channels() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.append(Some(&frame(0.5)), 1);
        audio.append(None, 99);
        assert_eq!(audio.frames(), 100);
        assert_eq!(audio.samples(), 100 * CHANNELS as i64);
    }

    #[test]
    fn out_of_range_reads_are_silent() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.append(Some(&frame(1.0)), 1);
        let mut dest = [0.0f32; CHANNELS];
        audio.get(&mut dest, 1, 5_000_000, 1.0);
        assert_eq!(dest, [0.0; CHANNELS]);
        assert_eq!(audio.sample(-1, 0), 0.0);
    }

    #[test]
    fn sparse_regions_read_as_silence() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        // write two frames far apart; the gap has no buffers
        audio.put(&frame(0.25), 1, 0);
        audio.put(&frame(0.75), 1, (FRAMES_PER_BUFFER * 3) as i64);
        assert_eq!(audio.sample(0, 0), 0.25);
        assert_eq!(audio.sample(FRAMES_PER_BUFFER as i64, 1), 0.0);
        assert_eq!(audio.sample((FRAMES_PER_BUFFER * 3) as i64, 0), 0.75);
    }

    #[test]
    fn set_frames_truncates_and_zeroes() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        let content = vec![0.5f32; 10 * CHANNELS];
        audio.put(&content, 10, 0);
        audio.set_frames(4);
        assert_eq!(audio.frames(), 4);
        assert_eq!(audio.sample(3, 0), 0.5);
        // truncated region was zeroed in place
        assert_eq!(audio.sample(5, 0), 0.0);
    }

    #[test]
    fn negative_set_frames_collapses_to_zero() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.append(Some(&frame(0.5)), 1);
        audio.set_frames(-5);
        assert_eq!(audio.frames(), 0);
    }

    #[test]
    fn left_trim_moves_logical_zero() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        let content: Vec<f32> = (0..10)
            .flat_map(|i| [i as f32, i as f32])
            .collect();
        audio.put(&content, 10, 0);
        audio.splice(4, 6);
        assert_eq!(audio.frames(), 6);
        assert_eq!(audio.sample(0, 0), 4.0);
        assert_eq!(audio.sample(5, 0), 9.0);
    }

    #[test]
    fn negative_prepare_extends_left() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.put(&frame(1.0), 1, 0);
        let before = audio.frames();
        audio.put(&frame(0.5), 1, -3);
        assert_eq!(audio.frames(), before + 3);
        assert_eq!(audio.sample(0, 0), 0.5);
        assert_eq!(audio.sample(3, 0), 1.0);
    }

    #[test]
    fn reverse_extension_past_index_start_regrows() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.put(&frame(1.0), 1, 0);
        // further left than the slack buffers reach
        let far = -(FRAMES_PER_BUFFER as i64 * (INITIAL_SLACK_BUFFERS + 2));
        audio.put(&frame(0.25), 1, far);
        assert!(audio.start_frame() >= 0);
        assert_eq!(audio.sample(0, 0), 0.25);
    }

    #[test]
    fn reset_returns_buffers_to_pool() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        audio.put(&frame(1.0), 1, 0);
        assert!(!audio.is_empty());
        audio.reset();
        assert!(audio.is_empty());
        assert_eq!(audio.frames(), 0);
    }

    #[test]
    fn copy_applies_feedback_ramp() {
        let pool = pool();
        let mut src = Audio::new(&pool);
        src.put(&frame(1.0), 1, 0);
        let mut dest = Audio::new(&pool);
        dest.copy_from(&src, 64);
        assert_eq!(dest.frames(), src.frames());
        let expected = fade::ramp128(64);
        assert!((dest.sample(0, 0) - expected).abs() < 1e-6);
    }

    #[test]
    fn wav_round_trip() {
        let pool = pool();
        let mut audio = Audio::new(&pool);
        let content: Vec<f32> = (0..64).flat_map(|i| [i as f32 / 64.0; CHANNELS]).collect();
        audio.put(&content, 64, 0);
        let path = std::env::temp_dir().join("ouro_audio_roundtrip.wav");
        audio.write(&path, WriteFormat::Float32).unwrap();
        let mut loaded = Audio::new(&pool);
        loaded.read(&path).unwrap();
        assert_eq!(loaded.frames(), 64);
        for i in 0..64 {
            assert!((loaded.sample(i, 0) - i as f32 / 64.0).abs() < 1e-6);
        }
        let _ = std::fs::remove_file(&path);
    }
}
