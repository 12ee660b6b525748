//! One track: a loop, its event timeline, its streams and levels, and
//! the action queue feeding it from the engine task.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::audio::{CHANNELS, MAX_INTERRUPT_FRAMES};
use crate::config::EngineConfig;
use crate::event::EventManager;
use crate::functions::{self, Functions, LoopAction};
use crate::layer::LayerPool;
use crate::loops::{Loop, LoopServices};
use crate::mutex::UnsafeMutex;
use crate::stream::{InputStream, OutputStream};
use crate::sync::Synchronizer;

const ACTION_QUEUE_SIZE: usize = 32;

/// SPSC ring carrying actions from the engine task to the interrupt.
pub struct ActionQueue {
    slots: Box<[UnsafeMutex<Option<LoopAction>>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicUsize,
}

impl ActionQueue {
    pub fn new() -> Self {
        let slots = (0..ACTION_QUEUE_SIZE)
            .map(|_| UnsafeMutex::new(None))
            .collect::<Vec<_>>();
        ActionQueue {
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Producer side (engine task). Full queues drop the action.
    pub fn push(&self, action: LoopAction) {
        let head = self.head.load(Ordering::Relaxed);
        let mut next = head + 1;
        if next >= ACTION_QUEUE_SIZE {
            next = 0;
        }
        if next == self.tail.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("action queue overflow, dropping action");
            return;
        }
        *self.slots[head].lock() = Some(action);
        self.head.store(next, Ordering::Release);
    }

    /// Consumer side (interrupt).
    pub fn pop(&self) -> Option<LoopAction> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let action = self.slots[tail].lock().take();
        let mut next = tail + 1;
        if next >= ACTION_QUEUE_SIZE {
            next = 0;
        }
        self.tail.store(next, Ordering::Release);
        action
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Track {
    number: usize,
    name: String,
    pub lp: Loop,
    pub events: EventManager,
    pub input: InputStream,
    pub output: OutputStream,
    level: f32,
    pan: f32,
    pub input_port: usize,
    pub output_port: usize,
    /// Sync masters advance before ordinary tracks.
    pub priority: bool,
    actions: Arc<ActionQueue>,
    output_meter: f32,
}

impl Track {
    pub fn new(number: usize, name: String, config: &EngineConfig) -> Self {
        let setup = config.setup.tracks.get(number);
        let mut lp = Loop::new(number);
        lp.feedback = setup.map(|t| t.feedback).unwrap_or(127);
        Track {
            number,
            name,
            lp,
            events: EventManager::new(),
            input: InputStream::new(config.input_latency),
            output: OutputStream::new(config.output_latency),
            level: setup.map(|t| t.level).unwrap_or(1.0),
            pan: setup.map(|t| t.pan).unwrap_or(0.0),
            input_port: setup.map(|t| t.input_port).unwrap_or(0),
            output_port: setup.map(|t| t.output_port).unwrap_or(0),
            priority: config.setup.sync_master == Some(number),
            actions: Arc::new(ActionQueue::new()),
            output_meter: 0.0,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn name(&self) -> String {
        self.name.clone()
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn set_level(&mut self, level: f32) {
        self.level = level.clamp(0.0, 2.0);
    }

    pub fn pan(&self) -> f32 {
        self.pan
    }

    pub fn set_pan(&mut self, pan: f32) {
        self.pan = pan.clamp(-1.0, 1.0);
    }

    pub fn output_meter(&self) -> f32 {
        self.output_meter
    }

    /// Handle used by the engine task to queue actions.
    pub fn action_queue(&self) -> Arc<ActionQueue> {
        self.actions.clone()
    }

    pub fn set_feedback(&mut self, layers: &mut LayerPool, feedback: u8) {
        self.lp.feedback = feedback;
        if let Some(record) = self.lp.record_layer {
            layers.set_segment_feedback(record, feedback);
        }
    }

    /// One interrupt's worth of work for this track.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        layers: &mut LayerPool,
        sync: &mut Synchronizer,
        config: &EngineConfig,
        functions: &Functions,
        input: &[f32],
        output: &mut [f32],
        frames: usize,
    ) {
        let frames = frames.min(MAX_INTERRUPT_FRAMES);
        let mut s = LoopServices {
            layers,
            events: &mut self.events,
            sync,
            config,
            functions,
            input: &mut self.input,
            output: &mut self.output,
        };

        // actions queued since the last interrupt
        let queue = self.actions.clone();
        while let Some(action) = queue.pop() {
            let _ = functions::schedule(&mut self.lp, &mut s, &action);
        }

        // a sync pulse commits events that were waiting for it
        if s.sync.pulse_this_interrupt(config.preset.sync_unit) {
            s.events.activate_pending(self.lp.frame);
        }

        let mut scratch = [0.0f32; MAX_INTERRUPT_FRAMES * CHANNELS];
        let samples = frames * CHANNELS;
        self.lp.advance(&mut s, input, &mut scratch[..samples], frames);

        // track level and pan into the shared port buffer
        let left_gain = self.level * (1.0 - self.pan.max(0.0));
        let right_gain = self.level * (1.0 + self.pan.min(0.0));
        let mut peak = 0.0f32;
        for frame in 0..frames {
            let l = scratch[frame * CHANNELS] * left_gain;
            let r = scratch[frame * CHANNELS + 1] * right_gain;
            output[frame * CHANNELS] += l;
            output[frame * CHANNELS + 1] += r;
            peak = peak.max(l.abs()).max(r.abs());
        }
        self.output_meter = peak;
    }

    pub fn events_pending(&self) -> bool {
        self.events.has_scheduled()
    }

    pub fn reset(
        &mut self,
        layers: &mut LayerPool,
        sync: &mut Synchronizer,
        config: &EngineConfig,
        functions: &Functions,
    ) {
        let mut s = LoopServices {
            layers,
            events: &mut self.events,
            sync,
            config,
            functions,
            input: &mut self.input,
            output: &mut self.output,
        };
        self.lp.reset(&mut s);
        debug!(track = self.number, "track reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionId;

    #[test]
    fn action_queue_is_fifo_and_bounded() {
        let q = ActionQueue::new();
        for i in 0..ACTION_QUEUE_SIZE + 5 {
            q.push(LoopAction {
                function: FunctionId(i),
                down: true,
                args: Vec::new(),
            });
        }
        assert_eq!(q.dropped(), 6);
        let first = q.pop().unwrap();
        assert_eq!(first.function, FunctionId(0));
        let mut count = 1;
        while q.pop().is_some() {
            count += 1;
        }
        assert_eq!(count, ACTION_QUEUE_SIZE - 1);
    }
}
