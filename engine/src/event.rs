//! Frame-stamped scheduled actions.
//!
//! Every user action resolves to an [`Event`] placed on the track's
//! timeline. Primary events may carry child play-jump events that fire
//! earlier by the latency sum so the audible switch lines up with the
//! recorded switch. Events awaiting a sync pulse are `pending` and hold
//! no frame commitment until the synchronizer activates them.

use tracing::{error, trace, warn};

use crate::config::QuantizeMode;
use crate::functions::FunctionId;
use crate::layer::LayerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Record,
    RecordStop,
    Overdub,
    Multiply,
    MultiplyEnd,
    InstantMultiply,
    Divide,
    Insert,
    InsertEnd,
    Replace,
    Mute,
    Pause,
    Stutter,
    StutterEnd,
    Shuffle,
    Window,
    JumpPlay,
    Sync,
    Undo,
    Redo,
    Validate,
}

/// Variadic argument passed through from an action; shuffle patterns
/// nest lists and strings.
#[derive(Debug, Clone, PartialEq)]
pub enum EventArg {
    Int(i64),
    Float(f32),
    Str(String),
    List(Vec<EventArg>),
}

impl EventArg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EventArg::Int(i) => Some(*i),
            EventArg::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            EventArg::Int(i) => Some(*i as f32),
            EventArg::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// Output-side state a play jump applies when it fires.
#[derive(Debug, Clone, Default)]
pub struct JumpContext {
    pub layer: Option<LayerId>,
    pub frame: i64,
    pub mute: bool,
    pub unmute: bool,
    /// Frame already accounts for latency loss.
    pub latency_loss_override: bool,
}

#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    seq: u64,
    scheduled: bool,
    pooled: bool,
    pub etype: EventType,
    pub function: Option<FunctionId>,
    pub invoking_function: Option<FunctionId>,
    pub frame: i64,
    pub down: bool,
    pub pending: bool,
    pub reschedule: bool,
    pub after_loop: bool,
    pub processed: bool,
    pub quantized: bool,
    pub arguments: Vec<EventArg>,
    pub parent: Option<EventId>,
    pub children: Vec<EventId>,
    pub jump: JumpContext,
}

impl Event {
    fn new(id: EventId) -> Self {
        Event {
            id,
            seq: 0,
            scheduled: false,
            pooled: true,
            etype: EventType::Validate,
            function: None,
            invoking_function: None,
            frame: 0,
            down: true,
            pending: false,
            reschedule: false,
            after_loop: false,
            processed: false,
            quantized: false,
            arguments: Vec::new(),
            parent: None,
            children: Vec::new(),
            jump: JumpContext::default(),
        }
    }

    fn reset(&mut self, etype: EventType, seq: u64) {
        self.seq = seq;
        self.scheduled = false;
        self.etype = etype;
        self.function = None;
        self.invoking_function = None;
        self.frame = 0;
        self.down = true;
        self.pending = false;
        self.reschedule = false;
        self.after_loop = false;
        self.processed = false;
        self.quantized = false;
        self.arguments.clear();
        self.parent = None;
        self.children.clear();
        self.jump = JumpContext::default();
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn int_argument(&self) -> Option<i64> {
        self.arguments.first().and_then(|a| a.as_int())
    }
}

/// Owns all events of one track in a recycled slab; scheduling,
/// ordering and quantization live here.
pub struct EventManager {
    slab: Vec<Event>,
    free: Vec<usize>,
    seq: u64,
}

impl EventManager {
    pub fn new() -> Self {
        let mut manager = EventManager {
            slab: Vec::new(),
            free: Vec::new(),
            seq: 0,
        };
        manager.prime(32);
        manager
    }

    fn prime(&mut self, count: usize) {
        for _ in 0..count {
            let id = self.slab.len();
            self.slab.push(Event::new(EventId(id)));
            self.free.push(id);
        }
    }

    pub fn alloc(&mut self, etype: EventType) -> EventId {
        self.seq += 1;
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                trace!("event pool empty, growing");
                let id = self.slab.len();
                self.slab.push(Event::new(EventId(id)));
                id
            }
        };
        let seq = self.seq;
        let event = &mut self.slab[id];
        event.reset(etype, seq);
        event.pooled = false;
        EventId(id)
    }

    pub fn get(&self, id: EventId) -> Option<&Event> {
        self.slab.get(id.0).filter(|e| !e.pooled)
    }

    pub fn get_mut(&mut self, id: EventId) -> Option<&mut Event> {
        self.slab.get_mut(id.0).filter(|e| !e.pooled)
    }

    /// Put an event on the timeline.
    pub fn add(&mut self, id: EventId) {
        if let Some(event) = self.get_mut(id) {
            event.scheduled = true;
        }
    }

    /// Take an event off the timeline without freeing it.
    pub fn remove(&mut self, id: EventId) {
        if let Some(event) = self.get_mut(id) {
            event.scheduled = false;
        }
    }

    /// Release an event and its children back to the pool.
    pub fn free(&mut self, id: EventId) {
        let Some(event) = self.get_mut(id) else {
            return;
        };
        if event.pooled {
            error!("double free of event");
            return;
        }
        let children = std::mem::take(&mut event.children);
        event.scheduled = false;
        event.pooled = true;
        self.free.push(id.0);
        for child in children {
            if let Some(c) = self.get(child) {
                if !c.processed {
                    warn!("freeing event with unprocessed child");
                }
            }
            self.free(child);
        }
    }

    pub fn attach_child(&mut self, parent: EventId, child: EventId) {
        if let Some(c) = self.get_mut(child) {
            c.parent = Some(parent);
        }
        if let Some(p) = self.get_mut(parent) {
            p.children.push(child);
        }
    }

    /// First scheduled event of a type, in creation order.
    pub fn find(&self, etype: EventType) -> Option<EventId> {
        self.slab
            .iter()
            .filter(|e| !e.pooled && e.scheduled && e.etype == etype)
            .min_by_key(|e| e.seq)
            .map(|e| e.id)
    }

    pub fn find_child(&self, parent: EventId, etype: EventType) -> Option<EventId> {
        let children = self.get(parent).map(|e| e.children.clone()).unwrap_or_default();
        children
            .into_iter()
            .find(|c| self.get(*c).map(|e| e.etype == etype).unwrap_or(false))
    }

    /// Any scheduled, unprocessed event at all.
    pub fn has_scheduled(&self) -> bool {
        self.slab.iter().any(|e| !e.pooled && e.scheduled)
    }

    pub fn scheduled_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<&Event> = self.slab.iter().filter(|e| !e.pooled && e.scheduled).collect();
        ids.sort_by_key(|e| (e.frame, e.seq));
        ids.iter().map(|e| e.id).collect()
    }

    /// Next event due strictly before `limit`. Frame order; at equal
    /// frames a play jump precedes its parent, then creation order.
    pub fn next_due(&self, limit: i64) -> Option<EventId> {
        self.slab
            .iter()
            .filter(|e| !e.pooled && e.scheduled && !e.pending && !e.reschedule && e.frame < limit)
            .min_by_key(|e| (e.frame, e.etype != EventType::JumpPlay, e.seq))
            .map(|e| e.id)
    }

    /// Frame of the nearest schedulable event at or after `frame`, used
    /// to bound the advance chunk.
    pub fn next_frame(&self, frame: i64) -> Option<i64> {
        self.slab
            .iter()
            .filter(|e| !e.pooled && e.scheduled && !e.pending && !e.reschedule && e.frame >= frame)
            .map(|e| e.frame)
            .min()
    }

    /// The loop wrapped: re-base event frames into the new pass.
    pub fn shift(&mut self, loop_frames: i64) {
        for event in self.slab.iter_mut() {
            if !event.pooled && event.scheduled {
                event.frame -= loop_frames;
            }
        }
    }

    /// A sync pulse arrived: commit pending events to `frame`.
    pub fn activate_pending(&mut self, frame: i64) {
        let mut activated: Vec<(EventId, i64)> = Vec::new();
        for event in self.slab.iter_mut() {
            if !event.pooled && event.scheduled && event.pending {
                let old = event.frame;
                event.pending = false;
                event.frame = frame;
                activated.push((event.id, old));
                trace!(frame, "activated pending event");
            }
        }
        // children keep their latency offset relative to the parent
        for (id, old) in activated {
            let children = self.get(id).map(|e| e.children.clone()).unwrap_or_default();
            for child in children {
                if let Some(c) = self.get_mut(child) {
                    c.frame = frame + (c.frame - old);
                }
            }
        }
    }

    /// Move an event (and its children, preserving offsets) to a new
    /// frame after the timeline changed under it.
    pub fn reschedule(&mut self, id: EventId, frame: i64) {
        let old = match self.get(id) {
            Some(e) => e.frame,
            None => return,
        };
        let delta = frame - old;
        if let Some(event) = self.get_mut(id) {
            event.frame = frame;
            event.reschedule = false;
        }
        let children = self.get(id).map(|e| e.children.clone()).unwrap_or_default();
        for child in children {
            if let Some(c) = self.get_mut(child) {
                c.frame += delta;
            }
        }
    }

    /// Flush everything scheduled, freeing as we go.
    pub fn flush(&mut self) {
        let ids: Vec<EventId> = self
            .slab
            .iter()
            .filter(|e| !e.pooled && e.scheduled && e.parent.is_none())
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.free(id);
        }
        // orphans whose parent already left
        let orphans: Vec<EventId> = self
            .slab
            .iter()
            .filter(|e| !e.pooled && e.scheduled)
            .map(|e| e.id)
            .collect();
        for id in orphans {
            self.free(id);
        }
    }

}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Next quantization boundary strictly after `frame`.
pub fn quantize_frame(
    quantize: QuantizeMode,
    frame: i64,
    loop_frames: i64,
    cycle_frames: i64,
    subcycles: u32,
) -> i64 {
    if loop_frames <= 0 {
        return frame;
    }
    let unit = match quantize {
        QuantizeMode::Off => return frame,
        QuantizeMode::Loop => loop_frames,
        QuantizeMode::Cycle => cycle_frames.max(1),
        QuantizeMode::Subcycle => {
            let sub = cycle_frames / subcycles.max(1) as i64;
            sub.max(1)
        }
    };
    (frame / unit + 1) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fire_in_frame_order() {
        let mut em = EventManager::new();
        let late = em.alloc(EventType::Overdub);
        em.get_mut(late).unwrap().frame = 500;
        em.add(late);
        let early = em.alloc(EventType::Mute);
        em.get_mut(early).unwrap().frame = 100;
        em.add(early);
        assert_eq!(em.next_due(1000), Some(early));
        em.free(early);
        assert_eq!(em.next_due(1000), Some(late));
        assert_eq!(em.next_due(400), None);
    }

    #[test]
    fn jump_precedes_parent_at_equal_frame() {
        let mut em = EventManager::new();
        let parent = em.alloc(EventType::Mute);
        em.get_mut(parent).unwrap().frame = 256;
        em.add(parent);
        let jump = em.alloc(EventType::JumpPlay);
        em.get_mut(jump).unwrap().frame = 256;
        em.add(jump);
        em.attach_child(parent, jump);
        assert_eq!(em.next_due(1000), Some(jump));
    }

    #[test]
    fn pending_events_wait_for_activation() {
        let mut em = EventManager::new();
        let id = em.alloc(EventType::RecordStop);
        {
            let e = em.get_mut(id).unwrap();
            e.pending = true;
            e.frame = 0;
        }
        em.add(id);
        assert_eq!(em.next_due(i64::MAX), None);
        em.activate_pending(4096);
        assert_eq!(em.get(id).unwrap().frame, 4096);
        assert_eq!(em.next_due(i64::MAX), Some(id));
    }

    #[test]
    fn freeing_parent_frees_children() {
        let mut em = EventManager::new();
        let parent = em.alloc(EventType::Insert);
        em.add(parent);
        let jump = em.alloc(EventType::JumpPlay);
        em.add(jump);
        em.attach_child(parent, jump);
        em.get_mut(jump).unwrap().processed = true;
        em.free(parent);
        assert!(em.get(parent).is_none());
        assert!(em.get(jump).is_none());
        assert!(!em.has_scheduled());
    }

    #[test]
    fn shift_rebases_frames() {
        let mut em = EventManager::new();
        let id = em.alloc(EventType::MultiplyEnd);
        em.get_mut(id).unwrap().frame = 1200;
        em.add(id);
        em.shift(1000);
        assert_eq!(em.get(id).unwrap().frame, 200);
    }

    #[test]
    fn quantize_boundaries() {
        // 4 cycles of 1000 frames, 4 subcycles each
        let q = |mode, frame| quantize_frame(mode, frame, 4000, 1000, 4);
        assert_eq!(q(QuantizeMode::Off, 130), 130);
        assert_eq!(q(QuantizeMode::Subcycle, 130), 250);
        assert_eq!(q(QuantizeMode::Cycle, 130), 1000);
        assert_eq!(q(QuantizeMode::Loop, 130), 4000);
        // already on a boundary moves to the next one
        assert_eq!(q(QuantizeMode::Cycle, 1000), 2000);
    }
}
