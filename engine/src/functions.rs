//! The function catalogue: one descriptor per user action.
//!
//! A function is a value with behavior-bearing flags plus two entry
//! points: `schedule` places an [`Event`](crate::event::Event) on the
//! track timeline, `do_event` performs the state change when it fires.
//! Dispatch is a match over [`FunctionKind`]; the base scheduling path
//! (mode endings, quantization, latency, play jumps) is shared.

pub mod divide;
pub mod insert;
pub mod multiply;
pub mod mute;
pub mod record;
pub mod shuffle;
pub mod stutter;
pub mod undo;
pub mod window;

use tracing::{debug, trace};

use crate::config::QuantizeMode;
use crate::event::{EventArg, EventId, EventType, quantize_frame};
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteVariant {
    Toggle,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Record,
    Overdub,
    Multiply,
    InstantMultiply { multiple: u32 },
    Divide { multiple: u32 },
    Insert { sus: bool, unrounded: bool },
    Replace,
    Mute { variant: MuteVariant },
    Pause,
    GlobalMute,
    GlobalPause,
    Solo,
    Stutter { sus: bool },
    Shuffle,
    Window { edge: bool, start: bool, direction: i32 },
    Undo,
    Redo,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: &'static str,
    pub kind: FunctionKind,
    pub event_type: EventType,
    pub mode: Option<Mode>,
    pub quantized: bool,
    pub sustain: bool,
    pub may_sustain: bool,
    pub may_cancel_mute: bool,
    pub cancel_return: bool,
    pub instant: bool,
    pub switch_stack: bool,
    pub switch_stack_mutex: bool,
    pub global: bool,
    pub script_only: bool,
    pub long_function: Option<&'static str>,
}

impl Function {
    fn new(name: &'static str, kind: FunctionKind, event_type: EventType) -> Self {
        Function {
            id: FunctionId(0),
            name,
            kind,
            event_type,
            mode: None,
            quantized: false,
            sustain: false,
            may_sustain: false,
            may_cancel_mute: false,
            cancel_return: false,
            instant: false,
            switch_stack: false,
            switch_stack_mutex: false,
            global: false,
            script_only: false,
            long_function: None,
        }
    }
}

/// The registry. Built once at engine start; functions are addressed by
/// [`FunctionId`] or name.
pub struct Functions {
    all: Vec<Function>,
}

impl Functions {
    pub fn new() -> Self {
        let mut all = Vec::new();
        let mut add = |f: Function| {
            let mut f = f;
            f.id = FunctionId(all.len());
            all.push(f);
        };

        let mut record = Function::new("Record", FunctionKind::Record, EventType::Record);
        record.mode = Some(Mode::Record);
        record.may_sustain = true;
        record.may_cancel_mute = true;
        record.cancel_return = true;
        add(record);

        let mut overdub = Function::new("Overdub", FunctionKind::Overdub, EventType::Overdub);
        overdub.mode = Some(Mode::Overdub);
        overdub.quantized = true;
        overdub.may_sustain = true;
        overdub.may_cancel_mute = true;
        add(overdub);

        let mut multiply = Function::new("Multiply", FunctionKind::Multiply, EventType::Multiply);
        multiply.mode = Some(Mode::Multiply);
        multiply.quantized = true;
        multiply.may_sustain = true;
        multiply.may_cancel_mute = true;
        multiply.cancel_return = true;
        multiply.switch_stack = true;
        multiply.switch_stack_mutex = true;
        add(multiply);

        for multiple in [0u32, 3, 4] {
            let name = match multiple {
                3 => "InstantMultiply3",
                4 => "InstantMultiply4",
                _ => "InstantMultiply",
            };
            let mut f = Function::new(
                name,
                FunctionKind::InstantMultiply { multiple },
                EventType::InstantMultiply,
            );
            f.instant = true;
            f.cancel_return = true;
            add(f);
        }

        for multiple in [0u32, 3, 4] {
            let name = match multiple {
                3 => "Divide3",
                4 => "Divide4",
                _ => "Divide",
            };
            let mut f = Function::new(name, FunctionKind::Divide { multiple }, EventType::Divide);
            f.instant = true;
            f.cancel_return = true;
            f.may_cancel_mute = true;
            add(f);
        }

        let mut insert = Function::new(
            "Insert",
            FunctionKind::Insert { sus: false, unrounded: false },
            EventType::Insert,
        );
        insert.mode = Some(Mode::Insert);
        insert.quantized = true;
        insert.may_sustain = true;
        insert.may_cancel_mute = true;
        insert.cancel_return = true;
        insert.switch_stack = true;
        insert.switch_stack_mutex = true;
        add(insert);

        let mut sus_insert = Function::new(
            "SUSInsert",
            FunctionKind::Insert { sus: true, unrounded: false },
            EventType::Insert,
        );
        sus_insert.mode = Some(Mode::Insert);
        sus_insert.quantized = true;
        sus_insert.sustain = true;
        sus_insert.may_cancel_mute = true;
        sus_insert.cancel_return = true;
        add(sus_insert);

        let mut sus_uinsert = Function::new(
            "SUSUnroundedInsert",
            FunctionKind::Insert { sus: true, unrounded: true },
            EventType::Insert,
        );
        sus_uinsert.mode = Some(Mode::Insert);
        sus_uinsert.quantized = true;
        sus_uinsert.sustain = true;
        sus_uinsert.may_cancel_mute = true;
        sus_uinsert.cancel_return = true;
        add(sus_uinsert);

        let mut replace = Function::new("Replace", FunctionKind::Replace, EventType::Replace);
        replace.mode = Some(Mode::Replace);
        replace.quantized = true;
        replace.may_sustain = true;
        replace.may_cancel_mute = true;
        replace.cancel_return = true;
        add(replace);

        for (name, variant) in [
            ("Mute", MuteVariant::Toggle),
            ("MuteOn", MuteVariant::On),
            ("MuteOff", MuteVariant::Off),
        ] {
            let mut f = Function::new(name, FunctionKind::Mute { variant }, EventType::Mute);
            f.mode = Some(Mode::Mute);
            f.quantized = true;
            f.may_sustain = variant == MuteVariant::Toggle;
            f.cancel_return = true;
            add(f);
        }

        let mut pause = Function::new("Pause", FunctionKind::Pause, EventType::Pause);
        pause.mode = Some(Mode::Mute);
        pause.quantized = true;
        pause.cancel_return = true;
        add(pause);

        let mut global_mute = Function::new("GlobalMute", FunctionKind::GlobalMute, EventType::Mute);
        global_mute.global = true;
        add(global_mute);

        let mut global_pause = Function::new("GlobalPause", FunctionKind::GlobalPause, EventType::Pause);
        global_pause.global = true;
        add(global_pause);

        let mut solo = Function::new("Solo", FunctionKind::Solo, EventType::Mute);
        solo.global = true;
        add(solo);

        let mut stutter = Function::new("Stutter", FunctionKind::Stutter { sus: false }, EventType::Stutter);
        stutter.mode = Some(Mode::Stutter);
        stutter.quantized = true;
        stutter.may_sustain = true;
        stutter.may_cancel_mute = true;
        stutter.cancel_return = true;
        stutter.switch_stack = true;
        stutter.switch_stack_mutex = true;
        stutter.long_function = Some("SUSStutter");
        add(stutter);

        let mut sus_stutter = Function::new("SUSStutter", FunctionKind::Stutter { sus: true }, EventType::Stutter);
        sus_stutter.mode = Some(Mode::Stutter);
        sus_stutter.quantized = true;
        sus_stutter.sustain = true;
        sus_stutter.may_cancel_mute = true;
        sus_stutter.cancel_return = true;
        add(sus_stutter);

        let mut shuffle = Function::new("Shuffle", FunctionKind::Shuffle, EventType::Shuffle);
        shuffle.instant = true;
        shuffle.cancel_return = true;
        shuffle.may_cancel_mute = true;
        add(shuffle);

        for (name, edge, start, direction) in [
            ("WindowBackward", false, false, -1),
            ("WindowForward", false, false, 1),
            ("WindowStartBackward", true, true, -1),
            ("WindowStartForward", true, true, 1),
            ("WindowEndBackward", true, false, -1),
            ("WindowEndForward", true, false, 1),
            ("WindowMove", false, false, 0),
            ("WindowResize", true, false, 0),
        ] {
            let mut f = Function::new(
                name,
                FunctionKind::Window { edge, start, direction },
                EventType::Window,
            );
            f.instant = true;
            f.may_cancel_mute = true;
            add(f);
        }

        let mut undo = Function::new("Undo", FunctionKind::Undo, EventType::Undo);
        undo.instant = true;
        add(undo);

        let mut redo = Function::new("Redo", FunctionKind::Redo, EventType::Redo);
        redo.instant = true;
        add(redo);

        Functions { all }
    }

    pub fn get(&self, id: FunctionId) -> Option<&Function> {
        self.all.get(id.0)
    }

    pub fn by_name(&self, name: &str) -> Option<&Function> {
        self.all.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.all.iter()
    }
}

impl Default for Functions {
    fn default() -> Self {
        Self::new()
    }
}

/// One user action aimed at a loop.
#[derive(Debug, Clone)]
pub struct LoopAction {
    pub function: FunctionId,
    pub down: bool,
    pub args: Vec<EventArg>,
}

impl LoopAction {
    pub fn press(function: FunctionId) -> Self {
        LoopAction {
            function,
            down: true,
            args: Vec::new(),
        }
    }

    pub fn release(function: FunctionId) -> Self {
        LoopAction {
            function,
            down: false,
            args: Vec::new(),
        }
    }
}

/// Treat the function as sustained: either inherently, or named in the
/// preset's sustain-function list.
pub fn is_sustain(f: &Function, s: &LoopServices) -> bool {
    f.sustain || (f.may_sustain && s.config.preset.is_sustain_function(f.name))
}

/// Resolve an action to a scheduled event. Returns the event already on
/// the timeline, which scripts and tests may wait on.
pub fn schedule(lp: &mut Loop, s: &mut LoopServices, action: &LoopAction) -> Option<EventId> {
    let f = s.functions.get(action.function)?.clone();

    // an up transition of a non-sustained function is a no-op
    if !action.down && !is_sustain(&f, s) {
        return None;
    }

    match f.kind {
        FunctionKind::Record => record::schedule(lp, s, &f, action),
        FunctionKind::Overdub => default_schedule(lp, s, &f, action),
        FunctionKind::Multiply => multiply::schedule(lp, s, &f, action),
        FunctionKind::Insert { .. } => insert::schedule(lp, s, &f, action),
        FunctionKind::Replace => insert::schedule_replace(lp, s, &f, action),
        FunctionKind::Stutter { .. } => stutter::schedule(lp, s, &f, action),
        FunctionKind::Mute { .. } | FunctionKind::Pause => mute::schedule(lp, s, &f, action),
        _ => default_schedule(lp, s, &f, action),
    }
}

/// Fire a scheduled event. Processed events are a no-op so replays are
/// harmless.
pub fn do_event(lp: &mut Loop, s: &mut LoopServices, id: EventId) {
    let Some(event) = s.events.get(id).cloned() else {
        return;
    };
    if event.processed {
        trace!("ignoring already processed event");
        return;
    }
    let kind = event
        .function
        .and_then(|f| s.functions.get(f))
        .map(|f| f.kind);

    match event.etype {
        EventType::JumpPlay => lp.do_jump(s, &event),
        EventType::Record | EventType::RecordStop => record::do_event(lp, s, &event),
        EventType::Overdub => record::do_overdub(lp, s, &event),
        EventType::Multiply | EventType::MultiplyEnd => multiply::do_event(lp, s, &event),
        EventType::InstantMultiply => multiply::do_instant(lp, s, &event),
        EventType::Divide => divide::do_event(lp, s, &event),
        EventType::Insert | EventType::InsertEnd => insert::do_event(lp, s, &event),
        EventType::Replace => insert::do_replace(lp, s, &event),
        EventType::Mute | EventType::Pause => mute::do_event(lp, s, &event),
        EventType::Stutter | EventType::StutterEnd => stutter::do_event(lp, s, &event),
        EventType::Shuffle => shuffle::do_event(lp, s, &event),
        EventType::Window => window::do_event(lp, s, &event),
        EventType::Undo => undo::do_undo(lp, s, &event),
        EventType::Redo => undo::do_redo(lp, s, &event),
        _ => {
            debug!(etype = ?event.etype, kind = ?kind, "unhandled event type");
        }
    }
    if let Some(e) = s.events.get_mut(id) {
        e.processed = true;
    }
}

/// The shared scheduling path: pick the target frame from the mode
/// ending or the quantization boundary, fall back to input latency,
/// and stamp the event.
pub fn default_schedule(
    lp: &mut Loop,
    s: &mut LoopServices,
    f: &Function,
    action: &LoopAction,
) -> Option<EventId> {
    let frame = schedule_frame(lp, s, f);
    let id = s.events.alloc(f.event_type);
    if let Some(e) = s.events.get_mut(id) {
        e.function = Some(f.id);
        e.invoking_function = Some(f.id);
        e.frame = frame;
        e.down = action.down;
        e.quantized = f.quantized && s.config.preset.quantize != QuantizeMode::Off;
        e.arguments = action.args.clone();
    }
    s.events.add(id);
    trace!(function = f.name, frame, "scheduled event");
    Some(id)
}

/// Target frame for a newly scheduled event.
pub fn schedule_frame(lp: &Loop, s: &LoopServices, f: &Function) -> i64 {
    if f.instant {
        return lp.frame;
    }
    let loop_frames = lp.loop_frames(s.layers);
    if f.quantized && s.config.preset.quantize != QuantizeMode::Off && loop_frames > 0 {
        quantize_frame(
            s.config.preset.quantize,
            lp.frame,
            loop_frames,
            lp.cycle_frames(s.layers),
            s.config.preset.subcycles,
        )
    } else {
        lp.frame + s.input.latency
    }
}

/// Attach a latency-compensated play jump to a primary event so the
/// audible switch coincides with the recorded switch.
pub fn schedule_play_jump(lp: &mut Loop, s: &mut LoopServices, parent: EventId) -> Option<EventId> {
    let parent_frame = s.events.get(parent)?.frame;
    let mut frame = parent_frame - s.output.latency - s.input.latency;
    if frame < lp.frame {
        // too late for a smooth switch; note the loss and fire now
        lp.latency_loss = lp.frame - frame;
        trace!(loss = lp.latency_loss, "play jump latency loss");
        frame = lp.frame;
    }
    let parent_function = s.events.get(parent).and_then(|p| p.function);
    let id = s.events.alloc(EventType::JumpPlay);
    if let Some(e) = s.events.get_mut(id) {
        e.frame = frame;
        e.function = parent_function;
    }
    s.events.add(id);
    s.events.attach_child(parent, id);
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioPool;
    use crate::config::EngineConfig;
    use crate::event::EventManager;
    use crate::layer::LayerPool;
    use crate::stream::{InputStream, OutputStream};
    use crate::sync::{MidiQueue, Synchronizer};
    use std::sync::Arc;

    #[test]
    fn catalogue_names_resolve() {
        let functions = Functions::new();
        for name in [
            "Record", "Overdub", "Multiply", "InstantMultiply4", "Divide4", "Insert",
            "SUSUnroundedInsert", "Replace", "Mute", "Pause", "GlobalMute", "GlobalPause",
            "Solo", "Stutter", "Shuffle", "WindowBackward", "WindowResize", "Undo", "Redo",
        ] {
            let f = functions.by_name(name).unwrap();
            assert_eq!(f.name, name);
            assert_eq!(functions.get(f.id).unwrap().name, name);
        }
    }

    #[test]
    fn flags_follow_behavior() {
        let functions = Functions::new();
        assert!(functions.by_name("Shuffle").unwrap().instant);
        assert!(functions.by_name("Multiply").unwrap().quantized);
        assert!(functions.by_name("SUSStutter").unwrap().sustain);
        assert!(functions.by_name("GlobalMute").unwrap().global);
        assert_eq!(
            functions.by_name("Stutter").unwrap().long_function,
            Some("SUSStutter")
        );
    }

    #[test]
    fn processed_events_do_not_fire_twice() {
        let audio_pool = AudioPool::with_ring_size(8);
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(8);
        let mut events = EventManager::new();
        let mut sync = Synchronizer::new(Arc::new(MidiQueue::new()), 44_100);
        let config = EngineConfig::default();
        let functions = Functions::new();
        let mut input = InputStream::new(0);
        let mut output = OutputStream::new(0);
        let mut lp = Loop::new(0);
        let mut s = LoopServices {
            layers: &mut layers,
            events: &mut events,
            sync: &mut sync,
            config: &config,
            functions: &functions,
            input: &mut input,
            output: &mut output,
        };

        let overdub = functions.by_name("Overdub").unwrap().id;
        let id = schedule(&mut lp, &mut s, &LoopAction::press(overdub)).unwrap();
        // give the loop something to overdub into
        let layer = s.layers.alloc();
        lp.record_layer = Some(layer);

        do_event(&mut lp, &mut s, id);
        assert!(lp.overdub);
        // replaying a processed event changes nothing
        do_event(&mut lp, &mut s, id);
        assert!(lp.overdub);
    }
}
