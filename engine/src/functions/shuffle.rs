//! Shuffle: cut the loop into granules and rebuild it from a pull
//! pattern.
//!
//! A pattern is a granule count followed by per-granule selectors:
//! integers pick a source granule (1-based, negative plays it in
//! reverse, zero leaves silence), `"r"` picks at random, `"u"` picks an
//! unused granule at random (silence once all are used), `"p"` repeats
//! the previous selection, `"e"` ends the result early. A selector may
//! also be a list of candidates, optionally `(granule probability)`
//! pairs; probabilities saturate at 1.0 and any remainder is split
//! across unweighted candidates. Patterns shorter than the source
//! repeat; longer patterns extend the loop.

use tracing::{debug, info, warn};

use crate::config::ShuffleMode;
use crate::event::EventArg;
use crate::layer::{LayerId, Segment};
use crate::loops::{Loop, LoopServices};

/// Upper bound on granules; should exceed any useful subcycle count.
pub const MAX_GRANULES: usize = 128;

const RANDOM_UNUSED: i64 = 1000;
const PREVIOUS: i64 = 1001;
const END: i64 = 1002;

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    if lp.record_layer.is_none() {
        debug!("shuffle with no loop");
        return;
    }
    // shift immediately so there is exactly one backing segment
    lp.shift(s, false);
    let Some(record) = lp.record_layer else {
        return;
    };
    let original_frames = s.layers.get(record).map(|l| l.frames()).unwrap_or(0);

    let shuffled = if event.arguments.len() > 1 {
        pattern_shuffle(s, record, &event.arguments)
    } else {
        let mut granules = s.config.preset.subcycles as i64;
        if let Some(arg) = event.int_argument() {
            if arg > 0 {
                granules = arg;
            }
        }
        let mode = s.config.preset.shuffle_mode;
        mode_shuffle(s, record, mode, granules)
    };
    if !shuffled {
        return;
    }

    let new_frames = s.layers.get(record).map(|l| l.frames()).unwrap_or(0);
    if new_frames != original_frames {
        if new_frames < original_frames {
            let wrapped = lp.wrap_frame(lp.frame, new_frames);
            if wrapped != lp.frame {
                debug!(from = lp.frame, to = wrapped, "shuffle wrapped loop frame");
                lp.frame = wrapped;
                lp.record_cursor = wrapped;
                lp.recalculate_play_frame(s);
            }
        }
        let cycles = s.layers.get(record).map(|l| l.cycles()).unwrap_or(1);
        s.sync.loop_resize(new_frames, cycles, false);
    }

    // and again so the shuffle can be undone right away
    lp.shift(s, true);
    lp.check_mute_cancel(s, event.function);
    lp.resume_play();
    info!(loop_number = lp.number(), frames = new_frames, "shuffle");
    lp.validate(s);
}

/// Preset-driven shuffle without an explicit pattern.
fn mode_shuffle(s: &mut LoopServices, record: LayerId, mode: ShuffleMode, granules: i64) -> bool {
    if granules > MAX_GRANULES as i64 {
        warn!(granules, "shuffle with too many granules");
        return false;
    }
    if granules <= 1 {
        return false;
    }
    let granules = granules as usize;
    let mut positions = vec![0i64; granules];
    match mode {
        ShuffleMode::Reverse => {
            for (i, p) in positions.iter_mut().enumerate() {
                *p = (granules - i) as i64;
            }
        }
        ShuffleMode::Shift => {
            for (i, p) in positions.iter_mut().enumerate() {
                *p = (i + 2) as i64;
            }
            positions[granules - 1] = 1;
        }
        ShuffleMode::Swap => {
            for (i, p) in positions.iter_mut().enumerate() {
                *p = (i + 1) as i64;
            }
            let mut i = 0;
            while i + 1 < granules {
                positions.swap(i, i + 1);
                i += 2;
            }
        }
        ShuffleMode::Random => {
            let mut sources: Vec<i64> = (1..=granules as i64).collect();
            for p in positions.iter_mut() {
                let pick = fastrand::usize(0..sources.len());
                *p = sources.swap_remove(pick);
            }
        }
    }
    segmentize(s, record, granules, &positions)
}

/// Explicit pull-pattern shuffle: the first argument is the source
/// granule count, the rest the pattern.
fn pattern_shuffle(s: &mut LoopServices, record: LayerId, args: &[EventArg]) -> bool {
    let source_granules = args[0].as_int().unwrap_or(0);
    let pattern = &args[1..];
    if source_granules <= 0 {
        warn!("shuffle with no granules");
        return false;
    }
    if source_granules > MAX_GRANULES as i64 {
        warn!(source_granules, "shuffle with too many granules");
        return false;
    }
    if pattern.is_empty() {
        warn!("shuffle must have at least one pattern value");
        return false;
    }
    if pattern.len() > MAX_GRANULES {
        warn!("shuffle pattern is too long");
        return false;
    }
    let source_granules = source_granules as usize;
    let result_granules = source_granules.max(pattern.len());

    let mut used = vec![false; source_granules];
    let mut result = vec![0i64; result_granules];

    let mut position = 0usize;
    let mut granule = 0usize;
    while granule < result_granules {
        let selector = resolve(&pattern[position], source_granules, granule);
        if selector.abs() == END {
            result.truncate(granule);
            break;
        }
        result[granule] = selector;
        let index = selector.unsigned_abs() as usize;
        if index >= 1 && index <= source_granules {
            used[index - 1] = true;
        }
        granule += 1;
        // a short pattern repeats
        position += 1;
        if position >= pattern.len() {
            position = 0;
        }
    }

    // second pass: hand out the unused granules
    let mut remaining = used.iter().filter(|u| !**u).count();
    for slot in result.iter_mut() {
        if slot.abs() == RANDOM_UNUSED {
            let pick = random_unused(&mut used, &mut remaining);
            *slot = if *slot < 0 { -pick } else { pick };
        }
    }

    // final pass: previous-granule references
    for i in 0..result.len() {
        if result[i].abs() == PREVIOUS {
            let value = if i > 0 { result[i - 1] } else { 0 };
            result[i] = if result[i] < 0 { -value } else { value };
        }
    }

    segmentize(s, record, source_granules, &result)
}

fn resolve(arg: &EventArg, source_granules: usize, granule: usize) -> i64 {
    match arg {
        EventArg::Int(i) => *i,
        EventArg::Float(f) => *f as i64,
        EventArg::Str(text) => {
            let mut negative = false;
            let mut body = text.as_str();
            if let Some(rest) = body.strip_prefix('-') {
                negative = true;
                body = rest;
            }
            // rr/ru/rp spellings reverse the selection
            if body.len() > 1 && body.starts_with('r') {
                negative = true;
                body = &body[1..];
            }
            let value = match body.chars().next() {
                Some('r') => fastrand::i64(1..=source_granules.max(1) as i64),
                Some('u') => RANDOM_UNUSED,
                Some('e') => {
                    negative = false;
                    END
                }
                Some('p') => {
                    if granule == 0 {
                        fastrand::i64(1..=source_granules.max(1) as i64)
                    } else {
                        PREVIOUS
                    }
                }
                _ => {
                    warn!(pattern = %text, "unrecognized shuffle pattern");
                    0
                }
            };
            if negative { -value } else { value }
        }
        EventArg::List(list) => probability_pick(list, source_granules, granule),
    }
}

/// Pick from a candidate list. Candidates that are `(granule prob)`
/// pairs use their stated probability; the remainder is split across
/// the rest and the running total saturates at one.
fn probability_pick(list: &[EventArg], source_granules: usize, granule: usize) -> i64 {
    if list.is_empty() {
        return 0;
    }
    if list.len() == 1 {
        return resolve(&list[0], source_granules, granule);
    }
    let mut probabilities = vec![-1.0f32; list.len()];
    let mut stated = 0.0f32;
    let mut unspecified = 0usize;
    for (i, candidate) in list.iter().enumerate() {
        if let EventArg::List(pair) = candidate {
            if pair.len() > 1 {
                if let Some(p) = pair[1].as_float() {
                    probabilities[i] = p;
                    stated += p;
                    continue;
                }
            }
        }
        unspecified += 1;
    }
    if unspecified > 0 {
        let remainder = (1.0 - stated).max(0.0) / unspecified as f32;
        for p in probabilities.iter_mut() {
            if *p < 0.0 {
                *p = remainder;
            }
        }
    }

    let threshold = fastrand::f32();
    let mut cumulative = 0.0f32;
    for (i, p) in probabilities.iter().enumerate() {
        cumulative += p;
        if threshold < cumulative {
            return resolve_candidate(&list[i], source_granules, granule);
        }
    }
    // probabilities fell short of one; lean toward the last candidate
    resolve_candidate(&list[list.len() - 1], source_granules, granule)
}

fn resolve_candidate(arg: &EventArg, source_granules: usize, granule: usize) -> i64 {
    match arg {
        EventArg::List(pair) if !pair.is_empty() => resolve(&pair[0], source_granules, granule),
        other => resolve(other, source_granules, granule),
    }
}

fn random_unused(used: &mut [bool], remaining: &mut usize) -> i64 {
    if *remaining == 0 {
        // all granules consumed; leave the slot empty
        return 0;
    }
    let pick = if *remaining == 1 { 0 } else { fastrand::usize(0..*remaining) };
    let mut seen = 0usize;
    for (i, slot) in used.iter_mut().enumerate() {
        if !*slot {
            if seen == pick {
                *slot = true;
                *remaining -= 1;
                return (i + 1) as i64;
            }
            seen += 1;
        }
    }
    warn!("shuffle randomization error");
    0
}

/// Convert a pull pattern into an installed segment list.
fn segmentize(s: &mut LoopServices, record: LayerId, source_granules: usize, pattern: &[i64]) -> bool {
    let original = match s.layers.get(record) {
        Some(layer) => {
            if layer.segments().is_empty() {
                warn!("shuffle with no backing layer");
                return false;
            }
            if layer.segments().len() > 1 {
                warn!("shuffle with more than one segment");
                return false;
            }
            match layer.segments()[0].clone_window() {
                Some(seg) => seg,
                None => return false,
            }
        }
        None => return false,
    };

    let source_frames = s.layers.get(record).map(|l| l.frames()).unwrap_or(0);
    let granule_frames = source_frames / source_granules as i64;
    if granule_frames <= 0 {
        return false;
    }

    let mut segments: Vec<Option<Segment>> = Vec::with_capacity(pattern.len());
    let mut offset = 0i64;
    for &p in pattern {
        let index = p.unsigned_abs() as i64;
        if index < 1 || index > source_granules as i64 {
            // empty or out of range granule reads silence
            segments.push(None);
        } else {
            let Some(mut seg) = original.clone_window() else {
                segments.push(None);
                offset += granule_frames;
                continue;
            };
            let start = (index - 1) * granule_frames;
            seg.offset = offset;
            seg.start_frame = original.start_frame + start;
            seg.frames = granule_frames;
            seg.reverse = p < 0;
            seg.fade_left = true;
            seg.fade_right = true;
            seg.local_copy_left = 0;
            seg.local_copy_right = 0;
            segments.push(Some(seg));
        }
        offset += granule_frames;
    }

    // when the result is an exact multiple of the source, pad the final
    // granule over any rounding shortfall so sync is preserved
    let result_granules = pattern.len();
    if result_granules >= source_granules && result_granules % source_granules == 0 {
        let multiples = (result_granules / source_granules) as i64;
        let desired = source_frames * multiples;
        let delta = desired - offset;
        if delta > 0 {
            debug!(delta, "rounding shuffle segments");
            if let Some(Some(last)) = segments.last_mut() {
                let end = last.start_frame + last.frames;
                let avail = original.start_frame + source_frames - end;
                if avail < 0 {
                    warn!("unexpected shuffle segment sizes");
                } else {
                    last.frames += delta;
                    if avail < delta {
                        last.start_frame -= delta - avail;
                        if last.start_frame < 0 {
                            warn!("shuffle overflow on both ends");
                            last.frames += last.start_frame;
                            last.start_frame = 0;
                        }
                    }
                }
            }
            offset += delta;
        }
    }

    // adjacent same-direction segments that are contiguous in the
    // source keep their seam unfaded
    for i in 1..segments.len() {
        let (before, after) = segments.split_at_mut(i);
        if let (Some(a), Some(b)) = (before[i - 1].as_mut(), after[0].as_mut()) {
            if a.start_frame + a.frames == b.start_frame && !a.reverse && !b.reverse {
                a.fade_right = false;
                b.fade_left = false;
            }
        }
    }

    s.layers.reset_segments(record);
    for seg in segments.into_iter().flatten() {
        s.layers.add_segment(record, seg);
    }
    if let Some(layer) = s.layers.get_mut(record) {
        layer.resize(offset);
        layer.set_structure_changed(true);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioPool, CHANNELS};
    use crate::config::EngineConfig;
    use crate::event::{EventManager, EventType};
    use crate::functions::Functions;
    use crate::layer::{LayerContext, LayerPool};
    use crate::stream::{InputStream, OutputStream};
    use crate::sync::{MidiQueue, Synchronizer};
    use std::sync::Arc;

    struct Rig {
        layers: LayerPool,
        events: EventManager,
        sync: Synchronizer,
        config: EngineConfig,
        functions: Functions,
        input: InputStream,
        output: OutputStream,
    }

    fn rig() -> Rig {
        let audio_pool = AudioPool::with_ring_size(16);
        audio_pool.maintain();
        let mut layers = LayerPool::new(&audio_pool);
        layers.prime(16);
        Rig {
            layers,
            events: EventManager::new(),
            sync: Synchronizer::new(Arc::new(MidiQueue::new()), 44_100),
            config: EngineConfig::default(),
            functions: Functions::new(),
            input: InputStream::new(0),
            output: OutputStream::new(0),
        }
    }

    fn record_ramp(lp: &mut Loop, s: &mut LoopServices, frames: i64) {
        let id = s.layers.alloc();
        let mut content: Vec<f32> = (0..frames)
            .flat_map(|i| [(i / 1000) as f32 + 1.0; CHANNELS])
            .collect();
        let ctx = LayerContext::new(&mut content, frames as usize);
        s.layers.get_mut(id).unwrap().record(&ctx, 0, 127);
        s.layers.get_mut(id).unwrap().set_finalized(true);
        lp.play_layer = Some(id);
        let record = s.layers.alloc();
        s.layers.rebase_record(record, id, 127);
        lp.record_layer = Some(record);
        lp.mode = crate::mode::Mode::Play;
    }

    fn shuffle_with_args(args: Vec<EventArg>) -> (Loop, Rig, i64) {
        let mut r = rig();
        let mut lp = Loop::new(0);
        {
            let mut s = LoopServices {
                layers: &mut r.layers,
                events: &mut r.events,
                sync: &mut r.sync,
                config: &r.config,
                functions: &r.functions,
                input: &mut r.input,
                output: &mut r.output,
            };
            record_ramp(&mut lp, &mut s, 8000);
            let id = s.events.alloc(EventType::Shuffle);
            s.events.get_mut(id).unwrap().arguments = args;
            let event = s.events.get(id).unwrap().clone();
            do_event(&mut lp, &mut s, &event);
        }
        let frames = r
            .layers
            .get(lp.play_layer.unwrap())
            .map(|l| l.frames())
            .unwrap_or(0);
        (lp, r, frames)
    }

    #[test]
    fn explicit_pattern_reorders_granules() {
        // 4 granules of 2000, swap halves
        let (lp, r, frames) = shuffle_with_args(vec![
            EventArg::Int(4),
            EventArg::Int(3),
            EventArg::Int(4),
            EventArg::Int(1),
            EventArg::Int(2),
        ]);
        assert_eq!(frames, 8000);
        let play = r.layers.get(lp.play_layer.unwrap()).unwrap();
        let segs = play.segments();
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start_frame - segs[2].start_frame, 4000);
        // 3 and 4 are contiguous, so their seam has no fade
        assert!(!segs[0].fade_right);
        assert!(!segs[1].fade_left);
        // the wrap seam between 4 and 1 fades
        assert!(segs[1].fade_right);
        assert!(segs[2].fade_left);
    }

    #[test]
    fn longer_pattern_extends_the_loop() {
        let (_lp, _r, frames) = shuffle_with_args(vec![
            EventArg::Int(2),
            EventArg::Int(1),
            EventArg::Int(2),
            EventArg::Int(1),
            EventArg::Int(2),
        ]);
        // 4 granules of 4000 from a 2-granule source
        assert_eq!(frames, 16000);
    }

    #[test]
    fn previous_repeats_and_end_truncates() {
        let (_lp, r, frames) = shuffle_with_args(vec![
            EventArg::Int(4),
            EventArg::Int(2),
            EventArg::Str("p".to_string()),
            EventArg::Str("e".to_string()),
        ]);
        assert_eq!(frames, 4000);
        let _ = r;
    }

    #[test]
    fn reverse_granule_is_marked() {
        let (lp, r, _frames) = shuffle_with_args(vec![
            EventArg::Int(4),
            EventArg::Int(-2),
            EventArg::Int(2),
            EventArg::Int(3),
            EventArg::Int(4),
        ]);
        let play = r.layers.get(lp.play_layer.unwrap()).unwrap();
        assert!(play.segments()[0].reverse);
        assert!(!play.segments()[1].reverse);
    }

    #[test]
    fn unused_selector_consumes_remaining() {
        let (lp, r, frames) = shuffle_with_args(vec![
            EventArg::Int(4),
            EventArg::Int(1),
            EventArg::Int(2),
            EventArg::Str("u".to_string()),
            EventArg::Str("u".to_string()),
        ]);
        assert_eq!(frames, 8000);
        let play = r.layers.get(lp.play_layer.unwrap()).unwrap();
        let mut starts: Vec<i64> = play.segments().iter().map(|s| s.start_frame).collect();
        starts.sort();
        // every granule appears exactly once
        assert_eq!(starts.len(), 4);
        assert_eq!(starts[0] % 2000, starts[1] % 2000);
    }
}
