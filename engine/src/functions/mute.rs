//! Mute, Pause and their global variants.
//!
//! Mute is a major mode with a sticky minor-mode flag so other modes
//! can run silently and restore afterwards. How unmute resumes is
//! governed by the preset mute mode: continue in place, restart from
//! zero, or stop the transport entirely.

use tracing::{debug, info};

use crate::config::MuteMode;
use crate::event::{EventId, EventType};
use crate::functions::{self, Function, FunctionKind, LoopAction, MuteVariant};
use crate::loops::{Loop, LoopServices};
use crate::mode::Mode;

pub fn schedule(lp: &mut Loop, s: &mut LoopServices, f: &Function, action: &LoopAction) -> Option<EventId> {
    if !action.down && !functions::is_sustain(f, s) {
        return None;
    }
    if lp.mode == Mode::Record {
        // recording has its own ending; mute cannot preempt the stop
        return s.events.find(EventType::RecordStop);
    }
    // ignore requests that are already satisfied
    if let FunctionKind::Mute { variant } = f.kind {
        if (variant == MuteVariant::On && lp.mute_mode) || (variant == MuteVariant::Off && !lp.mute_mode) {
            debug!("mute already in desired state");
            return None;
        }
    }
    let id = functions::default_schedule(lp, s, f, action)?;
    functions::schedule_play_jump(lp, s, id);
    Some(id)
}

pub fn do_event(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    let kind = event.function.and_then(|f| s.functions.get(f)).map(|f| f.kind);
    let mut mute_mode = s.config.preset.mute_mode;
    if matches!(kind, Some(FunctionKind::Pause) | Some(FunctionKind::GlobalPause)) {
        mute_mode = MuteMode::Pause;
    }

    let entering = match kind {
        Some(FunctionKind::Mute { variant: MuteVariant::On }) => true,
        Some(FunctionKind::Mute { variant: MuteVariant::Off }) => false,
        _ => !lp.mute_mode,
    };

    if entering == lp.mute_mode {
        debug!("ignoring mute event, already in desired state");
        return;
    }

    if entering {
        if lp.mode.is_recording() {
            // a recording mode ends silently
            lp.resume_play();
        }
        lp.mode = Mode::Mute;
        lp.mute_mode = true;
        // the play jump has already silenced the output
        lp.mute = true;
        match mute_mode {
            MuteMode::Pause => {
                lp.pause = true;
                s.sync.loop_pause();
            }
            MuteMode::Start => {
                // clocks stop when muting in start mode
                s.sync.loop_mute();
            }
            MuteMode::Continue => {}
        }
        info!(loop_number = lp.number(), mode = ?mute_mode, "mute");
    } else {
        lp.mute_mode = false;
        match lp.mode {
            Mode::Replace | Mode::Insert => {
                // these stay silent until their own ending
            }
            _ => {
                lp.mute = false;
                match mute_mode {
                    MuteMode::Start => {
                        lp.frame = 0;
                        lp.record_cursor = 0;
                        lp.recalculate_play_frame(s);
                        s.sync.loop_restart();
                    }
                    MuteMode::Pause => {
                        lp.pause = false;
                        s.sync.loop_resume();
                    }
                    MuteMode::Continue => {}
                }
                lp.resume_play();
            }
        }
        info!(loop_number = lp.number(), "unmute");
    }
    lp.validate(s);
}
