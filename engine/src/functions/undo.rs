//! Undo and redo over the layer history.

use crate::loops::{Loop, LoopServices};

pub fn do_undo(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    lp.undo(s);
    lp.check_mute_cancel(s, event.function);
    lp.validate(s);
}

pub fn do_redo(lp: &mut Loop, s: &mut LoopServices, event: &crate::event::Event) {
    lp.redo(s);
    lp.check_mute_cancel(s, event.function);
    lp.validate(s);
}
