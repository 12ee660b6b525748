//! Loop operating modes.

use serde::{Deserialize, Serialize};

/// Major mode of a loop. Exactly one at a time; the orthogonal minor
/// states (mute, overdub, reverse, pause...) are flags on the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Reset,
    Play,
    Record,
    Overdub,
    Multiply,
    Insert,
    Replace,
    Stutter,
    Mute,
    Rehearse,
    Threshold,
    Run,
    Synchronize,
    Switch,
    Confirm,
}

impl Mode {
    /// Modes that write into the record layer.
    pub fn is_recording(&self) -> bool {
        matches!(
            self,
            Mode::Record | Mode::Overdub | Mode::Multiply | Mode::Insert | Mode::Replace | Mode::Stutter | Mode::Rehearse
        )
    }

    /// Modes that grow the layer as they run and are ended by a
    /// rounded or unrounded ending function.
    pub fn is_extending(&self) -> bool {
        matches!(self, Mode::Multiply | Mode::Insert | Mode::Stutter)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Reset => "reset",
            Mode::Play => "play",
            Mode::Record => "record",
            Mode::Overdub => "overdub",
            Mode::Multiply => "multiply",
            Mode::Insert => "insert",
            Mode::Replace => "replace",
            Mode::Stutter => "stutter",
            Mode::Mute => "mute",
            Mode::Rehearse => "rehearse",
            Mode::Threshold => "threshold",
            Mode::Run => "run",
            Mode::Synchronize => "synchronize",
            Mode::Switch => "switch",
            Mode::Confirm => "confirm",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extending_modes_record() {
        for mode in [Mode::Multiply, Mode::Insert, Mode::Stutter] {
            assert!(mode.is_extending());
            assert!(mode.is_recording());
        }
        assert!(!Mode::Play.is_extending());
        assert!(!Mode::Mute.is_recording());
    }
}
