//! Bus handles handed out by a context.

use oscwire::ControlValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rate {
    Audio,
    Control,
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Audio => f.write_str("audio"),
            Rate::Control => f.write_str("control"),
        }
    }
}

/// A contiguous run of buses on one context.
///
/// `epoch` identifies the boot that allocated the handle; a context only
/// takes back handles from its current boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusGroup {
    pub rate: Rate,
    pub index: i32,
    pub count: u32,
    pub epoch: u64,
}

impl BusGroup {
    /// The mapping symbol a synth control reads this bus through (`c5`, `a16`).
    pub fn map_symbol(&self) -> ControlValue {
        match self.rate {
            Rate::Audio => ControlValue::audio_bus(self.index),
            Rate::Control => ControlValue::control_bus(self.index),
        }
    }

    /// The bus index as a plain control value, for `in_`/`out` style controls.
    pub fn as_value(&self) -> ControlValue {
        ControlValue::Float(self.index as f32)
    }

    /// `/c_set` pairs writing `value` to every channel.
    pub fn fill(&self, value: f32) -> impl Iterator<Item = (i32, f32)> + '_ {
        (0..self.count as i32).map(move |offset| (self.index + offset, value))
    }
}

impl fmt::Display for BusGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bus {}x{}", self.rate, self.index, self.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_follow_rate() {
        let control = BusGroup {
            rate: Rate::Control,
            index: 5,
            count: 1,
            epoch: 1,
        };
        assert_eq!(control.map_symbol().to_string(), "c5");
        assert_eq!(control.as_value().to_string(), "5.0");

        let audio = BusGroup {
            rate: Rate::Audio,
            index: 16,
            count: 2,
            epoch: 1,
        };
        assert_eq!(audio.map_symbol().to_string(), "a16");
        assert_eq!(audio.fill(0.5).collect::<Vec<_>>(), vec![(16, 0.5), (17, 0.5)]);
    }
}
