//! Musical time units: meters, quantization grids and clock moments.

use crate::ClockError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time signature (e.g., 4/4, 3/4, 7/8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    pub fn new(numerator: u32, denominator: u32) -> Result<Self, ClockError> {
        if numerator == 0 || denominator == 0 {
            return Err(ClockError::InvalidTimeSignature {
                numerator,
                denominator,
            });
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    /// Length of one measure in beats.
    pub fn beats_per_measure(&self) -> f64 {
        f64::from(self.numerator)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self {
            numerator: 4,
            denominator: 4,
        }
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Unit of a `schedule_at` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Absolute offset in beats since the clock's origin.
    Beats,
    /// Measure number; fractions land inside the measure.
    Measures,
    /// Absolute clock time in seconds.
    Seconds,
}

/// Grid a cued event snaps forward to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantization {
    /// Next downbeat of a measure whose number is `1 + k * n`.
    Measures(u32),
    /// Next multiple of a `1/division` note, optionally a triplet.
    Note { division: u32, triplet: bool },
}

impl Quantization {
    pub const VALID: [&'static str; 17] = [
        "8M", "4M", "2M", "1M", "1/2", "1/2T", "1/4", "1/4T", "1/8", "1/8T", "1/16", "1/16T",
        "1/32", "1/32T", "1/64", "1/64T", "1/128",
    ];

    /// Grid step in beats under `time_signature`.
    pub fn step(&self, time_signature: TimeSignature) -> f64 {
        match *self {
            Quantization::Measures(count) => f64::from(count) * time_signature.beats_per_measure(),
            Quantization::Note { division, triplet } => {
                let straight = f64::from(time_signature.denominator) / f64::from(division);
                if triplet {
                    straight * 2.0 / 3.0
                } else {
                    straight
                }
            }
        }
    }
}

impl FromStr for Quantization {
    type Err = ClockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !Self::VALID.contains(&s) {
            return Err(ClockError::InvalidQuantization(s.to_string()));
        }
        let invalid = || ClockError::InvalidQuantization(s.to_string());
        if let Some(count) = s.strip_suffix('M') {
            return count.parse().map(Quantization::Measures).map_err(|_| invalid());
        }
        let note = s.strip_prefix("1/").ok_or_else(invalid)?;
        let (digits, triplet) = match note.strip_suffix('T') {
            Some(digits) => (digits, true),
            None => (note, false),
        };
        let division = digits.parse().map_err(|_| invalid())?;
        Ok(Quantization::Note { division, triplet })
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantization::Measures(count) => write!(f, "{count}M"),
            Quantization::Note { division, triplet } => {
                write!(f, "1/{division}{}", if *triplet { "T" } else { "" })
            }
        }
    }
}

/// A point in time seen through the clock's tempo map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moment {
    pub seconds: f64,
    /// Beats since the clock's origin.
    pub offset: f64,
    pub measure: i64,
    /// Beats since the start of `measure`.
    pub measure_offset: f64,
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_grid_parses_and_prints_back() {
        for text in Quantization::VALID {
            let parsed: Quantization = text.parse().unwrap();
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn unknown_grids_are_rejected() {
        for text in ["3M", "1/3", "1/128T", "quarter", ""] {
            assert!(matches!(
                text.parse::<Quantization>(),
                Err(ClockError::InvalidQuantization(_))
            ));
        }
    }

    #[test]
    fn grid_steps_follow_the_meter() {
        let common = TimeSignature::default();
        let seven_eight = TimeSignature::new(7, 8).unwrap();

        assert_eq!(Quantization::Measures(2).step(common), 8.0);
        assert_eq!(Quantization::Measures(1).step(seven_eight), 7.0);
        assert_eq!("1/4".parse::<Quantization>().unwrap().step(common), 1.0);
        assert_eq!("1/8".parse::<Quantization>().unwrap().step(seven_eight), 1.0);
        let triplet = "1/4T".parse::<Quantization>().unwrap().step(common);
        assert!((triplet - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn zero_meter_is_invalid() {
        assert!(TimeSignature::new(0, 4).is_err());
        assert!(TimeSignature::new(3, 0).is_err());
    }
}
