//! Tempo map: converts between seconds, beat offsets and measures across
//! every tempo and meter change the clock has performed.

use crate::time::{Moment, Quantization, TimeSignature};
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-9;

/// One stretch of constant tempo and meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoRegime {
    /// Beat offset where this regime begins.
    pub offset: f64,
    /// Clock time where this regime begins.
    pub seconds: f64,
    pub beats_per_minute: f64,
    pub time_signature: TimeSignature,
    /// Offset of the downbeat of `measure`; measures are counted from here.
    pub measure_anchor: f64,
    pub measure: i64,
}

impl TempoRegime {
    fn seconds_per_beat(&self) -> f64 {
        60.0 / self.beats_per_minute
    }
}

/// Tempo map for converting between time representations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    pub origin: TempoRegime,
    /// Later regimes, ordered by offset.
    pub tempo_changes: Vec<TempoRegime>,
}

impl TempoMap {
    pub fn new(
        initial_seconds: f64,
        initial_offset: f64,
        initial_measure: i64,
        beats_per_minute: f64,
        time_signature: TimeSignature,
    ) -> Self {
        Self {
            origin: TempoRegime {
                offset: initial_offset,
                seconds: initial_seconds,
                beats_per_minute,
                time_signature,
                measure_anchor: initial_offset,
                measure: initial_measure,
            },
            tempo_changes: Vec::new(),
        }
    }

    /// The regime in force after the latest change.
    pub fn current(&self) -> &TempoRegime {
        self.tempo_changes.last().unwrap_or(&self.origin)
    }

    fn regime_at_offset(&self, offset: f64) -> &TempoRegime {
        self.tempo_changes
            .iter()
            .rev()
            .find(|r| r.offset <= offset + EPSILON)
            .unwrap_or(&self.origin)
    }

    fn regime_at_seconds(&self, seconds: f64) -> &TempoRegime {
        self.tempo_changes
            .iter()
            .rev()
            .find(|r| r.seconds <= seconds + EPSILON)
            .unwrap_or(&self.origin)
    }

    fn regime_at_measure(&self, measure: i64) -> &TempoRegime {
        self.tempo_changes
            .iter()
            .rev()
            .find(|r| r.measure <= measure)
            .unwrap_or(&self.origin)
    }

    /// Get tempo at a given offset
    pub fn tempo_at(&self, offset: f64) -> f64 {
        self.regime_at_offset(offset).beats_per_minute
    }

    /// Get time signature at a given offset
    pub fn time_sig_at(&self, offset: f64) -> TimeSignature {
        self.regime_at_offset(offset).time_signature
    }

    pub fn offset_to_seconds(&self, offset: f64) -> f64 {
        let regime = self.regime_at_offset(offset);
        regime.seconds + (offset - regime.offset) * regime.seconds_per_beat()
    }

    pub fn seconds_to_offset(&self, seconds: f64) -> f64 {
        let regime = self.regime_at_seconds(seconds);
        regime.offset + (seconds - regime.seconds) / regime.seconds_per_beat()
    }

    /// Measure number containing `offset`, and the beats elapsed within it.
    pub fn offset_to_measure(&self, offset: f64) -> (i64, f64) {
        let regime = self.regime_at_offset(offset);
        let length = regime.time_signature.beats_per_measure();
        let elapsed = offset - regime.measure_anchor;
        let whole = ((elapsed + EPSILON) / length).floor();
        let within = (elapsed - whole * length).max(0.0);
        (regime.measure + whole as i64, within)
    }

    /// Offset of a (possibly fractional) measure position.
    pub fn measure_to_offset(&self, measure: f64) -> f64 {
        let whole = measure.floor();
        let regime = self.regime_at_measure(whole as i64);
        let length = regime.time_signature.beats_per_measure();
        regime.measure_anchor
            + (whole - regime.measure as f64) * length
            + (measure - whole) * length
    }

    pub fn moment_at_offset(&self, offset: f64) -> Moment {
        let regime = self.regime_at_offset(offset);
        let (measure, measure_offset) = self.offset_to_measure(offset);
        Moment {
            seconds: self.offset_to_seconds(offset),
            offset,
            measure,
            measure_offset,
            beats_per_minute: regime.beats_per_minute,
            time_signature: regime.time_signature,
        }
    }

    pub fn moment_at_seconds(&self, seconds: f64) -> Moment {
        let offset = self.seconds_to_offset(seconds);
        Moment {
            seconds,
            ..self.moment_at_offset(offset)
        }
    }

    /// `offset` itself when it sits on a downbeat, otherwise the next one.
    pub fn next_downbeat(&self, offset: f64) -> f64 {
        let (measure, within) = self.offset_to_measure(offset);
        if within <= EPSILON {
            offset
        } else {
            self.measure_to_offset((measure + 1) as f64)
        }
    }

    /// First grid point at or after `offset`.
    pub fn quantize(&self, offset: f64, quantization: Quantization) -> f64 {
        match quantization {
            Quantization::Measures(count) => {
                let count = i64::from(count.max(1));
                let (measure, within) = self.offset_to_measure(offset);
                let mut candidate = if within <= EPSILON { measure } else { measure + 1 };
                let misalignment = (candidate - 1).rem_euclid(count);
                if misalignment != 0 {
                    candidate += count - misalignment;
                }
                self.measure_to_offset(candidate as f64)
            }
            Quantization::Note { .. } => {
                let regime = self.regime_at_offset(offset);
                let step = quantization.step(regime.time_signature);
                let steps = ((offset - regime.measure_anchor) / step - EPSILON).ceil();
                regime.measure_anchor + steps * step
            }
        }
    }

    /// Start a new regime at `offset`. A meter change restarts measure
    /// counting at `offset`, which should sit on a downbeat.
    pub fn change(
        &mut self,
        offset: f64,
        beats_per_minute: Option<f64>,
        time_signature: Option<TimeSignature>,
    ) {
        self.tempo_changes.retain(|r| r.offset < offset - EPSILON);
        let previous = *self.current();
        let seconds = self.offset_to_seconds(offset);

        let (time_signature, measure_anchor, measure) = match time_signature {
            Some(meter) if meter != previous.time_signature => {
                let (measure, within) = self.offset_to_measure(offset);
                let measure = if within <= EPSILON { measure } else { measure + 1 };
                (meter, offset, measure)
            }
            _ => (
                previous.time_signature,
                previous.measure_anchor,
                previous.measure,
            ),
        };

        self.tempo_changes.push(TempoRegime {
            offset,
            seconds,
            beats_per_minute: beats_per_minute.unwrap_or(previous.beats_per_minute),
            time_signature,
            measure_anchor,
            measure,
        });
    }
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(0.0, 0.0, 1, 120.0, TimeSignature::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn conversions_at_constant_tempo() {
        let map = TempoMap::new(10.0, 0.0, 1, 120.0, TimeSignature::default());
        assert!(close(map.offset_to_seconds(4.0), 12.0));
        assert!(close(map.seconds_to_offset(11.0), 2.0));
        assert_eq!(map.offset_to_measure(4.0), (2, 0.0));
        assert_eq!(map.offset_to_measure(5.5), (2, 1.5));
        assert!(close(map.measure_to_offset(3.0), 8.0));
    }

    #[test]
    fn conversions_integrate_across_tempo_changes() {
        let mut map = TempoMap::default();
        map.change(2.0, Some(60.0), None);

        assert!(close(map.offset_to_seconds(1.0), 0.5));
        assert!(close(map.offset_to_seconds(2.0), 1.0));
        assert!(close(map.offset_to_seconds(4.0), 3.0));
        assert!(close(map.seconds_to_offset(3.0), 4.0));
        assert!(close(map.seconds_to_offset(0.5), 1.0));
        assert_eq!(map.tempo_at(1.0), 120.0);
        assert_eq!(map.tempo_at(3.0), 60.0);
    }

    #[test]
    fn meter_change_restarts_measure_counting() {
        let mut map = TempoMap::default();
        map.change(8.0, None, Some(TimeSignature::new(3, 4).unwrap()));

        assert_eq!(map.offset_to_measure(8.0), (3, 0.0));
        assert_eq!(map.offset_to_measure(11.0), (4, 0.0));
        assert!(close(map.measure_to_offset(2.0), 4.0));
        assert!(close(map.measure_to_offset(5.0), 14.0));
        assert_eq!(map.time_sig_at(9.0), TimeSignature::new(3, 4).unwrap());
    }

    #[test]
    fn quantize_snaps_forward() {
        let map = TempoMap::default();
        assert!(close(map.quantize(0.0, Quantization::Measures(1)), 0.0));
        assert!(close(map.quantize(0.1, Quantization::Measures(1)), 4.0));
        assert!(close(map.quantize(0.1, Quantization::Measures(2)), 8.0));
        assert!(close(map.quantize(4.5, Quantization::Measures(4)), 16.0));
        let eighth = Quantization::Note {
            division: 8,
            triplet: false,
        };
        assert!(close(map.quantize(1.2, eighth), 1.5));
        assert!(close(map.quantize(1.5, eighth), 1.5));
    }

    #[test]
    fn next_downbeat_stays_on_a_downbeat() {
        let map = TempoMap::default();
        assert!(close(map.next_downbeat(4.0), 4.0));
        assert!(close(map.next_downbeat(5.0), 8.0));
    }

    #[test]
    fn moment_reports_measure_position() {
        let map = TempoMap::default();
        let moment = map.moment_at_seconds(2.75);
        assert!(close(moment.offset, 5.5));
        assert_eq!(moment.measure, 2);
        assert!(close(moment.measure_offset, 1.5));
        assert_eq!(moment.beats_per_minute, 120.0);
    }
}
