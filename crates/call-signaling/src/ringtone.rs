//! Incoming-call ring: a 400 Hz + 450 Hz dual tone played as two short
//! bursts every three seconds.

use std::f32::consts::PI;
use std::time::Duration;

const LOW_HZ: f32 = 400.0;
const HIGH_HZ: f32 = 450.0;
const PEAK_GAIN: f32 = 0.2;
const CYCLE_SECS: f32 = 3.0;
const RAMP_SECS: f32 = 0.1;

/// (start, end) of each burst within the cycle, ramps included.
const BURSTS: [(f32, f32); 2] = [(0.0, 0.5), (0.7, 1.2)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTone {
    pub sample_rate: u32,
}

impl Default for RingTone {
    fn default() -> Self {
        Self::new(48_000)
    }
}

impl RingTone {
    pub const CYCLE: Duration = Duration::from_secs(3);

    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Envelope gain at `t` seconds after the ring started.
    pub fn gain_at(t: f32) -> f32 {
        let t = t.rem_euclid(CYCLE_SECS);
        for (start, end) in BURSTS {
            if t < start || t >= end {
                continue;
            }
            let since_start = t - start;
            let until_end = end - t;
            return if since_start < RAMP_SECS {
                PEAK_GAIN * since_start / RAMP_SECS
            } else if until_end < RAMP_SECS {
                PEAK_GAIN * until_end / RAMP_SECS
            } else {
                PEAK_GAIN
            };
        }
        0.0
    }

    /// Endless mono PCM stream of the ring.
    pub fn samples(&self) -> RingSamples {
        RingSamples {
            sample_rate: self.sample_rate as f32,
            index: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RingSamples {
    sample_rate: f32,
    index: u64,
}

impl Iterator for RingSamples {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let cycle_len = (CYCLE_SECS * self.sample_rate) as u64;
        let t = (self.index % cycle_len) as f32 / self.sample_rate;
        self.index = self.index.wrapping_add(1);
        let tone = (2.0 * PI * LOW_HZ * t).sin() + (2.0 * PI * HIGH_HZ * t).sin();
        Some(RingTone::gain_at(t) * tone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn cadence_has_two_bursts_per_cycle() {
        assert!(approx(RingTone::gain_at(0.0), 0.0));
        assert!(approx(RingTone::gain_at(0.05), 0.1));
        assert!(approx(RingTone::gain_at(0.25), PEAK_GAIN));
        assert!(approx(RingTone::gain_at(0.6), 0.0));
        assert!(approx(RingTone::gain_at(0.9), PEAK_GAIN));
        assert!(approx(RingTone::gain_at(2.0), 0.0));
        assert!(approx(RingTone::gain_at(3.25), PEAK_GAIN));
    }

    #[test]
    fn samples_stay_within_envelope() {
        let tone = RingTone::new(8_000);
        let peak = tone
            .samples()
            .take(8_000 * 3)
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.3 && peak <= 2.0 * PEAK_GAIN + 1e-4, "peak={peak}");
        let quiet = tone.samples().skip(8_000 * 2).take(4_000).all(|s| s == 0.0);
        assert!(quiet, "ring must be silent between cycles");
    }
}
