//! Live audio level metering for the call UI.
//!
//! Each stream exposes a [`LevelSource`] with its most recent PCM samples. A
//! [`VolumeMonitor`] samples it on every display tick, turns the window into
//! byte-scaled frequency bins the way a browser analyser node does, and
//! publishes the bin average (0..=255) into a [`VolumeMeter`]. Readers only
//! see the latest value.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;
const MIN_WINDOW: usize = 32;
const MAX_WINDOW: usize = 32_768;

pub trait LevelSource: Send + Sync {
    fn is_active(&self) -> bool;
    /// Fills `out` with the most recent samples, oldest first. When fewer
    /// samples are buffered the front of `out` is zeroed. Returns the number
    /// of real samples written.
    fn read_window(&self, out: &mut [f32]) -> usize;
}

#[derive(Debug)]
struct TapState {
    samples: VecDeque<f32>,
    active: bool,
}

/// Bounded buffer of the latest PCM samples of one stream.
#[derive(Debug)]
pub struct LevelTap {
    capacity: usize,
    state: Mutex<TapState>,
}

impl LevelTap {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(TapState {
                samples: VecDeque::with_capacity(capacity),
                active: true,
            }),
        })
    }

    pub fn push(&self, pcm: &[f32]) {
        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        let keep = pcm.len().min(self.capacity);
        let overflow = (state.samples.len() + keep).saturating_sub(self.capacity);
        state.samples.drain(..overflow);
        state.samples.extend(&pcm[pcm.len() - keep..]);
    }

    /// Marks the stream as ended. Monitors stop at their next tick.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.samples.clear();
    }
}

impl LevelSource for LevelTap {
    fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn read_window(&self, out: &mut [f32]) -> usize {
        let state = self.state.lock();
        let available = state.samples.len().min(out.len());
        let pad = out.len() - available;
        out[..pad].fill(0.0);
        let start = state.samples.len() - available;
        for (slot, sample) in out[pad..].iter_mut().zip(state.samples.range(start..)) {
            *slot = *sample;
        }
        available
    }
}

/// Fixed-size spectrum analysis matching the browser `AnalyserNode`:
/// Blackman window, magnitude DFT, temporal smoothing, dB mapped onto 0..=255.
#[derive(Debug)]
pub struct SpectrumAnalyzer {
    size: usize,
    window: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
    smoothed: Vec<f32>,
    bins: Vec<u8>,
}

impl SpectrumAnalyzer {
    /// Sizes outside `32..=32768` are clamped and anything else is rounded up
    /// to the next power of two, as the browser analyser requires.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(MIN_WINDOW, MAX_WINDOW).next_power_of_two();
        let n = size as f32;
        let window = (0..size)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let cos = (0..size).map(|i| (2.0 * PI * i as f32 / n).cos()).collect();
        let sin = (0..size).map(|i| (2.0 * PI * i as f32 / n).sin()).collect();
        Self {
            size,
            window,
            cos,
            sin,
            smoothed: vec![0.0; size / 2],
            bins: vec![0; size / 2],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Analyses one window and returns the byte-scaled frequency bins.
    /// Missing samples count as silence.
    pub fn byte_frequency_data(&mut self, samples: &[f32]) -> &[u8] {
        let n = self.size;
        let offset = n.saturating_sub(samples.len());
        let samples = &samples[samples.len().saturating_sub(n)..];
        let range = MAX_DECIBELS - MIN_DECIBELS;
        for k in 0..n / 2 {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (i, sample) in samples.iter().enumerate() {
                let idx = offset + i;
                let x = sample * self.window[idx];
                let twiddle = (k * idx) % n;
                re += x * self.cos[twiddle];
                im -= x * self.sin[twiddle];
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            let smoothed = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            self.smoothed[k] = if smoothed.is_finite() { smoothed } else { 0.0 };
            let db = 20.0 * self.smoothed[k].max(f32::MIN_POSITIVE).log10();
            let scaled = (255.0 / range) * (db - MIN_DECIBELS);
            self.bins[k] = scaled.clamp(0.0, 255.0) as u8;
        }
        &self.bins
    }

    pub fn average_level(&mut self, samples: &[f32]) -> f32 {
        let bins = self.byte_frequency_data(samples);
        let total: u32 = bins.iter().map(|b| *b as u32).sum();
        total as f32 / bins.len() as f32
    }
}

/// Latest-value volume reading shared between a monitor and its readers.
#[derive(Debug, Clone)]
pub struct VolumeMeter {
    tx: Arc<watch::Sender<f32>>,
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(0.0).0),
        }
    }

    pub fn latest(&self) -> f32 {
        *self.tx.borrow()
    }

    /// Starts a fresh reading sequence at the current value.
    pub fn readings(&self) -> VolumeReadings {
        VolumeReadings {
            rx: self.tx.subscribe(),
        }
    }

    fn set(&self, level: f32) {
        self.tx.send_replace(level);
    }
}

/// Infinite sequence of volume readings. Intermediate values may be skipped.
#[derive(Debug, Clone)]
pub struct VolumeReadings {
    rx: watch::Receiver<f32>,
}

impl VolumeReadings {
    pub fn latest(&self) -> f32 {
        *self.rx.borrow()
    }

    /// Waits for the next change. Returns `None` once the meter is gone.
    pub async fn next(&mut self) -> Option<f32> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}

/// Periodic sampling task bound to the lifetime of this value.
#[derive(Debug)]
pub struct VolumeMonitor {
    task: JoinHandle<()>,
    meter: VolumeMeter,
}

impl VolumeMonitor {
    pub fn spawn(
        label: &'static str,
        source: Arc<dyn LevelSource>,
        meter: VolumeMeter,
        tick: Duration,
        window: usize,
    ) -> Self {
        let task_meter = meter.clone();
        let task = tokio::spawn(async move {
            let mut analyzer = SpectrumAnalyzer::new(window);
            let mut samples = vec![0.0f32; analyzer.size()];
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !source.is_active() {
                    tracing::debug!(target = "call.volume", stream = label, "source inactive; stopping monitor");
                    break;
                }
                source.read_window(&mut samples);
                task_meter.set(analyzer.average_level(&samples));
            }
            task_meter.set(0.0);
        });
        Self { task, meter }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.task.abort();
        self.meter.set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;

    fn sine(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / 48_000.0).sin())
            .collect()
    }

    #[test]
    fn silence_reads_zero() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        assert_eq!(analyzer.average_level(&[0.0; 256]), 0.0);
    }

    #[test]
    fn odd_window_sizes_round_to_a_power_of_two() {
        assert_eq!(SpectrumAnalyzer::new(300).size(), 512);
        assert_eq!(SpectrumAnalyzer::new(0).size(), 32);
        assert_eq!(SpectrumAnalyzer::new(1 << 20).size(), 32_768);
        let mut analyzer = SpectrumAnalyzer::new(300);
        assert!(analyzer.average_level(&sine(1_000.0, 0.5, 300)) > 0.0);
    }

    #[test]
    fn louder_signal_reads_higher() {
        let mut quiet = SpectrumAnalyzer::new(256);
        let mut loud = SpectrumAnalyzer::new(256);
        let q = quiet.average_level(&sine(1_000.0, 0.01, 256));
        let l = loud.average_level(&sine(1_000.0, 0.8, 256));
        assert!(l > q, "loud={l} quiet={q}");
        assert!(l <= 255.0);
    }

    #[test]
    fn tone_peaks_in_matching_bin() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        // bin width is 48k / 256 = 187.5 Hz; bin 16 is 3 kHz
        let tone = sine(3_000.0, 0.005, 256);
        for _ in 0..20 {
            analyzer.byte_frequency_data(&tone);
        }
        let bins = analyzer.byte_frequency_data(&tone);
        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, b)| **b)
            .map(|(i, _)| i)
            .expect("bins");
        assert_eq!(peak, 16);
    }

    #[test]
    fn tap_keeps_latest_samples() {
        let tap = LevelTap::new(4);
        tap.push(&[1.0, 2.0, 3.0]);
        tap.push(&[4.0, 5.0]);
        let mut out = [0.0; 4];
        assert_eq!(tap.read_window(&mut out), 4);
        assert_eq!(out, [2.0, 3.0, 4.0, 5.0]);

        let mut wide = [9.0; 6];
        assert_eq!(tap.read_window(&mut wide), 4);
        assert_eq!(wide, [0.0, 0.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio_timeout_test(10, paused)]
    async fn monitor_publishes_and_stops_when_source_ends() {
        let tap = LevelTap::new(256);
        tap.push(&sine(440.0, 0.7, 256));
        let meter = VolumeMeter::new();
        let mut readings = meter.readings();
        let monitor = VolumeMonitor::spawn(
            "local",
            tap.clone(),
            meter.clone(),
            Duration::from_millis(16),
            256,
        );

        let level = readings.next().await.expect("reading");
        assert!(level > 0.0);

        tap.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_finished());
        assert_eq!(meter.latest(), 0.0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn dropping_monitor_cancels_sampling() {
        let tap = LevelTap::new(256);
        tap.push(&sine(440.0, 0.7, 256));
        let meter = VolumeMeter::new();
        let monitor = VolumeMonitor::spawn(
            "remote",
            tap.clone(),
            meter.clone(),
            Duration::from_millis(16),
            256,
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(meter.latest() > 0.0);

        drop(monitor);
        assert_eq!(meter.latest(), 0.0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(meter.latest(), 0.0, "no reading may land after teardown");
    }
}
