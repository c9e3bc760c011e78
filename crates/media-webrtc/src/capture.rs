//! Device seams: where captured audio comes from and where received audio goes.

use std::time::Duration;

use bytes::Bytes;
use call_signaling::MediaError;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Mono samples per frame at 48 kHz.
pub const FRAME_SAMPLES: usize = 960;
/// One silent 20 ms Opus frame.
pub const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

const CAPTURE_BACKLOG: usize = 8;

/// One encoded frame plus the PCM it was encoded from, for metering.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub opus: Bytes,
    pub pcm: Vec<f32>,
    pub duration: Duration,
}

impl CapturedFrame {
    pub fn silence() -> Self {
        Self {
            opus: Bytes::from_static(&OPUS_SILENCE),
            pcm: vec![0.0; FRAME_SAMPLES],
            duration: FRAME_DURATION,
        }
    }
}

pub trait AudioCapture: Send + Sync + 'static {
    /// Starts capturing. The device is released once the receiver is dropped.
    fn open(&self) -> Result<mpsc::Receiver<CapturedFrame>, MediaError>;
}

pub trait AudioSink: Send + Sync + 'static {
    /// Plays one received Opus frame and returns the decoded PCM, if the sink
    /// decodes at all.
    fn play(&self, opus: &[u8]) -> Option<Vec<f32>>;

    /// Plays locally generated PCM such as the ringtone.
    fn ring(&self, _pcm: &[f32]) {}
}

/// Stands in for a microphone: a steady stream of silent frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilenceCapture;

impl AudioCapture for SilenceCapture {
    fn open(&self) -> Result<mpsc::Receiver<CapturedFrame>, MediaError> {
        let (tx, rx) = mpsc::channel(CAPTURE_BACKLOG);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(CapturedFrame::silence()).await.is_err() {
                    break;
                }
            }
            tracing::debug!(target = "media.capture", "silence capture stopped");
        });
        Ok(rx)
    }
}

/// Discards received audio.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn play(&self, _opus: &[u8]) -> Option<Vec<f32>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_timeout::tokio_timeout_test;

    #[tokio_timeout_test(5, paused)]
    async fn silence_capture_paces_frames() {
        let mut frames = SilenceCapture.open().expect("open");
        let start = tokio::time::Instant::now();
        for _ in 0..5 {
            let frame = frames.recv().await.expect("frame");
            assert_eq!(frame.opus.as_ref(), OPUS_SILENCE);
            assert_eq!(frame.pcm.len(), FRAME_SAMPLES);
        }
        // the first tick fires immediately
        assert_eq!(start.elapsed(), FRAME_DURATION * 4);
    }
}
