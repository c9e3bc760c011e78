//! webrtc-rs implementation of [`call_signaling::MediaEngine`].
//!
//! Audio goes out as a single Opus track. Capture and playback devices stay
//! outside this crate behind [`AudioCapture`] and [`AudioSink`].

pub mod capture;
mod convert;
pub mod engine;

pub use capture::{AudioCapture, AudioSink, CapturedFrame, NullSink, SilenceCapture};
pub use engine::{WebRtcEngine, WebRtcLocalAudio, WebRtcPeerConnection, WebRtcRemoteAudio};
