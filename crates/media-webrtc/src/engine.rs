use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use call_signaling::config::IceServer;
use call_signaling::media::{
    LocalAudio, MediaEngine, MediaError, PeerConnection, PeerEvent, PeerLink, Playback,
    RemoteAudio,
};
use call_signaling::protocol::{IceCandidate, SessionDescription};
use call_signaling::ringtone::RingTone;
use call_signaling::volume::{LevelSource, LevelTap};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecTable, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::capture::{AudioCapture, AudioSink, CapturedFrame, FRAME_DURATION, OPUS_SILENCE};
use crate::convert;

const TAP_CAPACITY: usize = 4096;
const RTCP_BUFFER: usize = 1500;

pub struct WebRtcEngine {
    api: API,
    capture: Arc<dyn AudioCapture>,
    sink: Arc<dyn AudioSink>,
}

impl WebRtcEngine {
    pub fn new(
        capture: Arc<dyn AudioCapture>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self, MediaError> {
        let mut codecs = CodecTable::default();
        codecs
            .register_default_codecs()
            .map_err(convert::engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(convert::engine_error)?;
        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, capture, sink })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError> {
        let frames = self.capture.open()?;
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "call".to_owned(),
        ));
        info!(target = "media.webrtc", "microphone capture started");
        Ok(Box::new(WebRtcLocalAudio::start(track, frames)))
    }

    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<PeerLink, MediaError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(convert::ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(convert::engine_error)?,
        );
        let (events_tx, events) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(convert::candidate_from_rtc(init)));
                    }
                    Err(err) => {
                        warn!(target = "media.webrtc", error = %err, "could not serialize local candidate")
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(target = "media.webrtc", ?state, "peer connection state changed");
                if let Some(state) = convert::peer_state(state) {
                    let _ = tx.send(PeerEvent::StateChanged(state));
                }
            })
        }));

        let sink = Arc::clone(&self.sink);
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = events_tx.clone();
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    debug!(target = "media.webrtc", kind = %track.kind(), "ignoring non-audio track");
                    return;
                }
                info!(target = "media.webrtc", ssrc = track.ssrc(), "remote audio track received");
                let remote = WebRtcRemoteAudio::start(track, sink);
                let _ = tx.send(PeerEvent::RemoteAudio(Box::new(remote)));
            })
        }));

        let connection = Arc::new(WebRtcPeerConnection {
            pc,
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        Ok(PeerLink { connection, events })
    }

    fn play_ringtone(&self, tone: RingTone) -> Option<Box<dyn Playback>> {
        let sink = Arc::clone(&self.sink);
        let chunk = (tone.sample_rate as usize * FRAME_DURATION.as_millis() as usize) / 1000;
        let task = tokio::spawn(async move {
            let mut samples = tone.samples();
            let mut buffer = vec![0.0f32; chunk];
            let mut ticker = tokio::time::interval(FRAME_DURATION);
            loop {
                ticker.tick().await;
                for (slot, sample) in buffer.iter_mut().zip(&mut samples) {
                    *slot = sample;
                }
                sink.ring(&buffer);
            }
        });
        Some(Box::new(RingPlayback { task }))
    }
}

struct RingPlayback {
    task: JoinHandle<()>,
}

impl Playback for RingPlayback {}

impl Drop for RingPlayback {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Captured microphone audio feeding one Opus track.
pub struct WebRtcLocalAudio {
    track: Arc<TrackLocalStaticSample>,
    tap: Arc<LevelTap>,
    enabled: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcLocalAudio {
    fn start(track: Arc<TrackLocalStaticSample>, mut frames: mpsc::Receiver<CapturedFrame>) -> Self {
        let tap = LevelTap::new(TAP_CAPACITY);
        let enabled = Arc::new(AtomicBool::new(true));
        let pump = {
            let track = Arc::clone(&track);
            let tap = Arc::clone(&tap);
            let enabled = Arc::clone(&enabled);
            tokio::spawn(async move {
                while let Some(frame) = frames.recv().await {
                    let sample = if enabled.load(Ordering::Relaxed) {
                        tap.push(&frame.pcm);
                        Sample {
                            data: frame.opus,
                            duration: frame.duration,
                            ..Default::default()
                        }
                    } else {
                        // a muted track keeps sending silence
                        tap.push(&vec![0.0; frame.pcm.len()]);
                        Sample {
                            data: Bytes::from_static(&OPUS_SILENCE),
                            duration: frame.duration,
                            ..Default::default()
                        }
                    };
                    if let Err(err) = track.write_sample(&sample).await {
                        debug!(target = "media.webrtc", error = %err, "dropping captured frame");
                    }
                }
            })
        };
        Self {
            track,
            tap,
            enabled,
            pump: Mutex::new(Some(pump)),
        }
    }
}

impl LocalAudio for WebRtcLocalAudio {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn stop(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
            info!(target = "media.webrtc", "microphone capture stopped");
        }
        self.tap.close();
    }

    fn is_live(&self) -> bool {
        self.pump.lock().is_some()
    }

    fn level_source(&self) -> Arc<dyn LevelSource> {
        self.tap.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inbound audio track, drained into the [`AudioSink`] until stopped.
pub struct WebRtcRemoteAudio {
    tap: Arc<LevelTap>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcRemoteAudio {
    fn start(track: Arc<TrackRemote>, sink: Arc<dyn AudioSink>) -> Self {
        let tap = LevelTap::new(TAP_CAPACITY);
        let reader = {
            let tap = Arc::clone(&tap);
            tokio::spawn(async move {
                loop {
                    match track.read_rtp().await {
                        Ok((packet, _)) => {
                            if let Some(pcm) = sink.play(&packet.payload) {
                                tap.push(&pcm);
                            }
                        }
                        Err(err) => {
                            debug!(target = "media.webrtc", error = %err, "remote track ended");
                            break;
                        }
                    }
                }
                tap.close();
            })
        };
        Self {
            tap,
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl RemoteAudio for WebRtcRemoteAudio {
    fn stop(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.tap.close();
    }

    fn level_source(&self) -> Arc<dyn LevelSource> {
        self.tap.clone()
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl WebRtcPeerConnection {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), MediaError> {
        self.ensure_open()?;
        let local = audio
            .as_any()
            .downcast_ref::<WebRtcLocalAudio>()
            .ok_or_else(|| MediaError::Engine("audio was not captured by this engine".into()))?;
        let track: Arc<dyn TrackLocal + Send + Sync> = local.track.clone();
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(convert::engine_error)?;
        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buffer = vec![0u8; RTCP_BUFFER];
            while sender.read(&mut buffer).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(convert::negotiation_error)?;
        convert::description_from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(convert::negotiation_error)?;
        convert::description_from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(convert::description_to_rtc(desc)?)
            .await
            .map_err(convert::negotiation_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(convert::description_to_rtc(desc)?)
            .await
            .map_err(convert::negotiation_error)?;
        self.remote_set.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(convert::candidate_to_rtc(candidate))
            .await
            .map_err(convert::negotiation_error)
    }

    fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = Arc::clone(&self.pc);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = pc.close().await {
                        warn!(target = "media.webrtc", error = %err, "peer connection close failed");
                    }
                });
            }
            Err(_) => {
                warn!(target = "media.webrtc", "no runtime to close the peer connection on");
            }
        }
    }
}
