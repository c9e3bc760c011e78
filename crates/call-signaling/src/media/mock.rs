//! In-memory [`MediaEngine`] with scriptable failures and full bookkeeping.
//!
//! Every stream and connection it hands out stays inspectable through the
//! engine, so tests can assert on released tracks, closed connections and
//! the exact order candidates were applied in.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{
    LocalAudio, MediaEngine, MediaError, PeerConnection, PeerEvent, PeerLink, Playback,
    RemoteAudio,
};
use crate::config::IceServer;
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::ringtone::RingTone;
use crate::volume::{LevelSource, LevelTap};

const TAP_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireScript {
    Grant,
    Deny,
    NoDevice,
}

struct Shared {
    acquire: Mutex<AcquireScript>,
    reject_remote: AtomicBool,
    gathered_candidates: AtomicUsize,
    acquire_gate: watch::Sender<bool>,
    offer_gate: watch::Sender<bool>,
    answer_gate: watch::Sender<bool>,
    acquire_requests: AtomicUsize,
    offer_requests: AtomicUsize,
    answer_requests: AtomicUsize,
    audios: Mutex<Vec<MockLocalAudio>>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    ringing: AtomicUsize,
    rings_started: AtomicUsize,
}

#[derive(Clone)]
pub struct MockEngine {
    shared: Arc<Shared>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                acquire: Mutex::new(AcquireScript::Grant),
                reject_remote: AtomicBool::new(false),
                gathered_candidates: AtomicUsize::new(0),
                acquire_gate: watch::channel(true).0,
                offer_gate: watch::channel(true).0,
                answer_gate: watch::channel(true).0,
                acquire_requests: AtomicUsize::new(0),
                offer_requests: AtomicUsize::new(0),
                answer_requests: AtomicUsize::new(0),
                audios: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                ringing: AtomicUsize::new(0),
                rings_started: AtomicUsize::new(0),
            }),
        }
    }

    /// Microphone requests fail with [`MediaError::PermissionDenied`].
    pub fn deny_permission(&self) {
        *self.shared.acquire.lock() = AcquireScript::Deny;
    }

    pub fn remove_device(&self) {
        *self.shared.acquire.lock() = AcquireScript::NoDevice;
    }

    pub fn grant_permission(&self) {
        *self.shared.acquire.lock() = AcquireScript::Grant;
    }

    /// Every `set_remote_description` fails with a negotiation error.
    pub fn reject_remote_descriptions(&self, reject: bool) {
        self.shared.reject_remote.store(reject, Ordering::SeqCst);
    }

    /// Each connection emits `count` local candidates after its local
    /// description is set.
    pub fn gather_candidates(&self, count: usize) {
        self.shared.gathered_candidates.store(count, Ordering::SeqCst);
    }

    /// Microphone requests block until [`release_acquisition`](Self::release_acquisition).
    pub fn hold_acquisition(&self) {
        self.shared.acquire_gate.send_replace(false);
    }

    pub fn release_acquisition(&self) {
        self.shared.acquire_gate.send_replace(true);
    }

    /// Offer creation blocks until [`release_offers`](Self::release_offers).
    pub fn hold_offers(&self) {
        self.shared.offer_gate.send_replace(false);
    }

    pub fn release_offers(&self) {
        self.shared.offer_gate.send_replace(true);
    }

    /// Applying a remote answer blocks until [`release_answers`](Self::release_answers).
    pub fn hold_answers(&self) {
        self.shared.answer_gate.send_replace(false);
    }

    pub fn release_answers(&self) {
        self.shared.answer_gate.send_replace(true);
    }

    pub fn acquire_requests(&self) -> usize {
        self.shared.acquire_requests.load(Ordering::SeqCst)
    }

    pub fn offer_requests(&self) -> usize {
        self.shared.offer_requests.load(Ordering::SeqCst)
    }

    /// Remote answers handed to any connection, including held ones.
    pub fn answer_requests(&self) -> usize {
        self.shared.answer_requests.load(Ordering::SeqCst)
    }

    /// Every stream handed out so far, in acquisition order.
    pub fn audios(&self) -> Vec<MockLocalAudio> {
        self.shared.audios.lock().clone()
    }

    pub fn live_audio_count(&self) -> usize {
        self.shared
            .audios
            .lock()
            .iter()
            .filter(|audio| audio.is_live())
            .count()
    }

    /// Every connection created so far, in creation order.
    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        self.shared.connections.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<MockPeerConnection>> {
        self.shared.connections.lock().last().cloned()
    }

    pub fn closed_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|pc| pc.is_closed())
            .count()
    }

    pub fn is_ringing(&self) -> bool {
        self.shared.ringing.load(Ordering::SeqCst) > 0
    }

    pub fn rings_started(&self) -> usize {
        self.shared.rings_started.load(Ordering::SeqCst)
    }
}

async fn pass_gate(gate: &watch::Sender<bool>) {
    let mut rx = gate.subscribe();
    // the sender lives in the engine, so the channel cannot close here
    let _ = rx.wait_for(|open| *open).await;
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError> {
        self.shared.acquire_requests.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.shared.acquire_gate).await;
        match *self.shared.acquire.lock() {
            AcquireScript::Grant => {}
            AcquireScript::Deny => return Err(MediaError::PermissionDenied),
            AcquireScript::NoDevice => return Err(MediaError::NoDevice),
        }
        let audio = MockLocalAudio::new();
        self.shared.audios.lock().push(audio.clone());
        Ok(Box::new(audio))
    }

    async fn create_peer_connection(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<PeerLink, MediaError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut connections = self.shared.connections.lock();
        let connection = Arc::new(MockPeerConnection {
            index: connections.len(),
            shared: Arc::clone(&self.shared),
            events: events_tx,
            state: Mutex::new(PeerSnapshot::default()),
        });
        connections.push(Arc::clone(&connection));
        Ok(PeerLink { connection, events })
    }

    fn play_ringtone(&self, _tone: RingTone) -> Option<Box<dyn Playback>> {
        self.shared.ringing.fetch_add(1, Ordering::SeqCst);
        self.shared.rings_started.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MockRing {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockRing {
    shared: Arc<Shared>,
}

impl Playback for MockRing {}

impl Drop for MockRing {
    fn drop(&mut self) {
        self.shared.ringing.fetch_sub(1, Ordering::SeqCst);
    }
}

struct AudioState {
    live: AtomicBool,
    enabled: AtomicBool,
    tap: Arc<LevelTap>,
}

/// Captured stream handle. Clones observe the same stream.
#[derive(Clone)]
pub struct MockLocalAudio {
    state: Arc<AudioState>,
}

impl MockLocalAudio {
    fn new() -> Self {
        Self {
            state: Arc::new(AudioState {
                live: AtomicBool::new(true),
                enabled: AtomicBool::new(true),
                tap: LevelTap::new(TAP_CAPACITY),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    /// Feeds captured samples to the level tap.
    pub fn speak(&self, pcm: &[f32]) {
        self.state.tap.push(pcm);
    }
}

impl LocalAudio for MockLocalAudio {
    fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.state.live.store(false, Ordering::SeqCst);
        self.state.tap.close();
    }

    fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }

    fn level_source(&self) -> Arc<dyn LevelSource> {
        self.state.tap.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inbound stream injected through [`MockPeerConnection::emit_remote_audio`].
#[derive(Clone)]
pub struct MockRemoteAudio {
    playing: Arc<AtomicBool>,
    tap: Arc<LevelTap>,
}

impl MockRemoteAudio {
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    pub fn speak(&self, pcm: &[f32]) {
        self.tap.push(pcm);
    }
}

impl RemoteAudio for MockRemoteAudio {
    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        self.tap.close();
    }

    fn level_source(&self) -> Arc<dyn LevelSource> {
        self.tap.clone()
    }
}

#[derive(Default)]
struct PeerSnapshot {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks: usize,
    closed: bool,
}

pub struct MockPeerConnection {
    index: usize,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerSnapshot>,
}

impl MockPeerConnection {
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks
    }

    /// Pushes an engine event to whoever owns the connection. Returns false
    /// once nobody listens.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn emit_remote_audio(&self) -> MockRemoteAudio {
        let remote = MockRemoteAudio {
            playing: Arc::new(AtomicBool::new(true)),
            tap: LevelTap::new(TAP_CAPACITY),
        };
        self.emit(PeerEvent::RemoteAudio(Box::new(remote.clone())));
        remote
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.state.lock().closed {
            return Err(MediaError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), MediaError> {
        self.ensure_open()?;
        if !audio.is_live() {
            return Err(MediaError::Engine("track already stopped".into()));
        }
        self.state.lock().tracks += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.shared.offer_requests.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.shared.offer_gate).await;
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("v=0 mock-offer pc{}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        if self.state.lock().remote.is_none() {
            return Err(MediaError::Negotiation("no remote offer to answer".into()));
        }
        Ok(SessionDescription::answer(format!("v=0 mock-answer pc{}", self.index)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        self.ensure_open()?;
        self.state.lock().local = Some(desc);
        let gathered = self.shared.gathered_candidates.load(Ordering::SeqCst);
        for n in 0..gathered {
            let mut candidate = IceCandidate::new(format!("candidate:pc{}:{n}", self.index));
            candidate.sdp_mid = Some("0".into());
            candidate.sdp_mline_index = Some(0);
            self.emit(PeerEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MediaError> {
        if desc.sdp_type == SdpType::Answer {
            self.shared.answer_requests.fetch_add(1, Ordering::SeqCst);
            pass_gate(&self.shared.answer_gate).await;
        }
        self.ensure_open()?;
        if self.shared.reject_remote.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("remote description rejected".into()));
        }
        self.state.lock().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(MediaError::Negotiation("remote description not set".into()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}
