//! State owned by one call attempt.
//!
//! A [`CallSession`] exists from the moment a call is started locally or an
//! offer arrives until it ends. Its [`SessionState`] carries exactly the
//! resources that are valid in that phase, so dropping the state releases
//! them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CallError, CallResult};
use crate::media::{LocalAudio, MediaError, PeerConnection, Playback, RemoteAudio};
use crate::protocol::{IceCandidate, Identity, SessionDescription};
use crate::volume::VolumeMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Idle,
    Originating,
    AwaitingAnswer,
    Ringing,
    Active,
    /// Transient: resources are being released. Never observed at rest.
    Ended,
}

impl CallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Originating => "originating",
            CallPhase::AwaitingAnswer => "awaiting-answer",
            CallPhase::Ringing => "ringing",
            CallPhase::Active => "active",
            CallPhase::Ended => "ended",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Identifies one call attempt so late results of suspended work can be
/// matched against the session that is current when they land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn first() -> Self {
        Self(1)
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// This side hung up or cancelled.
    LocalHangup,
    /// The partner sent EndCall.
    RemoteHangup,
    /// The incoming call was declined locally.
    Declined,
    /// The active chat partner changed.
    PartnerSwitched,
    /// The chat was closed.
    ChatClosed,
    /// Acquiring or negotiating media failed.
    Failed(String),
    /// The partner restarted negotiation with a fresh offer.
    Renegotiated,
    /// The agent shut down.
    Shutdown,
}

/// Candidates that arrived before a remote description could take them.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Removes every buffered candidate in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[derive(Default)]
struct StagingSlot {
    local: Option<Arc<dyn LocalAudio>>,
    connection: Option<Arc<dyn PeerConnection>>,
    released: bool,
}

/// Resources acquired by an in-flight pipeline, reachable from the agent so
/// teardown can release them without waiting for the pipeline to notice.
#[derive(Default)]
pub(crate) struct Staging {
    slot: Mutex<StagingSlot>,
}

impl Staging {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the captured stream. Fails, releasing it, when the session
    /// was torn down while the capture was pending.
    pub(crate) fn hold_audio(&self, audio: Arc<dyn LocalAudio>) -> Result<(), MediaError> {
        let mut slot = self.slot.lock();
        if slot.released {
            drop(slot);
            audio.stop();
            return Err(MediaError::Closed);
        }
        slot.local = Some(audio);
        Ok(())
    }

    pub(crate) fn hold_connection(
        &self,
        connection: Arc<dyn PeerConnection>,
    ) -> Result<(), MediaError> {
        let mut slot = self.slot.lock();
        if slot.released {
            drop(slot);
            connection.close();
            return Err(MediaError::Closed);
        }
        slot.connection = Some(connection);
        Ok(())
    }

    /// Hands both resources over to the session. `None` once released or if
    /// either is missing.
    pub(crate) fn take(&self) -> Option<MediaResources> {
        let mut slot = self.slot.lock();
        if slot.released {
            return None;
        }
        slot.released = true;
        match (slot.local.take(), slot.connection.take()) {
            (Some(local), Some(connection)) => Some(MediaResources { local, connection }),
            (local, connection) => {
                drop(slot);
                release_parts(local, connection);
                None
            }
        }
    }

    pub(crate) fn release(&self) {
        let mut slot = self.slot.lock();
        slot.released = true;
        let local = slot.local.take();
        let connection = slot.connection.take();
        drop(slot);
        release_parts(local, connection);
    }
}

fn release_parts(local: Option<Arc<dyn LocalAudio>>, connection: Option<Arc<dyn PeerConnection>>) {
    if let Some(connection) = connection {
        connection.close();
    }
    if let Some(local) = local {
        local.stop();
    }
}

/// Local stream plus the peer connection carrying it. Released on drop.
pub(crate) struct MediaResources {
    pub(crate) local: Arc<dyn LocalAudio>,
    pub(crate) connection: Arc<dyn PeerConnection>,
}

impl Drop for MediaResources {
    fn drop(&mut self) {
        self.connection.close();
        self.local.stop();
    }
}

/// A spawned acquire/negotiate pipeline and the caller waiting on it.
pub(crate) struct Negotiation {
    pub(crate) staging: Arc<Staging>,
    pub(crate) task: JoinHandle<()>,
    pub(crate) reply: Option<oneshot::Sender<CallResult<()>>>,
}

impl Negotiation {
    pub(crate) fn respond(&mut self, result: CallResult<()>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl Drop for Negotiation {
    fn drop(&mut self) {
        self.staging.release();
        self.task.abort();
        self.respond(Err(CallError::Superseded));
    }
}

/// Remote input for a connection, applied in submission order.
#[derive(Debug)]
pub(crate) enum RemoteWork {
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Task applying [`RemoteWork`] to one connection so the agent never waits
/// on the engine. Aborted on drop.
pub(crate) struct RemoteApplier {
    work: mpsc::UnboundedSender<RemoteWork>,
    task: JoinHandle<()>,
}

impl RemoteApplier {
    pub(crate) fn new(work: mpsc::UnboundedSender<RemoteWork>, task: JoinHandle<()>) -> Self {
        Self { work, task }
    }

    pub(crate) fn submit(&self, item: RemoteWork) {
        let _ = self.work.send(item);
    }
}

impl Drop for RemoteApplier {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Media of a session whose connection exists.
pub(crate) struct Connected {
    pub(crate) media: MediaResources,
    pub(crate) applier: RemoteApplier,
    /// The partner's answer was handed to the applier and has not landed yet.
    pub(crate) answer_in_flight: bool,
    pub(crate) remote: Option<Box<dyn RemoteAudio>>,
    pub(crate) local_monitor: Option<VolumeMonitor>,
    pub(crate) remote_monitor: Option<VolumeMonitor>,
}

impl Connected {
    pub(crate) fn new(media: MediaResources, applier: RemoteApplier) -> Self {
        Self {
            media,
            applier,
            answer_in_flight: false,
            remote: None,
            local_monitor: None,
            remote_monitor: None,
        }
    }
}

impl Drop for Connected {
    fn drop(&mut self) {
        self.local_monitor.take();
        self.remote_monitor.take();
        if let Some(remote) = self.remote.take() {
            remote.stop();
        }
    }
}

pub(crate) enum SessionState {
    Originating(Negotiation),
    AwaitingAnswer(Connected),
    Ringing {
        offer: SessionDescription,
        ringtone: Option<Box<dyn Playback>>,
        accepting: Option<Negotiation>,
    },
    Active(Connected),
}

impl SessionState {
    pub(crate) fn phase(&self) -> CallPhase {
        match self {
            SessionState::Originating(_) => CallPhase::Originating,
            SessionState::AwaitingAnswer(_) => CallPhase::AwaitingAnswer,
            SessionState::Ringing { .. } => CallPhase::Ringing,
            SessionState::Active(_) => CallPhase::Active,
        }
    }
}

pub(crate) struct CallSession {
    pub(crate) id: SessionId,
    pub(crate) role: Role,
    pub(crate) partner: Identity,
    pub(crate) pending: PendingCandidates,
    pub(crate) mic_enabled: bool,
    pub(crate) state: SessionState,
}

impl CallSession {
    pub(crate) fn new(id: SessionId, role: Role, partner: Identity, state: SessionState) -> Self {
        Self {
            id,
            role,
            partner,
            pending: PendingCandidates::default(),
            mic_enabled: true,
            state,
        }
    }

    pub(crate) fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    /// Live connection, if this phase has one.
    pub(crate) fn connected_mut(&mut self) -> Option<&mut Connected> {
        match &mut self.state {
            SessionState::AwaitingAnswer(connected) | SessionState::Active(connected) => {
                Some(connected)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::{MockEngine, MockLocalAudio};
    use crate::media::MediaEngine;
    use test_timeout::tokio_timeout_test;

    #[test]
    fn pending_candidates_drain_fifo() {
        let mut pending = PendingCandidates::default();
        for n in 0..3 {
            pending.push(IceCandidate::new(format!("candidate:{n}")));
        }
        let drained: Vec<_> = pending.drain().map(|c| c.candidate).collect();
        assert_eq!(drained, ["candidate:0", "candidate:1", "candidate:2"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn phase_names_are_stable() {
        assert_eq!(CallPhase::AwaitingAnswer.to_string(), "awaiting-answer");
        assert_eq!(CallPhase::Idle.to_string(), "idle");
    }

    #[tokio_timeout_test(5)]
    async fn released_staging_refuses_late_resources() {
        let engine = MockEngine::new();
        let staging = Staging::new();
        staging.release();

        let audio: Arc<dyn LocalAudio> = Arc::from(engine.acquire_local_audio().await.expect("audio"));
        assert_eq!(staging.hold_audio(audio.clone()), Err(MediaError::Closed));
        assert!(!audio.is_live());

        let link = engine.create_peer_connection(&[]).await.expect("pc");
        assert!(staging.hold_connection(link.connection).is_err());
        assert_eq!(engine.closed_connections(), 1);
        assert!(staging.take().is_none());
    }

    #[tokio_timeout_test(5)]
    async fn dropping_media_resources_releases_both() {
        let engine = MockEngine::new();
        let staging = Staging::new();
        let audio: Arc<dyn LocalAudio> = Arc::from(engine.acquire_local_audio().await.expect("audio"));
        staging.hold_audio(audio.clone()).expect("hold");
        let link = engine.create_peer_connection(&[]).await.expect("pc");
        staging.hold_connection(link.connection).expect("hold");

        let media = staging.take().expect("both held");
        assert!(audio.is_live());
        drop(media);
        assert!(!audio.is_live());
        assert!(audio.as_any().downcast_ref::<MockLocalAudio>().is_some());
        assert_eq!(engine.closed_connections(), 1);
    }
}
