//! Event loop driving the call state machine for one local user.
//!
//! A single task owns every piece of call state. User commands, inbound
//! relay messages, peer connection events and the results of suspended
//! media work are all funnelled into it and handled one at a time, so no
//! handler observes another half-way through.
//!
//! Media acquisition and description generation can take arbitrarily long
//! (a permission prompt, for one), so they run in child tasks tagged with the
//! session they were started for. Their results are applied only while that
//! session is still current; tearing a session down releases whatever they
//! acquired and aborts them. The partner's answer and candidates go through a
//! per-connection task for the same reason, so a hang-up never waits on the
//! engine.

use std::sync::Arc;

use relay_bus::Relay;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelHandle, SignalingChannel};
use crate::config::{CallConfig, IceServer};
use crate::directory::Directory;
use crate::error::{CallError, CallResult, ChannelError};
use crate::media::{LocalAudio, MediaEngine, MediaError, PeerConnection, PeerEvent, PeerLink, PeerState};
use crate::protocol::{CallSignal, Envelope, IceCandidate, Identity, SessionDescription, SignalPayload};
use crate::ringtone::RingTone;
use crate::session::{
    CallPhase, CallSession, Connected, EndReason, Negotiation, RemoteApplier, RemoteWork, Role,
    SessionId, SessionState, Staging,
};
use crate::typing::{TypingIndicator, TypingNotifier};
use crate::volume::{VolumeMeter, VolumeMonitor, VolumeReadings};

const EVENT_CAPACITY: usize = 64;

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    IncomingCall { from: Identity },
    CallEnded { partner: Identity, reason: EndReason },
    /// The signaling subscription could not be (re)acquired or was lost.
    /// An active call keeps running.
    ChannelFailed { partner: Identity, error: String },
    RemoteAudioStarted,
    ConnectionStateChanged(PeerState),
    PartnerTyping { partner: Identity, is_typing: bool },
}

/// Snapshot of the agent, published after every handled input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub phase: CallPhase,
    pub chat_partner: Option<Identity>,
    pub subscribed: bool,
    pub role: Option<Role>,
    pub call_partner: Option<Identity>,
    pub mic_enabled: bool,
    pub partner_typing: bool,
}

impl Default for CallStatus {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            chat_partner: None,
            subscribed: false,
            role: None,
            call_partner: None,
            mic_enabled: true,
            partner_typing: false,
        }
    }
}

type Reply<T> = oneshot::Sender<CallResult<T>>;

fn respond<T>(reply: Option<Reply<T>>, result: CallResult<T>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

enum Command {
    OpenChat { partner: Identity, reply: Reply<()> },
    CloseChat { reply: Reply<()> },
    StartCall { reply: Reply<()> },
    AcceptCall { reply: Reply<()> },
    DeclineCall { reply: Reply<()> },
    EndCall { reply: Reply<()> },
    SetMic { enabled: bool, reply: Reply<()> },
    InputChanged { reply: Reply<()> },
    Shutdown { reply: oneshot::Sender<()> },
}

struct Prepared {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    description: SessionDescription,
}

enum Completion {
    Prepared {
        session: SessionId,
        result: Result<Prepared, MediaError>,
    },
    AnswerApplied {
        session: SessionId,
        result: Result<(), MediaError>,
    },
    Subscribed {
        generation: u64,
        result: Result<ChannelHandle, ChannelError>,
    },
}

enum Input {
    Command(Command),
    HandlesDropped,
    Inbound(Result<Envelope, ChannelError>),
    Peer(SessionId, Option<PeerEvent>),
    Completion(Completion),
}

struct PendingSubscription {
    generation: u64,
    task: JoinHandle<()>,
    reply: Option<Reply<()>>,
}

impl Drop for PendingSubscription {
    fn drop(&mut self) {
        self.task.abort();
        respond(self.reply.take(), Err(CallError::Superseded));
    }
}

/// Client side of a running agent. Cheap to clone; the agent stops once
/// [`shutdown`](Self::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    self_id: Identity,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<CallStatus>,
    events: broadcast::Sender<CallEvent>,
    local_volume: VolumeMeter,
    remote_volume: VolumeMeter,
}

impl CallHandle {
    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    async fn request(&self, command: impl FnOnce(Reply<()>) -> Command) -> CallResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::AgentClosed)?;
        rx.await.map_err(|_| CallError::AgentClosed)?
    }

    /// Makes `partner` the active chat partner. Any call with the previous
    /// partner ends first, then the signaling subscription is re-acquired.
    pub async fn open_chat(&self, partner: impl Into<Identity>) -> CallResult<()> {
        let partner = partner.into();
        self.request(|reply| Command::OpenChat { partner, reply }).await
    }

    pub async fn close_chat(&self) -> CallResult<()> {
        self.request(|reply| Command::CloseChat { reply }).await
    }

    /// Calls the chat partner. Resolves once the offer is on its way.
    pub async fn start_call(&self) -> CallResult<()> {
        self.request(|reply| Command::StartCall { reply }).await
    }

    /// Accepts the ringing call. Resolves once the call is active.
    pub async fn accept_call(&self) -> CallResult<()> {
        self.request(|reply| Command::AcceptCall { reply }).await
    }

    pub async fn decline_call(&self) -> CallResult<()> {
        self.request(|reply| Command::DeclineCall { reply }).await
    }

    /// Hangs up in any phase. A no-op when idle.
    pub async fn end_call(&self) -> CallResult<()> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn set_mic_enabled(&self, enabled: bool) -> CallResult<()> {
        self.request(|reply| Command::SetMic { enabled, reply }).await
    }

    /// Reports a local edit in the chat input.
    pub async fn input_changed(&self) -> CallResult<()> {
        self.request(|reply| Command::InputChanged { reply }).await
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Waits until the agent reaches `phase`.
    pub async fn wait_for_phase(&self, phase: CallPhase) -> CallResult<CallStatus> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|status| status.phase == phase)
            .await
            .map_err(|_| CallError::AgentClosed)?;
        Ok(reached.clone())
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn local_volume(&self) -> VolumeReadings {
        self.local_volume.readings()
    }

    pub fn remote_volume(&self) -> VolumeReadings {
        self.remote_volume.readings()
    }

    /// Ends any call, leaves the chat and stops the agent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct CallAgent {
    self_id: Identity,
    channel: SignalingChannel,
    engine: Arc<dyn MediaEngine>,
    directory: Arc<dyn Directory>,
    config: CallConfig,

    chat_partner: Option<Identity>,
    inbound: Option<ChannelHandle>,
    pending_subscription: Option<PendingSubscription>,
    subscription_generation: u64,
    typing: Option<TypingNotifier>,
    indicator: TypingIndicator,

    session: Option<CallSession>,
    next_session: SessionId,
    peer_events: Option<(SessionId, mpsc::UnboundedReceiver<PeerEvent>)>,
    completions: mpsc::UnboundedSender<Completion>,

    status: watch::Sender<CallStatus>,
    events: broadcast::Sender<CallEvent>,
    local_volume: VolumeMeter,
    remote_volume: VolumeMeter,
}

impl CallAgent {
    /// Starts the agent for `self_id` on the current tokio runtime.
    pub fn spawn(
        self_id: impl Into<Identity>,
        relay: Arc<dyn Relay>,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn Directory>,
        config: CallConfig,
    ) -> CallHandle {
        let self_id = self_id.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let local_volume = VolumeMeter::new();
        let remote_volume = VolumeMeter::new();

        let agent = CallAgent {
            channel: SignalingChannel::new(relay, self_id.clone()),
            self_id: self_id.clone(),
            engine,
            directory,
            config,
            chat_partner: None,
            inbound: None,
            pending_subscription: None,
            subscription_generation: 0,
            typing: None,
            indicator: TypingIndicator::new(),
            session: None,
            next_session: SessionId::first(),
            peer_events: None,
            completions: completions_tx,
            status: status_tx,
            events: events_tx.clone(),
            local_volume: local_volume.clone(),
            remote_volume: remote_volume.clone(),
        };
        tokio::spawn(agent.run(commands_rx, completions_rx));

        CallHandle {
            self_id,
            commands: commands_tx,
            status: status_rx,
            events: events_tx,
            local_volume,
            remote_volume,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!(target = "call.agent", self_id = %self.self_id, "call agent started");
        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => Input::HandlesDropped,
                },
                message = next_inbound(&mut self.inbound) => Input::Inbound(message),
                (session, event) = next_peer_event(&mut self.peer_events) => Input::Peer(session, event),
                Some(completion) = completions.recv() => Input::Completion(completion),
            };
            let keep_running = self.handle(input);
            self.sync_status();
            if !keep_running {
                break;
            }
        }
        info!(target = "call.agent", self_id = %self.self_id, "call agent stopped");
    }

    fn handle(&mut self, input: Input) -> bool {
        match input {
            Input::Command(Command::Shutdown { reply }) => {
                self.leave_chat(EndReason::Shutdown);
                let _ = reply.send(());
                return false;
            }
            Input::HandlesDropped => {
                self.leave_chat(EndReason::Shutdown);
                return false;
            }
            Input::Command(command) => self.on_command(command),
            Input::Inbound(Ok(envelope)) => self.on_envelope(envelope),
            Input::Inbound(Err(err)) => self.on_channel_lost(err),
            Input::Peer(session, Some(event)) => self.on_peer_event(session, event),
            Input::Peer(session, None) => {
                debug!(target = "call.agent", %session, "peer event stream ended");
                self.peer_events = None;
            }
            Input::Completion(Completion::Prepared { session, result }) => {
                self.on_prepared(session, result)
            }
            Input::Completion(Completion::AnswerApplied { session, result }) => {
                self.on_answer_applied(session, result)
            }
            Input::Completion(Completion::Subscribed { generation, result }) => {
                self.on_subscribed(generation, result)
            }
        }
        true
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::OpenChat { partner, reply } => self.open_chat(partner, reply),
            Command::CloseChat { reply } => {
                self.leave_chat(EndReason::ChatClosed);
                let _ = reply.send(Ok(()));
            }
            Command::StartCall { reply } => self.start_call(reply),
            Command::AcceptCall { reply } => self.accept_call(reply),
            Command::DeclineCall { reply } => {
                let result = self.decline_call();
                self.sync_status();
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                self.end_session(EndReason::LocalHangup, true);
                let _ = reply.send(Ok(()));
            }
            Command::SetMic { enabled, reply } => {
                let result = self.set_mic(enabled);
                self.sync_status();
                let _ = reply.send(result);
            }
            Command::InputChanged { reply } => {
                let result = match self.typing.as_mut() {
                    Some(typing) => typing.input_changed().map_err(CallError::from),
                    None => Err(CallError::NoPartner),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { .. } => {}
        }
    }

    // ---- chat partner and subscription ----

    fn open_chat(&mut self, partner: Identity, reply: Reply<()>) {
        if self.directory.lookup(&partner).is_none() {
            let _ = reply.send(Err(CallError::UnknownPeer(partner)));
            return;
        }
        if self.chat_partner.as_ref() == Some(&partner) {
            if self.inbound.is_some() {
                let _ = reply.send(Ok(()));
            } else {
                self.subscribe(partner, Some(reply));
            }
            return;
        }

        self.leave_chat(EndReason::PartnerSwitched);
        info!(target = "call.agent", %partner, "opening chat");
        self.typing = Some(TypingNotifier::new(
            self.channel.clone(),
            partner.clone(),
            self.config.typing_quiet_period,
        ));
        self.chat_partner = Some(partner.clone());
        self.subscribe(partner, Some(reply));
    }

    /// Ends any call, then releases everything scoped to the chat partner.
    fn leave_chat(&mut self, reason: EndReason) {
        self.end_session(reason, true);
        if let Some(typing) = self.typing.take() {
            typing.finish();
        }
        if let Some(previous) = self.chat_partner.take() {
            self.indicator.clear(&previous);
        }
        if let Some(handle) = self.inbound.take() {
            self.channel.unsubscribe(handle);
        }
        self.pending_subscription = None;
    }

    fn subscribe(&mut self, partner: Identity, reply: Option<Reply<()>>) {
        self.subscription_generation += 1;
        let generation = self.subscription_generation;
        let channel = self.channel.clone();
        let policy = self.config.subscribe_backoff;
        let completions = self.completions.clone();
        let task = tokio::spawn(async move {
            let result = channel.subscribe_with_backoff(&partner, policy).await;
            let _ = completions.send(Completion::Subscribed { generation, result });
        });
        self.pending_subscription = Some(PendingSubscription {
            generation,
            task,
            reply,
        });
    }

    fn on_subscribed(&mut self, generation: u64, result: Result<ChannelHandle, ChannelError>) {
        let current = self
            .pending_subscription
            .as_ref()
            .is_some_and(|pending| pending.generation == generation);
        if !current {
            debug!(target = "call.agent", generation, "discarding stale subscription result");
            return;
        }
        let Some(mut pending) = self.pending_subscription.take() else {
            return;
        };
        let reply = pending.reply.take();
        drop(pending);

        match result {
            Ok(handle) => {
                self.inbound = Some(handle);
                self.sync_status();
                respond(reply, Ok(()));
            }
            Err(err) => {
                let partner = self.chat_partner.clone().unwrap_or_else(|| self.self_id.clone());
                warn!(target = "call.agent", error = %err, %partner, "signaling subscription failed");
                self.emit(CallEvent::ChannelFailed {
                    partner,
                    error: err.to_string(),
                });
                respond(reply, Err(err.into()));
            }
        }
    }

    fn on_channel_lost(&mut self, err: ChannelError) {
        self.inbound = None;
        let Some(partner) = self.chat_partner.clone() else {
            return;
        };
        warn!(target = "call.agent", error = %err, %partner, "signaling subscription lost; re-subscribing");
        self.emit(CallEvent::ChannelFailed {
            partner: partner.clone(),
            error: err.to_string(),
        });
        self.subscribe(partner, None);
    }

    // ---- user actions ----

    fn allocate_session(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session = id.next();
        id
    }

    fn start_call(&mut self, reply: Reply<()>) {
        let Some(partner) = self.chat_partner.clone() else {
            let _ = reply.send(Err(CallError::NoPartner));
            return;
        };
        if let Some(session) = &self.session {
            let _ = reply.send(Err(CallError::InvalidPhase {
                operation: "start call",
                phase: session.phase(),
            }));
            return;
        }
        let id = self.allocate_session();
        info!(target = "call.agent", session = %id, %partner, "starting call");
        let negotiation = self.spawn_negotiation(id, None, reply);
        self.session = Some(CallSession::new(
            id,
            Role::Caller,
            partner,
            SessionState::Originating(negotiation),
        ));
    }

    fn accept_call(&mut self, reply: Reply<()>) {
        let (id, offer) = match self.session.as_mut() {
            Some(CallSession {
                id,
                state:
                    SessionState::Ringing {
                        offer,
                        ringtone,
                        accepting: None,
                    },
                ..
            }) => {
                ringtone.take();
                (*id, offer.clone())
            }
            other => {
                let phase = other.map_or(CallPhase::Idle, |session| session.phase());
                let _ = reply.send(Err(CallError::InvalidPhase {
                    operation: "accept call",
                    phase,
                }));
                return;
            }
        };
        info!(target = "call.agent", session = %id, "accepting call");
        let negotiation = self.spawn_negotiation(id, Some(offer), reply);
        if let Some(CallSession {
            state: SessionState::Ringing { accepting, .. },
            ..
        }) = self.session.as_mut()
        {
            *accepting = Some(negotiation);
        }
    }

    fn decline_call(&mut self) -> CallResult<()> {
        match self.session.as_ref().map(CallSession::phase) {
            Some(CallPhase::Ringing) => {
                self.end_session(EndReason::Declined, true);
                Ok(())
            }
            phase => Err(CallError::InvalidPhase {
                operation: "decline call",
                phase: phase.unwrap_or(CallPhase::Idle),
            }),
        }
    }

    fn set_mic(&mut self, enabled: bool) -> CallResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidPhase {
                operation: "toggle microphone",
                phase: CallPhase::Idle,
            });
        };
        session.mic_enabled = enabled;
        if let Some(connected) = session.connected_mut() {
            connected.media.local.set_enabled(enabled);
        }
        debug!(target = "call.agent", session = %session.id, enabled, "microphone toggled");
        Ok(())
    }

    fn spawn_negotiation(
        &self,
        session: SessionId,
        remote_offer: Option<SessionDescription>,
        reply: Reply<()>,
    ) -> Negotiation {
        let staging = Staging::new();
        let engine = Arc::clone(&self.engine);
        let ice_servers = self.config.ice_servers.clone();
        let completions = self.completions.clone();
        let task_staging = Arc::clone(&staging);
        let task = tokio::spawn(async move {
            let result = prepare(engine, ice_servers, task_staging, remote_offer).await;
            let _ = completions.send(Completion::Prepared { session, result });
        });
        Negotiation {
            staging,
            task,
            reply: Some(reply),
        }
    }

    /// Applies the partner's answer and candidates to `connection` in the
    /// order they are submitted.
    fn spawn_applier(&self, session: SessionId, connection: Arc<dyn PeerConnection>) -> RemoteApplier {
        let (work_tx, mut work) = mpsc::unbounded_channel();
        let completions = self.completions.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = work.recv().await {
                match item {
                    RemoteWork::Answer(answer) => {
                        let result = connection.set_remote_description(answer).await;
                        let _ = completions.send(Completion::AnswerApplied { session, result });
                    }
                    RemoteWork::Candidate(candidate) => {
                        if let Err(err) = connection.add_ice_candidate(candidate).await {
                            warn!(target = "call.agent", %session, error = %err, "dropping remote candidate the engine rejected");
                        }
                    }
                }
            }
        });
        RemoteApplier::new(work_tx, task)
    }

    // ---- completions of suspended media work ----

    fn on_prepared(&mut self, id: SessionId, result: Result<Prepared, MediaError>) {
        let Some(mut session) = self.session.take() else {
            debug!(target = "call.agent", session = %id, "discarding media for ended session");
            return;
        };
        if session.id != id {
            debug!(target = "call.agent", session = %id, current = %session.id, "discarding media for superseded session");
            self.session = Some(session);
            return;
        }
        let partner = session.partner.clone();

        match session.state {
            SessionState::Originating(mut negotiation) => {
                let reply = negotiation.reply.take();
                let media = negotiation.staging.take();
                drop(negotiation);

                let (prepared, media) = match claim(result, media) {
                    Ok(ready) => ready,
                    Err(err) => {
                        warn!(target = "call.agent", session = %id, error = %err, "could not start call");
                        self.after_teardown(id, partner, EndReason::Failed(err.to_string()), false);
                        respond(reply, Err(err));
                        return;
                    }
                };
                let offer = SignalPayload::Offer {
                    offer: prepared.description,
                };
                if let Err(err) = self.channel.send_call(&partner, offer) {
                    drop(media);
                    warn!(target = "call.agent", session = %id, error = %err, "could not publish offer");
                    self.after_teardown(id, partner, EndReason::Failed(err.to_string()), false);
                    respond(reply, Err(err.into()));
                    return;
                }
                if !session.mic_enabled {
                    media.local.set_enabled(false);
                }
                let applier = self.spawn_applier(id, Arc::clone(&media.connection));
                session.state = SessionState::AwaitingAnswer(Connected::new(media, applier));
                self.session = Some(session);
                self.peer_events = Some((id, prepared.events));
                info!(target = "call.agent", session = %id, %partner, "offer sent; awaiting answer");
                self.sync_status();
                respond(reply, Ok(()));
            }
            SessionState::Ringing {
                offer: _answered,
                ringtone: _ringtone,
                accepting: Some(mut negotiation),
            } => {
                let reply = negotiation.reply.take();
                let media = negotiation.staging.take();
                drop(negotiation);

                let (prepared, media) = match claim(result, media) {
                    Ok(ready) => ready,
                    Err(err) => {
                        warn!(target = "call.agent", session = %id, error = %err, "could not accept call");
                        self.after_teardown(id, partner, EndReason::Failed(err.to_string()), true);
                        respond(reply, Err(err));
                        return;
                    }
                };
                let answer = SignalPayload::Answer {
                    answer: prepared.description,
                };
                if let Err(err) = self.channel.send_call(&partner, answer) {
                    drop(media);
                    warn!(target = "call.agent", session = %id, error = %err, "could not publish answer");
                    self.after_teardown(id, partner, EndReason::Failed(err.to_string()), false);
                    respond(reply, Err(err.into()));
                    return;
                }
                if !session.mic_enabled {
                    media.local.set_enabled(false);
                }
                let applier = self.spawn_applier(id, Arc::clone(&media.connection));
                let mut connected = Connected::new(media, applier);
                self.start_monitors(&mut connected);
                let buffered = session.pending.len();
                for candidate in session.pending.drain() {
                    connected.applier.submit(RemoteWork::Candidate(candidate));
                }
                session.state = SessionState::Active(connected);
                self.session = Some(session);
                self.peer_events = Some((id, prepared.events));
                info!(target = "call.agent", session = %id, %partner, buffered, "call active");
                self.sync_status();
                respond(reply, Ok(()));
            }
            state => {
                debug!(target = "call.agent", session = %id, phase = %state.phase(), "discarding media result for settled session");
                session.state = state;
                self.session = Some(session);
            }
        }
    }

    // ---- inbound signaling ----

    fn on_envelope(&mut self, envelope: Envelope) {
        if self.chat_partner.as_ref() != Some(envelope.sender_id()) {
            debug!(target = "call.agent", sender = %envelope.sender_id(), "ignoring message from non-partner");
            return;
        }
        match envelope {
            Envelope::Typing(signal) => {
                if self.indicator.apply(&signal) {
                    self.emit(CallEvent::PartnerTyping {
                        partner: signal.sender_id,
                        is_typing: signal.is_typing,
                    });
                }
            }
            Envelope::CallSignal(CallSignal { sender_id, payload }) => {
                debug!(target = "call.agent", sender = %sender_id, kind = payload.kind().as_str(), "call signal received");
                match payload {
                    SignalPayload::Offer { offer } => self.on_offer(sender_id, offer),
                    SignalPayload::Answer { answer } => self.on_answer(answer),
                    SignalPayload::Candidate { candidate } => self.on_candidate(candidate),
                    SignalPayload::EndCall => self.on_remote_end(),
                }
            }
        }
    }

    fn on_offer(&mut self, from: Identity, offer: SessionDescription) {
        match self.session.as_ref().map(CallSession::phase) {
            None => self.ring(from, offer),
            Some(CallPhase::Ringing) => {
                let engine = Arc::clone(&self.engine);
                // results of an accept for the old offer must not match
                let fresh = self.allocate_session();
                if let Some(CallSession {
                    id,
                    pending,
                    state:
                        SessionState::Ringing {
                            offer: current,
                            ringtone,
                            accepting,
                        },
                    ..
                }) = self.session.as_mut()
                {
                    info!(target = "call.agent", session = %fresh, replaced = %id, "partner replaced its offer");
                    *id = fresh;
                    *current = offer;
                    pending.clear();
                    // an in-flight accept was negotiating the old offer
                    accepting.take();
                    if ringtone.is_none() {
                        *ringtone = engine.play_ringtone(RingTone::default());
                    }
                }
                self.emit(CallEvent::IncomingCall { from });
            }
            // Both sides dialed. The smaller identity keeps its own offer and
            // the other side answers it.
            Some(phase @ (CallPhase::Originating | CallPhase::AwaitingAnswer))
                if self.self_id < from =>
            {
                info!(target = "call.agent", %phase, partner = %from, "offers crossed; keeping ours");
            }
            Some(phase) => {
                info!(target = "call.agent", %phase, "partner restarted negotiation");
                self.end_session(EndReason::Renegotiated, false);
                self.ring(from, offer);
            }
        }
    }

    fn ring(&mut self, from: Identity, offer: SessionDescription) {
        let id = self.allocate_session();
        let ringtone = self.engine.play_ringtone(RingTone::default());
        info!(target = "call.agent", session = %id, caller = %from, "incoming call");
        self.session = Some(CallSession::new(
            id,
            Role::Callee,
            from.clone(),
            SessionState::Ringing {
                offer,
                ringtone,
                accepting: None,
            },
        ));
        self.emit(CallEvent::IncomingCall { from });
        self.sync_status();
    }

    fn on_answer(&mut self, answer: SessionDescription) {
        match self.session.as_mut() {
            Some(CallSession {
                id,
                state: SessionState::AwaitingAnswer(connected),
                ..
            }) if !connected.answer_in_flight => {
                debug!(target = "call.agent", session = %id, "applying remote answer");
                connected.answer_in_flight = true;
                connected.applier.submit(RemoteWork::Answer(answer));
            }
            other => {
                let phase = other.map_or(CallPhase::Idle, |session| session.phase());
                debug!(target = "call.agent", %phase, "dropping unexpected answer");
            }
        }
    }

    fn on_answer_applied(&mut self, id: SessionId, result: Result<(), MediaError>) {
        let awaiting = self
            .session
            .as_ref()
            .is_some_and(|session| session.id == id && session.phase() == CallPhase::AwaitingAnswer);
        if !awaiting {
            debug!(target = "call.agent", session = %id, "discarding answer result for settled session");
            return;
        }
        if let Err(err) = result {
            warn!(target = "call.agent", session = %id, error = %err, "remote answer rejected");
            self.end_session(EndReason::Failed(err.to_string()), true);
            return;
        }

        let Some(mut session) = self.session.take() else {
            return;
        };
        let buffered = session.pending.len();
        session.state = match session.state {
            SessionState::AwaitingAnswer(mut connected) => {
                connected.answer_in_flight = false;
                self.start_monitors(&mut connected);
                for candidate in session.pending.drain() {
                    connected.applier.submit(RemoteWork::Candidate(candidate));
                }
                SessionState::Active(connected)
            }
            other => other,
        };
        info!(target = "call.agent", session = %id, buffered, "call active");
        self.session = Some(session);
        self.sync_status();
    }

    fn on_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            debug!(target = "call.agent", "dropping candidate without a session");
            return;
        };
        match &session.state {
            SessionState::Active(connected) => {
                connected.applier.submit(RemoteWork::Candidate(candidate));
            }
            _ => {
                session.pending.push(candidate);
                debug!(target = "call.agent", session = %session.id, buffered = session.pending.len(), "buffered remote candidate");
            }
        }
    }

    fn on_remote_end(&mut self) {
        if self.session.is_none() {
            debug!(target = "call.agent", "end-call while idle; ignoring");
            return;
        }
        self.end_session(EndReason::RemoteHangup, false);
    }

    // ---- peer connection events ----

    fn on_peer_event(&mut self, id: SessionId, event: PeerEvent) {
        let current = self.session.as_ref().is_some_and(|session| session.id == id);
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(session) = self.session.as_ref().filter(|_| current) else {
                    return;
                };
                let signal = SignalPayload::Candidate { candidate };
                if let Err(err) = self.channel.send_call(&session.partner, signal) {
                    warn!(target = "call.agent", session = %id, error = %err, "could not publish local candidate");
                }
            }
            PeerEvent::RemoteAudio(remote) => {
                let meter = self.remote_volume.clone();
                let (tick, window) = (self.config.volume_tick, self.config.analysis_window);
                let Some(session) = self.session.as_mut().filter(|_| current) else {
                    remote.stop();
                    return;
                };
                let active = session.phase() == CallPhase::Active;
                let Some(connected) = session.connected_mut() else {
                    remote.stop();
                    return;
                };
                if let Some(previous) = connected.remote.take() {
                    previous.stop();
                }
                connected.remote_monitor = active
                    .then(|| VolumeMonitor::spawn("remote", remote.level_source(), meter, tick, window));
                connected.remote = Some(remote);
                info!(target = "call.agent", session = %id, "remote audio started");
                self.emit(CallEvent::RemoteAudioStarted);
            }
            PeerEvent::StateChanged(state) => {
                debug!(target = "call.agent", session = %id, ?state, "peer connection state changed");
                if current {
                    self.emit(CallEvent::ConnectionStateChanged(state));
                }
            }
        }
    }

    // ---- teardown ----

    /// Releases the current session, if any. EndCall goes to the partner only
    /// when `notify_peer` is set, i.e. when this side initiated the end.
    fn end_session(&mut self, reason: EndReason, notify_peer: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = session.id;
        let partner = session.partner.clone();
        drop(session);
        self.after_teardown(id, partner, reason, notify_peer);
    }

    fn after_teardown(&mut self, id: SessionId, partner: Identity, reason: EndReason, notify_peer: bool) {
        self.peer_events = None;
        self.status.send_modify(|status| status.phase = CallPhase::Ended);
        self.emit(CallEvent::PhaseChanged(CallPhase::Ended));
        if notify_peer {
            if let Err(err) = self.channel.send_call(&partner, SignalPayload::EndCall) {
                warn!(target = "call.agent", session = %id, error = %err, "could not publish end-call");
            }
        }
        info!(target = "call.agent", session = %id, %partner, ?reason, "call ended");
        self.emit(CallEvent::CallEnded { partner, reason });
        self.sync_status();
    }

    fn start_monitors(&self, connected: &mut Connected) {
        let (tick, window) = (self.config.volume_tick, self.config.analysis_window);
        connected.local_monitor = Some(VolumeMonitor::spawn(
            "local",
            connected.media.local.level_source(),
            self.local_volume.clone(),
            tick,
            window,
        ));
        if let Some(remote) = &connected.remote {
            connected.remote_monitor = Some(VolumeMonitor::spawn(
                "remote",
                remote.level_source(),
                self.remote_volume.clone(),
                tick,
                window,
            ));
        }
    }

    // ---- status ----

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn sync_status(&self) {
        let session = self.session.as_ref();
        let next = CallStatus {
            phase: session.map_or(CallPhase::Idle, CallSession::phase),
            chat_partner: self.chat_partner.clone(),
            subscribed: self.inbound.is_some(),
            role: session.map(|session| session.role),
            call_partner: session.map(|session| session.partner.clone()),
            mic_enabled: session.map_or(true, |session| session.mic_enabled),
            partner_typing: self
                .chat_partner
                .as_ref()
                .is_some_and(|partner| self.indicator.is_typing(partner)),
        };
        let phase = next.phase;
        let mut phase_changed = false;
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            phase_changed = current.phase != phase;
            *current = next;
            true
        });
        if phase_changed {
            self.emit(CallEvent::PhaseChanged(phase));
        }
    }
}

async fn next_inbound(inbound: &mut Option<ChannelHandle>) -> Result<Envelope, ChannelError> {
    match inbound {
        Some(handle) => handle.next().await,
        None => std::future::pending().await,
    }
}

async fn next_peer_event(
    slot: &mut Option<(SessionId, mpsc::UnboundedReceiver<PeerEvent>)>,
) -> (SessionId, Option<PeerEvent>) {
    match slot {
        Some((session, events)) => {
            let session = *session;
            (session, events.recv().await)
        }
        None => std::future::pending().await,
    }
}

/// Acquires the microphone and produces the local description: an offer,
/// or the answer to `remote_offer`.
async fn prepare(
    engine: Arc<dyn MediaEngine>,
    ice_servers: Vec<IceServer>,
    staging: Arc<Staging>,
    remote_offer: Option<SessionDescription>,
) -> Result<Prepared, MediaError> {
    let local: Arc<dyn LocalAudio> = Arc::from(engine.acquire_local_audio().await?);
    staging.hold_audio(Arc::clone(&local))?;
    let PeerLink { connection, events } = engine.create_peer_connection(&ice_servers).await?;
    staging.hold_connection(Arc::clone(&connection))?;
    connection.add_local_audio(local.as_ref()).await?;

    let description = match remote_offer {
        Some(offer) => {
            connection.set_remote_description(offer).await?;
            connection.create_answer().await?
        }
        None => connection.create_offer().await?,
    };
    connection.set_local_description(description.clone()).await?;
    Ok(Prepared {
        events,
        description,
    })
}

fn claim<M>(result: Result<Prepared, MediaError>, media: Option<M>) -> CallResult<(Prepared, M)> {
    match (result, media) {
        (Ok(prepared), Some(media)) => Ok((prepared, media)),
        (Ok(_), None) => Err(CallError::Superseded),
        (Err(err), _) => Err(CallError::from_media(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_status_is_idle_with_mic_on() {
        let status = CallStatus::default();
        assert_eq!(status.phase, CallPhase::Idle);
        assert!(status.mic_enabled);
        assert!(status.chat_partner.is_none());
    }

    #[test]
    fn claim_classifies_engine_failures() {
        let denied = claim::<()>(Err(MediaError::PermissionDenied), None);
        assert!(matches!(denied, Err(CallError::MediaAcquisition(_))));
        let rejected = claim::<()>(Err(MediaError::Negotiation("bad sdp".into())), None);
        assert!(matches!(rejected, Err(CallError::Negotiation(_))));
    }
}
