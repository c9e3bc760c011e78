#![allow(dead_code)]

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use call_signaling::media::mock::MockEngine;
use call_signaling::protocol::SignalKind;
use call_signaling::{
    BackoffPolicy, CallAgent, CallConfig, CallEvent, CallHandle, CallPhase, Envelope, Identity,
    SignalingChannel, StaticDirectory,
};
use relay_bus::{LocalRelay, Relay, Subscription};
use tokio::sync::broadcast;

pub fn test_config() -> CallConfig {
    CallConfig {
        subscribe_backoff: BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            attempts: 3,
        },
        ..CallConfig::localhost()
    }
}

pub struct World {
    pub relay: Arc<LocalRelay>,
    pub directory: Arc<StaticDirectory>,
}

impl World {
    pub fn new() -> Self {
        Self {
            relay: Arc::new(LocalRelay::new()),
            directory: Arc::new(StaticDirectory::with_online(["alice", "bob", "carol"])),
        }
    }

    pub fn spawn(&self, id: &str) -> Peer {
        let engine = MockEngine::new();
        let handle = CallAgent::spawn(
            id,
            self.relay.clone(),
            Arc::new(engine.clone()),
            self.directory.clone(),
            test_config(),
        );
        Peer { handle, engine }
    }

    /// A peer driven by hand instead of by an agent.
    pub fn scripted(&self, id: &str) -> SignalingChannel {
        SignalingChannel::new(self.relay.clone(), Identity::new(id))
    }

    /// Observes everything published to `id`, whoever sent it.
    pub fn wiretap(&self, id: &str) -> Wiretap {
        let subscription = self
            .relay
            .subscribe(&Identity::new(id).signaling_topic())
            .expect("wiretap subscribe");
        Wiretap { subscription }
    }
}

pub struct Peer {
    pub handle: CallHandle,
    pub engine: MockEngine,
}

impl Deref for Peer {
    type Target = CallHandle;

    fn deref(&self) -> &CallHandle {
        &self.handle
    }
}

pub struct Wiretap {
    subscription: Subscription,
}

impl Wiretap {
    /// Collects messages until the topic has been quiet for a moment.
    pub async fn quiet(&mut self) -> Vec<Envelope> {
        let mut seen = Vec::new();
        while let Ok(Ok(message)) =
            tokio::time::timeout(Duration::from_millis(25), self.subscription.recv()).await
        {
            if let Ok(envelope) = Envelope::decode(&message.payload) {
                seen.push(envelope);
            }
        }
        seen
    }
}

/// Call signal kinds sent by `from`, in order.
pub fn kinds_from(envelopes: &[Envelope], from: &str) -> Vec<SignalKind> {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            Envelope::CallSignal(signal) if signal.sender_id.as_str() == from => Some(signal.kind()),
            _ => None,
        })
        .collect()
}

/// Lets every task run until the system is idle (paused clock only).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

pub async fn expect_event(
    events: &mut broadcast::Receiver<CallEvent>,
    mut wanted: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    loop {
        match events.recv().await {
            Ok(event) if wanted(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

pub async fn chatting(world: &World) -> (Peer, Peer) {
    let alice = world.spawn("alice");
    let bob = world.spawn("bob");
    alice.open_chat("bob").await.expect("alice opens chat");
    bob.open_chat("alice").await.expect("bob opens chat");
    (alice, bob)
}

/// Alice calls Bob and Bob picks up.
pub async fn in_call(world: &World) -> (Peer, Peer) {
    let (alice, bob) = chatting(world).await;
    alice.start_call().await.expect("offer sent");
    bob.wait_for_phase(CallPhase::Ringing).await.expect("bob rings");
    bob.accept_call().await.expect("bob accepts");
    alice
        .wait_for_phase(CallPhase::Active)
        .await
        .expect("alice active");
    (alice, bob)
}

pub fn tone(amplitude: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48_000.0).sin())
        .collect()
}
