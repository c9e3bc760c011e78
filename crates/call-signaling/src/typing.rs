//! "Is typing" side-channel, independent of call state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::channel::SignalingChannel;
use crate::error::ChannelError;
use crate::protocol::{Identity, TypingSignal};

/// Debounced typing notifications towards one partner.
///
/// Every input change announces `true`; `false` follows once no input has
/// arrived for the quiet period.
pub struct TypingNotifier {
    channel: SignalingChannel,
    partner: Identity,
    quiet_period: Duration,
    announced: Arc<AtomicBool>,
    stop_timer: Option<JoinHandle<()>>,
}

impl TypingNotifier {
    pub fn new(channel: SignalingChannel, partner: Identity, quiet_period: Duration) -> Self {
        Self {
            channel,
            partner,
            quiet_period,
            announced: Arc::new(AtomicBool::new(false)),
            stop_timer: None,
        }
    }

    pub fn partner(&self) -> &Identity {
        &self.partner
    }

    pub fn input_changed(&mut self) -> Result<(), ChannelError> {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
        let sent = self.channel.send_typing(&self.partner, true);
        if sent.is_ok() {
            self.announced.store(true, Ordering::SeqCst);
        }

        let channel = self.channel.clone();
        let partner = self.partner.clone();
        let announced = Arc::clone(&self.announced);
        let quiet_period = self.quiet_period;
        self.stop_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            announced.store(false, Ordering::SeqCst);
            if let Err(err) = channel.send_typing(&partner, false) {
                warn!(target = "call.typing", error = %err, %partner, "failed to clear typing state");
            }
        }));
        sent
    }

    /// Cancels the pending timer and tells the partner typing stopped if it
    /// was last told otherwise.
    pub fn finish(mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
        if self.announced.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.channel.send_typing(&self.partner, false) {
                warn!(target = "call.typing", error = %err, partner = %self.partner, "failed to clear typing state");
            }
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        if let Some(timer) = self.stop_timer.take() {
            timer.abort();
        }
    }
}

/// Mirrors the last typing state received from each partner.
#[derive(Debug, Default)]
pub struct TypingIndicator {
    states: HashMap<Identity, bool>,
}

impl TypingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the signal. Returns true when the visible state changed.
    pub fn apply(&mut self, signal: &TypingSignal) -> bool {
        let previous = self
            .states
            .insert(signal.sender_id.clone(), signal.is_typing);
        previous.unwrap_or(false) != signal.is_typing
    }

    pub fn is_typing(&self, identity: &Identity) -> bool {
        self.states.get(identity).copied().unwrap_or(false)
    }

    pub fn clear(&mut self, identity: &Identity) {
        self.states.remove(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use relay_bus::{LocalRelay, Relay};
    use test_timeout::tokio_timeout_test;

    fn setup() -> (Arc<LocalRelay>, TypingNotifier, crate::channel::ChannelHandle) {
        let relay = Arc::new(LocalRelay::new());
        let dyn_relay: Arc<dyn Relay> = relay.clone();
        let alice = SignalingChannel::new(dyn_relay.clone(), Identity::new("alice"));
        let bob = SignalingChannel::new(dyn_relay, Identity::new("bob"));
        let inbox = bob.subscribe(&Identity::new("alice")).expect("subscribe");
        let notifier = TypingNotifier::new(alice, Identity::new("bob"), Duration::from_secs(2));
        (relay, notifier, inbox)
    }

    async fn next_typing(inbox: &mut crate::channel::ChannelHandle) -> bool {
        match inbox.next().await.expect("message") {
            Envelope::Typing(signal) => signal.is_typing,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio_timeout_test(10, paused)]
    async fn quiet_period_sends_stop_once() {
        let (_relay, mut notifier, mut inbox) = setup();
        let started = tokio::time::Instant::now();
        notifier.input_changed().expect("send");
        assert!(next_typing(&mut inbox).await);
        assert!(!next_typing(&mut inbox).await);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio_timeout_test(10, paused)]
    async fn each_keystroke_restarts_the_timer() {
        let (_relay, mut notifier, mut inbox) = setup();
        let started = tokio::time::Instant::now();
        notifier.input_changed().expect("send");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        notifier.input_changed().expect("send");

        assert!(next_typing(&mut inbox).await);
        assert!(next_typing(&mut inbox).await);
        assert!(!next_typing(&mut inbox).await);
        assert!(started.elapsed() >= Duration::from_millis(3500));
    }

    #[tokio_timeout_test(10, paused)]
    async fn finish_clears_state_immediately() {
        let (relay, mut notifier, mut inbox) = setup();
        notifier.input_changed().expect("send");
        notifier.finish();
        assert!(next_typing(&mut inbox).await);
        assert!(!next_typing(&mut inbox).await);

        // the aborted timer never fires a second "false"
        tokio::time::sleep(Duration::from_secs(5)).await;
        relay
            .publish("signaling:bob", bytes::Bytes::from_static(b"{}"))
            .expect("publish");
        let sentinel = tokio::time::timeout(Duration::from_millis(10), inbox.next()).await;
        assert!(sentinel.is_err(), "malformed sentinel is skipped and nothing else queued");
    }

    #[test]
    fn indicator_is_last_write_wins() {
        let mut indicator = TypingIndicator::new();
        let alice = Identity::new("alice");
        assert!(indicator.apply(&TypingSignal {
            sender_id: alice.clone(),
            is_typing: true
        }));
        assert!(!indicator.apply(&TypingSignal {
            sender_id: alice.clone(),
            is_typing: true
        }));
        assert!(indicator.is_typing(&alice));
        assert!(indicator.apply(&TypingSignal {
            sender_id: alice.clone(),
            is_typing: false
        }));
        assert!(!indicator.is_typing(&alice));
    }
}
