//! Per-user signaling subscription on the relay.
//!
//! A user listens on `signaling:<self>` and publishes to `signaling:<peer>`.
//! The subscription is scoped to one chat partner: messages from anyone else
//! are dropped, so the handle must be released and re-acquired whenever the
//! partner changes.

use std::sync::Arc;

use relay_bus::{Relay, Subscription};
use tracing::{debug, warn};

use crate::config::BackoffPolicy;
use crate::error::ChannelError;
use crate::protocol::{CallSignal, Envelope, Identity, SignalPayload, TypingSignal};

#[derive(Clone)]
pub struct SignalingChannel {
    relay: Arc<dyn Relay>,
    self_id: Identity,
}

impl SignalingChannel {
    pub fn new(relay: Arc<dyn Relay>, self_id: Identity) -> Self {
        Self { relay, self_id }
    }

    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    /// Joins the local user's topic, accepting messages from `partner` only.
    pub fn subscribe(&self, partner: &Identity) -> Result<ChannelHandle, ChannelError> {
        let topic = self.self_id.signaling_topic();
        let subscription = self.relay.subscribe(&topic)?;
        debug!(target = "call.channel", %topic, %partner, "joined signaling topic");
        Ok(ChannelHandle {
            partner: partner.clone(),
            subscription,
        })
    }

    /// [`subscribe`](Self::subscribe) with exponential backoff between failed
    /// attempts.
    pub async fn subscribe_with_backoff(
        &self,
        partner: &Identity,
        policy: BackoffPolicy,
    ) -> Result<ChannelHandle, ChannelError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.subscribe(partner) {
                Ok(handle) => {
                    if attempt > 1 {
                        debug!(target = "call.channel", %partner, attempt, "subscribed after retrying");
                    }
                    return Ok(handle);
                }
                Err(ChannelError::Relay(err)) if attempt >= attempts => {
                    return Err(ChannelError::Exhausted {
                        attempts,
                        last: err,
                    });
                }
                Err(ChannelError::Relay(err)) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        target = "call.channel",
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "signaling subscribe failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub fn unsubscribe(&self, handle: ChannelHandle) {
        debug!(target = "call.channel", partner = %handle.partner, "leaving signaling topic");
        drop(handle);
    }

    /// Fire-and-forget: there is no delivery confirmation, and a target that
    /// is not subscribed right now never sees the message.
    pub fn publish(&self, target: &Identity, envelope: &Envelope) -> Result<(), ChannelError> {
        let payload = envelope.encode()?;
        self.relay.publish(&target.signaling_topic(), payload)?;
        Ok(())
    }

    pub fn send_call(&self, target: &Identity, payload: SignalPayload) -> Result<(), ChannelError> {
        let kind = payload.kind();
        let envelope = Envelope::from(CallSignal::new(self.self_id.clone(), payload));
        self.publish(target, &envelope)?;
        debug!(target = "call.channel", to = %target, kind = kind.as_str(), "sent call signal");
        Ok(())
    }

    pub fn send_typing(&self, target: &Identity, is_typing: bool) -> Result<(), ChannelError> {
        let envelope = Envelope::from(TypingSignal {
            sender_id: self.self_id.clone(),
            is_typing,
        });
        self.publish(target, &envelope)
    }
}

/// Scoped signaling subscription. Dropping it leaves the topic.
#[derive(Debug)]
pub struct ChannelHandle {
    partner: Identity,
    subscription: Subscription,
}

impl ChannelHandle {
    pub fn partner(&self) -> &Identity {
        &self.partner
    }

    /// Next message from the partner. Malformed messages and messages from
    /// other senders are skipped. Fails only when the relay closes the topic.
    pub async fn next(&mut self) -> Result<Envelope, ChannelError> {
        loop {
            let message = self.subscription.recv().await?;
            let envelope = match Envelope::decode(&message.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(target = "call.channel", error = %err, "dropping malformed signaling message");
                    continue;
                }
            };
            if envelope.sender_id() != &self.partner {
                debug!(
                    target = "call.channel",
                    sender = %envelope.sender_id(),
                    partner = %self.partner,
                    "ignoring message from non-partner"
                );
                continue;
            }
            return Ok(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionDescription;
    use bytes::Bytes;
    use relay_bus::LocalRelay;
    use std::time::Duration;
    use test_timeout::tokio_timeout_test;

    fn pair(relay: &Arc<LocalRelay>) -> (SignalingChannel, SignalingChannel) {
        let relay: Arc<dyn Relay> = relay.clone();
        (
            SignalingChannel::new(relay.clone(), Identity::new("alice")),
            SignalingChannel::new(relay, Identity::new("bob")),
        )
    }

    #[tokio_timeout_test(5)]
    async fn delivers_partner_messages_and_filters_strangers() {
        let relay = Arc::new(LocalRelay::new());
        let (alice, bob) = pair(&relay);
        let mallory = SignalingChannel::new(relay.clone(), Identity::new("mallory"));
        let mut inbox = bob.subscribe(&Identity::new("alice")).expect("subscribe");

        mallory
            .send_call(&Identity::new("bob"), SignalPayload::EndCall)
            .expect("publish");
        relay
            .publish("signaling:bob", Bytes::from_static(b"not json"))
            .expect("publish");
        alice
            .send_call(
                &Identity::new("bob"),
                SignalPayload::Offer {
                    offer: SessionDescription::offer("v=0"),
                },
            )
            .expect("publish");

        let Envelope::CallSignal(signal) = inbox.next().await.expect("message") else {
            panic!("expected call signal");
        };
        assert_eq!(signal.sender_id, Identity::new("alice"));
        assert_eq!(signal.kind(), crate::protocol::SignalKind::Offer);
    }

    #[tokio_timeout_test(5)]
    async fn typing_travels_on_the_same_topic() {
        let relay = Arc::new(LocalRelay::new());
        let (alice, bob) = pair(&relay);
        let mut inbox = bob.subscribe(&Identity::new("alice")).expect("subscribe");
        alice.send_typing(&Identity::new("bob"), true).expect("publish");
        assert_eq!(
            inbox.next().await.expect("message"),
            Envelope::Typing(TypingSignal {
                sender_id: Identity::new("alice"),
                is_typing: true,
            })
        );
    }

    #[test]
    fn unsubscribe_releases_topic() {
        let relay = Arc::new(LocalRelay::new());
        let (_, bob) = pair(&relay);
        let handle = bob.subscribe(&Identity::new("alice")).expect("subscribe");
        assert_eq!(relay.subscriber_count("signaling:bob"), 1);
        bob.unsubscribe(handle);
        assert_eq!(relay.subscriber_count("signaling:bob"), 0);
    }

    #[tokio_timeout_test(10, paused)]
    async fn backoff_retries_until_relay_returns() {
        let relay = Arc::new(LocalRelay::new());
        relay.set_reachable(false);
        let (_, bob) = pair(&relay);

        let flip = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            flip.set_reachable(true);
        });

        let started = tokio::time::Instant::now();
        let handle = bob
            .subscribe_with_backoff(&Identity::new("alice"), BackoffPolicy::default())
            .await
            .expect("subscribed after relay came back");
        // retries at 200ms, +400ms
        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(handle.partner(), &Identity::new("alice"));
    }

    #[tokio_timeout_test(10, paused)]
    async fn backoff_gives_up_after_configured_attempts() {
        let relay = Arc::new(LocalRelay::new());
        relay.set_reachable(false);
        let (_, bob) = pair(&relay);
        let policy = BackoffPolicy {
            attempts: 3,
            ..BackoffPolicy::default()
        };
        let err = bob
            .subscribe_with_backoff(&Identity::new("alice"), policy)
            .await
            .expect_err("relay never comes back");
        assert!(matches!(err, ChannelError::Exhausted { attempts: 3, .. }));
    }
}
