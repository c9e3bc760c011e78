use std::sync::Arc;
use std::time::Duration;

use call_signaling::media::mock::MockEngine;
use call_signaling::media::{MediaEngine, PeerEvent};
use call_signaling::protocol::SdpType;
use call_signaling::{
    CallAgent, CallConfig, CallEvent, CallPhase, MediaError, StaticDirectory,
};
use media_webrtc::{NullSink, SilenceCapture, WebRtcEngine};
use relay_bus::LocalRelay;
use test_timeout::tokio_timeout_test;

fn engine() -> Arc<WebRtcEngine> {
    Arc::new(WebRtcEngine::new(Arc::new(SilenceCapture), Arc::new(NullSink)).expect("engine"))
}

#[tokio_timeout_test(20)]
async fn offer_and_answer_negotiate_opus() {
    let (caller, callee) = (engine(), engine());

    let caller_audio = caller.acquire_local_audio().await.expect("caller mic");
    let caller_link = caller.create_peer_connection(&[]).await.expect("caller pc");
    caller_link
        .connection
        .add_local_audio(caller_audio.as_ref())
        .await
        .expect("track");
    let offer = caller_link.connection.create_offer().await.expect("offer");
    assert_eq!(offer.sdp_type, SdpType::Offer);
    assert!(offer.sdp.contains("opus/48000"), "offer: {}", offer.sdp);
    caller_link
        .connection
        .set_local_description(offer.clone())
        .await
        .expect("local offer");

    let callee_audio = callee.acquire_local_audio().await.expect("callee mic");
    let callee_link = callee.create_peer_connection(&[]).await.expect("callee pc");
    callee_link
        .connection
        .add_local_audio(callee_audio.as_ref())
        .await
        .expect("track");
    assert!(!callee_link.connection.has_remote_description());
    callee_link
        .connection
        .set_remote_description(offer)
        .await
        .expect("remote offer");
    assert!(callee_link.connection.has_remote_description());
    let answer = callee_link.connection.create_answer().await.expect("answer");
    assert_eq!(answer.sdp_type, SdpType::Answer);
    callee_link
        .connection
        .set_local_description(answer.clone())
        .await
        .expect("local answer");
    caller_link
        .connection
        .set_remote_description(answer)
        .await
        .expect("remote answer");

    caller_link.connection.close();
    callee_link.connection.close();
    caller_audio.stop();
    callee_audio.stop();
    assert!(!caller_audio.is_live());
}

#[tokio_timeout_test(20)]
async fn closed_connection_refuses_further_work() {
    let engine = engine();
    let link = engine.create_peer_connection(&[]).await.expect("pc");
    link.connection.close();
    assert!(matches!(
        link.connection.create_offer().await,
        Err(MediaError::Closed)
    ));
}

#[tokio_timeout_test(20)]
async fn foreign_audio_cannot_be_attached() {
    let engine = engine();
    let foreign = MockEngine::new()
        .acquire_local_audio()
        .await
        .expect("mock mic");
    let link = engine.create_peer_connection(&[]).await.expect("pc");
    assert!(matches!(
        link.connection.add_local_audio(foreign.as_ref()).await,
        Err(MediaError::Engine(_))
    ));
    link.connection.close();
}

#[tokio_timeout_test(20)]
async fn local_candidates_are_reported_after_the_offer() {
    let engine = engine();
    let audio = engine.acquire_local_audio().await.expect("mic");
    let mut link = engine.create_peer_connection(&[]).await.expect("pc");
    link.connection
        .add_local_audio(audio.as_ref())
        .await
        .expect("track");
    let offer = link.connection.create_offer().await.expect("offer");
    link.connection
        .set_local_description(offer)
        .await
        .expect("gathering starts");

    let candidate = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match link.events.recv().await {
                Some(PeerEvent::LocalCandidate(candidate)) => return Some(candidate),
                Some(_) => continue,
                None => return None,
            }
        }
    })
    .await
    .expect("a host candidate is gathered")
    .expect("event stream open");
    assert!(candidate.candidate.starts_with("candidate:"));
    link.connection.close();
    audio.stop();
}

#[tokio_timeout_test(30)]
async fn two_agents_reach_an_active_call() {
    let relay = Arc::new(LocalRelay::new());
    let directory = Arc::new(StaticDirectory::with_online(["alice", "bob"]));
    let alice = CallAgent::spawn(
        "alice",
        relay.clone(),
        engine(),
        directory.clone(),
        CallConfig::localhost(),
    );
    let bob = CallAgent::spawn("bob", relay, engine(), directory, CallConfig::localhost());
    alice.open_chat("bob").await.expect("alice chat");
    bob.open_chat("alice").await.expect("bob chat");
    let mut bob_events = bob.events();

    alice.start_call().await.expect("offer sent");
    bob.wait_for_phase(CallPhase::Ringing).await.expect("ringing");
    bob.accept_call().await.expect("accepted");
    alice
        .wait_for_phase(CallPhase::Active)
        .await
        .expect("caller active");

    alice.end_call().await.expect("hang up");
    bob.wait_for_phase(CallPhase::Idle).await.expect("callee idle");
    let ended = loop {
        match bob_events.recv().await.expect("events") {
            event @ CallEvent::CallEnded { .. } => break event,
            _ => continue,
        }
    };
    assert!(matches!(ended, CallEvent::CallEnded { .. }));

    alice.shutdown().await;
    bob.shutdown().await;
}
