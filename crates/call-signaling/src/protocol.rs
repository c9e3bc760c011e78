//! Wire format spoken on the relay.
//!
//! Every message addressed to a user travels on the topic `signaling:<identity>`
//! as a JSON envelope `{"event": ..., "payload": ...}`. Call control uses the
//! `call-signal` event, typing notifications the `typing` event. Session
//! descriptors and candidates keep the browser JSON shape so web peers can
//! share the same relay.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const SIGNALING_TOPIC_PREFIX: &str = "signaling:";

/// Opaque, stable user identifier. Names the user's signaling topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn signaling_topic(&self) -> String {
        format!("{SIGNALING_TOPIC_PREFIX}{}", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    EndCall,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::EndCall => "end-call",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    Candidate { candidate: IceCandidate },
    EndCall,
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::Candidate { .. } => SignalKind::Candidate,
            SignalPayload::EndCall => SignalKind::EndCall,
        }
    }
}

/// Call-control message. `sender_id` is always the publishing user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    #[serde(rename = "senderId")]
    pub sender_id: Identity,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl CallSignal {
    pub fn new(sender_id: Identity, payload: SignalPayload) -> Self {
        Self { sender_id, payload }
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    #[serde(rename = "senderId")]
    pub sender_id: Identity,
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Envelope {
    CallSignal(CallSignal),
    Typing(TypingSignal),
}

impl Envelope {
    pub fn sender_id(&self) -> &Identity {
        match self {
            Envelope::CallSignal(signal) => &signal.sender_id,
            Envelope::Typing(signal) => &signal.sender_id,
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<CallSignal> for Envelope {
    fn from(signal: CallSignal) -> Self {
        Envelope::CallSignal(signal)
    }
}

impl From<TypingSignal> for Envelope {
    fn from(signal: TypingSignal) -> Self {
        Envelope::Typing(signal)
    }
}
