use call_signaling::config::IceServer;
use call_signaling::media::PeerState;
use call_signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use call_signaling::MediaError;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub(crate) fn engine_error(err: webrtc::Error) -> MediaError {
    MediaError::Engine(err.to_string())
}

pub(crate) fn negotiation_error(err: webrtc::Error) -> MediaError {
    MediaError::Negotiation(err.to_string())
}

pub(crate) fn ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

pub(crate) fn description_to_rtc(
    desc: SessionDescription,
) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(MediaError::Negotiation("rollback is not supported".into()))
        }
    };
    parsed.map_err(negotiation_error)
}

pub(crate) fn description_from_rtc(
    desc: RTCSessionDescription,
) -> Result<SessionDescription, MediaError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MediaError::Negotiation(
                "engine produced a description without a type".into(),
            ))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

pub(crate) fn candidate_to_rtc(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub(crate) fn candidate_from_rtc(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

pub(crate) fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn descriptions_keep_type_and_body() {
        let rtc = description_to_rtc(SessionDescription::answer(MINIMAL_SDP)).expect("parses");
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        let back = description_from_rtc(rtc).expect("typed");
        assert_eq!(back, SessionDescription::answer(MINIMAL_SDP));
    }

    #[test]
    fn rollback_is_refused() {
        let rollback = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            description_to_rtc(rollback),
            Err(MediaError::Negotiation(_))
        ));
    }

    #[test]
    fn candidates_keep_their_mid_and_index() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let init = candidate_to_rtc(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate_from_rtc(init), candidate);
    }

    #[test]
    fn unspecified_state_is_not_reported() {
        assert_eq!(peer_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            peer_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
    }

    #[test]
    fn ice_server_credentials_default_to_empty() {
        let server = ice_server(&IceServer::stun("stun:stun.example.org:3478"));
        assert_eq!(server.urls, ["stun:stun.example.org:3478"]);
        assert!(server.username.is_empty());
        assert!(server.credential.is_empty());
    }
}
