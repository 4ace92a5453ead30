use serde::{Deserialize, Serialize};

/// Pairing handshake token, carried as a bare JSON string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingMessage {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged between the two negotiation engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Negotiation message relayed between paired peers.
///
/// Serialized externally tagged: `{"offer": {...}}`, `{"answer": {...}}`,
/// `{"candidate": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Out-of-band negotiated data channel. Both peers create it with the same
/// id, so it is never renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub label: &'static str,
    pub id: u16,
    pub negotiated: bool,
    pub max_retransmits: Option<u16>,
}

pub const LATENCY_CHANNEL: ChannelConfig = ChannelConfig {
    label: "ping",
    id: 0,
    negotiated: true,
    max_retransmits: Some(1000),
};

pub const THROUGHPUT_CHANNEL: ChannelConfig = ChannelConfig {
    label: "speed",
    id: 1,
    negotiated: true,
    max_retransmits: Some(1000),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_tokens_are_bare_strings() {
        assert_eq!(serde_json::to_string(&PairingMessage::Ping).unwrap(), r#""PING""#);
        let pong: PairingMessage = serde_json::from_str(r#""PONG""#).unwrap();
        assert_eq!(pong, PairingMessage::Pong);
    }

    #[test]
    fn offer_is_externally_tagged() {
        let msg = SignalMessage::Offer(SessionDescription::offer("v=0"));
        let text = serde_json::to_string(&msg).unwrap();
        assert_eq!(text, r#"{"offer":{"type":"offer","sdp":"v=0"}}"#);
    }

    #[test]
    fn candidate_accepts_browser_json() {
        let text = r#"{"candidate":{"candidate":"candidate:1 1 udp 2122 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"ab12"}}"#;
        let msg: SignalMessage = serde_json::from_str(text).unwrap();
        match msg {
            SignalMessage::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_m_line_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("ab12"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn measurement_channels_do_not_collide() {
        assert_ne!(LATENCY_CHANNEL.id, THROUGHPUT_CHANNEL.id);
        assert!(LATENCY_CHANNEL.negotiated && THROUGHPUT_CHANNEL.negotiated);
    }
}
