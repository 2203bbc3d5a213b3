//! Signaling wire format
//!
//! One JSON object per message:
//! `{id, callId, sender, recipient, type, payload, timestamp}` where `type` is
//! `offer`, `answer`, `ice-candidate` or `hangup` and `timestamp` is Unix
//! milliseconds. Descriptions and candidates use the browser
//! `RTCSessionDescriptionInit` / `RTCIceCandidateInit` shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::ParticipantId;
use crate::{Error, Result};

/// Largest SDP accepted in an offer or answer
pub const MAX_SDP_BYTES: usize = 32 * 1024;

/// Largest candidate line accepted
pub const MAX_CANDIDATE_BYTES: usize = 1024;

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer
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

/// A network path proposed by one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Identity of a candidate for duplicate detection
pub type CandidateKey = (String, Option<String>, Option<u16>);

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_m_line_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_m_line_index,
            username_fragment: None,
        }
    }

    /// Two candidates with the same key describe the same path
    pub fn key(&self) -> CandidateKey {
        (
            self.candidate.trim().to_string(),
            self.sdp_mid.clone(),
            self.sdp_m_line_index,
        )
    }

    /// Whether the candidate line has the `candidate:` grammar
    ///
    /// `candidate:<foundation> <component> <transport> <priority> <ip> <port> typ <type> ...`
    pub fn is_well_formed(&self) -> bool {
        let line = self.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        if line.len() > MAX_CANDIDATE_BYTES || !line.starts_with("candidate:") {
            return false;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        fields.len() >= 8
            && fields[1].parse::<u16>().is_ok()
            && fields[3].parse::<u32>().is_ok()
            && fields[5].parse::<u16>().is_ok()
            && fields[6] == "typ"
    }
}

/// Typed body of a signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalingPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    /// The sender left the call or refused it
    Hangup {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl SignalingPayload {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::Offer(_) => "offer",
            SignalingPayload::Answer(_) => "answer",
            SignalingPayload::IceCandidate(_) => "ice-candidate",
            SignalingPayload::Hangup { .. } => "hangup",
        }
    }
}

/// A message relayed between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub id: Uuid,
    pub call_id: String,
    pub sender: ParticipantId,
    pub recipient: ParticipantId,
    #[serde(flatten)]
    pub body: SignalingPayload,
    pub timestamp: i64,
}

impl SignalingMessage {
    pub fn new(
        call_id: impl Into<String>,
        sender: ParticipantId,
        recipient: ParticipantId,
        body: SignalingPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id: call_id.into(),
            sender,
            recipient,
            body,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Reject messages no participant could act on
    pub fn validate(&self) -> Result<()> {
        if self.sender.is_empty() || self.recipient.is_empty() {
            return Err(Error::ProtocolError(
                "sender and recipient are required".to_string(),
            ));
        }
        if self.sender == self.recipient {
            return Err(Error::ProtocolError(format!(
                "message {} is addressed to its own sender {}",
                self.id, self.sender
            )));
        }
        if self.call_id.trim().is_empty() {
            return Err(Error::ProtocolError(format!(
                "message {} has no call id",
                self.id
            )));
        }
        match &self.body {
            SignalingPayload::Offer(desc) | SignalingPayload::Answer(desc)
                if desc.sdp.len() > MAX_SDP_BYTES =>
            {
                Err(Error::ProtocolError(format!(
                    "SDP of {} bytes exceeds {} byte limit",
                    desc.sdp.len(),
                    MAX_SDP_BYTES
                )))
            }
            SignalingPayload::IceCandidate(c) if c.candidate.len() > MAX_CANDIDATE_BYTES => {
                Err(Error::ProtocolError(format!(
                    "candidate of {} bytes exceeds {} byte limit",
                    c.candidate.len(),
                    MAX_CANDIDATE_BYTES
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
