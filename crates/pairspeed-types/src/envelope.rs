//! Relay frame format.
//!
//! ```text
//! client -> relay   {"Id": 7, "Dest": 1234, "Datab64": "<base64(json)>"}
//! relay  -> client  {"Id": 7, "Deliverable": true, "You": 4321}        (ack)
//! relay  -> client  {"Datab64": "<base64(json)>", "Src": 4321, "Dest": 1234}
//! ```
//!
//! One struct covers all three shapes; absent fields are omitted on the wire.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known relay address that answers with the caller's own identifier.
pub const RENDEZVOUS_ADDRESS: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("frame has no payload")]
    Missing,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    /// Correlation id. Present on requests and on the relay's replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<u64>,

    /// base64 of the UTF-8 JSON encoding of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datab64: Option<String>,

    /// Ack only: whether `dest` was a live session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliverable: Option<bool>,

    /// Ack only: the identifier the relay assigned to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub you: Option<u64>,
}

impl Envelope {
    /// Build a correlated request carrying `payload` to `dest`.
    pub fn request<T: Serialize + ?Sized>(
        id: u64,
        dest: u64,
        payload: &T,
    ) -> Result<Self, PayloadError> {
        Ok(Self {
            id: Some(id),
            dest: Some(dest),
            datab64: Some(encode_payload(payload)?),
            ..Default::default()
        })
    }

    /// Relay acknowledgement for request `id`.
    pub fn ack(id: u64, deliverable: bool, you: u64) -> Self {
        Self {
            id: Some(id),
            deliverable: Some(deliverable),
            you: Some(you),
            ..Default::default()
        }
    }

    /// Relayed message from `src` to `dest`. `datab64` is forwarded untouched.
    pub fn delivery(src: u64, dest: u64, datab64: String) -> Self {
        Self {
            src: Some(src),
            dest: Some(dest),
            datab64: Some(datab64),
            ..Default::default()
        }
    }

    /// A frame with an id is a reply to an earlier request.
    pub fn is_reply(&self) -> bool {
        self.id.is_some()
    }

    /// A frame without an id but with a payload is peer traffic.
    pub fn is_delivery(&self) -> bool {
        self.id.is_none() && self.datab64.is_some()
    }

    /// Decode the base64(JSON) payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let data = self.datab64.as_deref().ok_or(PayloadError::Missing)?;
        decode_payload(data)
    }
}

pub fn encode_payload<T: Serialize + ?Sized>(payload: &T) -> Result<String, PayloadError> {
    let json = serde_json::to_vec(payload)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_payload<T: DeserializeOwned>(data: &str) -> Result<T, PayloadError> {
    let json = STANDARD.decode(data)?;
    Ok(serde_json::from_slice(&json)?)
}
