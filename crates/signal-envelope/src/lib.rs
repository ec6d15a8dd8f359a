//! Wire envelope shared by the signaling relay and the negotiation clients.
//!
//! Every frame on the relay socket is a JSON object with an outer `type`
//! discriminant. Negotiation traffic uses the `sdp` and `candidate` kinds and
//! carries its body under `payload`; the relay itself only ever originates the
//! `connected` notice. Keeping both shapes in one crate keeps the relay and
//! the clients from drifting apart.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

const SDP_KIND: &str = "sdp";
const CANDIDATE_KIND: &str = "candidate";
const CONNECTED_KIND: &str = "connected";

/// One unit of negotiation traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Envelope {
    #[serde(rename = "sdp")]
    SessionDescription(SessionDescription),
    #[serde(rename = "candidate")]
    IceCandidate(IceCandidate),
}

impl Envelope {
    /// Outer discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::SessionDescription(_) => SDP_KIND,
            Envelope::IceCandidate(_) => CANDIDATE_KIND,
        }
    }
}

impl From<SessionDescription> for Envelope {
    fn from(description: SessionDescription) -> Self {
        Envelope::SessionDescription(description)
    }
}

impl From<IceCandidate> for Envelope {
    fn from(candidate: IceCandidate) -> Self {
        Envelope::IceCandidate(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SdpKind {
    Offer,
    #[serde(rename = "prAnswer")]
    ProvisionalAnswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SdpKind::Offer => "offer",
            SdpKind::ProvisionalAnswer => "provisional answer",
            SdpKind::Answer => "answer",
            SdpKind::Rollback => "rollback",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

impl SessionDescription {
    pub fn new(kind: SdpKind, sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind,
        }
    }

    pub fn offer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Offer, sdp)
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self::new(SdpKind::Answer, sdp)
    }

    /// Rollback descriptions carry no SDP body.
    pub fn rollback() -> Self {
        Self::new(SdpKind::Rollback, String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub sdp: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

impl IceCandidate {
    pub fn new(sdp: impl Into<String>, sdp_mline_index: u32, sdp_mid: Option<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_mline_index,
            sdp_mid,
        }
    }
}

/// Control frames originated by the relay, never by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayNotice {
    /// Sent once, to the freshly accepted connection only.
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
    },
}

/// Anything a client can receive from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Notice(RelayNotice),
    Envelope(Envelope),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no string `type` discriminant")]
    MissingKind,
    #[error("unknown frame kind `{0}`")]
    UnknownKind(String),
    #[error("`{0}` frame has no payload")]
    MissingPayload(String),
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // Every field is a string, integer or plain enum, so serialization cannot fail.
    serde_json::to_vec(envelope).unwrap_or_default()
}

pub fn encode_notice(notice: &RelayNotice) -> Vec<u8> {
    serde_json::to_vec(notice).unwrap_or_default()
}

/// Decodes a negotiation envelope. Relay notices are rejected as an unknown kind.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    match decode_frame(bytes)? {
        Frame::Envelope(envelope) => Ok(envelope),
        Frame::Notice(_) => Err(DecodeError::UnknownKind(CONNECTED_KIND.to_string())),
    }
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingKind)?;

    match kind {
        SDP_KIND => decode_payload(&value, kind)
            .map(|description| Frame::Envelope(Envelope::SessionDescription(description))),
        CANDIDATE_KIND => decode_payload(&value, kind)
            .map(|candidate| Frame::Envelope(Envelope::IceCandidate(candidate))),
        CONNECTED_KIND => RelayNotice::deserialize(&value)
            .map(Frame::Notice)
            .map_err(|source| DecodeError::InvalidPayload {
                kind: kind.to_string(),
                source,
            }),
        other => Err(DecodeError::UnknownKind(other.to_string())),
    }
}

fn decode_payload<T: DeserializeOwned>(value: &Value, kind: &str) -> Result<T, DecodeError> {
    let payload = value
        .get("payload")
        .ok_or_else(|| DecodeError::MissingPayload(kind.to_string()))?;
    T::deserialize(payload).map_err(|source| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}
