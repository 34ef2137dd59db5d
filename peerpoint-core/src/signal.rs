//! # Control protocol
//!
//! JSON text frames exchanged between a client and the relay over the
//! control WebSocket.
//!
//! ## Signaling frames (both directions)
//!
//! - `{"description": {"type": "offer", "sdp": "..."}}`
//! - `{"candidate": {"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}}`
//! - `{"candidate": null}` (end of candidates)
//!
//! Signaling frames may carry `"to"` (addressee) and `"from"` (stamped by
//! the relay) client ids.
//!
//! ## Relay notices (server -> client)
//!
//! - `{"welcome": {"clientId": "...", "peers": ["..."]}}`
//! - `{"peerJoined": "..."}`
//! - `{"peerLeft": "..."}`
//!
//! Shapes are discriminated explicitly from the decoded JSON object, so a
//! payload matching none of them is rejected with a [`SignalError`] rather
//! than guessed at.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::SignalError;

/// Opaque, server-assigned client identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Allocate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Proposal from the offerer.
    Offer,
    /// Provisional answer.
    Pranswer,
    /// Final answer.
    Answer,
    /// Discard the pending local offer.
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Pranswer => "pranswer",
            Self::Answer => "answer",
            Self::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// An SDP session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body. Empty for rollbacks.
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Build a rollback.
    #[must_use]
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    /// Whether this is an offer.
    #[must_use]
    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// An ICE candidate as browsers serialize `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line. Empty marks end of candidates.
    #[serde(default)]
    pub candidate: String,
    /// Media stream identification tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index.
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    /// ICE username fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Build a candidate from its attribute line.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    /// Whether this is the empty-string end-of-candidates sentinel.
    #[must_use]
    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// One signaling payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    /// A trickled ICE candidate.
    Candidate(IceCandidate),
    /// End of candidate gathering (`null` or empty candidate).
    EndOfCandidates,
    /// An offer, answer or rollback.
    Description(SessionDescription),
}

impl SignalMessage {
    /// Short name for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Candidate(_) => "candidate",
            Self::EndOfCandidates => "end_of_candidates",
            Self::Description(_) => "description",
        }
    }

    /// Decode a bare signaling frame, ignoring any addressing.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalError`] if the text is not a signaling frame.
    pub fn decode(text: &str) -> Result<Self, SignalError> {
        match ControlFrame::decode(text)? {
            ControlFrame::Signal(envelope) => Ok(envelope.message),
            _ => Err(SignalError::Untagged),
        }
    }

    /// Encode as a bare signaling frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, SignalError> {
        SignalEnvelope::new(self.clone()).encode()
    }
}

/// A signaling payload with optional relay addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    /// Sender, stamped by the relay.
    pub from: Option<ClientId>,
    /// Intended recipient. `None` means every other client.
    pub to: Option<ClientId>,
    /// The payload.
    pub message: SignalMessage,
}

impl SignalEnvelope {
    /// Wrap an unaddressed message.
    #[must_use]
    pub fn new(message: SignalMessage) -> Self {
        Self {
            from: None,
            to: None,
            message,
        }
    }

    /// Address the message to one client.
    #[must_use]
    pub fn addressed_to(mut self, client: ClientId) -> Self {
        self.to = Some(client);
        self
    }

    /// Stamp the sender.
    #[must_use]
    pub fn sent_by(mut self, client: ClientId) -> Self {
        self.from = Some(client);
        self
    }

    /// Encode to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, SignalError> {
        let mut map = Map::new();
        match &self.message {
            SignalMessage::Candidate(candidate) => {
                map.insert("candidate".into(), serde_json::to_value(candidate)?);
            }
            SignalMessage::EndOfCandidates => {
                map.insert("candidate".into(), Value::Null);
            }
            SignalMessage::Description(description) => {
                map.insert("description".into(), serde_json::to_value(description)?);
            }
        }
        if let Some(from) = &self.from {
            map.insert("from".into(), Value::String(from.to_string()));
        }
        if let Some(to) = &self.to {
            map.insert("to".into(), Value::String(to.to_string()));
        }
        Ok(serde_json::to_string(&Value::Object(map))?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WelcomeBody {
    client_id: ClientId,
    #[serde(default)]
    peers: Vec<ClientId>,
}

/// Any frame on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Signaling payload.
    Signal(SignalEnvelope),
    /// Identity assignment sent once after connect.
    Welcome {
        /// The id assigned to the receiving client.
        client_id: ClientId,
        /// Other clients connected at that moment.
        peers: Vec<ClientId>,
    },
    /// Another client connected.
    PeerJoined(ClientId),
    /// Another client disconnected.
    PeerLeft(ClientId),
}

impl ControlFrame {
    /// Decode a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`SignalError`] for invalid JSON, non-objects, objects with
    /// no recognized field, objects with both `candidate` and `description`,
    /// or fields of the wrong shape.
    pub fn decode(text: &str) -> Result<Self, SignalError> {
        let Value::Object(mut map) = serde_json::from_str::<Value>(text)? else {
            return Err(SignalError::NotAnObject);
        };

        if let Some(body) = map.remove("welcome") {
            let body: WelcomeBody = decode_field("welcome", body)?;
            return Ok(Self::Welcome {
                client_id: body.client_id,
                peers: body.peers,
            });
        }
        if let Some(id) = map.remove("peerJoined") {
            return Ok(Self::PeerJoined(decode_field("peerJoined", id)?));
        }
        if let Some(id) = map.remove("peerLeft") {
            return Ok(Self::PeerLeft(decode_field("peerLeft", id)?));
        }

        let description = map.remove("description").filter(|v| !v.is_null());
        let candidate = map.remove("candidate");

        let message = match (candidate, description) {
            (Some(candidate), Some(_)) if !candidate.is_null() => return Err(SignalError::Ambiguous),
            (_, Some(description)) => {
                SignalMessage::Description(decode_field("description", description)?)
            }
            (Some(Value::Null), None) => SignalMessage::EndOfCandidates,
            (Some(candidate), None) => {
                let candidate: IceCandidate = decode_field("candidate", candidate)?;
                if candidate.is_end_of_candidates() {
                    SignalMessage::EndOfCandidates
                } else {
                    SignalMessage::Candidate(candidate)
                }
            }
            (None, None) => return Err(SignalError::Untagged),
        };

        let from = match map.remove("from") {
            Some(value) => decode_field::<Option<ClientId>>("from", value)?,
            None => None,
        };
        let to = match map.remove("to") {
            Some(value) => decode_field::<Option<ClientId>>("to", value)?,
            None => None,
        };

        Ok(Self::Signal(SignalEnvelope { from, to, message }))
    }

    /// Encode to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, SignalError> {
        let value = match self {
            Self::Signal(envelope) => return envelope.encode(),
            Self::Welcome { client_id, peers } => {
                let body = WelcomeBody {
                    client_id: client_id.clone(),
                    peers: peers.clone(),
                };
                single("welcome", serde_json::to_value(body)?)
            }
            Self::PeerJoined(id) => single("peerJoined", Value::String(id.to_string())),
            Self::PeerLeft(id) => single("peerLeft", Value::String(id.to_string())),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn decode_field<T: serde::de::DeserializeOwned>(
    field: &'static str,
    value: Value,
) -> Result<T, SignalError> {
    serde_json::from_value(value).map_err(|e| SignalError::Malformed {
        field,
        reason: e.to_string(),
    })
}
