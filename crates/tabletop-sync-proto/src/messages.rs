//! Protocol messages for table replication.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tabletop_sync_core::document::{decode_delta, encode_delta};
use tabletop_sync_core::{ActorId, AwarenessUpdate, DocSnapshot, TableDelta, Timestamp};

/// CBOR framing shared by every message.
pub trait CborMessage: Serialize + DeserializeOwned {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Peer discovery; sent once on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHello {
    /// Announcing actor
    pub actor: ActorId,
    /// Table the agent replicates
    pub table_id: String,
    /// Latest clock of the agent (timestamp bytes)
    pub clock: Vec<u8>,
    /// Agent version
    pub version: String,
}

impl AgentHello {
    /// Create a hello for `actor` at `clock`.
    #[must_use]
    pub fn new(actor: ActorId, table_id: impl Into<String>, clock: Timestamp) -> Self {
        Self {
            actor,
            table_id: table_id.into(),
            clock: clock.to_bytes(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Decode the advertised clock.
    ///
    /// # Errors
    ///
    /// Returns error if the clock bytes are malformed.
    pub fn clock(&self) -> Result<Timestamp, MessageError> {
        Timestamp::from_bytes(&self.clock).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

impl CborMessage for AgentHello {}

/// One committed transaction for incremental replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocDelta {
    /// Table the delta belongs to
    pub table_id: String,
    /// Delta identifier (latest HLC timestamp in the delta, as bytes)
    pub delta_id: Vec<u8>,
    /// CBOR-encoded delta payload
    pub delta_payload: Vec<u8>,
    /// Optional signature over the payload
    pub signature: Option<Vec<u8>>,
}

impl DocDelta {
    /// Wrap `delta` for transmission.
    ///
    /// # Errors
    ///
    /// Returns error if the delta is empty or cannot be encoded.
    pub fn new(table_id: impl Into<String>, delta: &TableDelta) -> Result<Self, MessageError> {
        let timestamp = delta.max_timestamp().ok_or(MessageError::EmptyDelta)?;
        let payload = encode_delta(delta).map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(Self {
            table_id: table_id.into(),
            delta_id: timestamp.to_bytes(),
            delta_payload: payload,
            signature: None,
        })
    }

    /// Get the timestamp from `delta_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the identifier is malformed.
    pub fn timestamp(&self) -> Result<Timestamp, MessageError> {
        Timestamp::from_bytes(&self.delta_id).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Decode the carried delta.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a valid delta.
    pub fn delta(&self) -> Result<TableDelta, MessageError> {
        decode_delta(&self.delta_payload).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

impl CborMessage for DocDelta {}

/// Presence change of one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessMessage {
    /// Table the presence refers to
    pub table_id: String,
    /// The change itself
    pub update: AwarenessUpdate,
}

impl CborMessage for AwarenessMessage {}

/// Request for a peer's full table state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntiEntropyRequest {
    /// Table identifier
    pub table_id: String,
    /// Request sequence; responses echo it
    pub seq: u64,
    /// Actor asking
    pub requester: ActorId,
}

impl AntiEntropyRequest {
    /// Create a new anti-entropy request.
    #[must_use]
    pub fn new(table_id: impl Into<String>, seq: u64, requester: ActorId) -> Self {
        Self {
            table_id: table_id.into(),
            seq,
            requester,
        }
    }
}

impl CborMessage for AntiEntropyRequest {}

/// Full table state answering an [`AntiEntropyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEntropyResponse {
    /// Table identifier
    pub table_id: String,
    /// Sequence of the request being answered
    pub seq: u64,
    /// Actor the response is addressed to
    pub requester: ActorId,
    /// CBOR-encoded snapshot
    pub snapshot: Vec<u8>,
}

impl AntiEntropyResponse {
    /// Answer `request` with `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be encoded.
    pub fn answer(request: &AntiEntropyRequest, snapshot: &DocSnapshot) -> Result<Self, MessageError> {
        Ok(Self {
            table_id: request.table_id.clone(),
            seq: request.seq,
            requester: request.requester,
            snapshot: snapshot.to_cbor().map_err(|e| MessageError::Serialize(e.to_string()))?,
        })
    }

    /// Decode the carried snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot bytes are malformed.
    pub fn snapshot(&self) -> Result<DocSnapshot, MessageError> {
        DocSnapshot::from_cbor(&self.snapshot).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

impl CborMessage for AntiEntropyResponse {}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// A delta without writes has no identifier
    #[error("delta contains no writes")]
    EmptyDelta,
}
