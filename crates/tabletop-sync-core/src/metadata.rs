//! Cross-actor signals carried next to the object collection.
//!
//! Every message carries a `type` discriminator. Values written by remote
//! replicas are parsed before use and ignored when they do not validate.

use crate::ids::ActorId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Slot used for content-loaded announcements.
pub const CONTENT_SLOT: &str = "content";

/// Slot used for administrative reset announcements.
pub const RESET_SLOT: &str = "reset";

/// A validated metadata message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MetadataMessage {
    /// An actor loaded new content (e.g. a scenario) onto the table
    ContentLoaded {
        /// Identity of the loaded content
        content_id: String,
        /// Actor that loaded it
        actor: ActorId,
        /// Wall time of the load in milliseconds
        loaded_at_ms: u64,
    },
    /// An actor force-cleared the table's selections
    TableReset {
        /// Actor that reset
        actor: ActorId,
        /// Wall time of the reset in milliseconds
        at_ms: u64,
    },
}

impl MetadataMessage {
    /// Validate a raw register value.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::MissingType`] when there is no string `type`
    /// field, or [`MetadataError::Invalid`] when the payload does not match it.
    pub fn parse(value: &Value) -> Result<Self, MetadataError> {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(MetadataError::MissingType);
        };
        Self::deserialize(value).map_err(|e| MetadataError::Invalid {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
    }

    /// Register value for this message.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            MetadataMessage::ContentLoaded {
                content_id,
                actor,
                loaded_at_ms,
            } => json!({
                "type": "contentLoaded",
                "content_id": content_id,
                "actor": actor.to_string(),
                "loaded_at_ms": loaded_at_ms,
            }),
            MetadataMessage::TableReset { actor, at_ms } => json!({
                "type": "tableReset",
                "actor": actor.to_string(),
                "at_ms": at_ms,
            }),
        }
    }
}

/// Metadata validation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetadataError {
    /// No `type` discriminator
    #[error("metadata value has no type discriminator")]
    MissingType,
    /// Payload does not match its discriminator
    #[error("invalid {kind} metadata: {reason}")]
    Invalid {
        /// Declared type
        kind: String,
        /// Deserializer message
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_its_own_values() {
        let message = MetadataMessage::ContentLoaded {
            content_id: "scenario-7".into(),
            actor: ActorId::new(),
            loaded_at_ms: 1_760_000_000_000,
        };
        assert_eq!(MetadataMessage::parse(&message.to_value()).unwrap(), message);

        let reset = MetadataMessage::TableReset {
            actor: ActorId::new(),
            at_ms: 5,
        };
        assert_eq!(MetadataMessage::parse(&reset.to_value()).unwrap(), reset);
    }

    #[test]
    fn rejects_untyped_values() {
        let err = MetadataMessage::parse(&json!({"content_id": "x"})).unwrap_err();
        assert!(matches!(err, MetadataError::MissingType));
        assert!(matches!(
            MetadataMessage::parse(&json!("contentLoaded")),
            Err(MetadataError::MissingType)
        ));
    }

    #[test]
    fn rejects_unknown_or_incomplete_payloads() {
        assert!(matches!(
            MetadataMessage::parse(&json!({"type": "selfDestruct"})),
            Err(MetadataError::Invalid { .. })
        ));
        assert!(matches!(
            MetadataMessage::parse(&json!({"type": "contentLoaded", "content_id": "x"})),
            Err(MetadataError::Invalid { .. })
        ));
    }
}
