//! # Tabletop Sync Protocol
//!
//! Wire messages and MQTT topic scheme for replicating tables.
//!
//! ## Messages
//!
//! - `AgentHello`: Peer discovery and clock advertisement
//! - `DocDelta`: One committed transaction for incremental replication
//! - `AwarenessMessage`: Ephemeral presence of one actor
//! - `AntiEntropyRequest/Response`: Full-state catch-up
//!
//! ## MQTT Topics
//!
//! Topic scheme: `tabletop-sync/v1/{tenant}/{table_id}/{message_type}`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    AgentHello, AntiEntropyRequest, AntiEntropyResponse, AwarenessMessage, CborMessage, DocDelta,
    MessageError,
};
pub use topics::{MessageType, TopicScheme};
