//! # Tabletop Sync Agent
//!
//! Replication agent for one shared table.
//!
//! ## Architecture
//!
//! The agent runs one loop over four sources:
//! 1. **Replication**: deltas, presence and anti-entropy over MQTT
//! 2. **Load**: durable state read once at startup, bounded by a timeout
//! 3. **Persistence**: periodic snapshots and delta log compaction
//! 4. **Presence**: pruning peers that went quiet and renewing our own entry

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod persistence;
pub mod replication;
pub mod runtime;

pub use config::{AgentConfig, StoreType};
pub use persistence::{PersistenceError, SqliteStore};
pub use replication::{ReplicationError, ReplicationManager};
pub use runtime::{Agent, Frame};
