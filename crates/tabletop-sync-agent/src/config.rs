//! Agent configuration.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tabletop_sync_core::{ActorId, AWARENESS_TIMEOUT};
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Stable actor identity; a fresh one is generated when absent
    pub actor_id: Option<ActorId>,

    /// Table to replicate
    pub table_id: String,

    /// Replication configuration
    pub replication: ReplicationConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Remote presence older than this is pruned
    pub awareness_timeout: Duration,
}

/// Replication configuration.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// MQTT broker URL; `None` runs the agent offline
    pub mqtt_broker: Option<String>,

    /// Tenant identifier
    pub tenant: String,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Where durable state lives
    pub store_type: StoreType,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,

    /// How often a full snapshot is written and the delta log compacted
    pub snapshot_interval: Duration,
}

/// Durable storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// `SQLite` file at `db_path`
    Sqlite,
    /// `SQLite` in memory; state is lost on exit
    Memory,
}

impl FromStr for StoreType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store type '{other}', expected 'sqlite' or 'memory'"),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            actor_id: None,
            table_id: "default".to_string(),
            replication: ReplicationConfig {
                mqtt_broker: None,
                tenant: "default".to_string(),
            },
            persistence: PersistenceConfig {
                store_type: StoreType::Sqlite,
                db_path: PathBuf::from("./tabletop-sync.db"),
                snapshot_interval: Duration::from_secs(60),
            },
            awareness_timeout: AWARENESS_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TABLETOP_ACTOR_ID`: Actor UUID
    /// - `TABLETOP_TABLE_ID`: Table to replicate
    /// - `TABLETOP_MQTT_BROKER`: MQTT broker URL (unset: offline)
    /// - `TABLETOP_TENANT`: Tenant identifier
    /// - `TABLETOP_STORE_TYPE`: "sqlite" or "memory"
    /// - `TABLETOP_DB_PATH`: `SQLite` database path
    /// - `TABLETOP_SNAPSHOT_INTERVAL_SECS`: Snapshot period in seconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("TABLETOP_ACTOR_ID") {
            let uuid = Uuid::parse_str(&id).context("Invalid TABLETOP_ACTOR_ID")?;
            config.actor_id = Some(ActorId(uuid));
        }

        if let Some(table_id) = lookup("TABLETOP_TABLE_ID") {
            if table_id.is_empty() || table_id.contains(['/', '+', '#']) {
                bail!("Invalid TABLETOP_TABLE_ID '{table_id}': must be non-empty without '/', '+' or '#'");
            }
            config.table_id = table_id;
        }

        if let Some(mqtt) = lookup("TABLETOP_MQTT_BROKER").filter(|value| !value.is_empty()) {
            config.replication.mqtt_broker = Some(mqtt);
        }

        if let Some(tenant) = lookup("TABLETOP_TENANT") {
            config.replication.tenant = tenant;
        }

        if let Some(store_type) = lookup("TABLETOP_STORE_TYPE") {
            config.persistence.store_type = store_type.parse().context("Invalid TABLETOP_STORE_TYPE")?;
        }

        if let Some(db_path) = lookup("TABLETOP_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(secs) = lookup("TABLETOP_SNAPSHOT_INTERVAL_SECS") {
            let secs: u64 = secs.parse().context("Invalid TABLETOP_SNAPSHOT_INTERVAL_SECS")?;
            if secs == 0 {
                bail!("TABLETOP_SNAPSHOT_INTERVAL_SECS must be positive");
            }
            config.persistence.snapshot_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_run_offline() {
        let config = load(&[]).unwrap();
        assert!(config.replication.mqtt_broker.is_none());
        assert_eq!(config.persistence.store_type, StoreType::Sqlite);
        assert_eq!(config.awareness_timeout, AWARENESS_TIMEOUT);
    }

    #[test]
    fn overrides_are_applied() {
        let actor = ActorId::new();
        let actor_str = actor.to_string();
        let config = load(&[
            ("TABLETOP_ACTOR_ID", actor_str.as_str()),
            ("TABLETOP_TABLE_ID", "table-9"),
            ("TABLETOP_MQTT_BROKER", "tcp://broker:1884"),
            ("TABLETOP_STORE_TYPE", "memory"),
            ("TABLETOP_SNAPSHOT_INTERVAL_SECS", "15"),
        ])
        .unwrap();

        assert_eq!(config.actor_id, Some(actor));
        assert_eq!(config.table_id, "table-9");
        assert_eq!(config.replication.mqtt_broker.as_deref(), Some("tcp://broker:1884"));
        assert_eq!(config.persistence.store_type, StoreType::Memory);
        assert_eq!(config.persistence.snapshot_interval, Duration::from_secs(15));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(load(&[("TABLETOP_ACTOR_ID", "nope")]).is_err());
        assert!(load(&[("TABLETOP_STORE_TYPE", "redis")]).is_err());
        assert!(load(&[("TABLETOP_TABLE_ID", "a/b")]).is_err());
        assert!(load(&[("TABLETOP_SNAPSHOT_INTERVAL_SECS", "0")]).is_err());
    }
}
