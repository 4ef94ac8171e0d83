//! Replication layer: publishes outbound frames and subscribes to the table.

use crate::runtime::Frame;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::time::Duration;
use tabletop_sync_proto::{MessageType, TopicScheme};
use url::Url;

/// Default MQTT port when the broker URL has none.
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Replication manager for one table.
pub struct ReplicationManager {
    client: AsyncClient,
    topic_scheme: TopicScheme,
    table_id: String,
}

impl ReplicationManager {
    /// Create a new replication manager.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
        table_id: impl Into<String>,
    ) -> Result<(Self, EventLoop), ReplicationError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                topic_scheme,
                table_id: table_id.into(),
            },
            eventloop,
        ))
    }

    /// Subscribe to every message of the table.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe(&self) -> Result<(), ReplicationError> {
        let topic = self.topic_scheme.table_wildcard(&self.table_id);

        tracing::info!(topic, "Subscribing to replication topic");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ReplicationError::Subscribe(e.to_string()))?;

        Ok(())
    }

    /// Queue one outbound frame without waiting on the event loop.
    ///
    /// Presence is sent at most once; everything else at least once.
    ///
    /// # Errors
    ///
    /// Returns error if the request queue is full or closed.
    pub fn publish(&self, frame: &Frame) -> Result<(), ReplicationError> {
        let topic = self.topic_scheme.topic(&self.table_id, frame.kind);
        let qos = match frame.kind {
            MessageType::Awareness => QoS::AtMostOnce,
            _ => QoS::AtLeastOnce,
        };

        tracing::trace!(topic, payload_len = frame.payload.len(), "Publishing frame");

        self.client
            .try_publish(&topic, qos, false, frame.payload.clone())
            .map_err(|e| ReplicationError::Publish(e.to_string()))?;

        Ok(())
    }

    /// Classify an incoming topic. Topics of other tables are rejected.
    #[must_use]
    pub fn classify(&self, topic: &str) -> Option<MessageType> {
        match self.topic_scheme.parse(topic) {
            Some((table_id, kind)) if table_id == self.table_id => Some(kind),
            _ => None,
        }
    }

    /// Disconnect from the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), ReplicationError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ReplicationError::Publish(e.to_string()))
    }
}

/// Parse MQTT URL into host and port.
///
/// Accepts `tcp://host[:port]`, `mqtt://host[:port]` or `host[:port]`.
pub(crate) fn parse_mqtt_url(input: &str) -> Result<(String, u16), ReplicationError> {
    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| ReplicationError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(ReplicationError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ReplicationError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);

        return Ok((host.to_string(), port));
    }

    let (host, port) = match input.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ReplicationError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'")))?;
            (host, port)
        }
        None => (input, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(ReplicationError::InvalidBrokerUrl(format!("{input}: missing host")));
    }

    Ok((host.to_string(), port))
}

/// Errors for replication operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
}
