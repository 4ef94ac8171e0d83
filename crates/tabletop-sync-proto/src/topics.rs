//! MQTT topic scheme for table replication.
//!
//! Topic structure: `tabletop-sync/v1/{tenant}/{table_id}/{message_type}`
//!
//! This allows:
//! - Tenant isolation
//! - One topic tree per table
//! - Message-type filtering

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Default topic prefix.
pub const DEFAULT_PREFIX: &str = "tabletop-sync";

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a topic scheme for `tenant`.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    fn base(&self, table_id: &str) -> String {
        format!("{}/{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant, table_id)
    }

    /// Topic for `kind` messages of `table_id`.
    #[must_use]
    pub fn topic(&self, table_id: &str, kind: MessageType) -> String {
        format!("{}/{}", self.base(table_id), kind.suffix())
    }

    /// Wildcard subscription for all messages of a table.
    #[must_use]
    pub fn table_wildcard(&self, table_id: &str) -> String {
        format!("{}/#", self.base(table_id))
    }

    /// Parse a topic into `(table_id, message_type)`.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(String, MessageType)> {
        let expected_prefix = format!("{}/{}/{}/", self.prefix, PROTOCOL_VERSION, self.tenant);
        let remainder = topic.strip_prefix(&expected_prefix)?;
        let (table_id, suffix) = remainder.split_once('/')?;
        if table_id.is_empty() {
            return None;
        }
        let kind = MessageType::ALL.into_iter().find(|kind| kind.suffix() == suffix)?;
        Some((table_id.to_string(), kind))
    }
}

/// Message types in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Agent hello
    Hello,
    /// Delta replication
    Delta,
    /// Presence broadcast
    Awareness,
    /// Anti-entropy request
    AntiEntropyRequest,
    /// Anti-entropy response
    AntiEntropyResponse,
}

impl MessageType {
    /// Every message type.
    pub const ALL: [MessageType; 5] = [
        MessageType::Hello,
        MessageType::Delta,
        MessageType::Awareness,
        MessageType::AntiEntropyRequest,
        MessageType::AntiEntropyResponse,
    ];

    fn suffix(self) -> &'static str {
        match self {
            MessageType::Hello => "hello",
            MessageType::Delta => "delta",
            MessageType::Awareness => "awareness",
            MessageType::AntiEntropyRequest => "ae/request",
            MessageType::AntiEntropyResponse => "ae/response",
        }
    }
}
