//! The replicated table document.
//!
//! State is an OR-Map where:
//! - Keys address one field of one object, or one metadata slot
//! - Values are LWW registers holding JSON values
//!
//! Writing fields independently means a concurrent move and select of the
//! same object both survive a merge.

use crate::crdt::{Delta, OrMap};
use crate::hlc::{Hlc, Timestamp};
use crate::ids::{ActorId, ObjectId};
use crate::object::TableObject;
use crate::sort_key::SortKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// A batch of register writes against a table document.
pub type TableDelta = Delta<DocKey, Value>;

/// Persisted object fields, one register each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    /// Object variant tag; an object exists while this register does
    Kind,
    /// Containing object id or null
    ContainerId,
    /// `{x, y, r}`
    Pos,
    /// Paint order key
    SortKey,
    /// Lock flag
    Locked,
    /// Owning actor id or null
    SelectedBy,
    /// Extension data
    Meta,
    /// Card ids, top first
    Cards,
    /// Face orientation
    FaceUp,
    /// Counter value
    Value,
}

impl FieldName {
    /// Every field an object may carry.
    pub const ALL: [FieldName; 10] = [
        FieldName::Kind,
        FieldName::ContainerId,
        FieldName::Pos,
        FieldName::SortKey,
        FieldName::Locked,
        FieldName::SelectedBy,
        FieldName::Meta,
        FieldName::Cards,
        FieldName::FaceUp,
        FieldName::Value,
    ];
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldName::Kind => "kind",
            FieldName::ContainerId => "containerId",
            FieldName::Pos => "pos",
            FieldName::SortKey => "sortKey",
            FieldName::Locked => "locked",
            FieldName::SelectedBy => "selectedBy",
            FieldName::Meta => "meta",
            FieldName::Cards => "cards",
            FieldName::FaceUp => "faceUp",
            FieldName::Value => "value",
        };
        f.write_str(name)
    }
}

/// Address of one register in the document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocKey {
    /// One field of a table object
    Field {
        /// Owning object
        object: ObjectId,
        /// Which field
        field: FieldName,
    },
    /// A slot of the cross-actor metadata channel
    Metadata(String),
}

impl DocKey {
    /// Key for `field` of `object`.
    #[must_use]
    pub fn field(object: ObjectId, field: FieldName) -> Self {
        DocKey::Field { object, field }
    }

    /// Object addressed by this key, if any.
    #[must_use]
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            DocKey::Field { object, .. } => Some(*object),
            DocKey::Metadata(_) => None,
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocKey::Field { object, field } => write!(f, "objects/{object}/{field}"),
            DocKey::Metadata(slot) => write!(f, "metadata/{slot}"),
        }
    }
}

/// Full document state for durable storage or state transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSnapshot {
    /// Table the state belongs to
    pub table_id: String,
    /// Clock of the replica that produced the snapshot
    pub clock: Timestamp,
    /// Every visible register and tombstone
    pub state: TableDelta,
}

impl DocSnapshot {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, DocumentError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| DocumentError::Encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, DocumentError> {
        ciborium::from_reader(bytes).map_err(|e| DocumentError::Decode(e.to_string()))
    }
}

/// Serialize a delta to CBOR bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_delta(delta: &TableDelta) -> Result<Vec<u8>, DocumentError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(delta, &mut bytes).map_err(|e| DocumentError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Deserialize a delta from CBOR bytes.
///
/// # Errors
///
/// Returns error if deserialization fails.
pub fn decode_delta(bytes: &[u8]) -> Result<TableDelta, DocumentError> {
    ciborium::from_reader(bytes).map_err(|e| DocumentError::Decode(e.to_string()))
}

/// A CRDT-backed table.
#[derive(Debug, Clone)]
pub struct TableDocument {
    table_id: String,
    state: OrMap<DocKey, Value>,
    clock: Hlc,
}

impl TableDocument {
    /// Create an empty document edited by `actor`.
    #[must_use]
    pub fn new(table_id: impl Into<String>, actor: ActorId) -> Self {
        Self {
            table_id: table_id.into(),
            state: OrMap::new(),
            clock: Hlc::new(actor),
        }
    }

    /// Table identifier.
    #[must_use]
    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    /// Local editing identity.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.clock.actor()
    }

    /// Latest timestamp issued or observed.
    #[must_use]
    pub fn clock(&self) -> Timestamp {
        self.clock.current()
    }

    /// Raw register value.
    #[must_use]
    pub fn get(&self, key: &DocKey) -> Option<&Value> {
        self.state.get(key)
    }

    /// Decode the object `id`.
    ///
    /// Objects whose registers are incomplete, e.g. a field written
    /// concurrently with a delete, are treated as absent.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<TableObject> {
        if !self.state.contains_key(&DocKey::field(id, FieldName::Kind)) {
            return None;
        }
        match TableObject::decode(|field| self.state.get(&DocKey::field(id, field))) {
            Ok(object) => Some(object),
            Err(err) => {
                tracing::debug!(table_id = %self.table_id, object = %id, error = %err, "Skipping undecodable object");
                None
            }
        }
    }

    /// Ids of every object with a `kind` register.
    #[must_use]
    pub fn object_ids(&self) -> BTreeSet<ObjectId> {
        self.state
            .keys()
            .filter_map(|key| match key {
                DocKey::Field {
                    object,
                    field: FieldName::Kind,
                } => Some(*object),
                _ => None,
            })
            .collect()
    }

    /// Ids of objects that have any register at all, including partial ones.
    pub(crate) fn addressed_objects(&self) -> BTreeSet<ObjectId> {
        self.state.keys().filter_map(DocKey::object).collect()
    }

    /// Highest sort key in the document.
    #[must_use]
    pub fn max_sort_key(&self) -> Option<SortKey> {
        self.state
            .iter()
            .filter_map(|(key, value)| match key {
                DocKey::Field {
                    field: FieldName::SortKey,
                    ..
                } => value.as_str().and_then(|raw| raw.parse::<SortKey>().ok()),
                _ => None,
            })
            .max()
    }

    /// Metadata slots and their raw values.
    pub fn metadata(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.state.iter().filter_map(|(key, value)| match key {
            DocKey::Metadata(slot) => Some((slot.as_str(), value)),
            DocKey::Field { .. } => None,
        })
    }

    /// Write one register, recording the write in `delta`.
    pub(crate) fn write(&mut self, key: DocKey, value: Value, delta: &mut TableDelta) {
        let timestamp = self.clock.tick();
        self.state.insert(key.clone(), value.clone(), timestamp);
        delta.add_insert(key, value, timestamp);
    }

    /// Remove one register, recording the removal in `delta`.
    pub(crate) fn erase(&mut self, key: DocKey, delta: &mut TableDelta) {
        let timestamp = self.clock.tick();
        self.state.remove(&key, timestamp);
        delta.add_remove(key, timestamp);
    }

    /// Integrate a delta from another replica.
    pub fn apply_delta(&mut self, delta: &TableDelta) {
        if let Some(latest) = delta.max_timestamp() {
            self.clock.observe(latest);
        }
        let before_len = self.state.len();
        delta.apply_to(&mut self.state);
        tracing::debug!(
            table_id = %self.table_id,
            inserts = delta.inserts.len(),
            removes = delta.removes.len(),
            before_len,
            after_len = self.state.len(),
            "Applied delta"
        );
    }

    /// Capture the complete state.
    #[must_use]
    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            table_id: self.table_id.clone(),
            clock: self.clock.current(),
            state: self.state.to_delta(),
        }
    }

    /// Drop tombstones older than `before`; returns how many were dropped.
    pub fn compact_tombstones(&mut self, before: Timestamp) -> usize {
        self.state.compact_tombstones(before)
    }

    /// Number of visible registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Whether the document holds no registers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

/// Errors decoding document contents.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    /// A required object register is absent
    #[error("missing field {0}")]
    MissingField(FieldName),
    /// A register holds a value of the wrong shape
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Offending field
        field: FieldName,
        /// Deserializer message
        reason: String,
    },
    /// Serialization failed
    #[error("encode failed: {0}")]
    Encode(String),
    /// Deserialization failed
    #[error("decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NewObject, Position};

    fn write_object(doc: &mut TableDocument, id: ObjectId) -> TableDelta {
        let object = NewObject::stack(Position::at(1.0, 2.0))
            .with_cards(["a1"])
            .into_object(SortKey::after(doc.max_sort_key().as_ref()));
        let mut delta = TableDelta::new();
        for (field, value) in object.encode() {
            doc.write(DocKey::field(id, field), value, &mut delta);
        }
        delta
    }

    #[test]
    fn doc_key_display() {
        let id = ObjectId::new();
        assert_eq!(
            DocKey::field(id, FieldName::SelectedBy).to_string(),
            format!("objects/{id}/selectedBy")
        );
        assert_eq!(DocKey::Metadata("content".into()).to_string(), "metadata/content");
    }

    #[test]
    fn concurrent_field_writes_both_survive() {
        let id = ObjectId::new();
        let mut a = TableDocument::new("t1", ActorId::new());
        let created = write_object(&mut a, id);

        let mut b = TableDocument::new("t1", ActorId::new());
        b.apply_delta(&created);

        let mut moved = TableDelta::new();
        let pos = serde_json::json!({"x": 9.0, "y": 9.0, "r": 0.0});
        a.write(DocKey::field(id, FieldName::Pos), pos, &mut moved);

        let mut selected = TableDelta::new();
        let owner = b.actor();
        b.write(
            DocKey::field(id, FieldName::SelectedBy),
            Value::String(owner.to_string()),
            &mut selected,
        );

        a.apply_delta(&selected);
        b.apply_delta(&moved);

        for doc in [&a, &b] {
            let object = doc.object(id).unwrap();
            assert_eq!(object.pos, Position::at(9.0, 9.0));
            assert_eq!(object.selected_by, Some(owner));
        }
    }

    #[test]
    fn partially_resurrected_object_is_invisible() {
        let id = ObjectId::new();
        let mut a = TableDocument::new("t1", ActorId::new());
        let created = write_object(&mut a, id);
        let mut b = TableDocument::new("t1", ActorId::new());
        b.apply_delta(&created);

        let mut deleted = TableDelta::new();
        for field in FieldName::ALL {
            a.erase(DocKey::field(id, field), &mut deleted);
        }

        // b moves the object after a deleted it, with a later clock
        b.apply_delta(&deleted);
        let mut moved = TableDelta::new();
        b.write(
            DocKey::field(id, FieldName::Pos),
            serde_json::json!({"x": 1.0, "y": 1.0, "r": 0.0}),
            &mut moved,
        );

        assert!(b.object(id).is_none());
        assert!(b.object_ids().is_empty());
        assert!(b.addressed_objects().contains(&id));
    }

    #[test]
    fn snapshot_survives_cbor() {
        let mut doc = TableDocument::new("t1", ActorId::new());
        let id = ObjectId::new();
        let _ = write_object(&mut doc, id);

        let bytes = doc.snapshot().to_cbor().unwrap();
        let snapshot = DocSnapshot::from_cbor(&bytes).unwrap();

        let mut restored = TableDocument::new("t1", ActorId::new());
        restored.apply_delta(&snapshot.state);
        assert_eq!(restored.object(id), doc.object(id));
    }

    #[test]
    fn delta_survives_cbor() {
        let mut doc = TableDocument::new("t1", ActorId::new());
        let delta = write_object(&mut doc, ObjectId::new());
        let decoded = decode_delta(&encode_delta(&delta).unwrap()).unwrap();
        assert_eq!(decoded, delta);
    }
}
