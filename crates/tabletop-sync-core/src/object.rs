//! Table object schema.
//!
//! Objects are persisted one register per field (see [`FieldName`]), so the
//! conversion between [`TableObject`] and its field values lives here.

use crate::document::{DocumentError, FieldName};
use crate::ids::{ActorId, ObjectId};
use crate::sort_key::SortKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Table-plane position and rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
    /// Rotation in degrees
    pub r: f64,
}

impl Position {
    /// Position with the given coordinates and rotation.
    #[must_use]
    pub fn new(x: f64, y: f64, r: f64) -> Self {
        Self { x, y, r }
    }

    /// Unrotated position at `(x, y)`.
    #[must_use]
    pub fn at(x: f64, y: f64) -> Self {
        Self { x, y, r: 0.0 }
    }

    /// Whether every component is a finite number.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.r.is_finite()
    }

    /// Copy with non-finite components replaced by zero.
    #[must_use]
    pub fn sanitized(self) -> Self {
        let finite = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self::new(finite(self.x), finite(self.y), finite(self.r))
    }

    fn to_value(self) -> Value {
        json!({ "x": self.x, "y": self.y, "r": self.r })
    }
}

/// Object variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObjectKind {
    /// A pile of cards
    Stack,
    /// A two-sided token
    Token,
    /// A named region of the table
    Zone,
    /// A background mat
    Mat,
    /// A numeric counter
    Counter,
}

impl ObjectKind {
    /// Stored name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Stack => "stack",
            ObjectKind::Token => "token",
            ObjectKind::Zone => "zone",
            ObjectKind::Mat => "mat",
            ObjectKind::Counter => "counter",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension keys the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetaKey {
    /// Display label
    Label,
    /// Tint color, e.g. `#cc3300`
    Color,
    /// Player seat owning the object
    Owner,
    /// Deck the cards were drawn from
    Deck,
}

impl MetaKey {
    fn as_str(self) -> &'static str {
        match self {
            MetaKey::Label => "label",
            MetaKey::Color => "color",
            MetaKey::Owner => "owner",
            MetaKey::Deck => "deck",
        }
    }
}

/// Free-form per-object extension data.
///
/// Known keys carry strings; anything game specific goes to `extra` as
/// opaque JSON and is never interpreted by the core.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Meta {
    /// Values for the known extension keys
    #[serde(default)]
    pub known: BTreeMap<MetaKey, String>,
    /// Opaque game-specific values
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Meta {
    /// Value of a known key.
    #[must_use]
    pub fn get(&self, key: MetaKey) -> Option<&str> {
        self.known.get(&key).map(String::as_str)
    }

    /// Set a known key, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: MetaKey, value: impl Into<String>) -> Self {
        self.known.insert(key, value.into());
        self
    }

    /// Set an opaque extension value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    /// Whether neither known nor extra values are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.extra.is_empty()
    }

    fn to_value(&self) -> Value {
        let known: Map<String, Value> = self
            .known
            .iter()
            .map(|(key, value)| (key.as_str().to_string(), Value::String(value.clone())))
            .collect();
        let extra: Map<String, Value> = self
            .extra
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        json!({ "known": known, "extra": extra })
    }
}

/// Cards held by a stack or token. Index 0 is the top card.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CardPile {
    /// Card identifiers, top first
    pub cards: Vec<String>,
    /// Whether the pile shows its faces
    pub face_up: bool,
}

/// Kind-specific part of a table object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ObjectBody {
    /// A pile of cards
    Stack(CardPile),
    /// A token, optionally carrying cards
    Token(CardPile),
    /// A table region
    Zone,
    /// A background mat
    Mat,
    /// A numeric counter
    Counter {
        /// Current count
        value: i64,
    },
}

/// A persisted object on the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableObject {
    /// Containing object, if any; a relation only
    pub container_id: Option<ObjectId>,
    /// Position and rotation
    pub pos: Position,
    /// Paint order
    pub sort_key: SortKey,
    /// Locked objects reject selection
    pub locked: bool,
    /// Actor currently owning the object
    pub selected_by: Option<ActorId>,
    /// Extension data
    pub meta: Meta,
    /// Kind-specific fields
    pub body: ObjectBody,
}

impl TableObject {
    /// Variant tag of this object.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        match self.body {
            ObjectBody::Stack(_) => ObjectKind::Stack,
            ObjectBody::Token(_) => ObjectKind::Token,
            ObjectBody::Zone => ObjectKind::Zone,
            ObjectBody::Mat => ObjectKind::Mat,
            ObjectBody::Counter { .. } => ObjectKind::Counter,
        }
    }

    /// Cards of a stack or token.
    #[must_use]
    pub fn cards(&self) -> Option<&[String]> {
        match &self.body {
            ObjectBody::Stack(pile) | ObjectBody::Token(pile) => Some(&pile.cards),
            _ => None,
        }
    }

    /// Face orientation of a stack or token.
    #[must_use]
    pub fn face_up(&self) -> Option<bool> {
        match &self.body {
            ObjectBody::Stack(pile) | ObjectBody::Token(pile) => Some(pile.face_up),
            _ => None,
        }
    }

    pub(crate) fn encode(&self) -> Vec<(FieldName, Value)> {
        let mut fields = vec![
            (FieldName::Kind, Value::from(self.kind().as_str())),
            (FieldName::ContainerId, optional_id(self.container_id.map(|id| id.0))),
            (FieldName::Pos, self.pos.to_value()),
            (FieldName::SortKey, Value::from(self.sort_key.as_str())),
            (FieldName::Locked, Value::from(self.locked)),
            (FieldName::SelectedBy, optional_id(self.selected_by.map(|actor| actor.0))),
            (FieldName::Meta, self.meta.to_value()),
        ];

        match &self.body {
            ObjectBody::Stack(pile) | ObjectBody::Token(pile) => {
                fields.push((FieldName::Cards, Value::from(pile.cards.clone())));
                fields.push((FieldName::FaceUp, Value::from(pile.face_up)));
            }
            ObjectBody::Counter { value } => fields.push((FieldName::Value, Value::from(*value))),
            ObjectBody::Zone | ObjectBody::Mat => {}
        }
        fields
    }

    pub(crate) fn decode<'a, F>(field: F) -> Result<Self, DocumentError>
    where
        F: Fn(FieldName) -> Option<&'a Value>,
    {
        let kind: ObjectKind = read(&field, FieldName::Kind)?;
        let body = match kind {
            ObjectKind::Stack => ObjectBody::Stack(read_pile(&field)?),
            ObjectKind::Token => ObjectBody::Token(read_pile(&field)?),
            ObjectKind::Zone => ObjectBody::Zone,
            ObjectKind::Mat => ObjectBody::Mat,
            ObjectKind::Counter => ObjectBody::Counter {
                value: read(&field, FieldName::Value)?,
            },
        };

        Ok(Self {
            container_id: read(&field, FieldName::ContainerId)?,
            pos: read(&field, FieldName::Pos)?,
            sort_key: read(&field, FieldName::SortKey)?,
            locked: read(&field, FieldName::Locked)?,
            selected_by: read(&field, FieldName::SelectedBy)?,
            meta: read(&field, FieldName::Meta)?,
            body,
        })
    }
}

fn optional_id(id: Option<uuid::Uuid>) -> Value {
    id.map_or(Value::Null, |id| Value::String(id.to_string()))
}

fn read_pile<'a, F>(field: &F) -> Result<CardPile, DocumentError>
where
    F: Fn(FieldName) -> Option<&'a Value>,
{
    Ok(CardPile {
        cards: read(field, FieldName::Cards)?,
        face_up: read(field, FieldName::FaceUp)?,
    })
}

fn read<'a, T, F>(field: &F, name: FieldName) -> Result<T, DocumentError>
where
    T: DeserializeOwned,
    F: Fn(FieldName) -> Option<&'a Value>,
{
    let value = field(name).ok_or(DocumentError::MissingField(name))?;
    T::deserialize(value).map_err(|e| DocumentError::InvalidField {
        field: name,
        reason: e.to_string(),
    })
}

/// Parameters for creating an object.
///
/// Unset fields take the defaults: unlocked, unselected, empty meta,
/// face-up with no cards for stacks and tokens, zero for counters.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObject {
    /// Variant to create
    pub kind: ObjectKind,
    /// Initial position
    pub pos: Position,
    /// Containing object
    pub container_id: Option<ObjectId>,
    /// Initial lock state
    pub locked: bool,
    /// Extension data
    pub meta: Meta,
    /// Initial cards (stacks and tokens)
    pub cards: Vec<String>,
    /// Initial face orientation (stacks and tokens)
    pub face_up: bool,
    /// Initial count (counters)
    pub value: i64,
}

impl NewObject {
    /// Defaults for `kind` at `pos`.
    #[must_use]
    pub fn new(kind: ObjectKind, pos: Position) -> Self {
        Self {
            kind,
            pos,
            container_id: None,
            locked: false,
            meta: Meta::default(),
            cards: Vec::new(),
            face_up: true,
            value: 0,
        }
    }

    /// A stack at `pos`.
    #[must_use]
    pub fn stack(pos: Position) -> Self {
        Self::new(ObjectKind::Stack, pos)
    }

    /// Set the initial cards, top first.
    #[must_use]
    pub fn with_cards<I, S>(mut self, cards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cards = cards.into_iter().map(Into::into).collect();
        self
    }

    /// Set the face orientation.
    #[must_use]
    pub fn face_up(mut self, face_up: bool) -> Self {
        self.face_up = face_up;
        self
    }

    /// Place inside `container`.
    #[must_use]
    pub fn in_container(mut self, container: ObjectId) -> Self {
        self.container_id = Some(container);
        self
    }

    /// Create locked.
    #[must_use]
    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    /// Attach extension data.
    #[must_use]
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    /// Initial counter value.
    #[must_use]
    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub(crate) fn into_object(self, sort_key: SortKey) -> TableObject {
        let pile = || CardPile {
            cards: self.cards.clone(),
            face_up: self.face_up,
        };
        let body = match self.kind {
            ObjectKind::Stack => ObjectBody::Stack(pile()),
            ObjectKind::Token => ObjectBody::Token(pile()),
            ObjectKind::Zone => ObjectBody::Zone,
            ObjectKind::Mat => ObjectBody::Mat,
            ObjectKind::Counter => ObjectBody::Counter { value: self.value },
        };

        TableObject {
            container_id: self.container_id,
            pos: self.pos.sanitized(),
            sort_key,
            locked: self.locked,
            selected_by: None,
            meta: self.meta,
            body,
        }
    }
}
