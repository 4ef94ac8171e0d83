//! # Tabletop Sync Core
//!
//! Replicated object store and mutation engine for a shared virtual table.
//!
//! This crate provides:
//! - Hybrid Logical Clock (HLC) for globally ordered timestamps
//! - CRDT primitives (LWW registers, OR-Map) the table document is built on
//! - Typed table objects stored one register per field
//! - An observable object store with atomic transactions
//! - Selection, exhaust, flip, stacking and z-order actions
//! - Ephemeral presence (cursors and drags) kept apart from durable state

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod awareness;
pub mod crdt;
pub mod document;
pub mod hlc;
pub mod ids;
mod listeners;
pub mod metadata;
pub mod object;
pub mod reload;
pub mod selectors;
pub mod sort_key;
pub mod stacking;
pub mod store;

pub use actions::{
    bring_to_front, clear_all_selections, exhaust, flip, move_objects, select, set_locked,
    unselect, SelectFailure, SelectFailureReason, SelectOutcome,
};
pub use awareness::{Awareness, AwarenessState, AwarenessUpdate, AWARENESS_TIMEOUT};
pub use crdt::{Delta, LwwRegister, OrMap};
pub use document::{DocKey, DocSnapshot, DocumentError, FieldName, TableDelta, TableDocument};
pub use hlc::{Hlc, Timestamp};
pub use ids::{ActorId, ObjectId};
pub use listeners::Subscription;
pub use metadata::{MetadataMessage, CONTENT_SLOT, RESET_SLOT};
pub use object::{Meta, MetaKey, NewObject, ObjectBody, ObjectKind, Position, TableObject};
pub use reload::{ReloadSequencer, ReloadTicket};
pub use sort_key::SortKey;
pub use stacking::{stack, unstack, StackError};
pub use store::{
    storage_key, DurableState, ObjectChanges, ObjectStore, Origin, Readiness, Transaction,
    LOAD_TIMEOUT,
};
