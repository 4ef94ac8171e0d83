//! Typed object store over the replicated table document.
//!
//! Every mutation runs inside one [`Transaction`]; committing it produces one
//! delta for replication and at most one [`ObjectChanges`] notification.

use crate::document::{DocKey, DocSnapshot, FieldName, TableDelta, TableDocument};
use crate::hlc::{wall_clock_ms, Timestamp};
use crate::ids::{ActorId, ObjectId};
use crate::listeners::{ListenerSet, Subscription};
use crate::metadata::{MetadataMessage, RESET_SLOT};
use crate::object::{NewObject, TableObject};
use crate::sort_key::SortKey;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound on waiting for durable state before continuing degraded.
pub const LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a batch of changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A transaction committed by this replica
    Local,
    /// A delta or snapshot received from elsewhere
    Remote,
}

/// Diff delivered to subscribers once per transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectChanges {
    /// Source of the changes
    pub origin: Origin,
    /// Objects that did not exist before
    pub added: Vec<(ObjectId, TableObject)>,
    /// Objects whose fields changed, in their new state
    pub updated: Vec<(ObjectId, TableObject)>,
    /// Objects that no longer exist
    pub removed: Vec<ObjectId>,
    /// Objects the local actor owned until a remote write took them over
    pub revoked_selections: Vec<ObjectId>,
    /// Metadata messages written in this batch that passed validation
    pub metadata: Vec<MetadataMessage>,
}

impl ObjectChanges {
    fn new(origin: Origin) -> Self {
        Self {
            origin,
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            revoked_selections: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Whether nothing observable changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.metadata.is_empty()
    }
}

/// Outcome of waiting for durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Prior durable state was merged
    Loaded,
    /// Loading timed out or failed; state may be stale
    Degraded,
}

/// Durable state read back from storage: a snapshot plus the deltas
/// committed after it.
#[derive(Debug, Clone, Default)]
pub struct DurableState {
    /// Last full snapshot, if one was written
    pub snapshot: Option<DocSnapshot>,
    /// Deltas logged after the snapshot, oldest first
    pub deltas: Vec<TableDelta>,
}

/// A batch of writes against the store.
///
/// Reads inside the transaction observe earlier writes of the same
/// transaction.
pub struct Transaction<'a> {
    doc: &'a mut TableDocument,
    delta: TableDelta,
    touched: Vec<ObjectId>,
    before: HashMap<ObjectId, Option<TableObject>>,
    metadata_slots: BTreeSet<String>,
}

impl<'a> Transaction<'a> {
    fn new(doc: &'a mut TableDocument) -> Self {
        Self {
            doc,
            delta: TableDelta::new(),
            touched: Vec::new(),
            before: HashMap::new(),
            metadata_slots: BTreeSet::new(),
        }
    }

    /// Local editing identity.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.doc.actor()
    }

    /// Current state of `id`.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<TableObject> {
        self.doc.object(id)
    }

    /// Ids of every existing object.
    #[must_use]
    pub fn object_ids(&self) -> BTreeSet<ObjectId> {
        self.doc.object_ids()
    }

    /// Key that orders above every object written so far.
    #[must_use]
    pub fn next_sort_key(&self) -> SortKey {
        SortKey::after(self.doc.max_sort_key().as_ref())
    }

    /// Create an object with a fresh id and a top-of-order sort key.
    pub fn create(&mut self, new: NewObject) -> ObjectId {
        let id = ObjectId::new();
        let object = new.into_object(self.next_sort_key());
        self.touch(id);
        self.write_fields(id, None, &object);
        id
    }

    /// Apply `change` to `id` and write the fields it altered.
    ///
    /// Returns `false` when the object does not exist.
    pub fn update<F>(&mut self, id: ObjectId, change: F) -> bool
    where
        F: FnOnce(&mut TableObject),
    {
        let Some(current) = self.doc.object(id) else {
            return false;
        };
        let mut next = current.clone();
        change(&mut next);
        if next != current {
            self.touch(id);
            self.write_fields(id, Some(&current), &next);
        }
        true
    }

    /// Remove every register of `id`. Returns `true` if the object existed.
    pub fn delete(&mut self, id: ObjectId) -> bool {
        let existed = self.doc.object(id).is_some();
        self.touch(id);
        for field in FieldName::ALL {
            self.doc.erase(DocKey::field(id, field), &mut self.delta);
        }
        existed
    }

    /// Write a metadata message into `slot`.
    pub fn set_metadata(&mut self, slot: &str, message: &MetadataMessage) {
        self.metadata_slots.insert(slot.to_string());
        self.doc
            .write(DocKey::Metadata(slot.to_string()), message.to_value(), &mut self.delta);
    }

    fn touch(&mut self, id: ObjectId) {
        if !self.before.contains_key(&id) {
            self.before.insert(id, self.doc.object(id));
            self.touched.push(id);
        }
    }

    fn write_fields(&mut self, id: ObjectId, current: Option<&TableObject>, next: &TableObject) {
        let old: HashMap<FieldName, Value> = current.map(TableObject::encode).unwrap_or_default().into_iter().collect();
        let new = next.encode();

        for (field, value) in &new {
            if old.get(field) != Some(value) {
                self.doc.write(DocKey::field(id, *field), value.clone(), &mut self.delta);
            }
        }
        for field in old.keys() {
            if !new.iter().any(|(name, _)| name == field) {
                self.doc.erase(DocKey::field(id, *field), &mut self.delta);
            }
        }
    }
}

/// Replicated, observable collection of table objects for one actor.
pub struct ObjectStore {
    doc: TableDocument,
    listeners: ListenerSet<ObjectChanges>,
    outbox: Vec<TableDelta>,
    ready: watch::Sender<Option<Readiness>>,
    swept: bool,
}

impl ObjectStore {
    /// Create an empty store for `table_id` edited by `actor`.
    #[must_use]
    pub fn new(table_id: impl Into<String>, actor: ActorId) -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            doc: TableDocument::new(table_id, actor),
            listeners: ListenerSet::new("object-store"),
            outbox: Vec::new(),
            ready,
            swept: false,
        }
    }

    /// Table identifier.
    #[must_use]
    pub fn table_id(&self) -> &str {
        self.doc.table_id()
    }

    /// Durable namespace holding this table's document.
    #[must_use]
    pub fn storage_key(&self) -> String {
        storage_key(self.doc.table_id())
    }

    /// Local editing identity.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.doc.actor()
    }

    /// Latest timestamp issued or observed by this replica.
    #[must_use]
    pub fn clock(&self) -> Timestamp {
        self.doc.clock()
    }

    /// Create an object. Always succeeds.
    pub fn create(&mut self, new: NewObject) -> ObjectId {
        self.transact(|txn| txn.create(new))
    }

    /// Current state of `id`.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<TableObject> {
        self.doc.object(id)
    }

    /// Visit every object in paint order.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(ObjectId, &TableObject),
    {
        for (id, object) in self.objects() {
            visitor(id, &object);
        }
    }

    /// Every object in paint order; equal keys fall back to id order.
    #[must_use]
    pub fn objects(&self) -> Vec<(ObjectId, TableObject)> {
        let mut objects: Vec<(ObjectId, TableObject)> = self
            .doc
            .object_ids()
            .into_iter()
            .filter_map(|id| self.doc.object(id).map(|object| (id, object)))
            .collect();
        objects.sort_by(|(a_id, a), (b_id, b)| a.sort_key.cmp(&b.sort_key).then(a_id.cmp(b_id)));
        objects
    }

    /// Number of existing objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    /// Whether the table has no objects. Undecodable objects do not count,
    /// as in [`ObjectStore::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.doc.object_ids().into_iter().any(|id| self.doc.object(id).is_some())
    }

    /// Delete `id`. Returns `false` if it did not exist.
    pub fn delete(&mut self, id: ObjectId) -> bool {
        if self.doc.object(id).is_none() {
            return false;
        }
        self.transact(|txn| txn.delete(id))
    }

    /// Delete every object, including partially merged leftovers.
    /// Returns the number of objects that existed.
    pub fn clear_all(&mut self) -> usize {
        let ids = self.doc.addressed_objects();
        if ids.is_empty() {
            return 0;
        }
        let removed = self.transact(|txn| ids.into_iter().filter(|id| txn.delete(*id)).count());
        tracing::info!(table_id = %self.table_id(), removed, "Cleared table");
        removed
    }

    /// Run `body` as one atomic batch.
    ///
    /// Listeners see a single coalesced notification after `body` returns,
    /// and the batch is queued for replication.
    pub fn transact<R, F>(&mut self, body: F) -> R
    where
        F: FnOnce(&mut Transaction<'_>) -> R,
    {
        let mut txn = Transaction::new(&mut self.doc);
        let result = body(&mut txn);
        let Transaction {
            delta,
            touched,
            before,
            metadata_slots,
            ..
        } = txn;

        if delta.is_empty() {
            return result;
        }

        let changes = self.collect_changes(Origin::Local, &touched, before, &metadata_slots);
        tracing::debug!(
            table_id = %self.table_id(),
            writes = delta.inserts.len() + delta.removes.len(),
            added = changes.added.len(),
            updated = changes.updated.len(),
            removed = changes.removed.len(),
            "Committed transaction"
        );
        self.outbox.push(delta);
        self.notify(&changes);
        result
    }

    /// Register `callback` for every committed or merged batch.
    pub fn subscribe<F>(&self, callback: F) -> Subscription<ObjectChanges>
    where
        F: Fn(&ObjectChanges) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Deltas committed locally since the last call, oldest first.
    pub fn take_outbound(&mut self) -> Vec<TableDelta> {
        std::mem::take(&mut self.outbox)
    }

    /// Integrate a delta from another replica.
    pub fn apply_remote(&mut self, delta: &TableDelta) {
        let mut touched = Vec::new();
        let mut before = HashMap::new();
        let mut metadata_slots = BTreeSet::new();

        for key in delta
            .inserts
            .iter()
            .map(|(key, _, _)| key)
            .chain(delta.removes.iter().map(|(key, _)| key))
        {
            match key {
                DocKey::Field { object, .. } => {
                    if !before.contains_key(object) {
                        before.insert(*object, self.doc.object(*object));
                        touched.push(*object);
                    }
                }
                DocKey::Metadata(slot) => {
                    metadata_slots.insert(slot.clone());
                }
            }
        }

        self.doc.apply_delta(delta);
        let changes = self.collect_changes(Origin::Remote, &touched, before, &metadata_slots);
        self.notify(&changes);
    }

    /// Integrate another replica's full state.
    pub fn merge_snapshot(&mut self, snapshot: &DocSnapshot) {
        if snapshot.table_id != self.table_id() {
            tracing::warn!(
                table_id = %self.table_id(),
                snapshot_table = %snapshot.table_id,
                "Ignoring snapshot for another table"
            );
            return;
        }
        self.apply_remote(&snapshot.state);
    }

    /// Capture the complete state for durable storage.
    #[must_use]
    pub fn snapshot(&self) -> DocSnapshot {
        self.doc.snapshot()
    }

    /// Drop tombstones older than `before`.
    pub fn compact_tombstones(&mut self, before: Timestamp) -> usize {
        self.doc.compact_tombstones(before)
    }

    /// Validated message in a metadata slot.
    ///
    /// Invalid values are logged and reported as absent.
    #[must_use]
    pub fn metadata(&self, slot: &str) -> Option<MetadataMessage> {
        let value = self.doc.get(&DocKey::Metadata(slot.to_string()))?;
        validate_metadata(self.table_id(), slot, value)
    }

    /// Publish a metadata message to every replica.
    pub fn publish_metadata(&mut self, slot: &str, message: &MetadataMessage) {
        self.transact(|txn| txn.set_metadata(slot, message));
    }

    /// Future resolving once durable state is loaded or given up on.
    ///
    /// Safe to await from any task; it does not borrow the store.
    pub fn ready(&self) -> impl Future<Output = Readiness> + Send + 'static {
        let mut rx = self.ready.subscribe();
        async move {
            loop {
                let current = *rx.borrow_and_update();
                if let Some(readiness) = current {
                    return readiness;
                }
                if rx.changed().await.is_err() {
                    return Readiness::Degraded;
                }
            }
        }
    }

    /// Readiness reached so far, if any.
    #[must_use]
    pub fn readiness(&self) -> Option<Readiness> {
        *self.ready.borrow()
    }

    /// Merge prior durable state and resolve [`ObjectStore::ready`].
    ///
    /// The first successful load also releases selections still held by
    /// the local identity from a previous session.
    pub fn hydrate(&mut self, durable: DurableState) -> Readiness {
        let DurableState { snapshot, deltas } = durable;
        let restored_deltas = deltas.len();
        if let Some(snapshot) = &snapshot {
            self.merge_snapshot(snapshot);
        }
        for delta in &deltas {
            self.apply_remote(delta);
        }

        let released = if self.swept { 0 } else { self.release_stale_selections() };
        self.swept = true;

        tracing::info!(
            table_id = %self.table_id(),
            had_snapshot = snapshot.is_some(),
            restored_deltas,
            objects = self.len(),
            released,
            "Table hydrated from durable storage"
        );
        self.ready.send_replace(Some(Readiness::Loaded));
        Readiness::Loaded
    }

    /// Resolve [`ObjectStore::ready`] without durable state.
    ///
    /// A later [`ObjectStore::hydrate`] still merges and upgrades to `Loaded`.
    pub fn mark_degraded(&mut self) {
        if self.readiness().is_none() {
            tracing::warn!(table_id = %self.table_id(), "Continuing without durable state");
            self.ready.send_replace(Some(Readiness::Degraded));
        }
    }

    /// Force-release every selection on the table regardless of owner and
    /// announce the reset on the metadata channel.
    pub(crate) fn reset_selections(&mut self) -> usize {
        let actor = self.actor();
        let cleared = self.transact(|txn| {
            let held: Vec<ObjectId> = txn
                .object_ids()
                .into_iter()
                .filter(|id| txn.get(*id).is_some_and(|o| o.selected_by.is_some()))
                .collect();
            for id in &held {
                txn.update(*id, |object| object.selected_by = None);
            }
            if !held.is_empty() {
                txn.set_metadata(
                    RESET_SLOT,
                    &MetadataMessage::TableReset {
                        actor,
                        at_ms: wall_clock_ms(),
                    },
                );
            }
            held.len()
        });
        tracing::info!(table_id = %self.table_id(), cleared, "Cleared all selections");
        cleared
    }

    fn release_stale_selections(&mut self) -> usize {
        let actor = self.actor();
        self.transact(|txn| {
            let mut released = 0;
            for id in txn.object_ids() {
                if txn.get(id).is_some_and(|o| o.selected_by == Some(actor)) {
                    txn.update(id, |object| object.selected_by = None);
                    released += 1;
                }
            }
            released
        })
    }

    fn collect_changes(
        &self,
        origin: Origin,
        touched: &[ObjectId],
        mut before: HashMap<ObjectId, Option<TableObject>>,
        metadata_slots: &BTreeSet<String>,
    ) -> ObjectChanges {
        let local = self.actor();
        let mut changes = ObjectChanges::new(origin);

        for id in touched {
            let previous = before.remove(id).flatten();
            let current = self.doc.object(*id);
            match (previous, current) {
                (None, Some(object)) => changes.added.push((*id, object)),
                (Some(_), None) => changes.removed.push(*id),
                (Some(old), Some(object)) if old != object => {
                    if origin == Origin::Remote
                        && old.selected_by == Some(local)
                        && object.selected_by != Some(local)
                    {
                        tracing::info!(
                            table_id = %self.table_id(),
                            object = %id,
                            new_owner = ?object.selected_by,
                            "Selection revoked by remote write"
                        );
                        changes.revoked_selections.push(*id);
                    }
                    changes.updated.push((*id, object));
                }
                _ => {}
            }
        }

        for slot in metadata_slots {
            if let Some(value) = self.doc.get(&DocKey::Metadata(slot.clone())) {
                if let Some(message) = validate_metadata(self.table_id(), slot, value) {
                    changes.metadata.push(message);
                }
            }
        }
        changes
    }

    fn notify(&self, changes: &ObjectChanges) {
        if !changes.is_empty() {
            self.listeners.notify(changes);
        }
    }
}

/// Durable namespace for `table_id`.
#[must_use]
pub fn storage_key(table_id: &str) -> String {
    format!("table-state-{table_id}")
}

fn validate_metadata(table_id: &str, slot: &str, value: &Value) -> Option<MetadataMessage> {
    match MetadataMessage::parse(value) {
        Ok(message) => Some(message),
        Err(err) => {
            tracing::warn!(table_id, slot, error = %err, "Ignoring invalid metadata");
            None
        }
    }
}
