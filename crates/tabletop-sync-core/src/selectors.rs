//! Read-only queries over the current table state.

use crate::actions::is_exhausted;
use crate::ids::{ActorId, ObjectId};
use crate::object::{ObjectBody, TableObject};
use crate::store::ObjectStore;

/// Objects owned by `actor`, in paint order.
#[must_use]
pub fn selected_ids(store: &ObjectStore, actor: ActorId) -> Vec<ObjectId> {
    store
        .objects()
        .into_iter()
        .filter(|(_, object)| object.selected_by == Some(actor))
        .map(|(id, _)| id)
        .collect()
}

/// Whether every stack `actor` has selected is exhausted.
///
/// False when the actor has no stack selected.
#[must_use]
pub fn all_selected_exhausted(store: &ObjectStore, actor: ActorId) -> bool {
    selected_stacks_all(store, actor, |object| is_exhausted(&object.pos))
}

/// Whether every stack `actor` has selected is ready (not exhausted).
///
/// False when the actor has no stack selected.
#[must_use]
pub fn all_selected_ready(store: &ObjectStore, actor: ActorId) -> bool {
    selected_stacks_all(store, actor, |object| !is_exhausted(&object.pos))
}

/// Objects whose container is `container`, in paint order.
#[must_use]
pub fn objects_in_container(store: &ObjectStore, container: ObjectId) -> Vec<ObjectId> {
    store
        .objects()
        .into_iter()
        .filter(|(_, object)| object.container_id == Some(container))
        .map(|(id, _)| id)
        .collect()
}

fn selected_stacks_all<P>(store: &ObjectStore, actor: ActorId, predicate: P) -> bool
where
    P: Fn(&TableObject) -> bool,
{
    let mut any = false;
    for (_, object) in store.objects() {
        if object.selected_by != Some(actor) || !matches!(object.body, ObjectBody::Stack(_)) {
            continue;
        }
        if !predicate(&object) {
            return false;
        }
        any = true;
    }
    any
}
