//! Mutation entry points used by the UI and the agent.
//!
//! Each function runs as one transaction on the store. Expected failures
//! (missing objects, locks, foreign ownership) are returned to the caller.

use crate::ids::{ActorId, ObjectId};
use crate::object::{ObjectBody, Position, TableObject};
use crate::store::ObjectStore;

/// Rotation that marks a stack as exhausted, in degrees.
pub const EXHAUSTED_ROTATION: f64 = 90.0;

/// Tolerance when deciding whether a stack is exhausted.
pub const EXHAUST_TOLERANCE: f64 = 0.1;

/// Round a rotation to one decimal place.
#[must_use]
pub fn round_rotation(r: f64) -> f64 {
    (r * 10.0).round() / 10.0
}

/// Whether `pos` is rotated into the exhausted orientation.
#[must_use]
pub fn is_exhausted(pos: &Position) -> bool {
    (pos.r - EXHAUSTED_ROTATION).abs() <= EXHAUST_TOLERANCE
}

/// Why a selection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectFailureReason {
    /// No such object
    NotFound,
    /// The object is locked
    Locked,
    /// Another actor owns the object
    HeldBy(ActorId),
}

/// One object that could not be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectFailure {
    /// Object that was requested
    pub id: ObjectId,
    /// Why it was refused
    pub reason: SelectFailureReason,
}

/// Result of [`select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOutcome {
    /// Objects newly owned by the caller
    pub selected: Vec<ObjectId>,
    /// Objects that were refused
    pub failed: Vec<SelectFailure>,
}

impl SelectOutcome {
    /// Ids of the refused objects.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<ObjectId> {
        self.failed.iter().map(|f| f.id).collect()
    }
}

/// Move objects to new positions. Only `pos` changes.
///
/// Returns the ids that were moved; missing ids and non-finite positions
/// are left out.
pub fn move_objects(store: &mut ObjectStore, moves: &[(ObjectId, Position)]) -> Vec<ObjectId> {
    store.transact(|txn| {
        moves
            .iter()
            .filter(|(_, pos)| pos.is_finite())
            .filter(|(id, pos)| txn.update(*id, |object| object.pos = *pos))
            .map(|(id, _)| *id)
            .collect()
    })
}

/// Take ownership of `ids` for `actor`.
///
/// Objects the actor already owns are neither selected nor failed.
pub fn select(store: &mut ObjectStore, ids: &[ObjectId], actor: ActorId) -> SelectOutcome {
    let outcome = store.transact(|txn| {
        let mut outcome = SelectOutcome::default();
        for &id in ids {
            let Some(object) = txn.get(id) else {
                outcome.failed.push(SelectFailure {
                    id,
                    reason: SelectFailureReason::NotFound,
                });
                continue;
            };
            let refused = if object.locked {
                Some(SelectFailureReason::Locked)
            } else {
                match object.selected_by {
                    Some(owner) if owner == actor => continue,
                    Some(owner) => Some(SelectFailureReason::HeldBy(owner)),
                    None => None,
                }
            };
            match refused {
                Some(reason) => outcome.failed.push(SelectFailure { id, reason }),
                None => {
                    txn.update(id, |object| object.selected_by = Some(actor));
                    outcome.selected.push(id);
                }
            }
        }
        outcome
    });

    if !outcome.failed.is_empty() {
        tracing::debug!(
            %actor,
            selected = outcome.selected.len(),
            failed = outcome.failed.len(),
            "Selection partially refused"
        );
    }
    outcome
}

/// Release `actor`'s ownership of `ids`.
///
/// Returns the ids actually released; objects owned by someone else or by
/// nobody are left alone.
pub fn unselect(store: &mut ObjectStore, ids: &[ObjectId], actor: ActorId) -> Vec<ObjectId> {
    store.transact(|txn| {
        let mut released = Vec::new();
        for &id in ids {
            if txn.get(id).is_some_and(|o| o.selected_by == Some(actor)) {
                txn.update(id, |object| object.selected_by = None);
                released.push(id);
            }
        }
        released
    })
}

/// Release every selection on the table, whoever holds it.
///
/// Administrative reset; returns the number of selections cleared.
pub fn clear_all_selections(store: &mut ObjectStore) -> usize {
    store.reset_selections()
}

/// Toggle stacks between ready (0°) and exhausted (90°).
///
/// Non-stacks and missing ids are skipped. Returns the ids toggled.
pub fn exhaust(store: &mut ObjectStore, ids: &[ObjectId]) -> Vec<ObjectId> {
    store.transact(|txn| {
        let mut toggled = Vec::new();
        for &id in ids {
            if !txn.get(id).is_some_and(|o| matches!(o.body, ObjectBody::Stack(_))) {
                continue;
            }
            txn.update(id, |object| {
                let target = if is_exhausted(&object.pos) {
                    0.0
                } else {
                    EXHAUSTED_ROTATION
                };
                object.pos.r = round_rotation(target);
            });
            toggled.push(id);
        }
        toggled
    })
}

/// Turn stacks and tokens over.
///
/// A stack also reverses its cards so the bottom card ends up on top.
/// Other kinds and missing ids are skipped. Returns the ids flipped.
pub fn flip(store: &mut ObjectStore, ids: &[ObjectId]) -> Vec<ObjectId> {
    store.transact(|txn| {
        let mut flipped = Vec::new();
        for &id in ids {
            if txn.get(id).is_some_and(|o| o.face_up().is_some()) {
                txn.update(id, flip_object);
                flipped.push(id);
            }
        }
        flipped
    })
}

fn flip_object(object: &mut TableObject) {
    match &mut object.body {
        ObjectBody::Stack(pile) => {
            pile.cards.reverse();
            pile.face_up = !pile.face_up;
        }
        ObjectBody::Token(pile) => pile.face_up = !pile.face_up,
        ObjectBody::Zone | ObjectBody::Mat | ObjectBody::Counter { .. } => {}
    }
}

/// Lock or unlock objects. Returns the ids whose lock state changed.
pub fn set_locked(store: &mut ObjectStore, ids: &[ObjectId], locked: bool) -> Vec<ObjectId> {
    store.transact(|txn| {
        let mut changed = Vec::new();
        for &id in ids {
            if txn.get(id).is_some_and(|o| o.locked != locked) {
                txn.update(id, |object| object.locked = locked);
                changed.push(id);
            }
        }
        changed
    })
}

/// Raise objects above everything else, keeping their relative order.
///
/// Returns the ids that received new sort keys.
pub fn bring_to_front(store: &mut ObjectStore, ids: &[ObjectId]) -> Vec<ObjectId> {
    store.transact(|txn| {
        let mut present: Vec<(ObjectId, TableObject)> = Vec::new();
        for &id in ids {
            if present.iter().any(|(seen, _)| *seen == id) {
                continue;
            }
            if let Some(object) = txn.get(id) {
                present.push((id, object));
            }
        }
        present.sort_by(|(a_id, a), (b_id, b)| a.sort_key.cmp(&b.sort_key).then(a_id.cmp(b_id)));

        present
            .into_iter()
            .map(|(id, _)| {
                let key = txn.next_sort_key();
                txn.update(id, |object| object.sort_key = key);
                id
            })
            .collect()
    })
}
