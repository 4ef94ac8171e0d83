//! Merging stacks together and drawing the top card off a stack.

use crate::ids::ObjectId;
use crate::object::{NewObject, ObjectBody, ObjectKind, Position};
use crate::store::ObjectStore;
use thiserror::Error;

/// Misuse of [`stack`] by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// No sources and no target
    #[error("nothing to stack: no sources and no target")]
    EmptyInput,
    /// The target was also listed as a source
    #[error("target {0} is listed among its own sources")]
    TargetInSources(ObjectId),
    /// The target does not exist
    #[error("target {0} not found")]
    TargetNotFound(ObjectId),
    /// The target is not a stack
    #[error("target {id} is a {kind}, not a stack")]
    TargetNotStack {
        /// Target id
        id: ObjectId,
        /// Its actual kind
        kind: ObjectKind,
    },
}

/// Put the cards of `sources` on top of `target`, in input order, and
/// delete the sources.
///
/// Without a target the first source becomes the target. Sources that are
/// missing, not stacks, or empty are skipped. The target keeps its position
/// and orientation. Returns the ids actually merged.
///
/// # Errors
///
/// Returns [`StackError`] when the target cannot be determined, is listed
/// as a source, does not exist or is not a stack. Nothing is written then.
pub fn stack(
    store: &mut ObjectStore,
    sources: &[ObjectId],
    target: Option<ObjectId>,
) -> Result<Vec<ObjectId>, StackError> {
    let (target, sources) = match target {
        Some(target) => (target, sources),
        None => match sources.split_first() {
            Some((first, rest)) => (*first, rest),
            None => return Err(StackError::EmptyInput),
        },
    };
    if sources.contains(&target) {
        return Err(StackError::TargetInSources(target));
    }
    let target_object = store.get(target).ok_or(StackError::TargetNotFound(target))?;
    if !matches!(target_object.body, ObjectBody::Stack(_)) {
        return Err(StackError::TargetNotStack {
            id: target,
            kind: target_object.kind(),
        });
    }

    let table_id = store.table_id().to_string();
    let merged = store.transact(|txn| {
        let mut merged = Vec::new();
        let mut incoming: Vec<String> = Vec::new();
        for &id in sources {
            if merged.contains(&id) {
                continue;
            }
            let Some(object) = txn.get(id) else {
                tracing::warn!(%table_id, source = %id, "Skipping missing source");
                continue;
            };
            let kind = object.kind();
            let cards = match object.body {
                ObjectBody::Stack(pile) if !pile.cards.is_empty() => pile.cards,
                ObjectBody::Stack(_) => {
                    tracing::warn!(%table_id, source = %id, "Skipping empty stack");
                    continue;
                }
                _ => {
                    tracing::warn!(%table_id, source = %id, %kind, "Skipping non-stack source");
                    continue;
                }
            };
            incoming.extend(cards);
            txn.delete(id);
            merged.push(id);
        }

        if !incoming.is_empty() {
            txn.update(target, |object| {
                if let ObjectBody::Stack(pile) = &mut object.body {
                    incoming.append(&mut pile.cards);
                    pile.cards = incoming;
                }
            });
        }
        merged
    });

    tracing::debug!(%table_id, target = %target, merged = merged.len(), "Merged stacks");
    Ok(merged)
}

/// Move the top card of `id` onto a new single-card stack at `(pos.x, pos.y)`.
///
/// The new stack copies the source's rotation and face orientation and sits
/// above everything on the table. A source left without cards is deleted.
/// Returns `None` when `id` is missing, not a stack, or empty.
pub fn unstack(store: &mut ObjectStore, id: ObjectId, pos: Position) -> Option<ObjectId> {
    let source = store.get(id)?;
    let ObjectBody::Stack(pile) = &source.body else {
        return None;
    };
    let (top, rest) = pile.cards.split_first()?;
    let top = top.clone();
    let rest = rest.to_vec();
    let face_up = pile.face_up;
    let rotation = source.pos.r;

    let created = store.transact(|txn| {
        let created = txn.create(
            NewObject::stack(Position::new(pos.x, pos.y, rotation))
                .with_cards([top])
                .face_up(face_up),
        );
        if rest.is_empty() {
            txn.delete(id);
        } else {
            txn.update(id, |object| {
                if let ObjectBody::Stack(pile) = &mut object.body {
                    pile.cards = rest;
                }
            });
        }
        created
    });
    Some(created)
}
