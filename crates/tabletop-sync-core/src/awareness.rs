//! Ephemeral per-actor presence: cursors and drag ghosts.
//!
//! Presence never touches the object store. Each actor owns exactly one
//! entry, versioned by `(session, clock)`: the session is fixed when the
//! connection starts and the clock increments on every change. Replicas keep
//! the highest version they have seen per actor, so a reconnect under the
//! same identity supersedes the old connection.

use crate::hlc::wall_clock_ms;
use crate::ids::{ActorId, ObjectId};
use crate::listeners::{ListenerSet, Subscription};
use crate::object::Position;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Remote entries not refreshed within this window are dropped.
pub const AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Map of every known actor's presence, the local one included.
pub type AwarenessStates = HashMap<ActorId, AwarenessState>;

/// Handle returned by [`Awareness::subscribe`].
pub type AwarenessSubscription = Subscription<AwarenessStates>;

/// Pointer position on the table plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

/// Offset of a secondary dragged object from the primary one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragOffset {
    /// Dragged object
    pub object: ObjectId,
    /// Horizontal offset
    pub dx: f64,
    /// Vertical offset
    pub dy: f64,
}

/// An in-progress drag gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DragState {
    /// Identifies one continuous gesture
    pub gesture_id: Uuid,
    /// Object under the pointer
    pub primary: ObjectId,
    /// Where the primary object would land
    pub pos: Position,
    /// Other objects moving along with it
    pub secondary: Vec<DragOffset>,
    /// When the drag state was last updated
    pub timestamp: DateTime<Utc>,
}

/// One actor's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// Owner of this entry
    pub actor: ActorId,
    /// Pointer position, if over the table
    pub cursor: Option<CursorPos>,
    /// Drag in progress, if any
    pub drag: Option<DragState>,
}

impl AwarenessState {
    fn empty(actor: ActorId) -> Self {
        Self {
            actor,
            cursor: None,
            drag: None,
        }
    }
}

/// Replicated change to one actor's presence.
///
/// `state == None` announces that the actor disconnected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    /// Actor whose entry changed
    pub actor: ActorId,
    /// Connection the update comes from (wall time it started, in ms)
    pub session: u64,
    /// Per-connection version counter
    pub clock: u64,
    /// New state, or `None` on departure
    pub state: Option<AwarenessState>,
}

#[derive(Debug)]
struct Entry {
    state: AwarenessState,
    refreshed: Instant,
}

/// Presence of every connected actor as seen by this replica.
pub struct Awareness {
    local: ActorId,
    session: u64,
    clock: u64,
    entries: HashMap<ActorId, Entry>,
    versions: HashMap<ActorId, (u64, u64)>,
    listeners: ListenerSet<AwarenessStates>,
    outbox: Vec<AwarenessUpdate>,
}

impl Awareness {
    /// Presence for `local`, initially without cursor or drag.
    ///
    /// The session starts now.
    #[must_use]
    pub fn new(local: ActorId) -> Self {
        Self::with_session(local, wall_clock_ms())
    }

    /// Presence for `local` under an explicit session number.
    ///
    /// Sessions of one actor must increase across reconnects.
    #[must_use]
    pub fn with_session(local: ActorId, session: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            local,
            Entry {
                state: AwarenessState::empty(local),
                refreshed: Instant::now(),
            },
        );
        Self {
            local,
            session,
            clock: 0,
            entries,
            versions: HashMap::new(),
            listeners: ListenerSet::new("awareness"),
            outbox: Vec::new(),
        }
    }

    /// Actor owning the local entry.
    #[must_use]
    pub fn local_actor(&self) -> ActorId {
        self.local
    }

    /// Show the local pointer at `(x, y)`.
    pub fn set_cursor(&mut self, x: f64, y: f64) {
        self.update_local(|state| state.cursor = Some(CursorPos { x, y }));
    }

    /// Hide the local pointer.
    pub fn clear_cursor(&mut self) {
        self.update_local(|state| state.cursor = None);
    }

    /// Publish an in-progress drag of `primary` (and `secondary` objects).
    pub fn set_drag(&mut self, gesture_id: Uuid, primary: ObjectId, pos: Position, secondary: Vec<DragOffset>) {
        self.update_local(|state| {
            state.drag = Some(DragState {
                gesture_id,
                primary,
                pos,
                secondary,
                timestamp: Utc::now(),
            });
        });
    }

    /// End the local drag gesture.
    pub fn clear_drag(&mut self) {
        self.update_local(|state| state.drag = None);
    }

    /// The local actor's current presence.
    #[must_use]
    pub fn local_state(&self) -> AwarenessState {
        self.entries
            .get(&self.local)
            .map_or_else(|| AwarenessState::empty(self.local), |entry| entry.state.clone())
    }

    /// Every known actor's presence. Callers filter out their own entry.
    #[must_use]
    pub fn states(&self) -> AwarenessStates {
        self.entries
            .iter()
            .map(|(actor, entry)| (*actor, entry.state.clone()))
            .collect()
    }

    /// Register `callback` for any presence change; it receives the full map.
    pub fn subscribe<F>(&self, callback: F) -> AwarenessSubscription
    where
        F: Fn(&AwarenessStates) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Integrate an update from another connection.
    ///
    /// Returns `false` when it was ignored: our own echo, or a version not
    /// newer than the last one seen for that actor.
    pub fn apply_remote(&mut self, update: AwarenessUpdate) -> bool {
        if update.actor == self.local {
            return false;
        }
        let version = (update.session, update.clock);
        if self.versions.get(&update.actor).is_some_and(|seen| *seen >= version) {
            tracing::trace!(
                actor = %update.actor,
                session = update.session,
                clock = update.clock,
                "Ignoring outdated awareness update"
            );
            return false;
        }

        match update.state {
            Some(mut state) => {
                self.versions.insert(update.actor, version);
                state.actor = update.actor;
                self.entries.insert(
                    update.actor,
                    Entry {
                        state,
                        refreshed: Instant::now(),
                    },
                );
            }
            None => {
                self.versions.remove(&update.actor);
                if self.entries.remove(&update.actor).is_none() {
                    return true;
                }
                tracing::debug!(actor = %update.actor, "Actor left");
            }
        }
        self.notify();
        true
    }

    /// Forget a disconnected actor.
    pub fn remove(&mut self, actor: ActorId) -> bool {
        if actor == self.local {
            return false;
        }
        self.versions.remove(&actor);
        if self.entries.remove(&actor).is_none() {
            return false;
        }
        self.notify();
        true
    }

    /// Drop remote entries not refreshed within `timeout` of `now`.
    pub fn prune_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ActorId> {
        let local = self.local;
        let stale: Vec<ActorId> = self
            .entries
            .iter()
            .filter(|(actor, entry)| **actor != local && now.saturating_duration_since(entry.refreshed) > timeout)
            .map(|(actor, _)| *actor)
            .collect();

        if !stale.is_empty() {
            for actor in &stale {
                self.entries.remove(actor);
                self.versions.remove(actor);
            }
            tracing::debug!(pruned = stale.len(), "Pruned stale awareness entries");
            self.notify();
        }
        stale
    }

    /// Re-announce the local state so peers keep it alive.
    pub fn renew(&mut self) {
        self.update_local(|_| {});
    }

    /// Clear the local state and announce departure.
    pub fn disconnect(&mut self) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(&self.local) {
            entry.state = AwarenessState::empty(self.local);
        }
        self.outbox.push(AwarenessUpdate {
            actor: self.local,
            session: self.session,
            clock: self.clock,
            state: None,
        });
        self.notify();
    }

    /// Local updates produced since the last call, oldest first.
    pub fn take_outbound(&mut self) -> Vec<AwarenessUpdate> {
        std::mem::take(&mut self.outbox)
    }

    fn update_local<F>(&mut self, change: F)
    where
        F: FnOnce(&mut AwarenessState),
    {
        let local = self.local;
        let entry = self.entries.entry(local).or_insert_with(|| Entry {
            state: AwarenessState::empty(local),
            refreshed: Instant::now(),
        });
        change(&mut entry.state);
        entry.refreshed = Instant::now();
        self.clock += 1;
        self.outbox.push(AwarenessUpdate {
            actor: local,
            session: self.session,
            clock: self.clock,
            state: Some(entry.state.clone()),
        });
        self.notify();
    }

    fn notify(&self) {
        self.listeners.notify(&self.states());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn update(actor: ActorId, clock: u64, x: f64) -> AwarenessUpdate {
        AwarenessUpdate {
            actor,
            session: 1,
            clock,
            state: Some(AwarenessState {
                actor,
                cursor: Some(CursorPos { x, y: 0.0 }),
                drag: None,
            }),
        }
    }

    #[test]
    fn local_changes_are_queued_for_broadcast() {
        let me = ActorId::new();
        let mut awareness = Awareness::new(me);
        awareness.set_cursor(1.0, 2.0);
        awareness.set_drag(Uuid::new_v4(), ObjectId::new(), Position::at(3.0, 4.0), Vec::new());
        awareness.clear_cursor();

        let outbound = awareness.take_outbound();
        assert_eq!(outbound.len(), 3);
        assert!(outbound.windows(2).all(|pair| pair[0].clock < pair[1].clock));
        let last = outbound[2].state.as_ref().unwrap();
        assert!(last.cursor.is_none());
        assert!(last.drag.is_some());
        assert_eq!(awareness.local_state(), *last);
    }

    #[test]
    fn older_updates_lose() {
        let mut awareness = Awareness::new(ActorId::new());
        let peer = ActorId::new();

        assert!(awareness.apply_remote(update(peer, 2, 5.0)));
        assert!(!awareness.apply_remote(update(peer, 1, 9.0)));
        assert!(!awareness.apply_remote(update(peer, 2, 9.0)));
        assert_eq!(awareness.states()[&peer].cursor, Some(CursorPos { x: 5.0, y: 0.0 }));
    }

    #[test]
    fn own_echo_is_ignored() {
        let me = ActorId::new();
        let mut awareness = Awareness::new(me);
        assert!(!awareness.apply_remote(update(me, 100, 1.0)));
        assert!(awareness.local_state().cursor.is_none());
    }

    #[test]
    fn subscribers_see_full_map_including_self() {
        let me = ActorId::new();
        let peer = ActorId::new();
        let mut awareness = Awareness::new(me);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = awareness.subscribe(move |states| sink.lock().push(states.len()));

        awareness.apply_remote(update(peer, 1, 0.0));
        awareness.set_cursor(0.0, 0.0);
        assert_eq!(*seen.lock(), vec![2, 2]);
    }

    #[test]
    fn departure_and_pruning_remove_entries() {
        let me = ActorId::new();
        let gone = ActorId::new();
        let idle = ActorId::new();
        let mut awareness = Awareness::new(me);
        awareness.apply_remote(update(gone, 1, 0.0));
        awareness.apply_remote(update(idle, 1, 0.0));

        awareness.apply_remote(AwarenessUpdate {
            actor: gone,
            session: 1,
            clock: 2,
            state: None,
        });
        assert!(!awareness.states().contains_key(&gone));

        let later = Instant::now() + AWARENESS_TIMEOUT + Duration::from_secs(1);
        assert_eq!(awareness.prune_stale(later, AWARENESS_TIMEOUT), vec![idle]);
        assert_eq!(awareness.states().len(), 1);
        assert!(awareness.states().contains_key(&me));
    }

    #[test]
    fn reconnect_under_same_identity_is_visible() {
        let observer_actor = ActorId::new();
        let peer = ActorId::new();
        let mut observer = Awareness::new(observer_actor);

        let mut first = Awareness::with_session(peer, 100);
        for i in 0..5 {
            first.set_cursor(f64::from(i), 0.0);
        }
        for update in first.take_outbound() {
            assert!(observer.apply_remote(update));
        }

        // Crashed without a departure: the newer session still wins.
        let mut second = Awareness::with_session(peer, 200);
        second.set_cursor(42.0, 42.0);
        let applied: Vec<bool> = second
            .take_outbound()
            .into_iter()
            .map(|update| observer.apply_remote(update))
            .collect();
        assert_eq!(applied, vec![true]);
        assert_eq!(observer.states()[&peer].cursor, Some(CursorPos { x: 42.0, y: 42.0 }));

        // Late traffic from the old connection is ignored.
        first.set_cursor(7.0, 7.0);
        for update in first.take_outbound() {
            assert!(!observer.apply_remote(update));
        }
    }

    #[test]
    fn departure_forgets_the_version() {
        let mut observer = Awareness::new(ActorId::new());
        let peer = ActorId::new();

        let mut first = Awareness::with_session(peer, 100);
        for _ in 0..5 {
            first.set_cursor(1.0, 1.0);
        }
        first.disconnect();
        for update in first.take_outbound() {
            observer.apply_remote(update);
        }
        assert!(!observer.states().contains_key(&peer));

        // Same session number, clock restarted: accepted after a departure.
        let mut again = Awareness::with_session(peer, 100);
        again.set_cursor(3.0, 3.0);
        let update = again.take_outbound().remove(0);
        assert_eq!(update.clock, 1);
        assert!(observer.apply_remote(update));
        assert!(observer.states().contains_key(&peer));
    }

    #[test]
    fn pruning_and_removal_forget_versions() {
        let mut awareness = Awareness::new(ActorId::new());
        let idle = ActorId::new();
        let left = ActorId::new();
        awareness.apply_remote(update(idle, 9, 0.0));
        awareness.apply_remote(update(left, 9, 0.0));

        assert!(awareness.remove(left));
        let later = Instant::now() + AWARENESS_TIMEOUT + Duration::from_secs(1);
        assert_eq!(awareness.prune_stale(later, AWARENESS_TIMEOUT), vec![idle]);

        assert!(awareness.apply_remote(update(idle, 1, 0.0)));
        assert!(awareness.apply_remote(update(left, 1, 0.0)));
    }

    #[test]
    fn disconnect_announces_departure() {
        let mut awareness = Awareness::new(ActorId::new());
        awareness.set_cursor(1.0, 1.0);
        awareness.disconnect();
        let outbound = awareness.take_outbound();
        assert!(outbound.last().unwrap().state.is_none());
        assert!(awareness.local_state().cursor.is_none());
    }
}
