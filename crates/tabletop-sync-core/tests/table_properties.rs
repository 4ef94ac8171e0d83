//! End-to-end behavior of the table engine across actions and replicas.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tabletop_sync_core::{
    exhaust, flip, move_objects, select, stack, unstack, ActorId, DocSnapshot, DurableState,
    NewObject, ObjectChanges, ObjectId, ObjectKind, ObjectStore, Position, Readiness, SortKey,
};

fn new_store() -> ObjectStore {
    ObjectStore::new("table-1", ActorId::new())
}

fn cards(store: &ObjectStore, id: ObjectId) -> Vec<String> {
    store.get(id).unwrap().cards().unwrap().to_vec()
}

fn sync(from: &mut ObjectStore, to: &mut ObjectStore) {
    for delta in from.take_outbound() {
        to.apply_remote(&delta);
    }
}

#[test]
fn move_changes_only_position() {
    let mut store = new_store();
    let actor = store.actor();
    let id = store.create(
        NewObject::stack(Position::new(1.0, 1.0, 90.0))
            .with_cards(["c1", "c2"])
            .face_up(false),
    );
    select(&mut store, &[id], actor);
    let before = store.get(id).unwrap();

    move_objects(&mut store, &[(id, Position::new(40.0, -3.5, 90.0))]);

    let after = store.get(id).unwrap();
    assert_eq!(after.pos, Position::new(40.0, -3.5, 90.0));
    let mut expected = before;
    expected.pos = after.pos;
    assert_eq!(after, expected);
}

#[test]
fn selection_is_mutually_exclusive() {
    let mut store = new_store();
    let a = ActorId::new();
    let b = ActorId::new();
    let id = store.create(NewObject::stack(Position::default()));

    assert_eq!(select(&mut store, &[id], a).selected, vec![id]);
    let outcome = select(&mut store, &[id], b);
    assert!(outcome.selected.is_empty());
    assert_eq!(outcome.failed_ids(), vec![id]);
    assert_eq!(store.get(id).unwrap().selected_by, Some(a));
}

#[test]
fn exhaust_has_no_drift() {
    let mut store = new_store();
    let id = store.create(NewObject::stack(Position::new(5.0, 5.0, 0.0)));
    let original = store.get(id).unwrap().pos;

    for _ in 0..100 {
        exhaust(&mut store, &[id]);
        exhaust(&mut store, &[id]);
        assert_eq!(store.get(id).unwrap().pos, original);
    }
    for _ in 0..101 {
        exhaust(&mut store, &[id]);
    }
    assert_eq!(store.get(id).unwrap().pos, Position::new(5.0, 5.0, 90.0));
}

#[test]
fn flip_twice_restores_stack() {
    let mut store = new_store();
    let id = store.create(NewObject::stack(Position::default()).with_cards(["c1", "c2", "c3"]));

    flip(&mut store, &[id]);
    assert_eq!(cards(&store, id), ["c3", "c2", "c1"]);
    assert_eq!(store.get(id).unwrap().face_up(), Some(false));

    flip(&mut store, &[id]);
    assert_eq!(cards(&store, id), ["c1", "c2", "c3"]);
    assert_eq!(store.get(id).unwrap().face_up(), Some(true));
}

#[test]
fn flip_single_card_only_turns_over() {
    let mut store = new_store();
    let id = store.create(NewObject::stack(Position::default()).with_cards(["only"]));
    flip(&mut store, &[id]);
    assert_eq!(cards(&store, id), ["only"]);
    assert_eq!(store.get(id).unwrap().face_up(), Some(false));
}

#[test]
fn stack_merge_cardinality() {
    let mut store = new_store();
    let target = store.create(NewObject::stack(Position::default()).with_cards(["t"]));
    let sizes = [1, 2, 3, 5, 1];
    let sources: Vec<ObjectId> = sizes
        .iter()
        .enumerate()
        .map(|(n, size)| {
            let cards: Vec<String> = (0..*size).map(|i| format!("s{n}-{i}")).collect();
            store.create(NewObject::stack(Position::default()).with_cards(cards))
        })
        .collect();

    let merged = stack(&mut store, &sources, Some(target)).unwrap();
    assert_eq!(merged, sources);
    // 12 from the sources plus the target's own card
    assert_eq!(cards(&store, target).len(), 13);
    assert!(sources.iter().all(|id| store.get(*id).is_none()));
}

#[test]
fn stack_merge_without_target_cards() {
    let mut store = new_store();
    let sizes = [1, 2, 3, 5, 1];
    let ids: Vec<ObjectId> = sizes
        .iter()
        .map(|size| {
            let cards: Vec<String> = (0..*size).map(|i| format!("c{i}")).collect();
            store.create(NewObject::stack(Position::default()).with_cards(cards))
        })
        .collect();

    let target = store.create(NewObject::stack(Position::default()));
    stack(&mut store, &ids, Some(target)).unwrap();
    assert_eq!(cards(&store, target).len(), 12);
    assert_eq!(store.len(), 1);
}

#[test]
fn unstack_reduces_by_one() {
    let mut store = new_store();
    let source = store.create(
        NewObject::stack(Position::new(0.0, 0.0, 90.0))
            .with_cards(["c1", "c2", "c3"])
            .face_up(false),
    );

    let drawn = unstack(&mut store, source, Position::at(10.0, 10.0)).unwrap();
    assert_eq!(cards(&store, source), ["c2", "c3"]);
    let drawn = store.get(drawn).unwrap();
    assert_eq!(drawn.cards().unwrap(), ["c1"]);
    assert!((drawn.pos.r - 90.0).abs() < f64::EPSILON);
    assert_eq!(drawn.face_up(), Some(false));
}

#[test]
fn unstack_deletes_emptied_source() {
    let mut store = new_store();
    let source = store.create(NewObject::stack(Position::default()).with_cards(["last"]));
    let drawn = unstack(&mut store, source, Position::at(1.0, 1.0)).unwrap();
    assert!(store.get(source).is_none());
    assert_eq!(cards(&store, drawn), ["last"]);
}

#[test]
fn sort_keys_strictly_increase() {
    let mut store = new_store();
    let mut keys: Vec<SortKey> = Vec::new();
    for n in 0..150 {
        let kind = if n % 2 == 0 { ObjectKind::Stack } else { ObjectKind::Counter };
        let id = store.create(NewObject::new(kind, Position::default()));
        let key = store.get(id).unwrap().sort_key;
        assert!(keys.iter().all(|previous| &key > previous));
        keys.push(key);
    }
}

#[test]
fn stack_scenario() {
    let mut store = new_store();
    let a = store.create(NewObject::stack(Position::default()).with_cards(["a1"]));
    let b = store.create(NewObject::stack(Position::default()).with_cards(["b1", "b2"]));

    stack(&mut store, &[b], Some(a)).unwrap();
    assert_eq!(cards(&store, a), ["b1", "b2", "a1"]);
    assert!(store.get(b).is_none());
}

#[test]
fn concurrent_edits_converge() {
    let mut alice = ObjectStore::new("table-1", ActorId::new());
    let mut bob = ObjectStore::new("table-1", ActorId::new());
    let id = alice.create(NewObject::stack(Position::default()).with_cards(["x"]));
    sync(&mut alice, &mut bob);

    // concurrent move and select on the same object
    move_objects(&mut alice, &[(id, Position::at(3.0, 3.0))]);
    let bob_actor = bob.actor();
    select(&mut bob, &[id], bob_actor);
    sync(&mut alice, &mut bob);
    sync(&mut bob, &mut alice);

    for store in [&alice, &bob] {
        let object = store.get(id).unwrap();
        assert_eq!(object.pos, Position::at(3.0, 3.0));
        assert_eq!(object.selected_by, Some(bob_actor));
    }
    assert_eq!(alice.objects(), bob.objects());
}

#[test]
fn stack_merge_is_one_notification() {
    let mut store = new_store();
    let target = store.create(NewObject::stack(Position::default()).with_cards(["t"]));
    let a = store.create(NewObject::stack(Position::default()).with_cards(["a"]));
    let b = store.create(NewObject::stack(Position::default()).with_cards(["b"]));

    let seen: Arc<Mutex<Vec<ObjectChanges>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = store.subscribe(move |changes| sink.lock().push(changes.clone()));

    stack(&mut store, &[a, b], Some(target)).unwrap();
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].removed, vec![a, b]);
        assert_eq!(seen[0].updated.len(), 1);
        assert_eq!(seen[0].updated[0].0, target);
    }

    assert!(sub.unsubscribe());
    store.create(NewObject::stack(Position::default()));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn panicking_subscriber_is_isolated() {
    let mut store = new_store();
    let calls = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);
    let _faulty = store.subscribe(|_| panic!("renderer bug"));
    let _healthy = store.subscribe(move |_| *counter.lock() += 1);

    store.create(NewObject::stack(Position::default()));
    store.create(NewObject::stack(Position::default()));
    assert_eq!(*calls.lock(), 2);
}

#[test]
fn snapshot_restores_table() {
    let mut store = new_store();
    let a = store.create(NewObject::stack(Position::default()).with_cards(["a1", "a2"]));
    let b = store.create(NewObject::new(ObjectKind::Counter, Position::at(1.0, 1.0)).with_value(7));
    store.delete(b);

    let bytes = store.snapshot().to_cbor().unwrap();
    let snapshot = DocSnapshot::from_cbor(&bytes).unwrap();

    let mut restored = new_store();
    let durable = DurableState {
        snapshot: Some(snapshot),
        deltas: Vec::new(),
    };
    assert_eq!(restored.hydrate(durable), Readiness::Loaded);
    assert_eq!(restored.objects(), store.objects());
    assert!(restored.get(b).is_none());
    assert_eq!(cards(&restored, a), ["a1", "a2"]);
}

#[test]
fn ready_waits_for_hydration() {
    let mut store = new_store();
    let ready = store.ready();
    store.mark_degraded();
    assert_eq!(tokio_test::block_on(ready), Readiness::Degraded);

    // a late load still merges and upgrades readiness
    store.hydrate(DurableState::default());
    assert_eq!(store.readiness(), Some(Readiness::Loaded));
}

#[tokio::test]
async fn ready_resolves_across_tasks() {
    let mut store = new_store();
    let ready = store.ready();
    let waiter = tokio::spawn(ready);
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.hydrate(DurableState::default());
    assert_eq!(waiter.await.unwrap(), Readiness::Loaded);
}
