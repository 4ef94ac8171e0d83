use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tabletop_sync_agent::config::PersistenceConfig;
use tabletop_sync_agent::{Agent, AgentConfig, StoreType};
use tabletop_sync_core::{move_objects, select, ActorId, NewObject, Position, Readiness};
use tabletop_sync_proto::{CborMessage, DocDelta, MessageType, TopicScheme};
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

fn config(table_id: &str, store_type: StoreType, db_path: Option<&std::path::Path>) -> AgentConfig {
    let defaults = AgentConfig::default();
    AgentConfig {
        table_id: table_id.to_string(),
        persistence: PersistenceConfig {
            store_type,
            db_path: db_path.map_or(defaults.persistence.db_path.clone(), std::path::Path::to_path_buf),
            ..defaults.persistence.clone()
        },
        ..defaults
    }
}

async fn memory_agent(table_id: &str) -> Agent {
    let mut agent = Agent::new(config(table_id, StoreType::Memory, None)).unwrap();
    assert_eq!(agent.hydrate().await, Readiness::Loaded);
    agent
}

/// Deliver everything `from` has queued to `to`. Returns the frame count.
fn pipe(from: &mut Agent, to: &mut Agent) -> usize {
    let frames = from.drain_outbound();
    for frame in &frames {
        to.handle_frame(frame.kind, &frame.payload);
    }
    frames.len()
}

#[tokio::test]
async fn deltas_replicate_between_agents() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t1").await;

    let id = a
        .objects_mut()
        .create(NewObject::stack(Position::at(10.0, 20.0)).with_cards(["c1", "c2"]));
    assert_eq!(pipe(&mut a, &mut b), 1);

    assert_eq!(b.objects().get(id), a.objects().get(id));
}

#[tokio::test]
async fn concurrent_moves_converge() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t1").await;

    let id = a.objects_mut().create(NewObject::stack(Position::default()));
    pipe(&mut a, &mut b);

    move_objects(a.objects_mut(), &[(id, Position::at(1.0, 1.0))]);
    move_objects(b.objects_mut(), &[(id, Position::at(2.0, 2.0))]);
    pipe(&mut a, &mut b);
    pipe(&mut b, &mut a);

    assert_eq!(a.objects().get(id), b.objects().get(id));
}

#[tokio::test]
async fn remote_selection_is_visible_and_refused_locally() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t1").await;

    let id = a.objects_mut().create(NewObject::stack(Position::default()));
    pipe(&mut a, &mut b);

    let a_actor = a.actor();
    assert_eq!(select(a.objects_mut(), &[id], a_actor).selected, vec![id]);
    pipe(&mut a, &mut b);

    let b_actor = b.actor();
    let outcome = select(b.objects_mut(), &[id], b_actor);
    assert!(outcome.selected.is_empty());
    assert_eq!(outcome.failed_ids(), vec![id]);
}

#[tokio::test]
async fn anti_entropy_catches_up_a_late_joiner() {
    let mut a = memory_agent("t1").await;
    let first = a.objects_mut().create(NewObject::stack(Position::default()));
    let second = a.objects_mut().create(NewObject::stack(Position::at(5.0, 5.0)));
    // Nobody was listening.
    a.drain_outbound();

    let mut b = memory_agent("t1").await;
    b.request_anti_entropy();
    assert_eq!(pipe(&mut b, &mut a), 1);
    assert_eq!(pipe(&mut a, &mut b), 1);

    assert_eq!(b.objects().get(first), a.objects().get(first));
    assert_eq!(b.objects().get(second), a.objects().get(second));
}

#[tokio::test]
async fn superseded_anti_entropy_response_is_dropped() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t1").await;

    b.request_anti_entropy();
    let stale_request = b.drain_outbound();
    b.request_anti_entropy();
    let current_request = b.drain_outbound();

    let id = a.objects_mut().create(NewObject::stack(Position::default()));
    a.drain_outbound();

    for frame in &stale_request {
        a.handle_frame(frame.kind, &frame.payload);
    }
    pipe(&mut a, &mut b);
    assert!(b.objects().get(id).is_none());

    for frame in &current_request {
        a.handle_frame(frame.kind, &frame.payload);
    }
    pipe(&mut a, &mut b);
    assert!(b.objects().get(id).is_some());
}

#[tokio::test]
async fn other_tables_are_ignored() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t2").await;

    a.objects_mut().create(NewObject::stack(Position::default()));
    a.awareness_mut().set_cursor(3.0, 4.0);
    pipe(&mut a, &mut b);

    assert!(b.objects().is_empty());
    assert!(!b.awareness().states().contains_key(&a.actor()));
}

#[tokio::test]
async fn presence_replicates_and_departs() {
    let mut a = memory_agent("t1").await;
    let mut b = memory_agent("t1").await;

    a.awareness_mut().set_cursor(3.0, 4.0);
    pipe(&mut a, &mut b);
    let states = b.awareness().states();
    let cursor = states[&a.actor()].cursor.unwrap();
    assert!((cursor.x - 3.0).abs() < f64::EPSILON);

    a.awareness_mut().disconnect();
    pipe(&mut a, &mut b);
    assert!(!b.awareness().states().contains_key(&a.actor()));
}

#[tokio::test]
async fn presence_returns_after_reconnect() {
    let actor = ActorId::new();
    let mut cfg = config("t1", StoreType::Memory, None);
    cfg.actor_id = Some(actor);
    let mut b = memory_agent("t1").await;

    let mut first = Agent::new(cfg.clone()).unwrap();
    for step in 0..5 {
        first.awareness_mut().set_cursor(f64::from(step), 0.0);
    }
    first.awareness_mut().disconnect();
    pipe(&mut first, &mut b);
    assert!(!b.awareness().states().contains_key(&actor));

    let mut second = Agent::new(cfg).unwrap();
    second.awareness_mut().set_cursor(42.0, 42.0);
    pipe(&mut second, &mut b);
    let cursor = b.awareness().states()[&actor].cursor.unwrap();
    assert!((cursor.x - 42.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("table.db");
    let actor = ActorId::new();
    let mut cfg = config("t1", StoreType::Sqlite, Some(&db_path));
    cfg.actor_id = Some(actor);

    let (kept, snapshotted) = {
        let mut agent = Agent::new(cfg.clone()).unwrap();
        assert_eq!(agent.hydrate().await, Readiness::Loaded);

        let snapshotted = agent.objects_mut().create(NewObject::stack(Position::default()));
        agent.drain_outbound();
        assert!(agent.persist_snapshot().unwrap());

        let kept = agent
            .objects_mut()
            .create(NewObject::stack(Position::at(7.0, 7.0)).with_cards(["c9"]));
        select(agent.objects_mut(), &[kept], actor);
        agent.drain_outbound();
        (kept, snapshotted)
    };

    let mut agent = Agent::new(cfg).unwrap();
    assert_eq!(agent.hydrate().await, Readiness::Loaded);

    assert!(agent.objects().get(snapshotted).is_some());
    let restored = agent.objects().get(kept).unwrap();
    assert_eq!(restored.cards(), Some(&["c9".to_string()][..]));
    // Selections held by this identity in a previous session are released.
    assert_eq!(restored.selected_by, None);
}

async fn drive(mut eventloop: EventLoop) {
    while eventloop.poll().await.is_ok() {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_delta_roundtrip() {
    if std::env::var("TABLETOP_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set TABLETOP_INTEGRATION=1 to run");
        return;
    }

    let host = std::env::var("TABLETOP_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let scheme = TopicScheme::new("integration");
    let table_id = format!("table-{}", Uuid::new_v4());
    let topic = scheme.topic(&table_id, MessageType::Delta);

    let mut sub_opts = MqttOptions::new(format!("sub-{}", Uuid::new_v4()), host.clone(), 1883);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client.subscribe(&topic, QoS::AtLeastOnce).await.unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut pub_opts = MqttOptions::new(format!("pub-{}", Uuid::new_v4()), host, 1883);
    pub_opts.set_keep_alive(Duration::from_secs(5));
    let (pub_client, pub_eventloop) = AsyncClient::new(pub_opts, 10);
    tokio::spawn(drive(pub_eventloop));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut agent = memory_agent(&table_id).await;
    let id = agent.objects_mut().create(NewObject::stack(Position::default()));
    let frame = agent
        .drain_outbound()
        .into_iter()
        .find(|f| f.kind == MessageType::Delta)
        .unwrap();

    pub_client
        .publish(&topic, QoS::AtLeastOnce, false, frame.payload)
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscriber dropped");

    let decoded = DocDelta::from_cbor(&received).unwrap();
    assert_eq!(decoded.table_id, table_id);

    let mut replica = memory_agent(&table_id).await;
    replica.handle_frame(MessageType::Delta, &received);
    assert!(replica.objects().get(id).is_some());
}
