//! Agent runtime orchestration.
//!
//! The [`Agent`] owns one table replica. Inbound messages are handed to
//! [`Agent::handle_frame`]; everything the replica wants to send is collected
//! by [`Agent::drain_outbound`]. [`Agent::run`] wires both ends to MQTT.

use crate::config::{AgentConfig, StoreType};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::replication::ReplicationManager;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rumqttc::{ConnectionError, Event, EventLoop, Packet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabletop_sync_core::{
    ActorId, Awareness, DurableState, MetadataMessage, ObjectChanges, ObjectStore, Origin, Readiness,
    ReloadSequencer, Subscription, TableDelta, LOAD_TIMEOUT,
};
use tabletop_sync_proto::{
    AgentHello, AntiEntropyRequest, AntiEntropyResponse, AwarenessMessage, CborMessage, DocDelta, MessageError,
    MessageType, TopicScheme,
};
use tokio::task::{JoinError, JoinHandle};

type LoadResult = std::result::Result<DurableState, PersistenceError>;

/// One encoded message ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the payload is
    pub kind: MessageType,
    /// CBOR payload
    pub payload: Vec<u8>,
}

/// Log entry held back while durable state is still loading.
enum Unsaved {
    Delta(TableDelta),
    State(TableDelta),
}

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    storage_key: String,
    db: Arc<Mutex<SqliteStore>>,
    objects: ObjectStore,
    awareness: Awareness,
    anti_entropy: ReloadSequencer,
    pending_load: Option<JoinHandle<LoadResult>>,
    unsaved: Vec<Unsaved>,
    outbox: Vec<Frame>,
    /// Frames the broker client refused, sent ahead of new ones.
    unsent: Vec<Frame>,
    remote_log: Subscription<ObjectChanges>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be opened.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let db = match config.persistence.store_type {
            StoreType::Sqlite => {
                SqliteStore::open(&config.persistence.db_path).context("Failed to open SQLite database")?
            }
            StoreType::Memory => SqliteStore::in_memory().context("Failed to create in-memory database")?,
        };

        let actor = config.actor_id.unwrap_or_default();
        let objects = ObjectStore::new(config.table_id.clone(), actor);
        let table_id = config.table_id.clone();
        let remote_log = objects.subscribe(move |changes| log_remote_changes(&table_id, changes));

        tracing::info!(%actor, table_id = %config.table_id, "Agent initialized");

        Ok(Self {
            storage_key: objects.storage_key(),
            db: Arc::new(Mutex::new(db)),
            awareness: Awareness::new(actor),
            objects,
            anti_entropy: ReloadSequencer::new(),
            pending_load: None,
            unsaved: Vec::new(),
            outbox: Vec::new(),
            unsent: Vec::new(),
            remote_log,
            config,
        })
    }

    /// Identity of this replica.
    #[must_use]
    pub fn actor(&self) -> ActorId {
        self.objects.actor()
    }

    /// The replicated table.
    #[must_use]
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// The replicated table, for local mutations.
    pub fn objects_mut(&mut self) -> &mut ObjectStore {
        &mut self.objects
    }

    /// Presence of everyone at the table.
    #[must_use]
    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    /// Presence of everyone at the table, for local cursor and drag updates.
    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }

    /// Load durable state, waiting at most [`LOAD_TIMEOUT`].
    ///
    /// On timeout the table continues degraded; a load that finishes later
    /// is merged by [`Agent::run`].
    pub async fn hydrate(&mut self) -> Readiness {
        let db = Arc::clone(&self.db);
        let key = self.storage_key.clone();
        let mut load = tokio::task::spawn_blocking(move || db.lock().load(&key));

        match tokio::time::timeout(LOAD_TIMEOUT, &mut load).await {
            Ok(result) => self.finish_load(result),
            Err(_) => {
                tracing::warn!(
                    table_id = %self.config.table_id,
                    timeout_secs = LOAD_TIMEOUT.as_secs(),
                    "Timed out loading durable state"
                );
                self.objects.mark_degraded();
                self.pending_load = Some(load);
                Readiness::Degraded
            }
        }
    }

    fn finish_load(&mut self, result: std::result::Result<LoadResult, JoinError>) -> Readiness {
        self.pending_load = None;

        let readiness = match result {
            Ok(Ok(state)) => self.objects.hydrate(state),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, table_id = %self.config.table_id, "Failed to load durable state");
                self.objects.mark_degraded();
                Readiness::Degraded
            }
            Err(err) => {
                tracing::error!(error = %err, table_id = %self.config.table_id, "Load task failed");
                self.objects.mark_degraded();
                Readiness::Degraded
            }
        };

        for entry in std::mem::take(&mut self.unsaved) {
            match entry {
                Unsaved::Delta(delta) => self.persist_delta(&delta),
                Unsaved::State(state) => self.persist_state(&state),
            }
        }
        readiness
    }

    /// Handle one inbound message. Malformed or foreign messages are logged
    /// and dropped.
    pub fn handle_frame(&mut self, kind: MessageType, payload: &[u8]) {
        let result = match kind {
            MessageType::Hello => AgentHello::from_cbor(payload).map(|hello| self.on_hello(&hello)),
            MessageType::Delta => DocDelta::from_cbor(payload).and_then(|delta| self.on_delta(&delta)),
            MessageType::Awareness => AwarenessMessage::from_cbor(payload).map(|msg| self.on_awareness(msg)),
            MessageType::AntiEntropyRequest => {
                AntiEntropyRequest::from_cbor(payload).and_then(|req| self.on_anti_entropy_request(&req))
            }
            MessageType::AntiEntropyResponse => {
                AntiEntropyResponse::from_cbor(payload).and_then(|resp| self.on_anti_entropy_response(&resp))
            }
        };

        if let Err(err) = result {
            tracing::warn!(error = %err, ?kind, table_id = %self.config.table_id, "Dropping malformed message");
        }
    }

    fn on_hello(&self, hello: &AgentHello) {
        if hello.actor == self.actor() || hello.table_id != self.config.table_id {
            return;
        }
        tracing::info!(peer = %hello.actor, version = %hello.version, "Peer joined the table");
    }

    fn on_delta(&mut self, message: &DocDelta) -> std::result::Result<(), MessageError> {
        if message.table_id != self.config.table_id {
            tracing::debug!(table_id = %message.table_id, "Ignoring delta for another table");
            return Ok(());
        }
        let timestamp = message.timestamp()?;
        if timestamp.actor == self.actor() {
            return Ok(());
        }
        let delta = message.delta()?;

        tracing::debug!(peer = %timestamp.actor, entries = delta.inserts.len() + delta.removes.len(), "Applying remote delta");
        self.objects.apply_remote(&delta);
        self.persist_delta(&delta);

        if self.pending_load.is_none() {
            let db = self.db.lock();
            if let Err(err) = db.update_peer_progress(&timestamp.actor.to_string(), &self.storage_key, &message.delta_id) {
                tracing::warn!(error = %err, peer = %timestamp.actor, "Failed to update peer progress");
            }
        }
        Ok(())
    }

    fn on_awareness(&mut self, message: AwarenessMessage) {
        if message.table_id == self.config.table_id {
            self.awareness.apply_remote(message.update);
        }
    }

    fn on_anti_entropy_request(&mut self, request: &AntiEntropyRequest) -> std::result::Result<(), MessageError> {
        if request.requester == self.actor() || request.table_id != self.config.table_id {
            return Ok(());
        }
        let response = AntiEntropyResponse::answer(request, &self.objects.snapshot())?;
        tracing::debug!(requester = %request.requester, seq = request.seq, "Answering anti-entropy request");
        self.outbox.push(Frame {
            kind: MessageType::AntiEntropyResponse,
            payload: response.to_cbor()?,
        });
        Ok(())
    }

    fn on_anti_entropy_response(&mut self, response: &AntiEntropyResponse) -> std::result::Result<(), MessageError> {
        if response.requester != self.actor() {
            return Ok(());
        }
        if !self.anti_entropy.is_current_seq(response.seq) {
            tracing::debug!(seq = response.seq, "Discarding stale anti-entropy response");
            return Ok(());
        }

        let snapshot = response.snapshot()?;
        tracing::debug!(seq = response.seq, "Merging anti-entropy response");
        self.objects.merge_snapshot(&snapshot);
        match self.persist_snapshot() {
            Ok(true) => {}
            Ok(false) => self.persist_state(&snapshot.state),
            Err(err) => tracing::warn!(error = %err, "Failed to persist merged state"),
        }
        Ok(())
    }

    /// Ask peers for their full state. Answers to earlier requests are
    /// discarded from now on.
    pub fn request_anti_entropy(&mut self) {
        let ticket = self.anti_entropy.begin(self.config.table_id.clone());
        let request = AntiEntropyRequest::new(self.config.table_id.clone(), ticket.seq, self.actor());
        self.queue(MessageType::AntiEntropyRequest, &request);
    }

    /// Announce this replica to the table.
    pub fn announce(&mut self) {
        let hello = AgentHello::new(self.actor(), self.config.table_id.clone(), self.objects.clock());
        self.queue(MessageType::Hello, &hello);
    }

    fn queue<M: CborMessage>(&mut self, kind: MessageType, message: &M) {
        match message.to_cbor() {
            Ok(payload) => self.outbox.push(Frame { kind, payload }),
            Err(err) => tracing::warn!(error = %err, ?kind, "Failed to encode message"),
        }
    }

    /// Collect every frame waiting to be sent. Local deltas are written to
    /// the delta log on the way out.
    pub fn drain_outbound(&mut self) -> Vec<Frame> {
        let mut frames = std::mem::take(&mut self.outbox);

        for delta in self.objects.take_outbound() {
            self.persist_delta(&delta);
            match DocDelta::new(self.config.table_id.clone(), &delta).and_then(|m| m.to_cbor()) {
                Ok(payload) => frames.push(Frame {
                    kind: MessageType::Delta,
                    payload,
                }),
                Err(err) => tracing::warn!(error = %err, "Failed to encode delta"),
            }
        }

        for update in self.awareness.take_outbound() {
            let message = AwarenessMessage {
                table_id: self.config.table_id.clone(),
                update,
            };
            match message.to_cbor() {
                Ok(payload) => frames.push(Frame {
                    kind: MessageType::Awareness,
                    payload,
                }),
                Err(err) => tracing::warn!(error = %err, "Failed to encode awareness update"),
            }
        }

        frames
    }

    fn persist_delta(&mut self, delta: &TableDelta) {
        if self.pending_load.is_some() {
            self.unsaved.push(Unsaved::Delta(delta.clone()));
            return;
        }
        if let Err(err) = self.db.lock().save_delta(&self.storage_key, delta) {
            tracing::warn!(error = %err, table_id = %self.config.table_id, "Failed to persist delta");
        }
    }

    fn persist_state(&mut self, state: &TableDelta) {
        if self.pending_load.is_some() {
            self.unsaved.push(Unsaved::State(state.clone()));
            return;
        }
        if let Err(err) = self.db.lock().save_state(&self.storage_key, state) {
            tracing::warn!(error = %err, table_id = %self.config.table_id, "Failed to persist merged state");
        }
    }

    /// Write a full snapshot and compact the delta log behind it.
    ///
    /// Skipped unless durable state was loaded, so a partial table never
    /// replaces a complete one. Returns whether a snapshot was written.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot cannot be stored.
    pub fn persist_snapshot(&mut self) -> Result<bool> {
        if self.objects.readiness() != Some(Readiness::Loaded) {
            tracing::debug!(table_id = %self.config.table_id, "Skipping snapshot until durable state is loaded");
            return Ok(false);
        }

        let snapshot = self.objects.snapshot();
        let db = self.db.lock();
        db.save_snapshot(&self.storage_key, &snapshot)
            .context("Failed to save snapshot")?;
        let compacted = db
            .compact_deltas_before(&self.storage_key, snapshot.clock.physical_ms)
            .context("Failed to compact delta log")?;

        tracing::info!(table_id = %self.config.table_id, objects = self.objects.len(), compacted, "Snapshot written");
        Ok(true)
    }

    /// Drop presence of peers that went quiet and keep our own alive.
    pub fn maintain_awareness(&mut self) {
        let pruned = self.awareness.prune_stale(Instant::now(), self.config.awareness_timeout);
        for actor in pruned {
            tracing::debug!(%actor, "Peer presence expired");
        }
        self.awareness.renew();
    }

    /// Run the agent's main loop until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if replication cannot be set up.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(table_id = %self.config.table_id, "Starting agent runtime");

        self.hydrate().await;

        let (replication, mut eventloop) = match self.config.replication.mqtt_broker.clone() {
            Some(broker) => {
                let (manager, eventloop) = ReplicationManager::new(
                    &broker,
                    &format!("tabletop-sync-{}", self.actor()),
                    TopicScheme::new(&self.config.replication.tenant),
                    self.config.table_id.clone(),
                )
                .context("Failed to create replication manager")?;
                manager.subscribe().await?;
                self.announce();
                self.request_anti_entropy();
                (Some(manager), Some(eventloop))
            }
            None => {
                tracing::info!("No MQTT broker configured, running offline");
                (None, None)
            }
        };

        let mut snapshot_timer = tokio::time::interval(self.config.persistence.snapshot_interval);
        let mut awareness_timer = tokio::time::interval(self.config.awareness_timeout / 3);
        snapshot_timer.tick().await;
        awareness_timer.tick().await;

        tracing::info!("Agent running, press Ctrl+C to stop");

        loop {
            tokio::select! {
                event = next_event(eventloop.as_mut()) => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            tracing::trace!(topic = %publish.topic, payload_len = publish.payload.len(), "Received replication message");
                            if let Some(kind) = replication.as_ref().and_then(|r| r.classify(&publish.topic)) {
                                self.handle_frame(kind, &publish.payload);
                            }
                        }
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("Connected to broker");
                            self.request_anti_entropy();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "MQTT error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }

                result = wait_for_load(&mut self.pending_load) => {
                    tracing::info!("Late durable load finished");
                    self.finish_load(result);
                }

                _ = snapshot_timer.tick() => {
                    if let Err(err) = self.persist_snapshot() {
                        tracing::warn!(error = %err, "Periodic snapshot failed");
                    }
                }

                _ = awareness_timer.tick() => self.maintain_awareness(),

                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }

            self.flush(replication.as_ref());
        }

        self.awareness.disconnect();
        self.flush(replication.as_ref());
        if let Err(err) = self.persist_snapshot() {
            tracing::warn!(error = %err, "Final snapshot failed");
        }

        if let (Some(replication), Some(eventloop)) = (replication, eventloop.as_mut()) {
            if let Err(err) = replication.disconnect().await {
                tracing::warn!(error = %err, "Failed to disconnect cleanly");
            }
            // Let queued publishes and the disconnect reach the broker.
            let _ = tokio::time::timeout(Duration::from_secs(1), async {
                while eventloop.poll().await.is_ok() {}
            })
            .await;
        }

        let _ = self.remote_log.unsubscribe();
        tracing::info!("Agent stopped");
        Ok(())
    }

    /// Publish everything queued. Refused frames other than presence are
    /// kept, in order, for the next flush; presence is superseded by renewal.
    fn flush(&mut self, replication: Option<&ReplicationManager>) {
        let mut frames = std::mem::take(&mut self.unsent);
        frames.extend(self.drain_outbound());
        let Some(replication) = replication else {
            return;
        };

        for frame in frames {
            let retryable = frame.kind != MessageType::Awareness;
            // Once one frame is held, later ones queue behind it.
            let queued_behind = retryable && !self.unsent.is_empty();
            if !queued_behind {
                match replication.publish(&frame) {
                    Ok(()) => continue,
                    Err(err) => tracing::warn!(error = %err, kind = ?frame.kind, "Failed to publish frame"),
                }
            }
            if retryable {
                self.unsent.push(frame);
            }
        }

        if !self.unsent.is_empty() {
            tracing::debug!(held = self.unsent.len(), "Frames held for the next flush");
        }
    }
}

fn log_remote_changes(table_id: &str, changes: &ObjectChanges) {
    if changes.origin != Origin::Remote {
        return;
    }
    for message in &changes.metadata {
        match message {
            MetadataMessage::ContentLoaded { content_id, actor, .. } => {
                tracing::info!(table_id, %actor, content_id, "Peer loaded content");
            }
            MetadataMessage::TableReset { actor, .. } => {
                tracing::info!(table_id, %actor, "Peer cleared all selections");
            }
        }
    }
    if !changes.revoked_selections.is_empty() {
        tracing::info!(table_id, revoked = changes.revoked_selections.len(), "Selections taken over by a peer");
    }
}

async fn next_event(eventloop: Option<&mut EventLoop>) -> std::result::Result<Event, ConnectionError> {
    match eventloop {
        Some(eventloop) => eventloop.poll().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_load(pending: &mut Option<JoinHandle<LoadResult>>) -> std::result::Result<LoadResult, JoinError> {
    match pending {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
