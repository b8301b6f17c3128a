//! The client sync coordinator.
//!
//! Every context (tab, window, worker) of a device runs one coordinator
//! over the same [`Device`]. The coordinators elect a leader; only the
//! leader opens a transport, pushes pending deltas and pulls remote ones.
//! Everyone applies local writes immediately and hears about changes
//! through the [`TabBus`].
//!
//! The leader keeps the connection alive with an uncapped exponential
//! backoff: after a connection drops it retries at once, then waits
//! `initial_backoff`, multiplied by `backoff_factor` after every further
//! failure. The delay resets once a connection opens.
//!
//! A pending delta goes out once per connection. It is sent again only on
//! a new connection if the server has not acknowledged it by then.

use crate::backoff::Backoff;
use crate::bus::{TabBus, TabEnvelope, TabMessage};
use crate::config::ClientConfig;
use crate::error::{Error, Result, TransportError};
use crate::leader::{LeaderElection, LeaseStore, MemoryLeaseStore};
use crate::store::{ClientStore, MemoryStore};
use crate::transport::{Link, Transport};
use converge_engine::{
    decode_frame, encode_frame, resolve_path, ClientMessage, CollectionName, Cursor, Delta,
    DeltaEnvelope, Hlc, NodeId, PathSegment, ServerMessage, SharedClock, SortKey, Timestamp,
    Value,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};

/// Connection status as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncStatus {
    Disconnected,
    Connected,
}

/// State shared by every context of one device.
#[derive(Clone)]
pub struct Device {
    pub store: Arc<dyn ClientStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub bus: TabBus,
    pub clock: SharedClock,
}

impl Device {
    /// Open a device, resuming the clock from the store when it has one.
    pub fn new(
        node: impl Into<NodeId>,
        store: Arc<dyn ClientStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Result<Self> {
        let clock = match store.load_clock()? {
            Some(last) => Hlc::restore(last),
            None => Hlc::new(node, wall_clock()),
        };
        Ok(Self {
            store,
            leases,
            bus: TabBus::new(),
            clock: SharedClock::new(clock),
        })
    }

    pub fn in_memory(node: impl Into<NodeId>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            leases: Arc::new(MemoryLeaseStore::new()),
            bus: TabBus::new(),
            clock: SharedClock::new(Hlc::new(node, wall_clock())),
        }
    }
}

/// Longest single wait between connection attempts.
const MAX_PAUSE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Milliseconds since the Unix epoch.
fn wall_clock() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

struct Inner {
    context: String,
    config: ClientConfig,
    device: Device,
    transport: Arc<dyn Transport>,
    election: LeaderElection,
    status: Mutex<SyncStatus>,
    status_tx: broadcast::Sender<SyncStatus>,
}

impl Inner {
    fn set_status(&self, status: SyncStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != status {
            *current = status;
            let _ = self.status_tx.send(status);
            tracing::info!(context = %self.context, ?status, "Sync status changed");
        }
    }

    fn status(&self) -> SyncStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge deltas into the stored document; returns the document before and after.
    fn merge_into_store(&self, collection: &str, deltas: &[DeltaEnvelope]) -> Result<(Value, Value)> {
        let store = &self.device.store;
        let before = store.document(collection)?;
        let mut doc = before.clone();
        for envelope in deltas {
            if let Err(e) = doc.apply(&envelope.delta) {
                tracing::warn!(collection, stamp = %envelope.delta.stamp, "Skipping delta: {}", e);
            }
        }
        let after = store.merge_document(collection, doc)?;
        Ok((before, after))
    }

    /// Apply one server message. Returns whether a soft resync is due.
    fn handle_server_message(&self, message: ServerMessage) -> Result<bool> {
        let store = &self.device.store;
        match message {
            ServerMessage::Ack {
                collection,
                delta_stamp,
            } => {
                let dropped = store.ack(&collection, &delta_stamp)?;
                tracing::debug!(collection = %collection, stamp = %delta_stamp, dropped, "Deltas acknowledged");
                Ok(false)
            }
            ServerMessage::Sync {
                collection,
                server_cursor,
                deltas,
            } => {
                let clock = &self.device.clock;
                let wall = wall_clock();
                for envelope in &deltas {
                    if let Err(e) = clock.receive(&envelope.delta.stamp, wall) {
                        tracing::warn!(node = %envelope.node, "Remote stamp not merged into clock: {}", e);
                    }
                }
                store.save_clock(&clock.last())?;

                let (before, after) = self.merge_into_store(&collection, &deltas)?;
                let changed = !Value::compare(&before, &after);
                let advanced = store.cursor(&collection)? != Some(server_cursor);
                store.set_cursor(&collection, server_cursor)?;

                tracing::debug!(
                    collection = %collection,
                    cursor = server_cursor,
                    received = deltas.len(),
                    changed,
                    "Applied server deltas"
                );
                if !deltas.is_empty() {
                    self.device
                        .bus
                        .publish(&self.context, TabMessage::Changed { collection, deltas });
                }
                Ok(changed || advanced)
            }
        }
    }

    /// Sync messages to send, recording what goes out in `sent`.
    fn outbound(&self, sent: &mut Sent, full: bool) -> Result<Vec<ClientMessage>> {
        let store = &self.device.store;
        let mut messages = Vec::new();
        for collection in store.collections()? {
            let in_flight = sent.in_flight.entry(collection.clone()).or_default();
            let unsent: Vec<DeltaEnvelope> = store
                .pending(&collection)?
                .into_iter()
                .filter(|envelope| !in_flight.contains(&envelope.delta.stamp))
                .collect();
            let cursor = store.cursor(&collection)?;
            let unreported = sent.cursors.get(&collection) != Some(&cursor);
            if full || unreported || !unsent.is_empty() {
                in_flight.extend(unsent.iter().map(|envelope| envelope.delta.stamp.clone()));
                sent.cursors.insert(collection.clone(), cursor);
                messages.push(ClientMessage::sync(collection, cursor, unsent));
            }
        }
        Ok(messages)
    }
}

/// What went out over the current link.
#[derive(Debug, Default)]
struct Sent {
    /// Cursor last reported per collection.
    cursors: HashMap<CollectionName, Option<Cursor>>,
    /// Pending deltas sent and not yet acknowledged.
    in_flight: HashMap<CollectionName, BTreeSet<Timestamp>>,
}

impl Sent {
    fn acknowledged(&mut self, collection: &str, stamp: &Timestamp) {
        if let Some(in_flight) = self.in_flight.get_mut(collection) {
            in_flight.retain(|sent| sent > stamp);
        }
    }
}

/// Handle to a running coordinator. Dropping it stops the background task.
pub struct SyncCoordinator {
    inner: Arc<Inner>,
    sync_requests: mpsc::UnboundedSender<()>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SyncCoordinator {
    /// Start coordinating for one context. Must be called inside a Tokio runtime.
    pub fn start(
        context: impl Into<String>,
        config: ClientConfig,
        device: Device,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let context = context.into();
        let election = LeaderElection::new(context.clone(), config.lease_ttl, device.leases.clone());
        let (status_tx, _) = broadcast::channel(16);
        let (sync_requests, requests) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);

        let mut heartbeat = interval(config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let inner = Arc::new(Inner {
            context,
            config,
            device,
            transport,
            election,
            status: Mutex::new(SyncStatus::Disconnected),
            status_tx,
        });

        let worker = Worker {
            bus: inner.device.bus.subscribe(),
            inner: inner.clone(),
            cancel: Cancel(cancel_rx),
            requests,
            heartbeat,
        };
        let task = tokio::spawn(worker.run());

        Self {
            inner,
            sync_requests,
            cancel,
            task: Some(task),
        }
    }

    pub fn context(&self) -> &str {
        &self.inner.context
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status()
    }

    /// Status changes from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.election.is_leader(Instant::now())
    }

    /// Current local state of a collection.
    pub fn document(&self, collection: &str) -> Result<Value> {
        self.inner.device.store.document(collection)
    }

    /// Start syncing `collection` before anything is written to it.
    pub fn open(&self, collection: &str) -> Result<Value> {
        let doc = self
            .inner
            .device
            .store
            .merge_document(collection, Value::create_empty())?;
        self.request_sync();
        Ok(doc)
    }

    /// Issue a fresh timestamp from the device clock.
    pub fn stamp(&self) -> Result<Timestamp> {
        Ok(self.inner.device.clock.now(wall_clock())?)
    }

    /// Apply local deltas, queue them for the server and schedule a sync.
    pub fn apply_local(&self, collection: &str, deltas: Vec<Delta>) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let device = &self.inner.device;
        let mut doc = device.store.document(collection)?;
        for delta in &deltas {
            doc.apply(delta)?;
        }
        device.store.merge_document(collection, doc)?;

        let node = device.clock.node();
        let envelopes: Vec<DeltaEnvelope> = deltas
            .into_iter()
            .map(|delta| DeltaEnvelope::new(node.clone(), delta))
            .collect();
        device.store.add_pending(collection, envelopes.clone())?;
        device.store.save_clock(&device.clock.last())?;

        device.bus.publish(
            &self.inner.context,
            TabMessage::Changed {
                collection: collection.to_string(),
                deltas: envelopes,
            },
        );
        device.bus.publish(
            &self.inner.context,
            TabMessage::LocalChange {
                collection: collection.to_string(),
            },
        );
        self.request_sync();
        Ok(())
    }

    /// Set `key` in the map at `path`. Objects and arrays become containers.
    pub fn set(
        &self,
        collection: &str,
        path: &[&str],
        key: &str,
        value: serde_json::Value,
    ) -> Result<Delta> {
        let path = self.resolve(collection, path)?;
        let stamp = self.stamp()?;
        let delta = if value.is_object() || value.is_array() {
            Delta::set_value(stamp, path, key, value)
        } else {
            Delta::set(stamp, path, key, value)
        };
        self.apply_local(collection, vec![delta.clone()])?;
        Ok(delta)
    }

    /// Delete `key` from the map at `path`.
    pub fn remove(&self, collection: &str, path: &[&str], key: &str) -> Result<Delta> {
        let path = self.resolve(collection, path)?;
        let delta = Delta::remove_key(self.stamp()?, path, key);
        self.apply_local(collection, vec![delta.clone()])?;
        Ok(delta)
    }

    /// Insert into the sequence at `path` between two items.
    pub fn insert(
        &self,
        collection: &str,
        path: &[&str],
        left: Option<&SortKey>,
        right: Option<&SortKey>,
        value: serde_json::Value,
    ) -> Result<Delta> {
        let path = self.resolve(collection, path)?;
        let delta = Delta::insert(self.stamp()?, path, left, right, value)?;
        self.apply_local(collection, vec![delta.clone()])?;
        Ok(delta)
    }

    /// Remove an item from the sequence at `path`.
    pub fn remove_item(&self, collection: &str, path: &[&str], key: SortKey) -> Result<Delta> {
        let path = self.resolve(collection, path)?;
        let delta = Delta::remove_item(self.stamp()?, path, key);
        self.apply_local(collection, vec![delta.clone()])?;
        Ok(delta)
    }

    /// Ask for a debounced sync.
    pub fn request_sync(&self) {
        let _ = self.sync_requests.send(());
    }

    /// Stop the background task and wait for it; releases leadership.
    pub async fn shutdown(mut self) {
        self.cancel.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(context = %self.inner.context, "Coordinator task failed: {}", e);
            }
        }
    }

    fn resolve(&self, collection: &str, keys: &[&str]) -> Result<Vec<PathSegment>> {
        let doc = self.document(collection)?;
        resolve_path(&doc, keys)
            .ok_or_else(|| Error::PathNotFound(keys.iter().map(|k| k.to_string()).collect()))
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

struct Cancel(watch::Receiver<bool>);

impl Cancel {
    fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled or once the handle is gone.
    async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|cancelled| *cancelled).await;
    }
}

/// Why a leader phase ended.
enum Exit {
    Cancelled,
    Deposed,
    Closed,
}

struct Worker {
    inner: Arc<Inner>,
    cancel: Cancel,
    requests: mpsc::UnboundedReceiver<()>,
    bus: broadcast::Receiver<TabEnvelope>,
    heartbeat: Interval,
}

impl Worker {
    async fn run(mut self) {
        while !self.cancel.is_cancelled() {
            if self.inner.election.try_acquire(Instant::now()) {
                self.lead().await;
                self.inner.set_status(SyncStatus::Disconnected);
            } else {
                self.follow().await;
            }
        }
        self.inner.election.release();
        tracing::debug!(context = %self.inner.context, "Coordinator stopped");
    }

    /// Wait for the next leadership check.
    async fn follow(&mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.heartbeat.tick() => return,
                received = self.bus.recv() => {
                    self.on_bus(received);
                }
                Some(()) = self.requests.recv() => {}
            }
        }
    }

    async fn lead(&mut self) {
        let mut backoff = Backoff::new(
            self.inner.config.initial_backoff,
            self.inner.config.backoff_factor,
        );
        loop {
            match self.open().await {
                Err(_) => return,
                Ok(Ok(link)) => {
                    backoff.reset();
                    self.inner.set_status(SyncStatus::Connected);
                    let exit = self.connected(link).await;
                    self.inner.set_status(SyncStatus::Disconnected);
                    match exit {
                        Exit::Closed => continue,
                        Exit::Cancelled | Exit::Deposed => return,
                    }
                }
                Ok(Err(e)) => {
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        context = %self.inner.context,
                        delay_ms = delay.as_millis() as u64,
                        "Connection attempt failed: {}",
                        e
                    );
                    if self.pause(delay).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Renew the lease; false once another context has taken over.
    fn renew(&self) -> bool {
        let kept = self.inner.election.try_acquire(Instant::now());
        if !kept {
            tracing::warn!(context = %self.inner.context, "Lost sync leadership");
        }
        kept
    }

    /// One connection attempt, keeping the lease alive while it is pending.
    async fn open(
        &mut self,
    ) -> std::result::Result<std::result::Result<Link, TransportError>, Exit> {
        let url = self.inner.config.sync_url();
        let mut attempt = self.inner.transport.open(&url);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                result = &mut attempt => return Ok(result),
                _ = self.heartbeat.tick() => {
                    if !self.renew() {
                        return Err(Exit::Deposed);
                    }
                }
                received = self.bus.recv() => {
                    self.on_bus(received);
                }
                Some(()) = self.requests.recv() => {}
            }
        }
    }

    /// Sleep between attempts.
    async fn pause(&mut self, delay: Duration) -> std::result::Result<(), Exit> {
        let deadline = Instant::now() + delay.min(MAX_PAUSE);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Exit::Cancelled),
                _ = sleep_until(deadline) => return Ok(()),
                _ = self.heartbeat.tick() => {
                    if !self.renew() {
                        return Err(Exit::Deposed);
                    }
                }
                received = self.bus.recv() => {
                    self.on_bus(received);
                }
                Some(()) = self.requests.recv() => {}
            }
        }
    }

    async fn connected(&mut self, link: Link) -> Exit {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        let mut sent = Sent::default();
        let mut debounce: Option<Instant> = None;

        tracing::info!(context = %self.inner.context, "Connected, running full sync");
        self.sync(&outgoing, &mut sent, true);

        loop {
            let deadline = debounce;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Exit::Cancelled,
                frame = incoming.recv() => match frame {
                    Some(text) => {
                        if self.on_frame(&text, &mut sent) {
                            self.sync(&outgoing, &mut sent, false);
                        }
                    }
                    None => {
                        tracing::info!(context = %self.inner.context, "Connection closed");
                        return Exit::Closed;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debounce = None;
                    self.sync(&outgoing, &mut sent, false);
                }
                _ = self.heartbeat.tick() => {
                    if !self.renew() {
                        return Exit::Deposed;
                    }
                }
                received = self.bus.recv() => {
                    if self.on_bus(received) && debounce.is_none() {
                        debounce = Some(Instant::now() + self.inner.config.debounce);
                    }
                }
                Some(()) = self.requests.recv() => {
                    if debounce.is_none() {
                        debounce = Some(Instant::now() + self.inner.config.debounce);
                    }
                }
            }
        }
    }

    fn sync(
        &self,
        outgoing: &mpsc::UnboundedSender<String>,
        sent: &mut Sent,
        full: bool,
    ) {
        let messages = match self.inner.outbound(sent, full) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(context = %self.inner.context, "Failed to collect sync messages: {}", e);
                return;
            }
        };
        if messages.is_empty() {
            tracing::trace!(context = %self.inner.context, "Nothing to sync");
            return;
        }
        match encode_frame(&messages) {
            Ok(text) => {
                if outgoing.send(text).is_err() {
                    tracing::debug!(context = %self.inner.context, "Connection gone before sync was sent");
                }
            }
            Err(e) => tracing::error!("Failed to serialize sync messages: {}", e),
        }
    }

    /// Handle one inbound frame. Returns whether a soft resync is due.
    fn on_frame(&self, text: &str, sent: &mut Sent) -> bool {
        let messages: Vec<ServerMessage> = match decode_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(context = %self.inner.context, "Dropping malformed frame: {}", e);
                return false;
            }
        };

        let mut resync = false;
        for message in messages {
            if let ServerMessage::Ack {
                collection,
                delta_stamp,
            } = &message
            {
                sent.acknowledged(collection, delta_stamp);
            }
            match self.inner.handle_server_message(message) {
                Ok(due) => resync |= due,
                Err(e) => tracing::warn!(context = %self.inner.context, "Failed to handle server message: {}", e),
            }
        }
        resync
    }

    /// Handle a message from another context. Returns whether a sync is due.
    fn on_bus(&self, received: std::result::Result<TabEnvelope, RecvError>) -> bool {
        match received {
            Ok(envelope) if envelope.from == self.inner.context => false,
            Ok(TabEnvelope {
                message: TabMessage::LocalChange { .. },
                ..
            }) => true,
            Ok(TabEnvelope {
                message: TabMessage::Changed { collection, deltas },
                ..
            }) => {
                if let Err(e) = self.inner.merge_into_store(&collection, &deltas) {
                    tracing::warn!(collection = %collection, "Failed to merge tab change: {}", e);
                }
                false
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(context = %self.inner.context, skipped, "Tab bus lagged");
                true
            }
            Err(RecvError::Closed) => false,
        }
    }
}
