//! Branch sync client
//!
//! [`SyncClient`] keeps branch watches alive across reconnects, tracks local
//! updates until the server acknowledges them and resends them with
//! exponential backoff. All state sits behind one mutex; the reaction to
//! transport events is synchronous ([`SyncClient::handle_event`],
//! [`SyncClient::process_resends`]) and [`SyncClient::spawn`] drives it from
//! the connection and a resend timer.

use crate::branches::{BranchRegistry, BranchWatch, DeviceWatch};
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent};
use crate::error::{ClientError, ClientResult};
use crate::events::{ClientUpdate, DeviceEvent, SyncEvent, UpdateError};
use crate::ledger::{Backoff, PendingLedger, PendingUpdate};
#[cfg(feature = "metrics")]
use crate::metrics::ClientMetrics;
use crate::time::{Clock, SystemClock, TimeSample};
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tagsync_protocol::{
    AddUpdates, Addressed, BranchAction, BranchKey, ClientMessage, ConnectedToBranch,
    ConnectionCountRequest, ConnectionCountResponse, DisconnectedFromBranch, ServerMessage,
    TimeRequest, TimeResponse, UpdatesReceived, WatchBranch, WatchBranchResult, MAX_SIZE_REACHED,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

const SYNC_EVENT_CAPACITY: usize = 256;

/// Client state. Only touched with the client mutex held.
struct ClientState {
    connection: Arc<dyn Connection>,
    config: ClientConfig,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    registry: BranchRegistry,
    ledger: PendingLedger,
    sync_events: broadcast::Sender<SyncEvent>,
    last_time_request_id: u64,
    time_requests: HashMap<u64, oneshot::Sender<TimeSample>>,
    /// Time requests made while offline, sent on the next connect
    queued_time_requests: Vec<u64>,
    count_requests: HashMap<ConnectionCountRequest, Vec<oneshot::Sender<u64>>>,
    queued_count_requests: Vec<ConnectionCountRequest>,
    forced_offline: bool,
    /// Transport state as last handled, which may lag the transport itself
    connected: bool,
    #[cfg(feature = "metrics")]
    metrics: Option<ClientMetrics>,
}

impl ClientState {
    fn send(&self, message: ClientMessage) {
        trace!(message_type = message.message_type(), "Sending");
        self.connection.send(message);
    }

    fn watch_message(&self, key: &BranchKey) -> ClientMessage {
        let mut watch = WatchBranch::new(key);
        if self.config.temporary_branches {
            watch.temporary = Some(true);
        }
        ClientMessage::WatchBranch(watch)
    }

    fn send_update(&self, key: &BranchKey, update: &PendingUpdate) {
        self.send(ClientMessage::AddUpdates(
            AddUpdates::new(key, update.updates.clone()).with_update_id(update.update_id),
        ));
    }

    #[cfg(feature = "metrics")]
    fn observe(&self, f: impl FnOnce(&ClientMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    #[cfg(feature = "metrics")]
    fn update_gauges(&self) {
        self.observe(|m| {
            m.pending_updates.set(self.ledger.len() as i64);
            m.watched_branches.set(self.registry.branch_count() as i64);
        });
    }

    fn watch_branch(&mut self, key: &BranchKey, sender: mpsc::UnboundedSender<ClientUpdate>) -> u64 {
        let id = self
            .registry
            .add_watch(BranchWatch::new(key.clone(), sender));
        if self.connected {
            // new subscribers need the initial batch, so always ask again
            debug!(branch = %key, "Watching branch");
            self.send(self.watch_message(key));
            self.registry.mark_watch_sent(key);
        }
        #[cfg(feature = "metrics")]
        self.update_gauges();
        id
    }

    fn unwatch_branch(&mut self, id: u64) {
        let Some((key, last)) = self.registry.remove_watch(id) else {
            return;
        };
        if last && self.connected {
            debug!(branch = %key, "Unwatching branch");
            self.send(ClientMessage::UnwatchBranch(key));
        }
        #[cfg(feature = "metrics")]
        self.update_gauges();
    }

    fn watch_devices(&mut self, key: &BranchKey, sender: mpsc::UnboundedSender<DeviceEvent>) -> u64 {
        let id = self
            .registry
            .add_device_watch(DeviceWatch::new(key.clone(), sender));
        if self.connected {
            self.send(ClientMessage::WatchBranchDevices(key.clone()));
        }
        id
    }

    fn unwatch_devices(&mut self, id: u64) {
        let Some((key, last)) = self.registry.remove_device_watch(id) else {
            return;
        };
        if last && self.connected {
            self.send(ClientMessage::UnwatchBranchDevices(key));
        }
    }

    fn add_updates(&mut self, key: &BranchKey, updates: Vec<String>) -> Option<u64> {
        if updates.is_empty() {
            return None;
        }

        let now = self.clock.now_ms();
        let update_id = self.ledger.next_update_id();
        let mut update = PendingUpdate::new(update_id, updates, now);

        if self.registry.is_watched(key) && !self.connected {
            debug!(branch = %key, update_id, "Deferring update until the watch is acknowledged");
        } else {
            update.mark_attempt(now);
            self.send_update(key, &update);
            #[cfg(feature = "metrics")]
            self.observe(|m| m.updates_sent.inc());
        }

        if self.ledger.insert(key, update) {
            let _ = self.sync_events.send(SyncEvent::syncing(key.clone()));
        }
        #[cfg(feature = "metrics")]
        self.update_gauges();
        Some(update_id)
    }

    fn send_time_request(&self, id: u64) {
        self.send(ClientMessage::TimeRequest(TimeRequest {
            id,
            client_request_time: self.clock.now_ms(),
        }));
    }

    fn on_connected(&mut self) {
        self.connected = true;
        info!(branches = self.registry.branch_count(), "Connected");

        for (key, stale) in self.registry.on_connect() {
            if stale {
                self.send(ClientMessage::UnwatchBranch(key.clone()));
            }
            debug!(branch = %key, "Watching branch");
            self.send(self.watch_message(&key));
        }

        for key in self.registry.device_branches() {
            self.send(ClientMessage::WatchBranchDevices(key.clone()));
        }

        for id in std::mem::take(&mut self.queued_time_requests) {
            if self.time_requests.contains_key(&id) {
                self.send_time_request(id);
            }
        }
        for request in std::mem::take(&mut self.queued_count_requests) {
            self.send(ClientMessage::ConnectionCount(request));
        }
    }

    fn on_disconnected(&mut self) {
        self.connected = false;
        let dropped = self.registry.on_disconnect();
        info!(devices = dropped, "Disconnected");
    }

    fn on_add_updates(&mut self, message: AddUpdates) {
        let key = message.branch_key();
        for watch in self.registry.watches_for(&key) {
            if let Some(update) = watch.receive(&message) {
                watch.emit(update);
            }
        }

        if message.is_initial() && self.registry.mark_connected(&key) {
            let now = self.clock.now_ms();
            let mut flushed = Vec::new();
            for update in self.ledger.branch_mut(&key) {
                update.mark_attempt(now);
                flushed.push(update.clone());
            }
            debug!(branch = %key, pending = flushed.len(), "Watch acknowledged");
            for update in &flushed {
                self.send_update(&key, update);
            }
            #[cfg(feature = "metrics")]
            self.observe(|m| m.updates_resent.inc_by(flushed.len() as u64));
        }
    }

    fn on_updates_received(&mut self, ack: UpdatesReceived) {
        let key = ack.branch_key();

        match self.ledger.remove(&key, ack.update_id) {
            Some((_, now_empty)) => {
                trace!(branch = %key, update_id = ack.update_id, "Update acknowledged");
                #[cfg(feature = "metrics")]
                self.observe(|m| m.updates_acknowledged.inc());
                if now_empty {
                    let _ = self.sync_events.send(SyncEvent::synced(key.clone()));
                }
            }
            None => {
                debug!(branch = %key, update_id = ack.update_id, "Ignoring ack for unknown update");
            }
        }

        if let Some(error_code) = ack.error_code {
            // the update is not retried
            let error = if error_code == MAX_SIZE_REACHED {
                UpdateError::MaxSizeReached {
                    update_id: ack.update_id,
                    max_branch_size_in_bytes: ack.max_branch_size_in_bytes,
                    needed_branch_size_in_bytes: ack.needed_branch_size_in_bytes,
                }
            } else {
                UpdateError::Rejected {
                    update_id: ack.update_id,
                    error_code,
                }
            };
            warn!(branch = %key, error = %error, "Update rejected");
            #[cfg(feature = "metrics")]
            self.observe(|m| m.updates_rejected.inc());
            for watch in self.registry.watches_for(&key) {
                watch.emit(ClientUpdate::Error(error.clone()));
            }
        }

        #[cfg(feature = "metrics")]
        self.update_gauges();
    }

    fn on_watch_result(&mut self, result: WatchBranchResult) {
        let key = result.branch_key();
        if !result.success {
            warn!(
                branch = %key,
                error_code = ?result.error_code,
                "Watch failed"
            );
        }
        for watch in self.registry.watches_for(&key) {
            watch.emit(ClientUpdate::WatchResult {
                success: result.success,
                error_code: result.error_code.clone(),
                error_message: result.error_message.clone(),
            });
        }
    }

    fn on_receive_action(&mut self, action: BranchAction) {
        let key = action.branch_key();
        for watch in self.registry.watches_for(&key) {
            watch.emit(ClientUpdate::Event {
                action: action.action.clone(),
            });
        }
    }

    fn on_device_connected(&mut self, event: ConnectedToBranch) {
        if event.broadcast {
            return;
        }
        let key = event.branch.branch_key();
        for watch in self.registry.device_watches_for(&key) {
            watch.connected(&event.connection);
        }
    }

    fn on_device_disconnected(&mut self, event: DisconnectedFromBranch) {
        if event.broadcast {
            return;
        }
        let key = event.branch_key();
        for watch in self.registry.device_watches_for(&key) {
            watch.disconnected(&event.connection);
        }
    }

    fn on_connection_count(&mut self, response: ConnectionCountResponse) {
        let request = ConnectionCountRequest {
            record_name: response.record_name,
            inst: response.inst,
            branch: response.branch,
        };
        let Some(waiters) = self.count_requests.remove(&request) else {
            debug!(?request, "Ignoring unrequested connection count");
            return;
        };
        for waiter in waiters {
            let _ = waiter.send(response.count);
        }
    }

    fn on_time_response(&mut self, response: TimeResponse) {
        let Some(waiter) = self.time_requests.remove(&response.id) else {
            debug!(id = response.id, "Ignoring unmatched time response");
            return;
        };
        let _ = waiter.send(TimeSample {
            client_request_time: response.client_request_time,
            server_receive_time: response.server_receive_time,
            server_transmit_time: response.server_transmit_time,
            current_time: self.clock.now_ms(),
        });
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) if state.connected => self.on_connected(),
            ConnectionEvent::StateChanged(_) => self.on_disconnected(),
            ConnectionEvent::Message(message) => match message {
                ServerMessage::AddUpdates(m) => self.on_add_updates(m),
                ServerMessage::UpdatesReceived(m) => self.on_updates_received(m),
                ServerMessage::WatchBranchResult(m) => self.on_watch_result(m),
                ServerMessage::ReceiveAction(m) => self.on_receive_action(m),
                ServerMessage::ConnectedToBranch(m) => self.on_device_connected(m),
                ServerMessage::DisconnectedFromBranch(m) => self.on_device_disconnected(m),
                ServerMessage::ConnectionCount(m) => self.on_connection_count(m),
                ServerMessage::TimeResponse(m) => self.on_time_response(m),
            },
        }
    }

    fn process_resends(&mut self) -> usize {
        if !self.connected {
            return 0;
        }

        let now = self.clock.now_ms();
        let backoff = self.backoff;
        let mut due = Vec::new();
        for (key, update) in self.ledger.iter_mut() {
            // held back until the watch is acknowledged
            if self.registry.is_watched(key) && !self.registry.is_connected(key) {
                continue;
            }
            if backoff.is_due(update, now) {
                update.mark_attempt(now);
                debug!(
                    branch = %key,
                    update_id = update.update_id,
                    attempt = update.attempt_count,
                    "Resending update"
                );
                due.push((key.clone(), update.clone()));
            }
        }

        for (key, update) in &due {
            self.send_update(key, update);
        }
        #[cfg(feature = "metrics")]
        self.observe(|m| m.updates_resent.inc_by(due.len() as u64));
        due.len()
    }
}

/// Client for the branch sync protocol.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncClient {
    state: Arc<Mutex<ClientState>>,
    connection: Arc<dyn Connection>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncClient {
    pub fn new(connection: Arc<dyn Connection>, config: ClientConfig) -> ClientResult<Self> {
        Self::with_clock(connection, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        connection: Arc<dyn Connection>,
        config: ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let (sync_events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let state = ClientState {
            connection: connection.clone(),
            backoff: Backoff::new(
                config.resend_updates_after_ms,
                config.max_resend_backoff_exponent,
            ),
            config,
            clock,
            registry: BranchRegistry::new(),
            ledger: PendingLedger::new(),
            sync_events,
            last_time_request_id: 0,
            time_requests: HashMap::new(),
            queued_time_requests: Vec::new(),
            count_requests: HashMap::new(),
            queued_count_requests: Vec::new(),
            forced_offline: false,
            connected: connection.is_connected(),
            #[cfg(feature = "metrics")]
            metrics: None,
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            connection,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Record metrics into the given collector
    #[cfg(feature = "metrics")]
    pub fn attach_metrics(&self, metrics: ClientMetrics) {
        let mut state = self.state.lock();
        state.metrics = Some(metrics);
        state.update_gauges();
    }

    /// Watch a branch. The branch stays watched until the returned stream is
    /// dropped.
    pub fn watch_branch_updates(&self, key: &BranchKey) -> BranchUpdates {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.state.lock().watch_branch(key, sender);
        BranchUpdates {
            id,
            key: key.clone(),
            receiver,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Watch the devices connected to a branch
    pub fn watch_branch_devices(&self, key: &BranchKey) -> BranchDevices {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.state.lock().watch_devices(key, sender);
        BranchDevices {
            id,
            key: key.clone(),
            receiver,
            state: Arc::downgrade(&self.state),
        }
    }

    /// `syncing` / `synced` transitions of every branch
    pub fn on_sync_updates_event(&self) -> broadcast::Receiver<SyncEvent> {
        self.state.lock().sync_events.subscribe()
    }

    /// Send updates to a branch. Returns the update id, or `None` when there
    /// is nothing to send.
    pub fn add_updates(&self, key: &BranchKey, updates: Vec<String>) -> Option<u64> {
        self.state.lock().add_updates(key, updates)
    }

    /// Send an action to the devices watching a branch
    pub fn send_action(&self, key: &BranchKey, action: serde_json::Value) {
        self.state
            .lock()
            .send(ClientMessage::SendAction(BranchAction::new(key, action)));
    }

    /// Sample the server clock
    pub fn sample_server_time(&self) -> PendingResponse<TimeSample> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock();
        state.last_time_request_id += 1;
        let id = state.last_time_request_id;
        state.time_requests.insert(id, sender);
        if state.connected {
            state.send_time_request(id);
        } else {
            state.queued_time_requests.push(id);
        }
        PendingResponse { receiver }
    }

    /// Count the devices connected to a branch, or to the whole server
    pub fn connection_count(&self, key: Option<&BranchKey>) -> PendingResponse<u64> {
        let (sender, receiver) = oneshot::channel();
        let request = ConnectionCountRequest::from(key);
        let mut state = self.state.lock();
        let waiters = state.count_requests.entry(request.clone()).or_default();
        let first = waiters.is_empty();
        waiters.push(sender);
        if first {
            if state.connected {
                state.send(ClientMessage::ConnectionCount(request));
            } else {
                state.queued_count_requests.push(request);
            }
        }
        PendingResponse { receiver }
    }

    /// Force the transport offline, or let it reconnect. Subscriptions and
    /// pending updates are kept.
    pub fn set_forced_offline(&self, offline: bool) {
        {
            let mut state = self.state.lock();
            if state.forced_offline == offline {
                return;
            }
            state.forced_offline = offline;
        }
        info!(offline, "Forced offline changed");
        if offline {
            self.connection.disconnect();
        } else {
            self.connection.connect();
        }
    }

    pub fn is_forced_offline(&self) -> bool {
        self.state.lock().forced_offline
    }

    /// Whether the server acknowledged the watch on this connection
    pub fn is_branch_connected(&self, key: &BranchKey) -> bool {
        self.state.lock().registry.is_connected(key)
    }

    /// Unacknowledged updates of a branch, oldest first
    pub fn pending_updates(&self, key: &BranchKey) -> Vec<PendingUpdate> {
        self.state.lock().ledger.branch(key).cloned().collect()
    }

    /// React to a transport event
    pub fn handle_event(&self, event: ConnectionEvent) {
        self.state.lock().handle_event(event);
    }

    /// Handle every event already queued on `events`
    pub fn drain(&self, events: &mut broadcast::Receiver<ConnectionEvent>) -> usize {
        let mut handled = 0;
        loop {
            match events.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Client lagged behind connection events");
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// Resend every overdue update. Returns how many were sent.
    pub fn process_resends(&self) -> usize {
        self.state.lock().process_resends()
    }

    /// Run the client until the connection closes or [`SyncClient::close`]
    pub async fn run(&self) {
        let events = self.connection.subscribe();
        self.drive(events).await;
    }

    /// Run the client on a background task. Events delivered after this
    /// returns are not missed.
    pub fn spawn(&self) -> JoinHandle<()> {
        let events = self.connection.subscribe();
        let client = self.clone();
        tokio::spawn(async move { client.drive(events).await })
    }

    async fn drive(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        let interval = self.state.lock().config.resend_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }

        loop {
            tokio::select! {
                result = events.recv() => {
                    match result {
                        Ok(event) => self.handle_event(event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Client lagged behind connection events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Connection closed");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.process_resends();
                }

                _ = shutdown.changed() => {
                    debug!("Client closed");
                    break;
                }
            }
        }
    }

    /// Stop the driver and fail outstanding requests with
    /// [`ClientError::Closed`]
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        let mut state = self.state.lock();
        state.time_requests.clear();
        state.queued_time_requests.clear();
        state.count_requests.clear();
        state.queued_count_requests.clear();
    }
}

/// Updates of a watched branch. Dropping it unwatches the branch.
#[derive(Debug)]
pub struct BranchUpdates {
    id: u64,
    key: BranchKey,
    receiver: mpsc::UnboundedReceiver<ClientUpdate>,
    state: Weak<Mutex<ClientState>>,
}

impl BranchUpdates {
    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<ClientUpdate> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientUpdate> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for BranchUpdates {
    type Item = ClientUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for BranchUpdates {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().unwatch_branch(self.id);
        }
    }
}

/// Device presence of a branch. Dropping it stops watching devices.
#[derive(Debug)]
pub struct BranchDevices {
    id: u64,
    key: BranchKey,
    receiver: mpsc::UnboundedReceiver<DeviceEvent>,
    state: Weak<Mutex<ClientState>>,
}

impl BranchDevices {
    pub fn key(&self) -> &BranchKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DeviceEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for BranchDevices {
    type Item = DeviceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for BranchDevices {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().unwatch_devices(self.id);
        }
    }
}

/// A one-shot server response. The request is sent when this is created,
/// not when it is first polled.
#[derive(Debug)]
pub struct PendingResponse<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> PendingResponse<T> {
    /// Take the response if it already arrived
    pub fn try_take(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Future for PendingResponse<T> {
    type Output = ClientResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ClientError::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncState;
    use crate::memory::MemoryConnection;
    use crate::time::ManualClock;
    use serde_json::json;
    use tagsync_protocol::ConnectionInfo;

    struct Harness {
        conn: Arc<MemoryConnection>,
        clock: ManualClock,
        client: SyncClient,
        events: broadcast::Receiver<ConnectionEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ClientConfig::default())
        }

        fn with_config(config: ClientConfig) -> Self {
            let conn = Arc::new(MemoryConnection::new());
            let clock = ManualClock::new(0);
            let client =
                SyncClient::with_clock(conn.clone(), config, Arc::new(clock.clone())).unwrap();
            let events = conn.subscribe();
            Self {
                conn,
                clock,
                client,
                events,
            }
        }

        fn pump(&mut self) -> usize {
            self.client.drain(&mut self.events)
        }

        fn connect(&mut self) {
            self.conn.connect();
            self.pump();
        }

        fn disconnect(&mut self) {
            self.conn.disconnect();
            self.pump();
        }

        fn deliver(&mut self, message: ServerMessage) {
            self.conn.deliver(message);
            self.pump();
        }

        fn sent(&self) -> Vec<serde_json::Value> {
            self.conn
                .take_sent()
                .iter()
                .map(|m| serde_json::to_value(m).unwrap())
                .collect()
        }
    }

    fn abc() -> BranchKey {
        BranchKey::for_inst("abc")
    }

    fn initial(key: &BranchKey, updates: &[&str]) -> ServerMessage {
        ServerMessage::AddUpdates(
            AddUpdates::new(key, updates.iter().map(|u| u.to_string()).collect()).initial(),
        )
    }

    fn remote(key: &BranchKey, updates: &[&str]) -> ServerMessage {
        ServerMessage::AddUpdates(AddUpdates::new(
            key,
            updates.iter().map(|u| u.to_string()).collect(),
        ))
    }

    fn ack(key: &BranchKey, update_id: u64) -> ServerMessage {
        ServerMessage::UpdatesReceived(UpdatesReceived {
            record_name: key.record_name.clone(),
            inst: key.inst.clone(),
            branch: key.branch.clone(),
            update_id,
            error_code: None,
            max_branch_size_in_bytes: None,
            needed_branch_size_in_bytes: None,
        })
    }

    fn add_updates_json(update_id: u64, updates: &[&str]) -> serde_json::Value {
        json!({
            "type": "add_updates",
            "recordName": null,
            "inst": "abc",
            "branch": "default",
            "updates": updates,
            "updateId": update_id,
        })
    }

    fn watch_json() -> serde_json::Value {
        json!({ "type": "watch_branch", "recordName": null, "inst": "abc", "branch": "default" })
    }

    fn unwatch_json() -> serde_json::Value {
        json!({ "type": "unwatch_branch", "recordName": null, "inst": "abc", "branch": "default" })
    }

    fn sync_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncState> {
        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            states.push(event.state);
        }
        states
    }

    #[test]
    fn test_watch_sends_watch_on_connect() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());
        assert!(h.sent().is_empty());

        h.connect();
        assert_eq!(h.sent(), vec![watch_json()]);
    }

    #[test]
    fn test_reconnect_clears_stale_watch() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());
        h.connect();
        h.sent();

        h.connect();
        assert_eq!(h.sent(), vec![unwatch_json(), watch_json()]);

        h.disconnect();
        h.connect();
        assert_eq!(h.sent(), vec![unwatch_json(), watch_json()]);
    }

    #[test]
    fn test_temporary_branches() {
        let mut h = Harness::with_config(ClientConfig {
            temporary_branches: true,
            ..ClientConfig::default()
        });
        let _updates = h.client.watch_branch_updates(&abc());
        h.connect();
        assert_eq!(h.sent()[0]["temporary"], json!(true));
    }

    #[test]
    fn test_watch_while_connected_sends_immediately() {
        let mut h = Harness::new();
        h.connect();

        let first = h.client.watch_branch_updates(&abc());
        assert_eq!(h.sent(), vec![watch_json()]);

        let second = h.client.watch_branch_updates(&abc());
        assert_eq!(h.sent(), vec![watch_json()]);

        drop(first);
        assert!(h.sent().is_empty());
        drop(second);
        assert_eq!(h.sent(), vec![unwatch_json()]);
    }

    #[test]
    fn test_unwatch_while_offline_sends_nothing() {
        let mut h = Harness::new();
        let updates = h.client.watch_branch_updates(&abc());
        h.connect();
        h.disconnect();
        h.sent();

        drop(updates);
        assert!(h.sent().is_empty());

        // nothing watched any more
        h.connect();
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_buffers_updates_until_initial() {
        let mut h = Harness::new();
        let mut updates = h.client.watch_branch_updates(&abc());
        h.connect();

        h.deliver(remote(&abc(), &["a"]));
        h.deliver(remote(&abc(), &["b"]));
        assert!(updates.try_recv().is_none());

        h.deliver(initial(&abc(), &["c"]));
        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::Updates {
                updates: vec!["a".into(), "b".into(), "c".into()],
                initial: true,
                timestamp: None,
            })
        );

        h.deliver(remote(&abc(), &["d"]));
        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::Updates {
                updates: vec!["d".into()],
                initial: false,
                timestamp: None,
            })
        );
    }

    #[test]
    fn test_ignores_other_branches() {
        let mut h = Harness::new();
        let mut updates = h.client.watch_branch_updates(&abc());
        h.connect();

        h.deliver(initial(&BranchKey::new(Some("rec".into()), "abc", "default"), &["x"]));
        h.deliver(initial(&BranchKey::new(None, "abc", "other"), &["y"]));
        h.deliver(initial(&BranchKey::for_inst("def"), &["z"]));
        assert!(updates.try_recv().is_none());
        assert!(!h.client.is_branch_connected(&abc()));
    }

    #[test]
    fn test_sync_events() {
        let mut h = Harness::new();
        let mut events = h.client.on_sync_updates_event();
        h.connect();

        assert_eq!(h.client.add_updates(&abc(), vec!["a".into()]), Some(1));
        assert_eq!(h.client.add_updates(&abc(), vec!["b".into()]), Some(2));
        assert_eq!(
            h.sent(),
            vec![add_updates_json(1, &["a"]), add_updates_json(2, &["b"])]
        );
        assert_eq!(sync_events(&mut events), vec![SyncState::Syncing]);

        h.deliver(ack(&abc(), 1));
        assert!(sync_events(&mut events).is_empty());

        h.deliver(ack(&abc(), 2));
        assert_eq!(sync_events(&mut events), vec![SyncState::Synced]);

        h.deliver(ack(&abc(), 2));
        assert!(sync_events(&mut events).is_empty());
        assert!(h.client.pending_updates(&abc()).is_empty());
    }

    #[test]
    fn test_sync_event_names_branch() {
        let h = Harness::new();
        let mut events = h.client.on_sync_updates_event();
        let key = BranchKey::new(Some("rec".into()), "abc", "main");
        h.client.add_updates(&key, vec!["a".into()]);

        let event = events.try_recv().unwrap();
        assert_eq!(event, SyncEvent::syncing(key));
    }

    #[test]
    fn test_empty_add_updates_is_noop() {
        let mut h = Harness::new();
        let mut events = h.client.on_sync_updates_event();
        h.connect();

        assert_eq!(h.client.add_updates(&abc(), vec![]), None);
        assert!(h.sent().is_empty());
        assert!(sync_events(&mut events).is_empty());
        assert!(h.client.pending_updates(&abc()).is_empty());
    }

    #[test]
    fn test_update_ids_are_per_client() {
        let mut h = Harness::new();
        h.connect();
        assert_eq!(h.client.add_updates(&abc(), vec!["a".into()]), Some(1));
        assert_eq!(
            h.client.add_updates(&BranchKey::for_inst("def"), vec!["b".into()]),
            Some(2)
        );
    }

    #[test]
    fn test_updates_while_watched_and_offline_are_deferred() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());

        h.client.add_updates(&abc(), vec!["a".into()]);
        assert!(h.sent().is_empty());
        assert_eq!(h.client.pending_updates(&abc())[0].attempt_count, 0);

        h.connect();
        assert_eq!(h.sent(), vec![watch_json()]);

        h.clock.set(100);
        h.deliver(initial(&abc(), &[]));
        assert!(h.client.is_branch_connected(&abc()));
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);

        let pending = h.client.pending_updates(&abc());
        assert_eq!(pending[0].attempt_count, 1);
        assert_eq!(pending[0].last_attempt_at, 100);
        assert_eq!(pending[0].sent_at, 0);

        // a second initial batch on the same connection does not flush again
        h.deliver(initial(&abc(), &[]));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_unwatched_updates_are_sent_immediately() {
        let h = Harness::new();
        h.client.add_updates(&abc(), vec!["a".into()]);
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);
        assert_eq!(h.client.pending_updates(&abc())[0].attempt_count, 1);
    }

    #[test]
    fn test_pending_updates_flush_on_reconnect() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());
        h.connect();
        h.deliver(initial(&abc(), &[]));

        h.client.add_updates(&abc(), vec!["a".into()]);
        h.disconnect();
        h.connect();
        h.sent();

        h.deliver(initial(&abc(), &[]));
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);
        assert_eq!(h.client.pending_updates(&abc())[0].attempt_count, 2);
    }

    #[test]
    fn test_resend_backoff_growth_is_capped() {
        let mut h = Harness::new();
        h.connect();
        h.client.add_updates(&abc(), vec!["a".into()]);
        h.sent();

        let mut resent_at = Vec::new();
        for second in 1..=160 {
            h.clock.set(second * 1000);
            if h.client.process_resends() > 0 {
                resent_at.push(second);
            }
        }

        // 5s, then 10s, 20s, and 40s from there on
        assert_eq!(resent_at, vec![5, 15, 35, 75, 115, 155]);
        let sent = h.sent();
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|m| m == &add_updates_json(1, &["a"])));
    }

    #[test]
    fn test_resend_keeps_update_id() {
        let mut h = Harness::new();
        h.connect();
        h.client.add_updates(&abc(), vec!["a".into()]);
        h.sent();

        h.clock.set(5000);
        assert_eq!(h.client.process_resends(), 1);
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);

        h.deliver(ack(&abc(), 1));
        h.clock.set(100_000);
        assert_eq!(h.client.process_resends(), 0);
    }

    #[test]
    fn test_no_resends_while_disconnected() {
        let mut h = Harness::new();
        h.client.add_updates(&abc(), vec!["a".into()]);
        h.sent();

        h.clock.set(60_000);
        assert_eq!(h.client.process_resends(), 0);

        h.connect();
        assert_eq!(h.client.process_resends(), 1);
    }

    #[test]
    fn test_max_size_reached_drops_update() {
        let mut h = Harness::new();
        let mut updates = h.client.watch_branch_updates(&abc());
        let mut events = h.client.on_sync_updates_event();
        h.connect();
        h.deliver(initial(&abc(), &[]));
        updates.try_recv();

        h.client.add_updates(&abc(), vec!["a".into()]);
        h.deliver(ServerMessage::UpdatesReceived(UpdatesReceived {
            error_code: Some(MAX_SIZE_REACHED.into()),
            max_branch_size_in_bytes: Some(10),
            needed_branch_size_in_bytes: Some(15),
            ..match ack(&abc(), 1) {
                ServerMessage::UpdatesReceived(ack) => ack,
                _ => unreachable!(),
            }
        }));

        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::Error(UpdateError::MaxSizeReached {
                update_id: 1,
                max_branch_size_in_bytes: Some(10),
                needed_branch_size_in_bytes: Some(15),
            }))
        );
        assert!(h.client.pending_updates(&abc()).is_empty());
        assert_eq!(
            sync_events(&mut events),
            vec![SyncState::Syncing, SyncState::Synced]
        );

        h.clock.set(100_000);
        assert_eq!(h.client.process_resends(), 0);
    }

    #[test]
    fn test_other_error_codes_are_rejections() {
        let mut h = Harness::new();
        let mut updates = h.client.watch_branch_updates(&abc());
        h.connect();

        h.client.add_updates(&abc(), vec!["a".into()]);
        let mut rejected = match ack(&abc(), 1) {
            ServerMessage::UpdatesReceived(ack) => ack,
            _ => unreachable!(),
        };
        rejected.error_code = Some("not_authorized".into());
        h.deliver(ServerMessage::UpdatesReceived(rejected));

        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::Error(UpdateError::Rejected {
                update_id: 1,
                error_code: "not_authorized".into(),
            }))
        );
    }

    #[test]
    fn test_watch_result_and_actions() {
        let mut h = Harness::new();
        let mut updates = h.client.watch_branch_updates(&abc());
        h.connect();

        h.deliver(ServerMessage::WatchBranchResult(WatchBranchResult {
            record_name: None,
            inst: "abc".into(),
            branch: "default".into(),
            success: false,
            error_code: Some("not_authorized".into()),
            error_message: Some("nope".into()),
        }));
        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::WatchResult {
                success: false,
                error_code: Some("not_authorized".into()),
                error_message: Some("nope".into()),
            })
        );

        h.deliver(ServerMessage::ReceiveAction(BranchAction::new(
            &abc(),
            json!({ "type": "shout" }),
        )));
        assert_eq!(
            updates.try_recv(),
            Some(ClientUpdate::Event {
                action: json!({ "type": "shout" })
            })
        );
    }

    #[test]
    fn test_send_action() {
        let mut h = Harness::new();
        h.connect();
        h.client.send_action(&abc(), json!({ "type": "shout" }));
        assert_eq!(
            h.sent(),
            vec![json!({
                "type": "send_action",
                "recordName": null,
                "inst": "abc",
                "branch": "default",
                "action": { "type": "shout" },
            })]
        );
    }

    fn device_connected(key: &BranchKey, id: &str, broadcast: bool) -> ServerMessage {
        ServerMessage::ConnectedToBranch(ConnectedToBranch {
            broadcast,
            branch: WatchBranch::new(key),
            connection: ConnectionInfo::new(id),
        })
    }

    fn device_disconnected(key: &BranchKey, id: &str) -> ServerMessage {
        ServerMessage::DisconnectedFromBranch(DisconnectedFromBranch {
            broadcast: false,
            record_name: key.record_name.clone(),
            inst: key.inst.clone(),
            branch: key.branch.clone(),
            connection: ConnectionInfo::new(id),
        })
    }

    #[test]
    fn test_device_presence() {
        let mut h = Harness::new();
        let mut devices = h.client.watch_branch_devices(&abc());
        h.connect();
        assert_eq!(
            h.sent(),
            vec![json!({ "type": "watch_branch_devices", "recordName": null, "inst": "abc", "branch": "default" })]
        );

        h.deliver(device_connected(&abc(), "a", false));
        h.deliver(device_connected(&abc(), "a", false));
        h.deliver(device_connected(&abc(), "b", true));
        h.deliver(device_connected(&BranchKey::for_inst("def"), "c", false));
        h.deliver(device_disconnected(&abc(), "z"));

        assert_eq!(
            devices.try_recv(),
            Some(DeviceEvent::Connected(ConnectionInfo::new("a")))
        );
        assert!(devices.try_recv().is_none());

        h.deliver(device_disconnected(&abc(), "a"));
        assert_eq!(
            devices.try_recv(),
            Some(DeviceEvent::Disconnected(ConnectionInfo::new("a")))
        );
    }

    #[test]
    fn test_disconnect_synthesizes_device_disconnects() {
        let mut h = Harness::new();
        let mut devices = h.client.watch_branch_devices(&abc());
        h.connect();
        h.deliver(device_connected(&abc(), "a", false));
        h.deliver(device_connected(&abc(), "b", false));
        while devices.try_recv().is_some() {}

        h.disconnect();
        assert_eq!(
            devices.try_recv(),
            Some(DeviceEvent::Disconnected(ConnectionInfo::new("a")))
        );
        assert_eq!(
            devices.try_recv(),
            Some(DeviceEvent::Disconnected(ConnectionInfo::new("b")))
        );
        assert!(devices.try_recv().is_none());
    }

    #[test]
    fn test_dropping_device_watch_unwatches() {
        let mut h = Harness::new();
        let devices = h.client.watch_branch_devices(&abc());
        h.connect();
        h.sent();

        drop(devices);
        assert_eq!(
            h.sent(),
            vec![json!({ "type": "unwatch_branch_devices", "recordName": null, "inst": "abc", "branch": "default" })]
        );
    }

    #[test]
    fn test_sample_server_time() {
        let mut h = Harness::new();
        h.clock.set(1000);
        h.connect();

        let mut sample = h.client.sample_server_time();
        assert_eq!(
            h.sent(),
            vec![json!({ "type": "sync/time", "id": 1, "clientRequestTime": 1000 })]
        );

        // unmatched responses are ignored
        h.deliver(ServerMessage::TimeResponse(TimeResponse {
            id: 7,
            client_request_time: 0,
            server_receive_time: 0,
            server_transmit_time: 0,
        }));
        assert!(sample.try_take().is_none());

        h.clock.set(1050);
        h.deliver(ServerMessage::TimeResponse(TimeResponse {
            id: 1,
            client_request_time: 1000,
            server_receive_time: 2020,
            server_transmit_time: 2030,
        }));
        let sample = sample.try_take().unwrap();
        assert_eq!(sample.current_time, 1050);
        assert_eq!(sample.offset_ms(), 1000);
        assert_eq!(sample.round_trip_ms(), 40);
    }

    #[test]
    fn test_time_request_while_offline_waits_for_connect() {
        let mut h = Harness::new();
        let _sample = h.client.sample_server_time();
        assert!(h.sent().is_empty());

        h.clock.set(500);
        h.connect();
        assert_eq!(
            h.sent(),
            vec![json!({ "type": "sync/time", "id": 1, "clientRequestTime": 500 })]
        );
    }

    #[test]
    fn test_connection_count() {
        let mut h = Harness::new();
        h.connect();

        let mut first = h.client.connection_count(Some(&abc()));
        let mut second = h.client.connection_count(Some(&abc()));
        let mut total = h.client.connection_count(None);
        assert_eq!(
            h.sent(),
            vec![
                json!({ "type": "connection_count", "recordName": null, "inst": "abc", "branch": "default" }),
                json!({ "type": "connection_count", "recordName": null }),
            ]
        );

        h.deliver(ServerMessage::ConnectionCount(ConnectionCountResponse {
            record_name: None,
            inst: Some("abc".into()),
            branch: Some("default".into()),
            count: 3,
        }));
        assert_eq!(first.try_take(), Some(3));
        assert_eq!(second.try_take(), Some(3));
        assert_eq!(total.try_take(), None);
    }

    #[test]
    fn test_forced_offline() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());
        h.connect();
        h.sent();

        h.client.set_forced_offline(true);
        h.pump();
        assert!(h.client.is_forced_offline());
        assert!(!h.conn.is_connected());

        h.client.add_updates(&abc(), vec!["a".into()]);
        assert!(h.sent().is_empty());

        h.client.set_forced_offline(false);
        h.pump();
        assert!(h.conn.is_connected());
        assert_eq!(h.sent(), vec![unwatch_json(), watch_json()]);

        h.deliver(initial(&abc(), &[]));
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);
    }

    #[test]
    fn test_close_fails_pending_requests() {
        let h = Harness::new();
        let sample = h.client.sample_server_time();
        h.client.close();

        let result = futures_util::FutureExt::now_or_never(sample);
        assert!(matches!(result, Some(Err(ClientError::Closed))));
    }

    #[test]
    fn test_subscription_outlives_client() {
        let h = Harness::new();
        let updates = h.client.watch_branch_updates(&abc());
        drop(h);
        drop(updates);
    }

    #[test]
    fn test_resends_wait_for_watch_ack() {
        let mut h = Harness::new();
        let _updates = h.client.watch_branch_updates(&abc());
        h.client.add_updates(&abc(), vec!["a".into()]);

        h.clock.set(6000);
        h.connect();
        assert_eq!(h.sent(), vec![watch_json()]);
        assert!(!h.client.is_branch_connected(&abc()));

        assert_eq!(h.client.process_resends(), 0);
        assert!(h.sent().is_empty());

        h.deliver(initial(&abc(), &[]));
        assert_eq!(h.sent(), vec![add_updates_json(1, &["a"])]);

        // acknowledged branches resend on the normal schedule
        h.clock.set(11_000);
        assert_eq!(h.client.process_resends(), 1);
    }

    #[test]
    fn test_watch_before_connect_is_handled() {
        let mut h = Harness::new();
        h.conn.connect();

        // the transport is up but the client has not seen it yet
        let _updates = h.client.watch_branch_updates(&abc());
        assert!(h.sent().is_empty());

        h.pump();
        assert_eq!(h.sent(), vec![watch_json()]);
    }

    #[test]
    fn test_requests_wait_for_handled_connect() {
        let mut h = Harness::new();
        h.conn.connect();

        let _sample = h.client.sample_server_time();
        let _count = h.client.connection_count(None);
        assert!(h.sent().is_empty());

        h.pump();
        assert_eq!(h.sent().len(), 2);
    }

    #[test]
    fn test_acks_match_branch_exactly() {
        let mut h = Harness::new();
        let mut events = h.client.on_sync_updates_event();
        h.connect();
        h.client.add_updates(&abc(), vec!["a".into()]);
        sync_events(&mut events);

        h.deliver(ack(&BranchKey::for_inst("def"), 1));
        h.deliver(ack(&BranchKey::new(Some("rec".into()), "abc", "default"), 1));
        h.deliver(ack(&BranchKey::new(None, "abc", "other"), 1));
        assert_eq!(h.client.pending_updates(&abc()).len(), 1);
        assert!(sync_events(&mut events).is_empty());

        h.deliver(ack(&abc(), 1));
        assert!(h.client.pending_updates(&abc()).is_empty());
        assert_eq!(sync_events(&mut events), vec![SyncState::Synced]);
    }

    #[tokio::test]
    async fn test_spawned_driver() {
        use futures_util::StreamExt;
        use std::time::Duration;

        let conn = Arc::new(MemoryConnection::new());
        let client = SyncClient::new(conn.clone(), ClientConfig::default()).unwrap();
        let mut updates = client.watch_branch_updates(&abc());
        let handle = client.spawn();

        conn.connect();
        conn.deliver(initial(&abc(), &["a"]));

        let update = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap();
        assert_eq!(
            update,
            Some(ClientUpdate::Updates {
                updates: vec!["a".into()],
                initial: true,
                timestamp: None,
            })
        );
        assert!(client.is_branch_connected(&abc()));

        client.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics() {
        let mut h = Harness::new();
        let metrics = ClientMetrics::new().unwrap();
        h.client.attach_metrics(metrics.clone());
        let _updates = h.client.watch_branch_updates(&abc());
        h.connect();

        h.client.add_updates(&abc(), vec!["a".into()]);
        assert_eq!(metrics.updates_sent.get(), 1);
        assert_eq!(metrics.pending_updates.get(), 1);
        assert_eq!(metrics.watched_branches.get(), 1);

        h.deliver(ack(&abc(), 1));
        assert_eq!(metrics.updates_acknowledged.get(), 1);
        assert_eq!(metrics.pending_updates.get(), 0);
    }
}
