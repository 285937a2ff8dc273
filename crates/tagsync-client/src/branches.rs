//! Branch registry: watched branches, their subscribers and device presence

use crate::events::{ClientUpdate, DeviceEvent};
use std::collections::{BTreeMap, HashSet};
use tagsync_protocol::{AddUpdates, BranchKey, ConnectionInfo};
use tokio::sync::mpsc;

/// Server-side watch state of a branch, shared by its subscribers
#[derive(Debug, Default)]
pub(crate) struct BranchState {
    pub subscribers: usize,
    /// A watch was sent on an earlier connection, so the server may still
    /// hold a stale watch for us.
    pub ever_connected: bool,
}

/// One `watch_branch_updates` subscriber
#[derive(Debug)]
pub(crate) struct BranchWatch {
    pub key: BranchKey,
    sender: mpsc::UnboundedSender<ClientUpdate>,
    initial_received: bool,
    buffered: Vec<String>,
}

impl BranchWatch {
    pub fn new(key: BranchKey, sender: mpsc::UnboundedSender<ClientUpdate>) -> Self {
        Self {
            key,
            sender,
            initial_received: false,
            buffered: Vec::new(),
        }
    }

    /// Batches before the initial one are held back and prepended to it, so
    /// the first thing a subscriber sees is a complete view of the branch.
    pub fn receive(&mut self, message: &AddUpdates) -> Option<ClientUpdate> {
        if self.initial_received {
            return Some(ClientUpdate::Updates {
                updates: message.updates.clone(),
                initial: message.is_initial(),
                timestamp: message.timestamp,
            });
        }

        if !message.is_initial() {
            self.buffered.extend(message.updates.iter().cloned());
            return None;
        }

        self.initial_received = true;
        let mut updates = std::mem::take(&mut self.buffered);
        updates.extend(message.updates.iter().cloned());
        Some(ClientUpdate::Updates {
            updates,
            initial: true,
            timestamp: message.timestamp,
        })
    }

    pub fn emit(&self, update: ClientUpdate) {
        // receiver gone means the subscription is being dropped
        let _ = self.sender.send(update);
    }
}

/// One `watch_branch_devices` subscriber
#[derive(Debug)]
pub(crate) struct DeviceWatch {
    pub key: BranchKey,
    sender: mpsc::UnboundedSender<DeviceEvent>,
    devices: BTreeMap<String, ConnectionInfo>,
}

impl DeviceWatch {
    pub fn new(key: BranchKey, sender: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            key,
            sender,
            devices: BTreeMap::new(),
        }
    }

    pub fn connected(&mut self, info: &ConnectionInfo) {
        if self.devices.contains_key(&info.connection_id) {
            return;
        }
        self.devices
            .insert(info.connection_id.clone(), info.clone());
        let _ = self.sender.send(DeviceEvent::Connected(info.clone()));
    }

    pub fn disconnected(&mut self, info: &ConnectionInfo) {
        if let Some(known) = self.devices.remove(&info.connection_id) {
            let _ = self.sender.send(DeviceEvent::Disconnected(known));
        }
    }

    /// Report every tracked device as disconnected and forget them
    pub fn clear(&mut self) -> usize {
        let devices = std::mem::take(&mut self.devices);
        let count = devices.len();
        for info in devices.into_values() {
            let _ = self.sender.send(DeviceEvent::Disconnected(info));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

/// Every branch and device subscription of a client.
///
/// Subscriptions are keyed by id so a dropped handle removes exactly its own
/// entry. A branch entry lives as long as it has subscribers.
#[derive(Debug, Default)]
pub(crate) struct BranchRegistry {
    last_subscription_id: u64,
    branches: BTreeMap<BranchKey, BranchState>,
    watches: BTreeMap<u64, BranchWatch>,
    device_branches: BTreeMap<BranchKey, usize>,
    device_watches: BTreeMap<u64, DeviceWatch>,
    /// Branches whose watch the server acknowledged on this connection
    connected: HashSet<BranchKey>,
}

impl BranchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.last_subscription_id += 1;
        self.last_subscription_id
    }

    pub fn add_watch(&mut self, watch: BranchWatch) -> u64 {
        let id = self.next_id();
        self.branches.entry(watch.key.clone()).or_default().subscribers += 1;
        self.watches.insert(id, watch);
        id
    }

    /// Remove a subscriber. Returns its branch and whether it was the last one.
    pub fn remove_watch(&mut self, id: u64) -> Option<(BranchKey, bool)> {
        let watch = self.watches.remove(&id)?;
        let last = match self.branches.get_mut(&watch.key) {
            Some(state) => {
                state.subscribers = state.subscribers.saturating_sub(1);
                state.subscribers == 0
            }
            None => true,
        };
        if last {
            self.branches.remove(&watch.key);
            self.connected.remove(&watch.key);
        }
        Some((watch.key, last))
    }

    pub fn is_watched(&self, key: &BranchKey) -> bool {
        self.branches.contains_key(key)
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Note that a watch went out for a branch
    pub fn mark_watch_sent(&mut self, key: &BranchKey) {
        if let Some(state) = self.branches.get_mut(key) {
            state.ever_connected = true;
        }
    }

    /// Branches to watch on a new connection, with whether a stale watch
    /// must be cleared first
    pub fn on_connect(&mut self) -> Vec<(BranchKey, bool)> {
        self.branches
            .iter_mut()
            .map(|(key, state)| {
                let stale = state.ever_connected;
                state.ever_connected = true;
                (key.clone(), stale)
            })
            .collect()
    }

    /// Record a watch acknowledgement. Returns false if already acknowledged
    /// on this connection or the branch is not watched.
    pub fn mark_connected(&mut self, key: &BranchKey) -> bool {
        self.is_watched(key) && self.connected.insert(key.clone())
    }

    pub fn is_connected(&self, key: &BranchKey) -> bool {
        self.connected.contains(key)
    }

    pub fn watches_for<'a>(
        &'a mut self,
        key: &'a BranchKey,
    ) -> impl Iterator<Item = &'a mut BranchWatch> + 'a {
        self.watches.values_mut().filter(move |watch| &watch.key == key)
    }

    pub fn add_device_watch(&mut self, watch: DeviceWatch) -> u64 {
        let id = self.next_id();
        *self.device_branches.entry(watch.key.clone()).or_default() += 1;
        self.device_watches.insert(id, watch);
        id
    }

    /// Remove a device subscriber. Returns its branch and whether it was the
    /// last one.
    pub fn remove_device_watch(&mut self, id: u64) -> Option<(BranchKey, bool)> {
        let watch = self.device_watches.remove(&id)?;
        let last = match self.device_branches.get_mut(&watch.key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => true,
        };
        if last {
            self.device_branches.remove(&watch.key);
        }
        Some((watch.key, last))
    }

    pub fn device_branches(&self) -> impl Iterator<Item = &BranchKey> {
        self.device_branches.keys()
    }

    pub fn device_watches_for<'a>(
        &'a mut self,
        key: &'a BranchKey,
    ) -> impl Iterator<Item = &'a mut DeviceWatch> + 'a {
        self.device_watches
            .values_mut()
            .filter(move |watch| &watch.key == key)
    }

    /// Forget acknowledgements and report every known device as gone.
    /// Returns the number of synthesized disconnects.
    pub fn on_disconnect(&mut self) -> usize {
        self.connected.clear();
        self.device_watches.values_mut().map(DeviceWatch::clear).sum()
    }
}
