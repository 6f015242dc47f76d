use crate::ports::StatsChangeListener;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Registered change listeners, keyed by the id handed out at registration.
pub struct StatsCallbackManager {
    listeners: Arc<DashMap<u64, Arc<dyn StatsChangeListener>>>,
    next_id: AtomicU64,
}

/// What changed during one cache cycle.
#[derive(Debug, Default)]
pub struct ChangeSet {
    ifaces: BTreeSet<String>,
    uids: BTreeSet<(String, u32)>,
}

impl ChangeSet {
    pub fn iface(&mut self, iface: &str) {
        self.ifaces.insert(iface.to_string());
    }

    pub fn uid(&mut self, iface: &str, uid: u32) {
        self.uids.insert((iface.to_string(), uid));
    }

    pub fn is_empty(&self) -> bool {
        self.ifaces.is_empty() && self.uids.is_empty()
    }
}

impl Default for StatsCallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCallbackManager {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `listener` once. Registering the same listener again returns its existing id.
    pub fn register(&self, listener: Arc<dyn StatsChangeListener>) -> u64 {
        if let Some(existing) = self
            .listeners
            .iter()
            .find(|entry| Arc::ptr_eq(entry.value(), &listener))
        {
            return *existing.key();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.insert(id, listener);
        debug!(id, "change listener registered");
        id
    }

    pub fn unregister(&self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Delivers each distinct change once to every listener.
    pub fn dispatch(&self, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<_> = self.listeners.iter().map(|e| e.value().clone()).collect();
        for listener in listeners {
            for iface in &changes.ifaces {
                listener.on_iface_stats_changed(iface);
            }
            for (iface, uid) in &changes.uids {
                listener.on_uid_stats_changed(iface, *uid);
            }
        }
    }
}
