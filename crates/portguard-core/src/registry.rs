//! Connection registry
//!
//! Source of truth for which switches may receive commands. Every other
//! per-switch map in the controller registers an [`EvictionListener`] here and
//! is purged explicitly when its switch goes away.

use crate::error::RegistryError;
use crate::switch::SharedHandle;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use portguard_common::{DatapathId, SessionId, SwitchFeatures};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

/// Switch lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchState {
    /// Registered, default rules not yet installed
    Connecting,
    /// Receiving telemetry and enforcement
    Active,
    /// Not registered
    Disconnected,
}

/// Cleanup hook for state keyed by switch
pub trait EvictionListener: Send + Sync {
    /// Drop everything held for `dpid`
    fn evict_switch(&self, dpid: DatapathId);
}

/// Resolved connection for one switch
#[derive(Clone)]
pub struct SwitchLink {
    /// Switch
    pub dpid: DatapathId,
    /// Connection lifetime the handle belongs to
    pub session: SessionId,
    /// Outbound channel
    pub handle: SharedHandle,
    /// Advertised capabilities
    pub features: SwitchFeatures,
}

impl std::fmt::Debug for SwitchLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchLink")
            .field("dpid", &self.dpid)
            .field("session", &self.session)
            .field("features", &self.features)
            .finish()
    }
}

struct SwitchEntry {
    session: SessionId,
    handle: SharedHandle,
    features: SwitchFeatures,
    state: SwitchState,
    connected_at: DateTime<Utc>,
}

impl SwitchEntry {
    fn link(&self, dpid: DatapathId) -> SwitchLink {
        SwitchLink {
            dpid,
            session: self.session,
            handle: self.handle.clone(),
            features: self.features,
        }
    }
}

/// Snapshot of one registration
#[derive(Debug, Clone)]
pub struct SwitchInfo {
    /// Switch
    pub dpid: DatapathId,
    /// Connection lifetime
    pub session: SessionId,
    /// Lifecycle state
    pub state: SwitchState,
    /// Capabilities
    pub features: SwitchFeatures,
    /// Registration time
    pub connected_at: DateTime<Utc>,
}

/// Live switch connections
pub struct ConnectionRegistry {
    switches: RwLock<HashMap<DatapathId, SwitchEntry>>,
    listeners: RwLock<Vec<Weak<dyn EvictionListener>>>,
}

impl ConnectionRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self {
            switches: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe a component to per-switch cleanup
    pub fn add_eviction_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.listeners.write().push(Arc::downgrade(&listener));
    }

    /// Register a switch connection in the connecting state.
    ///
    /// A previous session of the same switch is replaced and its derived
    /// state evicted. Returns the replaced session, if any.
    pub fn register(
        &self,
        dpid: DatapathId,
        session: SessionId,
        handle: SharedHandle,
        features: SwitchFeatures,
    ) -> Option<SessionId> {
        let entry = SwitchEntry {
            session,
            handle,
            features,
            state: SwitchState::Connecting,
            connected_at: Utc::now(),
        };

        let replaced = self
            .switches
            .write()
            .insert(dpid, entry)
            .map(|old| old.session);

        match replaced {
            Some(old) => {
                tracing::warn!(
                    %dpid,
                    old_session = %old,
                    new_session = %session,
                    "switch reconnected, replacing session"
                );
                self.notify_eviction(dpid);
            }
            None => tracing::info!(%dpid, %session, "switch registered"),
        }

        replaced
    }

    /// Move a connecting switch to active. Fails if the session is stale.
    pub fn activate(&self, dpid: DatapathId, session: SessionId) -> bool {
        let mut switches = self.switches.write();
        match switches.get_mut(&dpid) {
            Some(entry) if entry.session == session => {
                entry.state = SwitchState::Active;
                true
            }
            _ => false,
        }
    }

    /// Remove a switch regardless of session and evict its state
    pub fn unregister(&self, dpid: DatapathId) -> bool {
        let removed = self.switches.write().remove(&dpid).is_some();
        if removed {
            tracing::info!(%dpid, "switch unregistered");
            self.notify_eviction(dpid);
        }
        removed
    }

    /// Remove a switch only if `session` is still the live one
    pub fn unregister_session(&self, dpid: DatapathId, session: SessionId) -> bool {
        let removed = {
            let mut switches = self.switches.write();
            match switches.get(&dpid) {
                Some(entry) if entry.session == session => switches.remove(&dpid).is_some(),
                _ => false,
            }
        };

        if removed {
            tracing::info!(%dpid, %session, "switch disconnected");
            self.notify_eviction(dpid);
        } else {
            tracing::debug!(%dpid, %session, "ignoring disconnect of stale session");
        }
        removed
    }

    /// Switches in the active state
    pub fn active_switches(&self) -> BTreeSet<DatapathId> {
        self.switches
            .read()
            .iter()
            .filter(|(_, e)| e.state == SwitchState::Active)
            .map(|(dpid, _)| *dpid)
            .collect()
    }

    /// Connections of all active switches, taken from one snapshot
    pub fn active_links(&self) -> Vec<SwitchLink> {
        self.switches
            .read()
            .iter()
            .filter(|(_, e)| e.state == SwitchState::Active)
            .map(|(dpid, e)| e.link(*dpid))
            .collect()
    }

    /// Outbound channel for a registered (connecting or active) switch
    pub fn handle_for(&self, dpid: DatapathId) -> Result<SwitchLink, RegistryError> {
        self.switches
            .read()
            .get(&dpid)
            .map(|e| e.link(dpid))
            .ok_or(RegistryError::NotFound(dpid))
    }

    /// Whether `session` is still the registered connection of `dpid`
    pub fn is_current(&self, dpid: DatapathId, session: SessionId) -> bool {
        self.switches
            .read()
            .get(&dpid)
            .map(|e| e.session == session)
            .unwrap_or(false)
    }

    /// Lifecycle state; unknown switches are disconnected
    pub fn state(&self, dpid: DatapathId) -> SwitchState {
        self.switches
            .read()
            .get(&dpid)
            .map(|e| e.state)
            .unwrap_or(SwitchState::Disconnected)
    }

    /// Registration details
    pub fn info(&self, dpid: DatapathId) -> Option<SwitchInfo> {
        self.switches.read().get(&dpid).map(|e| SwitchInfo {
            dpid,
            session: e.session,
            state: e.state,
            features: e.features,
            connected_at: e.connected_at,
        })
    }

    /// Number of registered switches
    pub fn len(&self) -> usize {
        self.switches.read().len()
    }

    /// No switch registered
    pub fn is_empty(&self) -> bool {
        self.switches.read().is_empty()
    }

    // Called with no registry lock held; listeners may query the registry.
    fn notify_eviction(&self, dpid: DatapathId) {
        let listeners: Vec<Arc<dyn EvictionListener>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for listener in listeners {
            listener.evict_switch(dpid);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
