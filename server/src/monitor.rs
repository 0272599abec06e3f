//! Interface to the metric-polling monitor.
//!
//! The monitor itself lives outside this crate; the control plane only
//! needs to query connection state, flip mock mode, reach the alert and
//! notification managers and ask for a reload after configuration changes.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use anyhow::Error;
use serde_json::Value;

/// Window in which a freshly auto-registered node reports as connected
/// even before the monitor has a connection entry for it.
const AUTO_REGISTER_GRACE: i64 = 2 * 60;

/// Manages alert rules and per-node overrides.
pub trait AlertManager: Send + Sync {
    /// Load the override set stored under `key`.
    fn overrides(&self, key: &str) -> Option<Value>;

    /// Store an override set under `key`.
    fn set_overrides(&self, key: &str, overrides: Value) -> Result<(), Error>;

    /// Drop the override set stored under `key`.
    fn remove_overrides(&self, key: &str);
}

/// Delivers notifications (email, webhooks); only reloaded from here.
pub trait NotificationManager: Send + Sync {
    /// Re-read webhook and email configuration from disk.
    fn reload(&self) -> Result<(), Error>;
}

/// The monitor as seen by the control plane.
#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    /// Current connection state per node, keyed by `<type>-<name>`.
    fn connection_statuses(&self) -> HashMap<String, String>;

    /// Whether mock mode is active; inventory mutations are rejected then.
    fn mock_mode(&self) -> bool;

    /// Toggle mock mode.
    fn set_mock_mode(&self, enabled: bool);

    /// The alert manager of this tenant.
    fn alert_manager(&self) -> Arc<dyn AlertManager>;

    /// The notification manager of this tenant.
    fn notification_manager(&self) -> Arc<dyn NotificationManager>;

    /// Re-read the node inventory and restart polling.
    async fn reload(&self) -> Result<(), Error>;
}

/// Placeholder wired in when no real monitor is attached.
pub struct NullMonitor;

struct NullAlertManager;

impl AlertManager for NullAlertManager {
    fn overrides(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set_overrides(&self, _key: &str, _overrides: Value) -> Result<(), Error> {
        Ok(())
    }

    fn remove_overrides(&self, _key: &str) {}
}

struct NullNotificationManager;

impl NotificationManager for NullNotificationManager {
    fn reload(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Monitor for NullMonitor {
    fn connection_statuses(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn mock_mode(&self) -> bool {
        false
    }

    fn set_mock_mode(&self, _enabled: bool) {}

    fn alert_manager(&self) -> Arc<dyn AlertManager> {
        Arc::new(NullAlertManager)
    }

    fn notification_manager(&self) -> Arc<dyn NotificationManager> {
        Arc::new(NullNotificationManager)
    }

    async fn reload(&self) -> Result<(), Error> {
        log::info!("monitor reload requested, no monitor attached");
        Ok(())
    }
}

/// Remembers which nodes were auto-registered recently.
///
/// The monitor only learns about a new node on its next reload, so for a
/// short while a freshly registered node has no connection entry. Status
/// resolution treats such nodes as connected instead of alarming the user.
#[derive(Default)]
pub struct RecentRegistrations {
    map: StdMutex<HashMap<String, i64>>,
}

static RECENT: LazyLock<RecentRegistrations> = LazyLock::new(Default::default);

impl RecentRegistrations {
    pub fn get() -> &'static Self {
        &RECENT
    }

    fn key(org_id: &str, monitoring_id: &str) -> String {
        format!("{org_id}/{monitoring_id}")
    }

    /// Record an auto-registration of `monitoring_id` just now.
    pub fn mark(&self, org_id: &str, monitoring_id: &str) {
        let now = proxmox_time::epoch_i64();
        let mut map = self.map.lock().unwrap();
        map.retain(|_, at| now - *at < AUTO_REGISTER_GRACE);
        map.insert(Self::key(org_id, monitoring_id), now);
    }

    /// Whether `monitoring_id` was auto-registered within the grace window.
    pub fn is_recent(&self, org_id: &str, monitoring_id: &str) -> bool {
        let now = proxmox_time::epoch_i64();
        let mut map = self.map.lock().unwrap();
        map.retain(|_, at| now - *at < AUTO_REGISTER_GRACE);
        map.contains_key(&Self::key(org_id, monitoring_id))
    }
}

/// Resolve the user visible status of one node.
pub fn node_status(
    monitor: &dyn Monitor,
    org_id: &str,
    monitoring_id: &str,
) -> String {
    if let Some(status) = monitor.connection_statuses().get(monitoring_id) {
        return status.clone();
    }
    if RecentRegistrations::get().is_recent(org_id, monitoring_id) {
        return "connected".to_string();
    }
    "disconnected".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_registrations_grant_connected_status() {
        let recent = RecentRegistrations::default();
        recent.mark("default", "pve-px1");
        assert!(recent.is_recent("default", "pve-px1"));
        assert!(!recent.is_recent("default", "pve-px2"));
        assert!(!recent.is_recent("other", "pve-px1"));
    }

    #[test]
    fn unknown_nodes_report_disconnected() {
        assert_eq!(
            node_status(&NullMonitor, "default", "pve-unknown"),
            "disconnected"
        );
    }
}
