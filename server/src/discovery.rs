//! Interface to the network-scanning discovery service.

use anyhow::Error;
use serde_json::{json, Value};

/// The discovery service as seen by the control plane.
#[async_trait::async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Scan `subnet` (or the configured default) for Proxmox services.
    async fn scan(&self, subnet: Option<&str>) -> Result<Value, Error>;

    /// The most recent scan result, if any.
    fn cached_result(&self) -> Option<Value>;

    /// Invalidate the cache and schedule a new scan.
    fn force_refresh(&self);
}

/// Placeholder wired in when no scanner is attached.
pub struct NullDiscovery;

#[async_trait::async_trait]
impl DiscoveryService for NullDiscovery {
    async fn scan(&self, _subnet: Option<&str>) -> Result<Value, Error> {
        Ok(json!({ "servers": [] }))
    }

    fn cached_result(&self) -> Option<Value> {
        None
    }

    fn force_refresh(&self) {}
}
