//! Multi-tenant state resolution.
//!
//! Every request resolves its org id to the tenant's state (config handles,
//! monitor, broadcaster, vault) exactly once; there are no module level
//! mutable references to configuration after construction. Unknown org ids
//! fall back to the `default` tenant.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::Error;

use proxmox_router::RpcEnvironment;

use pulse_api_types::DEFAULT_ORG_ID;
use pulse_config::nodes::{DefaultNodesConfig, NodesConfig};
use pulse_config::system::SystemConfig;

use crate::auth::{ApiTokenStore, NoApiTokens};
use crate::discovery::{DiscoveryService, NullDiscovery};
use crate::monitor::{Monitor, NullMonitor};
use crate::vault::{ConfigVault, UnavailableVault};
use crate::ws::{Broadcaster, LogBroadcaster};

static INSTANCE: OnceLock<TenantMap> = OnceLock::new();

/// Everything a request handler needs for one tenant.
pub struct TenantState {
    pub org_id: String,
    pub data_dir: PathBuf,
    pub nodes: Box<dyn NodesConfig + Send + Sync>,
    pub system: SystemConfig,
    pub monitor: Arc<dyn Monitor>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub discovery: Arc<dyn DiscoveryService>,
    pub vault: Arc<dyn ConfigVault>,
    pub api_tokens: Arc<dyn ApiTokenStore>,
}

/// Builds the state of a tenant on first access.
pub trait TenantFactory: Send + Sync {
    fn make_tenant(&self, org_id: &str) -> Result<TenantState, Error>;
}

/// Production factory: file backed config, placeholder collaborators.
///
/// The real monitor, hub, discovery and vault implementations replace the
/// placeholders at daemon start by injecting their own [`TenantFactory`].
pub struct DefaultTenantFactory;

impl TenantFactory for DefaultTenantFactory {
    fn make_tenant(&self, org_id: &str) -> Result<TenantState, Error> {
        let data_dir = pulse_config::ensure_tenant_dir(org_id)?;
        Ok(TenantState {
            org_id: org_id.to_string(),
            nodes: Box::new(DefaultNodesConfig::new(&data_dir)),
            system: SystemConfig::new(&data_dir),
            monitor: Arc::new(NullMonitor),
            broadcaster: Arc::new(LogBroadcaster),
            discovery: Arc::new(NullDiscovery),
            vault: Arc::new(UnavailableVault),
            api_tokens: Arc::new(NoApiTokens),
            data_dir,
        })
    }
}

/// Maps org ids to their lazily created [`TenantState`].
pub struct TenantMap {
    tenants: RwLock<HashMap<String, Arc<TenantState>>>,
    factory: Box<dyn TenantFactory>,
}

impl TenantMap {
    pub fn get() -> &'static Self {
        // Not initializing the tenant map is entirely in our responsibility
        // and not something we can recover from.
        INSTANCE.get().expect("tenant map not initialized")
    }

    /// Resolve an org id, falling back to the default tenant when the org
    /// is unknown.
    pub fn resolve(&self, org_id: Option<&str>) -> Result<Arc<TenantState>, Error> {
        let org = match org_id {
            Some(org) if !org.is_empty() => org,
            _ => DEFAULT_ORG_ID,
        };

        if let Some(state) = self.tenants.read().unwrap().get(org) {
            return Ok(Arc::clone(state));
        }

        if org != DEFAULT_ORG_ID && !pulse_config::tenant_dir(org).is_dir() {
            return self.resolve(Some(DEFAULT_ORG_ID));
        }

        let mut tenants = self.tenants.write().unwrap();
        if let Some(state) = tenants.get(org) {
            return Ok(Arc::clone(state));
        }

        let state = Arc::new(self.factory.make_tenant(org)?);
        tenants.insert(org.to_string(), Arc::clone(&state));
        Ok(state)
    }
}

/// Resolve the tenant of the current request.
///
/// The authentication layer stores the request's org id as the auth id.
pub fn lookup_tenant(rpcenv: &mut dyn RpcEnvironment) -> Result<Arc<TenantState>, Error> {
    let org = rpcenv.get_auth_id();
    TenantMap::get().resolve(org.as_deref())
}

/// Initialize the [`TenantMap`] with the given factory.
///
/// Will panic if the map has already been initialized.
pub fn init(factory: Box<dyn TenantFactory>) {
    let map = TenantMap {
        tenants: RwLock::new(HashMap::new()),
        factory,
    };
    if INSTANCE.set(map).is_err() {
        panic!("tenant map already initialized");
    }
}
