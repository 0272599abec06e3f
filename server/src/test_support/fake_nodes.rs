use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{bail, Error};
use serde_json::Value;

use proxmox_config_digest::ConfigDigest;
use proxmox_product_config::ApiLockGuard;
use proxmox_section_config::typed::{ApiSectionDataEntry, SectionConfigData};

use pulse_api_types::NodeEntry;
use pulse_config::nodes::NodesConfig;

use crate::connection::{ClientConfig, ClientFactory};
use crate::discovery::DiscoveryService;
use crate::monitor::{AlertManager, Monitor, NotificationManager};
use crate::pbs_client::{DatastoreEntry, PbsApi, PbsClient};
use crate::pmg_client::{PmgApi, PmgClient};
use crate::pve_client::{
    ClusterStatusEntry, NetworkInterface, NodeIndexEntry, PveApi, PveClient, VersionInfo,
};
use crate::tenant::TenantState;
use crate::vault::UnavailableVault;
use crate::ws::{Broadcaster, WsMessage};

/// In-memory `nodes.cfg`: keeps the serialized section config in a string
/// instead of a file.
#[derive(Default)]
pub struct MemoryNodesConfig {
    content: StdMutex<String>,
}

impl NodesConfig for MemoryNodesConfig {
    fn config(&self) -> Result<(SectionConfigData<NodeEntry>, ConfigDigest), Error> {
        let content = self.content.lock().unwrap().clone();
        let digest = openssl::sha::sha256(content.as_bytes());
        let data = NodeEntry::parse_section_config("memory://nodes.cfg", &content)?;
        Ok((data, digest.into()))
    }

    fn lock_config(&self) -> Result<ApiLockGuard, Error> {
        unsafe { Ok(proxmox_product_config::create_mocked_lock()) }
    }

    fn save_config(&self, nodes: &SectionConfigData<NodeEntry>) -> Result<(), Error> {
        let raw = NodeEntry::write_section_config("memory://nodes.cfg", nodes)?;
        *self.content.lock().unwrap() = raw;
        Ok(())
    }
}

/// Monitor fake: scriptable connection statuses, counts reloads.
#[derive(Default)]
pub struct FakeMonitor {
    pub statuses: StdMutex<HashMap<String, String>>,
    pub mock_mode: AtomicBool,
    pub reloads: Arc<AtomicUsize>,
    pub overrides: Arc<StdMutex<HashMap<String, Value>>>,
}

struct FakeAlertManager {
    overrides: Arc<StdMutex<HashMap<String, Value>>>,
}

impl AlertManager for FakeAlertManager {
    fn overrides(&self, key: &str) -> Option<Value> {
        self.overrides.lock().unwrap().get(key).cloned()
    }

    fn set_overrides(&self, key: &str, overrides: Value) -> Result<(), Error> {
        self.overrides
            .lock()
            .unwrap()
            .insert(key.to_string(), overrides);
        Ok(())
    }

    fn remove_overrides(&self, key: &str) {
        self.overrides.lock().unwrap().remove(key);
    }
}

struct FakeNotificationManager;

impl NotificationManager for FakeNotificationManager {
    fn reload(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl Monitor for FakeMonitor {
    fn connection_statuses(&self) -> HashMap<String, String> {
        self.statuses.lock().unwrap().clone()
    }

    fn mock_mode(&self) -> bool {
        self.mock_mode.load(Ordering::Relaxed)
    }

    fn set_mock_mode(&self, enabled: bool) {
        self.mock_mode.store(enabled, Ordering::Relaxed);
    }

    fn alert_manager(&self) -> Arc<dyn AlertManager> {
        Arc::new(FakeAlertManager {
            overrides: Arc::clone(&self.overrides),
        })
    }

    fn notification_manager(&self) -> Arc<dyn NotificationManager> {
        Arc::new(FakeNotificationManager)
    }

    async fn reload(&self) -> Result<(), Error> {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Broadcaster fake recording every message.
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub messages: StdMutex<Vec<WsMessage>>,
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, message: WsMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

impl RecordingBroadcaster {
    pub fn message_types(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.ty.clone())
            .collect()
    }
}

/// Discovery fake with a scriptable cached result.
#[derive(Default)]
pub struct FakeDiscovery {
    pub cached: StdMutex<Option<Value>>,
    pub refreshes: AtomicUsize,
}

#[async_trait::async_trait]
impl DiscoveryService for FakeDiscovery {
    async fn scan(&self, _subnet: Option<&str>) -> Result<Value, Error> {
        Ok(serde_json::json!({ "servers": [] }))
    }

    fn cached_result(&self) -> Option<Value> {
        self.cached.lock().unwrap().clone()
    }

    fn force_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }
}

/// How a fake cluster peer behaves when probed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PeerBehavior {
    /// `get_nodes` succeeds.
    Valid,
    /// `get_nodes` answers 403, which still counts as a valid peer.
    AuthScoped,
    /// `get_nodes` answers 501.
    NotImplemented,
    /// Fails with a certificate error unless verification is relaxed.
    TlsMismatchThenValid,
    /// Any request fails.
    Unreachable,
}

/// Scriptable [`ClientFactory`]: the base host serves the cluster status
/// and interface listings, peers behave per [`PeerBehavior`].
#[derive(Default)]
pub struct FakePveFactory {
    pub cluster_status: Vec<ClusterStatusEntry>,
    pub peers: HashMap<String, PeerBehavior>,
    pub interfaces: HashMap<String, Vec<NetworkInterface>>,
    pub fingerprints: HashMap<String, String>,
}

struct FakePveClient {
    behavior: PeerBehavior,
    insecure: bool,
    cluster_status: Vec<ClusterStatusEntry>,
    interfaces: HashMap<String, Vec<NetworkInterface>>,
}

#[async_trait::async_trait]
impl PveApi for FakePveClient {
    async fn version(&self) -> Result<VersionInfo, proxmox_client::Error> {
        Ok(VersionInfo {
            version: "8.4.1".to_string(),
            release: None,
            repoid: None,
        })
    }

    async fn get_nodes(&self) -> Result<Vec<NodeIndexEntry>, proxmox_client::Error> {
        match self.behavior {
            PeerBehavior::Valid => Ok(Vec::new()),
            PeerBehavior::AuthScoped => Err(proxmox_client::Error::Api(
                http::StatusCode::FORBIDDEN,
                "permission denied".to_string(),
            )),
            PeerBehavior::NotImplemented => Err(proxmox_client::Error::Api(
                http::StatusCode::NOT_IMPLEMENTED,
                "not implemented".to_string(),
            )),
            PeerBehavior::TlsMismatchThenValid => {
                if self.insecure {
                    Ok(Vec::new())
                } else {
                    Err(proxmox_client::Error::Other(
                        "certificate fingerprint mismatch",
                    ))
                }
            }
            PeerBehavior::Unreachable => Err(proxmox_client::Error::Other(
                "connection refused",
            )),
        }
    }

    async fn get_cluster_status(
        &self,
    ) -> Result<Vec<ClusterStatusEntry>, proxmox_client::Error> {
        if self.cluster_status.is_empty() {
            return Err(proxmox_client::Error::Api(
                http::StatusCode::NOT_IMPLEMENTED,
                "not implemented".to_string(),
            ));
        }
        Ok(self.cluster_status.clone())
    }

    async fn get_node_network_interfaces(
        &self,
        node: &str,
    ) -> Result<Vec<NetworkInterface>, proxmox_client::Error> {
        Ok(self.interfaces.get(node).cloned().unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ClientFactory for FakePveFactory {
    fn make_pve_client(&self, config: &ClientConfig) -> Result<Box<PveClient>, Error> {
        let host = config.host_part().to_string();
        let behavior = self
            .peers
            .get(&host)
            .copied()
            .unwrap_or(PeerBehavior::Valid);
        Ok(Box::new(FakePveClient {
            behavior,
            insecure: config.verify_ssl == Some(false),
            cluster_status: self.cluster_status.clone(),
            interfaces: self.interfaces.clone(),
        }))
    }

    fn make_pbs_client(&self, _config: &ClientConfig) -> Result<Box<PbsClient>, Error> {
        Ok(Box::new(FakePbsClient))
    }

    fn make_pmg_client(&self, _config: &ClientConfig) -> Result<Box<PmgClient>, Error> {
        Ok(Box::new(FakePmgClient))
    }

    async fn make_pve_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PveClient>, Error> {
        self.make_pve_client(config)
    }

    async fn make_pbs_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PbsClient>, Error> {
        self.make_pbs_client(config)
    }

    async fn make_pmg_client_and_login(
        &self,
        config: &ClientConfig,
    ) -> Result<Box<PmgClient>, Error> {
        self.make_pmg_client(config)
    }

    async fn fetch_fingerprint(&self, host: &str, _port: u16) -> Result<String, Error> {
        match self.fingerprints.get(host) {
            Some(fingerprint) => Ok(fingerprint.clone()),
            None => bail!("no fingerprint scripted for {host}"),
        }
    }
}

struct FakePbsClient;

#[async_trait::async_trait]
impl PbsApi for FakePbsClient {
    async fn version(&self) -> Result<VersionInfo, proxmox_client::Error> {
        Ok(VersionInfo {
            version: "3.4".to_string(),
            release: None,
            repoid: None,
        })
    }

    async fn get_datastores(&self) -> Result<Vec<DatastoreEntry>, proxmox_client::Error> {
        Ok(Vec::new())
    }
}

struct FakePmgClient;

#[async_trait::async_trait]
impl PmgApi for FakePmgClient {
    async fn version(&self) -> Result<VersionInfo, proxmox_client::Error> {
        Ok(VersionInfo {
            version: "8.2".to_string(),
            release: None,
            repoid: None,
        })
    }
}

/// Install an unscripted [`FakePveFactory`] as the process wide client
/// factory (standalone behavior, all probes succeed). Tests needing
/// scripted topology pass their own factory to
/// [`crate::cluster::detect_pve_cluster_with`] instead.
pub fn init_fake_client_factory() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| crate::connection::init(Box::new(FakePveFactory::default())));
}

/// A tenant wired up with fakes, plus handles to inspect them.
pub struct TestTenant {
    pub tenant: Arc<TenantState>,
    pub monitor: Arc<FakeMonitor>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub discovery: Arc<FakeDiscovery>,
}

pub fn make_test_tenant() -> TestTenant {
    let monitor = Arc::new(FakeMonitor::default());
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let discovery = Arc::new(FakeDiscovery::default());

    let tenant = Arc::new(TenantState {
        org_id: "default".to_string(),
        data_dir: std::env::temp_dir(),
        nodes: Box::new(MemoryNodesConfig::default()),
        system: pulse_config::system::SystemConfig::new(std::env::temp_dir()),
        monitor: Arc::clone(&monitor) as _,
        broadcaster: Arc::clone(&broadcaster) as _,
        discovery: Arc::clone(&discovery) as _,
        vault: Arc::new(UnavailableVault),
        api_tokens: Arc::new(crate::auth::NoApiTokens),
    });

    TestTenant {
        tenant,
        monitor,
        broadcaster,
        discovery,
    }
}
