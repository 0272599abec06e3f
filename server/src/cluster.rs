//! PVE cluster topology detection.
//!
//! On add (and opportunistically on list) the control plane asks a PVE node
//! for its `cluster/status`, validates every reported peer with a short
//! lived client and records the peers as [`ClusterEndpoint`]s. Endpoints
//! are a cache of the last successful detection; staleness is bounded by
//! the per-instance cooldown and the explicit refresh endpoint.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{LazyLock, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Error;

use pulse_api_types::ClusterEndpoint;

use crate::connection::{ClientConfig, ClientFactory};
use crate::pve_client::{ClusterStatusEntry, PveClient};

/// Name recorded when the cluster row carries no name.
const UNKNOWN_CLUSTER_NAME: &str = "Unknown Cluster";

/// Cool-down between opportunistic detections per instance.
const DETECTION_COOLDOWN: Duration = Duration::from_secs(30);

/// Timeout for peer validation probes.
const PEER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a topology detection run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterInfo {
    pub is_cluster: bool,
    pub cluster_name: Option<String>,
    pub endpoints: Vec<ClusterEndpoint>,
}

/// Tracks when each instance was last probed for topology changes.
#[derive(Default)]
pub struct DetectionCooldown {
    last: StdMutex<HashMap<String, Instant>>,
}

static COOLDOWN: LazyLock<DetectionCooldown> = LazyLock::new(Default::default);

impl DetectionCooldown {
    pub fn get() -> &'static Self {
        &COOLDOWN
    }

    /// Check whether an opportunistic detection may run for `instance_id`
    /// and, if so, start its cooldown window.
    pub fn try_acquire(&self, instance_id: &str) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match last.get(instance_id) {
            Some(at) if now.duration_since(*at) < DETECTION_COOLDOWN => false,
            _ => {
                last.insert(instance_id.to_string(), now);
                true
            }
        }
    }

    /// Forget an instance, e.g. after it was deleted.
    pub fn forget(&self, instance_id: &str) {
        self.last.lock().unwrap().remove(instance_id);
    }
}

/// Detect the cluster topology behind `config`.
///
/// `node_name` is the name the answering node goes by; `existing` supplies
/// the endpoints currently stored so user set overrides survive the
/// refresh.
pub async fn detect_pve_cluster(
    config: &ClientConfig,
    node_name: &str,
    existing: &[ClusterEndpoint],
) -> Result<ClusterInfo, Error> {
    detect_pve_cluster_with(crate::connection::factory(), config, node_name, existing).await
}

/// [`detect_pve_cluster`] with an explicit client factory.
pub async fn detect_pve_cluster_with(
    factory: &(dyn ClientFactory + Send + Sync),
    config: &ClientConfig,
    node_name: &str,
    existing: &[ClusterEndpoint],
) -> Result<ClusterInfo, Error> {
    let client = make_client(factory, config).await?;

    let status = match fetch_cluster_status(client.as_ref()).await {
        Ok(status) => status,
        Err(err) if is_not_implemented(&err) => return Ok(ClusterInfo::default()),
        Err(err) => return Err(err.into()),
    };

    let mut cluster_name = None;
    let mut peers = Vec::new();
    for row in status {
        match row.ty.as_str() {
            "cluster" => cluster_name = row.name.clone(),
            "node" => peers.push(row),
            _ => {}
        }
    }

    if peers.len() <= 1 {
        return Ok(ClusterInfo::default());
    }

    let cluster_name = match cluster_name {
        Some(name) if !name.is_empty() => name,
        _ => UNKNOWN_CLUSTER_NAME.to_string(),
    };

    let connection_ip = config.host_part().parse::<IpAddr>().ok();
    let preserved: HashMap<&str, &ClusterEndpoint> = existing
        .iter()
        .map(|endpoint| (endpoint.node_name.as_str(), endpoint))
        .collect();

    let now = proxmox_time::epoch_i64();
    let mut endpoints = Vec::new();
    let mut metadata_endpoints = Vec::new();

    for peer in &peers {
        let peer_name = match peer.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => continue,
        };

        let validation = validate_peer(factory, config, peer).await;

        let mut endpoint = ClusterEndpoint {
            node_id: peer
                .nodeid
                .map(|id| id.to_string())
                .unwrap_or_else(|| peer.id.clone()),
            node_name: peer_name.to_string(),
            host: config.for_peer(peer_name).host,
            ip: peer.ip.clone().unwrap_or_default(),
            ip_override: None,
            fingerprint: validation.fingerprint,
            guest_url: None,
            online: validation.valid,
            last_seen: validation.valid.then_some(now),
            temperature_proxy_control_token: None,
        };

        if let Some(previous) = preserved.get(peer_name) {
            endpoint.ip_override = previous.ip_override.clone();
            endpoint.guest_url = previous.guest_url.clone();
            endpoint.temperature_proxy_control_token =
                previous.temperature_proxy_control_token.clone();
            if endpoint.fingerprint.is_none() {
                endpoint.fingerprint = previous.fingerprint.clone();
            }
        }

        if endpoint.ip_override.is_none() {
            if let Some(connection_ip) = connection_ip {
                endpoint.ip_override =
                    preferred_management_ip(client.as_ref(), connection_ip, peer_name, &endpoint.ip)
                        .await;
            }
        }

        if validation.valid {
            endpoints.push(endpoint);
        } else {
            metadata_endpoints.push(endpoint);
        }
    }

    if endpoints.is_empty() {
        // keep what the cluster reported so the topology stays visible
        log::warn!("no cluster peer of {node_name} validated, keeping metadata-only endpoints");
        endpoints = metadata_endpoints;
    }

    Ok(ClusterInfo {
        is_cluster: true,
        cluster_name: Some(cluster_name),
        endpoints,
    })
}

async fn make_client(
    factory: &(dyn ClientFactory + Send + Sync),
    config: &ClientConfig,
) -> Result<Box<PveClient>, Error> {
    if config.token_value.as_deref().is_some_and(|t| !t.is_empty()) {
        factory.make_pve_client(config)
    } else {
        factory.make_pve_client_and_login(config).await
    }
}

/// Call `cluster/status` with up to 3 attempts and linear backoff.
async fn fetch_cluster_status(
    client: &PveClient,
) -> Result<Vec<ClusterStatusEntry>, proxmox_client::Error> {
    let mut attempt = 1;
    loop {
        match client.get_cluster_status().await {
            Ok(status) => return Ok(status),
            Err(err) if is_not_implemented(&err) => return Err(err),
            Err(err) if attempt < 3 => {
                log::debug!("cluster status attempt {attempt} failed - {err}");
                tokio::time::sleep(Duration::from_secs(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

struct PeerValidation {
    valid: bool,
    fingerprint: Option<String>,
}

/// Probe one cluster peer with a short lived client.
///
/// A 401/403 (or "permission") answer still proves the peer speaks the PVE
/// API, it just means our token is scoped; such peers count as valid. A TLS
/// mismatch retries once with verification relaxed, for discovery only.
async fn validate_peer(
    factory: &(dyn ClientFactory + Send + Sync),
    base: &ClientConfig,
    peer: &ClusterStatusEntry,
) -> PeerValidation {
    let address = match peer.ip.as_deref().or(peer.name.as_deref()) {
        Some(address) if !address.is_empty() => address,
        _ => {
            return PeerValidation {
                valid: false,
                fingerprint: None,
            }
        }
    };

    let peer_config = base.for_peer(address).with_timeout(PEER_PROBE_TIMEOUT);

    let fingerprint = factory
        .fetch_fingerprint(address, port_of(&peer_config))
        .await
        .map_err(|err| log::debug!("fingerprint fetch for {address} failed - {err}"))
        .ok();

    let valid = match probe_peer(factory, &peer_config).await {
        Ok(valid) => valid,
        Err(err) if is_tls_mismatch(&err) => {
            probe_peer(factory, &peer_config.clone().insecure())
                .await
                .unwrap_or(false)
        }
        Err(err) => {
            log::debug!("peer {address} failed validation - {err:#}");
            false
        }
    };

    PeerValidation { valid, fingerprint }
}

/// Returns `Ok(valid)` for a completed probe and `Err` for errors worth a
/// relaxed retry.
async fn probe_peer(
    factory: &(dyn ClientFactory + Send + Sync),
    config: &ClientConfig,
) -> Result<bool, Error> {
    let client = match make_client(factory, config).await {
        Ok(client) => client,
        Err(err) => return Err(err),
    };

    let probe = tokio::time::timeout(config.timeout, client.get_nodes()).await;
    match probe {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(err)) if is_auth_scoped(&err) => Ok(true),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(false),
    }
}

fn port_of(config: &ClientConfig) -> u16 {
    config
        .host
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or_else(|| config.ty.default_port())
}

/// Pick a management network address for a peer.
///
/// Only consulted when the cluster-reported address is not on the same
/// network as the initial connection address; queries the peer's interfaces
/// and takes the first active IPv4 sharing a network with the connection.
async fn preferred_management_ip(
    client: &PveClient,
    connection_ip: IpAddr,
    peer_name: &str,
    reported_ip: &str,
) -> Option<String> {
    let reported: IpAddr = reported_ip.parse().ok()?;
    if same_network(connection_ip, reported) {
        return None;
    }

    let interfaces = match client.get_node_network_interfaces(peer_name).await {
        Ok(interfaces) => interfaces,
        Err(err) => {
            log::debug!("interface query for {peer_name} failed - {err}");
            return None;
        }
    };

    for interface in interfaces {
        if !interface.is_active() {
            continue;
        }
        let Some(address) = interface.address.as_deref() else {
            continue;
        };
        // addresses may come with a /prefix attached
        let address = address.split('/').next().unwrap_or(address);
        if let Ok(addr) = address.parse::<Ipv4Addr>() {
            if same_network(connection_ip, IpAddr::V4(addr)) {
                return Some(addr.to_string());
            }
        }
    }

    None
}

/// Whether two addresses share a network under the progressively widening
/// masks (/24, /20, /16 for IPv4; /64, /48 for IPv6).
fn same_network(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => [24u32, 20, 16]
            .iter()
            .any(|prefix| same_v4_network(a, b, *prefix)),
        (IpAddr::V6(a), IpAddr::V6(b)) => [64u32, 48]
            .iter()
            .any(|prefix| same_v6_network(a, b, *prefix)),
        _ => false,
    }
}

fn same_v4_network(a: Ipv4Addr, b: Ipv4Addr, prefix: u32) -> bool {
    let mask = u32::MAX << (32 - prefix);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

fn same_v6_network(a: Ipv6Addr, b: Ipv6Addr, prefix: u32) -> bool {
    let mask = u128::MAX << (128 - prefix);
    (u128::from(a) & mask) == (u128::from(b) & mask)
}

fn is_not_implemented(err: &proxmox_client::Error) -> bool {
    if let proxmox_client::Error::Api(code, _) = err {
        if code.as_u16() == 501 {
            return true;
        }
    }
    err.to_string().to_lowercase().contains("not implemented")
}

fn is_auth_scoped(err: &proxmox_client::Error) -> bool {
    if let proxmox_client::Error::Api(code, _) = err {
        if matches!(code.as_u16(), 401 | 403) {
            return true;
        }
    }
    err.to_string().to_lowercase().contains("permission")
}

fn is_tls_mismatch(err: &Error) -> bool {
    let message = format!("{err:#}").to_lowercase();
    message.contains("fingerprint") || message.contains("x509") || message.contains("certificate")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use pulse_api_types::NodeType;

    use crate::connection::DEFAULT_CLIENT_TIMEOUT;
    use crate::pve_client::NetworkInterface;
    use crate::test_support::{FakePveFactory, PeerBehavior};

    fn base_config(host: &str) -> ClientConfig {
        ClientConfig {
            ty: NodeType::Pve,
            host: host.to_string(),
            user: None,
            password: None,
            token_name: Some("monitor@pam!pulse".to_string()),
            token_value: Some("secret".to_string()),
            fingerprint: None,
            verify_ssl: None,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    fn cluster_row(name: &str) -> ClusterStatusEntry {
        ClusterStatusEntry {
            ty: "cluster".to_string(),
            id: "cluster".to_string(),
            name: Some(name.to_string()),
            nodes: Some(3),
            ..Default::default()
        }
    }

    fn node_row(name: &str, nodeid: i64, ip: &str) -> ClusterStatusEntry {
        ClusterStatusEntry {
            ty: "node".to_string(),
            id: format!("node/{name}"),
            name: Some(name.to_string()),
            nodeid: Some(nodeid),
            ip: Some(ip.to_string()),
            online: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn standalone_when_cluster_status_unsupported() {
        let factory = FakePveFactory::default();
        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();
        assert!(!info.is_cluster);
        assert!(info.endpoints.is_empty());
    }

    #[tokio::test]
    async fn three_node_cluster_with_one_invalid_peer() {
        let mut factory = FakePveFactory {
            cluster_status: vec![
                cluster_row("prod"),
                node_row("px1", 1, "10.0.0.5"),
                node_row("px2", 2, "10.0.0.6"),
                node_row("px3", 3, "10.0.0.7"),
            ],
            ..Default::default()
        };
        factory.peers.insert("10.0.0.5".into(), PeerBehavior::Valid);
        factory
            .peers
            .insert("10.0.0.6".into(), PeerBehavior::AuthScoped);
        factory
            .peers
            .insert("10.0.0.7".into(), PeerBehavior::NotImplemented);
        factory
            .fingerprints
            .insert("10.0.0.5".into(), "aa:bb".into());
        factory
            .fingerprints
            .insert("10.0.0.6".into(), "cc:dd".into());

        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();

        assert!(info.is_cluster);
        assert_eq!(info.cluster_name.as_deref(), Some("prod"));
        // px3 failed validation with a hard error and is dropped
        assert_eq!(info.endpoints.len(), 2);
        assert!(info
            .endpoints
            .iter()
            .all(|endpoint| endpoint.fingerprint.is_some()));
        assert!(info.endpoints.iter().all(|endpoint| endpoint.online));
        // hosts are name based for TLS SAN matching
        assert_eq!(info.endpoints[0].host, "https://px1:8006");
    }

    #[tokio::test]
    async fn tls_mismatch_is_retried_without_verification() {
        let mut factory = FakePveFactory {
            cluster_status: vec![
                cluster_row("prod"),
                node_row("px1", 1, "10.0.0.5"),
                node_row("px2", 2, "10.0.0.6"),
            ],
            ..Default::default()
        };
        factory.peers.insert("10.0.0.5".into(), PeerBehavior::Valid);
        factory
            .peers
            .insert("10.0.0.6".into(), PeerBehavior::TlsMismatchThenValid);

        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();

        assert_eq!(info.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn metadata_fallback_when_no_peer_validates() {
        let mut factory = FakePveFactory {
            cluster_status: vec![
                cluster_row(""),
                node_row("px1", 1, "10.0.0.5"),
                node_row("px2", 2, "10.0.0.6"),
            ],
            ..Default::default()
        };
        factory
            .peers
            .insert("10.0.0.5".into(), PeerBehavior::Unreachable);
        factory
            .peers
            .insert("10.0.0.6".into(), PeerBehavior::Unreachable);

        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();

        assert!(info.is_cluster);
        assert_eq!(info.cluster_name.as_deref(), Some("Unknown Cluster"));
        assert_eq!(info.endpoints.len(), 2);
        assert!(info.endpoints.iter().all(|endpoint| !endpoint.online));
    }

    #[tokio::test]
    async fn subnet_preference_selects_management_ip() {
        let mut factory = FakePveFactory {
            cluster_status: vec![
                cluster_row("prod"),
                node_row("px1", 1, "10.0.0.5"),
                node_row("px2", 2, "192.168.100.2"),
            ],
            ..Default::default()
        };
        factory.peers.insert("10.0.0.5".into(), PeerBehavior::Valid);
        factory
            .peers
            .insert("192.168.100.2".into(), PeerBehavior::Valid);
        factory.interfaces.insert(
            "px2".to_string(),
            vec![
                NetworkInterface {
                    iface: "vmbr1".to_string(),
                    address: Some("192.168.100.2".to_string()),
                    active: Some(1),
                    ..Default::default()
                },
                NetworkInterface {
                    iface: "vmbr0".to_string(),
                    address: Some("10.0.0.7".to_string()),
                    active: Some(1),
                    ..Default::default()
                },
            ],
        );

        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();

        let px2 = info
            .endpoints
            .iter()
            .find(|endpoint| endpoint.node_name == "px2")
            .unwrap();
        assert_eq!(px2.ip, "192.168.100.2");
        assert_eq!(px2.ip_override.as_deref(), Some("10.0.0.7"));
        assert_eq!(px2.effective_ip(), "10.0.0.7");

        // px1 sits on the connection network already
        let px1 = info
            .endpoints
            .iter()
            .find(|endpoint| endpoint.node_name == "px1")
            .unwrap();
        assert_eq!(px1.ip_override, None);
    }

    #[tokio::test]
    async fn user_overrides_survive_refresh() {
        let mut factory = FakePveFactory {
            cluster_status: vec![
                cluster_row("prod"),
                node_row("px1", 1, "10.0.0.5"),
                node_row("px2", 2, "10.0.0.6"),
            ],
            ..Default::default()
        };
        factory.peers.insert("10.0.0.5".into(), PeerBehavior::Valid);
        factory.peers.insert("10.0.0.6".into(), PeerBehavior::Valid);

        let existing = vec![ClusterEndpoint {
            node_id: "2".to_string(),
            node_name: "px2".to_string(),
            host: "https://px2:8006".to_string(),
            ip: "10.0.0.6".to_string(),
            ip_override: Some("172.16.0.6".to_string()),
            fingerprint: None,
            guest_url: Some("https://px2.example.com".to_string()),
            online: true,
            last_seen: None,
            temperature_proxy_control_token: None,
        }];

        let config = base_config("https://10.0.0.5:8006");
        let first = detect_pve_cluster_with(&factory, &config, "px1", &existing)
            .await
            .unwrap();
        let second = detect_pve_cluster_with(&factory, &config, "px1", &first.endpoints)
            .await
            .unwrap();

        let names = |info: &ClusterInfo| {
            let mut names: Vec<String> = info
                .endpoints
                .iter()
                .map(|endpoint| endpoint.node_name.clone())
                .collect();
            names.sort();
            names
        };
        assert_eq!(names(&first), names(&second));

        let px2 = second
            .endpoints
            .iter()
            .find(|endpoint| endpoint.node_name == "px2")
            .unwrap();
        assert_eq!(px2.ip_override.as_deref(), Some("172.16.0.6"));
        assert_eq!(px2.guest_url.as_deref(), Some("https://px2.example.com"));
    }

    #[tokio::test]
    async fn single_node_reply_is_standalone() {
        let factory = FakePveFactory {
            cluster_status: vec![cluster_row("solo"), node_row("px1", 1, "10.0.0.5")],
            peers: HashMap::new(),
            interfaces: HashMap::new(),
            fingerprints: HashMap::new(),
        };

        let info = detect_pve_cluster_with(&factory, &base_config("https://10.0.0.5:8006"), "px1", &[])
            .await
            .unwrap();
        assert!(!info.is_cluster);
    }

    #[test]
    fn network_mask_ladder() {
        let conn: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(same_network(conn, "10.0.0.200".parse().unwrap()));
        assert!(same_network(conn, "10.0.15.7".parse().unwrap()));
        assert!(same_network(conn, "10.0.200.7".parse().unwrap()));
        assert!(!same_network(conn, "192.168.100.2".parse().unwrap()));
        assert!(!same_network(conn, "fd00::1".parse().unwrap()));

        let conn6: IpAddr = "fd00:1:2:3::5".parse().unwrap();
        assert!(same_network(conn6, "fd00:1:2:3::9".parse().unwrap()));
        assert!(same_network(conn6, "fd00:1:2:ffff::9".parse().unwrap()));
        assert!(!same_network(conn6, "fd00:2:3:4::9".parse().unwrap()));
    }

    #[test]
    fn error_classification() {
        let not_impl = proxmox_client::Error::Api(
            http::StatusCode::NOT_IMPLEMENTED,
            "not implemented".to_string(),
        );
        assert!(is_not_implemented(&not_impl));

        let forbidden =
            proxmox_client::Error::Api(http::StatusCode::FORBIDDEN, "permission denied".into());
        assert!(is_auth_scoped(&forbidden));
        assert!(!is_auth_scoped(&not_impl));

        let tls = anyhow::format_err!("certificate fingerprint mismatch");
        assert!(is_tls_mismatch(&tls));
    }

    #[test]
    fn cooldown_window() {
        let cooldown = DetectionCooldown::default();
        assert!(cooldown.try_acquire("pve-a"));
        assert!(!cooldown.try_acquire("pve-a"));
        assert!(cooldown.try_acquire("pve-b"));
        cooldown.forget("pve-a");
        assert!(cooldown.try_acquire("pve-a"));
    }
}
