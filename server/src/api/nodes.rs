//! Node inventory management.
//!
//! CRUD over the three typed node lists plus connection tests and cluster
//! topology refresh. Wire level node ids are positional (`pve-0`); they are
//! derived from the name-sorted per-type lists at serialization time and
//! invalidated by every mutation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use serde_json::{json, Value};

use proxmox_router::{
    http_bail, list_subdirs_api_method, Permission, Router, RpcEnvironment, SubdirMap,
};
use proxmox_schema::api;
use proxmox_section_config::typed::SectionConfigData;
use proxmox_sortable_macro::sortable;

use pulse_api_types::{
    wire_node_id, ClusterEndpoint, ConfigDigest, NodeEntry, NodeType, NodesResponse, PbsNodeItem,
    PmgNodeItem, PveInstance, PveInstanceUpdater, PveNodeItem, PbsInstance, PbsInstanceUpdater,
    PmgInstance, PmgInstanceUpdater,
};

use crate::cluster::{self, DetectionCooldown};
use crate::connection::{self, ClientConfig};
use crate::monitor::node_status;
use crate::tenant::{lookup_tenant, TenantState};
use crate::ws::{WsMessage, DISCOVERY_UPDATE, NODE_DELETED};

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_LIST_NODES)
    .post(&API_METHOD_ADD_NODE)
    .match_all("id", &ITEM_ROUTER);

// Note: `POST /config/nodes/test` (testing an unsaved configuration) also
// resolves here, with the literal `test` as the id; the handler does not
// use the id at all.
const ITEM_ROUTER: Router = Router::new()
    .put(&API_METHOD_UPDATE_NODE)
    .post(&API_METHOD_TEST_NODE_CONFIG)
    .delete(&API_METHOD_DELETE_NODE)
    .get(&list_subdirs_api_method!(ITEM_SUBDIRS))
    .subdirs(ITEM_SUBDIRS);

#[sortable]
const ITEM_SUBDIRS: SubdirMap = &sorted!([
    (
        "refresh-cluster",
        &Router::new().post(&API_METHOD_REFRESH_CLUSTER)
    ),
    ("test", &Router::new().get(&API_METHOD_TEST_EXISTING_NODE)),
]);

/// Hosts and names matched against these prefixes skip cluster detection.
const DETECTION_SKIP_PATTERNS: &[&str] =
    &["192.168.77.", "192.168.88.", "test-", "persist-", "concurrent-"];

/// Message returned for any upstream connection problem; the details only
/// go to the log.
const CONNECT_FAILED_MSG: &str = "Connection failed, check host, credentials and TLS settings";
const CLIENT_INIT_FAILED_MSG: &str = "Failed to initialize connection";

#[api(
    access: {
        permission: &Permission::Anybody,
    },
    returns: { type: NodesResponse },
)]
/// List the complete node inventory of the tenant.
pub async fn list_nodes(rpcenv: &mut dyn RpcEnvironment) -> Result<NodesResponse, Error> {
    let tenant = lookup_tenant(rpcenv)?;

    let (_, digest) = tenant.nodes.config()?;
    rpcenv["digest"] = digest.to_hex().into();

    do_list_nodes(&tenant)
}

pub fn do_list_nodes(tenant: &Arc<TenantState>) -> Result<NodesResponse, Error> {
    let (data, _digest) = tenant.nodes.config()?;
    let inventory = Inventory::from(data);

    let statuses = |monitoring_id: &str| -> String {
        node_status(tenant.monitor.as_ref(), &tenant.org_id, monitoring_id)
    };

    let pve = inventory
        .pve
        .iter()
        .enumerate()
        .map(|(index, instance)| PveNodeItem {
            id: wire_node_id(NodeType::Pve, index),
            status: statuses(&format!("pve-{}", instance.name)),
            config: instance.redacted(),
        })
        .collect();

    let pbs = inventory
        .pbs
        .iter()
        .enumerate()
        .map(|(index, instance)| PbsNodeItem {
            id: wire_node_id(NodeType::Pbs, index),
            status: statuses(&format!("pbs-{}", instance.name)),
            config: instance.redacted(),
        })
        .collect();

    let pmg = inventory
        .pmg
        .iter()
        .enumerate()
        .map(|(index, instance)| PmgNodeItem {
            id: wire_node_id(NodeType::Pmg, index),
            status: statuses(&format!("pmg-{}", instance.name)),
            config: instance.redacted(),
        })
        .collect();

    // opportunistic, cooldown-limited topology refresh in the background
    for instance in &inventory.pve {
        if skip_cluster_detection(&instance.host, &instance.name) {
            continue;
        }
        if DetectionCooldown::get().try_acquire(&instance.id) {
            let tenant = Arc::clone(tenant);
            let stable_id = instance.id.clone();
            tokio::spawn(async move {
                if let Err(err) = refresh_cluster_topology(&tenant, &stable_id).await {
                    log::debug!("opportunistic cluster refresh failed - {err:#}");
                }
            });
        }
    }

    Ok(NodesResponse { pve, pbs, pmg })
}

#[api(
    input: {
        properties: {
            "type": { type: NodeType },
            config: {
                type: Object,
                description: "The instance configuration.",
                additional_properties: true,
                properties: {},
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Add a node to the inventory.
pub async fn add_node(
    r#type: NodeType,
    config: Value,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_add_node(&tenant, r#type, config).await
}

pub async fn do_add_node(
    tenant: &Arc<TenantState>,
    ty: NodeType,
    config: Value,
) -> Result<Value, Error> {
    check_mock_mode(tenant)?;

    let mut entry = parse_new_entry(ty, config)?;

    validate_credentials(&entry)?;

    let name = entry.name().to_string();
    let duplicate = |entries: &[(String, NodeEntry)]| {
        entries.iter().any(|(_, existing)| {
            existing.node_type() == ty && existing.name().eq_ignore_ascii_case(&name)
        })
    };

    {
        let (data, _digest) = tenant.nodes.config()?;
        let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
        if duplicate(&entries) {
            http_bail!(CONFLICT, "a {ty} node named {name:?} already exists");
        }
    }

    // inline topology detection, before taking the config lock
    if let NodeEntry::Pve(pve) = &mut entry {
        if !skip_cluster_detection(&pve.host, &pve.name) {
            apply_cluster_detection(pve, &[]).await;
        }
    }

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    if duplicate(&entries) {
        http_bail!(CONFLICT, "a {ty} node named {name:?} already exists");
    }

    let stable_id = entry.id().to_string();
    entries.push((stable_id, entry));
    save_entries(tenant, entries)?;

    schedule_monitor_reload(tenant);

    Ok(json!({ "status": "success" }))
}

#[api(
    input: {
        properties: {
            id: {
                type: String,
                description: "Positional node id (`<type>-<index>`).",
            },
            config: {
                type: Object,
                description: "The fields to change.",
                additional_properties: true,
                properties: {},
            },
            digest: {
                optional: true,
                type: ConfigDigest,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Update a node.
///
/// Credentials are only switched when the opposite method's secret is
/// explicitly supplied; everything else is preserved.
pub async fn update_node(
    id: String,
    config: Value,
    digest: Option<ConfigDigest>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_update_node(&tenant, &id, config, digest).await
}

pub async fn do_update_node(
    tenant: &Arc<TenantState>,
    id: &str,
    config: Value,
    digest: Option<ConfigDigest>,
) -> Result<Value, Error> {
    check_mock_mode(tenant)?;

    let _lock = tenant.nodes.lock_config()?;
    let (data, current_digest) = tenant.nodes.config()?;
    current_digest.detect_modification(digest.as_ref())?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let stable_id = resolve_wire_id(&entries, id)?;
    let names = entries_names(&entries);
    let slot = entries
        .iter_mut()
        .find(|(key, _)| *key == stable_id)
        .map(|(_, entry)| entry)
        .ok_or_else(|| format_err!("node {id} vanished"))?;

    let old_monitoring_id = slot.monitoring_id();

    match slot {
        NodeEntry::Pve(pve) => apply_pve_update(pve, config, &names)?,
        NodeEntry::Pbs(pbs) => apply_pbs_update(pbs, config, &names)?,
        NodeEntry::Pmg(pmg) => apply_pmg_update(pmg, config, &names)?,
    }

    let new_monitoring_id = slot.monitoring_id();

    // re-anchor alert overrides so a rename does not orphan them
    let alert_manager = tenant.monitor.alert_manager();
    let overrides = alert_manager
        .overrides(&stable_id)
        .or_else(|| alert_manager.overrides(&old_monitoring_id));

    save_entries(tenant, entries)?;

    if let Some(overrides) = overrides {
        if let Err(err) = alert_manager.set_overrides(&stable_id, overrides.clone()) {
            log::error!("unable to keep alert overrides for {stable_id} - {err:#}");
        }
        if old_monitoring_id != new_monitoring_id {
            alert_manager.remove_overrides(&old_monitoring_id);
            if let Err(err) = alert_manager.set_overrides(&new_monitoring_id, overrides) {
                log::error!("unable to move alert overrides to {new_monitoring_id} - {err:#}");
            }
        }
    }

    tenant.discovery.force_refresh();
    schedule_discovery_broadcast(tenant, Duration::from_secs(2));
    schedule_monitor_reload(tenant);

    Ok(json!({ "status": "success" }))
}

#[api(
    input: {
        properties: {
            id: {
                type: String,
                description: "Positional node id (`<type>-<index>`).",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Remove a node from the inventory.
pub async fn delete_node(id: String, rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_delete_node(&tenant, &id).await
}

pub async fn do_delete_node(tenant: &Arc<TenantState>, id: &str) -> Result<Value, Error> {
    check_mock_mode(tenant)?;

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let stable_id = resolve_wire_id(&entries, id)?;
    let position = entries
        .iter()
        .position(|(key, _)| *key == stable_id)
        .ok_or_else(|| format_err!("node {id} vanished"))?;
    let (_, removed) = entries.remove(position);

    let ty = removed.node_type();
    let name = removed.name().to_string();
    let host = removed.host().to_string();

    // an empty inventory is still persisted
    save_entries(tenant, entries)?;
    DetectionCooldown::get().forget(&stable_id);

    schedule_monitor_reload(tenant);

    tenant.broadcaster.broadcast(WsMessage::new(
        NODE_DELETED,
        json!({ "type": ty, "name": name, "host": host.clone() }),
    ));

    {
        let tenant = Arc::clone(tenant);
        tokio::spawn(async move {
            tenant.discovery.force_refresh();
        });
    }

    if ty == NodeType::Pve {
        // best effort cleanup of the host side sensor proxy
        tokio::spawn(async move {
            if let Err(err) = crate::sensor_proxy::cleanup_host(&host).await {
                log::debug!("sensor proxy cleanup for {host} failed - {err:#}");
            }
        });
    }

    Ok(json!({ "status": "success" }))
}

#[api(
    input: {
        properties: {
            id: {
                type: String,
                description: "Ignored; present for routing reasons.",
            },
            "type": { type: NodeType },
            config: {
                type: Object,
                description: "The instance configuration to test.",
                additional_properties: true,
                properties: {},
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Test an unsaved node configuration by probing its API version.
pub async fn test_node_config(
    id: String,
    r#type: NodeType,
    config: Value,
    _rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let _ = id;
    let entry = parse_new_entry(r#type, config)?;
    validate_credentials(&entry)?;
    Ok(run_connection_test(&client_config_for(&entry)).await)
}

#[api(
    input: {
        properties: {
            id: {
                type: String,
                description: "Positional node id (`<type>-<index>`).",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Test a saved node by probing its API version.
pub async fn test_existing_node(
    id: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;

    let (data, _digest) = tenant.nodes.config()?;
    let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    let stable_id = resolve_wire_id(&entries, &id)?;
    let entry = entries
        .into_iter()
        .find(|(key, _)| *key == stable_id)
        .map(|(_, entry)| entry)
        .ok_or_else(|| format_err!("node {id} vanished"))?;

    Ok(run_connection_test(&client_config_for(&entry)).await)
}

#[api(
    input: {
        properties: {
            id: {
                type: String,
                description: "Positional node id (`pve-<index>`).",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Re-run cluster topology detection for a PVE node.
pub async fn refresh_cluster(id: String, rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_refresh_cluster(&tenant, &id).await
}

pub async fn do_refresh_cluster(tenant: &Arc<TenantState>, id: &str) -> Result<Value, Error> {
    let (data, _digest) = tenant.nodes.config()?;
    let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    let stable_id = resolve_wire_id(&entries, id)?;

    match entries.into_iter().find(|(key, _)| *key == stable_id) {
        Some((_, NodeEntry::Pve(_))) => {}
        Some(_) => http_bail!(BAD_REQUEST, "node {id} is not a PVE node"),
        None => http_bail!(NOT_FOUND, "no such node {id:?}"),
    }

    match refresh_cluster_topology(tenant, &stable_id).await {
        Ok(info) => Ok(json!({
            "status": "success",
            "is-cluster": info.is_cluster,
            "cluster-name": info.cluster_name,
            "endpoints": info.endpoints.len(),
        })),
        Err(err) => {
            log::error!("cluster refresh for {id} failed - {err:#}");
            http_bail!(BAD_REQUEST, "{}", CONNECT_FAILED_MSG);
        }
    }
}

/// Detect the topology of one stored PVE instance and persist the outcome.
///
/// Detection failure keeps the previously stored endpoints; they are a
/// cache, not the truth.
pub async fn refresh_cluster_topology(
    tenant: &Arc<TenantState>,
    stable_id: &str,
) -> Result<cluster::ClusterInfo, Error> {
    let (data, _digest) = tenant.nodes.config()?;
    let pve = match data.get(stable_id) {
        Some(NodeEntry::Pve(pve)) => pve.clone(),
        _ => return Err(format_err!("no PVE instance with id {stable_id}")),
    };

    let existing: Vec<ClusterEndpoint> = pve
        .cluster_endpoints
        .iter()
        .map(|endpoint| (**endpoint).clone())
        .collect();

    let info =
        cluster::detect_pve_cluster(&ClientConfig::from_pve(&pve), &pve.name, &existing).await?;

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    if let Some((_, NodeEntry::Pve(stored))) = entries
        .iter_mut()
        .find(|(key, _)| key.as_str() == stable_id)
    {
        apply_cluster_info(stored, &info);
        save_entries(tenant, entries)?;
    }

    Ok(info)
}

// ---- helpers ----

/// The inventory partitioned into its three name-sorted typed lists.
struct Inventory {
    pve: Vec<PveInstance>,
    pbs: Vec<PbsInstance>,
    pmg: Vec<PmgInstance>,
}

impl From<SectionConfigData<NodeEntry>> for Inventory {
    fn from(data: SectionConfigData<NodeEntry>) -> Self {
        let mut pve = Vec::new();
        let mut pbs = Vec::new();
        let mut pmg = Vec::new();
        for (_, entry) in data {
            match entry {
                NodeEntry::Pve(instance) => pve.push(instance),
                NodeEntry::Pbs(instance) => pbs.push(instance),
                NodeEntry::Pmg(instance) => pmg.push(instance),
            }
        }
        pve.sort_by(|a, b| a.name.cmp(&b.name));
        pbs.sort_by(|a, b| a.name.cmp(&b.name));
        pmg.sort_by(|a, b| a.name.cmp(&b.name));
        Self { pve, pbs, pmg }
    }
}

/// Map a positional wire id onto the stable section key.
fn resolve_wire_id(entries: &[(String, NodeEntry)], id: &str) -> Result<String, Error> {
    let (ty, index) = match pulse_api_types::parse_wire_node_id(id) {
        Some(parsed) => parsed,
        None => http_bail!(BAD_REQUEST, "malformed node id {id:?}"),
    };

    let mut keyed: Vec<(&str, &str)> = entries
        .iter()
        .filter(|(_, entry)| entry.node_type() == ty)
        .map(|(key, entry)| (entry.name(), key.as_str()))
        .collect();
    keyed.sort();

    match keyed.get(index) {
        Some((_, key)) => Ok(key.to_string()),
        None => http_bail!(NOT_FOUND, "no such node {id:?}"),
    }
}

fn check_mock_mode(tenant: &TenantState) -> Result<(), Error> {
    if tenant.monitor.mock_mode() {
        http_bail!(FORBIDDEN, "node management is disabled while mock mode is active");
    }
    Ok(())
}

/// Parse a new entry from the request body, normalize its host and user and
/// give it a stable id.
fn parse_new_entry(ty: NodeType, config: Value) -> Result<NodeEntry, Error> {
    let mut entry = match ty {
        NodeType::Pve => NodeEntry::Pve(parse_instance(config)?),
        NodeType::Pbs => NodeEntry::Pbs(parse_instance(config)?),
        NodeType::Pmg => NodeEntry::Pmg(parse_instance(config)?),
    };

    macro_rules! fixup {
        ($instance:expr) => {{
            let instance = $instance;
            if instance.name.trim().is_empty() {
                http_bail!(BAD_REQUEST, "node name must not be empty");
            }
            instance.host = normalize(&instance.host, ty)?;
            if instance.password.is_some() {
                if let Some(user) = instance.user.take() {
                    instance.user = Some(if user.contains('@') {
                        user
                    } else {
                        format!("{user}@{}", ty.default_realm())
                    });
                }
            }
            instance.id = format!("{:x}", proxmox_uuid::Uuid::generate());
        }};
    }

    match &mut entry {
        NodeEntry::Pve(pve) => fixup!(pve),
        NodeEntry::Pbs(pbs) => fixup!(pbs),
        NodeEntry::Pmg(pmg) => fixup!(pmg),
    }

    Ok(entry)
}

fn parse_instance<T: serde::de::DeserializeOwned>(config: Value) -> Result<T, Error> {
    serde_json::from_value(config)
        .map_err(|err| proxmox_router::http_err!(BAD_REQUEST, "invalid node configuration - {err}"))
}

fn normalize(host: &str, ty: NodeType) -> Result<String, Error> {
    crate::normalize::normalize_host(host, ty)
        .map_err(|err| proxmox_router::http_err!(BAD_REQUEST, "{}", err.code()))
}

fn validate_credentials(entry: &NodeEntry) -> Result<(), Error> {
    let ok = match entry {
        NodeEntry::Pve(pve) => pve.has_credentials(),
        NodeEntry::Pbs(pbs) => pbs.has_credentials(),
        NodeEntry::Pmg(pmg) => pmg.has_credentials(),
    };
    if !ok {
        http_bail!(BAD_REQUEST, "either a password or an API token is required");
    }
    Ok(())
}

fn entries_names(entries: &[(String, NodeEntry)]) -> Vec<(NodeType, String)> {
    entries
        .iter()
        .map(|(_, entry)| (entry.node_type(), entry.name().to_string()))
        .collect()
}

fn check_rename(
    ty: NodeType,
    old_name: &str,
    new_name: &str,
    names: &[(NodeType, String)],
) -> Result<(), Error> {
    if new_name.trim().is_empty() {
        http_bail!(BAD_REQUEST, "node name must not be empty");
    }
    if !old_name.eq_ignore_ascii_case(new_name)
        && names
            .iter()
            .any(|(t, n)| *t == ty && n.eq_ignore_ascii_case(new_name))
    {
        http_bail!(CONFLICT, "a {ty} node named {new_name:?} already exists");
    }
    Ok(())
}

/// Non-empty explicit value, the signal for an auth method switch.
fn supplied(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

macro_rules! apply_common_update {
    ($instance:expr, $updater:expr, $ty:expr, $names:expr) => {{
        let instance = $instance;
        let updater = &$updater;

        if let Some(name) = updater.name.clone() {
            check_rename($ty, &instance.name, &name, $names)?;
            instance.name = name;
        }
        if let Some(host) = updater.host.as_deref() {
            instance.host = normalize(host, $ty)?;
        }

        // switching the auth method clears the opposite pair; anything not
        // explicitly supplied is preserved
        if let Some(password) = supplied(&updater.password) {
            let user = supplied(&updater.user)
                .map(str::to_string)
                .or_else(|| instance.user.clone());
            let user = match user {
                Some(user) if user.contains('@') => user,
                Some(user) => format!("{user}@{}", $ty.default_realm()),
                None => http_bail!(BAD_REQUEST, "password auth requires a user"),
            };
            instance.set_password_auth(user, password.to_string());
        } else if let Some(token_value) = supplied(&updater.token_value) {
            let token_name = match supplied(&updater.token_name)
                .map(str::to_string)
                .or_else(|| instance.token_name.clone())
            {
                Some(token_name) => token_name,
                None => http_bail!(BAD_REQUEST, "token auth requires a token id"),
            };
            instance.set_token_auth(token_name, token_value.to_string());
        } else {
            if let Some(user) = supplied(&updater.user) {
                instance.user = Some(user.to_string());
            }
            if let Some(token_name) = supplied(&updater.token_name) {
                instance.token_name = Some(token_name.to_string());
            }
        }

        if let Some(fingerprint) = updater.fingerprint.clone() {
            instance.fingerprint = (!fingerprint.is_empty()).then_some(fingerprint);
        }
        if let Some(verify_ssl) = updater.verify_ssl {
            instance.verify_ssl = Some(verify_ssl);
        }
    }};
}

fn apply_pve_update(
    pve: &mut PveInstance,
    config: Value,
    names: &[(NodeType, String)],
) -> Result<(), Error> {
    let updater: PveInstanceUpdater = parse_instance(config)?;

    if updater.guest_url.is_some() {
        pve.guest_url = updater.guest_url.clone();
    }
    if let Some(monitor_vms) = updater.monitor_vms {
        pve.monitor_vms = monitor_vms;
    }
    if let Some(monitor_containers) = updater.monitor_containers {
        pve.monitor_containers = monitor_containers;
    }
    if let Some(monitor_storage) = updater.monitor_storage {
        pve.monitor_storage = monitor_storage;
    }
    if let Some(monitor_backups) = updater.monitor_backups {
        pve.monitor_backups = monitor_backups;
    }
    if updater.monitor_physical_disks.is_some() {
        pve.monitor_physical_disks = updater.monitor_physical_disks;
    }
    if updater.physical_disk_polling_minutes.is_some() {
        pve.physical_disk_polling_minutes = updater.physical_disk_polling_minutes;
    }
    if updater.temperature_monitoring_enabled.is_some() {
        pve.temperature_monitoring_enabled = updater.temperature_monitoring_enabled;
    }

    apply_common_update!(pve, updater, NodeType::Pve, names);
    Ok(())
}

fn apply_pbs_update(
    pbs: &mut PbsInstance,
    config: Value,
    names: &[(NodeType, String)],
) -> Result<(), Error> {
    let updater: PbsInstanceUpdater = parse_instance(config)?;

    if let Some(monitor_backups) = updater.monitor_backups {
        pbs.monitor_backups = monitor_backups;
    }
    if let Some(monitor_datastores) = updater.monitor_datastores {
        pbs.monitor_datastores = monitor_datastores;
    }
    if let Some(monitor_sync_jobs) = updater.monitor_sync_jobs {
        pbs.monitor_sync_jobs = monitor_sync_jobs;
    }
    if let Some(monitor_verify_jobs) = updater.monitor_verify_jobs {
        pbs.monitor_verify_jobs = monitor_verify_jobs;
    }
    if let Some(monitor_prune_jobs) = updater.monitor_prune_jobs {
        pbs.monitor_prune_jobs = monitor_prune_jobs;
    }
    if let Some(monitor_garbage_jobs) = updater.monitor_garbage_jobs {
        pbs.monitor_garbage_jobs = monitor_garbage_jobs;
    }
    if let Some(exclude) = updater.exclude_datastores.clone() {
        pbs.exclude_datastores = exclude;
    }

    apply_common_update!(pbs, updater, NodeType::Pbs, names);
    Ok(())
}

fn apply_pmg_update(
    pmg: &mut PmgInstance,
    config: Value,
    names: &[(NodeType, String)],
) -> Result<(), Error> {
    let updater: PmgInstanceUpdater = parse_instance(config)?;

    if let Some(monitor_mail_stats) = updater.monitor_mail_stats {
        pmg.monitor_mail_stats = monitor_mail_stats;
    }
    if let Some(monitor_queues) = updater.monitor_queues {
        pmg.monitor_queues = monitor_queues;
    }
    if let Some(monitor_quarantine) = updater.monitor_quarantine {
        pmg.monitor_quarantine = monitor_quarantine;
    }
    if let Some(monitor_domain_stats) = updater.monitor_domain_stats {
        pmg.monitor_domain_stats = monitor_domain_stats;
    }

    apply_common_update!(pmg, updater, NodeType::Pmg, names);
    Ok(())
}

fn save_entries(tenant: &TenantState, entries: Vec<(String, NodeEntry)>) -> Result<(), Error> {
    let mut data = SectionConfigData::default();
    for (key, entry) in entries {
        data.insert(key, entry);
    }
    tenant.nodes.save_config(&data).map_err(|err| {
        log::error!("unable to persist node inventory - {err:#}");
        proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "failed to save configuration")
    })
}

pub(crate) fn skip_cluster_detection(host: &str, name: &str) -> bool {
    let host = crate::normalize::host_part(host);
    DETECTION_SKIP_PATTERNS
        .iter()
        .any(|pattern| host.starts_with(pattern) || name.starts_with(pattern))
}

/// Run detection for a new instance and record the outcome; purely best
/// effort, a failure leaves the entry standalone.
pub(crate) async fn apply_cluster_detection(pve: &mut PveInstance, existing: &[ClusterEndpoint]) {
    match cluster::detect_pve_cluster(&ClientConfig::from_pve(pve), &pve.name, existing).await {
        Ok(info) => apply_cluster_info(pve, &info),
        Err(err) => {
            log::warn!("cluster detection for {} failed - {err:#}", pve.name);
        }
    }
}

fn apply_cluster_info(pve: &mut PveInstance, info: &cluster::ClusterInfo) {
    if !info.is_cluster {
        pve.is_cluster = false;
        pve.cluster_name = None;
        pve.cluster_endpoints.clear();
        return;
    }

    pve.is_cluster = true;
    pve.cluster_name = info.cluster_name.clone();
    pve.cluster_endpoints = info
        .endpoints
        .iter()
        .map(|endpoint| proxmox_schema::property_string::PropertyString::new(endpoint.clone()))
        .collect();
}

fn client_config_for(entry: &NodeEntry) -> ClientConfig {
    match entry {
        NodeEntry::Pve(pve) => ClientConfig::from_pve(pve),
        NodeEntry::Pbs(pbs) => ClientConfig::from_pbs(pbs),
        NodeEntry::Pmg(pmg) => ClientConfig::from_pmg(pmg),
    }
}

/// Probe a node's `version` endpoint; all error details stay in the log.
async fn run_connection_test(config: &ClientConfig) -> Value {
    let started = std::time::Instant::now();
    let result = version_probe(config).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(version) => json!({
            "status": "success",
            "message": format!("Connection successful (version {})", version.version),
            "latency_ms": latency_ms,
        }),
        Err(err) => {
            log::error!("connection test for {} failed - {err:#}", config.host);
            json!({
                "status": "error",
                "message": sanitize_connect_error(&err),
                "latency_ms": latency_ms,
            })
        }
    }
}

fn sanitize_connect_error(err: &Error) -> &'static str {
    let message = format!("{err:#}").to_lowercase();
    if message.contains("no token configured") || message.contains("no credentials") {
        CLIENT_INIT_FAILED_MSG
    } else {
        CONNECT_FAILED_MSG
    }
}

async fn version_probe(config: &ClientConfig) -> Result<crate::pve_client::VersionInfo, Error> {
    let has_token = config
        .token_value
        .as_deref()
        .is_some_and(|token| !token.is_empty());

    let probe = async {
        match config.ty {
            NodeType::Pve => {
                let client = if has_token {
                    connection::make_pve_client(config)?
                } else {
                    connection::make_pve_client_and_login(config).await?
                };
                Ok::<_, Error>(client.version().await?)
            }
            NodeType::Pbs => {
                let client = if has_token {
                    connection::make_pbs_client(config)?
                } else {
                    connection::make_pbs_client_and_login(config).await?
                };
                Ok(client.version().await?)
            }
            NodeType::Pmg => {
                let client = if has_token {
                    connection::make_pmg_client(config)?
                } else {
                    connection::make_pmg_client_and_login(config).await?
                };
                Ok(client.version().await?)
            }
        }
    };

    tokio::time::timeout(config.timeout, probe)
        .await
        .map_err(|_| format_err!("connection test timed out"))?
}

pub(crate) fn schedule_monitor_reload(tenant: &Arc<TenantState>) {
    let tenant = Arc::clone(tenant);
    tokio::spawn(async move {
        if let Err(err) = tenant.monitor.reload().await {
            log::error!("monitor reload failed - {err:#}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::StatusCode;
    use proxmox_router::HttpError;

    use crate::test_support::{init_fake_client_factory, make_test_tenant};

    fn token_body(name: &str, host: &str) -> Value {
        json!({
            "name": name,
            "host": host,
            "token-name": "monitor@pam!pulse",
            "token-value": "secret",
            "verify-ssl": false,
        })
    }

    fn status_of(err: &Error) -> Option<StatusCode> {
        err.downcast_ref::<HttpError>().map(|http| http.code)
    }

    #[tokio::test]
    async fn add_normalizes_host_and_derives_wire_ids() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pve, token_body("px1", "10.1.1.5"))
            .await
            .unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        assert_eq!(response.pve.len(), 1);
        assert_eq!(response.pve[0].id, "pve-0");

        let config = &response.pve[0].config;
        assert_eq!(config.host, "https://10.1.1.5:8006");
        assert!(!config.is_cluster);
        // secrets never leave redacted
        assert_eq!(config.token_value.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pbs, token_body("backup", "10.1.1.10"))
            .await
            .unwrap();
        let err = do_add_node(&test.tenant, NodeType::Pbs, token_body("backup", "10.1.1.11"))
            .await
            .unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::CONFLICT));

        // the same name on another node type is fine
        do_add_node(&test.tenant, NodeType::Pve, token_body("backup", "10.1.1.12"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_requires_credentials() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let err = do_add_node(
            &test.tenant,
            NodeType::Pve,
            json!({ "name": "px1", "host": "10.1.1.5" }),
        )
        .await
        .unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn password_user_gets_default_realm() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pbs,
            json!({ "name": "backup", "host": "10.1.1.10", "user": "monitor", "password": "p" }),
        )
        .await
        .unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        assert_eq!(response.pbs[0].config.user.as_deref(), Some("monitor@pbs"));
    }

    #[tokio::test]
    async fn mock_mode_rejects_mutations() {
        init_fake_client_factory();
        let test = make_test_tenant();
        test.monitor.set_mock_mode(true);

        let err = do_add_node(&test.tenant, NodeType::Pve, token_body("px1", "10.1.1.5"))
            .await
            .unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn auth_method_flip_clears_opposite_secret() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pve,
            json!({ "name": "px1", "host": "10.1.1.5", "user": "root@pam", "password": "p" }),
        )
        .await
        .unwrap();

        do_update_node(
            &test.tenant,
            "pve-0",
            json!({ "token-name": "t", "token-value": "v" }),
            None,
        )
        .await
        .unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        let config = &response.pve[0].config;
        assert_eq!(config.password, None);
        assert_eq!(config.token_name.as_deref(), Some("t"));

        // and back again
        do_update_node(&test.tenant, "pve-0", json!({ "password": "q" }), None)
            .await
            .unwrap();
        let response = do_list_nodes(&test.tenant).unwrap();
        let config = &response.pve[0].config;
        assert_eq!(config.token_name, None);
        assert_eq!(config.token_value, None);
        assert_eq!(config.user.as_deref(), Some("root@pam"));
    }

    #[tokio::test]
    async fn update_without_secrets_preserves_them() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pve, token_body("px1", "10.1.1.5"))
            .await
            .unwrap();

        do_update_node(&test.tenant, "pve-0", json!({ "monitor-vms": false }), None)
            .await
            .unwrap();

        let (data, _) = test.tenant.nodes.config().unwrap();
        let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
        let NodeEntry::Pve(pve) = &entries[0].1 else {
            panic!("expected a pve entry");
        };
        // raw config still holds the secret
        assert_eq!(pve.token_value.as_deref(), Some("secret"));
        assert!(!pve.monitor_vms);
    }

    #[tokio::test]
    async fn rename_moves_alert_overrides() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pbs, token_body("backup", "10.1.1.10"))
            .await
            .unwrap();

        let alert_manager = test.tenant.monitor.alert_manager();
        alert_manager
            .set_overrides("pbs-backup", json!({ "cpu": 99 }))
            .unwrap();

        do_update_node(&test.tenant, "pbs-0", json!({ "name": "vault" }), None)
            .await
            .unwrap();

        assert_eq!(alert_manager.overrides("pbs-backup"), None);
        assert_eq!(
            alert_manager.overrides("pbs-vault"),
            Some(json!({ "cpu": 99 }))
        );
    }

    #[tokio::test]
    async fn delete_persists_empty_list_and_broadcasts() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pve, token_body("px1", "10.1.1.5"))
            .await
            .unwrap();
        do_delete_node(&test.tenant, "pve-0").await.unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        assert!(response.pve.is_empty());
        assert!(test
            .broadcaster
            .message_types()
            .contains(&NODE_DELETED.to_string()));
    }

    #[tokio::test]
    async fn wire_ids_shift_after_delete() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pbs, token_body("alpha", "10.1.1.10"))
            .await
            .unwrap();
        do_add_node(&test.tenant, NodeType::Pbs, token_body("beta", "10.1.1.11"))
            .await
            .unwrap();

        do_delete_node(&test.tenant, "pbs-0").await.unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        assert_eq!(response.pbs.len(), 1);
        assert_eq!(response.pbs[0].id, "pbs-0");
        assert_eq!(response.pbs[0].config.name, "beta");
    }

    #[tokio::test]
    async fn unknown_wire_ids_are_not_found() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let err = do_delete_node(&test.tenant, "pve-0").await.unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::NOT_FOUND));

        let err = do_delete_node(&test.tenant, "qemu-1").await.unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn recently_registered_nodes_report_connected() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(&test.tenant, NodeType::Pve, token_body("px1", "10.1.1.5"))
            .await
            .unwrap();

        crate::monitor::RecentRegistrations::get().mark(&test.tenant.org_id, "pve-px1");
        let response = do_list_nodes(&test.tenant).unwrap();
        assert_eq!(response.pve[0].status, "connected");
    }

    #[test]
    fn skip_patterns() {
        assert!(skip_cluster_detection("https://192.168.77.5:8006", "px1"));
        assert!(skip_cluster_detection("https://10.1.1.5:8006", "test-px1"));
        assert!(!skip_cluster_detection("https://10.1.1.5:8006", "px1"));
    }
}

fn schedule_discovery_broadcast(tenant: &Arc<TenantState>, delay: Duration) {
    let tenant = Arc::clone(tenant);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(cached) = tenant.discovery.cached_result() {
            tenant
                .broadcaster
                .broadcast(WsMessage::new(DISCOVERY_UPDATE, cached));
        }
    });
}
