//! The auto-registration callback.
//!
//! A hypervisor running a generated setup script (or a host side agent)
//! posts its freshly minted API token here. Authentication is either a
//! one-time setup code or one of the long lived API tokens; the host in
//! the request is deliberately *not* checked against the one the code was
//! minted for, since the address the UI showed may differ from the one the
//! script sees.

use std::sync::Arc;

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{http_bail, Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use pulse_api_types::{
    AutoRegisterRequest, AutoRegisterTokenResponse, NodeEntry, NodeSource, NodeType, PbsInstance,
    PmgInstance, PveInstance,
};

use crate::monitor::RecentRegistrations;
use crate::normalize::{host_part, normalize_host};
use crate::setup_code::SetupCodeStore;
use crate::tenant::{lookup_tenant, TenantMap, TenantState};
use crate::ws::{WsMessage, DISCOVERY_UPDATE, NODE_AUTO_REGISTERED};

pub const ROUTER: Router = Router::new().post(&API_METHOD_AUTO_REGISTER);

#[api(
    input: {
        properties: {
            request: {
                flatten: true,
                type: AutoRegisterRequest,
            },
        },
    },
    access: {
        description: "Authenticated by setup code or API token inside the request body.",
        permission: &Permission::World,
    },
)]
/// Register the calling hypervisor as a monitored node.
pub async fn auto_register(
    request: AutoRegisterRequest,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_auto_register(&tenant, request).await
}

pub async fn do_auto_register(
    tenant: &Arc<TenantState>,
    request: AutoRegisterRequest,
) -> Result<Value, Error> {
    let auth_code = match request.auth_code() {
        Some(code) => code.to_string(),
        None => http_bail!(UNAUTHORIZED, "Pulse requires authentication"),
    };

    // precedence: long lived API token, then a fresh setup code
    let tenant = if tenant.api_tokens.matches(&auth_code) {
        Arc::clone(tenant)
    } else {
        match SetupCodeStore::get().consume(&auth_code, request.ty) {
            // the code knows which tenant minted it
            Some(entry) if entry.org_id == tenant.org_id => Arc::clone(tenant),
            Some(entry) => TenantMap::get().resolve(Some(&entry.org_id))?,
            None => http_bail!(UNAUTHORIZED, "Invalid or expired setup code"),
        }
    };

    if request.request_token == Some(true) {
        return secure_register(&tenant, request).await;
    }

    legacy_register(&tenant, request).await
}

/// Legacy path: the script already created the token and sends it along.
async fn legacy_register(
    tenant: &Arc<TenantState>,
    request: AutoRegisterRequest,
) -> Result<Value, Error> {
    let host = match request.host.as_deref().filter(|host| !host.is_empty()) {
        Some(host) => host,
        None => http_bail!(BAD_REQUEST, "host is required"),
    };
    let token_id = match request.token_id.as_deref().filter(|t| !t.is_empty()) {
        Some(token_id) => token_id,
        None => http_bail!(BAD_REQUEST, "tokenId is required"),
    };
    let token_value = match request.token_value.as_deref().filter(|t| !t.is_empty()) {
        Some(token_value) => token_value,
        None => http_bail!(BAD_REQUEST, "tokenValue is required"),
    };

    let ty = request.ty;
    let host = normalize_host(host, ty)
        .map_err(|err| proxmox_router::http_err!(BAD_REQUEST, "{}", err.code()))?;

    let requested_name = request
        .server_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host_part(&host).to_string());

    let (data, _digest) = tenant.nodes.config()?;
    let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    // upsert keyed by the normalized host URL
    let existing = entries
        .iter()
        .find(|(_, entry)| entry.node_type() == ty && entry.host() == host)
        .map(|(key, _)| key.clone());

    let (stable_id, name, was_update) = match existing {
        Some(stable_id) => {
            let name =
                update_registered_node(tenant, &stable_id, token_id, token_value).await?;
            (stable_id, name, true)
        }
        None => {
            let name = disambiguate_name(&entries, ty, &requested_name, &host);
            let stable_id =
                insert_registered_node(tenant, ty, &name, &host, token_id, token_value).await?;
            (stable_id, name, false)
        }
    };

    let monitoring_id = format!("{ty}-{name}");
    RecentRegistrations::get().mark(&tenant.org_id, &monitoring_id);

    tenant.broadcaster.broadcast(WsMessage::new(
        NODE_AUTO_REGISTERED,
        json!({
            "type": ty,
            "name": name,
            "host": host,
            "updated": was_update,
        }),
    ));

    tenant.discovery.force_refresh();
    if let Some(cached) = tenant.discovery.cached_result() {
        tenant
            .broadcaster
            .broadcast(WsMessage::new(DISCOVERY_UPDATE, cached));
    }

    // reload failures are logged; persistence is not rolled back
    super::nodes::schedule_monitor_reload(tenant);

    log::info!("auto-registered {monitoring_id} ({stable_id})");

    Ok(json!({ "status": "success", "name": name }))
}

/// Update an existing entry in place: the new token replaces whatever
/// authentication was configured.
async fn update_registered_node(
    tenant: &Arc<TenantState>,
    stable_id: &str,
    token_id: &str,
    token_value: &str,
) -> Result<String, Error> {
    // run detection before taking the lock
    let pending_detection = {
        let (data, _digest) = tenant.nodes.config()?;
        match data.get(stable_id) {
            Some(NodeEntry::Pve(pve)) if !pve.is_cluster => {
                let mut probe = pve.clone();
                probe.set_token_auth(token_id.to_string(), token_value.to_string());
                if super::nodes::skip_cluster_detection(&probe.host, &probe.name) {
                    None
                } else {
                    let mut detected = probe.clone();
                    super::nodes::apply_cluster_detection(&mut detected, &[]).await;
                    Some(detected)
                }
            }
            _ => None,
        }
    };

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    let entry = entries
        .iter_mut()
        .find(|(key, _)| key.as_str() == stable_id)
        .map(|(_, entry)| entry)
        .ok_or_else(|| proxmox_router::http_err!(NOT_FOUND, "registered node vanished"))?;

    let name = match entry {
        NodeEntry::Pve(pve) => {
            if let Some(detected) = pending_detection {
                pve.is_cluster = detected.is_cluster;
                pve.cluster_name = detected.cluster_name;
                pve.cluster_endpoints = detected.cluster_endpoints;
            }
            pve.set_token_auth(token_id.to_string(), token_value.to_string());
            pve.source = Some(NodeSource::Script);
            pve.name.clone()
        }
        NodeEntry::Pbs(pbs) => {
            pbs.set_token_auth(token_id.to_string(), token_value.to_string());
            pbs.source = Some(NodeSource::Script);
            pbs.name.clone()
        }
        NodeEntry::Pmg(pmg) => {
            pmg.set_token_auth(token_id.to_string(), token_value.to_string());
            pmg.source = Some(NodeSource::Script);
            pmg.name.clone()
        }
    };

    save(tenant, entries)?;
    Ok(name)
}

async fn insert_registered_node(
    tenant: &Arc<TenantState>,
    ty: NodeType,
    name: &str,
    host: &str,
    token_id: &str,
    token_value: &str,
) -> Result<String, Error> {
    let stable_id = format!("{:x}", proxmox_uuid::Uuid::generate());

    let mut entry = new_registered_entry(ty, &stable_id, name, host, token_id, token_value);

    if let NodeEntry::Pve(pve) = &mut entry {
        if !super::nodes::skip_cluster_detection(&pve.host, &pve.name) {
            super::nodes::apply_cluster_detection(pve, &[]).await;
        }
    }

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
    entries.push((stable_id.clone(), entry));
    save(tenant, entries)?;

    Ok(stable_id)
}

/// Secure path: generate token credentials for the script to create.
async fn secure_register(
    tenant: &Arc<TenantState>,
    request: AutoRegisterRequest,
) -> Result<Value, Error> {
    let host = match request.host.as_deref().filter(|host| !host.is_empty()) {
        Some(host) => host,
        None => http_bail!(BAD_REQUEST, "host is required"),
    };
    let ty = request.ty;
    if ty == NodeType::Pmg {
        http_bail!(BAD_REQUEST, "PMG does not support generated tokens");
    }

    let host = normalize_host(host, ty)
        .map_err(|err| proxmox_router::http_err!(BAD_REQUEST, "{}", err.code()))?;

    let user = request
        .username
        .clone()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| format!("pulse-monitor@{}", ty.default_realm()));

    let token_name = format!(
        "pulse-{}-{}",
        host_part(&host).replace(['.', ':'], "-"),
        proxmox_time::epoch_i64()
    );
    let token_id = format!("{user}!{token_name}");
    let token_value = generate_token_value()?;

    let requested_name = request
        .server_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host_part(&host).to_string());

    let (data, _digest) = tenant.nodes.config()?;
    let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let existing = entries
        .iter()
        .find(|(_, entry)| entry.node_type() == ty && entry.host() == host)
        .map(|(key, _)| key.clone());

    let name = match existing {
        Some(stable_id) => {
            update_registered_node(tenant, &stable_id, &token_id, &token_value).await?
        }
        None => {
            let name = disambiguate_name(&entries, ty, &requested_name, &host);
            insert_registered_node(tenant, ty, &name, &host, &token_id, &token_value).await?;
            name
        }
    };

    RecentRegistrations::get().mark(&tenant.org_id, &format!("{ty}-{name}"));
    super::nodes::schedule_monitor_reload(tenant);

    let response = AutoRegisterTokenResponse {
        token_id,
        token_value,
        action: "create_token".to_string(),
    };
    Ok(serde_json::to_value(response)?)
}

fn new_registered_entry(
    ty: NodeType,
    stable_id: &str,
    name: &str,
    host: &str,
    token_id: &str,
    token_value: &str,
) -> NodeEntry {
    match ty {
        NodeType::Pve => {
            let mut pve = PveInstance {
                id: stable_id.to_string(),
                name: name.to_string(),
                host: host.to_string(),
                guest_url: None,
                user: None,
                password: None,
                token_name: None,
                token_value: None,
                fingerprint: None,
                verify_ssl: Some(false),
                monitor_vms: true,
                monitor_containers: true,
                monitor_storage: true,
                monitor_backups: true,
                monitor_physical_disks: None,
                physical_disk_polling_minutes: None,
                temperature_monitoring_enabled: None,
                is_cluster: false,
                cluster_name: None,
                cluster_endpoints: Vec::new(),
                source: Some(NodeSource::Script),
                temperature_proxy_url: None,
                temperature_proxy_token: None,
                temperature_proxy_control_token: None,
            };
            pve.set_token_auth(token_id.to_string(), token_value.to_string());
            NodeEntry::Pve(pve)
        }
        NodeType::Pbs => {
            let mut pbs = PbsInstance {
                id: stable_id.to_string(),
                name: name.to_string(),
                host: host.to_string(),
                user: None,
                password: None,
                token_name: None,
                token_value: None,
                fingerprint: None,
                verify_ssl: Some(false),
                monitor_backups: true,
                monitor_datastores: true,
                monitor_sync_jobs: true,
                monitor_verify_jobs: true,
                monitor_prune_jobs: true,
                monitor_garbage_jobs: false,
                exclude_datastores: Vec::new(),
                source: Some(NodeSource::Script),
            };
            pbs.set_token_auth(token_id.to_string(), token_value.to_string());
            NodeEntry::Pbs(pbs)
        }
        NodeType::Pmg => {
            let mut pmg = PmgInstance {
                id: stable_id.to_string(),
                name: name.to_string(),
                host: host.to_string(),
                user: None,
                password: None,
                token_name: None,
                token_value: None,
                fingerprint: None,
                verify_ssl: Some(false),
                monitor_mail_stats: true,
                monitor_queues: true,
                monitor_quarantine: false,
                monitor_domain_stats: false,
                source: Some(NodeSource::Script),
            };
            pmg.set_token_auth(token_id.to_string(), token_value.to_string());
            NodeEntry::Pmg(pmg)
        }
    }
}

/// Append the host to the requested name when it is already taken.
fn disambiguate_name(
    entries: &[(String, NodeEntry)],
    ty: NodeType,
    requested: &str,
    host: &str,
) -> String {
    let taken = |name: &str| {
        entries
            .iter()
            .any(|(_, entry)| entry.node_type() == ty && entry.name().eq_ignore_ascii_case(name))
    };

    if !taken(requested) {
        return requested.to_string();
    }

    let fallback = format!("{requested}-{}", host_part(host));
    if !taken(&fallback) {
        return fallback;
    }

    // same name and host-suffix still taken; count upward
    let mut counter = 2;
    loop {
        let candidate = format!("{fallback}-{counter}");
        if !taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// 16 random bytes formatted as dashed hex, the usual token secret shape.
fn generate_token_value() -> Result<String, Error> {
    let mut raw = [0u8; 16];
    openssl::rand::rand_bytes(&mut raw)
        .map_err(|_| proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "no entropy available"))?;
    let hex = hex::encode(raw);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

fn save(tenant: &TenantState, entries: Vec<(String, NodeEntry)>) -> Result<(), Error> {
    let mut data = proxmox_section_config::typed::SectionConfigData::default();
    for (key, entry) in entries {
        data.insert(key, entry);
    }
    tenant.nodes.save_config(&data).map_err(|err| {
        log::error!("unable to persist node inventory - {err:#}");
        proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "failed to save configuration")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::StatusCode;
    use proxmox_router::HttpError;

    use crate::api::nodes::{do_add_node, do_list_nodes};
    use crate::test_support::{init_fake_client_factory, make_test_tenant};

    fn status_of(err: &Error) -> Option<StatusCode> {
        err.downcast_ref::<HttpError>().map(|http| http.code)
    }

    fn legacy_request(host: &str, code: &str) -> AutoRegisterRequest {
        AutoRegisterRequest {
            ty: NodeType::Pve,
            host: Some(host.to_string()),
            token_id: Some("pulse-monitor@pam!pulse-t1".to_string()),
            token_value: Some("abcd-1234".to_string()),
            server_name: Some("px1".to_string()),
            setup_code: Some(code.to_string()),
            auth_token: None,
            request_token: None,
            username: None,
            password: None,
        }
    }

    #[test]
    fn token_values_are_dashed_hex() {
        let value = generate_token_value().unwrap();
        let groups: Vec<&str> = value.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups
            .iter()
            .all(|group| group.bytes().all(|b| b.is_ascii_hexdigit())));
    }

    #[tokio::test]
    async fn missing_auth_is_rejected_with_distinct_message() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let mut request = legacy_request("192.168.77.10", "");
        request.setup_code = None;

        let err = do_auto_register(&test.tenant, request).await.unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::UNAUTHORIZED));
        assert!(err.to_string().contains("Pulse requires authentication"));
    }

    #[tokio::test]
    async fn setup_code_is_single_use() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pve, "192.168.77.10".into(), "default".into())
            .unwrap();

        do_auto_register(&test.tenant, legacy_request("192.168.77.10", &code))
            .await
            .unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        assert_eq!(response.pve.len(), 1);
        assert_eq!(response.pve[0].config.name, "px1");
        assert_eq!(
            response.pve[0].config.host,
            "https://192.168.77.10:8006"
        );

        // a replay is an auth failure, not a duplicate
        let err = do_auto_register(&test.tenant, legacy_request("192.168.77.10", &code))
            .await
            .unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::UNAUTHORIZED));
        assert!(err.to_string().contains("Invalid or expired setup code"));

        // but validation keeps succeeding within the grace window
        assert!(SetupCodeStore::get().validate(&code));
    }

    #[tokio::test]
    async fn code_for_wrong_node_type_is_rejected() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pbs, "192.168.77.20".into(), "default".into())
            .unwrap();

        let err = do_auto_register(&test.tenant, legacy_request("192.168.77.20", &code))
            .await
            .unwrap_err();
        assert_eq!(status_of(&err), Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn reregistration_updates_entry_in_place() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pve, "192.168.77.30".into(), "default".into())
            .unwrap();
        do_auto_register(&test.tenant, legacy_request("192.168.77.30", &code))
            .await
            .unwrap();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pve, "192.168.77.30".into(), "default".into())
            .unwrap();
        let mut request = legacy_request("192.168.77.30", &code);
        request.token_value = Some("new-secret".to_string());
        do_auto_register(&test.tenant, request).await.unwrap();

        let (data, _) = test.tenant.nodes.config().unwrap();
        let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
        assert_eq!(entries.len(), 1);
        let NodeEntry::Pve(pve) = &entries[0].1 else {
            panic!("expected a pve entry");
        };
        assert_eq!(pve.token_value.as_deref(), Some("new-secret"));
        assert_eq!(pve.password, None);
    }

    #[tokio::test]
    async fn name_conflicts_append_the_host() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pve,
            serde_json::json!({
                "name": "px1",
                "host": "192.168.77.40",
                "token-name": "t",
                "token-value": "v",
            }),
        )
        .await
        .unwrap();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pve, "192.168.77.41".into(), "default".into())
            .unwrap();
        do_auto_register(&test.tenant, legacy_request("192.168.77.41", &code))
            .await
            .unwrap();

        let response = do_list_nodes(&test.tenant).unwrap();
        let mut names: Vec<&str> = response
            .pve
            .iter()
            .map(|item| item.config.name.as_str())
            .collect();
        names.sort();
        assert_eq!(names, vec!["px1", "px1-192.168.77.41"]);
    }

    #[tokio::test]
    async fn secure_path_returns_generated_token() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let code = SetupCodeStore::get()
            .mint(NodeType::Pbs, "192.168.88.5".into(), "default".into())
            .unwrap();

        let request = AutoRegisterRequest {
            ty: NodeType::Pbs,
            host: Some("192.168.88.5".to_string()),
            token_id: None,
            token_value: None,
            server_name: Some("backup1".to_string()),
            setup_code: Some(code),
            auth_token: None,
            request_token: Some(true),
            username: None,
            password: None,
        };

        let response = do_auto_register(&test.tenant, request).await.unwrap();
        assert_eq!(response["action"], "create_token");
        let token_id = response["tokenId"].as_str().unwrap();
        assert!(token_id.starts_with("pulse-monitor@pbs!pulse-192-168-88-5-"));
        assert!(!response["tokenValue"].as_str().unwrap().is_empty());

        let (data, _) = test.tenant.nodes.config().unwrap();
        let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();
        let NodeEntry::Pbs(pbs) = &entries[0].1 else {
            panic!("expected a pbs entry");
        };
        assert_eq!(pbs.verify_ssl, Some(false));
        assert!(pbs.monitor_backups && pbs.monitor_datastores && pbs.monitor_sync_jobs);
        assert_eq!(pbs.token_name.as_deref(), Some(token_id));
    }

    #[tokio::test]
    async fn registration_broadcasts_before_reload() {
        init_fake_client_factory();
        let test = make_test_tenant();
        test.discovery
            .cached
            .lock()
            .unwrap()
            .replace(serde_json::json!({ "servers": [] }));

        let code = SetupCodeStore::get()
            .mint(NodeType::Pve, "192.168.77.50".into(), "default".into())
            .unwrap();
        do_auto_register(&test.tenant, legacy_request("192.168.77.50", &code))
            .await
            .unwrap();

        assert_eq!(
            test.broadcaster.message_types(),
            vec![NODE_AUTO_REGISTERED, DISCOVERY_UPDATE]
        );
    }
}
