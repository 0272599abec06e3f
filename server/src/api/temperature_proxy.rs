//! Temperature-proxy registration and the authorized-node allowlist.
//!
//! A host side proxy exposes sensor data to Pulse. At install time it
//! registers here and receives a control token; afterwards it polls the
//! allowlist of nodes it may collect from, authenticating with that token
//! in the `X-Proxy-Token` header.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use anyhow::Error;
use futures::FutureExt;
use http::request::Parts;
use http::{header, Response, StatusCode};
use serde_json::{json, Value};

use proxmox_router::{
    http_bail, list_subdirs_api_method, ApiHandler, ApiMethod, ApiResponseFuture, Permission,
    Router, RpcEnvironment, SubdirMap,
};
use proxmox_schema::{api, ObjectSchema};
use proxmox_sortable_macro::sortable;

use pulse_api_types::{
    AuthorizedNode, AuthorizedNodesResponse, NodeEntry, TemperatureProxyMode,
    TemperatureProxyRegisterResponse, TemperatureProxyRegistration,
};

use crate::normalize::host_part;
use crate::tenant::{lookup_tenant, TenantMap, TenantState};

/// Seconds the proxies should wait between allowlist polls.
const REFRESH_INTERVAL: u64 = 60;

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    (
        "authorized-nodes",
        &Router::new().get(&API_METHOD_AUTHORIZED_NODES)
    ),
    ("register", &Router::new().post(&API_METHOD_REGISTER_PROXY)),
    (
        "unregister",
        &Router::new().delete(&API_METHOD_UNREGISTER_PROXY)
    ),
]);

/// Remembers when each instance's proxy last pulled the allowlist.
static LAST_PULL: LazyLock<StdMutex<HashMap<String, i64>>> = LazyLock::new(Default::default);

#[api(
    input: {
        properties: {
            registration: {
                flatten: true,
                type: TemperatureProxyRegistration,
            },
        },
    },
    returns: { type: TemperatureProxyRegisterResponse },
    access: {
        description: "Reachability of the endpoint implies authorization; it is restricted by the network layer.",
        permission: &Permission::World,
    },
)]
/// Register a temperature proxy for one of the monitored PVE hosts.
pub async fn register_proxy(
    registration: TemperatureProxyRegistration,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<TemperatureProxyRegisterResponse, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_register_proxy(&tenant, registration).await
}

pub async fn do_register_proxy(
    tenant: &Arc<TenantState>,
    registration: TemperatureProxyRegistration,
) -> Result<TemperatureProxyRegisterResponse, Error> {
    let hostname = registration.hostname.trim();
    if hostname.is_empty() {
        http_bail!(BAD_REQUEST, "hostname is required");
    }

    let control_token = generate_token()?;
    let auth_token = match registration.mode {
        TemperatureProxyMode::Https => Some(generate_token()?),
        TemperatureProxyMode::Socket => None,
    };

    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let matched = find_matching_pve(&entries, hostname);
    let (instance_name, endpoint_name) = match matched {
        Some(found) => found,
        None => http_bail!(NOT_FOUND, "no PVE instance matches hostname {hostname:?}"),
    };

    // write the tokens to whatever matched: the instance itself, or the
    // specific cluster endpoint the hostname named
    for (_, entry) in entries.iter_mut() {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.name != instance_name {
            continue;
        }
        match &endpoint_name {
            Some(endpoint_name) => {
                for endpoint in pve.cluster_endpoints.iter_mut() {
                    if endpoint.node_name == *endpoint_name {
                        endpoint.temperature_proxy_control_token = Some(control_token.clone());
                    }
                }
            }
            None => {
                pve.temperature_proxy_control_token = Some(control_token.clone());
            }
        }
        pve.temperature_proxy_url = Some(registration.proxy_url.clone());
        pve.temperature_proxy_token = auth_token.clone();
        pve.temperature_monitoring_enabled = Some(true);
    }

    let allowed_nodes = build_allowlist(&entries);
    save(tenant, entries)?;

    super::nodes::schedule_monitor_reload(tenant);

    log::info!("temperature proxy registered for {instance_name} ({hostname})");

    Ok(TemperatureProxyRegisterResponse {
        token: auth_token,
        control_token,
        pve_instance: instance_name,
        allowed_nodes,
        refresh_interval: REFRESH_INTERVAL,
    })
}

#[api(
    input: {
        properties: {
            hostname: {
                type: String,
                description: "Hostname the proxy was registered for.",
            },
        },
    },
    access: {
        description: "Reachability of the endpoint implies authorization; it is restricted by the network layer.",
        permission: &Permission::World,
    },
)]
/// Remove a temperature proxy registration.
pub async fn unregister_proxy(
    hostname: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_unregister_proxy(&tenant, &hostname).await
}

pub async fn do_unregister_proxy(
    tenant: &Arc<TenantState>,
    hostname: &str,
) -> Result<Value, Error> {
    let _lock = tenant.nodes.lock_config()?;
    let (data, _digest) = tenant.nodes.config()?;
    let mut entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let matched = find_matching_pve(&entries, hostname);
    let (instance_name, endpoint_name) = match matched {
        Some(found) => found,
        None => http_bail!(NOT_FOUND, "no PVE instance matches hostname {hostname:?}"),
    };

    for (key, entry) in entries.iter_mut() {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.name != instance_name {
            continue;
        }
        match &endpoint_name {
            Some(endpoint_name) => {
                for endpoint in pve.cluster_endpoints.iter_mut() {
                    if endpoint.node_name == *endpoint_name {
                        endpoint.temperature_proxy_control_token = None;
                    }
                }
            }
            None => {
                pve.temperature_proxy_control_token = None;
            }
        }
        pve.temperature_proxy_url = None;
        pve.temperature_proxy_token = None;
        LAST_PULL.lock().unwrap().remove(key);
    }

    save(tenant, entries)?;
    super::nodes::schedule_monitor_reload(tenant);

    Ok(json!({ "status": "success" }))
}

#[sortable]
pub const API_METHOD_AUTHORIZED_NODES: ApiMethod = ApiMethod::new(
    &ApiHandler::AsyncHttp(&authorized_nodes),
    &ObjectSchema::new(
        "The allowlist of nodes the calling proxy may collect from; authenticated by the X-Proxy-Token header.",
        &sorted!([]),
    ),
)
.access(None, &Permission::World);

fn authorized_nodes(
    parts: Parts,
    _req_body: hyper::body::Incoming,
    _param: Value,
    _info: &ApiMethod,
    _rpcenv: Box<dyn RpcEnvironment>,
) -> ApiResponseFuture {
    async move {
        let token = parts
            .headers
            .get("x-proxy-token")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if token.is_empty() {
            http_bail!(UNAUTHORIZED, "missing X-Proxy-Token header");
        }

        // proxies do not know about tenants; search all of them
        let mut response = None;
        for org in tenant_candidates()? {
            let tenant = TenantMap::get().resolve(Some(&org))?;
            if let Some(found) = authorized_nodes_for(&tenant, &token)? {
                response = Some(found);
                break;
            }
        }

        let response = match response {
            Some(response) => response,
            None => http_bail!(UNAUTHORIZED, "unknown proxy token"),
        };

        let body = serde_json::to_string(&response)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())?)
    }
    .boxed()
}

fn tenant_candidates() -> Result<Vec<String>, Error> {
    let mut orgs = pulse_config::existing_tenants()?;
    if !orgs.iter().any(|org| org == pulse_api_types::DEFAULT_ORG_ID) {
        orgs.insert(0, pulse_api_types::DEFAULT_ORG_ID.to_string());
    }
    Ok(orgs)
}

/// Match `token` against every instance and endpoint of one tenant.
fn authorized_nodes_for(
    tenant: &Arc<TenantState>,
    token: &str,
) -> Result<Option<AuthorizedNodesResponse>, Error> {
    let (data, _digest) = tenant.nodes.config()?;
    let entries: Vec<(String, NodeEntry)> = data.into_iter().collect();

    let mut matched = None;
    for (key, entry) in &entries {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.temperature_proxy_control_token.as_deref() == Some(token)
            || pve
                .cluster_endpoints
                .iter()
                .any(|endpoint| endpoint.temperature_proxy_control_token.as_deref() == Some(token))
        {
            matched = Some((key.clone(), pve.name.clone()));
            break;
        }
    }

    let Some((stable_id, instance)) = matched else {
        return Ok(None);
    };

    let nodes = build_allowlist(&entries);
    let hash = allowlist_hash(&nodes);

    let now = proxmox_time::epoch_i64();
    LAST_PULL.lock().unwrap().insert(stable_id, now);

    Ok(Some(AuthorizedNodesResponse {
        instance,
        nodes,
        hash,
        refresh_interval: REFRESH_INTERVAL,
        generated_at: proxmox_time::epoch_to_rfc3339(now)?,
    }))
}

/// Find the PVE instance (and possibly the specific cluster endpoint) a
/// hostname refers to.
///
/// Precedence: instance name, then host substring, then endpoint name.
fn find_matching_pve(
    entries: &[(String, NodeEntry)],
    hostname: &str,
) -> Option<(String, Option<String>)> {
    for (_, entry) in entries.iter() {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.name.eq_ignore_ascii_case(hostname) {
            return Some((pve.name.clone(), None));
        }
    }

    for (_, entry) in entries.iter() {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.host.contains(hostname) {
            return Some((pve.name.clone(), None));
        }
    }

    for (_, entry) in entries.iter() {
        let NodeEntry::Pve(pve) = entry else { continue };
        for endpoint in pve.cluster_endpoints.iter() {
            if endpoint.node_name.eq_ignore_ascii_case(hostname) {
                return Some((pve.name.clone(), Some(endpoint.node_name.clone())));
            }
        }
    }

    None
}

/// The allowlist over all PVE instances: cluster endpoints by name and
/// preferred address, standalone instances by their host.
fn build_allowlist(entries: &[(String, NodeEntry)]) -> Vec<AuthorizedNode> {
    let mut nodes = Vec::new();
    for (_, entry) in entries {
        let NodeEntry::Pve(pve) = entry else { continue };
        if pve.cluster_endpoints.is_empty() {
            nodes.push(AuthorizedNode {
                name: pve.name.clone(),
                ip: host_part(&pve.host).to_string(),
            });
        } else {
            for endpoint in pve.cluster_endpoints.iter() {
                nodes.push(AuthorizedNode {
                    name: endpoint.node_name.clone(),
                    ip: endpoint.effective_ip().to_string(),
                });
            }
        }
    }
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Content hash over the sorted allowlist; proxies compare it between
/// polls to detect changes.
fn allowlist_hash(nodes: &[AuthorizedNode]) -> String {
    let mut content = String::new();
    for node in nodes {
        content.push_str(&node.name);
        content.push(':');
        content.push_str(&node.ip);
        content.push('\n');
    }
    hex::encode(openssl::sha::sha256(content.as_bytes()))
}

fn generate_token() -> Result<String, Error> {
    let mut raw = [0u8; 32];
    openssl::rand::rand_bytes(&mut raw)
        .map_err(|_| proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "no entropy available"))?;
    Ok(hex::encode(raw))
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

    use pulse_api_types::NodeType;

    use crate::api::nodes::do_add_node;
    use crate::test_support::{init_fake_client_factory, make_test_tenant};

    #[tokio::test]
    async fn register_and_poll_allowlist() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pve,
            serde_json::json!({
                "name": "px1",
                "host": "192.168.77.60",
                "token-name": "t",
                "token-value": "v",
            }),
        )
        .await
        .unwrap();

        let response = do_register_proxy(
            &test.tenant,
            TemperatureProxyRegistration {
                hostname: "px1".to_string(),
                proxy_url: "/run/pulse-sensor-proxy.sock".to_string(),
                mode: TemperatureProxyMode::Socket,
            },
        )
        .await
        .unwrap();

        assert_eq!(response.pve_instance, "px1");
        assert_eq!(response.token, None);
        assert_eq!(response.control_token.len(), 64);
        assert_eq!(response.refresh_interval, REFRESH_INTERVAL);
        assert_eq!(response.allowed_nodes.len(), 1);
        assert_eq!(response.allowed_nodes[0].ip, "192.168.77.60");

        let allowlist = authorized_nodes_for(&test.tenant, &response.control_token)
            .unwrap()
            .expect("control token should match");
        assert_eq!(allowlist.instance, "px1");
        assert_eq!(allowlist.nodes, response.allowed_nodes);
        assert_eq!(allowlist.hash.len(), 64);

        assert!(authorized_nodes_for(&test.tenant, "bogus")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn https_mode_gets_an_auth_token() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pve,
            serde_json::json!({
                "name": "px2",
                "host": "192.168.77.61",
                "token-name": "t",
                "token-value": "v",
            }),
        )
        .await
        .unwrap();

        let response = do_register_proxy(
            &test.tenant,
            TemperatureProxyRegistration {
                hostname: "px2".to_string(),
                proxy_url: "https://192.168.77.61:9100".to_string(),
                mode: TemperatureProxyMode::Https,
            },
        )
        .await
        .unwrap();
        assert_eq!(response.token.map(|token| token.len()), Some(64));
    }

    #[tokio::test]
    async fn unknown_hostnames_are_not_found() {
        init_fake_client_factory();
        let test = make_test_tenant();

        let err = do_register_proxy(
            &test.tenant,
            TemperatureProxyRegistration {
                hostname: "ghost".to_string(),
                proxy_url: "/run/sock".to_string(),
                mode: TemperatureProxyMode::Socket,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no PVE instance"));
    }

    #[tokio::test]
    async fn unregister_clears_tokens() {
        init_fake_client_factory();
        let test = make_test_tenant();

        do_add_node(
            &test.tenant,
            NodeType::Pve,
            serde_json::json!({
                "name": "px3",
                "host": "192.168.77.62",
                "token-name": "t",
                "token-value": "v",
            }),
        )
        .await
        .unwrap();

        let response = do_register_proxy(
            &test.tenant,
            TemperatureProxyRegistration {
                hostname: "px3".to_string(),
                proxy_url: "/run/sock".to_string(),
                mode: TemperatureProxyMode::Socket,
            },
        )
        .await
        .unwrap();

        do_unregister_proxy(&test.tenant, "px3").await.unwrap();

        assert!(authorized_nodes_for(&test.tenant, &response.control_token)
            .unwrap()
            .is_none());
    }

    #[test]
    fn allowlist_hash_is_order_independent() {
        let mut a = vec![
            AuthorizedNode {
                name: "pve2".into(),
                ip: "10.0.0.7".into(),
            },
            AuthorizedNode {
                name: "pve1".into(),
                ip: "10.0.0.5".into(),
            },
        ];
        let mut b = a.clone();
        b.reverse();

        a.sort();
        b.sort();
        assert_eq!(allowlist_hash(&a), allowlist_hash(&b));
    }
}
