//! Network discovery endpoints, delegating to the external scanner.

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use crate::tenant::lookup_tenant;

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_GET_CACHED_DISCOVERY)
    .post(&API_METHOD_DISCOVER);

#[api(
    access: {
        permission: &Permission::Anybody,
    },
)]
/// The most recent discovery scan result.
pub fn get_cached_discovery(rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    Ok(tenant
        .discovery
        .cached_result()
        .unwrap_or_else(|| json!({ "servers": [] })))
}

#[api(
    input: {
        properties: {
            subnet: {
                type: String,
                optional: true,
                description: "Subnet to scan instead of the configured one.",
            },
            "use_cache": {
                type: Boolean,
                optional: true,
                default: true,
                description: "Return the cached result when one exists.",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Scan the network for Proxmox services.
pub async fn discover(
    subnet: Option<String>,
    use_cache: bool,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;

    if use_cache {
        if let Some(cached) = tenant.discovery.cached_result() {
            return Ok(cached);
        }
    }

    tenant
        .discovery
        .scan(subnet.as_deref())
        .await
        .map_err(|err| {
            log::error!("discovery scan failed - {err:#}");
            proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "discovery scan failed")
        })
}
