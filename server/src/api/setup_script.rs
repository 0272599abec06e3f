//! Setup-script minting and delivery.
//!
//! `POST url` mints a one-time setup code and hands back the script URL
//! plus a paste-ready `curl | bash` command; `GET` (token in the URL)
//! renders the actual bash script.

use std::sync::Arc;

use anyhow::Error;
use futures::FutureExt;
use http::request::Parts;
use http::{header, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use proxmox_router::{
    http_bail, ApiHandler, ApiMethod, ApiResponseFuture, Permission, Router, RpcEnvironment,
};
use proxmox_schema::{api, BooleanSchema, ObjectSchema, StringSchema};
use proxmox_sortable_macro::sortable;

use pulse_api_types::{
    NodeType, SetupScriptUrlRequest, SetupScriptUrlResponse, SETUP_CODE_SCHEMA,
};

use crate::script::{ensure_ssh_keys, render_setup_script, ScriptParams};
use crate::setup_code::{SetupCodeStore, SETUP_CODE_TTL};
use crate::tenant::{lookup_tenant, TenantState};

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_GET_SETUP_SCRIPT)
    .subdirs(SUBDIRS);

#[sortable]
const SUBDIRS: proxmox_router::SubdirMap =
    &sorted!([("url", &Router::new().post(&API_METHOD_CREATE_SETUP_URL)),]);

#[api(
    input: {
        properties: {
            request: {
                flatten: true,
                type: SetupScriptUrlRequest,
            },
        },
    },
    returns: { type: SetupScriptUrlResponse },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Mint a one-time setup code and return the script URL embedding it.
pub async fn create_setup_url(
    request: SetupScriptUrlRequest,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<SetupScriptUrlResponse, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_create_setup_url(&tenant, request)
}

pub fn do_create_setup_url(
    tenant: &Arc<TenantState>,
    request: SetupScriptUrlRequest,
) -> Result<SetupScriptUrlResponse, Error> {
    if request.ty == NodeType::Pmg {
        http_bail!(BAD_REQUEST, "no setup script available for PMG");
    }
    if request.host.trim().is_empty() {
        http_bail!(BAD_REQUEST, "host is required");
    }

    let pulse_url = public_url(tenant)?;

    let code = SetupCodeStore::get().mint(
        request.ty,
        request.host.clone(),
        tenant.org_id.clone(),
    )?;

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("type", &request.ty.to_string())
        .append_pair("host", &request.host)
        .append_pair("pulse_url", &pulse_url)
        .append_pair("auth_token", &code);
    if request.backup_perms {
        query.append_pair("backup_perms", "true");
    }

    let url = format!("{pulse_url}/api/setup-script?{}", query.finish());
    let expires =
        proxmox_time::epoch_to_rfc3339(proxmox_time::epoch_i64() + SETUP_CODE_TTL)?;

    Ok(SetupScriptUrlResponse {
        command: format!("curl -sSL \"{url}\" | bash"),
        url,
        expires,
    })
}

/// The base URL embedded into generated script URLs.
fn public_url(tenant: &TenantState) -> Result<String, Error> {
    let (settings, _digest) = tenant.system.config()?;
    Ok(match settings.public_url {
        Some(url) => url.trim_end_matches('/').to_string(),
        None => format!(
            "https://{}:{}",
            proxmox_sys::nodename(),
            settings
                .backend_port
                .unwrap_or(pulse_buildcfg::PULSE_PORT)
        ),
    })
}

#[derive(Deserialize)]
struct SetupScriptParams {
    #[serde(rename = "type")]
    ty: NodeType,
    host: String,
    pulse_url: String,
    auth_token: String,
    #[serde(default)]
    backup_perms: bool,
}

#[sortable]
pub const API_METHOD_GET_SETUP_SCRIPT: ApiMethod = ApiMethod::new(
    &ApiHandler::AsyncHttp(&get_setup_script),
    &ObjectSchema::new(
        "Download the generated setup script; authenticated by the one-time token in the URL.",
        &sorted!([
            (
                "type",
                false,
                &StringSchema::new("Node type the script registers.").schema()
            ),
            (
                "host",
                false,
                &StringSchema::new("Host the script will run on.").schema()
            ),
            (
                "pulse_url",
                false,
                &StringSchema::new("Base URL of this Pulse instance.").schema()
            ),
            ("auth_token", false, &SETUP_CODE_SCHEMA),
            (
                "backup_perms",
                true,
                &BooleanSchema::new("Grant backup related privileges.").schema()
            ),
        ]),
    ),
)
.access(None, &Permission::World);

fn get_setup_script(
    _parts: Parts,
    _req_body: hyper::body::Incoming,
    param: Value,
    _info: &ApiMethod,
    _rpcenv: Box<dyn RpcEnvironment>,
) -> ApiResponseFuture {
    async move {
        let params: SetupScriptParams = serde_json::from_value(param)?;

        if !SetupCodeStore::get().validate(&params.auth_token) {
            http_bail!(UNAUTHORIZED, "Invalid or expired setup code");
        }

        let ssh_keys = match ensure_ssh_keys() {
            Ok(keys) => Some(keys),
            Err(err) => {
                // temperature collection is optional, the script still works
                log::warn!("setup script rendered without SSH keys - {err:#}");
                None
            }
        };

        let script = render_setup_script(
            &ScriptParams {
                ty: params.ty,
                host: params.host,
                pulse_url: params.pulse_url,
                auth_token: params.auth_token,
                backup_perms: params.backup_perms,
            },
            ssh_keys.as_ref(),
        )?;

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(script.into())?)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::make_test_tenant;

    #[tokio::test]
    async fn minted_url_embeds_all_parameters() {
        let test = make_test_tenant();

        let response = do_create_setup_url(
            &test.tenant,
            SetupScriptUrlRequest {
                ty: NodeType::Pve,
                host: "10.1.1.5".to_string(),
                backup_perms: true,
            },
        )
        .unwrap();

        assert!(response.url.contains("/api/setup-script?"));
        assert!(response.url.contains("type=pve"));
        assert!(response.url.contains("host=10.1.1.5"));
        assert!(response.url.contains("pulse_url="));
        assert!(response.url.contains("backup_perms=true"));
        assert!(response.command.starts_with("curl -sSL \""));
        assert!(response.command.ends_with("\" | bash"));

        // the embedded one-time code is live
        let code = response
            .url
            .split("auth_token=")
            .nth(1)
            .unwrap()
            .split('&')
            .next()
            .unwrap();
        assert!(SetupCodeStore::get().validate(code));
    }

    #[tokio::test]
    async fn pmg_gets_no_setup_url() {
        let test = make_test_tenant();

        let err = do_create_setup_url(
            &test.tenant,
            SetupScriptUrlRequest {
                ty: NodeType::Pmg,
                host: "mail1".to_string(),
                backup_perms: false,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("no setup script"));
    }
}
