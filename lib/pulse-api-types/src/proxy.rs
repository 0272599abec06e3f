//! Temperature-proxy registration types.
//!
//! Field names follow what the proxy installer already sends (snake_case).

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// Transport mode of a temperature proxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureProxyMode {
    /// Local unix socket on the host.
    Socket,
    /// Reachable over HTTPS.
    Https,
}

serde_plain::derive_display_from_serialize!(TemperatureProxyMode);
serde_plain::derive_fromstr_from_deserialize!(TemperatureProxyMode);

#[api(
    properties: {
        "mode": { type: TemperatureProxyMode },
    },
)]
/// Body of `POST /api/temperature-proxy/register`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TemperatureProxyRegistration {
    /// Hostname of the machine the proxy runs on.
    pub hostname: String,

    /// Where the proxy can be reached (socket path or HTTPS URL).
    pub proxy_url: String,

    /// Transport mode of the proxy.
    pub mode: TemperatureProxyMode,
}

#[api]
/// Tokens and allowlist handed back to a freshly registered proxy.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TemperatureProxyRegisterResponse {
    /// Auth token the proxy must present on sensor queries (HTTPS mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Control token the proxy presents when polling `/authorized-nodes`.
    pub control_token: String,

    /// Name of the PVE instance the proxy was matched to.
    pub pve_instance: String,

    /// The current authorized node allowlist.
    pub allowed_nodes: Vec<AuthorizedNode>,

    /// Seconds the proxy should wait between allowlist polls.
    pub refresh_interval: u64,
}

#[api]
/// One entry of the authorized node allowlist.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthorizedNode {
    /// Display name of the node.
    pub name: String,

    /// Address the proxy should collect from.
    pub ip: String,
}

#[api(
    properties: {
        "nodes": {
            type: Array,
            items: { type: AuthorizedNode },
        },
    },
)]
/// Response of `GET /api/temperature-proxy/authorized-nodes`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuthorizedNodesResponse {
    /// Name of the instance the presented control token belongs to.
    pub instance: String,

    /// The allowlist of nodes the proxy may collect from.
    pub nodes: Vec<AuthorizedNode>,

    /// Content hash over the sorted allowlist.
    pub hash: String,

    /// Seconds the proxy should wait before polling again.
    pub refresh_interval: u64,

    /// RFC3339 timestamp of this response.
    pub generated_at: String,
}
