//! Wire types of the auto-registration handshake and the setup-script flow.
//!
//! These keep the camelCase field names the host-side scripts and agents
//! already send, so they are serde-renamed instead of kebab-case.

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::NodeType;

#[api(
    properties: {
        "type": { type: NodeType },
    },
)]
/// What a hypervisor sends to `/api/auto-register`.
///
/// Two shapes share this struct: the legacy path carries a freshly minted
/// token (`tokenId`/`tokenValue`), the secure path sets `requestToken` and
/// lets the server generate the token credentials instead.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRegisterRequest {
    /// Node type being registered.
    #[serde(rename = "type")]
    pub ty: NodeType,

    /// Host URL or address of the hypervisor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Id of the API token the script created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,

    /// Secret of the API token the script created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_value: Option<String>,

    /// Display name the entry should get.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// One-time setup code authorizing this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_code: Option<String>,

    /// Long lived API token authorizing this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Ask the server to generate token credentials (secure path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_token: Option<bool>,

    /// User the generated token should belong to (secure path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for `username` (secure path, never persisted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl AutoRegisterRequest {
    /// The credential authorizing the call, wherever the caller put it.
    pub fn auth_code(&self) -> Option<&str> {
        self.setup_code
            .as_deref()
            .or(self.auth_token.as_deref())
            .filter(|code| !code.is_empty())
    }
}

#[api]
/// Response of the secure auto-register path.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRegisterTokenResponse {
    /// Id of the token the hypervisor should create.
    pub token_id: String,

    /// Secret of the token the hypervisor should create.
    pub token_value: String,

    /// Always `create_token`; tells the script what to do next.
    pub action: String,
}

#[api(
    properties: {
        "type": { type: NodeType },
    },
)]
/// Body of `POST /api/setup-script/url`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupScriptUrlRequest {
    /// Node type the script should register.
    #[serde(rename = "type")]
    pub ty: NodeType,

    /// Host the script will run on.
    pub host: String,

    /// Grant the generated token backup related privileges.
    #[serde(default)]
    pub backup_perms: bool,
}

#[api]
/// A minted one-time setup URL.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetupScriptUrlResponse {
    /// The full script URL, one-time token included.
    pub url: String,

    /// Ready-to-paste shell command fetching and running the script.
    pub command: String,

    /// RFC3339 expiry of the embedded setup code.
    pub expires: String,
}
