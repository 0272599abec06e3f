//! Global system settings.

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
/// Release channel the updater follows.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    /// Released versions only.
    Stable,
    /// Release candidates.
    Rc,
}

serde_plain::derive_display_from_serialize!(UpdateChannel);
serde_plain::derive_fromstr_from_deserialize!(UpdateChannel);

#[api]
/// UI theme preference served to the frontend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    /// Light theme.
    Light,
    /// Dark theme.
    Dark,
    /// Follow the browser.
    Auto,
}

serde_plain::derive_display_from_serialize!(ThemePreference);
serde_plain::derive_fromstr_from_deserialize!(ThemePreference);

#[api(
    properties: {
        "discovery-subnet": {
            type: String,
            format: &crate::CIDR_FORMAT,
            optional: true,
        },
    },
)]
/// Global settings of a Pulse instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SystemSettings {
    /// Seconds between PBS polling cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pbs_polling_interval: Option<u64>,

    /// Seconds between backup job polling cycles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_polling_interval: Option<u64>,

    /// TCP port the API daemon listens on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,

    /// TCP port the frontend is served on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_port: Option<u16>,

    /// Comma separated list of allowed CORS origins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<String>,

    /// Base URL under which this instance is reachable from the outside;
    /// embedded into generated setup script URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Seconds before an upstream connection attempt is aborted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,

    /// Release channel the updater follows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_channel: Option<UpdateChannel>,

    /// Install updates without asking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update_enabled: Option<bool>,

    /// Hours between update checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update_check_interval: Option<u64>,

    /// Log level of the daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// UI theme preference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<ThemePreference>,

    /// Allow the frontend to be embedded in frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_embedding: Option<bool>,

    /// Subnet scanned by the discovery service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_subnet: Option<String>,

    /// Whether backup polling runs at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_polling_enabled: Option<bool>,
}
