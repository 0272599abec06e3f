//! Node inventory types: monitored PVE, PBS and PMG instances.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiType, Updater};
use proxmox_section_config::typed::ApiSectionDataEntry;
use proxmox_section_config::{SectionConfig, SectionConfigPlugin};

use crate::NODE_KEY_SCHEMA;

#[api]
/// The product type of a monitored node entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// A Proxmox VE node or cluster.
    Pve,
    /// A Proxmox Backup Server instance.
    Pbs,
    /// A Proxmox Mail Gateway instance.
    Pmg,
}

impl NodeType {
    /// The API port used when the user did not specify one.
    pub fn default_port(&self) -> u16 {
        match self {
            NodeType::Pve | NodeType::Pmg => 8006,
            NodeType::Pbs => 8007,
        }
    }

    /// The realm appended to user names given without one.
    pub fn default_realm(&self) -> &'static str {
        match self {
            NodeType::Pve => "pam",
            NodeType::Pbs => "pbs",
            NodeType::Pmg => "pmg",
        }
    }
}

serde_plain::derive_display_from_serialize!(NodeType);
serde_plain::derive_fromstr_from_deserialize!(NodeType);

#[api]
/// How a node entry came into the inventory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSource {
    /// Registered by a host-side agent.
    Agent,
    /// Registered by a generated setup script.
    Script,
}

serde_plain::derive_display_from_serialize!(NodeSource);
serde_plain::derive_fromstr_from_deserialize!(NodeSource);

#[api(
    properties: {
        "fingerprint": {
            type: String,
            format: &crate::FINGERPRINT_SHA256_FORMAT,
            optional: true,
        },
    },
)]
/// A discovered peer of a PVE cluster.
///
/// `host` is built from the peer's node *name* so certificate SAN matching
/// works; `ip` carries the address the cluster reported for the peer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEndpoint {
    /// Identifier of the peer within the cluster.
    pub node_id: String,

    /// The peer's node name.
    pub node_name: String,

    /// Hostname based URL of the peer.
    pub host: String,

    /// Cluster-reported address of the peer.
    pub ip: String,

    /// User supplied address override, preserved across topology refreshes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_override: Option<String>,

    /// Certificate fingerprint captured on first contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// User-facing URL for guest links on this peer, preserved across refreshes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_url: Option<String>,

    /// Whether the peer validated successfully during the last refresh.
    #[serde(default)]
    pub online: bool,

    /// Epoch of the last successful contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,

    /// Control token of a temperature proxy registered on this peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_proxy_control_token: Option<String>,
}

impl ClusterEndpoint {
    /// The address the control plane should actually contact.
    pub fn effective_ip(&self) -> &str {
        self.ip_override.as_deref().unwrap_or(&self.ip)
    }
}

#[api(
    properties: {
        "id": { schema: NODE_KEY_SCHEMA },
        "name": { schema: crate::NODE_NAME_SCHEMA },
        "host": { schema: crate::HOST_SCHEMA },
        "fingerprint": {
            type: String,
            format: &crate::FINGERPRINT_SHA256_FORMAT,
            optional: true,
        },
        "cluster-endpoints": {
            type: Array,
            optional: true,
            items: {
                type: String,
                description: "A cluster peer, encoded as a property string.",
            },
        },
    },
)]
/// A monitored Proxmox VE node or cluster.
#[derive(Clone, Debug, Deserialize, Serialize, Updater, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PveInstance {
    /// Stable identifier, generated when the entry is created.
    #[updater(skip)]
    #[serde(default)]
    pub id: String,

    /// Display name, unique within the PVE list.
    pub name: String,

    /// Canonical URL of the instance.
    pub host: String,

    /// User-facing URL used for guest links instead of `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_url: Option<String>,

    /// User name including realm, for password authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password matching `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// API token id, for token authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,

    /// API token secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_value: Option<String>,

    /// Certificate fingerprint pinned on first contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Whether the certificate should be verified against the system trust store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,

    /// Poll virtual machines.
    #[serde(default)]
    pub monitor_vms: bool,

    /// Poll containers.
    #[serde(default)]
    pub monitor_containers: bool,

    /// Poll storage usage.
    #[serde(default)]
    pub monitor_storage: bool,

    /// Poll backup tasks.
    #[serde(default)]
    pub monitor_backups: bool,

    /// Poll physical disk health.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_physical_disks: Option<bool>,

    /// Minutes between physical disk polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_disk_polling_minutes: Option<u32>,

    /// Collect temperature sensor data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_monitoring_enabled: Option<bool>,

    /// Whether this instance is part of a cluster.
    #[serde(default)]
    pub is_cluster: bool,

    /// Name of the cluster this instance belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// The peers discovered for this cluster.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_endpoints: Vec<proxmox_schema::property_string::PropertyString<ClusterEndpoint>>,

    /// How this entry was registered.
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeSource>,

    /// URL of the temperature proxy serving this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_proxy_url: Option<String>,

    /// Auth token presented to the temperature proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_proxy_token: Option<String>,

    /// Control token the temperature proxy presents when polling us.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_proxy_control_token: Option<String>,
}

#[api(
    properties: {
        "id": { schema: NODE_KEY_SCHEMA },
        "name": { schema: crate::NODE_NAME_SCHEMA },
        "host": { schema: crate::HOST_SCHEMA },
        "fingerprint": {
            type: String,
            format: &crate::FINGERPRINT_SHA256_FORMAT,
            optional: true,
        },
        "exclude-datastores": {
            type: Array,
            optional: true,
            items: {
                type: String,
                description: "A datastore name to skip while polling.",
            },
        },
    },
)]
/// A monitored Proxmox Backup Server instance.
#[derive(Clone, Debug, Deserialize, Serialize, Updater, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PbsInstance {
    /// Stable identifier, generated when the entry is created.
    #[updater(skip)]
    #[serde(default)]
    pub id: String,

    /// Display name, unique within the PBS list.
    pub name: String,

    /// Canonical URL of the instance.
    pub host: String,

    /// User name including realm, for password authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password matching `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// API token id, for token authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,

    /// API token secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_value: Option<String>,

    /// Certificate fingerprint pinned on first contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Whether the certificate should be verified against the system trust store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,

    /// Poll backup snapshots.
    #[serde(default)]
    pub monitor_backups: bool,

    /// Poll datastore usage.
    #[serde(default)]
    pub monitor_datastores: bool,

    /// Poll sync job status.
    #[serde(default)]
    pub monitor_sync_jobs: bool,

    /// Poll verify job status.
    #[serde(default)]
    pub monitor_verify_jobs: bool,

    /// Poll prune job status.
    #[serde(default)]
    pub monitor_prune_jobs: bool,

    /// Poll garbage collection status.
    #[serde(default)]
    pub monitor_garbage_jobs: bool,

    /// Datastores excluded from polling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_datastores: Vec<String>,

    /// How this entry was registered.
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeSource>,
}

#[api(
    properties: {
        "id": { schema: NODE_KEY_SCHEMA },
        "name": { schema: crate::NODE_NAME_SCHEMA },
        "host": { schema: crate::HOST_SCHEMA },
        "fingerprint": {
            type: String,
            format: &crate::FINGERPRINT_SHA256_FORMAT,
            optional: true,
        },
    },
)]
/// A monitored Proxmox Mail Gateway instance.
#[derive(Clone, Debug, Deserialize, Serialize, Updater, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PmgInstance {
    /// Stable identifier, generated when the entry is created.
    #[updater(skip)]
    #[serde(default)]
    pub id: String,

    /// Display name, unique within the PMG list.
    pub name: String,

    /// Canonical URL of the instance.
    pub host: String,

    /// User name including realm, for password authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password matching `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// API token id, for token authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,

    /// API token secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_value: Option<String>,

    /// Certificate fingerprint pinned on first contact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Whether the certificate should be verified against the system trust store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,

    /// Poll mail count statistics.
    #[serde(default)]
    pub monitor_mail_stats: bool,

    /// Poll the mail queues.
    #[serde(default)]
    pub monitor_queues: bool,

    /// Poll the quarantine.
    #[serde(default)]
    pub monitor_quarantine: bool,

    /// Poll per-domain statistics.
    #[serde(default)]
    pub monitor_domain_stats: bool,

    /// How this entry was registered.
    #[updater(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeSource>,
}

macro_rules! impl_node_auth {
    ($ty:ty) => {
        impl $ty {
            /// True if either credential pair is present.
            pub fn has_credentials(&self) -> bool {
                self.password.as_deref().is_some_and(|p| !p.is_empty())
                    || self.token_value.as_deref().is_some_and(|t| !t.is_empty())
            }

            /// Switch to password authentication, clearing any token pair.
            pub fn set_password_auth(&mut self, user: String, password: String) {
                self.user = Some(user);
                self.password = Some(password);
                self.token_name = None;
                self.token_value = None;
            }

            /// Switch to token authentication, clearing any password.
            pub fn set_token_auth(&mut self, token_name: String, token_value: String) {
                self.token_name = Some(token_name);
                self.token_value = Some(token_value);
                self.password = None;
            }

            /// Strip secrets for wire output.
            pub fn redacted(&self) -> Self {
                let mut this = self.clone();
                this.password = this.password.map(|_| String::new());
                this.token_value = this.token_value.map(|_| String::new());
                this
            }
        }
    };
}

impl_node_auth!(PveInstance);
impl_node_auth!(PbsInstance);
impl_node_auth!(PmgInstance);

/// A single entry of the node inventory.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeEntry {
    /// A Proxmox VE node or cluster.
    Pve(PveInstance),
    /// A Proxmox Backup Server instance.
    Pbs(PbsInstance),
    /// A Proxmox Mail Gateway instance.
    Pmg(PmgInstance),
}

impl NodeEntry {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeEntry::Pve(_) => NodeType::Pve,
            NodeEntry::Pbs(_) => NodeType::Pbs,
            NodeEntry::Pmg(_) => NodeType::Pmg,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            NodeEntry::Pve(pve) => &pve.id,
            NodeEntry::Pbs(pbs) => &pbs.id,
            NodeEntry::Pmg(pmg) => &pmg.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeEntry::Pve(pve) => &pve.name,
            NodeEntry::Pbs(pbs) => &pbs.name,
            NodeEntry::Pmg(pmg) => &pmg.name,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            NodeEntry::Pve(pve) => &pve.host,
            NodeEntry::Pbs(pbs) => &pbs.host,
            NodeEntry::Pmg(pmg) => &pmg.host,
        }
    }

    /// The key the monitor uses for connection status and alert overrides.
    pub fn monitoring_id(&self) -> String {
        format!("{}-{}", self.node_type(), self.name())
    }
}

impl ApiSectionDataEntry for NodeEntry {
    const INTERNALLY_TAGGED: Option<&'static str> = Some("type");
    const SECION_CONFIG_USES_TYPE_KEY: bool = true;

    /// Get the `SectionConfig` configuration for this enum.
    fn section_config() -> &'static SectionConfig {
        static CONFIG: OnceLock<SectionConfig> = OnceLock::new();

        CONFIG.get_or_init(|| {
            let mut this = SectionConfig::new(&NODE_KEY_SCHEMA).with_type_key("type");
            this.register_plugin(SectionConfigPlugin::new(
                "pve".to_string(),
                Some("id".to_string()),
                PveInstance::API_SCHEMA.unwrap_object_schema(),
            ));
            this.register_plugin(SectionConfigPlugin::new(
                "pbs".to_string(),
                Some("id".to_string()),
                PbsInstance::API_SCHEMA.unwrap_object_schema(),
            ));
            this.register_plugin(SectionConfigPlugin::new(
                "pmg".to_string(),
                Some("id".to_string()),
                PmgInstance::API_SCHEMA.unwrap_object_schema(),
            ));
            this
        })
    }

    /// Maps an enum value to its type name.
    fn section_type(&self) -> &'static str {
        match self {
            NodeEntry::Pve(_) => "pve",
            NodeEntry::Pbs(_) => "pbs",
            NodeEntry::Pmg(_) => "pmg",
        }
    }
}

#[api(
    properties: {
        "config": { type: PveInstance },
    },
)]
/// A configured PVE instance together with its positional id and live status.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PveNodeItem {
    /// Positional wire id (`pve-<index>`), only valid until the next mutation.
    pub id: String,

    /// Connection status as resolved against the monitor.
    pub status: String,

    /// The instance configuration, secrets redacted.
    pub config: PveInstance,
}

#[api(
    properties: {
        "config": { type: PbsInstance },
    },
)]
/// A configured PBS instance together with its positional id and live status.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PbsNodeItem {
    /// Positional wire id (`pbs-<index>`), only valid until the next mutation.
    pub id: String,

    /// Connection status as resolved against the monitor.
    pub status: String,

    /// The instance configuration, secrets redacted.
    pub config: PbsInstance,
}

#[api(
    properties: {
        "config": { type: PmgInstance },
    },
)]
/// A configured PMG instance together with its positional id and live status.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PmgNodeItem {
    /// Positional wire id (`pmg-<index>`), only valid until the next mutation.
    pub id: String,

    /// Connection status as resolved against the monitor.
    pub status: String,

    /// The instance configuration, secrets redacted.
    pub config: PmgInstance,
}

#[api(
    properties: {
        "pve": {
            type: Array,
            items: { type: PveNodeItem },
        },
        "pbs": {
            type: Array,
            items: { type: PbsNodeItem },
        },
        "pmg": {
            type: Array,
            items: { type: PmgNodeItem },
        },
    },
)]
/// The complete node inventory of a tenant.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodesResponse {
    /// Configured PVE instances.
    pub pve: Vec<PveNodeItem>,
    /// Configured PBS instances.
    pub pbs: Vec<PbsNodeItem>,
    /// Configured PMG instances.
    pub pmg: Vec<PmgNodeItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_per_type() {
        assert_eq!(NodeType::Pve.default_port(), 8006);
        assert_eq!(NodeType::Pmg.default_port(), 8006);
        assert_eq!(NodeType::Pbs.default_port(), 8007);
    }

    #[test]
    fn auth_switch_clears_opposite_pair() {
        let mut pve = PveInstance {
            id: "abc123".into(),
            name: "px1".into(),
            host: "https://10.1.1.5:8006".into(),
            guest_url: None,
            user: Some("root@pam".into()),
            password: Some("secret".into()),
            token_name: None,
            token_value: None,
            fingerprint: None,
            verify_ssl: None,
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
            source: None,
            temperature_proxy_url: None,
            temperature_proxy_token: None,
            temperature_proxy_control_token: None,
        };

        pve.set_token_auth("monitor@pam!pulse".into(), "tok".into());
        assert_eq!(pve.password, None);
        assert!(pve.has_credentials());

        pve.set_password_auth("root@pam".into(), "secret".into());
        assert_eq!(pve.token_name, None);
        assert_eq!(pve.token_value, None);
    }

    #[test]
    fn entry_round_trips_as_internally_tagged_json(){
        let entry = NodeEntry::Pbs(PbsInstance {
            id: "def456".into(),
            name: "backup".into(),
            host: "https://10.1.1.10:8007".into(),
            user: None,
            password: None,
            token_name: Some("pulse@pbs!t1".into()),
            token_value: Some("value".into()),
            fingerprint: None,
            verify_ssl: Some(false),
            monitor_backups: true,
            monitor_datastores: true,
            monitor_sync_jobs: false,
            monitor_verify_jobs: false,
            monitor_prune_jobs: false,
            monitor_garbage_jobs: false,
            exclude_datastores: Vec::new(),
            source: Some(NodeSource::Script),
        });

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "pbs");
        let parsed: NodeEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.monitoring_id(), "pbs-backup");
    }
}
