//! Thin typed client for the PVE API calls the control plane needs.
//!
//! Within Pulse we never touch guest state and just want some basic API
//! calls for validation and topology discovery, so this is a small
//! hand-rolled wrapper instead of a full generated client.

use serde::{Deserialize, Serialize};

use proxmox_client::{Error, HttpApiClient};
use proxmox_schema::api;

#[api]
/// Version details of a Proxmox product.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VersionInfo {
    /// The version string.
    pub version: String,

    /// The release number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,

    /// The repository commit id of the build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repoid: Option<String>,
}

#[api]
/// One row of the `cluster/status` response.
///
/// A `cluster` row names the cluster; `node` rows describe the peers. PVE
/// encodes booleans as 0/1 integers, so those fields stay numeric here.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClusterStatusEntry {
    /// Row type, `cluster` or `node`.
    #[serde(rename = "type")]
    pub ty: String,

    /// Row id (`cluster` or `node/<name>`).
    pub id: String,

    /// Cluster name or node name, depending on the row type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Number of cluster members (cluster row only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<i64>,

    /// Numeric id of the peer within the cluster (node rows only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodeid: Option<i64>,

    /// Address the cluster reports for the peer (node rows only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// 1 when the peer is online (node rows only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<i64>,

    /// 1 for the peer answering this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<i64>,
}

impl ClusterStatusEntry {
    pub fn is_online(&self) -> bool {
        self.online == Some(1)
    }
}

#[api]
/// One entry of the `nodes` index.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeIndexEntry {
    /// The node name.
    pub node: String,

    /// Node status (`online`/`offline`/`unknown`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[api]
/// One entry of a node's `network` listing.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NetworkInterface {
    /// Interface name.
    pub iface: String,

    /// Interface type (`eth`, `bridge`, `bond`, ...).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,

    /// Configured IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Configured IPv6 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address6: Option<String>,

    /// 1 when the interface is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<i64>,
}

impl NetworkInterface {
    pub fn is_active(&self) -> bool {
        self.active == Some(1)
    }
}

/// The PVE API surface the control plane consumes.
#[async_trait::async_trait]
pub trait PveApi {
    /// API version details.
    async fn version(&self) -> Result<VersionInfo, Error>;

    /// Cluster node index.
    async fn get_nodes(&self) -> Result<Vec<NodeIndexEntry>, Error>;

    /// Cluster membership and quorum information.
    async fn get_cluster_status(&self) -> Result<Vec<ClusterStatusEntry>, Error>;

    /// Network interface configuration of one node.
    async fn get_node_network_interfaces(
        &self,
        node: &str,
    ) -> Result<Vec<NetworkInterface>, Error>;
}

pub type PveClient = dyn PveApi + Send + Sync;

/// [`PveApi`] over a real HTTP connection.
pub struct PveApiImpl(pub proxmox_client::Client);

#[async_trait::async_trait]
impl PveApi for PveApiImpl {
    async fn version(&self) -> Result<VersionInfo, Error> {
        Ok(self.0.get("/api2/extjs/version").await?.expect_json()?.data)
    }

    async fn get_nodes(&self) -> Result<Vec<NodeIndexEntry>, Error> {
        Ok(self.0.get("/api2/extjs/nodes").await?.expect_json()?.data)
    }

    async fn get_cluster_status(&self) -> Result<Vec<ClusterStatusEntry>, Error> {
        Ok(self
            .0
            .get("/api2/extjs/cluster/status")
            .await?
            .expect_json()?
            .data)
    }

    async fn get_node_network_interfaces(
        &self,
        node: &str,
    ) -> Result<Vec<NetworkInterface>, Error> {
        let path = format!("/api2/extjs/nodes/{node}/network");
        Ok(self.0.get(&path).await?.expect_json()?.data)
    }
}
