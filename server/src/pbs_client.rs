//! Thin typed client for the PBS API calls the control plane needs.

use serde::{Deserialize, Serialize};

use proxmox_client::{Error, HttpApiClient};
use proxmox_schema::api;

use crate::pve_client::VersionInfo;

#[api]
/// One configured datastore on a PBS instance.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatastoreEntry {
    /// The datastore name.
    pub name: String,

    /// The mount path of the datastore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Comment set on the datastore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The PBS API surface the control plane consumes.
#[async_trait::async_trait]
pub trait PbsApi {
    /// API version details.
    async fn version(&self) -> Result<VersionInfo, Error>;

    /// The configured datastores.
    async fn get_datastores(&self) -> Result<Vec<DatastoreEntry>, Error>;
}

pub type PbsClient = dyn PbsApi + Send + Sync;

/// [`PbsApi`] over a real HTTP connection.
pub struct PbsApiImpl(pub proxmox_client::Client);

#[async_trait::async_trait]
impl PbsApi for PbsApiImpl {
    async fn version(&self) -> Result<VersionInfo, Error> {
        Ok(self.0.get("/api2/extjs/version").await?.expect_json()?.data)
    }

    async fn get_datastores(&self) -> Result<Vec<DatastoreEntry>, Error> {
        Ok(self
            .0
            .get("/api2/extjs/config/datastore")
            .await?
            .expect_json()?
            .data)
    }
}
