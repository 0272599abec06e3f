//! Thin typed client for the PMG API calls the control plane needs.

use proxmox_client::{Error, HttpApiClient};

use crate::pve_client::VersionInfo;

/// The PMG API surface the control plane consumes.
#[async_trait::async_trait]
pub trait PmgApi {
    /// API version details.
    async fn version(&self) -> Result<VersionInfo, Error>;
}

pub type PmgClient = dyn PmgApi + Send + Sync;

/// [`PmgApi`] over a real HTTP connection.
pub struct PmgApiImpl(pub proxmox_client::Client);

#[async_trait::async_trait]
impl PmgApi for PmgApiImpl {
    async fn version(&self) -> Result<VersionInfo, Error> {
        Ok(self.0.get("/api2/extjs/version").await?.expect_json()?.data)
    }
}
