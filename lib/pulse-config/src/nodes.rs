//! Read/write the per-tenant node inventory.
//!
//! Handlers get a [`NodesConfig`] handle from their tenant state; tests
//! inject an in-memory implementation instead of touching the filesystem.

use std::path::PathBuf;

use anyhow::Error;

use proxmox_config_digest::ConfigDigest;
use proxmox_product_config::{open_api_lockfile, replace_config, ApiLockGuard};
use proxmox_section_config::typed::{ApiSectionDataEntry, SectionConfigData};

use pulse_api_types::NodeEntry;

pub const NODES_CFG_FILENAME: &str = "nodes.cfg";
pub const NODES_CFG_LOCKFILE: &str = ".nodes.lock";

pub trait NodesConfig {
    /// Return contents of the node inventory
    fn config(&self) -> Result<(SectionConfigData<NodeEntry>, ConfigDigest), Error>;
    /// Lock the node inventory
    fn lock_config(&self) -> Result<ApiLockGuard, Error>;
    /// Replace the currently persisted node inventory
    fn save_config(&self, nodes: &SectionConfigData<NodeEntry>) -> Result<(), Error>;
}

/// Default, production implementation reading/writing the `nodes.cfg`
/// file inside a tenant's data directory.
pub struct DefaultNodesConfig {
    config_file: PathBuf,
    lock_file: PathBuf,
}

impl DefaultNodesConfig {
    pub fn new(tenant_dir: impl Into<PathBuf>) -> Self {
        let tenant_dir = tenant_dir.into();
        Self {
            config_file: tenant_dir.join(NODES_CFG_FILENAME),
            lock_file: tenant_dir.join(NODES_CFG_LOCKFILE),
        }
    }
}

impl NodesConfig for DefaultNodesConfig {
    fn lock_config(&self) -> Result<ApiLockGuard, Error> {
        open_api_lockfile(&self.lock_file, None, true)
    }

    fn config(&self) -> Result<(SectionConfigData<NodeEntry>, ConfigDigest), Error> {
        let path = self.config_file.display().to_string();
        let content = proxmox_sys::fs::file_read_optional_string(&self.config_file)?.unwrap_or_default();

        let digest = openssl::sha::sha256(content.as_bytes());
        let data = NodeEntry::parse_section_config(&path, &content)?;
        Ok((data, digest.into()))
    }

    fn save_config(&self, nodes: &SectionConfigData<NodeEntry>) -> Result<(), Error> {
        let path = self.config_file.display().to_string();
        let raw = NodeEntry::write_section_config(&path, nodes)?;
        replace_config(&self.config_file, raw.as_bytes())
    }
}
