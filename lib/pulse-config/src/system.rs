//! Read/write the per-tenant system settings.

use std::path::PathBuf;

use anyhow::{bail, Error};

use proxmox_schema::ApiType;

use proxmox_config_digest::ConfigDigest;
use proxmox_product_config::{open_api_lockfile, replace_config, ApiLockGuard};

use pulse_api_types::SystemSettings;

pub const SYSTEM_CFG_FILENAME: &str = "system.cfg";
pub const SYSTEM_CFG_LOCKFILE: &str = ".system.lock";

/// Per-tenant handle to the `system.cfg` file.
pub struct SystemConfig {
    config_file: PathBuf,
    lock_file: PathBuf,
}

impl SystemConfig {
    pub fn new(tenant_dir: impl Into<PathBuf>) -> Self {
        let tenant_dir = tenant_dir.into();
        Self {
            config_file: tenant_dir.join(SYSTEM_CFG_FILENAME),
            lock_file: tenant_dir.join(SYSTEM_CFG_LOCKFILE),
        }
    }

    pub fn lock(&self) -> Result<ApiLockGuard, Error> {
        open_api_lockfile(&self.lock_file, None, true)
    }

    /// Read the system settings.
    pub fn config(&self) -> Result<(SystemSettings, ConfigDigest), Error> {
        let content =
            proxmox_sys::fs::file_read_optional_string(&self.config_file)?.unwrap_or_default();

        let digest = openssl::sha::sha256(content.as_bytes());
        let data: SystemSettings =
            proxmox_simple_config::from_str(&content, &SystemSettings::API_SCHEMA)?;

        Ok((data, digest.into()))
    }

    /// Write the system settings, requires the write lock to be held.
    pub fn save_config(&self, config: &SystemSettings) -> Result<(), Error> {
        validate_system_settings(config)?;

        let raw = proxmox_simple_config::to_bytes(config, &SystemSettings::API_SCHEMA)?;
        replace_config(&self.config_file, &raw)
    }
}

// Validate the configuration beyond what the schema already enforces.
fn validate_system_settings(config: &SystemSettings) -> Result<(), Error> {
    for port in [config.backend_port, config.frontend_port].into_iter().flatten() {
        if port == 0 {
            bail!("port numbers must be within 1..65535");
        }
    }

    if let Some(origins) = config.allowed_origins.as_deref() {
        for origin in origins.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            if origin != "*" && !origin.starts_with("http://") && !origin.starts_with("https://") {
                bail!("allowed origin {origin:?} must be '*' or an absolute http(s) URL");
            }
        }
    }

    if let Some(timeout) = config.connection_timeout {
        if timeout == 0 || timeout > 600 {
            bail!("connection timeout must be within 1..600 seconds");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_validation() {
        let mut settings = SystemSettings::default();
        settings.allowed_origins = Some("https://pulse.example.com, *".to_string());
        assert!(validate_system_settings(&settings).is_ok());

        settings.allowed_origins = Some("ftp://pulse.example.com".to_string());
        assert!(validate_system_settings(&settings).is_err());
    }

    #[test]
    fn timeout_bounds() {
        let mut settings = SystemSettings::default();
        settings.connection_timeout = Some(10);
        assert!(validate_system_settings(&settings).is_ok());

        settings.connection_timeout = Some(0);
        assert!(validate_system_settings(&settings).is_err());
    }
}
