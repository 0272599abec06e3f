//! Interface to the encrypted configuration import/export.
//!
//! The cryptography lives outside this crate; the endpoints only gate on
//! passphrase strength and orchestrate the reloads after an import.

use anyhow::Error;

/// Encrypts and decrypts complete configuration dumps.
pub trait ConfigVault: Send + Sync {
    /// Produce an encrypted dump of every persisted config file of the
    /// tenant's data path.
    fn export_config(&self, passphrase: &str) -> Result<String, Error>;

    /// Atomically replace the persisted config files from a dump.
    fn import_config(&self, data: &str, passphrase: &str) -> Result<(), Error>;
}

/// Placeholder wired in when no vault implementation is attached.
pub struct UnavailableVault;

impl ConfigVault for UnavailableVault {
    fn export_config(&self, _passphrase: &str) -> Result<String, Error> {
        anyhow::bail!("config export is not available on this instance");
    }

    fn import_config(&self, _data: &str, _passphrase: &str) -> Result<(), Error> {
        anyhow::bail!("config import is not available on this instance");
    }
}
