//! Configuration file management for Pulse.
//!
//! All persisted configuration is tenant scoped: every tenant owns a data
//! directory below [`tenants_base_dir`] holding its `nodes.cfg`, `system.cfg`
//! and the opaque files the import/export vault manages. The `default`
//! tenant's directory is created on first use.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use nix::unistd::{Gid, Group, Uid, User};

pub use pulse_buildcfg::{PULSE_GROUP_NAME, PULSE_USER_NAME};

pub mod nodes;
pub mod system;

/// Return User info for the 'pulse' user (``getpwnam_r(3)``)
pub fn api_user() -> Result<nix::unistd::User, Error> {
    if cfg!(test) {
        Ok(User::from_uid(Uid::current())?.expect("current user does not exist"))
    } else {
        User::from_name(PULSE_USER_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' user.", PULSE_USER_NAME))
    }
}

/// Return Group info for the 'pulse' group (``getgrnam(3)``)
pub fn api_group() -> Result<nix::unistd::Group, Error> {
    if cfg!(test) {
        Ok(Group::from_gid(Gid::current())?.expect("current group does not exist"))
    } else {
        Group::from_name(PULSE_GROUP_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' group.", PULSE_GROUP_NAME))
    }
}

/// The directory holding one subdirectory per tenant.
pub fn tenants_base_dir() -> PathBuf {
    PathBuf::from(pulse_buildcfg::statedir!("/tenants"))
}

/// The data directory of a single tenant.
///
/// The org id is restricted to the safe-id character set by the API schema,
/// so it cannot escape the base directory.
pub fn tenant_dir(org_id: &str) -> PathBuf {
    tenants_base_dir().join(org_id)
}

/// Create a tenant's data directory (and parents) if it does not exist yet.
pub fn ensure_tenant_dir(org_id: &str) -> Result<PathBuf, Error> {
    let dir = tenant_dir(org_id);
    create_config_dir(&dir)?;
    Ok(dir)
}

/// List the org ids which currently have a data directory.
pub fn existing_tenants() -> Result<Vec<String>, Error> {
    let base = tenants_base_dir();
    let mut tenants = Vec::new();
    let read_dir = match std::fs::read_dir(&base) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tenants),
        Err(err) => return Err(format_err!("unable to read {base:?} - {err}")),
    };
    for entry in read_dir {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(name) = entry.file_name().into_string() {
                tenants.push(name);
            }
        }
    }
    tenants.sort();
    Ok(tenants)
}

fn create_config_dir(dir: &Path) -> Result<(), Error> {
    let user = api_user()?;
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o700))
        .owner(user.uid)
        .group(user.gid);

    proxmox_sys::fs::create_path(dir, None, Some(options))
        .map_err(|err| format_err!("unable to create directory {dir:?} - {err}"))?;
    Ok(())
}
