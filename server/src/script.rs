//! Setup script generation.
//!
//! `GET /api/setup-script` hands the caller a ready-to-run bash script that
//! creates a monitoring user and token on the hypervisor and posts the
//! token back to us. The script templates are rendered with handlebars;
//! the SSH keys embedded for optional temperature collection are generated
//! here, once, into the pulse user's `~/.ssh`.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use handlebars::Handlebars;
use serde_json::json;

use proxmox_sys::fs::{replace_file, CreateOptions};

use pulse_api_types::NodeType;

use crate::normalize::host_part;

const PVE_TEMPLATE: &str = include_str!("../templates/setup-pve.sh.hbs");
const PBS_TEMPLATE: &str = include_str!("../templates/setup-pbs.sh.hbs");

/// Environment variable overriding the container SSH key guard.
const ALLOW_CONTAINER_SSH: &str = "PULSE_DEV_ALLOW_CONTAINER_SSH";

/// Parameters a script is rendered with.
pub struct ScriptParams {
    pub ty: NodeType,
    /// Host the script will register (as the user entered it).
    pub host: String,
    /// Base URL of this Pulse instance, as reachable from the host.
    pub pulse_url: String,
    /// The one-time setup code authorizing the callback.
    pub auth_token: String,
    /// Grant the created token backup related privileges.
    pub backup_perms: bool,
}

/// Render the setup script for `params`.
///
/// `ssh_keys` is optional; without it the script skips the temperature
/// collection setup.
pub fn render_setup_script(
    params: &ScriptParams,
    ssh_keys: Option<&SshKeys>,
) -> Result<String, Error> {
    let template = match params.ty {
        NodeType::Pve => PVE_TEMPLATE,
        NodeType::Pbs => PBS_TEMPLATE,
        NodeType::Pmg => bail!("no setup script available for PMG"),
    };

    let pulse_host = host_part(&params.pulse_url).to_string();

    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);

    let data = json!({
        "pulse_url": params.pulse_url.trim_end_matches('/'),
        "pulse_host": pulse_host,
        // dots become dashes inside token ids
        "pulse_host_dashed": pulse_host.replace('.', "-"),
        "host": params.host,
        "auth_token": params.auth_token,
        "backup_perms": params.backup_perms,
        "proxy_public_key": ssh_keys.map(|k| k.proxy_public.clone()),
        "sensors_public_key": ssh_keys.map(|k| k.sensors_public.clone()),
    });

    handlebars
        .render_template(template, &data)
        .map_err(|err| format_err!("unable to render setup script - {err}"))
}

/// The public halves of the two SSH key pairs used for temperature
/// collection.
pub struct SshKeys {
    pub proxy_public: String,
    pub sensors_public: String,
}

/// Generate (or re-use) the `proxy` and `sensors` Ed25519 key pairs in the
/// pulse user's `~/.ssh`.
///
/// Generating SSH keys inside a container is refused unless explicitly
/// allowed via `PULSE_DEV_ALLOW_CONTAINER_SSH=true`.
pub fn ensure_ssh_keys() -> Result<SshKeys, Error> {
    if running_in_container() && std::env::var(ALLOW_CONTAINER_SSH).as_deref() != Ok("true") {
        bail!("refusing to create SSH keys inside a container (set {ALLOW_CONTAINER_SSH}=true to override)");
    }

    let ssh_dir = ssh_dir()?;

    let proxy_public = ensure_key_pair(&ssh_dir, "pulse_proxy")?;
    let sensors_public = ensure_key_pair(&ssh_dir, "pulse_sensors")?;

    Ok(SshKeys {
        proxy_public,
        sensors_public,
    })
}

fn ssh_dir() -> Result<PathBuf, Error> {
    let user = pulse_config::api_user()?;
    let dir = user.dir.join(".ssh");

    let dir_opts = CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o700))
        .owner(user.uid)
        .group(user.gid);
    proxmox_sys::fs::create_path(&dir, None, Some(dir_opts))?;

    Ok(dir)
}

/// Create the key pair `name` if missing; returns the authorized_keys line.
fn ensure_key_pair(ssh_dir: &Path, name: &str) -> Result<String, Error> {
    let private_path = ssh_dir.join(format!("id_ed25519_{name}"));
    let public_path = ssh_dir.join(format!("id_ed25519_{name}.pub"));

    if public_path.exists() {
        let line = proxmox_sys::fs::file_read_string(&public_path)?;
        return Ok(line.trim_end().to_string());
    }

    let user = pulse_config::api_user()?;

    let key = openssl::pkey::PKey::generate_ed25519()?;
    let private_pem = key.private_key_to_pem_pkcs8()?;
    let public_line = format!(
        "ssh-ed25519 {} pulse-{name}",
        proxmox_base64::encode(&ssh_public_blob(&key.raw_public_key()?))
    );

    let private_opts = CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o600))
        .owner(user.uid)
        .group(user.gid);
    replace_file(&private_path, &private_pem, private_opts, true)?;

    let public_opts = CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o644))
        .owner(user.uid)
        .group(user.gid);
    replace_file(&public_path, format!("{public_line}\n").as_bytes(), public_opts, true)?;

    Ok(public_line)
}

/// Assemble the OpenSSH wire blob for an Ed25519 public key.
fn ssh_public_blob(raw_public: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(4 + 11 + 4 + raw_public.len());
    push_ssh_string(&mut blob, b"ssh-ed25519");
    push_ssh_string(&mut blob, raw_public);
    blob
}

fn push_ssh_string(blob: &mut Vec<u8>, data: &[u8]) {
    blob.extend_from_slice(&(data.len() as u32).to_be_bytes());
    blob.extend_from_slice(data);
}

fn running_in_container() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() || {
        match proxmox_sys::fs::file_read_optional_string("/run/systemd/container") {
            Ok(Some(kind)) => !kind.trim().is_empty(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_blob_layout() {
        let blob = ssh_public_blob(&[0u8; 32]);
        // 4 byte length + "ssh-ed25519" + 4 byte length + 32 byte key
        assert_eq!(blob.len(), 4 + 11 + 4 + 32);
        assert_eq!(&blob[..4], &11u32.to_be_bytes());
        assert_eq!(&blob[4..15], b"ssh-ed25519");
        assert_eq!(&blob[15..19], &32u32.to_be_bytes());
    }

    #[test]
    fn pmg_has_no_script() {
        let params = ScriptParams {
            ty: NodeType::Pmg,
            host: "mail1".into(),
            pulse_url: "https://pulse.example:7655".into(),
            auth_token: "ABCDEF".into(),
            backup_perms: false,
        };
        assert!(render_setup_script(&params, None).is_err());
    }

    #[test]
    fn rendered_script_embeds_parameters() {
        let params = ScriptParams {
            ty: NodeType::Pve,
            host: "10.1.1.5".into(),
            pulse_url: "https://10.1.1.2:7655/".into(),
            auth_token: "ABCDEF".into(),
            backup_perms: true,
        };
        let keys = SshKeys {
            proxy_public: "ssh-ed25519 AAAA pulse-proxy".into(),
            sensors_public: "ssh-ed25519 BBBB pulse-sensors".into(),
        };
        let script = render_setup_script(&params, Some(&keys)).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        // trailing slash of the pulse URL is dropped
        assert!(script.contains("PULSE_URL=\"https://10.1.1.2:7655\""));
        assert!(script.contains("/api/auto-register"));
        assert!(script.contains("ABCDEF"));
        assert!(script.contains("pulse-10-1-1-2"));
        assert!(script.contains("ssh-ed25519 AAAA pulse-proxy"));
    }
}
