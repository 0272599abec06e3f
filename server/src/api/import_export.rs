//! Encrypted configuration import and export.
//!
//! The cryptography itself lives behind the tenant's [`ConfigVault`]; this
//! module gates on passphrase strength and, on import, synchronously
//! reloads the monitor and its dependents so the restored configuration is
//! live before the response goes out.

use std::sync::Arc;

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{http_bail, Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use crate::tenant::{lookup_tenant, TenantState};

pub const EXPORT_ROUTER: Router = Router::new().post(&API_METHOD_EXPORT_CONFIG);
pub const IMPORT_ROUTER: Router = Router::new().post(&API_METHOD_IMPORT_CONFIG);

const MIN_PASSPHRASE_LEN: usize = 12;

#[api(
    input: {
        properties: {
            passphrase: {
                type: String,
                description: "Passphrase protecting the dump, at least 12 characters.",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Produce an encrypted dump of the tenant's complete configuration.
pub fn export_config(passphrase: String, rpcenv: &mut dyn RpcEnvironment) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_export_config(&tenant, &passphrase)
}

pub fn do_export_config(tenant: &Arc<TenantState>, passphrase: &str) -> Result<Value, Error> {
    check_passphrase(passphrase)?;

    let data = tenant.vault.export_config(passphrase).map_err(|err| {
        log::error!("config export failed - {err:#}");
        proxmox_router::http_err!(INTERNAL_SERVER_ERROR, "config export failed")
    })?;

    Ok(json!({ "data": data }))
}

#[api(
    input: {
        properties: {
            data: {
                type: String,
                description: "An encrypted dump produced by the export endpoint.",
            },
            passphrase: {
                type: String,
                description: "Passphrase the dump was encrypted with.",
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Restore the tenant's configuration from an encrypted dump.
pub async fn import_config(
    data: String,
    passphrase: String,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_import_config(&tenant, &data, &passphrase).await
}

pub async fn do_import_config(
    tenant: &Arc<TenantState>,
    data: &str,
    passphrase: &str,
) -> Result<Value, Error> {
    check_passphrase(passphrase)?;

    tenant.vault.import_config(data, passphrase).map_err(|err| {
        log::error!("config import failed - {err:#}");
        proxmox_router::http_err!(BAD_REQUEST, "config import failed")
    })?;

    // nodes, alerts, webhooks, email and guest metadata were all replaced;
    // an import is only done once the monitor picked them up, so reload
    // failures are a hard error here, unlike everywhere else
    if let Err(err) = tenant.monitor.reload().await {
        log::error!("monitor reload after import failed - {err:#}");
        http_bail!(
            INTERNAL_SERVER_ERROR,
            "configuration imported, but reloading the monitor failed"
        );
    }
    if let Err(err) = tenant.monitor.notification_manager().reload() {
        log::error!("notification reload after import failed - {err:#}");
        http_bail!(
            INTERNAL_SERVER_ERROR,
            "configuration imported, but reloading notifications failed"
        );
    }

    Ok(json!({ "status": "success" }))
}

fn check_passphrase(passphrase: &str) -> Result<(), Error> {
    if passphrase.len() < MIN_PASSPHRASE_LEN {
        http_bail!(
            BAD_REQUEST,
            "passphrase must be at least {MIN_PASSPHRASE_LEN} characters"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_passphrases_are_rejected() {
        assert!(check_passphrase("tooshort").is_err());
        assert!(check_passphrase("long-enough-passphrase").is_ok());
    }
}
