//! Global system settings endpoints.

use std::sync::Arc;

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{Permission, Router, RpcEnvironment};
use proxmox_schema::api;

use pulse_api_types::{ConfigDigest, SystemSettings};

use crate::tenant::{lookup_tenant, TenantState};

pub const ROUTER: Router = Router::new()
    .get(&API_METHOD_GET_SYSTEM_SETTINGS)
    .put(&API_METHOD_UPDATE_SYSTEM_SETTINGS);

#[api(
    returns: { type: SystemSettings },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Read the tenant's system settings.
pub fn get_system_settings(rpcenv: &mut dyn RpcEnvironment) -> Result<SystemSettings, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    let (settings, _digest) = tenant.system.config()?;
    Ok(settings)
}

#[api(
    input: {
        properties: {
            settings: {
                flatten: true,
                type: SystemSettings,
            },
            digest: {
                optional: true,
                type: ConfigDigest,
            },
        },
    },
    access: {
        permission: &Permission::Anybody,
    },
)]
/// Replace the tenant's system settings.
///
/// Fields left out keep their current value; the settings cache of the
/// monitor is reloaded afterwards.
pub async fn update_system_settings(
    settings: SystemSettings,
    digest: Option<ConfigDigest>,
    rpcenv: &mut dyn RpcEnvironment,
) -> Result<Value, Error> {
    let tenant = lookup_tenant(rpcenv)?;
    do_update_system_settings(&tenant, settings, digest)
}

pub fn do_update_system_settings(
    tenant: &Arc<TenantState>,
    update: SystemSettings,
    digest: Option<ConfigDigest>,
) -> Result<Value, Error> {
    let _lock = tenant.system.lock()?;
    let (mut settings, current_digest) = tenant.system.config()?;
    current_digest.detect_modification(digest.as_ref())?;

    merge_settings(&mut settings, update);
    tenant.system.save_config(&settings)?;

    super::nodes::schedule_monitor_reload(tenant);

    Ok(json!({ "status": "success" }))
}

fn merge_settings(settings: &mut SystemSettings, update: SystemSettings) {
    macro_rules! merge {
        ($($field:ident),* $(,)?) => {
            $(
                if update.$field.is_some() {
                    settings.$field = update.$field;
                }
            )*
        };
    }

    merge!(
        pbs_polling_interval,
        backup_polling_interval,
        backend_port,
        frontend_port,
        allowed_origins,
        public_url,
        connection_timeout,
        update_channel,
        auto_update_enabled,
        auto_update_check_interval,
        log_level,
        theme,
        allow_embedding,
        discovery_subnet,
        backup_polling_enabled,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_fields() {
        let mut current = SystemSettings::default();
        current.connection_timeout = Some(10);
        current.theme = Some(pulse_api_types::ThemePreference::Dark);

        let mut update = SystemSettings::default();
        update.connection_timeout = Some(20);

        merge_settings(&mut current, update);
        assert_eq!(current.connection_timeout, Some(20));
        assert_eq!(current.theme, Some(pulse_api_types::ThemePreference::Dark));
    }
}
