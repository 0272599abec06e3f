//! Common API endpoints

use anyhow::Error;
use serde_json::{json, Value};

use proxmox_router::{list_subdirs_api_method, Permission, Router, SubdirMap};
use proxmox_schema::api;
use proxmox_sortable_macro::sortable;

pub mod auto_register;
pub mod discover;
pub mod import_export;
pub mod nodes;
pub mod setup_script;
pub mod system_settings;
pub mod temperature_proxy;

#[sortable]
const SUBDIRS: SubdirMap = &sorted!([
    ("auto-register", &auto_register::ROUTER),
    ("config", &CONFIG_ROUTER),
    ("discover", &discover::ROUTER),
    ("ping", &Router::new().get(&API_METHOD_PING)),
    ("setup-script", &setup_script::ROUTER),
    ("system", &SYSTEM_ROUTER),
    ("temperature-proxy", &temperature_proxy::ROUTER),
    ("version", &Router::new().get(&API_METHOD_VERSION)),
]);

#[sortable]
const CONFIG_SUBDIRS: SubdirMap = &sorted!([
    ("export", &import_export::EXPORT_ROUTER),
    ("import", &import_export::IMPORT_ROUTER),
    ("nodes", &nodes::ROUTER),
]);

const CONFIG_ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(CONFIG_SUBDIRS))
    .subdirs(CONFIG_SUBDIRS);

#[sortable]
const SYSTEM_SUBDIRS: SubdirMap = &sorted!([("settings", &system_settings::ROUTER),]);

const SYSTEM_ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SYSTEM_SUBDIRS))
    .subdirs(SYSTEM_SUBDIRS);

pub const ROUTER: Router = Router::new()
    .get(&list_subdirs_api_method!(SUBDIRS))
    .subdirs(SUBDIRS);

#[api(
    access: {
        description: "Anyone can access this, just a cheap check if the API daemon is online.",
        permission: &Permission::World,
    }
)]
/// A simple ping method. returns "pong"
fn ping() -> Result<String, Error> {
    Ok("pong".to_string())
}

#[api(
    access: {
        description: "Any valid user can access this.",
        permission: &Permission::Anybody,
    }
)]
/// Return the program's version/release info
fn version() -> Result<Value, Error> {
    Ok(json!({
        "version": pulse_buildcfg::PULSE_PKG_VERSION,
        "release": pulse_buildcfg::PULSE_PKG_RELEASE,
        "repoid": pulse_buildcfg::PULSE_PKG_REPOID
    }))
}
