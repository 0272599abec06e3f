//! Best-effort calls to the host side sensor-proxy helper.
//!
//! The helper listens on a local unix socket; losing it only degrades
//! temperature collection, so every call here is fire and forget.

use anyhow::Error;
use serde_json::Value;

/// Ask the helper to drop per-host state after a node was deleted.
pub async fn cleanup_host(host: &str) -> Result<(), Error> {
    let command = format!(
        "{}\n",
        serde_json::json!({ "command": "cleanup-host", "host": host })
    );
    let _: Value = proxmox_daemon::command_socket::send_raw(
        std::path::PathBuf::from(pulse_buildcfg::SENSOR_PROXY_SOCKET_FN),
        &command,
    )
    .await?;
    Ok(())
}
