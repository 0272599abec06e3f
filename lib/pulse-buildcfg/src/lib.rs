//! Exports configuration data from the build system

pub const PULSE_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const PULSE_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");
pub const PULSE_PKG_REPOID: &str = env!("REPOID");

/// The configured configuration directory
pub const CONFIGDIR: &str = "/etc/pulse";

/// Unix system user used by the pulse API daemon
pub const PULSE_USER_NAME: &str = "pulse";
/// Unix system group used by the pulse API daemon
pub const PULSE_GROUP_NAME: &str = "pulse";

/// The TCP port the API daemon listens on
pub const PULSE_PORT: u16 = 7655;

#[macro_export]
macro_rules! PULSE_RUN_DIR_M {
    () => {
        "/run/pulse"
    };
}

#[macro_export]
macro_rules! PULSE_STATE_DIR_M {
    () => {
        "/var/lib/pulse"
    };
}

#[macro_export]
macro_rules! PULSE_LOG_DIR_M {
    () => {
        "/var/log/pulse"
    };
}

/// namespaced directory for in-memory (tmpfs) run state
pub const PULSE_RUN_DIR: &str = PULSE_RUN_DIR_M!();

/// namespaced directory for persistent state, including per-tenant data
pub const PULSE_STATE_DIR: &str = PULSE_STATE_DIR_M!();

/// namespaced directory for persistent logging
pub const PULSE_LOG_DIR: &str = PULSE_LOG_DIR_M!();

/// logfile for all API requests handled by the API daemon
pub const API_ACCESS_LOG_FN: &str = concat!(PULSE_LOG_DIR_M!(), "/api/access.log");

/// logfile for any failed authentication
pub const API_AUTH_LOG_FN: &str = concat!(PULSE_LOG_DIR_M!(), "/api/auth.log");

/// the PID filename for the API daemon
pub const PULSE_API_PID_FN: &str = concat!(PULSE_RUN_DIR_M!(), "/api.pid");

/// the Unix socket the host sensor-proxy helper listens on
pub const SENSOR_PROXY_SOCKET_FN: &str = concat!(PULSE_RUN_DIR_M!(), "/sensor-proxy.sock");

/// Prepend configuration directory to a file name
///
/// This is a simply way to get the full path for configuration files.
/// #### Example:
/// ```
/// use pulse_buildcfg::configdir;
/// let key_path = configdir!("/auth/api.key");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/pulse", $subdir)
    };
}

/// Prepend the run directory to a file name.
///
/// This is a simply way to get the full path for files in `/run`.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::PULSE_RUN_DIR_M!(), $subdir)
    };
}

/// Prepend the state directory to a file name.
#[macro_export]
macro_rules! statedir {
    ($subdir:expr) => {
        concat!($crate::PULSE_STATE_DIR_M!(), $subdir)
    };
}
