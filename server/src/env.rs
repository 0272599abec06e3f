//! Process environment helpers.

/// Clear environment variables which could influence libraries in
/// surprising ways; keep only a conservative allow list.
pub fn sanitize_environment_vars() {
    let keep = ["PATH", "HOME", "LANG", "USER", "SHELL", "TERM", "PULSE_DEBUG"];
    let vars: Vec<String> = std::env::vars()
        .map(|(name, _)| name)
        .filter(|name| !keep.contains(&name.as_str()) && !name.starts_with("PULSE_"))
        .collect();
    for name in vars {
        std::env::remove_var(name);
    }
}
