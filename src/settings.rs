//! Environment-knob configuration.
//!
//! The server is embedded and carries no CLI or config file of its own; the
//! few operational switches it honors are environment variables read once at
//! construction.

use std::path::PathBuf;

/// Debug and feature switches, captured once when the server is built.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Path to a local policy JSON file used when the netmap carries no
    /// policy (or when the mesh policy is ignored).
    pub debug_policy_file: Option<PathBuf>,
    /// Ignore any policy delivered via the netmap and rely on the debug
    /// policy file alone.
    pub ignore_mesh_policy: bool,
    /// Emit per-session verbose log lines.
    pub verbose_session_logs: bool,
    /// Record pty sessions to cast files under the var root.
    pub record_sessions: bool,
}

impl Settings {
    /// Read all knobs from the process environment.
    pub fn from_env() -> Self {
        Self {
            debug_policy_file: std::env::var("MESHSSH_DEBUG_POLICY_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ignore_mesh_policy: env_bool("MESHSSH_IGNORE_MESH_POLICY"),
            verbose_session_logs: env_bool("MESHSSH_VLOG"),
            record_sessions: env_bool("MESHSSH_RECORD_SESSIONS"),
        }
    }
}

/// Boolean env knob: "1", "true", "yes" (any case) enable, everything else
/// (including unset) disables.
fn env_bool(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}
