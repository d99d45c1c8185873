//! Child process launch settings.

use serde::{Deserialize, Serialize};

/// Which command runs under the pseudo-console and how long to wait for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Command line to launch. Empty means `%COMSPEC%`, falling back to
    /// `cmd.exe`.
    pub command: String,
    /// Exit-wait bound in milliseconds. `0` waits forever, which is what
    /// interactive shells need.
    pub wait_timeout_ms: u64,
}

impl ProcessConfig {
    /// Resolve the configured command line, detecting the shell when empty.
    pub fn resolved_command(&self) -> String {
        if self.command.trim().is_empty() {
            default_shell()
        } else {
            self.command.clone()
        }
    }
}

/// The user's command interpreter.
///
/// Reads `COMSPEC`, falling back to `cmd.exe`.
pub fn default_shell() -> String {
    std::env::var("COMSPEC")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "cmd.exe".to_string())
}
