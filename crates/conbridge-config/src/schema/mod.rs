//! Configuration schema types for conbridge.
//!
//! All structs use `serde(default)` so partial configs work correctly.

mod console;
mod logging;
mod process;
mod relay;

pub use console::*;
pub use logging::*;
pub use process::*;
pub use relay::*;

use conbridge_common::{Size, WaitPolicy};
use serde::{Deserialize, Serialize};

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Root configuration for conbridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConbridgeConfig {
    pub console: ConsoleConfig,
    pub process: ProcessConfig,
    pub relay: RelayConfig,
    pub logging: LoggingConfig,
}

impl ConbridgeConfig {
    /// Pseudo-console size used when the caller supplies none.
    pub fn size(&self) -> Size {
        Size::new(self.console.cols, self.console.rows)
    }

    /// Exit-wait policy; `wait_timeout_ms = 0` waits forever.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::from_millis(self.process.wait_timeout_ms)
    }
}
