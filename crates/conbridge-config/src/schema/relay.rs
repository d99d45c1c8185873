use serde::{Deserialize, Serialize};

/// Byte relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bytes moved per read in each relay direction.
    pub chunk_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { chunk_size: 1024 }
    }
}
