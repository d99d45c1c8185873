//! Pseudo-console geometry defaults.

use serde::{Deserialize, Serialize};

/// Default pseudo-console dimensions, used when neither the caller nor
/// the controlling console supplies a size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Width in character cells.
    pub cols: u16,
    /// Height in character cells.
    pub rows: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_config_defaults() {
        let config = ConsoleConfig::default();
        assert_eq!(config.cols, 80);
        assert_eq!(config.rows, 24);
    }

    #[test]
    fn console_config_partial_toml() {
        let config: ConsoleConfig = toml::from_str("rows = 50").unwrap();
        assert_eq!(config.cols, 80);
        assert_eq!(config.rows, 50);
    }
}
