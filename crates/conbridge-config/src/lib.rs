//! Conbridge configuration.
//!
//! TOML-based configuration for the pseudo-console bridge. Every section
//! uses serde defaults so a partial (or empty) file works out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use conbridge_config::load_config;
//!
//! let config = load_config().expect("failed to load config");
//! println!("console size: {}", config.size());
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{
    ConbridgeConfig, ConsoleConfig, LoggingConfig, ProcessConfig, RelayConfig,
    CONFIG_SCHEMA_VERSION,
};
pub use toml_loader::{load_default, load_from_path};

use conbridge_common::ConfigError;

/// Load config from the platform default path and validate it.
///
/// Creates a commented default file on first use.
pub fn load_config() -> Result<ConbridgeConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}
