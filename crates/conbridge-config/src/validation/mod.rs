//! Full configuration validation.
//!
//! Every range check runs; all violations are reported together.

mod helpers;


use crate::schema::ConbridgeConfig;
use conbridge_common::ConfigError;
use helpers::validate_range;

/// Largest relay chunk accepted.
pub const MAX_CHUNK_SIZE: usize = 65_536;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &ConbridgeConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    // Console geometry must fit a native COORD.
    let max_dim = i16::MAX as u64;
    validate_range(&mut errors, "console.cols", u64::from(config.console.cols), 1, max_dim);
    validate_range(&mut errors, "console.rows", u64::from(config.console.rows), 1, max_dim);

    validate_range(
        &mut errors,
        "relay.chunk_size",
        config.relay.chunk_size as u64,
        1,
        MAX_CHUNK_SIZE as u64,
    );

    // The native wait takes a u32 millisecond count; u32::MAX means INFINITE.
    validate_range(
        &mut errors,
        "process.wait_timeout_ms",
        config.process.wait_timeout_ms,
        0,
        u64::from(u32::MAX - 1),
    );

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        errors.push(format!(
            "logging.level = {:?} is not one of {}",
            config.logging.level,
            LOG_LEVELS.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
