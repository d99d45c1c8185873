//! conbridge: run one command under a pseudo-console, bridged to this
//! process's standard streams.
//!
//! The process exits with the child's exit code, or 1 when the bridge
//! itself fails.

mod cli;

use conbridge_common::{BridgeError, ConfigError, Size, WaitPolicy};
use conbridge_config::ConbridgeConfig;
use conbridge_pty::{native_backend, Bridge, BridgeOptions};
use std::io;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Exit code for failures of the bridge itself.
const BRIDGE_FAILURE: i32 = 1;

fn main() {
    let args = cli::parse();

    // Config comes first so its log level can seed the filter.
    let (config, config_error) = match load_config(&args) {
        Ok(config) => (config, None),
        Err(e) if args.config.is_some() => {
            eprintln!("conbridge: {e}");
            std::process::exit(BRIDGE_FAILURE);
        }
        Err(e) => (ConbridgeConfig::default(), Some(e)),
    };

    let log_directive = args
        .log_level
        .clone()
        .unwrap_or_else(|| format!("conbridge={}", config.logging.level.to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                log_directive
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            ),
        )
        .init();

    tracing::debug!("conbridge v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        tracing::warn!("Config load failed, using defaults: {e}");
    }

    let code = match run(&args, &config) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, status = ?e.native_status(), "Bridge failed");
            eprintln!("conbridge: {e}");
            BRIDGE_FAILURE
        }
    };
    // The input relay may still be parked on stdin; exiting ends it.
    std::process::exit(code);
}

fn load_config(args: &cli::Args) -> Result<ConbridgeConfig, ConfigError> {
    match &args.config {
        Some(path) => {
            let config = conbridge_config::load_from_path(path)?;
            conbridge_config::validation::validate(&config)?;
            Ok(config)
        }
        None => conbridge_config::load_config(),
    }
}

/// Run the bridged command and return the child's exit code.
fn run(args: &cli::Args, config: &ConbridgeConfig) -> Result<i32, BridgeError> {
    let api = native_backend()?;

    let command =
        cli::command_line(&args.command).unwrap_or_else(|| config.process.resolved_command());
    let size = resolve_size(args, config);
    if !size.is_valid() {
        return Err(BridgeError::Config(ConfigError::ValidationError(format!(
            "console size {size} out of range (1-32767 per dimension)"
        ))));
    }
    let options = BridgeOptions {
        wait: args
            .timeout_ms
            .map(WaitPolicy::from_millis)
            .unwrap_or_else(|| config.wait_policy()),
        chunk_size: config.relay.chunk_size,
    };

    let session = Bridge::new(api, options).session(command, size);
    let report = session.run(io::stdin(), io::stdout())?;
    if let Err(e) = &report.teardown {
        tracing::warn!(error = %e, "Teardown reported failures");
    }
    tracing::info!("Child exited with {}", report.exit);
    // Windows exit codes are 32-bit; keep the bit pattern.
    Ok(report.exit.code as i32)
}

/// Explicit flags win, then the controlling console, then config.
fn resolve_size(args: &cli::Args, config: &ConbridgeConfig) -> Size {
    let base = controlling_console_size().unwrap_or_else(|| config.size());
    Size::new(
        args.cols.unwrap_or(base.width),
        args.rows.unwrap_or(base.height),
    )
}

#[cfg(windows)]
fn controlling_console_size() -> Option<Size> {
    conbridge_pty::native::console_size()
}

#[cfg(not(windows))]
fn controlling_console_size() -> Option<Size> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn flags_override_config_size() {
        let args = cli::Args::try_parse_from(["conbridge", "--cols", "100"]).unwrap();
        let config = ConbridgeConfig::default();
        let size = resolve_size(&args, &config);
        assert_eq!(size.width, 100);
        if controlling_console_size().is_none() {
            assert_eq!(size.height, 24);
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn run_reports_unsupported_off_windows() {
        let args = cli::Args::try_parse_from(["conbridge", "echo", "hi"]).unwrap();
        let err = run(&args, &ConbridgeConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Console(conbridge_common::ConsoleError::Unsupported(_))
        ));
    }
}
