//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# conbridge configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[console]
# cols = 80              # 1-32767, used when the console size cannot be detected
# rows = 24              # 1-32767

[process]
# command = ""           # empty = %COMSPEC%, falling back to cmd.exe
# wait_timeout_ms = 0    # 0 = wait for the child forever

[relay]
# chunk_size = 1024      # bytes per read, 1-65536

[logging]
# level = "info"         # trace, debug, info, warn, error
"##
    .to_string()
}
