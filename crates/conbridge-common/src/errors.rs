use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Setup stage at which a bridged session failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pipes,
    Console,
    Attributes,
    Launch,
    Relay,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pipes => "pipe creation",
            Stage::Console => "pseudo-console creation",
            Stage::Attributes => "attribute list construction",
            Stage::Launch => "process launch",
            Stage::Relay => "relay start",
        };
        f.write_str(name)
    }
}

/// Direction of one relay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Pseudo-console output to the external endpoint.
    Output,
    /// External endpoint to pseudo-console input.
    Input,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => f.write_str("output"),
            Direction::Input => f.write_str("input"),
        }
    }
}

/// Failure of a single native call or native protocol step.
///
/// Every variant that originates in the platform carries the raw status
/// (a Win32 error code or an `HRESULT` reinterpreted as `u32`).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("{call} failed with status {status:#010x}")]
    PlatformCallFailed { call: &'static str, status: u32 },

    #[error("attribute list size query failed (ret={ret}, status={status:#010x}, size={size})")]
    AttributeListSizeQueryFailed { ret: i32, status: u32, size: usize },

    #[error("attribute list populate failed in {call} (status {status:#010x})")]
    AttributeListPopulateFailed { call: &'static str, status: u32 },

    #[error("process launch failed (status {status:#010x})")]
    ProcessLaunchFailed { status: u32 },

    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },

    #[error("pseudo-console API unavailable: {0}")]
    Unsupported(String),
}

impl ConsoleError {
    /// Native status code attached to this error, if any.
    pub fn status(&self) -> Option<u32> {
        match self {
            ConsoleError::PlatformCallFailed { status, .. }
            | ConsoleError::AttributeListSizeQueryFailed { status, .. }
            | ConsoleError::AttributeListPopulateFailed { status, .. }
            | ConsoleError::ProcessLaunchFailed { status } => Some(*status),
            ConsoleError::ShortWrite { .. } | ConsoleError::Unsupported(_) => None,
        }
    }
}

impl From<ConsoleError> for io::Error {
    fn from(err: ConsoleError) -> Self {
        let kind = match err {
            ConsoleError::ShortWrite { .. } => io::ErrorKind::WriteZero,
            ConsoleError::Unsupported(_) => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Terminal error of one bridged session.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge setup failed during {stage}: {source}")]
    SetupFailed {
        stage: Stage,
        #[source]
        source: ConsoleError,
        /// Failures hit while unwinding the partially built session.
        teardown: Vec<ConsoleError>,
    },

    #[error("child process exited with code {code}")]
    ChildProcessFailed {
        code: u32,
        teardown: Vec<ConsoleError>,
    },

    #[error("child process still running after {timeout:?}")]
    ExitWaitTimedOut {
        timeout: Duration,
        teardown: Vec<ConsoleError>,
    },

    #[error("waiting for the child process failed: {source}")]
    ExitWaitFailed {
        #[source]
        source: ConsoleError,
        teardown: Vec<ConsoleError>,
    },

    #[error("relay failed in both directions before any data moved (output: {output}; input: {input})")]
    RelayFailed { output: io::Error, input: io::Error },

    #[error("bridge teardown failed: {}", describe_all(.0))]
    TeardownFailed(Vec<ConsoleError>),

    #[error("cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Low-level native status behind this error, for diagnostics.
    pub fn native_status(&self) -> Option<u32> {
        match self {
            BridgeError::SetupFailed { source, .. } | BridgeError::ExitWaitFailed { source, .. } => {
                source.status()
            }
            BridgeError::Console(e) => e.status(),
            BridgeError::TeardownFailed(errors) => errors.iter().find_map(ConsoleError::status),
            _ => None,
        }
    }

    /// Teardown failures attached to a failed session.
    pub fn teardown_errors(&self) -> &[ConsoleError] {
        match self {
            BridgeError::SetupFailed { teardown, .. }
            | BridgeError::ChildProcessFailed { teardown, .. }
            | BridgeError::ExitWaitTimedOut { teardown, .. }
            | BridgeError::ExitWaitFailed { teardown, .. } => teardown,
            BridgeError::TeardownFailed(errors) => errors,
            _ => &[],
        }
    }
}

fn describe_all(errors: &[ConsoleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
