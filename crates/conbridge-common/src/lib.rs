pub mod errors;
pub mod id;
pub mod types;

pub use errors::{BridgeError, ConfigError, ConsoleError, Direction, Stage};
pub use id::SessionId;
pub use types::{ExitStatus, Size, WaitPolicy};
