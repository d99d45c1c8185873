//! Pseudo-console process bridge.
//!
//! Runs one command attached to a native pseudo-console and relays bytes
//! between the console and a caller-supplied duplex endpoint until the
//! command exits. All native calls go through an injected [`ConsoleApi`]:
//! [`native_backend`] for the real platform, [`SimConsole`] for tests.
//!
//! ```rust,no_run
//! use conbridge_common::Size;
//! use conbridge_pty::{native_backend, run_process_with_pty};
//!
//! let api = native_backend().expect("pseudo-consoles unavailable");
//! run_process_with_pty(api, "cmd.exe /c dir", Size::new(120, 30), std::io::stdin(), std::io::stdout())
//!     .expect("bridge failed");
//! ```

pub mod attributes;
pub mod console;
pub mod launcher;
pub mod native;
pub mod pipe;
pub mod relay;
pub mod session;

pub use attributes::{AttributeList, AttributeListBuilder, PendingAttributeList};
pub use console::PseudoConsole;
pub use launcher::{ChildProcess, WaitOutcome};
pub use native::{native_backend, ConsoleApi, SimConsole, SimFault};
pub use pipe::{PipeEndpoint, PipePair, PipeRole};
pub use relay::{RelayEnd, RelayStats, DEFAULT_CHUNK_SIZE};
pub use session::{
    Bridge, BridgeOptions, BridgeSession, BridgeState, Resizer, RunReport, OUTPUT_DRAIN_GRACE,
};

use conbridge_common::{BridgeError, Size};
use std::io::{Read, Write};
use std::sync::Arc;

/// Run `command` under a new pseudo-console of `size`, relaying `input` to
/// it and its output to `output`, and block until the command exits.
///
/// Waits indefinitely. Returns `ChildProcessFailed` for a non-zero exit
/// code, carrying any teardown failures; after a clean exit those are
/// logged, not returned.
/// Use [`Bridge`] directly for a bounded wait, resizing, or the full
/// [`RunReport`].
pub fn run_process_with_pty<R, W>(
    api: Arc<dyn ConsoleApi>,
    command: &str,
    size: Size,
    input: R,
    output: W,
) -> Result<(), BridgeError>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    Bridge::new(api, BridgeOptions::default())
        .session(command, size)
        .run(input, output)?
        .into_result()
}
