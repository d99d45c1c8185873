//! Bridge coordinator: one command run under one pseudo-console.
//!
//! A [`BridgeSession`] walks the state machine
//! `Created → PipesOpen → ConsoleCreated → AttributesBuilt →
//! ProcessLaunched → Relaying → ExitWaiting → TornDown`. Every resource it
//! creates is parked in a single owner, and teardown runs as one ordered
//! sequence on success and failure alike:
//!
//! 1. close the thread handle, then the process handle
//! 2. delete the attribute list, then free its memory
//! 3. close the pseudo-console (terminates the child if still alive and
//!    unblocks the output relay)
//! 4. give the output relay [`OUTPUT_DRAIN_GRACE`] to deliver what the
//!    child wrote
//! 5. close the outer pipe ends, whether or not the output relay finished
//!
//! Neither relay thread is joined. The input relay may be blocked reading
//! the external endpoint, and the output relay may be blocked writing to
//! it; each ends on its own at its next pipe access.

mod resize;

#[cfg(test)]
mod tests;

pub use resize::Resizer;

use crate::attributes::{AttributeList, AttributeListBuilder};
use crate::console::PseudoConsole;
use crate::launcher::{self, ChildProcess, WaitOutcome};
use crate::native::{ConsoleApi, ERROR_INVALID_HANDLE};
use crate::pipe::PipePair;
use crate::relay::{self, RelayEnd, RelayStats, DEFAULT_CHUNK_SIZE};
use conbridge_common::{
    BridgeError, ConsoleError, Direction, ExitStatus, SessionId, Size, Stage, WaitPolicy,
};
use parking_lot::Mutex;
use std::fmt;
use std::io::{Read, Write};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// How long to wait for the input relay's verdict when the output relay
/// already failed without moving data.
const INPUT_VERDICT_GRACE: Duration = Duration::from_millis(100);

/// How long teardown lets the output relay deliver the child's remaining
/// output before closing the pipe under it.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// OPTIONS
// =============================================================================

/// Per-bridge run options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Exit-wait policy. Interactive shells want `Infinite`.
    pub wait: WaitPolicy,
    /// Relay read size in bytes.
    pub chunk_size: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            wait: WaitPolicy::Infinite,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Lifecycle of a bridged session. Ordered: later states compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BridgeState {
    Created,
    PipesOpen,
    ConsoleCreated,
    AttributesBuilt,
    ProcessLaunched,
    Relaying,
    ExitWaiting,
    TornDown,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Created => "created",
            BridgeState::PipesOpen => "pipes-open",
            BridgeState::ConsoleCreated => "console-created",
            BridgeState::AttributesBuilt => "attributes-built",
            BridgeState::ProcessLaunched => "process-launched",
            BridgeState::Relaying => "relaying",
            BridgeState::ExitWaiting => "exit-waiting",
            BridgeState::TornDown => "torn-down",
        }
    }

    /// Resizes are forwarded from console creation until teardown starts.
    pub fn accepts_resize(&self) -> bool {
        (BridgeState::ConsoleCreated..=BridgeState::ExitWaiting).contains(self)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State visible to resizers while the session runs.
struct Shared {
    state: BridgeState,
    console: Option<PseudoConsole>,
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Entry point holding the native adapter and run options.
///
/// One `Bridge` serves any number of sessions; each session owns its own
/// resources.
#[derive(Clone)]
pub struct Bridge {
    api: Arc<dyn ConsoleApi>,
    options: BridgeOptions,
}

impl Bridge {
    pub fn new(api: Arc<dyn ConsoleApi>, options: BridgeOptions) -> Self {
        Self { api, options }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Prepare a session for `command` at `size`. Nothing native happens
    /// until [`BridgeSession::run`].
    pub fn session(&self, command: impl Into<String>, size: Size) -> BridgeSession {
        BridgeSession {
            id: SessionId::new(),
            api: Arc::clone(&self.api),
            options: self.options,
            command: command.into(),
            size,
            shared: Arc::new(Mutex::new(Shared {
                state: BridgeState::Created,
                console: None,
            })),
        }
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Everything a finished run determined.
#[derive(Debug)]
pub struct RunReport {
    pub session: SessionId,
    pub exit: ExitStatus,
    /// `None` when the output relay was still writing to the external
    /// endpoint after [`OUTPUT_DRAIN_GRACE`].
    pub output_relay: Option<RelayStats>,
    /// `None` while the input relay is still blocked on the external endpoint.
    pub input_relay: Option<RelayStats>,
    /// Teardown failures, attached without overriding `exit`.
    pub teardown: Result<(), BridgeError>,
}

impl RunReport {
    /// Collapse to the caller-facing verdict: `Ok` for exit code 0,
    /// `ChildProcessFailed` otherwise. Teardown failures ride along on the
    /// error; after a clean exit they are only logged.
    pub fn into_result(self) -> Result<(), BridgeError> {
        let teardown = match &self.teardown {
            Ok(()) => Vec::new(),
            Err(e) => e.teardown_errors().to_vec(),
        };
        if self.exit.success() {
            if let Err(e) = &self.teardown {
                tracing::warn!(session = %self.session, error = %e, "Teardown failed after child exit");
            }
            Ok(())
        } else {
            Err(BridgeError::ChildProcessFailed {
                code: self.exit.code,
                teardown,
            })
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// One bridged run. Consumed by [`BridgeSession::run`]; never reused.
pub struct BridgeSession {
    id: SessionId,
    api: Arc<dyn ConsoleApi>,
    options: BridgeOptions,
    command: String,
    size: Size,
    shared: Arc<Mutex<Shared>>,
}

enum ExitFailure {
    TimedOut,
    Failed(ConsoleError),
}

impl BridgeSession {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }

    /// Handle for forwarding size changes while [`run`](Self::run) blocks.
    pub fn resizer(&self) -> Resizer {
        Resizer::new(self.id.clone(), Arc::clone(&self.shared))
    }

    /// Run the command, relaying `input` into the pseudo-console and its
    /// output into `output`. Blocks until the child exits and teardown
    /// completes.
    pub fn run<R, W>(self, input: R, output: W) -> Result<RunReport, BridgeError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        tracing::info!(
            session = %self.id,
            command = %self.command,
            size = %self.size,
            "Starting bridged session"
        );

        let mut resources = Resources::new(Arc::clone(&self.shared));
        let input_verdict = match self.setup(&mut resources, input, output) {
            Ok(rx) => rx,
            Err((stage, source)) => {
                tracing::warn!(session = %self.id, %stage, error = %source, "Bridge setup failed");
                let (teardown, _) = resources.teardown();
                return Err(BridgeError::SetupFailed {
                    stage,
                    source,
                    teardown,
                });
            }
        };

        self.set_state(BridgeState::ExitWaiting);
        let determination = resources.wait_for_exit(self.options.wait);

        let (teardown, output_relay) = resources.teardown();
        for e in &teardown {
            tracing::warn!(session = %self.id, error = %e, "Teardown step failed");
        }
        if output_relay.is_none() {
            tracing::warn!(
                session = %self.id,
                grace = ?OUTPUT_DRAIN_GRACE,
                "Output relay still blocked on the external endpoint; pipe closed under it"
            );
        }

        let exit = match determination {
            Ok(exit) => exit,
            Err(ExitFailure::TimedOut) => {
                let timeout = match self.options.wait {
                    WaitPolicy::Bounded(timeout) => timeout,
                    WaitPolicy::Infinite => Duration::MAX,
                };
                tracing::warn!(session = %self.id, ?timeout, "Child did not exit in time");
                return Err(BridgeError::ExitWaitTimedOut { timeout, teardown });
            }
            Err(ExitFailure::Failed(source)) => {
                return Err(BridgeError::ExitWaitFailed { source, teardown });
            }
        };

        let grace = if output_relay.as_ref().is_some_and(RelayStats::failed_before_data) {
            INPUT_VERDICT_GRACE
        } else {
            Duration::ZERO
        };
        let input_relay = relay::await_stats(&input_verdict, Direction::Input, grace);

        tracing::info!(
            session = %self.id,
            code = exit.code,
            bytes_out = ?output_relay.as_ref().map(|stats| stats.bytes),
            "Child process exited"
        );

        match (output_relay, input_relay) {
            (
                Some(RelayStats {
                    end: RelayEnd::Failed(output),
                    bytes: 0,
                    ..
                }),
                Some(RelayStats {
                    end: RelayEnd::Failed(input),
                    bytes: 0,
                    ..
                }),
            ) => Err(BridgeError::RelayFailed { output, input }),
            (output_relay, input_relay) => Ok(RunReport {
                session: self.id,
                exit,
                output_relay,
                input_relay,
                teardown: if teardown.is_empty() {
                    Ok(())
                } else {
                    Err(BridgeError::TeardownFailed(teardown))
                },
            }),
        }
    }

    /// Stages 1-5. Everything created is handed to `resources` as soon as
    /// it exists, so a failure at any stage tears down exactly what was
    /// built.
    fn setup<R, W>(
        &self,
        resources: &mut Resources,
        input: R,
        output: W,
    ) -> Result<mpsc::Receiver<RelayStats>, (Stage, ConsoleError)>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let at = |stage: Stage| move |e: ConsoleError| (stage, e);

        // Input pipe: console reads the read end, the relay writes the write
        // end. Output pipe: console writes, relay reads.
        let input_pipe = PipePair::create(&self.api).map_err(at(Stage::Pipes))?;
        resources.input = Some(input_pipe.clone());
        let output_pipe = PipePair::create(&self.api).map_err(at(Stage::Pipes))?;
        resources.output = Some(output_pipe.clone());
        self.set_state(BridgeState::PipesOpen);
        tracing::debug!(session = %self.id, "Pipes created");

        let console =
            PseudoConsole::create(&self.api, self.size, &input_pipe.read, &output_pipe.write)
                .map_err(at(Stage::Console))?;
        {
            let mut shared = self.shared.lock();
            shared.console = Some(console);
            shared.state = BridgeState::ConsoleCreated;
        }
        // The console holds its own references now.
        input_pipe.read.close().map_err(at(Stage::Console))?;
        output_pipe.write.close().map_err(at(Stage::Console))?;

        let attributes = {
            let shared = self.shared.lock();
            let Some(console) = shared.console.as_ref() else {
                return Err((
                    Stage::Attributes,
                    ConsoleError::AttributeListPopulateFailed {
                        call: "UpdateProcThreadAttribute",
                        status: ERROR_INVALID_HANDLE,
                    },
                ));
            };
            AttributeListBuilder::query_size(&self.api).and_then(|pending| pending.populate(console))
        }
        .map_err(at(Stage::Attributes))?;
        self.set_state(BridgeState::AttributesBuilt);
        tracing::debug!(session = %self.id, bytes = attributes.bytes(), "Attribute list built");

        let launched = launcher::launch(&self.api, &self.command, &attributes);
        resources.attributes = Some(attributes);
        let child = launched.map_err(at(Stage::Launch))?;
        tracing::info!(session = %self.id, pid = child.pid(), "Child process started");
        resources.child = Some(child);
        self.set_state(BridgeState::ProcessLaunched);

        let chunk_size = self.options.chunk_size;
        let output_relay = relay::spawn_output(Arc::clone(&output_pipe.read), output, chunk_size)
            .map_err(|e| (Stage::Relay, thread_error(e)))?;
        resources.output_relay = Some(output_relay);
        let input_verdict = relay::spawn_input(input, Arc::clone(&input_pipe.write), chunk_size)
            .map_err(|e| (Stage::Relay, thread_error(e)))?;
        self.set_state(BridgeState::Relaying);
        tracing::debug!(session = %self.id, "Relays started");

        Ok(input_verdict)
    }

    fn set_state(&self, state: BridgeState) {
        self.shared.lock().state = state;
    }
}

impl fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSession")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("size", &self.size)
            .field("state", &self.state())
            .finish()
    }
}

fn thread_error(e: std::io::Error) -> ConsoleError {
    ConsoleError::PlatformCallFailed {
        call: "CreateThread",
        status: e.raw_os_error().map_or(0, |code| code as u32),
    }
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Sole owner of a session's native resources.
struct Resources {
    shared: Arc<Mutex<Shared>>,
    input: Option<PipePair>,
    output: Option<PipePair>,
    attributes: Option<AttributeList>,
    child: Option<ChildProcess>,
    output_relay: Option<mpsc::Receiver<RelayStats>>,
}

impl Resources {
    fn new(shared: Arc<Mutex<Shared>>) -> Self {
        Self {
            shared,
            input: None,
            output: None,
            attributes: None,
            child: None,
            output_relay: None,
        }
    }

    fn wait_for_exit(&self, policy: WaitPolicy) -> Result<ExitStatus, ExitFailure> {
        let Some(child) = self.child.as_ref() else {
            return Err(ExitFailure::Failed(ConsoleError::PlatformCallFailed {
                call: "WaitForSingleObject",
                status: ERROR_INVALID_HANDLE,
            }));
        };
        match child.wait(policy) {
            Ok(WaitOutcome::Exited) => child.exit_status().map_err(ExitFailure::Failed),
            Ok(WaitOutcome::TimedOut) => Err(ExitFailure::TimedOut),
            Err(e) => Err(ExitFailure::Failed(e)),
        }
    }

    /// Release everything in the fixed teardown order. Every step runs even
    /// if an earlier one failed; all failures are returned.
    fn teardown(&mut self) -> (Vec<ConsoleError>, Option<RelayStats>) {
        let mut errors = Vec::new();

        if let Some(child) = self.child.take() {
            errors.extend(child.close());
        }
        if let Some(attributes) = self.attributes.take() {
            errors.extend(attributes.release());
        }

        let console = {
            let mut shared = self.shared.lock();
            shared.state = BridgeState::TornDown;
            shared.console.take()
        };
        if let Some(console) = console {
            if let Err(e) = console.close() {
                errors.push(e);
            }
        }

        let output_relay = self.output_relay.take().and_then(|stats| {
            relay::await_stats(&stats, Direction::Output, OUTPUT_DRAIN_GRACE)
        });

        // Outer ends, then any inner end still open because setup stopped
        // before handing it to the console.
        let input = self.input.take();
        let output = self.output.take();
        let outer = [
            output.as_ref().map(|p| &p.read),
            input.as_ref().map(|p| &p.write),
        ];
        let inner = [
            input.as_ref().map(|p| &p.read),
            output.as_ref().map(|p| &p.write),
        ];
        for end in outer.into_iter().chain(inner).flatten() {
            if let Err(e) = end.close() {
                errors.push(e);
            }
        }

        (errors, output_relay)
    }
}
