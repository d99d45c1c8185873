//! Child process launch and exit wait.

use crate::attributes::AttributeList;
use crate::native::convention::zero_is_failure;
use crate::native::{
    ConsoleApi, ProcessInfo, RawHandle, ERROR_INVALID_HANDLE, EXTENDED_STARTUPINFO_PRESENT,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use conbridge_common::{ConsoleError, ExitStatus, WaitPolicy};
use std::sync::Arc;

/// Result of a wait that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

/// Start `command_line` attached to the pseudo-console bound in `attributes`.
///
/// No standard handles are redirected; the pseudo-console attachment
/// supplies them. Failures are not retried.
pub fn launch(
    api: &Arc<dyn ConsoleApi>,
    command_line: &str,
    attributes: &AttributeList,
) -> Result<ChildProcess, ConsoleError> {
    let mut info = ProcessInfo::default();
    let result = api.create_process(
        command_line,
        attributes.raw(),
        EXTENDED_STARTUPINFO_PRESENT,
        &mut info,
    );
    zero_is_failure("CreateProcessW", result).map_err(|e| ConsoleError::ProcessLaunchFailed {
        status: e.status().unwrap_or_default(),
    })?;
    tracing::debug!(pid = info.process_id, command = command_line, "Child process launched");
    Ok(ChildProcess {
        api: Arc::clone(api),
        process: Some(info.process),
        thread: Some(info.thread),
        pid: info.process_id,
    })
}

/// Process and primary-thread handles of a launched child.
pub struct ChildProcess {
    api: Arc<dyn ConsoleApi>,
    process: Option<RawHandle>,
    thread: Option<RawHandle>,
    pid: u32,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn wait(&self, policy: WaitPolicy) -> Result<WaitOutcome, ConsoleError> {
        let process = self.process_handle("WaitForSingleObject")?;
        let call = self.api.wait_for_single_object(process, policy.as_millis_u32());
        match call.event {
            WAIT_OBJECT_0 => Ok(WaitOutcome::Exited),
            WAIT_TIMEOUT => Ok(WaitOutcome::TimedOut),
            _ => Err(ConsoleError::PlatformCallFailed {
                call: "WaitForSingleObject",
                status: call.last_error,
            }),
        }
    }

    pub fn exit_status(&self) -> Result<ExitStatus, ConsoleError> {
        let process = self.process_handle("GetExitCodeProcess")?;
        let mut code = 0u32;
        zero_is_failure(
            "GetExitCodeProcess",
            self.api.get_exit_code_process(process, &mut code),
        )?;
        Ok(ExitStatus::new(code))
    }

    /// Close the thread handle, then the process handle. Both are attempted.
    pub fn close(mut self) -> Vec<ConsoleError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Vec<ConsoleError> {
        let mut errors = Vec::new();
        for handle in [self.thread.take(), self.process.take()].into_iter().flatten() {
            if let Err(e) = zero_is_failure("CloseHandle", self.api.close_handle(handle)) {
                errors.push(e);
            }
        }
        errors
    }

    fn process_handle(&self, call: &'static str) -> Result<RawHandle, ConsoleError> {
        self.process.ok_or(ConsoleError::PlatformCallFailed {
            call,
            status: ERROR_INVALID_HANDLE,
        })
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        for e in self.close_inner() {
            tracing::warn!(error = %e, pid = self.pid, "Failed to close child handle on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeListBuilder;
    use crate::console::PseudoConsole;
    use crate::native::{SimConsole, SimFault, ERROR_FILE_NOT_FOUND};
    use crate::pipe::PipePair;
    use conbridge_common::Size;
    use std::time::Duration;

    fn launch_in_sim(
        sim: &Arc<SimConsole>,
        command: &str,
    ) -> (Result<ChildProcess, ConsoleError>, PseudoConsole, AttributeList, PipePair, PipePair) {
        let api: Arc<dyn ConsoleApi> = sim.clone();
        let input = PipePair::create(&api).unwrap();
        let output = PipePair::create(&api).unwrap();
        let console = PseudoConsole::create(&api, Size::default(), &input.read, &output.write).unwrap();
        let list = AttributeListBuilder::query_size(&api)
            .unwrap()
            .populate(&console)
            .unwrap();
        let child = launch(&api, command, &list);
        (child, console, list, input, output)
    }

    #[test]
    fn exit_code_is_reported() {
        let sim = Arc::new(SimConsole::new());
        let (child, _console, _list, _in, _out) = launch_in_sim(&sim, "exit 3");
        let child = child.unwrap();
        assert_eq!(child.wait(WaitPolicy::Infinite).unwrap(), WaitOutcome::Exited);
        assert_eq!(child.exit_status().unwrap().code, 3);
    }

    #[test]
    fn bounded_wait_times_out() {
        let sim = Arc::new(SimConsole::new());
        let (child, console, _list, _in, _out) = launch_in_sim(&sim, "sleep 5000");
        let child = child.unwrap();
        let outcome = child
            .wait(WaitPolicy::Bounded(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(child.exit_status().unwrap().code, crate::native::STILL_ACTIVE);

        console.close().unwrap();
        assert_eq!(child.wait(WaitPolicy::Infinite).unwrap(), WaitOutcome::Exited);
        assert_eq!(
            child.exit_status().unwrap().code,
            crate::native::STATUS_CONTROL_C_EXIT
        );
    }

    #[test]
    fn close_releases_thread_then_process() {
        let sim = Arc::new(SimConsole::new());
        let (child, _console, _list, _in, _out) = launch_in_sim(&sim, "exit 0");
        let before = sim.open_handles();
        assert!(child.unwrap().close().is_empty());
        assert_eq!(sim.open_handles(), before - 2);

        let calls = sim.calls();
        let thread = calls.iter().position(|c| c == "CloseHandle(thread)").unwrap();
        let process = calls.iter().position(|c| c == "CloseHandle(process)").unwrap();
        assert!(thread < process);
    }

    #[test]
    fn unknown_program_fails_with_status() {
        let sim = Arc::new(SimConsole::new());
        let (child, ..) = launch_in_sim(&sim, "no-such-program.exe");
        let err = child.err().unwrap();
        assert_eq!(
            err,
            ConsoleError::ProcessLaunchFailed {
                status: ERROR_FILE_NOT_FOUND,
            }
        );
    }

    #[test]
    fn injected_launch_failure() {
        let sim = Arc::new(SimConsole::new());
        sim.inject(SimFault::CreateProcess);
        let (child, ..) = launch_in_sim(&sim, "exit 0");
        assert!(matches!(child, Err(ConsoleError::ProcessLaunchFailed { .. })));
    }
}
