//! Child programs the simulated backend can "launch".

use super::pipe::SimPipe;
use crate::native::STILL_ACTIVE;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// End-of-transmission byte; `cat` stops echoing when it sees it.
pub(crate) const EOT: u8 = 0x04;

// =============================================================================
// PROCESS
// =============================================================================

/// A simulated process: an exit code slot plus a condvar for waiters.
pub(crate) struct SimProcess {
    pid: u32,
    exit: Mutex<Option<u32>>,
    exited: Condvar,
}

impl SimProcess {
    pub(crate) fn new(pid: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            exit: Mutex::new(None),
            exited: Condvar::new(),
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Record the exit code. The first caller wins, so a console close
    /// racing a natural exit keeps whichever happened first.
    pub(crate) fn exit(&self, code: u32) {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            *exit = Some(code);
            self.exited.notify_all();
        }
    }

    pub(crate) fn exit_code(&self) -> u32 {
        self.exit.lock().unwrap_or(STILL_ACTIVE)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.lock().is_some()
    }

    /// Wait for exit; `None` waits forever. Returns `true` once exited.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut exit = self.exit.lock();
        match timeout {
            None => {
                while exit.is_none() {
                    self.exited.wait(&mut exit);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while exit.is_none() {
                    if self.exited.wait_until(&mut exit, deadline).timed_out() {
                        break;
                    }
                }
                exit.is_some()
            }
        }
    }
}

// =============================================================================
// PROGRAMS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Program {
    /// Clear the screen, print the text, show the cursor, exit 0.
    Echo(String),
    Exit(u32),
    /// Echo input back until EOT or the console goes away.
    Cat,
    Sleep(Duration),
}

impl Program {
    /// Parse a command line; `None` means "file not found".
    pub(crate) fn parse(command_line: &str) -> Option<Self> {
        let command_line = command_line.trim();
        let (name, rest) = match command_line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command_line, ""),
        };
        match name.to_ascii_lowercase().as_str() {
            "echo" => Some(Self::Echo(rest.to_string())),
            "exit" if rest.is_empty() => Some(Self::Exit(0)),
            "exit" => rest.parse().ok().map(Self::Exit),
            "cat" => Some(Self::Cat),
            "sleep" => rest.parse().ok().map(|ms| Self::Sleep(Duration::from_millis(ms))),
            _ => None,
        }
    }
}

/// The console side of a running program.
pub(crate) struct ProgramIo {
    pub(crate) input: Arc<SimPipe>,
    pub(crate) output: Arc<SimPipe>,
    pub(crate) process: Arc<SimProcess>,
}

impl ProgramIo {
    fn write(&self, bytes: &[u8]) -> bool {
        !self.process.has_exited() && self.output.write(bytes).is_ok()
    }

    fn read(&self, buf: &mut [u8]) -> Option<usize> {
        self.input.read(buf).ok()
    }
}

/// Body of the program thread.
pub(crate) fn run(program: Program, io: ProgramIo) {
    match program {
        Program::Echo(text) => {
            let frame = format!("\x1b[2J\x1b[H{text}\r\n\x1b[?25h");
            io.write(frame.as_bytes());
            io.process.exit(0);
        }
        Program::Exit(code) => io.process.exit(code),
        Program::Cat => {
            let mut buf = [0u8; 512];
            while let Some(n) = io.read(&mut buf) {
                let chunk = &buf[..n];
                if let Some(end) = chunk.iter().position(|&b| b == EOT) {
                    io.write(&chunk[..end]);
                    break;
                }
                if !io.write(chunk) {
                    break;
                }
            }
            io.process.exit(0);
        }
        Program::Sleep(duration) => {
            // Returns early when the console terminates the process.
            if !io.process.wait(Some(duration)) {
                io.process.exit(0);
            }
        }
    }
}
