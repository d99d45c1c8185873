//! Duplex byte relay between the pseudo-console's outer pipe ends and an
//! external endpoint.
//!
//! Each direction is an independent copy loop on its own thread. A loop
//! ends on end-of-stream or on the first read/write error, and never stops
//! the other direction.

use crate::native::convention::zero_is_failure;
use crate::native::{ERROR_BROKEN_PIPE, ERROR_NO_DATA};
use crate::pipe::PipeEndpoint;
use conbridge_common::{ConsoleError, Direction};
use std::io::{self, Read, Write};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Bytes moved per read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

// ---------------------------------------------------------------------------
// Pipe adapters
// ---------------------------------------------------------------------------

/// `Read` over the outer read end of the output pipe.
///
/// A broken pipe is end-of-stream: it is how the pipe reports that the
/// pseudo-console has closed its side.
pub struct PipeReader {
    end: Arc<PipeEndpoint>,
}

impl PipeReader {
    pub fn new(end: Arc<PipeEndpoint>) -> Self {
        Self { end }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.end.with_raw("ReadFile", |api, handle| {
            let mut read = 0u32;
            match zero_is_failure("ReadFile", api.read_file(handle, buf, &mut read)) {
                Ok(()) => Ok(read as usize),
                Err(e) if matches!(e.status(), Some(ERROR_BROKEN_PIPE | ERROR_NO_DATA)) => Ok(0),
                Err(e) => Err(e),
            }
        })?;
        Ok(n)
    }
}

/// `Write` over the outer write end of the input pipe. A write that
/// accepts fewer bytes than offered is an error.
pub struct PipeWriter {
    end: Arc<PipeEndpoint>,
}

impl PipeWriter {
    pub fn new(end: Arc<PipeEndpoint>) -> Self {
        Self { end }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.end.with_raw("WriteFile", |api, handle| {
            let mut written = 0u32;
            zero_is_failure("WriteFile", api.write_file(handle, buf, &mut written))?;
            let written = written as usize;
            if written < buf.len() {
                return Err(ConsoleError::ShortWrite {
                    written,
                    expected: buf.len(),
                });
            }
            Ok(written)
        })?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Copy loop
// ---------------------------------------------------------------------------

/// Why a relay loop stopped.
#[derive(Debug)]
pub enum RelayEnd {
    EndOfStream,
    Failed(io::Error),
}

/// Outcome of one relay direction.
#[derive(Debug)]
pub struct RelayStats {
    pub direction: Direction,
    pub bytes: u64,
    pub end: RelayEnd,
}

impl RelayStats {
    /// `true` when the loop errored before moving a single byte.
    pub fn failed_before_data(&self) -> bool {
        self.bytes == 0 && matches!(self.end, RelayEnd::Failed(_))
    }
}

/// Copy `source` into `sink` until end-of-stream or error.
///
/// Every chunk is written whole and flushed before the next read.
pub fn copy_loop<R: Read, W: Write>(
    direction: Direction,
    mut source: R,
    mut sink: W,
    chunk_size: usize,
) -> RelayStats {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;

    let end = loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break RelayEnd::EndOfStream,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break RelayEnd::Failed(e),
        };
        if let Err(e) = sink.write_all(&buf[..n]).and_then(|()| sink.flush()) {
            break RelayEnd::Failed(e);
        }
        bytes += n as u64;
        tracing::trace!(%direction, chunk = n, total = bytes, "Relayed chunk");
    };

    match &end {
        RelayEnd::EndOfStream => tracing::debug!(%direction, bytes, "Relay reached end of stream"),
        RelayEnd::Failed(e) => tracing::warn!(%direction, bytes, error = %e, "Relay stopped on error"),
    }
    RelayStats {
        direction,
        bytes,
        end,
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Start the output direction: pseudo-console output to `sink`.
///
/// Stats arrive on the returned channel once the pseudo-console is closed
/// and its remaining output has been delivered. A sink that stops
/// accepting writes keeps the thread parked; callers bound their wait
/// with [`await_stats`].
pub(crate) fn spawn_output<W>(
    source: Arc<PipeEndpoint>,
    sink: W,
    chunk_size: usize,
) -> io::Result<mpsc::Receiver<RelayStats>>
where
    W: Write + Send + 'static,
{
    spawn_relay("conbridge-relay-out", move || {
        copy_loop(Direction::Output, PipeReader::new(source), sink, chunk_size)
    })
}

/// Start the input direction: `source` to pseudo-console input.
///
/// The thread may be parked in a read on `source` long after the session
/// ends.
pub(crate) fn spawn_input<R>(
    source: R,
    sink: Arc<PipeEndpoint>,
    chunk_size: usize,
) -> io::Result<mpsc::Receiver<RelayStats>>
where
    R: Read + Send + 'static,
{
    spawn_relay("conbridge-relay-in", move || {
        copy_loop(Direction::Input, source, PipeWriter::new(sink), chunk_size)
    })
}

/// Run `relay` on a detached, named thread that reports on the returned
/// channel when it finishes.
fn spawn_relay<F>(name: &str, relay: F) -> io::Result<mpsc::Receiver<RelayStats>>
where
    F: FnOnce() -> RelayStats + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name(name.into()).spawn(move || {
        // The session may have stopped listening.
        let _ = tx.send(relay());
    })?;
    Ok(rx)
}

/// Wait up to `grace` for a relay's stats.
///
/// `None` means the loop is still running. A thread that died without
/// reporting counts as a failed loop.
pub(crate) fn await_stats(
    stats: &mpsc::Receiver<RelayStats>,
    direction: Direction,
    grace: Duration,
) -> Option<RelayStats> {
    match stats.recv_timeout(grace) {
        Ok(stats) => Some(stats),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => Some(RelayStats {
            direction,
            bytes: 0,
            end: RelayEnd::Failed(io::Error::other(format!("{direction} relay thread panicked"))),
        }),
    }
}
