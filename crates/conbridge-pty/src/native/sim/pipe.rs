use crate::native::{Status, ERROR_BROKEN_PIPE, ERROR_INVALID_HANDLE, ERROR_NO_DATA};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// In-memory anonymous pipe with reference-counted ends.
///
/// Every open handle, and a pseudo-console holding a pipe, counts as one
/// reader or writer. Reads drain buffered data first and report
/// `ERROR_BROKEN_PIPE` once no writer is left; writes fail with
/// `ERROR_NO_DATA` once no reader is left.
pub(crate) struct SimPipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

struct PipeState {
    data: VecDeque<u8>,
    readers: usize,
    writers: usize,
}

impl SimPipe {
    /// A fresh pipe with one read handle and one write handle open.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PipeState {
                data: VecDeque::new(),
                readers: 1,
                writers: 1,
            }),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn add_reader(&self) {
        self.state.lock().readers += 1;
    }

    pub(crate) fn add_writer(&self) {
        self.state.lock().writers += 1;
    }

    pub(crate) fn release_reader(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        self.ready.notify_all();
    }

    pub(crate) fn release_writer(&self) {
        let mut state = self.state.lock();
        state.writers = state.writers.saturating_sub(1);
        self.ready.notify_all();
    }

    /// Block until data is available or the pipe can never produce more.
    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize, Status> {
        let mut state = self.state.lock();
        loop {
            if state.readers == 0 {
                return Err(ERROR_INVALID_HANDLE);
            }
            if !state.data.is_empty() {
                let n = buf.len().min(state.data.len());
                for (slot, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.writers == 0 {
                return Err(ERROR_BROKEN_PIPE);
            }
            self.ready.wait(&mut state);
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> Result<usize, Status> {
        let mut state = self.state.lock();
        if state.writers == 0 {
            return Err(ERROR_INVALID_HANDLE);
        }
        if state.readers == 0 {
            return Err(ERROR_NO_DATA);
        }
        state.data.extend(buf.iter().copied());
        self.ready.notify_all();
        Ok(buf.len())
    }
}
