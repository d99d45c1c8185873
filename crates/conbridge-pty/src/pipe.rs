//! Anonymous pipe ends with single ownership and idempotent close.

use crate::native::convention::zero_is_failure;
use crate::native::{ConsoleApi, RawHandle, ERROR_INVALID_HANDLE};
use conbridge_common::ConsoleError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Which end of a pipe an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeRole {
    Read,
    Write,
}

/// One owned, unidirectional pipe handle.
///
/// Closing is idempotent: the handle is taken out on the first `close` and
/// later calls are no-ops. In-flight I/O through [`PipeEndpoint::with_raw`]
/// holds a read lock, so a concurrent `close` waits for it instead of
/// freeing the handle underneath it.
pub struct PipeEndpoint {
    api: Arc<dyn ConsoleApi>,
    handle: RwLock<Option<RawHandle>>,
    role: PipeRole,
}

impl PipeEndpoint {
    fn new(api: Arc<dyn ConsoleApi>, handle: RawHandle, role: PipeRole) -> Self {
        Self {
            api,
            handle: RwLock::new(Some(handle)),
            role,
        }
    }

    pub fn role(&self) -> PipeRole {
        self.role
    }

    /// The raw handle, or `None` once closed.
    pub fn raw(&self) -> Option<RawHandle> {
        *self.handle.read()
    }

    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Run `f` against the open handle. Fails as `call` with
    /// `ERROR_INVALID_HANDLE` when the endpoint is already closed.
    pub(crate) fn with_raw<T>(
        &self,
        call: &'static str,
        f: impl FnOnce(&dyn ConsoleApi, RawHandle) -> Result<T, ConsoleError>,
    ) -> Result<T, ConsoleError> {
        let guard = self.handle.read();
        match *guard {
            Some(handle) => f(self.api.as_ref(), handle),
            None => Err(ConsoleError::PlatformCallFailed {
                call,
                status: ERROR_INVALID_HANDLE,
            }),
        }
    }

    /// Close the handle. Closing an already-closed endpoint is a no-op.
    pub fn close(&self) -> Result<(), ConsoleError> {
        let Some(handle) = self.handle.write().take() else {
            return Ok(());
        };
        zero_is_failure("CloseHandle", self.api.close_handle(handle))
    }
}

impl fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("role", &self.role)
            .field("handle", &self.raw())
            .finish()
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, role = ?self.role, "Failed to close pipe end on drop");
        }
    }
}

/// Both ends of a freshly created anonymous pipe.
///
/// Ends are shared so a relay thread can hold one while the session keeps
/// the right to close it.
#[derive(Debug, Clone)]
pub struct PipePair {
    pub read: Arc<PipeEndpoint>,
    pub write: Arc<PipeEndpoint>,
}

impl PipePair {
    /// `CreatePipe` with default security and buffer size.
    pub fn create(api: &Arc<dyn ConsoleApi>) -> Result<Self, ConsoleError> {
        let mut read = RawHandle::default();
        let mut write = RawHandle::default();
        zero_is_failure("CreatePipe", api.create_pipe(&mut read, &mut write))?;
        Ok(Self {
            read: Arc::new(PipeEndpoint::new(Arc::clone(api), read, PipeRole::Read)),
            write: Arc::new(PipeEndpoint::new(Arc::clone(api), write, PipeRole::Write)),
        })
    }
}
