//! Extended process-creation attributes binding a launch to a pseudo-console.
//!
//! Building the list is a two-phase protocol:
//!
//! 1. [`AttributeListBuilder::query_size`] asks the native layer how many
//!    bytes a one-attribute list needs. The call is expected to *fail* with
//!    `ERROR_INSUFFICIENT_BUFFER`; that failure is the success path.
//! 2. [`PendingAttributeList::populate`] allocates exactly that many bytes,
//!    initializes the list in them and binds the pseudo-console attribute.
//!
//! `populate` is only reachable through a `PendingAttributeList`, so
//! populating before querying cannot be written. Teardown is a single
//! consuming [`AttributeList::release`] that deletes the list before
//! freeing its memory.

use crate::console::PseudoConsole;
use crate::native::convention::{expect_insufficient_buffer, zero_is_failure, zero_is_success};
use crate::native::{
    ConsoleApi, RawAttributeList, ERROR_INVALID_HANDLE, ERROR_NOT_ENOUGH_MEMORY,
    PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
};
use conbridge_common::ConsoleError;
use std::sync::Arc;

/// Only the pseudo-console attachment is set.
pub const ATTRIBUTE_COUNT: u32 = 1;

// ---------------------------------------------------------------------------
// Phase 1
// ---------------------------------------------------------------------------

pub struct AttributeListBuilder;

impl AttributeListBuilder {
    pub fn query_size(api: &Arc<dyn ConsoleApi>) -> Result<PendingAttributeList, ConsoleError> {
        let mut size = 0usize;
        let result =
            api.initialize_proc_thread_attribute_list(RawAttributeList::NULL, ATTRIBUTE_COUNT, &mut size);
        let size = expect_insufficient_buffer(result, size)?;
        tracing::debug!(size, "Attribute list size queried");
        Ok(PendingAttributeList {
            api: Arc::clone(api),
            size,
        })
    }
}

// ---------------------------------------------------------------------------
// Phase 2
// ---------------------------------------------------------------------------

/// A sized but not yet allocated attribute list.
#[derive(Clone)]
pub struct PendingAttributeList {
    api: Arc<dyn ConsoleApi>,
    size: usize,
}

impl PendingAttributeList {
    /// Bytes the native layer asked for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocate, initialize and bind the list to `console`.
    pub fn populate(self, console: &PseudoConsole) -> Result<AttributeList, ConsoleError> {
        let bytes = self.size;
        self.populate_sized(bytes, console)
    }

    fn populate_sized(self, bytes: usize, console: &PseudoConsole) -> Result<AttributeList, ConsoleError> {
        let raw = self.api.heap_alloc(bytes);
        if raw.is_null() {
            return Err(ConsoleError::AttributeListPopulateFailed {
                call: "HeapAlloc",
                status: ERROR_NOT_ENOUGH_MEMORY,
            });
        }
        // From here on, dropping `list` on an error path releases whatever
        // was set up.
        let mut list = AttributeList {
            api: Arc::clone(&self.api),
            raw,
            bytes,
            state: ListState::Allocated,
        };

        let mut size = bytes;
        let result = self
            .api
            .initialize_proc_thread_attribute_list(raw, ATTRIBUTE_COUNT, &mut size);
        zero_is_failure("InitializeProcThreadAttributeList", result).map_err(populate_failed)?;
        list.state = ListState::Initialized;

        let console = console.raw().ok_or(ConsoleError::AttributeListPopulateFailed {
            call: "UpdateProcThreadAttribute",
            status: ERROR_INVALID_HANDLE,
        })?;
        let result =
            self.api
                .update_proc_thread_attribute(raw, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE, console);
        zero_is_failure("UpdateProcThreadAttribute", result).map_err(populate_failed)?;

        tracing::debug!(bytes, "Attribute list populated");
        Ok(list)
    }
}

fn populate_failed(err: ConsoleError) -> ConsoleError {
    match err {
        ConsoleError::PlatformCallFailed { call, status } => {
            ConsoleError::AttributeListPopulateFailed { call, status }
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Ready list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    /// Memory allocated, list not initialized: only the free is owed.
    Allocated,
    /// Initialized: delete, then free.
    Initialized,
    Released,
}

/// A populated attribute list, ready to pass to process creation.
pub struct AttributeList {
    api: Arc<dyn ConsoleApi>,
    raw: RawAttributeList,
    bytes: usize,
    state: ListState,
}

impl AttributeList {
    pub(crate) fn raw(&self) -> RawAttributeList {
        self.raw
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Delete the list, then free its memory.
    ///
    /// Both steps are attempted even if the first fails; every failure is
    /// returned. Call only after the process has launched or launch has
    /// been abandoned.
    pub fn release(mut self) -> Vec<ConsoleError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Vec<ConsoleError> {
        let mut errors = Vec::new();
        match self.state {
            ListState::Released => return errors,
            ListState::Initialized => {
                let status = self.api.delete_proc_thread_attribute_list(self.raw);
                if let Err(e) = zero_is_success("DeleteProcThreadAttributeList", status) {
                    errors.push(e);
                }
            }
            ListState::Allocated => {}
        }
        if let Err(e) = zero_is_failure("HeapFree", self.api.heap_free(self.raw)) {
            errors.push(e);
        }
        self.state = ListState::Released;
        errors
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        for e in self.release_inner() {
            tracing::warn!(error = %e, "Attribute list release failed on drop");
        }
    }
}
