//! Native pseudo-console primitives behind an injectable adapter.
//!
//! [`ConsoleApi`] has one method per kernel32 entry point the bridge uses.
//! Methods hand back the *raw* native result so that every call site
//! classifies it with the matching convention from [`convention`]. Two
//! implementations exist: [`Kernel32`] (Windows only) and the in-memory
//! [`SimConsole`].

pub mod convention;
pub mod sim;

#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub use self::windows::{console_size, Kernel32};
pub use sim::{SimConsole, SimFault};

use conbridge_common::{ConsoleError, Size};
use std::sync::Arc;

// =============================================================================
// NATIVE CONSTANTS
// =============================================================================

/// Win32 error code or `HRESULT` bit pattern.
pub type Status = u32;

/// Raw `HRESULT`; zero is success.
pub type HResult = i32;

pub const ERROR_SUCCESS: Status = 0;
pub const ERROR_FILE_NOT_FOUND: Status = 2;
pub const ERROR_ACCESS_DENIED: Status = 5;
pub const ERROR_INVALID_HANDLE: Status = 6;
pub const ERROR_NOT_ENOUGH_MEMORY: Status = 8;
pub const ERROR_INVALID_PARAMETER: Status = 87;
pub const ERROR_BROKEN_PIPE: Status = 109;
pub const ERROR_INSUFFICIENT_BUFFER: Status = 122;
pub const ERROR_NO_DATA: Status = 232;

pub const S_OK: HResult = 0;
pub const E_HANDLE: HResult = 0x8007_0006_u32 as i32;
pub const E_INVALIDARG: HResult = 0x8007_0057_u32 as i32;

pub const WAIT_OBJECT_0: u32 = 0;
pub const WAIT_TIMEOUT: u32 = 0x102;
pub const WAIT_FAILED: u32 = 0xFFFF_FFFF;

pub const STILL_ACTIVE: u32 = 259;
/// Exit code of a process terminated because its pseudo-console closed.
pub const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

pub const EXTENDED_STARTUPINFO_PRESENT: u32 = 0x0008_0000;
pub const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x0002_0016;

// =============================================================================
// RAW VALUES
// =============================================================================

/// Kernel object handle (`HANDLE`) as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(pub usize);

/// Pseudo-console handle (`HPCON`) as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawPseudoConsole(pub usize);

/// Address of a process/thread attribute list buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawAttributeList(pub usize);

impl RawAttributeList {
    pub const NULL: Self = Self(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Result of a `BOOL`-returning call plus the thread's last error, which
/// is only meaningful when `ret` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoolCall {
    pub ret: i32,
    pub last_error: Status,
}

impl BoolCall {
    pub const fn ok() -> Self {
        Self {
            ret: 1,
            last_error: ERROR_SUCCESS,
        }
    }

    pub const fn failed(last_error: Status) -> Self {
        Self { ret: 0, last_error }
    }
}

/// Result of `WaitForSingleObject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitCall {
    pub event: u32,
    pub last_error: Status,
}

/// Output of `CreateProcessW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessInfo {
    pub process: RawHandle,
    pub thread: RawHandle,
    pub process_id: u32,
    pub thread_id: u32,
}

// =============================================================================
// ADAPTER TRAIT
// =============================================================================

/// The native primitives the bridge is built from.
///
/// Implementations must not interpret results: a failing call returns its
/// failure value and status, never an `Err`. Callers pick the convention.
pub trait ConsoleApi: Send + Sync {
    /// `CreatePipe` with default security and buffer size.
    fn create_pipe(&self, read: &mut RawHandle, write: &mut RawHandle) -> BoolCall;

    fn close_handle(&self, handle: RawHandle) -> BoolCall;

    fn create_pseudo_console(
        &self,
        size: Size,
        input: RawHandle,
        output: RawHandle,
        console: &mut RawPseudoConsole,
    ) -> HResult;

    fn resize_pseudo_console(&self, console: RawPseudoConsole, size: Size) -> HResult;

    /// `ClosePseudoConsole` is void natively; returns the last error
    /// observed across the call (zero when nothing was reported).
    fn close_pseudo_console(&self, console: RawPseudoConsole) -> Status;

    /// Allocate `bytes` from the process heap; null on failure.
    fn heap_alloc(&self, bytes: usize) -> RawAttributeList;

    fn heap_free(&self, list: RawAttributeList) -> BoolCall;

    /// `InitializeProcThreadAttributeList`. A null `list` asks for the
    /// required size, written to `size`.
    fn initialize_proc_thread_attribute_list(
        &self,
        list: RawAttributeList,
        attribute_count: u32,
        size: &mut usize,
    ) -> BoolCall;

    /// `UpdateProcThreadAttribute` binding `attribute` to a pseudo-console.
    fn update_proc_thread_attribute(
        &self,
        list: RawAttributeList,
        attribute: usize,
        console: RawPseudoConsole,
    ) -> BoolCall;

    /// `DeleteProcThreadAttributeList` is void natively; returns the last
    /// error observed across the call.
    fn delete_proc_thread_attribute_list(&self, list: RawAttributeList) -> Status;

    fn create_process(
        &self,
        command_line: &str,
        list: RawAttributeList,
        creation_flags: u32,
        info: &mut ProcessInfo,
    ) -> BoolCall;

    fn wait_for_single_object(&self, handle: RawHandle, timeout_ms: u32) -> WaitCall;

    fn get_exit_code_process(&self, process: RawHandle, code: &mut u32) -> BoolCall;

    fn read_file(&self, handle: RawHandle, buf: &mut [u8], read: &mut u32) -> BoolCall;

    fn write_file(&self, handle: RawHandle, buf: &[u8], written: &mut u32) -> BoolCall;
}

/// The platform's native pseudo-console backend.
///
/// Resolves the kernel32 entry points once; pass the result to every
/// bridge in the process.
pub fn native_backend() -> Result<Arc<dyn ConsoleApi>, ConsoleError> {
    #[cfg(windows)]
    {
        Ok(Arc::new(Kernel32::load()?))
    }

    #[cfg(not(windows))]
    {
        Err(ConsoleError::Unsupported(
            "pseudo-consoles require Windows 10 1809 or later".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hresult_constants_have_failure_bit() {
        assert!(E_INVALIDARG < 0);
        assert!(E_HANDLE < 0);
        assert_eq!(E_INVALIDARG as u32, 0x8007_0057);
    }

    #[test]
    fn bool_call_constructors() {
        assert_eq!(BoolCall::ok().ret, 1);
        let failed = BoolCall::failed(ERROR_BROKEN_PIPE);
        assert_eq!(failed.ret, 0);
        assert_eq!(failed.last_error, ERROR_BROKEN_PIPE);
    }

    #[test]
    fn attribute_key_matches_windows_sdk() {
        assert_eq!(PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE, 0x0002_0016);
        assert_eq!(EXTENDED_STARTUPINFO_PRESENT, 0x0008_0000);
    }

    #[cfg(not(windows))]
    #[test]
    fn native_backend_is_unsupported_off_windows() {
        let err = native_backend().err().expect("should be unsupported");
        assert!(matches!(err, ConsoleError::Unsupported(_)));
    }
}
