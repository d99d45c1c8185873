//! Result classification for the two native success conventions.
//!
//! Convention A (`BOOL` returns): zero means failure and the real status
//! lives in the thread's last error. Convention B (`HRESULT` returns and
//! last-error reports around void calls): zero means success and any
//! other value is the status itself.
//!
//! Every native call site goes through exactly one of these functions.

use super::{BoolCall, ERROR_INSUFFICIENT_BUFFER};
use conbridge_common::ConsoleError;

/// Convention A: a zero return is a failure.
pub fn zero_is_failure(call: &'static str, result: BoolCall) -> Result<(), ConsoleError> {
    if result.ret != 0 {
        return Ok(());
    }
    Err(ConsoleError::PlatformCallFailed {
        call,
        status: result.last_error,
    })
}

/// Convention B: a zero code is success, anything else is the status.
///
/// Takes the code as `u32` so an `HRESULT` keeps its bit pattern.
pub fn zero_is_success(call: &'static str, code: u32) -> Result<(), ConsoleError> {
    if code == 0 {
        return Ok(());
    }
    Err(ConsoleError::PlatformCallFailed { call, status: code })
}

/// Phase 1 of the attribute-list protocol.
///
/// The size query must *fail* with `ERROR_INSUFFICIENT_BUFFER` and report a
/// non-zero size. Anything else, an unexpected success included, is fatal.
pub fn expect_insufficient_buffer(result: BoolCall, size: usize) -> Result<usize, ConsoleError> {
    if result.ret == 0 && result.last_error == ERROR_INSUFFICIENT_BUFFER && size > 0 {
        return Ok(size);
    }
    Err(ConsoleError::AttributeListSizeQueryFailed {
        ret: result.ret,
        status: result.last_error,
        size,
    })
}
