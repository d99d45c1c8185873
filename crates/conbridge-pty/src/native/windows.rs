//! kernel32 backend.
//!
//! The pseudo-console entry points only exist on Windows 10 1809 and later,
//! so they are resolved at runtime; everything else binds through
//! `windows-sys`.

use super::{
    BoolCall, ConsoleApi, HResult, ProcessInfo, RawAttributeList, RawHandle, RawPseudoConsole,
    Status, WaitCall,
};
use conbridge_common::{ConsoleError, Size};
use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, SetLastError, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::Console::{
    GetConsoleScreenBufferInfo, GetStdHandle, CONSOLE_SCREEN_BUFFER_INFO, COORD,
    STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows_sys::Win32::System::Memory::{GetProcessHeap, HeapAlloc, HeapFree, HEAP_ZERO_MEMORY};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, UpdateProcThreadAttribute, WaitForSingleObject,
    PROCESS_INFORMATION, STARTUPINFOEXW, STARTUPINFOW,
};

type CreatePseudoConsoleFn =
    unsafe extern "system" fn(COORD, HANDLE, HANDLE, u32, *mut isize) -> HResult;
type ResizePseudoConsoleFn = unsafe extern "system" fn(isize, COORD) -> HResult;
type ClosePseudoConsoleFn = unsafe extern "system" fn(isize);

/// Resolved kernel32 bindings. Build once with [`Kernel32::load`] and share.
pub struct Kernel32 {
    create_pseudo_console: CreatePseudoConsoleFn,
    resize_pseudo_console: ResizePseudoConsoleFn,
    close_pseudo_console: ClosePseudoConsoleFn,
    heap: usize,
}

impl Kernel32 {
    pub fn load() -> Result<Self, ConsoleError> {
        let module_name = wide("kernel32.dll");
        // SAFETY: kernel32 is mapped into every Win32 process; the name is
        // NUL-terminated.
        let module = unsafe { GetModuleHandleW(module_name.as_ptr()) };
        if module.is_null() {
            return Err(ConsoleError::Unsupported(format!(
                "kernel32.dll not loaded (status {})",
                last_error()
            )));
        }

        let resolve = |name: &'static [u8]| {
            // SAFETY: `name` is a NUL-terminated ASCII literal.
            unsafe { GetProcAddress(module, name.as_ptr()) }.ok_or_else(|| {
                ConsoleError::Unsupported(format!(
                    "{} not exported by kernel32.dll",
                    String::from_utf8_lossy(&name[..name.len() - 1])
                ))
            })
        };

        let create = resolve(b"CreatePseudoConsole\0")?;
        let resize = resolve(b"ResizePseudoConsole\0")?;
        let close = resolve(b"ClosePseudoConsole\0")?;

        // SAFETY: GetProcessHeap has no preconditions.
        let heap = unsafe { GetProcessHeap() };
        if heap.is_null() {
            return Err(ConsoleError::PlatformCallFailed {
                call: "GetProcessHeap",
                status: last_error(),
            });
        }

        tracing::debug!("Resolved pseudo-console entry points from kernel32");

        // SAFETY: the exported symbols have exactly these signatures.
        unsafe {
            Ok(Self {
                create_pseudo_console: mem::transmute::<_, CreatePseudoConsoleFn>(create),
                resize_pseudo_console: mem::transmute::<_, ResizePseudoConsoleFn>(resize),
                close_pseudo_console: mem::transmute::<_, ClosePseudoConsoleFn>(close),
                heap: heap as usize,
            })
        }
    }

    fn heap(&self) -> HANDLE {
        self.heap as HANDLE
    }
}

impl ConsoleApi for Kernel32 {
    fn create_pipe(&self, read: &mut RawHandle, write: &mut RawHandle) -> BoolCall {
        let mut r: HANDLE = ptr::null_mut();
        let mut w: HANDLE = ptr::null_mut();
        // SAFETY: both out-pointers are valid locals; NULL attributes and a
        // zero size request the defaults.
        let ret = unsafe { CreatePipe(&mut r, &mut w, ptr::null(), 0) };
        read.0 = r as usize;
        write.0 = w as usize;
        bool_call(ret)
    }

    fn close_handle(&self, handle: RawHandle) -> BoolCall {
        // SAFETY: the caller owns `handle` and never uses it again.
        bool_call(unsafe { CloseHandle(handle.0 as HANDLE) })
    }

    fn create_pseudo_console(
        &self,
        size: Size,
        input: RawHandle,
        output: RawHandle,
        console: &mut RawPseudoConsole,
    ) -> HResult {
        let mut hpc: isize = 0;
        // SAFETY: resolved entry point; the handles are live pipe ends.
        let hr = unsafe {
            (self.create_pseudo_console)(
                coord(size),
                input.0 as HANDLE,
                output.0 as HANDLE,
                0,
                &mut hpc,
            )
        };
        console.0 = hpc as usize;
        hr
    }

    fn resize_pseudo_console(&self, console: RawPseudoConsole, size: Size) -> HResult {
        // SAFETY: resolved entry point; `console` is a live HPCON.
        unsafe { (self.resize_pseudo_console)(console.0 as isize, coord(size)) }
    }

    fn close_pseudo_console(&self, console: RawPseudoConsole) -> Status {
        // SAFETY: resolved entry point; the caller closes each HPCON once.
        void_call(|| unsafe { (self.close_pseudo_console)(console.0 as isize) })
    }

    fn heap_alloc(&self, bytes: usize) -> RawAttributeList {
        // SAFETY: process heap handle from GetProcessHeap.
        let mem = unsafe { HeapAlloc(self.heap(), HEAP_ZERO_MEMORY, bytes) };
        RawAttributeList(mem as usize)
    }

    fn heap_free(&self, list: RawAttributeList) -> BoolCall {
        // SAFETY: `list` came from `heap_alloc` on the same heap.
        bool_call(unsafe { HeapFree(self.heap(), 0, list.0 as *const c_void) })
    }

    fn initialize_proc_thread_attribute_list(
        &self,
        list: RawAttributeList,
        attribute_count: u32,
        size: &mut usize,
    ) -> BoolCall {
        // SAFETY: `list` is null (size query) or a buffer of at least `*size`
        // bytes.
        let ret = unsafe {
            InitializeProcThreadAttributeList(list.0 as *mut c_void, attribute_count, 0, size)
        };
        bool_call(ret)
    }

    fn update_proc_thread_attribute(
        &self,
        list: RawAttributeList,
        attribute: usize,
        console: RawPseudoConsole,
    ) -> BoolCall {
        // The value is the HPCON itself, not a pointer to it.
        // SAFETY: `list` is initialized; the HPCON outlives the list.
        let ret = unsafe {
            UpdateProcThreadAttribute(
                list.0 as *mut c_void,
                0,
                attribute,
                console.0 as *const c_void,
                mem::size_of::<isize>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        bool_call(ret)
    }

    fn delete_proc_thread_attribute_list(&self, list: RawAttributeList) -> Status {
        // SAFETY: `list` is initialized and not yet deleted.
        void_call(|| unsafe { DeleteProcThreadAttributeList(list.0 as *mut c_void) })
    }

    fn create_process(
        &self,
        command_line: &str,
        list: RawAttributeList,
        creation_flags: u32,
        info: &mut ProcessInfo,
    ) -> BoolCall {
        // CreateProcessW may write into the command line buffer.
        let mut command = wide(command_line);

        // SAFETY: all-zero is a valid bit pattern for these plain C structs.
        let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        startup.lpAttributeList = list.0 as *mut c_void;

        // SAFETY: as above.
        let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };

        // SAFETY: every pointer is valid for the duration of the call.
        let ret = unsafe {
            CreateProcessW(
                ptr::null(),
                command.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                0,
                creation_flags,
                ptr::null(),
                ptr::null(),
                &startup.StartupInfo as *const STARTUPINFOW,
                &mut pi,
            )
        };
        let result = bool_call(ret);
        if result.ret != 0 {
            *info = ProcessInfo {
                process: RawHandle(pi.hProcess as usize),
                thread: RawHandle(pi.hThread as usize),
                process_id: pi.dwProcessId,
                thread_id: pi.dwThreadId,
            };
        }
        result
    }

    fn wait_for_single_object(&self, handle: RawHandle, timeout_ms: u32) -> WaitCall {
        // SAFETY: `handle` is a live process handle.
        let event = unsafe { WaitForSingleObject(handle.0 as HANDLE, timeout_ms) };
        WaitCall {
            event,
            last_error: last_error(),
        }
    }

    fn get_exit_code_process(&self, process: RawHandle, code: &mut u32) -> BoolCall {
        // SAFETY: `process` is a live process handle.
        bool_call(unsafe { GetExitCodeProcess(process.0 as HANDLE, code) })
    }

    fn read_file(&self, handle: RawHandle, buf: &mut [u8], read: &mut u32) -> BoolCall {
        let len = buf.len().min(u32::MAX as usize) as u32;
        // SAFETY: `buf` is valid for `len` bytes; synchronous pipe handle.
        let ret = unsafe {
            ReadFile(
                handle.0 as HANDLE,
                buf.as_mut_ptr(),
                len,
                read,
                ptr::null_mut(),
            )
        };
        bool_call(ret)
    }

    fn write_file(&self, handle: RawHandle, buf: &[u8], written: &mut u32) -> BoolCall {
        let len = buf.len().min(u32::MAX as usize) as u32;
        // SAFETY: `buf` is valid for `len` bytes; synchronous pipe handle.
        let ret =
            unsafe { WriteFile(handle.0 as HANDLE, buf.as_ptr(), len, written, ptr::null_mut()) };
        bool_call(ret)
    }
}

/// Visible window size of the console attached to stdout, if any.
pub fn console_size() -> Option<Size> {
    // SAFETY: plain console queries on the process's own std handle.
    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE);
        if handle.is_null() || handle == INVALID_HANDLE_VALUE {
            return None;
        }
        let mut info = mem::MaybeUninit::<CONSOLE_SCREEN_BUFFER_INFO>::uninit();
        if GetConsoleScreenBufferInfo(handle, info.as_mut_ptr()) == 0 {
            return None;
        }
        let info = info.assume_init();
        let cols = (info.srWindow.Right - info.srWindow.Left + 1) as u16;
        let rows = (info.srWindow.Bottom - info.srWindow.Top + 1) as u16;
        let size = Size::new(cols, rows);
        size.is_valid().then_some(size)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn bool_call(ret: i32) -> BoolCall {
    if ret != 0 {
        BoolCall::ok()
    } else {
        BoolCall::failed(last_error())
    }
}

/// Run a void native call and report the last error it left behind.
fn void_call(f: impl FnOnce()) -> Status {
    // SAFETY: thread-local error slot.
    unsafe { SetLastError(0) };
    f();
    last_error()
}

fn last_error() -> Status {
    // SAFETY: thread-local error slot.
    unsafe { GetLastError() }
}

fn coord(size: Size) -> COORD {
    COORD {
        X: size.width.min(i16::MAX as u16) as i16,
        Y: size.height.min(i16::MAX as u16) as i16,
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
