//! In-memory [`ConsoleApi`] backend.
//!
//! `SimConsole` models just enough of kernel32 to drive the bridge on any
//! platform: a handle table, reference-counted pipes, pseudo-consoles that
//! terminate attached processes when closed, heap buffers whose attribute
//! list state (initialized, deleted, freed) is tracked, and child programs
//! running on threads. Tests inspect it afterwards to check for leaks and
//! call ordering, and inject faults with [`SimFault`].

mod pipe;
mod programs;

use self::pipe::SimPipe;
use self::programs::{Program, ProgramIo, SimProcess};
use super::{
    BoolCall, ConsoleApi, HResult, ProcessInfo, RawAttributeList, RawHandle, RawPseudoConsole,
    Status, WaitCall, ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_INSUFFICIENT_BUFFER,
    ERROR_INVALID_HANDLE, ERROR_INVALID_PARAMETER, ERROR_NOT_ENOUGH_MEMORY,
    EXTENDED_STARTUPINFO_PRESENT, E_HANDLE, E_INVALIDARG, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
    STATUS_CONTROL_C_EXIT, S_OK, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use conbridge_common::Size;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bytes of attribute-list header plus per-attribute slot.
const ATTRIBUTE_LIST_HEADER: usize = 24;
const ATTRIBUTE_SLOT: usize = 24;

/// Failure to inject into the next matching call. Faults persist until
/// the backend is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimFault {
    CreatePipe,
    CreatePseudoConsole,
    /// The attribute-list size query succeeds instead of reporting
    /// `ERROR_INSUFFICIENT_BUFFER`.
    SizeQuerySucceeds,
    HeapAlloc,
    InitializeAttributeList,
    UpdateAttribute,
    CreateProcess,
    /// The attribute buffer is freed behind the bridge's back right after
    /// launch, so the later delete runs against released memory.
    AttributeBufferReleasedEarly,
    /// `WriteFile` succeeds but accepts one byte less than offered.
    ShortWrite,
}

enum SimObject {
    PipeRead(Arc<SimPipe>),
    PipeWrite(Arc<SimPipe>),
    Process(Arc<SimProcess>),
    Thread(Arc<SimProcess>),
}

impl SimObject {
    fn kind(&self) -> &'static str {
        match self {
            SimObject::PipeRead(_) => "pipe-read",
            SimObject::PipeWrite(_) => "pipe-write",
            SimObject::Process(_) => "process",
            SimObject::Thread(_) => "thread",
        }
    }
}

struct SimPseudoConsole {
    size: Size,
    input: Arc<SimPipe>,
    output: Arc<SimPipe>,
    attached: Vec<Arc<SimProcess>>,
}

#[derive(Debug, Default)]
struct SimBuffer {
    capacity: usize,
    initialized: bool,
    console: Option<usize>,
    deleted: bool,
    freed: bool,
}

impl SimBuffer {
    fn usable(&self) -> bool {
        self.initialized && !self.deleted && !self.freed
    }
}

#[derive(Default)]
struct SimState {
    next_handle: usize,
    next_address: usize,
    next_pid: u32,
    handles: HashMap<usize, SimObject>,
    consoles: HashMap<usize, SimPseudoConsole>,
    buffers: HashMap<usize, SimBuffer>,
    faults: HashSet<SimFault>,
    calls: Vec<String>,
    resizes: Vec<Size>,
}

impl SimState {
    fn insert(&mut self, object: SimObject) -> RawHandle {
        self.next_handle += 4;
        let id = self.next_handle;
        self.handles.insert(id, object);
        RawHandle(id)
    }

    fn record(&mut self, call: impl Into<String>) {
        self.calls.push(call.into());
    }
}

/// Simulated kernel32. Cheap to create; one per test.
pub struct SimConsole {
    state: Mutex<SimState>,
}

impl Default for SimConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl SimConsole {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_address: 0x1_0000,
                next_pid: 1000,
                ..SimState::default()
            }),
        }
    }

    pub fn inject(&self, fault: SimFault) {
        self.state.lock().faults.insert(fault);
    }

    /// Kernel handles currently open (pipes, processes, threads).
    pub fn open_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Heap buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.values().filter(|b| !b.freed).count()
    }

    pub fn live_consoles(&self) -> usize {
        self.state.lock().consoles.len()
    }

    pub fn console_size(&self, console: RawPseudoConsole) -> Option<Size> {
        self.state.lock().consoles.get(&console.0).map(|c| c.size)
    }

    /// Native calls made so far, in order, e.g. `"CloseHandle(thread)"`.
    /// Reads and writes are not recorded.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Every size successfully applied by `ResizePseudoConsole`.
    pub fn resizes(&self) -> Vec<Size> {
        self.state.lock().resizes.clone()
    }

    fn faulted(state: &SimState, fault: SimFault) -> bool {
        state.faults.contains(&fault)
    }
}

fn required_size(attribute_count: u32) -> usize {
    ATTRIBUTE_LIST_HEADER + ATTRIBUTE_SLOT * attribute_count as usize
}

impl ConsoleApi for SimConsole {
    fn create_pipe(&self, read: &mut RawHandle, write: &mut RawHandle) -> BoolCall {
        let mut state = self.state.lock();
        state.record("CreatePipe");
        if Self::faulted(&state, SimFault::CreatePipe) {
            return BoolCall::failed(ERROR_NOT_ENOUGH_MEMORY);
        }
        let pipe = SimPipe::new();
        *read = state.insert(SimObject::PipeRead(Arc::clone(&pipe)));
        *write = state.insert(SimObject::PipeWrite(pipe));
        BoolCall::ok()
    }

    fn close_handle(&self, handle: RawHandle) -> BoolCall {
        let mut state = self.state.lock();
        let Some(object) = state.handles.remove(&handle.0) else {
            state.record("CloseHandle(invalid)");
            return BoolCall::failed(ERROR_INVALID_HANDLE);
        };
        state.record(format!("CloseHandle({})", object.kind()));
        match object {
            SimObject::PipeRead(pipe) => pipe.release_reader(),
            SimObject::PipeWrite(pipe) => pipe.release_writer(),
            SimObject::Process(_) | SimObject::Thread(_) => {}
        }
        BoolCall::ok()
    }

    fn create_pseudo_console(
        &self,
        size: Size,
        input: RawHandle,
        output: RawHandle,
        console: &mut RawPseudoConsole,
    ) -> HResult {
        let mut state = self.state.lock();
        state.record("CreatePseudoConsole");
        if Self::faulted(&state, SimFault::CreatePseudoConsole) || !size.is_valid() {
            return E_INVALIDARG;
        }
        let input = match state.handles.get(&input.0) {
            Some(SimObject::PipeRead(pipe)) => Arc::clone(pipe),
            _ => return E_HANDLE,
        };
        let output = match state.handles.get(&output.0) {
            Some(SimObject::PipeWrite(pipe)) => Arc::clone(pipe),
            _ => return E_HANDLE,
        };
        input.add_reader();
        output.add_writer();

        state.next_handle += 4;
        let id = state.next_handle;
        state.consoles.insert(
            id,
            SimPseudoConsole {
                size,
                input,
                output,
                attached: Vec::new(),
            },
        );
        *console = RawPseudoConsole(id);
        S_OK
    }

    fn resize_pseudo_console(&self, console: RawPseudoConsole, size: Size) -> HResult {
        let mut state = self.state.lock();
        state.record("ResizePseudoConsole");
        if !size.is_valid() {
            return E_INVALIDARG;
        }
        let Some(entry) = state.consoles.get_mut(&console.0) else {
            return E_HANDLE;
        };
        entry.size = size;
        state.resizes.push(size);
        S_OK
    }

    fn close_pseudo_console(&self, console: RawPseudoConsole) -> Status {
        let mut state = self.state.lock();
        state.record("ClosePseudoConsole");
        let Some(entry) = state.consoles.remove(&console.0) else {
            return ERROR_INVALID_HANDLE;
        };
        for process in &entry.attached {
            process.exit(STATUS_CONTROL_C_EXIT);
        }
        entry.input.release_reader();
        entry.output.release_writer();
        0
    }

    fn heap_alloc(&self, bytes: usize) -> RawAttributeList {
        let mut state = self.state.lock();
        state.record("HeapAlloc");
        if Self::faulted(&state, SimFault::HeapAlloc) {
            return RawAttributeList::NULL;
        }
        state.next_address += 0x1000;
        let address = state.next_address;
        state.buffers.insert(
            address,
            SimBuffer {
                capacity: bytes,
                ..SimBuffer::default()
            },
        );
        RawAttributeList(address)
    }

    fn heap_free(&self, list: RawAttributeList) -> BoolCall {
        let mut state = self.state.lock();
        state.record("HeapFree");
        match state.buffers.get_mut(&list.0) {
            Some(buffer) if !buffer.freed => {
                buffer.freed = true;
                BoolCall::ok()
            }
            _ => BoolCall::failed(ERROR_INVALID_PARAMETER),
        }
    }

    fn initialize_proc_thread_attribute_list(
        &self,
        list: RawAttributeList,
        attribute_count: u32,
        size: &mut usize,
    ) -> BoolCall {
        let mut state = self.state.lock();
        state.record("InitializeProcThreadAttributeList");
        let required = required_size(attribute_count);

        if list.is_null() {
            *size = required;
            if Self::faulted(&state, SimFault::SizeQuerySucceeds) {
                return BoolCall::ok();
            }
            return BoolCall::failed(ERROR_INSUFFICIENT_BUFFER);
        }
        if Self::faulted(&state, SimFault::InitializeAttributeList) {
            return BoolCall::failed(ERROR_ACCESS_DENIED);
        }
        let Some(buffer) = state.buffers.get_mut(&list.0) else {
            return BoolCall::failed(ERROR_INVALID_PARAMETER);
        };
        if buffer.freed || buffer.initialized {
            return BoolCall::failed(ERROR_INVALID_PARAMETER);
        }
        if *size < required || buffer.capacity < required {
            *size = required;
            return BoolCall::failed(ERROR_INSUFFICIENT_BUFFER);
        }
        buffer.initialized = true;
        BoolCall::ok()
    }

    fn update_proc_thread_attribute(
        &self,
        list: RawAttributeList,
        attribute: usize,
        console: RawPseudoConsole,
    ) -> BoolCall {
        let mut state = self.state.lock();
        state.record("UpdateProcThreadAttribute");
        if Self::faulted(&state, SimFault::UpdateAttribute)
            || attribute != PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE
        {
            return BoolCall::failed(ERROR_INVALID_PARAMETER);
        }
        if !state.consoles.contains_key(&console.0) {
            return BoolCall::failed(ERROR_INVALID_HANDLE);
        }
        match state.buffers.get_mut(&list.0) {
            Some(buffer) if buffer.usable() => {
                buffer.console = Some(console.0);
                BoolCall::ok()
            }
            _ => BoolCall::failed(ERROR_INVALID_PARAMETER),
        }
    }

    fn delete_proc_thread_attribute_list(&self, list: RawAttributeList) -> Status {
        let mut state = self.state.lock();
        state.record("DeleteProcThreadAttributeList");
        match state.buffers.get_mut(&list.0) {
            Some(buffer) if buffer.usable() => {
                buffer.deleted = true;
                0
            }
            _ => ERROR_INVALID_PARAMETER,
        }
    }

    fn create_process(
        &self,
        command_line: &str,
        list: RawAttributeList,
        creation_flags: u32,
        info: &mut ProcessInfo,
    ) -> BoolCall {
        let mut state = self.state.lock();
        state.record("CreateProcess");
        if Self::faulted(&state, SimFault::CreateProcess) {
            return BoolCall::failed(ERROR_ACCESS_DENIED);
        }
        if creation_flags & EXTENDED_STARTUPINFO_PRESENT == 0 {
            return BoolCall::failed(ERROR_INVALID_PARAMETER);
        }
        let console_id = match state.buffers.get(&list.0) {
            Some(buffer) if buffer.usable() => buffer.console,
            _ => None,
        };
        let Some(console_id) = console_id else {
            return BoolCall::failed(ERROR_INVALID_PARAMETER);
        };
        let Some(program) = Program::parse(command_line) else {
            return BoolCall::failed(ERROR_FILE_NOT_FOUND);
        };

        state.next_pid += 4;
        let process = SimProcess::new(state.next_pid);
        let Some(console) = state.consoles.get_mut(&console_id) else {
            return BoolCall::failed(ERROR_INVALID_HANDLE);
        };
        let io = ProgramIo {
            input: Arc::clone(&console.input),
            output: Arc::clone(&console.output),
            process: Arc::clone(&process),
        };
        let spawned = thread::Builder::new()
            .name(format!("sim-child-{}", process.pid()))
            .spawn(move || programs::run(program, io));
        if spawned.is_err() {
            return BoolCall::failed(ERROR_NOT_ENOUGH_MEMORY);
        }
        console.attached.push(Arc::clone(&process));

        let process_handle = state.insert(SimObject::Process(Arc::clone(&process)));
        let thread_handle = state.insert(SimObject::Thread(Arc::clone(&process)));
        *info = ProcessInfo {
            process: process_handle,
            thread: thread_handle,
            process_id: process.pid(),
            thread_id: process.pid() + 1,
        };

        if Self::faulted(&state, SimFault::AttributeBufferReleasedEarly) {
            if let Some(buffer) = state.buffers.get_mut(&list.0) {
                buffer.freed = true;
            }
        }
        BoolCall::ok()
    }

    fn wait_for_single_object(&self, handle: RawHandle, timeout_ms: u32) -> WaitCall {
        let process = {
            let mut state = self.state.lock();
            state.record("WaitForSingleObject");
            match state.handles.get(&handle.0) {
                Some(SimObject::Process(p)) | Some(SimObject::Thread(p)) => Arc::clone(p),
                _ => {
                    return WaitCall {
                        event: WAIT_FAILED,
                        last_error: ERROR_INVALID_HANDLE,
                    }
                }
            }
        };
        let timeout = (timeout_ms != u32::MAX).then(|| Duration::from_millis(timeout_ms.into()));
        let event = if process.wait(timeout) {
            WAIT_OBJECT_0
        } else {
            WAIT_TIMEOUT
        };
        WaitCall {
            event,
            last_error: 0,
        }
    }

    fn get_exit_code_process(&self, process: RawHandle, code: &mut u32) -> BoolCall {
        let mut state = self.state.lock();
        state.record("GetExitCodeProcess");
        match state.handles.get(&process.0) {
            Some(SimObject::Process(p)) => {
                *code = p.exit_code();
                BoolCall::ok()
            }
            _ => BoolCall::failed(ERROR_INVALID_HANDLE),
        }
    }

    fn read_file(&self, handle: RawHandle, buf: &mut [u8], read: &mut u32) -> BoolCall {
        *read = 0;
        let pipe = match self.state.lock().handles.get(&handle.0) {
            Some(SimObject::PipeRead(pipe)) => Arc::clone(pipe),
            Some(_) => return BoolCall::failed(ERROR_ACCESS_DENIED),
            None => return BoolCall::failed(ERROR_INVALID_HANDLE),
        };
        let limit = buf.len().min(u32::MAX as usize);
        match pipe.read(&mut buf[..limit]) {
            Ok(n) => {
                *read = n as u32;
                BoolCall::ok()
            }
            Err(status) => BoolCall::failed(status),
        }
    }

    fn write_file(&self, handle: RawHandle, buf: &[u8], written: &mut u32) -> BoolCall {
        *written = 0;
        let (pipe, short) = {
            let state = self.state.lock();
            let pipe = match state.handles.get(&handle.0) {
                Some(SimObject::PipeWrite(pipe)) => Arc::clone(pipe),
                Some(_) => return BoolCall::failed(ERROR_ACCESS_DENIED),
                None => return BoolCall::failed(ERROR_INVALID_HANDLE),
            };
            (pipe, Self::faulted(&state, SimFault::ShortWrite))
        };
        let mut limit = buf.len().min(u32::MAX as usize);
        if short {
            limit = limit.saturating_sub(1);
        }
        match pipe.write(&buf[..limit]) {
            Ok(n) => {
                *written = n as u32;
                BoolCall::ok()
            }
            Err(status) => BoolCall::failed(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{ERROR_BROKEN_PIPE, ERROR_NO_DATA};

    fn pipe(api: &SimConsole) -> (RawHandle, RawHandle) {
        let mut read = RawHandle::default();
        let mut write = RawHandle::default();
        assert_eq!(api.create_pipe(&mut read, &mut write), BoolCall::ok());
        (read, write)
    }

    #[test]
    fn handles_are_distinct_and_closable_once() {
        let api = SimConsole::new();
        let (read, write) = pipe(&api);
        assert_ne!(read, write);
        assert_eq!(api.open_handles(), 2);

        assert_eq!(api.close_handle(read), BoolCall::ok());
        assert_eq!(
            api.close_handle(read),
            BoolCall::failed(ERROR_INVALID_HANDLE)
        );
        api.close_handle(write);
        assert_eq!(api.open_handles(), 0);
    }

    #[test]
    fn closing_console_breaks_outer_pipes() {
        let api = SimConsole::new();
        let (in_read, in_write) = pipe(&api);
        let (out_read, out_write) = pipe(&api);

        let mut console = RawPseudoConsole::default();
        let hr = api.create_pseudo_console(Size::new(80, 24), in_read, out_write, &mut console);
        assert_eq!(hr, S_OK);
        api.close_handle(in_read);
        api.close_handle(out_write);

        assert_eq!(api.close_pseudo_console(console), 0);

        let mut buf = [0u8; 4];
        let mut n = 0;
        assert_eq!(
            api.read_file(out_read, &mut buf, &mut n),
            BoolCall::failed(ERROR_BROKEN_PIPE)
        );
        assert_eq!(
            api.write_file(in_write, b"x", &mut n),
            BoolCall::failed(ERROR_NO_DATA)
        );
        assert_eq!(api.close_pseudo_console(console), ERROR_INVALID_HANDLE);
    }

    #[test]
    fn size_query_reports_insufficient_buffer() {
        let api = SimConsole::new();
        let mut size = 0;
        let result = api.initialize_proc_thread_attribute_list(RawAttributeList::NULL, 1, &mut size);
        assert_eq!(result, BoolCall::failed(ERROR_INSUFFICIENT_BUFFER));
        assert_eq!(size, 48);
    }

    #[test]
    fn delete_after_free_is_rejected() {
        let api = SimConsole::new();
        let mut size = required_size(1);
        let list = api.heap_alloc(size);
        assert_eq!(
            api.initialize_proc_thread_attribute_list(list, 1, &mut size),
            BoolCall::ok()
        );
        assert_eq!(api.heap_free(list), BoolCall::ok());
        assert_eq!(api.delete_proc_thread_attribute_list(list), ERROR_INVALID_PARAMETER);
        assert_eq!(api.heap_free(list), BoolCall::failed(ERROR_INVALID_PARAMETER));
        assert_eq!(api.live_buffers(), 0);
    }

    #[test]
    fn create_process_requires_bound_attribute_list() {
        let api = SimConsole::new();
        let mut size = required_size(1);
        let list = api.heap_alloc(size);
        api.initialize_proc_thread_attribute_list(list, 1, &mut size);

        let mut info = ProcessInfo::default();
        let result = api.create_process("exit 0", list, EXTENDED_STARTUPINFO_PRESENT, &mut info);
        assert_eq!(result, BoolCall::failed(ERROR_INVALID_PARAMETER));
        assert_eq!(api.open_handles(), 0);
    }
}
