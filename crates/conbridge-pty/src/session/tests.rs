use super::*;
use crate::native::{SimConsole, SimFault, ERROR_INVALID_PARAMETER};
use crate::run_process_with_pty;
use std::io::{self, Cursor};
use std::thread;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("conbridge_pty=debug")
        .try_init();
}

fn sim() -> (Arc<SimConsole>, Arc<dyn ConsoleApi>) {
    init_tracing();
    let sim = Arc::new(SimConsole::new());
    let api: Arc<dyn ConsoleApi> = sim.clone();
    (sim, api)
}

fn assert_nothing_leaked(sim: &SimConsole) {
    assert_eq!(sim.open_handles(), 0, "handles leaked: {:?}", sim.calls());
    assert_eq!(sim.live_buffers(), 0, "attribute buffer leaked");
    assert_eq!(sim.live_consoles(), 0, "pseudo-console leaked");
}

/// Cloneable sink the test can inspect after the relay thread is done.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Input endpoint fed from the test through a channel; hangs up as EOF.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct Broken;

impl Read for Broken {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "endpoint reset"))
    }
}

impl Write for Broken {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint gone"))
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink whose writes park until the test hangs up the sender.
struct Stalled(mpsc::Receiver<()>);

impl Write for Stalled {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.0.recv();
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Drop CSI and OSC control sequences.
fn strip_escapes(bytes: &[u8]) -> String {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        match bytes.get(i) {
            Some(b'[') => {
                i += 1;
                while i < bytes.len() && !(0x40..=0x7e).contains(&bytes[i]) {
                    i += 1;
                }
                i += 1;
            }
            Some(b']') => {
                while i < bytes.len() && bytes[i] != 0x07 {
                    i += 1;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

#[test]
fn echo_hello_reaches_output() {
    let (sim, api) = sim();
    let out = SharedBuf::default();

    let result = run_process_with_pty(api, "echo hello", Size::new(80, 24), io::empty(), out.clone());

    assert!(result.is_ok(), "{result:?}");
    assert!(strip_escapes(&out.bytes()).contains("hello"));
    assert_nothing_leaked(&sim);
}

#[test]
fn non_zero_exit_is_child_failure() {
    let (sim, api) = sim();
    let result = run_process_with_pty(api, "exit 3", Size::default(), io::empty(), io::sink());
    assert!(matches!(result, Err(BridgeError::ChildProcessFailed { code: 3, .. })));
    assert_nothing_leaked(&sim);
}

#[test]
fn ten_thousand_bytes_echo_back_in_order() {
    let (sim, api) = sim();
    let data: Vec<u8> = (0..10_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let mut input = data.clone();
    input.push(0x04);
    let out = SharedBuf::default();

    let report = Bridge::new(api, BridgeOptions::default())
        .session("cat", Size::default())
        .run(Cursor::new(input), out.clone())
        .unwrap();

    assert_eq!(report.exit.code, 0);
    assert_eq!(report.output_relay.as_ref().map(|stats| stats.bytes), Some(10_000));
    assert_eq!(out.bytes(), data);
    assert!(report.teardown.is_ok());
    assert_nothing_leaked(&sim);
}

#[test]
fn resize_during_run_keeps_session_alive() {
    let (sim, api) = sim();
    let session = Bridge::new(api, BridgeOptions::default()).session("cat", Size::new(80, 24));
    let resizer = session.resizer();
    let (input_tx, input_rx) = mpsc::channel();
    let input = ChannelReader {
        rx: input_rx,
        pending: Vec::new(),
    };

    let runner = thread::spawn(move || session.run(input, io::sink()));
    wait_until("relaying", || resizer.state() >= BridgeState::Relaying);

    resizer.resize(Size::new(120, 40)).unwrap();
    let (resize_tx, resize_rx) = mpsc::channel();
    let forwarder = resizer.clone().forward(resize_rx).unwrap();
    resize_tx.send(Size::new(100, 30)).unwrap();
    wait_until("forwarded resize", || sim.resizes().len() == 2);

    input_tx.send(b"still here\x04".to_vec()).unwrap();
    let report = runner.join().unwrap().unwrap();
    assert_eq!(report.exit.code, 0);
    assert_eq!(sim.resizes(), vec![Size::new(120, 40), Size::new(100, 30)]);

    drop(resize_tx);
    forwarder.join().unwrap();
    assert_nothing_leaked(&sim);
}

#[test]
fn unknown_program_fails_launch() {
    let (sim, api) = sim();
    let result = run_process_with_pty(api, "nonexistent.exe", Size::default(), io::empty(), io::sink());
    match result {
        Err(BridgeError::SetupFailed { stage, source, .. }) => {
            assert_eq!(stage, Stage::Launch);
            assert_eq!(source.status(), Some(crate::native::ERROR_FILE_NOT_FOUND));
        }
        other => panic!("expected launch failure, got {other:?}"),
    }
    assert_nothing_leaked(&sim);
}

// ---------------------------------------------------------------------------
// Setup failures
// ---------------------------------------------------------------------------

#[test]
fn every_setup_failure_tears_down_what_was_built() {
    let cases = [
        (SimFault::CreatePipe, Stage::Pipes),
        (SimFault::CreatePseudoConsole, Stage::Console),
        (SimFault::SizeQuerySucceeds, Stage::Attributes),
        (SimFault::HeapAlloc, Stage::Attributes),
        (SimFault::InitializeAttributeList, Stage::Attributes),
        (SimFault::UpdateAttribute, Stage::Attributes),
        (SimFault::CreateProcess, Stage::Launch),
    ];
    for (fault, expected) in cases {
        let (sim, api) = sim();
        sim.inject(fault);
        let session = Bridge::new(api, BridgeOptions::default()).session("echo hi", Size::default());
        let resizer = session.resizer();

        match session.run(io::empty(), io::sink()) {
            Err(BridgeError::SetupFailed {
                stage, teardown, ..
            }) => {
                assert_eq!(stage, expected, "{fault:?}");
                assert!(teardown.is_empty(), "{fault:?}: {teardown:?}");
            }
            other => panic!("{fault:?}: expected setup failure, got {other:?}"),
        }
        assert_eq!(resizer.state(), BridgeState::TornDown);
        assert_nothing_leaked(&sim);
    }
}

#[test]
fn launch_failure_never_reaches_create_process_twice() {
    let (sim, api) = sim();
    sim.inject(SimFault::CreateProcess);
    let _ = run_process_with_pty(api, "echo hi", Size::default(), io::empty(), io::sink());
    let launches = sim.calls().iter().filter(|c| *c == "CreateProcess").count();
    assert_eq!(launches, 1);
}

#[test]
fn invalid_size_fails_at_console_stage() {
    let (sim, api) = sim();
    let result = run_process_with_pty(api, "echo hi", Size::new(0, 24), io::empty(), io::sink());
    assert!(matches!(
        result,
        Err(BridgeError::SetupFailed {
            stage: Stage::Console,
            ..
        })
    ));
    assert_nothing_leaked(&sim);
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn teardown_runs_in_fixed_order() {
    let (sim, api) = sim();
    run_process_with_pty(api, "exit 0", Size::default(), io::empty(), io::sink()).unwrap();

    let expected = [
        "CreatePipe",
        "CreatePipe",
        "CreatePseudoConsole",
        // inner ends, right after the console takes them
        "CloseHandle(pipe-read)",
        "CloseHandle(pipe-write)",
        "InitializeProcThreadAttributeList",
        "HeapAlloc",
        "InitializeProcThreadAttributeList",
        "UpdateProcThreadAttribute",
        "CreateProcess",
        "WaitForSingleObject",
        "GetExitCodeProcess",
        "CloseHandle(thread)",
        "CloseHandle(process)",
        "DeleteProcThreadAttributeList",
        "HeapFree",
        "ClosePseudoConsole",
        // outer ends: output read, input write
        "CloseHandle(pipe-read)",
        "CloseHandle(pipe-write)",
    ];
    assert_eq!(sim.calls(), expected);
}

#[test]
fn released_buffer_is_reported_without_masking_exit() {
    let (sim, api) = sim();
    sim.inject(SimFault::AttributeBufferReleasedEarly);

    let report = Bridge::new(Arc::clone(&api), BridgeOptions::default())
        .session("echo hi", Size::default())
        .run(io::empty(), io::sink())
        .unwrap();

    assert_eq!(report.exit.code, 0);
    match &report.teardown {
        Err(BridgeError::TeardownFailed(errors)) => {
            assert!(errors.contains(&ConsoleError::PlatformCallFailed {
                call: "DeleteProcThreadAttributeList",
                status: ERROR_INVALID_PARAMETER,
            }));
        }
        other => panic!("expected teardown failure, got {other:?}"),
    }
    assert!(report.into_result().is_ok());
    assert_eq!(sim.open_handles(), 0);
    assert_eq!(sim.live_consoles(), 0);
}

#[test]
fn teardown_failures_ride_along_on_child_failure() {
    let (sim, api) = sim();
    sim.inject(SimFault::AttributeBufferReleasedEarly);

    let err = Bridge::new(api, BridgeOptions::default())
        .session("exit 3", Size::default())
        .run(io::empty(), io::sink())
        .unwrap()
        .into_result()
        .unwrap_err();

    match err {
        BridgeError::ChildProcessFailed { code, ref teardown } => {
            assert_eq!(code, 3);
            assert!(teardown.contains(&ConsoleError::PlatformCallFailed {
                call: "DeleteProcThreadAttributeList",
                status: ERROR_INVALID_PARAMETER,
            }));
        }
        ref other => panic!("expected child failure, got {other:?}"),
    }
    assert!(!err.teardown_errors().is_empty());
}

#[test]
fn bounded_wait_times_out_and_terminates_child() {
    let (sim, api) = sim();
    let options = BridgeOptions {
        wait: WaitPolicy::Bounded(Duration::from_millis(50)),
        ..BridgeOptions::default()
    };

    let result = Bridge::new(api, options)
        .session("sleep 10000", Size::default())
        .run(io::empty(), io::sink());

    match result {
        Err(BridgeError::ExitWaitTimedOut { timeout, teardown }) => {
            assert_eq!(timeout, Duration::from_millis(50));
            assert!(teardown.is_empty());
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_nothing_leaked(&sim);
}

// ---------------------------------------------------------------------------
// Relay failures
// ---------------------------------------------------------------------------

#[test]
fn both_directions_failing_first_is_relay_failure() {
    let (sim, api) = sim();
    let result = run_process_with_pty(api, "echo hi", Size::default(), Broken, Broken);
    assert!(matches!(result, Err(BridgeError::RelayFailed { .. })), "{result:?}");
    assert_nothing_leaked(&sim);
}

#[test]
fn stalled_output_endpoint_does_not_hang_run() {
    let (sim, api) = sim();
    let (release, gate) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();
    let started = Instant::now();

    thread::spawn(move || {
        let result = Bridge::new(api, BridgeOptions::default())
            .session("echo hello", Size::default())
            .run(io::empty(), Stalled(gate));
        let _ = done_tx.send(result);
    });

    let report = done_rx
        .recv_timeout(OUTPUT_DRAIN_GRACE + Duration::from_secs(5))
        .expect("run blocked on the stalled output endpoint")
        .unwrap();
    assert!(started.elapsed() >= OUTPUT_DRAIN_GRACE);
    assert_eq!(report.exit.code, 0);
    assert!(report.output_relay.is_none());
    assert!(report.teardown.is_ok());
    assert_nothing_leaked(&sim);

    drop(release);
}

#[test]
fn one_failed_direction_is_not_fatal() {
    let (sim, api) = sim();
    let report = Bridge::new(api, BridgeOptions::default())
        .session("echo hi", Size::default())
        .run(io::empty(), Broken)
        .unwrap();

    assert!(report.output_relay.as_ref().is_some_and(RelayStats::failed_before_data));
    assert_eq!(report.exit.code, 0);
    assert_nothing_leaked(&sim);
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[test]
fn resize_outside_running_states_is_rejected() {
    let (_sim, api) = sim();
    let session = Bridge::new(api, BridgeOptions::default()).session("exit 0", Size::default());
    let resizer = session.resizer();
    assert_eq!(session.state(), BridgeState::Created);

    let err = resizer.resize(Size::new(100, 30)).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::InvalidState {
            operation: "resize",
            state: "created",
        }
    ));

    session.run(io::empty(), io::sink()).unwrap();
    let err = resizer.resize(Size::new(100, 30)).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::InvalidState {
            state: "torn-down",
            ..
        }
    ));
}

#[test]
fn state_order_matches_lifecycle() {
    assert!(BridgeState::Created < BridgeState::PipesOpen);
    assert!(BridgeState::ExitWaiting < BridgeState::TornDown);
    assert!(!BridgeState::PipesOpen.accepts_resize());
    assert!(BridgeState::ConsoleCreated.accepts_resize());
    assert!(BridgeState::Relaying.accepts_resize());
    assert!(BridgeState::ExitWaiting.accepts_resize());
    assert!(!BridgeState::TornDown.accepts_resize());
}

#[test]
fn strip_escapes_removes_csi_and_osc() {
    let text = strip_escapes(b"\x1b[2J\x1b[Hhi\x1b]0;title\x07!\x1b[?25h");
    assert_eq!(text, "hi!");
}
