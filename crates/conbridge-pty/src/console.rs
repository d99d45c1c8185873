//! The pseudo-console object.

use crate::native::convention::zero_is_success;
use crate::native::{ConsoleApi, RawPseudoConsole, E_HANDLE, E_INVALIDARG};
use crate::pipe::PipeEndpoint;
use conbridge_common::{ConsoleError, Size};
use std::sync::Arc;

/// Owned handle to a native pseudo-console.
///
/// Valid from a successful [`PseudoConsole::create`] until [`close`],
/// which consumes it, so a handle cannot be closed twice. Closing while a
/// process is attached terminates that process.
///
/// [`close`]: PseudoConsole::close
pub struct PseudoConsole {
    api: Arc<dyn ConsoleApi>,
    raw: Option<RawPseudoConsole>,
    size: Size,
}

impl PseudoConsole {
    /// Create a pseudo-console reading from `input` and writing to `output`
    /// (the inner pipe ends). The pseudo-console takes its own references,
    /// so the caller should close both ends right after this returns.
    pub fn create(
        api: &Arc<dyn ConsoleApi>,
        size: Size,
        input: &PipeEndpoint,
        output: &PipeEndpoint,
    ) -> Result<Self, ConsoleError> {
        if !size.is_valid() {
            return Err(ConsoleError::PlatformCallFailed {
                call: "CreatePseudoConsole",
                status: E_INVALIDARG as u32,
            });
        }
        let raw = input.with_raw("CreatePseudoConsole", |_, input| {
            output.with_raw("CreatePseudoConsole", |api, output| {
                let mut raw = RawPseudoConsole::default();
                let hr = api.create_pseudo_console(size, input, output, &mut raw);
                zero_is_success("CreatePseudoConsole", hr as u32)?;
                Ok(raw)
            })
        })?;

        tracing::debug!(console = raw.0, %size, "Pseudo-console created");
        Ok(Self {
            api: Arc::clone(api),
            raw: Some(raw),
            size,
        })
    }

    /// Apply new dimensions. Repeating the current size is accepted and
    /// leaves the console unchanged.
    pub fn resize(&mut self, size: Size) -> Result<(), ConsoleError> {
        let raw = self.raw.ok_or(ConsoleError::PlatformCallFailed {
            call: "ResizePseudoConsole",
            status: E_HANDLE as u32,
        })?;
        if size == self.size {
            return Ok(());
        }
        let hr = self.api.resize_pseudo_console(raw, size);
        zero_is_success("ResizePseudoConsole", hr as u32)?;
        tracing::debug!(console = raw.0, %size, "Pseudo-console resized");
        self.size = size;
        Ok(())
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn raw(&self) -> Option<RawPseudoConsole> {
        self.raw
    }

    /// Release the native object, terminating any attached process.
    pub fn close(mut self) -> Result<(), ConsoleError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), ConsoleError> {
        let Some(raw) = self.raw.take() else {
            return Ok(());
        };
        let status = self.api.close_pseudo_console(raw);
        tracing::debug!(console = raw.0, status, "Pseudo-console closed");
        zero_is_success("ClosePseudoConsole", status)
    }
}

impl std::fmt::Debug for PseudoConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PseudoConsole")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            tracing::warn!(error = %e, "Failed to close pseudo-console on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{SimConsole, SimFault};
    use crate::pipe::PipePair;

    fn setup() -> (Arc<SimConsole>, Arc<dyn ConsoleApi>, PipePair, PipePair) {
        let sim = Arc::new(SimConsole::new());
        let api: Arc<dyn ConsoleApi> = sim.clone();
        let input = PipePair::create(&api).unwrap();
        let output = PipePair::create(&api).unwrap();
        (sim, api, input, output)
    }

    #[test]
    fn create_then_close_leaks_nothing() {
        for size in [Size::new(1, 1), Size::new(80, 24), Size::new(32767, 32767)] {
            let (sim, api, input, output) = setup();
            let console = PseudoConsole::create(&api, size, &input.read, &output.write).unwrap();
            input.read.close().unwrap();
            output.write.close().unwrap();
            console.close().unwrap();
            drop(input);
            drop(output);
            assert_eq!(sim.open_handles(), 0, "size {size}");
            assert_eq!(sim.live_consoles(), 0);
        }
    }

    #[test]
    fn zero_size_is_rejected_before_native_call() {
        let (sim, api, input, output) = setup();
        let err = PseudoConsole::create(&api, Size::new(0, 24), &input.read, &output.write)
            .unwrap_err();
        assert_eq!(err.status(), Some(0x8007_0057));
        assert!(!sim.calls().iter().any(|c| c == "CreatePseudoConsole"));
    }

    #[test]
    fn native_failure_uses_hresult_convention() {
        let (sim, api, input, output) = setup();
        sim.inject(SimFault::CreatePseudoConsole);
        let err = PseudoConsole::create(&api, Size::default(), &input.read, &output.write)
            .unwrap_err();
        assert!(matches!(
            err,
            ConsoleError::PlatformCallFailed {
                call: "CreatePseudoConsole",
                status: 0x8007_0057,
            }
        ));
    }

    #[test]
    fn resize_is_idempotent() {
        let (sim, api, input, output) = setup();
        let mut console =
            PseudoConsole::create(&api, Size::new(80, 24), &input.read, &output.write).unwrap();
        let raw = console.raw().unwrap();

        console.resize(Size::new(120, 40)).unwrap();
        let once = sim.console_size(raw);
        console.resize(Size::new(120, 40)).unwrap();

        assert_eq!(sim.console_size(raw), once);
        assert_eq!(console.size(), Size::new(120, 40));
        assert_eq!(sim.resizes(), vec![Size::new(120, 40)]);
    }

    #[test]
    fn resize_rejects_zero() {
        let (_sim, api, input, output) = setup();
        let mut console =
            PseudoConsole::create(&api, Size::new(80, 24), &input.read, &output.write).unwrap();
        assert!(console.resize(Size::new(0, 0)).is_err());
        assert_eq!(console.size(), Size::new(80, 24));
    }

    #[test]
    fn drop_closes_console() {
        let (sim, api, input, output) = setup();
        let console =
            PseudoConsole::create(&api, Size::default(), &input.read, &output.write).unwrap();
        drop(console);
        assert_eq!(sim.live_consoles(), 0);
    }
}
