use super::{BridgeState, Shared};
use conbridge_common::{BridgeError, SessionId, Size};
use parking_lot::Mutex;
use std::io;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// Forwards size changes to a running session's pseudo-console.
///
/// Cheap to clone and `Send`, so the session layer can hand it to whatever
/// receives window-change events.
#[derive(Clone)]
pub struct Resizer {
    session: SessionId,
    shared: Arc<Mutex<Shared>>,
}

impl Resizer {
    pub(super) fn new(session: SessionId, shared: Arc<Mutex<Shared>>) -> Self {
        Self { session, shared }
    }

    pub fn state(&self) -> BridgeState {
        self.shared.lock().state
    }

    /// Resize the pseudo-console. Fails with `InvalidState` before the
    /// console exists or once teardown has begun.
    pub fn resize(&self, size: Size) -> Result<(), BridgeError> {
        let mut shared = self.shared.lock();
        let state = shared.state;
        let console = match shared.console.as_mut() {
            Some(console) if state.accepts_resize() => console,
            _ => {
                return Err(BridgeError::InvalidState {
                    operation: "resize",
                    state: state.as_str(),
                })
            }
        };
        console.resize(size)?;
        tracing::debug!(session = %self.session, %size, "Resize forwarded");
        Ok(())
    }

    /// Apply every size received on `events` until the sender hangs up or
    /// the session is torn down.
    pub fn forward(self, events: mpsc::Receiver<Size>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("conbridge-resize".into())
            .spawn(move || {
                for size in events {
                    match self.resize(size) {
                        Ok(()) => {}
                        Err(_) if self.state() == BridgeState::TornDown => break,
                        Err(e) => {
                            tracing::warn!(session = %self.session, %size, error = %e, "Resize failed");
                        }
                    }
                }
            })
    }
}

impl std::fmt::Debug for Resizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resizer")
            .field("session", &self.session)
            .field("state", &self.state())
            .finish()
    }
}
