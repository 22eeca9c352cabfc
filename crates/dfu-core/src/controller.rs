//! Session controller - the public facade.
//!
//! Owns at most one running [`DfuSession`] at a time on a worker thread and
//! forwards user commands to it. Handles are cheap to clone and may be used
//! from any thread, including from inside an observer callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::events::{DfuObserver, ObserverSet};
use crate::firmware::FirmwareImage;
use crate::session::{DfuSession, SessionCommand, SessionConfig, SessionError, SessionHandle};
use crate::state::DfuState;
use crate::transport::{DfuTransport, SharedTransport};

struct ActiveSession {
    handle: SessionHandle,
    worker: Option<JoinHandle<Result<(), SessionError>>>,
    abort_issued: bool,
}

#[derive(Default)]
struct Inner {
    config: Mutex<SessionConfig>,
    observers: Mutex<ObserverSet>,
    active: Mutex<Option<ActiveSession>>,
}

/// Start, pause, resume and abort DFU sessions.
#[derive(Clone, Default)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                ..Inner::default()
            }),
        }
    }

    /// Add an observer. It receives events from the next `start` on.
    pub fn register(&self, observer: Arc<dyn DfuObserver>) {
        lock(&self.inner.observers).register(observer);
    }

    pub fn config(&self) -> SessionConfig {
        lock(&self.inner.config).clone()
    }

    pub fn set_config(&self, config: SessionConfig) {
        *lock(&self.inner.config) = config;
    }

    /// Start updating `image` over `transport`.
    ///
    /// Preconditions are checked here and reported synchronously; the
    /// transfer itself runs on a worker thread.
    pub fn start<T: DfuTransport + 'static>(
        &self,
        transport: &Arc<SharedTransport<T>>,
        image: FirmwareImage,
    ) -> Result<(), SessionError> {
        let mut active = lock(&self.inner.active);
        // A worker taken by `wait` is still running until its state says so.
        if active.as_ref().is_some_and(|a| {
            !a.handle.state().is_terminal()
                && !a.worker.as_ref().is_some_and(JoinHandle::is_finished)
        }) {
            return Err(SessionError::AlreadyRunning);
        }

        let observers = lock(&self.inner.observers).clone();
        let (session, handle) = DfuSession::new(transport, image, self.config(), observers)?;

        info!("Starting DFU session");
        let worker = thread::Builder::new()
            .name("dfu-session".into())
            .spawn(move || session.run())
            .map_err(|e| SessionError::NotReady(format!("cannot spawn session thread: {e}")))?;

        *active = Some(ActiveSession {
            handle,
            worker: Some(worker),
            abort_issued: false,
        });
        Ok(())
    }

    /// Pause at the next chunk boundary. `false` if nothing is running.
    pub fn pause(&self) -> bool {
        self.send(SessionCommand::Pause)
    }

    /// Continue a paused upload from where it stopped.
    pub fn resume(&self) -> bool {
        self.send(SessionCommand::Resume)
    }

    /// Abort the running session.
    ///
    /// Returns whether an abort was issued: `false` when idle, already
    /// finished, or already aborting.
    pub fn abort(&self) -> bool {
        let mut active = lock(&self.inner.active);
        let Some(session) = active.as_mut() else {
            return false;
        };
        if session.abort_issued || session.handle.state().is_terminal() {
            debug!("Abort ignored");
            return false;
        }

        session.abort_issued = session.handle.send(SessionCommand::Abort);
        session.abort_issued
    }

    pub fn state(&self) -> DfuState {
        lock(&self.inner.active)
            .as_ref()
            .map_or(DfuState::Idle, |a| a.handle.state())
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.inner.active)
            .as_ref()
            .is_some_and(|a| a.handle.is_paused())
    }

    /// Block until the current session ends and return its outcome.
    pub fn wait(&self) -> Result<(), SessionError> {
        let worker = lock(&self.inner.active)
            .as_mut()
            .and_then(|a| a.worker.take())
            .ok_or_else(|| SessionError::NotReady("no session to wait for".into()))?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => {
                if let Some(session) = lock(&self.inner.active).as_ref() {
                    session.handle.mark_aborted();
                }
                Err(SessionError::WorkerPanicked)
            }
        }
    }

    fn send(&self, command: SessionCommand) -> bool {
        lock(&self.inner.active).as_ref().is_some_and(|a| {
            !a.handle.state().is_terminal() && a.handle.send(command)
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
