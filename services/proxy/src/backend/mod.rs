//! Backend instance interface.
//!
//! A backend is the external tunnel client that serves one region on one
//! local address. The pool only needs two things from it:
//! - `Backend::start` returns once the instance owns its address
//! - `InstanceHandle::stop` resolves once the instance has released it
//!
//! Two implementations are provided: `CommandBackend` runs an external
//! program per generation, `MockBackend` is an in-process echo server for
//! development and tests.

mod command;
mod mock;

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use shuffle_regions::RegionCode;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use command::{CommandBackend, CommandBackendConfig};
pub use mock::MockBackend;

/// Errors raised by backend instances.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend process could not be spawned.
    #[error("failed to spawn backend: {0}")]
    Spawn(#[source] io::Error),

    /// The backend did not start accepting connections in time.
    #[error("backend not ready on {addr} after {timeout:?}")]
    NotReady {
        addr: SocketAddr,
        timeout: std::time::Duration,
    },

    /// The backend exited on its own.
    #[error("backend exited: {status}")]
    Exited { status: String },

    /// The backend could not bind its address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// I/O error while driving the backend.
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),

    /// The task driving the backend panicked or was aborted.
    #[error("backend task failed: {0}")]
    Task(String),

    /// The backend refused to start.
    #[error("backend start rejected: {0}")]
    Rejected(String),
}

/// What to run: one generation of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec {
    pub region: RegionCode,
    pub addr: SocketAddr,
    pub generation: u64,
}

/// Backend start contract.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Start an instance for `spec`.
    ///
    /// Resolves once the instance is accepting connections on `spec.addr`.
    /// Dropping the returned future before it resolves must not leave a
    /// running instance behind.
    async fn start(&self, spec: &InstanceSpec) -> Result<InstanceHandle, BackendError>;
}

/// Handle to one running generation.
///
/// Owns the generation's cancellation sender and the task driving the
/// instance. The task finishing is the signal that the address is free.
/// Dropping the handle cancels the instance without waiting for it.
pub struct InstanceHandle {
    spec: InstanceSpec,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), BackendError>>>,
}

impl InstanceHandle {
    /// Drive a started instance on its own task.
    ///
    /// `run` receives the generation's cancellation signal and must return
    /// only after it has released `spec.addr`.
    pub fn spawn<F, Fut>(spec: InstanceSpec, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(cancel_rx));
        Self {
            spec,
            cancel,
            task: Some(task),
        }
    }

    pub fn spec(&self) -> &InstanceSpec {
        &self.spec
    }

    /// Whether the instance task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Resolve when the instance finishes without being stopped.
    ///
    /// Cancel safe. Pends forever once the exit has been observed.
    pub async fn exited(&mut self) -> Result<(), BackendError> {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = join_result(task.await);
        self.task = None;
        result
    }

    /// Cancel the instance and wait until it has released its address.
    pub async fn stop(mut self) -> Result<(), BackendError> {
        let _ = self.cancel.send(true);
        match self.task.take() {
            Some(task) => join_result(task.await),
            None => Ok(()),
        }
    }
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("spec", &self.spec)
            .field("running", &self.is_running())
            .finish()
    }
}

fn join_result(
    result: Result<Result<(), BackendError>, tokio::task::JoinError>,
) -> Result<(), BackendError> {
    match result {
        Ok(inner) => inner,
        Err(e) => Err(BackendError::Task(e.to_string())),
    }
}

/// Substitute `{region}`, `{host}`, `{port}`, `{addr}` and `{generation}`.
pub fn render_arg(template: &str, spec: &InstanceSpec) -> String {
    template
        .replace("{region}", spec.region.as_str())
        .replace("{host}", &spec.addr.ip().to_string())
        .replace("{port}", &spec.addr.port().to_string())
        .replace("{addr}", &spec.addr.to_string())
        .replace("{generation}", &spec.generation.to_string())
}
