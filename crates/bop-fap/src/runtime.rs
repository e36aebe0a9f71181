use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct FapRuntimeOptions {
    /// Async workers driving remote store futures.
    pub worker_threads: Option<usize>,
    /// Cap on threads running restore jobs.
    pub max_blocking_threads: Option<usize>,
    pub shutdown_timeout: Duration,
}

impl Default for FapRuntimeOptions {
    fn default() -> Self {
        Self {
            worker_threads: Some(2),
            max_blocking_threads: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum FapRuntimeError {
    #[error("failed to build Tokio runtime: {0}")]
    Build(#[from] io::Error),
}

/// Tokio runtime hosting restore jobs.
///
/// Jobs go to the blocking pool through [`FapRuntime::spawn_blocking`].
/// Async remote store clients block on [`FapRuntime::handle`] from inside
/// those jobs.
#[derive(Debug)]
pub struct FapRuntime {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    stopped: CancellationToken,
    shutdown_timeout: Duration,
}

impl FapRuntime {
    #[instrument(skip(options), fields(
        worker_threads = ?options.worker_threads,
        max_blocking_threads = ?options.max_blocking_threads
    ))]
    pub fn create(options: FapRuntimeOptions) -> Result<Arc<Self>, FapRuntimeError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("bop-fap-rt");
        if let Some(threads) = options.worker_threads {
            builder.worker_threads(threads.max(1));
        }
        if let Some(threads) = options.max_blocking_threads {
            builder.max_blocking_threads(threads.max(1));
        }
        let runtime = builder.build()?;
        info!("fast-add-peer runtime started");
        Ok(Self::from_runtime(runtime, options.shutdown_timeout))
    }

    pub fn from_runtime(runtime: Runtime, shutdown_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            stopped: CancellationToken::new(),
            shutdown_timeout,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Run `job` on the blocking pool. Returns `None` once shut down.
    pub fn spawn_blocking<F, R>(&self, job: F) -> Option<JoinHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let guard = self.runtime.lock().expect("fap runtime mutex poisoned");
        guard.as_ref().map(|runtime| runtime.spawn_blocking(job))
    }

    /// Stop the runtime. Waits up to `shutdown_timeout` for blocking jobs,
    /// except when called from async context, where Tokio forbids waiting.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.stopped.cancel();
        let Some(runtime) = self
            .runtime
            .lock()
            .expect("fap runtime mutex poisoned")
            .take()
        else {
            return;
        };
        if Handle::try_current().is_ok() {
            debug!("inside async context, shutting runtime down in background");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(self.shutdown_timeout);
        }
        info!("fast-add-peer runtime stopped");
    }
}

impl Drop for FapRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
