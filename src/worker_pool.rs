//! Bounded worker pool for downstream dispatch
//!
//! Every running task holds one semaphore permit, so at most `max_size`
//! tasks run at once. A submission that finds no free permit is handed
//! back to the caller instead of being queued or dropped; [`WorkerPool::submit`]
//! retries such submissions after a short sleep, which slows the caller's
//! receive loop down to the pool's processing rate.

use futures::FutureExt;
use serde::Deserialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Sizing for a [`WorkerPool`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers expected to be busy under normal load; informational
    pub core_size: usize,

    /// Upper bound on concurrently running tasks
    pub max_size: usize,

    /// Sleep between submissions rejected for saturation
    #[serde(with = "crate::settings::duration_ms")]
    pub submit_retry_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: 5,
            max_size: 10,
            submit_retry_interval: Duration::from_millis(10),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(core_size: usize, max_size: usize) -> Self {
        Self {
            core_size,
            max_size,
            ..Default::default()
        }
    }

    /// Set the saturation retry interval (builder pattern)
    pub fn with_submit_retry_interval(mut self, interval: Duration) -> Self {
        self.submit_retry_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("worker pool max size must be at least 1".to_string()));
        }
        if self.core_size > self.max_size {
            return Err(Error::Config(format!(
                "worker pool core size {} exceeds max size {}",
                self.core_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Why a task was not accepted; the task is handed back
pub enum SubmitError<T> {
    /// Every worker is busy
    Saturated(T),

    /// The pool was shut down
    Shutdown(T),

    /// The pool cannot run tasks at all
    Internal(T, String),
}

impl<T> std::fmt::Debug for SubmitError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Saturated(_) => write!(f, "Saturated"),
            SubmitError::Shutdown(_) => write!(f, "Shutdown"),
            SubmitError::Internal(_, reason) => write!(f, "Internal({})", reason),
        }
    }
}

/// Bounded concurrent executor
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    shutdown: AtomicBool,
    idle: Notify,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        info!(
            pool = %name,
            core_size = config.core_size,
            max_size = config.max_size,
            "Created worker pool"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                name,
                config,
                shutdown: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Tasks currently running
    pub fn active_count(&self) -> usize {
        self.inner
            .config
            .max_size
            .saturating_sub(self.inner.permits.available_permits())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Start `task` if a worker is free
    pub fn try_submit<F>(&self, task: F) -> std::result::Result<(), SubmitError<F>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(SubmitError::Shutdown(task));
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => return Err(SubmitError::Internal(task, e.to_string())),
        };

        let permit = match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(SubmitError::Saturated(task)),
            Err(TryAcquireError::Closed) => return Err(SubmitError::Shutdown(task)),
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                error!(pool = %inner.name, "Worker task panicked");
            }
            drop(permit);
            inner.idle.notify_waiters();
        });
        Ok(())
    }

    /// Submit `task`, sleeping and retrying while the pool is saturated
    ///
    /// Returns an error only when the pool is shut down or cannot run
    /// tasks; the task is dropped in that case.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task = task;
        let mut rejections: u64 = 0;
        loop {
            match self.try_submit(task) {
                Ok(()) => {
                    if rejections > 0 {
                        debug!(pool = %self.inner.name, rejections, "Submission accepted after backpressure");
                    }
                    return Ok(());
                }
                Err(SubmitError::Saturated(rejected)) => {
                    task = rejected;
                    rejections += 1;
                    tokio::time::sleep(self.inner.config.submit_retry_interval).await;
                }
                Err(SubmitError::Shutdown(_)) => return Err(Error::PoolShutdown),
                Err(SubmitError::Internal(_, reason)) => return Err(Error::PoolInternal(reason)),
            }
        }
    }

    /// Stop accepting tasks; running tasks finish. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::SeqCst) {
            self.inner.permits.close();
            info!(pool = %self.inner.name, active = self.active_count(), "Worker pool shut down");
        }
    }

    /// Wait until no task is running; `false` if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.active_count() == 0 {
                    return;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
