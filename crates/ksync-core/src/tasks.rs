use std::borrow::Cow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Named background task owned by the kernel.
#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        let name = name.into();
        trace!(task = %name, "task registered");
        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task without waiting for it.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait up to `grace` for the task to finish on its own, then abort it.
    /// Returns true when the task completed without being aborted.
    pub async fn shutdown_with_grace(self, grace: Duration) -> bool {
        let Self { name, mut handle } = self;
        if grace.is_zero() {
            handle.abort();
            let result = handle.await;
            if let Err(err) = &result {
                debug!(task = %name, error = %err, "task join after abort failed");
            }
            return result.is_ok();
        }
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {
                trace!(task = %name, "task completed");
                true
            }
            Ok(Err(err)) => {
                debug!(task = %name, error = %err, "task ended with join error");
                false
            }
            Err(_) => {
                debug!(task = %name, grace_ms = grace.as_millis() as u64, "grace elapsed; aborting task");
                handle.abort();
                let _ = handle.await;
                false
            }
        }
    }
}
