//! Process-wide task group
//!
//! All long-running loops (bus dispatch, MQTT listener) run inside one
//! [`TaskGroup`]. They share a single [`CancellationToken`]: the first task
//! that fails or panics cancels the others, and its error becomes the
//! result of the whole group.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct TaskGroup {
    tasks: JoinSet<(String, Result<()>)>,
    shutdown: CancellationToken,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token every task is expected to honor.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!("Starting task {}", name);
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Runs until every task has finished, cancelling the group on Ctrl-C.
    pub async fn wait(self) -> Result<()> {
        self.wait_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`TaskGroup::wait`], with `signal` in place of Ctrl-C.
    pub async fn wait_until<S>(mut self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut signalled = false;
        let mut first_error = None;

        loop {
            tokio::select! {
                _ = &mut signal, if !signalled => {
                    info!("Shutdown signal received; stopping all tasks");
                    signalled = true;
                    self.shutdown.cancel();
                }
                joined = self.tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    let failure = match joined {
                        Ok((name, Ok(()))) => {
                            info!("Task {} finished", name);
                            None
                        }
                        Ok((name, Err(e))) => {
                            error!("Task {} failed: {:#}", name, e);
                            Some(e.wrap_err(format!("task {} failed", name)))
                        }
                        Err(e) => {
                            error!("Task panicked: {}", e);
                            Some(eyre!("task panicked: {}", e))
                        }
                    };

                    if let Some(failure) = failure {
                        self.shutdown.cancel();
                        first_error.get_or_insert(failure);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
