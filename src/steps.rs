//! Action model and the sequential action runner.
//!
//! [`ActionRunner::run`] drives a list of actions in declared order on a
//! single background task and delivers exactly one result on a
//! capacity-one channel: the first failure (short-circuit) or success
//! once every action completed. The capacity guarantees the publish
//! never blocks, so the task terminates even if nobody reads the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::sandbox::{ProcessPayload, RunScript, SandboxProvider};

// =============================================================================
// Action
// =============================================================================

/// A unit of work performed inside the sandbox.
///
/// Actions are responsible for their own cleanup when abandoned: on
/// timeout the runner stops waiting but does not force-kill anything.
#[async_trait]
pub trait Action: Send + Sync {
    /// Short name used in timeout errors and logs.
    fn name(&self) -> &str;

    /// Optional per-action timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Performs the action to completion.
    async fn perform(&self) -> Result<()>;
}

// =============================================================================
// Run Action
// =============================================================================

/// Runs a process inside the sandbox and fails on a non-zero exit.
pub struct RunAction {
    provider: Arc<dyn SandboxProvider>,
    handle: String,
    script: RunScript,
    timeout: Option<Duration>,
}

impl RunAction {
    /// Creates a run action against an existing sandbox container.
    #[must_use]
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        handle: impl Into<String>,
        script: RunScript,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            provider,
            handle: handle.into(),
            script,
            timeout,
        }
    }
}

#[async_trait]
impl Action for RunAction {
    fn name(&self) -> &str {
        &self.script.path
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn perform(&self) -> Result<()> {
        let mut stream = self
            .provider
            .run(&self.handle, self.script.clone())
            .await?;

        while let Some(payload) = stream.recv().await {
            match payload {
                ProcessPayload::Stdout(chunk) => {
                    tracing::debug!(
                        handle = %self.handle,
                        bytes = chunk.len(),
                        "process stdout"
                    );
                }
                ProcessPayload::Stderr(chunk) => {
                    tracing::debug!(
                        handle = %self.handle,
                        bytes = chunk.len(),
                        "process stderr"
                    );
                }
                ProcessPayload::Exited(0) => return Ok(()),
                ProcessPayload::Exited(status) => {
                    return Err(Error::NonZeroExit { status });
                }
            }
        }

        Err(Error::Internal(
            "process stream closed without an exit status".to_string(),
        ))
    }
}

// =============================================================================
// Action Runner
// =============================================================================

/// Drives actions strictly in declared order.
pub struct ActionRunner;

impl ActionRunner {
    /// Starts executing `actions` and returns the result channel.
    ///
    /// The channel receives exactly one value. The caller may drop the
    /// receiver at any point; the background task still terminates once
    /// all actions have terminated.
    #[must_use]
    pub fn run(actions: Vec<Box<dyn Action>>) -> mpsc::Receiver<Result<()>> {
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut outcome = Ok(());
            for action in actions {
                let result = match action.timeout() {
                    Some(timeout) if !timeout.is_zero() => {
                        match tokio::time::timeout(timeout, action.perform()).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::ActionTimeout {
                                action: action.name().to_string(),
                                timeout,
                            }),
                        }
                    }
                    _ => action.perform().await,
                };

                if let Err(err) = result {
                    tracing::debug!(action = action.name(), error = %err, "action failed");
                    outcome = Err(err);
                    break;
                }
            }
            // Capacity one: never blocks, read or not.
            let _ = tx.send(outcome).await;
        });

        rx
    }
}
