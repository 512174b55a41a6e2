//! Builds the supervised action-steps runner from a container's declared
//! actions.
//!
//! The transformer is the bridge between the wire-level [`ActionSpec`]
//! list attached at Initialize and the [`Runner`] member the store node
//! composes into its ordered group.

use std::sync::Arc;

use async_trait::async_trait;

use crate::container::{ActionSpec, Container};
use crate::error::{Error, Result};
use crate::sandbox::{RunScript, SandboxProvider};
use crate::steps::{Action, ActionRunner, RunAction};
use crate::supervisor::{InterruptSignal, ReadySignal, Runner};

/// Per-run configuration handed to the transformer by the store node.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepsConfig {
    /// Port the proxy sidecar publishes its configuration discovery on.
    pub lds_port: u16,
}

/// Turns declared actions into a supervised steps runner.
pub struct Transformer {
    provider: Arc<dyn SandboxProvider>,
}

impl Transformer {
    /// Creates a transformer bound to the sandbox provider.
    #[must_use]
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self { provider }
    }

    /// Builds the steps runner for `container` against the sandbox
    /// container identified by `handle`.
    ///
    /// # Errors
    ///
    /// Fails when the container declares no actions to run.
    pub fn steps_runner(
        &self,
        container: &Container,
        handle: &str,
        config: StepsConfig,
    ) -> Result<Box<dyn Runner>> {
        if container.actions.is_empty() {
            return Err(Error::Internal(format!(
                "container {} has no actions to run",
                container.guid
            )));
        }

        let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(container.actions.len());
        for spec in &container.actions {
            match spec {
                ActionSpec::Run(run) => {
                    // Container env first, action env second, so an
                    // action can override what the container sets.
                    let mut env = container.env.clone();
                    env.extend(run.env.iter().cloned());

                    actions.push(Box::new(RunAction::new(
                        Arc::clone(&self.provider),
                        handle,
                        RunScript {
                            path: run.path.clone(),
                            args: run.args.clone(),
                            env,
                            user: run.user.clone(),
                        },
                        run.timeout(),
                    )));
                }
            }
        }

        tracing::debug!(
            guid = %container.guid,
            actions = actions.len(),
            lds_port = config.lds_port,
            "built steps runner"
        );

        Ok(Box::new(StepsRunner { actions }))
    }
}

/// Supervised member that drives the action sequence.
///
/// Ready is signalled once the sequence has started; interrupt stops
/// waiting and abandons the in-flight action, which is responsible for
/// its own cleanup.
struct StepsRunner {
    actions: Vec<Box<dyn Action>>,
}

#[async_trait]
impl Runner for StepsRunner {
    async fn run(
        self: Box<Self>,
        ready: ReadySignal,
        mut interrupt: InterruptSignal,
    ) -> Result<()> {
        let mut results = ActionRunner::run(self.actions);
        ready.notify();

        tokio::select! {
            result = results.recv() => result.unwrap_or_else(|| {
                Err(Error::Internal(
                    "action runner terminated without a result".to_string(),
                ))
            }),
            _ = interrupt.interrupted() => Ok(()),
        }
    }
}
