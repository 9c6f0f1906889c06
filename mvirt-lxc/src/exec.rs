//! In-container command execution.
//!
//! Commands run strictly in order. Each one goes through two bounded loops:
//! submission (every error retried with backoff) and result polling
//! (a `running` record does not use up an attempt).

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ExecPolicy;
use crate::error::{ExecutionError, GatewayError, Interrupted, ResultFailure};
use crate::gateway::ContainerGateway;
use crate::retry::{Deadline, should_retry};
use crate::types::{ContainerIdentity, ExecutionState};

pub struct CommandRunner {
    gateway: Arc<dyn ContainerGateway>,
    policy: ExecPolicy,
}

/// One command being run, for error context.
struct Job<'a> {
    identity: &'a ContainerIdentity,
    index: usize,
    command: &'a str,
}

impl Job<'_> {
    fn interrupted(&self, reason: Interrupted) -> ExecutionError {
        ExecutionError::Interrupted {
            identity: self.identity.clone(),
            index: self.index,
            command: self.command.to_string(),
            reason,
        }
    }
}

impl CommandRunner {
    pub fn new(gateway: Arc<dyn ContainerGateway>, policy: ExecPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Run `commands` in order. The first failure aborts the rest.
    pub async fn run(
        &self,
        identity: &ContainerIdentity,
        commands: &[String],
        deadline: &Deadline,
    ) -> Result<(), ExecutionError> {
        for (index, command) in commands.iter().enumerate() {
            let job = Job {
                identity,
                index,
                command,
            };
            info!(node = %identity.node, vmid = identity.id, index, command = %command, "Executing command");
            let execution_id = self.submit(&job, deadline).await?;
            self.await_result(&job, &execution_id, deadline).await?;
            info!(node = %identity.node, vmid = identity.id, index, "Command succeeded");
        }
        Ok(())
    }

    async fn submit(&self, job: &Job<'_>, deadline: &Deadline) -> Result<String, ExecutionError> {
        let mut attempts = 0u32;
        loop {
            deadline.check().map_err(|r| job.interrupted(r))?;
            attempts += 1;

            let error = match self
                .gateway
                .exec_async(job.identity, &self.policy.shell, job.command)
                .await
            {
                Ok(execution_id) => {
                    debug!(execution_id = %execution_id, attempt = attempts, "Command submitted");
                    return Ok(execution_id);
                }
                Err(e) => e,
            };

            if !should_retry(attempts, self.policy.submit_budget) {
                return Err(self.submit_failed(job, attempts, error));
            }

            warn!(
                node = %job.identity.node,
                vmid = job.identity.id,
                index = job.index,
                attempt = attempts,
                error = %error,
                "Command submission failed, retrying"
            );
            deadline
                .sleep(self.policy.submit_backoff.delay(attempts))
                .await
                .map_err(|r| job.interrupted(r))?;
        }
    }

    fn submit_failed(&self, job: &Job<'_>, attempts: u32, source: GatewayError) -> ExecutionError {
        ExecutionError::Submit {
            identity: job.identity.clone(),
            index: job.index,
            command: job.command.to_string(),
            attempts,
            source,
        }
    }

    async fn await_result(
        &self,
        job: &Job<'_>,
        execution_id: &str,
        deadline: &Deadline,
    ) -> Result<(), ExecutionError> {
        let mut attempts = 0u32;
        let mut running_polls = 0u32;
        let mut polls = 0u32;

        loop {
            polls += 1;
            deadline
                .sleep(self.policy.result_poll.delay(polls))
                .await
                .map_err(|r| job.interrupted(r))?;

            let failure = match self.gateway.execution_result(execution_id).await {
                Err(e) => ResultFailure::Fetch(e),
                Ok(record) => match record.status {
                    ExecutionState::Running => {
                        running_polls += 1;
                        debug!(execution_id, running_polls, "Command still running");
                        if let Some(max) = self.policy.max_running_polls
                            && running_polls >= max
                        {
                            return Err(ExecutionError::StillRunning {
                                identity: job.identity.clone(),
                                index: job.index,
                                command: job.command.to_string(),
                                polls: running_polls,
                            });
                        }
                        continue;
                    }
                    ExecutionState::Succeeded => {
                        let exit_code = match record.exit_code {
                            Some(code) => code,
                            None => {
                                warn!(
                                    node = %job.identity.node,
                                    vmid = job.identity.id,
                                    index = job.index,
                                    execution_id,
                                    "Command succeeded without an exit code, assuming 0"
                                );
                                0
                            }
                        };
                        if exit_code == 0 {
                            return Ok(());
                        }
                        return Err(ExecutionError::NonZeroExit {
                            identity: job.identity.clone(),
                            index: job.index,
                            command: job.command.to_string(),
                            exit_code,
                            output: record.output.unwrap_or_default(),
                        });
                    }
                    ExecutionState::Failed => ResultFailure::Remote(
                        record
                            .error
                            .unwrap_or_else(|| "execution failed without error message".into()),
                    ),
                },
            };

            attempts += 1;
            if !should_retry(attempts, self.policy.result_budget) {
                return Err(ExecutionError::Exhausted {
                    identity: job.identity.clone(),
                    index: job.index,
                    command: job.command.to_string(),
                    attempts,
                    last: failure,
                });
            }
            warn!(
                execution_id,
                attempt = attempts,
                budget = self.policy.result_budget,
                failure = %failure,
                "Command result unavailable, polling again"
            );
        }
    }
}
