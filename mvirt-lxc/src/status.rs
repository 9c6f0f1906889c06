//! Status convergence: drive a container to `stopped` or `running`.
//!
//! Every iteration sleeps, re-reads the status from the cluster and issues
//! at most one start or stop. Containers in a transient state (anything but
//! `stopped` and `running`) are left alone until they settle.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::StatusPolicy;
use crate::error::{ConvergenceError, GatewayError, Interrupted};
use crate::gateway::ContainerGateway;
use crate::retry::{Deadline, should_retry};
use crate::types::{ContainerIdentity, ObservedStatus, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Start,
    Stop,
}

impl Transition {
    fn towards(observed: &ObservedStatus, desired: Status) -> Option<Self> {
        match (observed, desired) {
            (ObservedStatus::Stopped, Status::Running) => Some(Transition::Start),
            (ObservedStatus::Running, Status::Stopped) => Some(Transition::Stop),
            _ => None,
        }
    }
}

pub struct StatusDriver {
    gateway: Arc<dyn ContainerGateway>,
    policy: StatusPolicy,
}

impl StatusDriver {
    pub fn new(gateway: Arc<dyn ContainerGateway>, policy: StatusPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Converge `identity` to `desired`.
    ///
    /// Failed transitions and transient status reads share one retry budget.
    /// A non-transient status read error aborts immediately.
    pub async fn converge(
        &self,
        identity: &ContainerIdentity,
        desired: Status,
        deadline: &Deadline,
    ) -> Result<(), ConvergenceError> {
        let interrupted = |reason: Interrupted| ConvergenceError::Interrupted {
            identity: identity.clone(),
            reason,
        };

        let mut failures = 0u32;
        let mut polls = 0u32;
        let mut pause = self.policy.poll.delay(1);

        loop {
            deadline.sleep(pause).await.map_err(interrupted)?;
            polls += 1;
            pause = self.policy.poll.delay(polls + 1);

            let observed = match self.gateway.status(identity).await {
                Ok(observed) => observed,
                Err(e) if e.is_transient() => {
                    failures += 1;
                    pause = self.on_failure(identity, desired, failures, e)?;
                    continue;
                }
                Err(source) => {
                    return Err(ConvergenceError::Query {
                        identity: identity.clone(),
                        source,
                    });
                }
            };

            if observed.is(desired) {
                info!(
                    node = %identity.node,
                    vmid = identity.id,
                    status = %desired,
                    polls,
                    "Container reached desired status"
                );
                return Ok(());
            }

            debug!(
                node = %identity.node,
                vmid = identity.id,
                observed = %observed,
                desired = %desired,
                "Container not converged yet"
            );

            if let Some(transition) = Transition::towards(&observed, desired) {
                let result = match transition {
                    Transition::Start => self.gateway.start(identity).await,
                    Transition::Stop => {
                        self.gateway
                            .stop(identity, self.policy.overrule_shutdown)
                            .await
                    }
                };
                match result {
                    Ok(()) => {
                        info!(node = %identity.node, vmid = identity.id, ?transition, "Transition requested");
                    }
                    Err(e) => {
                        failures += 1;
                        pause = self.on_failure(identity, desired, failures, e)?;
                    }
                }
            }

            if polls >= self.policy.max_polls {
                return Err(ConvergenceError::Stalled {
                    identity: identity.clone(),
                    desired,
                    observed,
                    polls,
                });
            }
        }
    }

    /// Account for one failed call, returning the pause before the next poll.
    fn on_failure(
        &self,
        identity: &ContainerIdentity,
        desired: Status,
        failures: u32,
        error: GatewayError,
    ) -> Result<std::time::Duration, ConvergenceError> {
        if !should_retry(failures, self.policy.retry_budget) {
            return Err(ConvergenceError::Exhausted {
                identity: identity.clone(),
                desired,
                attempts: failures,
                source: error,
            });
        }
        warn!(
            node = %identity.node,
            vmid = identity.id,
            attempt = failures,
            budget = self.policy.retry_budget,
            error = %error,
            "Status convergence call failed, retrying"
        );
        Ok(self.policy.retry.delay(failures))
    }
}
