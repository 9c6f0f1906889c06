//! Lifecycle orchestration.
//!
//! Sequences the status driver, the address resolver and the command runner
//! into the create, read, update and delete operations. Creation stages that
//! run after the remote create succeeded are compensated by deleting the
//! container again.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tracing::{debug, error, info, warn};

use crate::config::{DeletionPolicy, LifecycleConfig};
use crate::error::{
    DeletionError, GatewayError, Interrupted, LifecycleError, Presence, ResolutionError, Stage,
    StageError,
};
use crate::exec::CommandRunner;
use crate::gateway::{ContainerGateway, GatewayResult};
use crate::network::AddressResolver;
use crate::retry::{Deadline, WaitPolicy};
use crate::state::{ContainerKind, ContainerRecord, NoopRecorder, StateRecorder};
use crate::status::StatusDriver;
use crate::types::{
    CloneRequest, CloneSpec, ContainerIdentity, ContainerSpec, NetworkSpec, ObservedStatus,
    Status,
};

pub const STEP_SETTLE: &str = "settle delay";
pub const STEP_STOP: &str = "stop confirmation";
pub const STEP_DELETE: &str = "delete";
pub const STEP_RELEASE: &str = "release confirmation";

/// A container that was created and brought to its desired status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Created {
    pub identity: ContainerIdentity,
    /// Networks with their observed addresses. Empty unless running.
    pub networks: Vec<NetworkSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadOutcome {
    pub status: ObservedStatus,
    pub networks: Vec<NetworkSpec>,
    /// Address resolution is best effort on read.
    #[serde(serialize_with = "display_opt")]
    pub resolution_error: Option<ResolutionError>,
}

fn display_opt<S: Serializer, E: std::fmt::Display>(
    value: &Option<E>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

type StageResult<T> = Result<T, (Stage, StageError)>;

fn at<E: Into<StageError>>(stage: Stage) -> impl FnOnce(E) -> (Stage, StageError) {
    move |e| (stage, e.into())
}

pub struct Lifecycle {
    gateway: Arc<dyn ContainerGateway>,
    recorder: Arc<dyn StateRecorder>,
    status: StatusDriver,
    runner: CommandRunner,
    resolver: AddressResolver,
    deletion: DeletionPolicy,
}

impl Lifecycle {
    pub fn new(gateway: Arc<dyn ContainerGateway>, config: LifecycleConfig) -> Self {
        Self {
            status: StatusDriver::new(gateway.clone(), config.status),
            runner: CommandRunner::new(gateway.clone(), config.exec),
            resolver: AddressResolver::new(gateway.clone(), config.network),
            deletion: config.deletion,
            recorder: Arc::new(NoopRecorder),
            gateway,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn StateRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn status_driver(&self) -> &StatusDriver {
        &self.status
    }

    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Allocate, create and converge a container.
    ///
    /// Any failure after the remote create triggers a compensating deletion.
    pub async fn create_container(
        &self,
        spec: &ContainerSpec,
        deadline: &Deadline,
    ) -> Result<Created, LifecycleError> {
        validate_spec(spec)?;
        let identity = self.allocate(&spec.node, spec.id).await?;
        info!(node = %identity.node, vmid = identity.id, "Creating container");

        self.gateway
            .create(identity.id, spec)
            .await
            .map_err(|e| LifecycleError::stage(Stage::Create, &identity, Presence::Absent, e))?;
        self.record(ContainerRecord::new(identity.clone(), ContainerKind::Container))
            .await;

        match self.provision(&identity, spec, deadline).await {
            Ok(networks) => {
                let mut record = ContainerRecord::new(identity.clone(), ContainerKind::Container);
                record.status = Some(spec.status);
                record.networks = networks.clone();
                self.record(record).await;
                info!(node = %identity.node, vmid = identity.id, status = %spec.status, "Container created");
                Ok(Created { identity, networks })
            }
            Err((stage, cause)) => Err(self.compensate(stage, &identity, cause, deadline).await),
        }
    }

    /// Create a container, run its commands and convert it into a template.
    pub async fn create_template(
        &self,
        spec: &ContainerSpec,
        deadline: &Deadline,
    ) -> Result<Created, LifecycleError> {
        validate_spec(spec)?;
        let identity = self.allocate(&spec.node, spec.id).await?;
        info!(node = %identity.node, vmid = identity.id, "Creating template");

        self.gateway
            .create(identity.id, spec)
            .await
            .map_err(|e| LifecycleError::stage(Stage::Create, &identity, Presence::Absent, e))?;
        self.record(ContainerRecord::new(identity.clone(), ContainerKind::Template))
            .await;

        if !spec.commands.is_empty()
            && let Err((stage, cause)) = self.prepare_template(&identity, spec, deadline).await
        {
            return Err(self.compensate(stage, &identity, cause, deadline).await);
        }

        self.gateway
            .convert_to_template(&identity)
            .await
            .map_err(|e| {
                LifecycleError::stage(Stage::ConvertTemplate, &identity, Presence::Present, e)
            })?;

        let mut record = ContainerRecord::new(identity.clone(), ContainerKind::Template);
        record.status = Some(Status::Stopped);
        self.record(record).await;
        info!(node = %identity.node, vmid = identity.id, "Template created");
        Ok(Created {
            identity,
            networks: Vec::new(),
        })
    }

    /// Linked clone of a template, converged to `spec.status`.
    pub async fn clone_container(
        &self,
        spec: &CloneSpec,
        deadline: &Deadline,
    ) -> Result<Created, LifecycleError> {
        if spec.node.trim().is_empty() {
            return Err(LifecycleError::Invalid("clone requires a node".into()));
        }
        if spec.source_id == 0 {
            return Err(LifecycleError::Invalid("clone requires a source id".into()));
        }

        let identity = self.allocate(&spec.node, spec.target_id).await?;
        info!(node = %identity.node, vmid = identity.id, source = spec.source_id, "Cloning container");

        let request = CloneRequest {
            node: spec.node.clone(),
            source_id: spec.source_id,
            target_id: identity.id,
            hostname: spec.hostname.clone(),
            description: spec.description.clone(),
            pool: spec.pool.clone(),
            snapshot: spec.snapshot.clone(),
            bandwidth_limit: spec.bandwidth_limit,
        };
        self.gateway
            .clone_container(&request)
            .await
            .map_err(|e| LifecycleError::stage(Stage::Clone, &identity, Presence::Absent, e))?;
        self.record(ContainerRecord::new(identity.clone(), ContainerKind::Clone))
            .await;

        let converged = self
            .status
            .converge(&identity, spec.status, deadline)
            .await
            .map_err(at(Stage::Converge));
        if let Err((stage, cause)) = converged {
            return Err(self.compensate(stage, &identity, cause, deadline).await);
        }

        let networks = if spec.status == Status::Running {
            self.discover_networks(&identity, deadline).await?
        } else {
            Vec::new()
        };

        let mut record = ContainerRecord::new(identity.clone(), ContainerKind::Clone);
        record.status = Some(spec.status);
        record.networks = networks.clone();
        self.record(record).await;
        Ok(Created { identity, networks })
    }

    async fn allocate(
        &self,
        node: &str,
        requested: Option<u32>,
    ) -> Result<ContainerIdentity, LifecycleError> {
        if let Some(id) = requested {
            return Ok(ContainerIdentity::new(node, id));
        }
        let id = self
            .gateway
            .allocate_id()
            .await
            .map_err(|e| LifecycleError::Stage {
                stage: Stage::AllocateId,
                identity: None,
                presence: Presence::Absent,
                source: e.into(),
            })?;
        debug!(node, vmid = id, "Allocated container id");
        Ok(ContainerIdentity::new(node, id))
    }

    /// Converge, resolve networks and run commands on a fresh container.
    async fn provision(
        &self,
        identity: &ContainerIdentity,
        spec: &ContainerSpec,
        deadline: &Deadline,
    ) -> StageResult<Vec<NetworkSpec>> {
        self.status
            .converge(identity, spec.status, deadline)
            .await
            .map_err(at(Stage::Converge))?;

        let mut networks = Vec::new();
        if spec.status == Status::Running {
            networks = self
                .resolver
                .resolve(identity, &spec.networks, deadline)
                .await
                .map_err(at(Stage::ResolveNetworks))?;
            let mut record = ContainerRecord::new(identity.clone(), ContainerKind::Container);
            record.networks = networks.clone();
            self.record(record).await;
        }

        if !spec.commands.is_empty() {
            self.run_then_converge(identity, &spec.commands, spec.status, deadline)
                .await?;
        }
        Ok(networks)
    }

    async fn prepare_template(
        &self,
        identity: &ContainerIdentity,
        spec: &ContainerSpec,
        deadline: &Deadline,
    ) -> StageResult<()> {
        self.run_then_converge(identity, &spec.commands, Status::Stopped, deadline)
            .await
    }

    async fn run_then_converge(
        &self,
        identity: &ContainerIdentity,
        commands: &[String],
        then: Status,
        deadline: &Deadline,
    ) -> StageResult<()> {
        self.status
            .converge(identity, Status::Running, deadline)
            .await
            .map_err(at(Stage::Converge))?;
        self.runner
            .run(identity, commands, deadline)
            .await
            .map_err(at(Stage::RunCommands))?;
        self.status
            .converge(identity, then, deadline)
            .await
            .map_err(at(Stage::Converge))
    }

    async fn compensate(
        &self,
        stage: Stage,
        identity: &ContainerIdentity,
        cause: StageError,
        deadline: &Deadline,
    ) -> LifecycleError {
        error!(
            node = %identity.node,
            vmid = identity.id,
            %stage,
            error = %cause,
            "Creation failed, deleting container"
        );
        // An expired deadline must not skip the rollback; cancellation still does.
        let detached = Deadline::none().with_token(deadline.token().clone());
        match self.delete(identity, &detached).await {
            Ok(()) => {
                self.mark_absent(identity).await;
                LifecycleError::stage(stage, identity, Presence::Absent, cause)
            }
            Err(rollback) => {
                error!(
                    node = %identity.node,
                    vmid = identity.id,
                    error = %rollback,
                    "Rollback failed, container left behind"
                );
                LifecycleError::Compensation {
                    stage,
                    identity: identity.clone(),
                    cause,
                    rollback,
                }
            }
        }
    }

    // =========================================================================
    // Read and update
    // =========================================================================

    /// Observed status plus, when `desired` is running, the addresses of
    /// `networks`.
    pub async fn read_container(
        &self,
        identity: &ContainerIdentity,
        desired: Status,
        networks: &[NetworkSpec],
        deadline: &Deadline,
    ) -> Result<ReadOutcome, LifecycleError> {
        let status = match self.gateway.status(identity).await {
            Ok(status) => status,
            Err(GatewayError::NotFound(_)) => {
                warn!(node = %identity.node, vmid = identity.id, "Container not found");
                self.mark_absent(identity).await;
                return Err(LifecycleError::Missing(identity.clone()));
            }
            Err(e) => {
                return Err(LifecycleError::stage(
                    Stage::Read,
                    identity,
                    Presence::Unknown,
                    e,
                ));
            }
        };

        let mut outcome = ReadOutcome {
            status,
            networks: Vec::new(),
            resolution_error: None,
        };
        if desired == Status::Running {
            match self.resolver.resolve(identity, networks, deadline).await {
                Ok(resolved) => outcome.networks = resolved,
                Err(e) => {
                    warn!(node = %identity.node, vmid = identity.id, error = %e, "Unable to resolve addresses");
                    outcome.resolution_error = Some(e);
                }
            }
        }
        Ok(outcome)
    }

    pub async fn update_status(
        &self,
        identity: &ContainerIdentity,
        desired: Status,
        deadline: &Deadline,
    ) -> Result<(), LifecycleError> {
        self.status
            .converge(identity, desired, deadline)
            .await
            .map_err(|e| LifecycleError::stage(Stage::Converge, identity, Presence::Present, e))
    }

    /// Observed interfaces of a clone, whose networks are not configured locally.
    pub async fn discover_networks(
        &self,
        identity: &ContainerIdentity,
        deadline: &Deadline,
    ) -> Result<Vec<NetworkSpec>, LifecycleError> {
        self.resolver
            .discover(identity, deadline)
            .await
            .map_err(|e| {
                LifecycleError::stage(Stage::ResolveNetworks, identity, Presence::Present, e)
            })
    }

    /// Replace the network configuration. The container is stopped for the
    /// change and brought back to `desired` afterwards.
    pub async fn update_networks(
        &self,
        identity: &ContainerIdentity,
        networks: &[NetworkSpec],
        desired: Status,
        deadline: &Deadline,
    ) -> Result<Vec<NetworkSpec>, LifecycleError> {
        validate_networks(networks)?;
        let fail =
            |(stage, e): (Stage, StageError)| LifecycleError::stage(stage, identity, Presence::Present, e);

        self.status
            .converge(identity, Status::Stopped, deadline)
            .await
            .map_err(at(Stage::Converge))
            .map_err(fail)?;
        self.gateway
            .update_networks(identity, networks)
            .await
            .map_err(at(Stage::UpdateNetworks))
            .map_err(fail)?;
        info!(node = %identity.node, vmid = identity.id, count = networks.len(), "Networks updated");
        self.status
            .converge(identity, desired, deadline)
            .await
            .map_err(at(Stage::Converge))
            .map_err(fail)?;

        if desired != Status::Running {
            return Ok(Vec::new());
        }
        let resolved = self
            .resolver
            .resolve(identity, networks, deadline)
            .await
            .map_err(at(Stage::ResolveNetworks))
            .map_err(fail)?;

        let mut record = ContainerRecord::new(identity.clone(), ContainerKind::Container);
        record.status = Some(desired);
        record.networks = resolved.clone();
        self.record(record).await;
        Ok(resolved)
    }

    pub async fn run_commands(
        &self,
        identity: &ContainerIdentity,
        commands: &[String],
        deadline: &Deadline,
    ) -> Result<(), LifecycleError> {
        self.runner
            .run(identity, commands, deadline)
            .await
            .map_err(|e| LifecycleError::stage(Stage::RunCommands, identity, Presence::Present, e))
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    pub async fn delete_container(
        &self,
        identity: &ContainerIdentity,
        deadline: &Deadline,
    ) -> Result<(), LifecycleError> {
        match self.delete(identity, deadline).await {
            Ok(()) => {
                self.mark_absent(identity).await;
                Ok(())
            }
            Err(e) => Err(LifecycleError::stage(Stage::Delete, identity, e.presence(), e)),
        }
    }

    /// Stop, confirm, delete and wait until the id is released.
    pub async fn delete(
        &self,
        identity: &ContainerIdentity,
        deadline: &Deadline,
    ) -> Result<(), DeletionError> {
        info!(node = %identity.node, vmid = identity.id, "Deleting container");
        deadline
            .sleep(self.deletion.settle())
            .await
            .map_err(|reason| DeletionError::Interrupted {
                identity: identity.clone(),
                step: STEP_SETTLE,
                reason,
            })?;

        self.status
            .converge(identity, Status::Stopped, deadline)
            .await?;

        self.wait_until(identity, STEP_STOP, &self.deletion.confirm_stopped, deadline, || async {
            let status = self.gateway.status(identity).await?;
            Ok::<_, GatewayError>(status.is(Status::Stopped))
        })
        .await?;

        self.gateway
            .delete(identity, &self.deletion.options)
            .await
            .map_err(|source| DeletionError::Gateway {
                identity: identity.clone(),
                step: STEP_DELETE,
                source,
            })?;

        self.wait_until(identity, STEP_RELEASE, &self.deletion.confirm_freed, deadline, || {
            self.gateway.is_id_available(identity.id)
        })
        .await?;

        info!(node = %identity.node, vmid = identity.id, "Container deleted");
        Ok(())
    }

    /// Poll `probe` until it reports true, bounded by `policy` and `deadline`.
    /// A gateway error aborts the wait.
    async fn wait_until<F, Fut>(
        &self,
        identity: &ContainerIdentity,
        step: &'static str,
        policy: &WaitPolicy,
        deadline: &Deadline,
        mut probe: F,
    ) -> Result<(), DeletionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<bool>>,
    {
        let bounded = deadline.narrowed(policy.timeout());
        let mut polls = 0u32;
        loop {
            polls += 1;
            if let Err(reason) = bounded.sleep(policy.interval.delay(polls)).await {
                return Err(match (reason, deadline.check(), policy.timeout()) {
                    (Interrupted::DeadlineExceeded, Ok(()), Some(waited)) => DeletionError::Timeout {
                        identity: identity.clone(),
                        step,
                        waited,
                    },
                    _ => DeletionError::Interrupted {
                        identity: identity.clone(),
                        step,
                        reason,
                    },
                });
            }

            match probe().await {
                Ok(true) => {
                    debug!(node = %identity.node, vmid = identity.id, step, polls, "Confirmed");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(node = %identity.node, vmid = identity.id, step, polls, "Not confirmed yet");
                }
                Err(source) => {
                    return Err(DeletionError::Gateway {
                        identity: identity.clone(),
                        step,
                        source,
                    });
                }
            }
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    async fn record(&self, record: ContainerRecord) {
        if let Err(e) = self.recorder.record(&record).await {
            error!(
                node = %record.identity.node,
                vmid = record.identity.id,
                error = %e,
                "Unable to record container state"
            );
        }
    }

    async fn mark_absent(&self, identity: &ContainerIdentity) {
        if let Err(e) = self.recorder.mark_absent(identity).await {
            error!(node = %identity.node, vmid = identity.id, error = %e, "Unable to record container removal");
        }
    }
}

fn validate_spec(spec: &ContainerSpec) -> Result<(), LifecycleError> {
    if spec.node.trim().is_empty() {
        return Err(LifecycleError::Invalid("container spec requires a node".into()));
    }
    if spec.template.trim().is_empty() {
        return Err(LifecycleError::Invalid(
            "container spec requires a template".into(),
        ));
    }
    validate_networks(&spec.networks)
}

fn validate_networks(networks: &[NetworkSpec]) -> Result<(), LifecycleError> {
    let mut seen = HashSet::new();
    for net in networks {
        if net.name.trim().is_empty() {
            return Err(LifecycleError::Invalid("network without a name".into()));
        }
        if !seen.insert(net.name.as_str()) {
            return Err(LifecycleError::Invalid(format!(
                "duplicate network name {}",
                net.name
            )));
        }
    }
    Ok(())
}
