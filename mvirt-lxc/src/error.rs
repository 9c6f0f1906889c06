//! Error types for mvirt-lxc.
//!
//! Each convergence loop has its own error type; the lifecycle orchestrator
//! wraps them with the stage and container they belong to so a caller can
//! tell whether a container was left behind.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ContainerIdentity, ObservedStatus, Status};

/// Errors returned by a [`crate::gateway::ContainerGateway`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Connection, timeout or body transfer failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The API answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The container does not exist on the node.
    #[error("not found: {0}")]
    NotFound(String),

    /// The response could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transport(_) => true,
            GatewayError::Api { status, .. } => *status >= 500 || *status == 429,
            GatewayError::NotFound(_) | GatewayError::Decode(_) => false,
        }
    }
}

/// Why a wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Status convergence failures.
#[derive(Debug, Clone, Error)]
pub enum ConvergenceError {
    /// Non-transient failure while reading the status.
    #[error("unable to read status of {identity}: {source}")]
    Query {
        identity: ContainerIdentity,
        source: GatewayError,
    },

    /// The shared retry budget ran out.
    #[error("unable to bring {identity} to {desired} after {attempts} failed attempts: {source}")]
    Exhausted {
        identity: ContainerIdentity,
        desired: Status,
        attempts: u32,
        source: GatewayError,
    },

    /// The container never reached the desired status within the poll limit.
    #[error("{identity} still {observed} after {polls} polls, wanted {desired}")]
    Stalled {
        identity: ContainerIdentity,
        desired: Status,
        observed: ObservedStatus,
        polls: u32,
    },

    #[error("status convergence of {identity} interrupted: {reason}")]
    Interrupted {
        identity: ContainerIdentity,
        reason: Interrupted,
    },
}

/// Last failure seen while polling an execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultFailure {
    Fetch(GatewayError),
    Remote(String),
}

impl fmt::Display for ResultFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultFailure::Fetch(e) => write!(f, "unable to fetch result: {e}"),
            ResultFailure::Remote(msg) => write!(f, "execution failed: {msg}"),
        }
    }
}

/// Command execution failures.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("unable to submit command #{index} `{command}` to {identity} after {attempts} attempts: {source}")]
    Submit {
        identity: ContainerIdentity,
        index: usize,
        command: String,
        attempts: u32,
        source: GatewayError,
    },

    #[error("command #{index} `{command}` on {identity} exited with code {exit_code}: {output}")]
    NonZeroExit {
        identity: ContainerIdentity,
        index: usize,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("command #{index} `{command}` on {identity} gave no result after {attempts} attempts: {last}")]
    Exhausted {
        identity: ContainerIdentity,
        index: usize,
        command: String,
        attempts: u32,
        last: ResultFailure,
    },

    #[error("command #{index} `{command}` on {identity} still running after {polls} polls")]
    StillRunning {
        identity: ContainerIdentity,
        index: usize,
        command: String,
        polls: u32,
    },

    #[error("command #{index} `{command}` on {identity} interrupted: {reason}")]
    Interrupted {
        identity: ContainerIdentity,
        index: usize,
        command: String,
        reason: Interrupted,
    },
}

impl ExecutionError {
    /// Position of the failing command in the submitted list.
    pub fn index(&self) -> usize {
        match self {
            ExecutionError::Submit { index, .. }
            | ExecutionError::NonZeroExit { index, .. }
            | ExecutionError::Exhausted { index, .. }
            | ExecutionError::StillRunning { index, .. }
            | ExecutionError::Interrupted { index, .. } => *index,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            ExecutionError::Submit { command, .. }
            | ExecutionError::NonZeroExit { command, .. }
            | ExecutionError::Exhausted { command, .. }
            | ExecutionError::StillRunning { command, .. }
            | ExecutionError::Interrupted { command, .. } => command,
        }
    }
}

/// Network address resolution failures.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error(
        "unable to compute addresses of all interfaces of {identity} after {attempts} attempts (missing: {}){}",
        .missing.join(", "),
        .last_error.as_ref().map(|e| format!(", last error: {e}")).unwrap_or_default()
    )]
    Unresolved {
        identity: ContainerIdentity,
        attempts: u32,
        missing: Vec<String>,
        last_error: Option<GatewayError>,
    },

    #[error("address resolution of {identity} interrupted: {reason}")]
    Interrupted {
        identity: ContainerIdentity,
        reason: Interrupted,
    },
}

/// Deletion pipeline failures.
#[derive(Debug, Clone, Error)]
pub enum DeletionError {
    #[error(transparent)]
    Converge(#[from] ConvergenceError),

    #[error("{step} failed for {identity}: {source}")]
    Gateway {
        identity: ContainerIdentity,
        step: &'static str,
        source: GatewayError,
    },

    #[error("{step} for {identity} not confirmed after {waited:?}")]
    Timeout {
        identity: ContainerIdentity,
        step: &'static str,
        waited: Duration,
    },

    #[error("deletion of {identity} interrupted during {step}: {reason}")]
    Interrupted {
        identity: ContainerIdentity,
        step: &'static str,
        reason: Interrupted,
    },
}

impl DeletionError {
    /// Whether the remote delete call may already have been accepted.
    ///
    /// A transient failure of the delete call itself leaves that open.
    pub fn may_have_deleted(&self) -> bool {
        use crate::lifecycle::{STEP_DELETE, STEP_RELEASE};
        match self {
            DeletionError::Converge(_) => false,
            DeletionError::Gateway { step, source, .. } => {
                *step == STEP_RELEASE || (*step == STEP_DELETE && source.is_transient())
            }
            DeletionError::Timeout { step, .. } | DeletionError::Interrupted { step, .. } => {
                *step == STEP_RELEASE
            }
        }
    }

    /// Presence of the container after this failure.
    pub fn presence(&self) -> Presence {
        if self.may_have_deleted() {
            Presence::Unknown
        } else {
            Presence::Present
        }
    }
}

/// Pipeline stages reported in [`LifecycleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AllocateId,
    Create,
    Clone,
    Converge,
    ResolveNetworks,
    RunCommands,
    UpdateNetworks,
    ConvertTemplate,
    Read,
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::AllocateId => "id allocation",
            Stage::Create => "create",
            Stage::Clone => "clone",
            Stage::Converge => "status convergence",
            Stage::ResolveNetworks => "network resolution",
            Stage::RunCommands => "command execution",
            Stage::UpdateNetworks => "network update",
            Stage::ConvertTemplate => "template conversion",
            Stage::Read => "read",
            Stage::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Whether a container may still exist after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    Unknown,
}

/// Component error carried by [`LifecycleError::Stage`].
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Convergence(#[from] ConvergenceError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Deletion(#[from] DeletionError),
}

fn describe(identity: &Option<ContainerIdentity>) -> String {
    match identity {
        Some(identity) => identity.to_string(),
        None => "unallocated container".to_string(),
    }
}

/// Errors returned by [`crate::lifecycle::Lifecycle`].
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("{stage} failed for {}: {source}", describe(.identity))]
    Stage {
        stage: Stage,
        identity: Option<ContainerIdentity>,
        presence: Presence,
        source: StageError,
    },

    /// A creation stage failed and so did the compensating deletion.
    #[error("{stage} failed for {identity}: {cause}; rollback failed: {rollback}")]
    Compensation {
        stage: Stage,
        identity: ContainerIdentity,
        cause: StageError,
        rollback: DeletionError,
    },

    #[error("container {0} not found, it may have been deleted")]
    Missing(ContainerIdentity),

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl LifecycleError {
    pub(crate) fn stage(
        stage: Stage,
        identity: &ContainerIdentity,
        presence: Presence,
        source: impl Into<StageError>,
    ) -> Self {
        LifecycleError::Stage {
            stage,
            identity: Some(identity.clone()),
            presence,
            source: source.into(),
        }
    }

    /// Whether the container may still exist on the cluster.
    pub fn presence(&self) -> Presence {
        match self {
            LifecycleError::Stage { presence, .. } => *presence,
            LifecycleError::Compensation { rollback, .. } => rollback.presence(),
            LifecycleError::Missing(_) => Presence::Absent,
            LifecycleError::Invalid(_) => Presence::Unknown,
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            LifecycleError::Stage { stage, .. } | LifecycleError::Compensation { stage, .. } => {
                Some(*stage)
            }
            LifecycleError::Missing(_) => Some(Stage::Read),
            LifecycleError::Invalid(_) => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// State file errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
}
