//! Domain types shared by the convergence loops and the gateway.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Location of one container on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub node: String,
    pub id: u32,
}

impl ContainerIdentity {
    pub fn new(node: impl Into<String>, id: u32) -> Self {
        Self {
            node: node.into(),
            id,
        }
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.id)
    }
}

/// Desired lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Stopped,
    Running,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Running => "running",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired status value outside of `stopped | running`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported status value: {0}")]
pub struct UnsupportedStatus(pub String);

impl FromStr for Status {
    type Err = UnsupportedStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Status::Stopped),
            "running" => Ok(Status::Running),
            other => Err(UnsupportedStatus(other.to_string())),
        }
    }
}

/// Status as reported by the cluster. Anything besides `stopped` and
/// `running` is a transient state that has not converged yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObservedStatus {
    Stopped,
    Running,
    Other(String),
}

impl ObservedStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ObservedStatus::Stopped => "stopped",
            ObservedStatus::Running => "running",
            ObservedStatus::Other(s) => s,
        }
    }

    pub fn is(&self, status: Status) -> bool {
        matches!(
            (self, status),
            (ObservedStatus::Stopped, Status::Stopped) | (ObservedStatus::Running, Status::Running)
        )
    }
}

impl From<&str> for ObservedStatus {
    fn from(s: &str) -> Self {
        match s {
            "stopped" => ObservedStatus::Stopped,
            "running" => ObservedStatus::Running,
            other => ObservedStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for ObservedStatus {
    fn from(s: String) -> Self {
        ObservedStatus::from(s.as_str())
    }
}

impl From<ObservedStatus> for String {
    fn from(s: ObservedStatus) -> Self {
        s.as_str().to_string()
    }
}

impl From<Status> for ObservedStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Stopped => ObservedStatus::Stopped,
            Status::Running => ObservedStatus::Running,
        }
    }
}

impl fmt::Display for ObservedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional container features.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub force_rw_sys: Option<bool>,
    pub fuse: Option<bool>,
    pub key_ctl: Option<bool>,
    pub nesting: Option<bool>,
}

impl Features {
    pub fn is_empty(&self) -> bool {
        self.force_rw_sys.is_none()
            && self.fuse.is_none()
            && self.key_ctl.is_none()
            && self.nesting.is_none()
    }
}

/// Root filesystem descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootFs {
    pub volume: String,
    pub acl: Option<bool>,
    pub quota: Option<bool>,
    pub replicate: Option<bool>,
    pub read_only: Option<bool>,
    pub shared: Option<bool>,
    /// Size in GiB.
    pub disk_size: Option<u64>,
}

/// One configured network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Interface key, unique within one container.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_down: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u32>,
    /// Address observed on the running container. Only set by the resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_address: Option<String>,
}

impl NetworkSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Desired configuration of a container at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub node: String,
    /// Allocated from the cluster when absent.
    #[serde(default)]
    pub id: Option<u32>,
    pub template: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
    #[serde(default)]
    pub nameserver: Option<String>,
    #[serde(default)]
    pub on_boot: Option<bool>,
    #[serde(default)]
    pub unprivileged: Option<bool>,
    #[serde(default)]
    pub features: Features,
    #[serde(default)]
    pub root_fs: Option<RootFs>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub commands: Vec<String>,
    pub status: Status,
}

impl ContainerSpec {
    /// SSH keys in the newline separated form the cluster expects.
    pub fn ssh_public_keys_joined(&self) -> Option<String> {
        if self.ssh_public_keys.is_empty() {
            return None;
        }
        Some(self.ssh_public_keys.join("\n"))
    }
}

/// Linked clone of an existing template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub node: String,
    pub source_id: u32,
    #[serde(default)]
    pub target_id: Option<u32>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
    /// KiB/s.
    #[serde(default)]
    pub bandwidth_limit: Option<u64>,
    pub status: Status,
}

/// Fully resolved clone request sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub node: String,
    pub source_id: u32,
    pub target_id: u32,
    pub hostname: Option<String>,
    pub description: Option<String>,
    pub pool: Option<String>,
    pub snapshot: Option<String>,
    pub bandwidth_limit: Option<u64>,
}

/// Options for the remote delete call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteOptions {
    pub purge: bool,
    pub force: bool,
    pub destroy_unreferenced_disks: bool,
}

/// Interface as observed on a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub hwaddr: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
}

/// Lifecycle of one asynchronously executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionState {
    Running,
    Succeeded,
    Failed,
}

/// Transient record of one command execution, owned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub status: ExecutionState,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
