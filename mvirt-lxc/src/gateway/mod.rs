//! Boundary to the remote virtualization cluster.
//!
//! The convergence loops only talk to the cluster through
//! [`ContainerGateway`]. [`pve::PveClient`] implements it against the
//! Proxmox VE REST API; tests substitute a scripted in-memory gateway.

pub mod pve;

pub use pve::PveClient;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{
    CloneRequest, ContainerIdentity, ContainerSpec, DeleteOptions, ExecutionRecord, Interface,
    NetworkSpec, ObservedStatus,
};

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Operations the lifecycle engine needs from the cluster.
///
/// Every call may fail transiently. Calls acknowledge a request; the remote
/// side may keep working on it asynchronously.
#[async_trait]
pub trait ContainerGateway: Send + Sync {
    /// Create a container. `id` has already been allocated.
    async fn create(&self, id: u32, spec: &ContainerSpec) -> GatewayResult<()>;

    async fn delete(&self, identity: &ContainerIdentity, options: &DeleteOptions)
    -> GatewayResult<()>;

    async fn status(&self, identity: &ContainerIdentity) -> GatewayResult<ObservedStatus>;

    async fn interfaces(&self, identity: &ContainerIdentity) -> GatewayResult<Vec<Interface>>;

    async fn start(&self, identity: &ContainerIdentity) -> GatewayResult<()>;

    async fn stop(&self, identity: &ContainerIdentity, overrule_shutdown: bool)
    -> GatewayResult<()>;

    /// Submit `command` for asynchronous execution, returning its execution id.
    async fn exec_async(
        &self,
        identity: &ContainerIdentity,
        shell: &str,
        command: &str,
    ) -> GatewayResult<String>;

    async fn execution_result(&self, execution_id: &str) -> GatewayResult<ExecutionRecord>;

    /// Next free container id on the cluster.
    async fn allocate_id(&self) -> GatewayResult<u32>;

    async fn is_id_available(&self, id: u32) -> GatewayResult<bool>;

    /// Replace the network configuration of a stopped container.
    async fn update_networks(
        &self,
        identity: &ContainerIdentity,
        networks: &[NetworkSpec],
    ) -> GatewayResult<()>;

    async fn convert_to_template(&self, identity: &ContainerIdentity) -> GatewayResult<()>;

    async fn clone_container(&self, request: &CloneRequest) -> GatewayResult<()>;
}
