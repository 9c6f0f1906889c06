//! mvirt-lxc - Lifecycle convergence for Proxmox VE LXC containers.
//!
//! Drives a remote, asynchronously reconciled container from its observed
//! state to a desired one, tolerating slow transitions, transient API
//! failures and partially completed pipelines.
//!
//! ## Components
//!
//! - **Status driver** ([`status`]): converges `stopped` / `running`
//! - **Command runner** ([`exec`]): ordered in-container commands
//! - **Address resolver** ([`network`]): waits for interface addresses
//! - **Lifecycle** ([`lifecycle`]): create / read / update / delete with
//!   compensating deletion on failure
//!
//! All of them reach the cluster through [`gateway::ContainerGateway`] and
//! sleep through a [`retry::Deadline`] that can be cancelled.

pub mod config;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod lifecycle;
pub mod network;
pub mod retry;
pub mod state;
pub mod status;
pub mod types;

pub use config::{GatewayConfig, LifecycleConfig};
pub use error::{GatewayError, LifecycleError, Presence, Stage};
pub use gateway::{ContainerGateway, PveClient};
pub use lifecycle::{Created, Lifecycle, ReadOutcome};
pub use retry::Deadline;
pub use types::{CloneSpec, ContainerIdentity, ContainerSpec, NetworkSpec, Status};
