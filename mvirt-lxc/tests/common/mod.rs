//! Shared test utilities for mvirt-lxc integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mvirt_lxc::config::LifecycleConfig;
use mvirt_lxc::error::GatewayError;
use mvirt_lxc::gateway::{ContainerGateway, GatewayResult};
use mvirt_lxc::types::{
    CloneRequest, ContainerIdentity, ContainerSpec, DeleteOptions, ExecutionRecord,
    ExecutionState, Features, Interface, NetworkSpec, ObservedStatus, Status,
};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(u32),
    Delete(u32),
    Status(u32),
    Interfaces(u32),
    Start(u32),
    Stop(u32),
    ExecAsync(String),
    ExecutionResult(String),
    AllocateId,
    IsIdAvailable(u32),
    UpdateNetworks(u32, usize),
    ConvertToTemplate(u32),
    Clone { source: u32, target: u32 },
}

/// Scripted in-memory gateway.
///
/// Each method pops its next scripted answer; once the script is empty it
/// falls back to simulating a single container: start and stop flip the
/// observed status, delete releases the id.
pub struct MockGateway {
    inner: Mutex<Inner>,
}

struct Inner {
    calls: Vec<Call>,
    state: ObservedStatus,
    deleted: bool,
    next_exec: u32,

    allocate: VecDeque<GatewayResult<u32>>,
    create: VecDeque<GatewayResult<()>>,
    delete: VecDeque<GatewayResult<()>>,
    statuses: VecDeque<GatewayResult<ObservedStatus>>,
    status_fallback: Option<GatewayResult<ObservedStatus>>,
    interfaces: VecDeque<GatewayResult<Vec<Interface>>>,
    interfaces_fallback: GatewayResult<Vec<Interface>>,
    start: VecDeque<GatewayResult<()>>,
    start_fallback: Option<GatewayResult<()>>,
    stop: VecDeque<GatewayResult<()>>,
    submits: VecDeque<GatewayResult<String>>,
    results: VecDeque<GatewayResult<ExecutionRecord>>,
    results_fallback: Option<GatewayResult<ExecutionRecord>>,
    id_available: VecDeque<GatewayResult<bool>>,
    id_available_fallback: Option<GatewayResult<bool>>,
    update_networks: VecDeque<GatewayResult<()>>,
    template: VecDeque<GatewayResult<()>>,
    clone: VecDeque<GatewayResult<()>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_state(ObservedStatus::Stopped)
    }

    pub fn with_state(state: ObservedStatus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                calls: Vec::new(),
                state,
                deleted: false,
                next_exec: 0,
                allocate: VecDeque::new(),
                create: VecDeque::new(),
                delete: VecDeque::new(),
                statuses: VecDeque::new(),
                status_fallback: None,
                interfaces: VecDeque::new(),
                interfaces_fallback: Ok(Vec::new()),
                start: VecDeque::new(),
                start_fallback: None,
                stop: VecDeque::new(),
                submits: VecDeque::new(),
                results: VecDeque::new(),
                results_fallback: None,
                id_available: VecDeque::new(),
                id_available_fallback: None,
                update_networks: VecDeque::new(),
                template: VecDeque::new(),
                clone: VecDeque::new(),
            }),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    // ---- scripting ----

    pub fn push_allocate(&self, result: GatewayResult<u32>) {
        self.inner().allocate.push_back(result);
    }

    pub fn push_create(&self, result: GatewayResult<()>) {
        self.inner().create.push_back(result);
    }

    pub fn push_delete(&self, result: GatewayResult<()>) {
        self.inner().delete.push_back(result);
    }

    pub fn push_status(&self, result: GatewayResult<ObservedStatus>) {
        self.inner().statuses.push_back(result);
    }

    pub fn push_statuses(&self, statuses: &[&str]) {
        for s in statuses {
            self.push_status(Ok(ObservedStatus::from(*s)));
        }
    }

    /// Answer every unscripted status read with `result`.
    pub fn always_status(&self, result: GatewayResult<ObservedStatus>) {
        self.inner().status_fallback = Some(result);
    }

    pub fn push_interfaces(&self, result: GatewayResult<Vec<Interface>>) {
        self.inner().interfaces.push_back(result);
    }

    pub fn always_interfaces(&self, result: GatewayResult<Vec<Interface>>) {
        self.inner().interfaces_fallback = result;
    }

    pub fn push_start(&self, result: GatewayResult<()>) {
        self.inner().start.push_back(result);
    }

    pub fn always_start(&self, result: GatewayResult<()>) {
        self.inner().start_fallback = Some(result);
    }

    pub fn push_stop(&self, result: GatewayResult<()>) {
        self.inner().stop.push_back(result);
    }

    pub fn push_submit(&self, result: GatewayResult<String>) {
        self.inner().submits.push_back(result);
    }

    pub fn push_result(&self, result: GatewayResult<ExecutionRecord>) {
        self.inner().results.push_back(result);
    }

    pub fn always_result(&self, result: GatewayResult<ExecutionRecord>) {
        self.inner().results_fallback = Some(result);
    }

    pub fn push_id_available(&self, result: GatewayResult<bool>) {
        self.inner().id_available.push_back(result);
    }

    pub fn always_id_available(&self, result: GatewayResult<bool>) {
        self.inner().id_available_fallback = Some(result);
    }

    pub fn push_update_networks(&self, result: GatewayResult<()>) {
        self.inner().update_networks.push_back(result);
    }

    pub fn push_template(&self, result: GatewayResult<()>) {
        self.inner().template.push_back(result);
    }

    // ---- inspection ----

    pub fn calls(&self) -> Vec<Call> {
        self.inner().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner().calls.iter().filter(|c| pred(c)).count()
    }

    /// Calls other than status and interface reads, in order.
    pub fn actions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Status(_) | Call::Interfaces(_)))
            .collect()
    }

    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.inner().calls.iter().position(pred)
    }

    fn log(&self, call: Call) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner();
        inner.calls.push(call);
        inner
    }
}

#[async_trait]
impl ContainerGateway for MockGateway {
    async fn create(&self, id: u32, _spec: &ContainerSpec) -> GatewayResult<()> {
        let mut inner = self.log(Call::Create(id));
        inner.create.pop_front().unwrap_or(Ok(()))
    }

    async fn delete(
        &self,
        identity: &ContainerIdentity,
        _options: &DeleteOptions,
    ) -> GatewayResult<()> {
        let mut inner = self.log(Call::Delete(identity.id));
        let result = inner.delete.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            inner.deleted = true;
        }
        result
    }

    async fn status(&self, identity: &ContainerIdentity) -> GatewayResult<ObservedStatus> {
        let mut inner = self.log(Call::Status(identity.id));
        if let Some(result) = inner.statuses.pop_front() {
            return result;
        }
        if let Some(result) = &inner.status_fallback {
            return result.clone();
        }
        Ok(inner.state.clone())
    }

    async fn interfaces(&self, identity: &ContainerIdentity) -> GatewayResult<Vec<Interface>> {
        let mut inner = self.log(Call::Interfaces(identity.id));
        inner
            .interfaces
            .pop_front()
            .unwrap_or_else(|| inner.interfaces_fallback.clone())
    }

    async fn start(&self, identity: &ContainerIdentity) -> GatewayResult<()> {
        let mut inner = self.log(Call::Start(identity.id));
        let result = match inner.start.pop_front() {
            Some(result) => result,
            None => inner.start_fallback.clone().unwrap_or(Ok(())),
        };
        if result.is_ok() {
            inner.state = ObservedStatus::Running;
        }
        result
    }

    async fn stop(
        &self,
        identity: &ContainerIdentity,
        _overrule_shutdown: bool,
    ) -> GatewayResult<()> {
        let mut inner = self.log(Call::Stop(identity.id));
        let result = inner.stop.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            inner.state = ObservedStatus::Stopped;
        }
        result
    }

    async fn exec_async(
        &self,
        _identity: &ContainerIdentity,
        _shell: &str,
        command: &str,
    ) -> GatewayResult<String> {
        let mut inner = self.log(Call::ExecAsync(command.to_string()));
        if let Some(result) = inner.submits.pop_front() {
            return result;
        }
        inner.next_exec += 1;
        Ok(format!("exec-{}", inner.next_exec))
    }

    async fn execution_result(&self, execution_id: &str) -> GatewayResult<ExecutionRecord> {
        let mut inner = self.log(Call::ExecutionResult(execution_id.to_string()));
        if let Some(result) = inner.results.pop_front() {
            return result;
        }
        match &inner.results_fallback {
            Some(result) => result.clone(),
            None => Ok(record(execution_id, ExecutionState::Succeeded, Some(0))),
        }
    }

    async fn allocate_id(&self) -> GatewayResult<u32> {
        let mut inner = self.log(Call::AllocateId);
        inner.allocate.pop_front().unwrap_or(Ok(105))
    }

    async fn is_id_available(&self, id: u32) -> GatewayResult<bool> {
        let mut inner = self.log(Call::IsIdAvailable(id));
        if let Some(result) = inner.id_available.pop_front() {
            return result;
        }
        if let Some(result) = &inner.id_available_fallback {
            return result.clone();
        }
        Ok(inner.deleted)
    }

    async fn update_networks(
        &self,
        identity: &ContainerIdentity,
        networks: &[NetworkSpec],
    ) -> GatewayResult<()> {
        let mut inner = self.log(Call::UpdateNetworks(identity.id, networks.len()));
        inner.update_networks.pop_front().unwrap_or(Ok(()))
    }

    async fn convert_to_template(&self, identity: &ContainerIdentity) -> GatewayResult<()> {
        let mut inner = self.log(Call::ConvertToTemplate(identity.id));
        inner.template.pop_front().unwrap_or(Ok(()))
    }

    async fn clone_container(&self, request: &CloneRequest) -> GatewayResult<()> {
        let mut inner = self.log(Call::Clone {
            source: request.source_id,
            target: request.target_id,
        });
        inner.clone.pop_front().unwrap_or(Ok(()))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Default cadence without jitter so elapsed virtual time is exact.
pub fn test_config() -> LifecycleConfig {
    LifecycleConfig::default().without_jitter()
}

pub fn identity() -> ContainerIdentity {
    ContainerIdentity::new("pve1", 105)
}

pub fn transport_error() -> GatewayError {
    GatewayError::Transport("connection reset by peer".into())
}

pub fn api_error(status: u16, message: &str) -> GatewayError {
    GatewayError::Api {
        status,
        message: message.into(),
    }
}

pub fn iface(name: &str, ipv4: &str) -> Interface {
    Interface {
        name: name.into(),
        hwaddr: String::new(),
        ipv4: ipv4.into(),
        ipv6: String::new(),
    }
}

pub fn networks(names: &[&str]) -> Vec<NetworkSpec> {
    names
        .iter()
        .map(|name| NetworkSpec {
            bridge: Some("vmbr0".into()),
            ip: Some("dhcp".into()),
            ..NetworkSpec::named(*name)
        })
        .collect()
}

pub fn record(execution_id: &str, status: ExecutionState, exit_code: Option<i32>) -> ExecutionRecord {
    ExecutionRecord {
        execution_id: execution_id.into(),
        status,
        exit_code,
        output: None,
        error: None,
    }
}

pub fn make_spec(status: Status, networks: Vec<NetworkSpec>, commands: &[&str]) -> ContainerSpec {
    ContainerSpec {
        node: "pve1".into(),
        id: None,
        template: "local:vztmpl/debian-12-standard_12.7-1_amd64.tar.zst".into(),
        hostname: Some("web-1".into()),
        password: None,
        ssh_public_keys: vec!["ssh-ed25519 AAAAC3Nza test@example".into()],
        nameserver: None,
        on_boot: Some(true),
        unprivileged: Some(true),
        features: Features {
            nesting: Some(true),
            ..Default::default()
        },
        root_fs: None,
        networks,
        commands: commands.iter().map(|c| c.to_string()).collect(),
        status,
    }
}
