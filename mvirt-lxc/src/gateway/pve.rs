//! Proxmox VE REST implementation of [`ContainerGateway`].

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ContainerGateway, GatewayResult};
use crate::config::GatewayConfig;
use crate::error::{ConfigError, GatewayError};
use crate::types::{
    CloneRequest, ContainerIdentity, ContainerSpec, DeleteOptions, ExecutionRecord,
    ExecutionState, Features, Interface, NetworkSpec, ObservedStatus, RootFs,
};

/// Every API answer is wrapped in `{"data": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct InterfaceBody {
    name: String,
    #[serde(default)]
    hwaddr: String,
    #[serde(default)]
    inet: Option<String>,
    #[serde(default)]
    inet6: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecSubmitBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExecResultBody {
    #[serde(default)]
    id: Option<String>,
    status: ExecutionState,
    #[serde(default, rename = "exitCode")]
    exit_code: Option<i32>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Accepts both the numeric and the string form PVE uses for ids.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VmId {
    Number(u32),
    Text(String),
}

pub struct PveClient {
    client: Client,
    api_base: String,
    exec_base: String,
}

impl PveClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&config.authorization())
            .map_err(|_| ConfigError::Invalid("API token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        if let Some(id) = &config.cf_client_id {
            let value = HeaderValue::from_str(id)
                .map_err(|_| ConfigError::Invalid("invalid Cloudflare client id".into()))?;
            headers.insert("CF-Access-Client-Id", value);
        }
        if let Some(secret) = &config.cf_client_secret {
            let mut value = HeaderValue::from_str(secret)
                .map_err(|_| ConfigError::Invalid("invalid Cloudflare client secret".into()))?;
            value.set_sensitive(true);
            headers.insert("CF-Access-Client-Secret", value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("unable to build HTTP client: {e}")))?;

        let origin = config.origin();
        let exec_path = config.exec_base_path.trim_end_matches('/');
        Ok(Self {
            client,
            api_base: format!("{origin}/api2/json"),
            exec_base: format!("{origin}{exec_path}"),
        })
    }

    fn api(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.api_base, path))
    }

    fn lxc_path(identity: &ContainerIdentity, suffix: &str) -> String {
        format!("/nodes/{}/lxc/{}{}", identity.node, identity.id, suffix)
    }

    async fn send(&self, request: RequestBuilder) -> GatewayResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_default()
            .trim()
            .to_string();
        if status == StatusCode::NOT_FOUND || message.contains("does not exist") {
            return Err(GatewayError::NotFound(message));
        }
        Err(GatewayError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> GatewayResult<T> {
        let response = self.send(request).await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(envelope.data)
    }

    async fn submit(&self, request: RequestBuilder) -> GatewayResult<()> {
        self.send(request).await.map(|_| ())
    }
}

#[async_trait]
impl ContainerGateway for PveClient {
    async fn create(&self, id: u32, spec: &ContainerSpec) -> GatewayResult<()> {
        debug!(node = %spec.node, vmid = id, "POST create");
        let form = create_form(id, spec);
        self.submit(
            self.api(Method::POST, &format!("/nodes/{}/lxc", spec.node))
                .form(&form),
        )
        .await
    }

    async fn delete(
        &self,
        identity: &ContainerIdentity,
        options: &DeleteOptions,
    ) -> GatewayResult<()> {
        debug!(node = %identity.node, vmid = identity.id, "DELETE container");
        let query = [
            ("purge", flag(options.purge)),
            ("force", flag(options.force)),
            (
                "destroy-unreferenced-disks",
                flag(options.destroy_unreferenced_disks),
            ),
        ];
        self.submit(
            self.api(Method::DELETE, &Self::lxc_path(identity, ""))
                .query(&query),
        )
        .await
    }

    async fn status(&self, identity: &ContainerIdentity) -> GatewayResult<ObservedStatus> {
        let body: StatusBody = self
            .fetch(self.api(Method::GET, &Self::lxc_path(identity, "/status/current")))
            .await?;
        Ok(ObservedStatus::from(body.status))
    }

    async fn interfaces(&self, identity: &ContainerIdentity) -> GatewayResult<Vec<Interface>> {
        let body: Vec<InterfaceBody> = self
            .fetch(self.api(Method::GET, &Self::lxc_path(identity, "/interfaces")))
            .await?;
        Ok(body
            .into_iter()
            .map(|i| Interface {
                name: i.name,
                hwaddr: i.hwaddr,
                ipv4: strip_prefix_len(i.inet.as_deref()),
                ipv6: strip_prefix_len(i.inet6.as_deref()),
            })
            .collect())
    }

    async fn start(&self, identity: &ContainerIdentity) -> GatewayResult<()> {
        debug!(node = %identity.node, vmid = identity.id, "POST start");
        self.submit(self.api(Method::POST, &Self::lxc_path(identity, "/status/start")))
            .await
    }

    async fn stop(
        &self,
        identity: &ContainerIdentity,
        overrule_shutdown: bool,
    ) -> GatewayResult<()> {
        debug!(node = %identity.node, vmid = identity.id, overrule_shutdown, "POST stop");
        let mut form: Vec<(&str, &str)> = Vec::new();
        if overrule_shutdown {
            form.push(("overrule-shutdown", "1"));
        }
        self.submit(
            self.api(Method::POST, &Self::lxc_path(identity, "/status/stop"))
                .form(&form),
        )
        .await
    }

    async fn exec_async(
        &self,
        identity: &ContainerIdentity,
        shell: &str,
        command: &str,
    ) -> GatewayResult<String> {
        let url = format!("{}/lxc/{}/exec-async", self.exec_base, identity.id);
        let body: ExecSubmitBody = self
            .fetch(self.client.post(url).json(&serde_json::json!({
                "shell": shell,
                "cmd": command,
            })))
            .await?;
        Ok(body.id)
    }

    async fn execution_result(&self, execution_id: &str) -> GatewayResult<ExecutionRecord> {
        let url = format!("{}/exec/{}", self.exec_base, execution_id);
        let body: ExecResultBody = self.fetch(self.client.get(url)).await?;
        Ok(ExecutionRecord {
            execution_id: body.id.unwrap_or_else(|| execution_id.to_string()),
            status: body.status,
            exit_code: body.exit_code,
            output: body.output,
            error: body.error,
        })
    }

    async fn allocate_id(&self) -> GatewayResult<u32> {
        let id: VmId = self
            .fetch(self.api(Method::GET, "/cluster/nextid"))
            .await?;
        match id {
            VmId::Number(n) => Ok(n),
            VmId::Text(s) => s
                .parse()
                .map_err(|_| GatewayError::Decode(format!("invalid container id {s:?}"))),
        }
    }

    async fn is_id_available(&self, id: u32) -> GatewayResult<bool> {
        let result = self
            .send(
                self.api(Method::GET, "/cluster/nextid")
                    .query(&[("vmid", id)]),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(GatewayError::Api { status: 400, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn update_networks(
        &self,
        identity: &ContainerIdentity,
        networks: &[NetworkSpec],
    ) -> GatewayResult<()> {
        debug!(node = %identity.node, vmid = identity.id, count = networks.len(), "PUT networks");
        let form: Vec<(String, String)> = networks
            .iter()
            .enumerate()
            .map(|(i, net)| (format!("net{i}"), encode_network(net)))
            .collect();
        self.submit(
            self.api(Method::PUT, &Self::lxc_path(identity, "/config"))
                .form(&form),
        )
        .await
    }

    async fn convert_to_template(&self, identity: &ContainerIdentity) -> GatewayResult<()> {
        debug!(node = %identity.node, vmid = identity.id, "POST template");
        self.submit(self.api(Method::POST, &Self::lxc_path(identity, "/template")))
            .await
    }

    async fn clone_container(&self, request: &CloneRequest) -> GatewayResult<()> {
        debug!(
            node = %request.node,
            source = request.source_id,
            target = request.target_id,
            "POST clone"
        );
        let source = ContainerIdentity::new(request.node.clone(), request.source_id);
        self.submit(
            self.api(Method::POST, &Self::lxc_path(&source, "/clone"))
                .form(&clone_form(request)),
        )
        .await
    }
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

/// `10.0.0.5/24` becomes `10.0.0.5`.
fn strip_prefix_len(address: Option<&str>) -> String {
    address
        .map(|a| a.split('/').next().unwrap_or_default().trim().to_string())
        .unwrap_or_default()
}

/// Encode one network interface as a PVE `net{i}` property string.
pub fn encode_network(net: &NetworkSpec) -> String {
    let mut parts = vec![format!("name={}", net.name)];
    if let Some(bridge) = &net.bridge {
        parts.push(format!("bridge={bridge}"));
    }
    if net.firewall == Some(true) {
        parts.push("firewall=1".into());
    }
    if let Some(gw) = &net.gateway {
        parts.push(format!("gw={gw}"));
    }
    if let Some(gw6) = &net.gateway6 {
        parts.push(format!("gw6={gw6}"));
    }
    if let Some(hwaddr) = &net.hw_address {
        parts.push(format!("hwaddr={hwaddr}"));
    }
    if let Some(ip) = &net.ip {
        parts.push(format!("ip={ip}"));
    }
    if let Some(ip6) = &net.ip6 {
        parts.push(format!("ip6={ip6}"));
    }
    if net.link_down == Some(true) {
        parts.push("link_down=1".into());
    }
    if let Some(mtu) = net.mtu {
        parts.push(format!("mtu={mtu}"));
    }
    if let Some(rate) = net.rate {
        parts.push(format!("rate={rate}"));
    }
    if let Some(tag) = net.vlan_tag {
        parts.push(format!("tag={tag}"));
    }
    parts.join(",")
}

pub fn encode_features(features: &Features) -> Option<String> {
    let parts: Vec<&str> = [
        (features.force_rw_sys, "force_rw_sys=1"),
        (features.fuse, "fuse=1"),
        (features.key_ctl, "keyctl=1"),
        (features.nesting, "nesting=1"),
    ]
    .into_iter()
    .filter(|(enabled, _)| *enabled == Some(true))
    .map(|(_, part)| part)
    .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

pub fn encode_root_fs(root_fs: &RootFs) -> String {
    let mut out = match root_fs.disk_size {
        Some(size) => format!("{}:{}", root_fs.volume, size),
        None => root_fs.volume.clone(),
    };
    for (enabled, key) in [
        (root_fs.acl, "acl"),
        (root_fs.quota, "quota"),
        (root_fs.replicate, "replicate"),
        (root_fs.read_only, "ro"),
        (root_fs.shared, "shared"),
    ] {
        if enabled == Some(true) {
            out.push(',');
            out.push_str(key);
            out.push_str("=1");
        }
    }
    out
}

fn create_form(id: u32, spec: &ContainerSpec) -> Vec<(String, String)> {
    let mut form = vec![
        ("vmid".to_string(), id.to_string()),
        ("ostemplate".to_string(), spec.template.clone()),
    ];
    let mut push = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            form.push((key.to_string(), value));
        }
    };
    push("hostname", spec.hostname.clone());
    push("password", spec.password.clone());
    push("ssh-public-keys", spec.ssh_public_keys_joined());
    push("nameserver", spec.nameserver.clone());
    push("onboot", spec.on_boot.map(|b| flag(b).to_string()));
    push("unprivileged", spec.unprivileged.map(|b| flag(b).to_string()));
    push("features", encode_features(&spec.features));
    push("rootfs", spec.root_fs.as_ref().map(encode_root_fs));
    for (i, net) in spec.networks.iter().enumerate() {
        form.push((format!("net{i}"), encode_network(net)));
    }
    form
}

fn clone_form(request: &CloneRequest) -> Vec<(String, String)> {
    let mut form = vec![
        ("newid".to_string(), request.target_id.to_string()),
        ("full".to_string(), "0".to_string()),
    ];
    let optional = [
        ("hostname", request.hostname.clone()),
        ("description", request.description.clone()),
        ("pool", request.pool.clone()),
        ("snapname", request.snapshot.clone()),
        ("bwlimit", request.bandwidth_limit.map(|b| b.to_string())),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            form.push((key.to_string(), value));
        }
    }
    form
}
