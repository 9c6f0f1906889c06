//! Connection settings and lifecycle tuning.
//!
//! Connection settings come from CLI flags with environment fallbacks.
//! Lifecycle tuning is an optional TOML file; every field defaults to the
//! cadence the cluster is known to tolerate.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{Backoff, WaitPolicy};
use crate::types::DeleteOptions;

/// Proxmox VE API connection.
#[derive(clap::Args, Debug, Clone)]
pub struct GatewayConfig {
    /// API host, optionally with an http:// or https:// scheme
    #[arg(long, env = "PROXMOX_HOST", default_value = "")]
    pub host: String,

    /// API port
    #[arg(long, env = "PROXMOX_PORT", default_value = "8006")]
    pub port: u16,

    /// API user (e.g. root@pam)
    #[arg(long, env = "PROXMOX_USER", default_value = "")]
    pub user: String,

    /// API token name
    #[arg(long, env = "PROXMOX_TOKEN_NAME", default_value = "")]
    pub token_name: String,

    /// API token secret
    #[arg(long, env = "PROXMOX_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,

    /// Accept invalid TLS certificates
    #[arg(long, env = "PROXMOX_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,

    /// Cloudflare Access client id
    #[arg(long, env = "CF_CLIENT_ID")]
    pub cf_client_id: Option<String>,

    /// Cloudflare Access client secret
    #[arg(long, env = "CF_CLIENT_SECRET", hide_env_values = true)]
    pub cf_client_secret: Option<String>,

    /// Base path of the host-side exec service
    #[arg(long, default_value = "/custom-api/v1")]
    pub exec_base_path: String,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        token_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 8006,
            user: user.into(),
            token_name: token_name.into(),
            token: token.into(),
            insecure_skip_verify: false,
            cf_client_id: None,
            cf_client_secret: None,
            exec_base_path: "/custom-api/v1".to_string(),
            request_timeout_secs: 30,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("host", &self.host, "PROXMOX_HOST"),
            ("user", &self.user, "PROXMOX_USER"),
            ("token name", &self.token_name, "PROXMOX_TOKEN_NAME"),
            ("token", &self.token, "PROXMOX_TOKEN"),
        ];
        for (name, value, env) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "missing Proxmox API {name}, set it with a flag or the {env} environment variable"
                )));
            }
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("Proxmox API port must not be 0".into()));
        }
        if self.cf_client_secret.is_some() && self.cf_client_id.is_none() {
            return Err(ConfigError::Invalid(
                "a Cloudflare client secret requires a client id (CF_CLIENT_ID)".into(),
            ));
        }
        Ok(())
    }

    /// Scheme, host and port, without a trailing slash.
    pub fn origin(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{}:{}", host, self.port)
        }
    }

    pub fn authorization(&self) -> String {
        format!(
            "PVEAPIToken={}!{}={}",
            self.user, self.token_name, self.token
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Status convergence tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPolicy {
    /// Failed transitions (and transient status reads) allowed per convergence.
    pub retry_budget: u32,
    /// Pause before each status read.
    pub poll: Backoff,
    /// Pause after a failed call.
    pub retry: Backoff,
    /// Status reads before giving up on a container stuck in transition.
    pub max_polls: u32,
    /// Ask the cluster to abort a pending shutdown when stopping.
    pub overrule_shutdown: bool,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            poll: Backoff::fixed(Duration::from_secs(8)),
            retry: Backoff::exponential(Duration::from_secs(8), Duration::from_secs(60)),
            max_polls: 60,
            overrule_shutdown: false,
        }
    }
}

/// Command execution tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecPolicy {
    pub shell: String,
    pub submit_budget: u32,
    pub submit_backoff: Backoff,
    pub result_budget: u32,
    pub result_poll: Backoff,
    /// Polls of a still running command before giving up. `None` waits
    /// for as long as the operation deadline allows.
    pub max_running_polls: Option<u32>,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            submit_budget: 3,
            submit_backoff: Backoff::exponential(Duration::from_secs(3), Duration::from_secs(60)),
            result_budget: 3,
            result_poll: Backoff::fixed(Duration::from_secs(2)),
            max_running_polls: Some(900),
        }
    }
}

/// Network address resolution tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkPolicy {
    pub attempts: u32,
    /// Pause before every attempt, the first included.
    pub interval: Backoff,
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Backoff::fixed(Duration::from_secs(15)),
        }
    }
}

/// Deletion pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionPolicy {
    /// Wait before the first action so in-flight operations can settle.
    pub settle_secs: u64,
    pub confirm_stopped: WaitPolicy,
    pub confirm_freed: WaitPolicy,
    pub options: DeleteOptions,
}

impl Default for DeletionPolicy {
    fn default() -> Self {
        Self {
            settle_secs: 15,
            confirm_stopped: WaitPolicy::new(Duration::from_secs(5), Some(Duration::from_secs(600))),
            confirm_freed: WaitPolicy::new(Duration::from_secs(2), Some(Duration::from_secs(600))),
            options: DeleteOptions::default(),
        }
    }
}

impl DeletionPolicy {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

/// Tuning for every lifecycle stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub status: StatusPolicy,
    pub exec: ExecPolicy,
    pub network: NetworkPolicy,
    pub deletion: DeletionPolicy,
}

impl LifecycleConfig {
    /// Load from a TOML file, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Same cadence with randomization removed everywhere.
    pub fn without_jitter(mut self) -> Self {
        self.status.poll = self.status.poll.without_jitter();
        self.status.retry = self.status.retry.without_jitter();
        self.exec.submit_backoff = self.exec.submit_backoff.without_jitter();
        self.exec.result_poll = self.exec.result_poll.without_jitter();
        self.network.interval = self.network.interval.without_jitter();
        self.deletion.confirm_stopped.interval =
            self.deletion.confirm_stopped.interval.without_jitter();
        self.deletion.confirm_freed.interval =
            self.deletion.confirm_freed.interval.without_jitter();
        self
    }
}
