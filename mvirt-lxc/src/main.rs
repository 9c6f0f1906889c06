//! mvirt-lxc: converge Proxmox VE LXC containers to a desired state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_lxc::state::{FileStateRecorder, NoopRecorder, StateRecorder};
use mvirt_lxc::{
    CloneSpec, ContainerIdentity, ContainerSpec, Deadline, GatewayConfig, Lifecycle,
    LifecycleConfig, LifecycleError, NetworkSpec, PveClient, Status,
};

/// mvirt LXC lifecycle tool
#[derive(Parser, Debug)]
#[command(name = "mvirt-lxc", version, about)]
struct Args {
    #[command(flatten)]
    gateway: GatewayConfig,

    /// Lifecycle tuning (TOML)
    #[arg(long, env = "MVIRT_LXC_CONFIG")]
    config: Option<PathBuf>,

    /// Record created containers in this JSON file
    #[arg(long, env = "MVIRT_LXC_STATE")]
    state_file: Option<PathBuf>,

    /// Overall deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

/// Identity of an existing container.
#[derive(clap::Args, Debug)]
struct Target {
    /// Node the container lives on
    #[arg(long)]
    node: String,

    /// Container id
    #[arg(long)]
    id: u32,
}

impl Target {
    fn identity(&self) -> ContainerIdentity {
        ContainerIdentity::new(self.node.clone(), self.id)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a container from a JSON spec
    Create {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Create a container and convert it into a template
    Template {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Linked clone of a template
    Clone {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Show status and network addresses
    Read {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "running")]
        status: Status,
        /// Configured networks (JSON list)
        #[arg(long)]
        networks: Option<PathBuf>,
    },
    /// Converge to a status
    Status {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        status: Status,
        /// Report all observed interfaces afterwards (linked clones)
        #[arg(long)]
        discover: bool,
    },
    /// Replace the network configuration
    UpdateNetworks {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "running")]
        status: Status,
        /// Networks (JSON list)
        #[arg(long)]
        networks: PathBuf,
    },
    /// Run commands inside a running container
    Exec {
        #[command(flatten)]
        target: Target,
        #[arg(trailing_var_arg = true, required = true)]
        commands: Vec<String>,
    },
    /// Stop and delete a container
    Delete {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_lxc=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let config = LifecycleConfig::load(args.config.as_deref())?;
    let client = PveClient::new(&args.gateway).context("Invalid Proxmox connection settings")?;
    info!("Proxmox API: {}", args.gateway.origin());

    let recorder: Arc<dyn StateRecorder> = match &args.state_file {
        Some(path) => Arc::new(FileStateRecorder::new(path)),
        None => Arc::new(NoopRecorder),
    };
    let lifecycle = Lifecycle::new(Arc::new(client), config).with_recorder(recorder);

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
    let deadline = match args.timeout {
        Some(secs) => Deadline::after(Duration::from_secs(secs)),
        None => Deadline::none(),
    }
    .with_token(token);

    if let Err(e) = run(&lifecycle, args.command, &deadline).await {
        error!(presence = ?e.presence(), "{e}");
        return Err(e.into());
    }
    Ok(())
}

async fn run(
    lifecycle: &Lifecycle,
    command: Command,
    deadline: &Deadline,
) -> Result<(), LifecycleError> {
    match command {
        Command::Create { spec } => {
            let spec: ContainerSpec = read_json(&spec)?;
            print(&lifecycle.create_container(&spec, deadline).await?)
        }
        Command::Template { spec } => {
            let spec: ContainerSpec = read_json(&spec)?;
            print(&lifecycle.create_template(&spec, deadline).await?)
        }
        Command::Clone { spec } => {
            let spec: CloneSpec = read_json(&spec)?;
            print(&lifecycle.clone_container(&spec, deadline).await?)
        }
        Command::Read {
            target,
            status,
            networks,
        } => {
            let networks: Vec<NetworkSpec> = match networks {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            let outcome = lifecycle
                .read_container(&target.identity(), status, &networks, deadline)
                .await?;
            print(&outcome)
        }
        Command::Status {
            target,
            status,
            discover,
        } => {
            let identity = target.identity();
            lifecycle.update_status(&identity, status, deadline).await?;
            if discover && status == Status::Running {
                let networks = lifecycle.discover_networks(&identity, deadline).await?;
                return print(&networks);
            }
            print(&serde_json::json!({ "identity": identity, "status": status }))
        }
        Command::UpdateNetworks {
            target,
            status,
            networks,
        } => {
            let networks: Vec<NetworkSpec> = read_json(&networks)?;
            let resolved = lifecycle
                .update_networks(&target.identity(), &networks, status, deadline)
                .await?;
            print(&resolved)
        }
        Command::Exec { target, commands } => {
            let identity = target.identity();
            lifecycle.run_commands(&identity, &commands, deadline).await?;
            print(&serde_json::json!({ "identity": identity, "commands": commands.len() }))
        }
        Command::Delete { target } => {
            let identity = target.identity();
            lifecycle.delete_container(&identity, deadline).await?;
            print(&serde_json::json!({ "identity": identity, "deleted": true }))
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, LifecycleError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| LifecycleError::Invalid(format!("unable to read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| LifecycleError::Invalid(format!("invalid JSON in {}: {e}", path.display())))
}

fn print<T: Serialize>(value: &T) -> Result<(), LifecycleError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| LifecycleError::Invalid(format!("unable to encode output: {e}")))?;
    println!("{json}");
    Ok(())
}
