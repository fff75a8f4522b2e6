//! mvirt-pve: reconcile Proxmox VE guests from JSON descriptors.
//!
//! Each invocation runs one operation against one guest. State produced by
//! `create`/`update` is printed as JSON and fed back to later invocations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tabled::{Table, Tabled};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_pve::clients::{GuestSummary, PveApi, PveClient, TemplateEntry};
use mvirt_pve::wait::TokioClock;
use mvirt_pve::{
    ClientConfig, LifecycleController, ObservedState, ReconcilePolicy, Reconciler,
    ResourceDescriptor, ResourceKind,
};

/// mvirt PVE reconciler
#[derive(Parser, Debug)]
#[command(name = "mvirt-pve", version, about)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// API base URL (e.g., https://pve:8006/api2/json)
    #[arg(long, env = "PVE_ENDPOINT")]
    endpoint: String,

    #[arg(long, env = "PVE_USERNAME", default_value = "root@pam")]
    username: String,

    #[arg(long, env = "PVE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// API token ID (user@realm!name); used instead of a ticket when set
    #[arg(long, env = "PVE_TOKEN_ID", requires = "token_secret")]
    token_id: Option<String>,

    #[arg(long, env = "PVE_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long, env = "PVE_INSECURE")]
    insecure: bool,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,
}

impl ConnectionArgs {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.endpoint, &self.username);
        if let Some(password) = &self.password {
            config = config.with_password(password);
        }
        if let (Some(id), Some(secret)) = (&self.token_id, &self.token_secret) {
            config = config.with_token(id, secret);
        }
        config.insecure = self.insecure;
        config.request_timeout = Duration::from_secs(self.request_timeout);
        config
    }
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// JSON file with wait/retry settings
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Seconds between status polls
    #[arg(long, global = true)]
    poll_interval: Option<f64>,

    /// Maximum delete attempts
    #[arg(long, global = true)]
    delete_attempts: Option<u32>,
}

impl PolicyArgs {
    fn load(&self) -> Result<ReconcilePolicy> {
        let mut policy = match &self.policy {
            Some(path) => read_json(path)?,
            None => ReconcilePolicy::default(),
        };
        if let Some(secs) = self.poll_interval {
            policy.poll_interval = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("invalid poll interval {secs}"))?;
        }
        if let Some(attempts) = self.delete_attempts {
            policy.delete_attempts = attempts;
        }
        Ok(policy)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a guest from a descriptor
    Create {
        /// Descriptor JSON file
        #[arg(short, long)]
        descriptor: PathBuf,

        /// Write observed state here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Apply a changed descriptor to an existing guest
    Update {
        /// Observed state from a previous create/update
        #[arg(short, long)]
        state: PathBuf,

        #[arg(short, long)]
        descriptor: PathBuf,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Stop and destroy a guest
    Delete {
        #[arg(short, long)]
        state: PathBuf,
    },

    /// Show the current status of a guest
    Status {
        #[arg(short, long)]
        state: PathBuf,
    },

    /// List guests on a node
    List {
        #[arg(long, default_value = "pve")]
        node: String,

        /// qemu or lxc
        #[arg(long, default_value = "lxc")]
        kind: ResourceKind,
    },

    /// List container templates on a storage
    Templates {
        #[arg(long, default_value = "pve")]
        node: String,

        #[arg(long, default_value = "local")]
        storage: String,
    },
}

#[derive(Tabled)]
struct GuestRow {
    #[tabled(rename = "VMID")]
    vmid: u32,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "CPUS")]
    cpus: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "LOCK")]
    lock: String,
}

impl From<GuestSummary> for GuestRow {
    fn from(g: GuestSummary) -> Self {
        Self {
            vmid: g.vmid,
            name: g.name.unwrap_or_else(|| "-".to_string()),
            status: g.status.unwrap_or_else(|| "-".to_string()),
            cpus: g.cpus.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            memory: g
                .maxmem
                .map(|m| format!("{} MB", m / (1024 * 1024)))
                .unwrap_or_else(|| "-".to_string()),
            lock: g.lock.unwrap_or_default(),
        }
    }
}

#[derive(Tabled)]
struct TemplateRow {
    #[tabled(rename = "VOLID")]
    volid: String,
    #[tabled(rename = "FORMAT")]
    format: String,
    #[tabled(rename = "SIZE")]
    size: String,
}

impl From<TemplateEntry> for TemplateRow {
    fn from(t: TemplateEntry) -> Self {
        Self {
            volid: t.volid,
            format: t.format.unwrap_or_else(|| "-".to_string()),
            size: t
                .size
                .map(|s| format!("{} MB", s / (1024 * 1024)))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_state<T: Serialize>(value: &T, out: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON output only.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_pve=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let client = PveClient::new(cli.connection.client_config())?;
    let policy = cli.policy.load()?;

    match cli.command {
        Commands::Create { descriptor, out } => {
            let desired: ResourceDescriptor = read_json(&descriptor)?;
            let controller = LifecycleController::with_clock(client, TokioClock, policy);
            let state = controller.create(&desired).await?;
            write_state(&state, out.as_deref())?;
        }

        Commands::Update {
            state,
            descriptor,
            out,
        } => {
            let old: ObservedState = read_json(&state)?;
            let desired: ResourceDescriptor = read_json(&descriptor)?;
            let controller = LifecycleController::with_clock(client, TokioClock, policy);
            let state = controller.update(old.id, &old, &desired).await?;
            write_state(&state, out.as_deref())?;
        }

        Commands::Delete { state } => {
            let old: ObservedState = read_json(&state)?;
            let controller = LifecycleController::with_clock(client, TokioClock, policy);
            controller.delete(&old.target()).await?;
            info!(guest = %old.target(), "Delete complete");
        }

        Commands::Status { state } => {
            let old: ObservedState = read_json(&state)?;
            let controller = LifecycleController::with_clock(client, TokioClock, policy);
            let status = controller.refresh_status(&old.target()).await;
            println!("{status}");
        }

        Commands::List { node, kind } => {
            let mut guests = client.list_guests(&node, kind).await?;
            if guests.is_empty() {
                println!("No guests found");
            } else {
                guests.sort_by_key(|g| g.vmid);
                let rows: Vec<GuestRow> = guests.into_iter().map(GuestRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Templates { node, storage } => {
            let templates = client.list_templates(&node, &storage).await?;
            if templates.is_empty() {
                println!("No templates found");
            } else {
                let rows: Vec<TemplateRow> = templates.into_iter().map(TemplateRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}
