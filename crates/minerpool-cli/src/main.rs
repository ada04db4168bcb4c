//! Minerpool - miner VM pool CLI
//!
//! The `minerpool` command drives the pool: VM allocation and lifecycle,
//! workload deployment, and response scoring.
//!
//! ## Commands
//!
//! - `vms`: list, allocate, release, terminate and sync pooled VMs
//! - `deploy` / `stop`: run or stop the workload container on a VM
//! - `exec` / `upload`: raw operator access to a VM
//! - `score` / `validate`: score candidate answers
//! - `averages`: per-owner score averages from the registry

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use minerpool_core::metrics::METRICS;
use minerpool_core::{
    AllocationManager, ContainerOrchestrator, HttpRegistryBridge, JudgeConfig, OrchestratorConfig,
    Pool, RegistryConfig, ScoringEngine, ValidationRequest, WorkloadSource,
    DEFAULT_INSTANCE_NAME,
};
use minerpool_provider::{ProvisionSpec, RestVmProvider, SshCredentials};
use minerpool_state::{DeploymentLedger, JsonFileLedger, SurrealDeploymentLedger, VmId, VmRecord};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "minerpool")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Pooled inference VMs for miners", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Keep the deployment ledger in SurrealDB (SURREALDB_* variables)
    #[arg(long, global = true)]
    surreal: bool,

    /// JSON ledger file, used unless --surreal is given
    #[arg(
        long,
        global = true,
        env = "MINERPOOL_LEDGER",
        default_value = "vm_deployments.json"
    )]
    ledger: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pooled VM operations
    Vms {
        #[command(subcommand)]
        action: VmAction,
    },

    /// Build and run the workload container on a VM
    Deploy {
        /// Target VM
        vm_id: String,

        /// Dockerfile URL fetched on the VM
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        url: Option<String>,

        /// Local Dockerfile uploaded to the VM
        #[arg(long)]
        file: Option<PathBuf>,

        /// Port to publish (default: the orchestrator's default port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Stop the workload container and release the VM
    Stop {
        /// Target VM
        vm_id: String,

        /// Container name (default: the configured container)
        #[arg(long)]
        container: Option<String>,
    },

    /// Run a shell command on a VM
    Exec {
        /// Target VM
        vm_id: String,

        /// Command line, passed to the remote shell as is
        command: String,
    },

    /// Copy a local file to a VM
    Upload {
        /// Target VM
        vm_id: String,

        /// Local file
        local: PathBuf,

        /// Remote destination (`~/` is expanded on the VM)
        remote: String,
    },

    /// Score a single candidate answer
    Score {
        #[arg(short, long)]
        question: String,

        /// Reference answer
        #[arg(short, long)]
        truth: String,

        #[arg(short, long)]
        candidate: String,
    },

    /// Score a batch of candidates and publish the scores
    Validate {
        /// JSON file with question, truth and candidates (`-` for stdin)
        #[arg(default_value = "-")]
        input: PathBuf,
    },

    /// Per-owner score averages read back from the registry
    Averages {
        /// Trailing window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[derive(Subcommand)]
enum VmAction {
    /// List every VM in the ledger
    List,

    /// Show one VM record
    Get {
        vm_id: String,
    },

    /// Allocate a VM to an owner, reusing free capacity first
    Allocate {
        /// Owner address
        owner: String,

        /// Instance name for newly provisioned VMs
        #[arg(short, long, default_value = DEFAULT_INSTANCE_NAME)]
        name: String,
    },

    /// Return a VM to the free pool
    Release {
        vm_id: String,
    },

    /// Delete a VM at the provider and drop it from the ledger
    Terminate {
        vm_id: String,
    },

    /// Refresh addresses and ports from the provider
    Sync,

    /// Open additional TCP ports on a VM
    Ports {
        vm_id: String,

        /// Comma-separated ports
        #[arg(required = true, value_delimiter = ',')]
        ports: Vec<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    minerpool_core::init_tracing(cli.json, level);

    let result = run(cli).await;
    METRICS.flush();
    result
}

async fn run(cli: Cli) -> Result<()> {
    let ledger = open_ledger(cli.surreal, &cli.ledger).await?;
    let pool = build_pool(ledger).await?;
    dispatch(&pool, cli.command).await
}

async fn dispatch(pool: &Pool, command: Commands) -> Result<()> {
    match command {
        Commands::Vms { action } => match action {
            VmAction::List => cmd_list(pool).await,
            VmAction::Get { vm_id } => cmd_get(pool, &VmId::new(vm_id)).await,
            VmAction::Allocate { owner, name } => cmd_allocate(pool, &owner, &name).await,
            VmAction::Release { vm_id } => cmd_release(pool, &VmId::new(vm_id)).await,
            VmAction::Terminate { vm_id } => cmd_terminate(pool, &VmId::new(vm_id)).await,
            VmAction::Sync => cmd_sync(pool).await,
            VmAction::Ports { vm_id, ports } => cmd_ports(pool, &VmId::new(vm_id), &ports).await,
        },
        Commands::Deploy {
            vm_id,
            url,
            file,
            port,
        } => {
            let source = workload_source(url, file.as_deref())?;
            cmd_deploy(pool, &VmId::new(vm_id), source, port).await
        }
        Commands::Stop { vm_id, container } => {
            cmd_stop(pool, &VmId::new(vm_id), container.as_deref()).await
        }
        Commands::Exec { vm_id, command } => cmd_exec(pool, &VmId::new(vm_id), &command).await,
        Commands::Upload {
            vm_id,
            local,
            remote,
        } => cmd_upload(pool, &VmId::new(vm_id), &local, &remote).await,
        Commands::Score {
            question,
            truth,
            candidate,
        } => cmd_score(pool, &question, &truth, &candidate).await,
        Commands::Validate { input } => cmd_validate(pool, &input).await,
        Commands::Averages { hours } => cmd_averages(pool, hours).await,
    }
}

// ========== Wiring ==========

async fn open_ledger(surreal: bool, path: &Path) -> Result<Arc<dyn DeploymentLedger>> {
    if surreal {
        let ledger = SurrealDeploymentLedger::from_env()
            .await
            .context("Failed to connect to the deployment ledger")?;
        return Ok(Arc::new(ledger));
    }
    Ok(Arc::new(JsonFileLedger::new(path)))
}

async fn build_pool(ledger: Arc<dyn DeploymentLedger>) -> Result<Pool> {
    let provider = Arc::new(RestVmProvider::from_env().context("Failed to build provider client")?);
    let allocator = AllocationManager::open(ledger, provider.clone(), ProvisionSpec::from_env())
        .await
        .context("Failed to load the deployment ledger")?;
    let orchestrator =
        ContainerOrchestrator::new(provider, SshCredentials::from_env(), OrchestratorConfig::from_env());
    let scoring = ScoringEngine::from_config(JudgeConfig::from_env())?;

    let pool = Pool::new(allocator, orchestrator, scoring);
    match RegistryConfig::from_env() {
        Some(config) => {
            let bridge = HttpRegistryBridge::new(config.clone())?;
            Ok(pool.with_registry(Arc::new(bridge), config))
        }
        None => Ok(pool),
    }
}

fn workload_source(url: Option<String>, file: Option<&Path>) -> Result<WorkloadSource> {
    match (url, file) {
        (Some(url), None) => Ok(WorkloadSource::Url(url)),
        (None, Some(path)) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read Dockerfile {}", path.display()))?;
            Ok(WorkloadSource::File(bytes))
        }
        _ => bail!("exactly one of --url or --file is required"),
    }
}

fn read_validation_request(input: &Path) -> Result<ValidationRequest> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))?
    };
    serde_json::from_str(&raw).context("Invalid validation request")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_vm_row(record: &VmRecord) -> String {
    let ports: Vec<String> = record
        .open_ports
        .iter()
        .map(|p| p.port.to_string())
        .collect();
    format!(
        "{:<24} {:<8} {:<44} {:<16} {}",
        record.vm_id,
        record.status.as_str(),
        record.owner_address.as_deref().unwrap_or("-"),
        record.public_network_address.as_deref().unwrap_or("-"),
        if ports.is_empty() {
            "-".to_string()
        } else {
            ports.join(",")
        }
    )
}

// ========== VM Commands ==========

async fn cmd_list(pool: &Pool) -> Result<()> {
    let records = pool.list().await?;
    if records.is_empty() {
        println!("No VMs in the ledger");
        return Ok(());
    }
    for record in &records {
        println!("{}", render_vm_row(record));
    }
    Ok(())
}

async fn cmd_get(pool: &Pool, vm_id: &VmId) -> Result<()> {
    match pool.get(vm_id).await? {
        Some(record) => print_json(&record),
        None => bail!("VM {} not found", vm_id),
    }
}

async fn cmd_allocate(pool: &Pool, owner: &str, name: &str) -> Result<()> {
    let record = pool.allocate(owner, name).await?;
    info!(vm_id = %record.vm_id, owner = owner, "allocated");
    print_json(&record)
}

async fn cmd_release(pool: &Pool, vm_id: &VmId) -> Result<()> {
    match pool.release(vm_id).await? {
        Some(record) => println!("Released {} ({})", record.vm_id, record.status.as_str()),
        None => println!("VM {} not found", vm_id),
    }
    Ok(())
}

async fn cmd_terminate(pool: &Pool, vm_id: &VmId) -> Result<()> {
    if pool.terminate(vm_id).await? {
        println!("Terminated {}", vm_id);
    } else {
        println!("VM {} not found", vm_id);
    }
    Ok(())
}

async fn cmd_sync(pool: &Pool) -> Result<()> {
    let updated = pool.sync().await?;
    println!("Updated {} record(s) from the provider", updated);
    Ok(())
}

async fn cmd_ports(pool: &Pool, vm_id: &VmId, ports: &[u16]) -> Result<()> {
    let record = pool.open_ports(vm_id, ports).await?;
    println!("{}", render_vm_row(&record));
    Ok(())
}

// ========== Workload Commands ==========

async fn cmd_deploy(
    pool: &Pool,
    vm_id: &VmId,
    source: WorkloadSource,
    port: Option<u16>,
) -> Result<()> {
    let code = pool.deploy(vm_id, source, port).await?;
    println!("Deployed on {} (exit {})", vm_id, code);
    Ok(())
}

async fn cmd_stop(pool: &Pool, vm_id: &VmId, container: Option<&str>) -> Result<()> {
    let code = pool.stop(vm_id, container).await?;
    println!("Stopped workload on {} (exit {}), VM released", vm_id, code);
    Ok(())
}

async fn cmd_exec(pool: &Pool, vm_id: &VmId, command: &str) -> Result<()> {
    let output = pool.exec(vm_id, command).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if output.exit_code != 0 {
        bail!("command exited with {}", output.exit_code);
    }
    Ok(())
}

async fn cmd_upload(pool: &Pool, vm_id: &VmId, local: &Path, remote: &str) -> Result<()> {
    let bytes =
        std::fs::read(local).with_context(|| format!("Failed to read {}", local.display()))?;
    let output = pool.upload(vm_id, &bytes, remote).await?;
    if output.exit_code != 0 {
        bail!("upload failed ({}): {}", output.exit_code, output.stderr.trim());
    }
    println!("Uploaded {} bytes to {}:{}", bytes.len(), vm_id, remote);
    Ok(())
}

// ========== Scoring Commands ==========

async fn cmd_score(pool: &Pool, question: &str, truth: &str, candidate: &str) -> Result<()> {
    println!("{}", pool.score(question, truth, candidate).await);
    Ok(())
}

async fn cmd_validate(pool: &Pool, input: &Path) -> Result<()> {
    let request = read_validation_request(input)?;
    let report = pool.validate(&request).await;
    print_json(&report)?;
    if !pool.flush_publications().await {
        bail!("score publish for batch {} did not finish in time", report.batch_id);
    }
    Ok(())
}

async fn cmd_averages(pool: &Pool, hours: i64) -> Result<()> {
    if hours <= 0 {
        bail!("--hours must be positive");
    }
    let Some(board) = pool.scoreboard() else {
        bail!("MINERPOOL_REGISTRY_URL is not set");
    };
    let averages = board.averages(chrono::Duration::hours(hours)).await?;
    print_json(&averages)
}
