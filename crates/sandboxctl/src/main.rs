//! sandboxctl - launch and inspect Apptainer sandboxes
//!
//! ## Commands
//!
//! - `up`: start a sandbox, wait until it is alive, stop it on Ctrl-C
//! - `command`: print the `apptainer exec` invocation without running it
//! - `normalize`: show how an image reference will be passed to Apptainer

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use sandbox_runtime::{
    normalize_image_reference, telemetry, RuntimeConfig, RuntimeInstance, SandboxRuntime,
    ToolFlavor,
};
use serde::Serialize;
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sandboxctl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the action-execution server inside Apptainer", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a sandbox and keep it running until Ctrl-C
    Up {
        #[command(flatten)]
        launch: LaunchArgs,

        /// Wait for an already-running sandbox instead of starting one
        #[arg(long)]
        attach: bool,
    },

    /// Print the exec command and injected environment without spawning
    Command {
        #[command(flatten)]
        launch: LaunchArgs,
    },

    /// Print the normalized form of an image reference
    Normalize {
        /// Image reference (registry ref, .sif path or transport URI)
        reference: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct LaunchArgs {
    /// Container image
    #[arg(short, long)]
    image: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "SANDBOXCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Session id (default: random UUID)
    #[arg(short, long)]
    session: Option<String>,

    /// Pass the host GPUs through (`--nv`)
    #[arg(long)]
    gpu: bool,

    /// Comma-separated host:container[:mode] binds
    #[arg(long)]
    volumes: Option<String>,

    /// Readiness timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
}

/// What `command` prints.
#[derive(Serialize)]
struct InvocationReport {
    session_id: String,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Up { launch, attach } => cmd_up(&launch, attach, cli.json).await,
        Commands::Command { launch } => cmd_command(&launch, cli.json).await,
        Commands::Normalize { reference } => cmd_normalize(&reference),
    }
}

/// Start a sandbox, report where it listens and wait for Ctrl-C
async fn cmd_up(launch: &LaunchArgs, attach: bool, json: bool) -> Result<()> {
    let mut config = build_config(launch)?;
    config.attach_to_existing |= attach;
    let session_id = session_id(launch);

    let mut instance =
        RuntimeInstance::new(config, &session_id).context("Failed to create sandbox runtime")?;

    if let Err(e) = instance.connect().await {
        instance.close().await;
        return Err(e).context(format!("Sandbox {session_id} failed to start"));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&instance.summary())?);
    } else {
        println!("Sandbox {} ready at {}", session_id, instance.api_url());
        if !instance.collision_safe() {
            println!("  warning: ports reserved without locks; another sandbox may collide");
        }
        if let Some(path) = instance.log_path() {
            println!("  log: {}", path.display());
        }
    }

    info!("Press Ctrl-C to stop the sandbox");
    let waited = tokio::signal::ctrl_c().await;
    instance.close().await;
    waited.context("Failed to listen for Ctrl-C")?;

    println!("Sandbox {} stopped", session_id);
    Ok(())
}

/// Print the exec invocation; ports are reserved only for the duration of the call
async fn cmd_command(launch: &LaunchArgs, json: bool) -> Result<()> {
    let config = build_config(launch)?;
    let session_id = session_id(launch);
    let mut instance =
        RuntimeInstance::new(config, &session_id).context("Failed to create sandbox runtime")?;

    let invocation = instance.invocation();
    instance.close().await;

    let report = InvocationReport {
        session_id,
        argv: invocation.argv().to_vec(),
        env: injected_env(invocation.env()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.argv.join(" "));
        for (key, value) in &report.env {
            println!("  {key}={value}");
        }
    }
    Ok(())
}

fn cmd_normalize(reference: &str) -> Result<()> {
    let normalized = normalize_image_reference(Some(reference));
    if normalized.is_empty() {
        bail!("Empty image reference");
    }
    println!("{}", normalized);
    Ok(())
}

/// Defaults, then the config file, then the environment, then the flags.
fn build_config(launch: &LaunchArgs) -> Result<RuntimeConfig> {
    let base = match &launch.config {
        Some(path) => load_config_file(path)?,
        None => RuntimeConfig::default(),
    };
    let mut config = base.with_env_overrides();

    if let Some(image) = &launch.image {
        config = config.with_image(image);
    }
    if let Some(volumes) = &launch.volumes {
        config = config.with_volumes(volumes);
    }
    if launch.gpu {
        config = config.with_gpu(true);
    }
    if let Some(secs) = launch.timeout {
        config = config.with_init_timeout(std::time::Duration::from_secs(secs));
    }
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<RuntimeConfig> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config file: {:?}", path))?;
    toml::from_str(&content).context(format!("Invalid config file: {:?}", path))
}

fn session_id(launch: &LaunchArgs) -> String {
    launch
        .session
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Only the variables forwarded into the sandbox, not the whole host environment.
fn injected_env(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| {
            ToolFlavor::all()
                .iter()
                .any(|flavor| key.starts_with(flavor.env_prefix()))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
