mod campaigns;
mod inspect_cmds;
mod run_cmds;
mod task_cmds;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use matterstack_core::workspace;

#[derive(Parser)]
#[command(name = "matterstack", about = "Durable campaign orchestrator")]
struct Cli {
    /// Workspaces root (overrides MATTERSTACK_WORKSPACES_ROOT and
    /// autodiscovery)
    #[arg(long, global = true)]
    workspaces_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new run for a workspace
    Init {
        /// Workspace slug (may be nested, e.g. team/project)
        slug: String,
        /// Explicit operators.yaml to snapshot into the run
        #[arg(long)]
        operators_config: Option<PathBuf>,
        /// Explicit run id (defaults to a generated chronological id)
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Advance a run by one tick
    Step {
        run_id: String,
        /// Explicit operators.yaml (refused against a differing snapshot)
        #[arg(long)]
        operators_config: Option<PathBuf>,
        /// Allow replacing the run's persisted wiring snapshot
        #[arg(long)]
        force_wiring_override: bool,
        /// Legacy execution profile name
        #[arg(long)]
        profile: Option<String>,
        /// Legacy HPC YAML config path
        #[arg(long)]
        hpc_config: Option<PathBuf>,
        /// Run config file copied to <run_root>/config.json
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Step a run until terminal, or all active runs when no run id is given
    Loop {
        run_id: Option<String>,
        #[arg(long)]
        operators_config: Option<PathBuf>,
        #[arg(long)]
        force_wiring_override: bool,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        hpc_config: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show run status and per-task progress
    Status { run_id: String },
    /// Explain a run's configuration and wiring provenance
    Explain { run_id: String },
    /// Poll and print run status until terminal
    Monitor { run_id: String },
    /// Export the evidence bundle for a run
    ExportEvidence { run_id: String },
    /// Cancel a run (observed by the next tick)
    Cancel { run_id: String },
    /// Pause a run (skips dispatch until resumed)
    Pause { run_id: String },
    /// Resume a paused run
    Resume { run_id: String },
    /// Revive a terminal run back to PENDING
    Revive { run_id: String },
    /// Reset a task to PENDING so the next tick creates a new attempt
    Rerun {
        run_id: String,
        task_id: String,
        /// Also rerun transitive dependents
        #[arg(long)]
        recursive: bool,
        /// Skip confirmation and cancel active attempts
        #[arg(long)]
        force: bool,
    },
    /// List a task's attempt history (TSV)
    Attempts { run_id: String, task_id: String },
    /// Cancel an attempt (best-effort against the backend)
    CancelAttempt {
        run_id: String,
        attempt_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Find and clean up attempts stuck in CREATED
    CleanupOrphans {
        run_id: String,
        /// Actually mark orphans FAILED_INIT (default is a dry listing)
        #[arg(long)]
        confirm: bool,
        /// Age threshold: 1h, 30m, 3600s, or bare seconds
        #[arg(long, default_value = "1h")]
        timeout: String,
    },
    /// Run a self-contained end-to-end check in a temp workspace
    SelfTest,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let workspaces_root = cli
        .workspaces_root
        .clone()
        .unwrap_or_else(workspace::resolve_workspaces_root);

    let result = run_command(cli.command, &workspaces_root).await;

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run_command(command: Commands, workspaces_root: &std::path::Path) -> anyhow::Result<()> {
    match command {
        Commands::Init {
            slug,
            operators_config,
            run_id,
        } => {
            run_cmds::cmd_init(
                workspaces_root,
                &slug,
                operators_config.as_deref(),
                run_id.as_deref(),
            )
            .await
        }
        Commands::Step {
            run_id,
            operators_config,
            force_wiring_override,
            profile,
            hpc_config,
            config,
        } => {
            run_cmds::cmd_step(
                workspaces_root,
                &run_id,
                run_cmds::WiringFlags {
                    operators_config,
                    force_wiring_override,
                    profile,
                    hpc_config,
                },
                config.as_deref(),
            )
            .await
        }
        Commands::Loop {
            run_id,
            operators_config,
            force_wiring_override,
            profile,
            hpc_config,
            config,
        } => {
            run_cmds::cmd_loop(
                workspaces_root,
                run_id.as_deref(),
                run_cmds::WiringFlags {
                    operators_config,
                    force_wiring_override,
                    profile,
                    hpc_config,
                },
                config.as_deref(),
            )
            .await
        }
        Commands::Status { run_id } => inspect_cmds::cmd_status(workspaces_root, &run_id).await,
        Commands::Explain { run_id } => inspect_cmds::cmd_explain(workspaces_root, &run_id).await,
        Commands::Monitor { run_id } => inspect_cmds::cmd_monitor(workspaces_root, &run_id).await,
        Commands::ExportEvidence { run_id } => {
            inspect_cmds::cmd_export_evidence(workspaces_root, &run_id).await
        }
        Commands::Cancel { run_id } => run_cmds::cmd_cancel(workspaces_root, &run_id).await,
        Commands::Pause { run_id } => run_cmds::cmd_pause(workspaces_root, &run_id).await,
        Commands::Resume { run_id } => run_cmds::cmd_resume(workspaces_root, &run_id).await,
        Commands::Revive { run_id } => run_cmds::cmd_revive(workspaces_root, &run_id).await,
        Commands::Rerun {
            run_id,
            task_id,
            recursive,
            force,
        } => task_cmds::cmd_rerun(workspaces_root, &run_id, &task_id, recursive, force).await,
        Commands::Attempts { run_id, task_id } => {
            task_cmds::cmd_attempts(workspaces_root, &run_id, &task_id).await
        }
        Commands::CancelAttempt {
            run_id,
            attempt_id,
            force,
        } => task_cmds::cmd_cancel_attempt(workspaces_root, &run_id, &attempt_id, force).await,
        Commands::CleanupOrphans {
            run_id,
            confirm,
            timeout,
        } => task_cmds::cmd_cleanup_orphans(workspaces_root, &run_id, confirm, &timeout).await,
        Commands::SelfTest => self_test::cmd_self_test().await,
    }
}
