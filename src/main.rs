use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use waypoint_core::config::AppConfig;
use waypoint_core::evolution::EvolutionDecision;
use waypoint_core::graph::GraphSpec;
use waypoint_core::traits::{PauseChannel, RunStorage};
use waypoint_core::types::{RunId, RunStatus, SessionId};
use waypoint_core::wait::{SignalOutcome, WaitKey};
use waypoint_runtime::DurableWaitRuntime;
use waypoint_store::log_store::read_audit_log;
use waypoint_store::{FilePauseFlags, FileRunStorage, SqliteWaitStore};

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Operator tools for the Waypoint workflow runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph definition (JSON) for structural defects
    Validate {
        graph: PathBuf,
    },
    /// List stored runs
    Runs {
        /// Only runs for this goal
        #[arg(long)]
        goal: Option<String>,
        /// Only runs in this status (running, completed, failed, paused)
        #[arg(long)]
        status: Option<RunStatus>,
    },
    /// Print one run record as JSON
    Show {
        run_id: String,
    },
    /// Ask the executor to pause a session before its next node
    Pause {
        session_id: String,
    },
    /// Deliver a signal to a waiting run
    Signal {
        run_id: String,
        key: String,
        /// JSON payload (defaults to null)
        payload: Option<String>,
    },
    /// Show recent graph evolution decisions
    Audit {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waypoint", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { graph } => validate(&graph),
        Commands::Runs { goal, status } => list_runs(&config, goal, status).await,
        Commands::Show { run_id } => show_run(&config, &run_id).await,
        Commands::Pause { session_id } => {
            let flags = FilePauseFlags::new(config.pause_dir());
            flags.request_pause(&SessionId::from_string(&session_id))?;
            println!("Pause requested for session {}", session_id);
            Ok(())
        }
        Commands::Signal {
            run_id,
            key,
            payload,
        } => signal(&config, &run_id, &key, payload.as_deref()),
        Commands::Audit { limit } => audit(&config, limit).await,
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { .. } => Ok(()),
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".waypoint").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    Ok(AppConfig::default())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let graph: GraphSpec = serde_json::from_str(&content)
        .with_context(|| format!("parsing {}", path.display()))?;

    let violations = graph.validate();
    if violations.is_empty() {
        println!(
            "{} v{}: {} nodes, {} edges, ok",
            graph.id,
            graph.version,
            graph.nodes.len(),
            graph.edges.len()
        );
        return Ok(());
    }
    for v in &violations {
        eprintln!("  - {}", v);
    }
    anyhow::bail!("{} structural violation(s) in {}", violations.len(), graph.id)
}

async fn list_runs(
    config: &AppConfig,
    goal: Option<String>,
    status: Option<RunStatus>,
) -> anyhow::Result<()> {
    let storage = FileRunStorage::new(config.runs_dir());
    let mut ids = match (&goal, status) {
        (Some(g), _) => storage.runs_by_goal(g).await?,
        (None, Some(s)) => storage.runs_by_status(s).await?,
        (None, None) => storage.list_all_runs().await?,
    };
    if let (Some(_), Some(s)) = (&goal, status) {
        let by_status = storage.runs_by_status(s).await?;
        ids.retain(|id| by_status.contains(id));
    }

    if ids.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    println!(
        "{:<40} {:<12} {:<10} {:>9} {:>8}  STARTED",
        "RUN", "GOAL", "STATUS", "DECISIONS", "PROBLEMS"
    );
    for id in ids {
        let Some(run) = storage.load_run(&id).await? else {
            continue;
        };
        let s = run.summary();
        println!(
            "{:<40} {:<12} {:<10} {:>9} {:>8}  {}",
            s.run_id.to_string(),
            s.goal_id,
            s.status.to_string(),
            s.decision_count,
            s.problem_count,
            s.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn show_run(config: &AppConfig, run_id: &str) -> anyhow::Result<()> {
    let storage = FileRunStorage::new(config.runs_dir());
    let run = storage
        .load_run(&RunId::from_string(run_id))
        .await?
        .with_context(|| format!("run {} not found", run_id))?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

fn signal(config: &AppConfig, run_id: &str, key: &str, payload: Option<&str>) -> anyhow::Result<()> {
    let payload = match payload {
        Some(p) => serde_json::from_str(p).context("payload must be JSON")?,
        None => serde_json::Value::Null,
    };
    let store = SqliteWaitStore::open(&config.waits_db_path())?;
    let waits = DurableWaitRuntime::new(Arc::new(store));
    let key = WaitKey::new(&RunId::from_string(run_id), key);

    match waits.signal(&key, payload)? {
        SignalOutcome::Scheduled { request_id } => {
            println!("Scheduled resumption of {} (request {})", key, request_id)
        }
        SignalOutcome::NoWaiter => println!("No outstanding wait for {}; signal recorded", key),
    }
    Ok(())
}

async fn audit(config: &AppConfig, limit: usize) -> anyhow::Result<()> {
    let path = config.audit_log_path();
    let entries = read_audit_log(&path).await?;
    if entries.is_empty() {
        println!("No evolution decisions recorded in {}", path.display());
        return Ok(());
    }
    let skip = entries.len().saturating_sub(limit);
    for e in entries.iter().skip(skip) {
        let violations = if e.violations.is_empty() {
            String::new()
        } else {
            format!(" [{}]", e.violations.join("; "))
        };
        let decision = match e.decision {
            EvolutionDecision::Applied => "applied",
            EvolutionDecision::Rejected => "rejected",
        };
        println!(
            "{} {:<10} {:<8} {} v{} -> v{} ({}){}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.correlation_id,
            decision,
            e.graph_id,
            e.from_version,
            e.candidate_version,
            e.snapshot_id,
            violations
        );
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
