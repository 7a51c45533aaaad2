use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keel::config::Config;
use keel::executor::CommandExecutor;
use keel::orchestration::Orchestrator;
use keel::planning::{load_task_dir, plan};
use keel::report::{self, SessionReport};
use keel::state::{FileStore, SessionId};
use keel::{Error, Result};

/// Keel - budgeted task orchestration with spiral detection
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    KEEL_DEBUG=1    Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (written to stderr)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Plan and run every task in a tasks folder
    Run(RunArgs),

    /// Print the plan without running anything (same as `run --plan-only`)
    Plan {
        /// Folder holding one TOML file per task
        tasks_dir: PathBuf,

        /// Config file (defaults to <tasks_dir>/keel.toml, then ~/.keel/keel.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the total budget
        #[arg(long)]
        budget: Option<f64>,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Folder holding one TOML file per task
    pub tasks_dir: PathBuf,

    /// Override the total budget
    #[arg(long)]
    pub budget: Option<f64>,

    /// Override the per-task iteration limit
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Print the plan and exit
    #[arg(long)]
    pub plan_only: bool,

    /// Resume a checkpointed session by id (budget and limits come from the checkpoint)
    #[arg(long, conflicts_with_all = ["budget", "max_iterations"])]
    pub resume: Option<String>,

    /// Config file (defaults to <tasks_dir>/keel.toml, then ~/.keel/keel.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

fn main() {
    let cli = Cli::parse();
    keel::log::init(cli.debug);

    let code = match dispatch(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            if e.is_structural() {
                report::REFUSED
            } else {
                report::DEGRADED
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => run(args),
        Command::Plan {
            tasks_dir,
            config,
            budget,
        } => run(RunArgs {
            tasks_dir,
            budget,
            max_iterations: None,
            plan_only: true,
            resume: None,
            config,
            json: false,
        }),
    }
}

fn load_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::load_for(&args.tasks_dir, args.config.as_deref())?;
    if let Some(budget) = args.budget {
        config.total_budget = budget;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: RunArgs) -> Result<i32> {
    let config = load_config(&args)?;

    if args.plan_only {
        let specs = load_task_dir(&args.tasks_dir)?;
        let (_, plan) = plan(&specs, config.total_budget, config.base_unit)?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(report::OK);
    }

    let executor = Arc::new(
        CommandExecutor::new(&config.executor.command)?.with_working_dir(tasks_root(&args.tasks_dir)),
    );
    let store = Arc::new(FileStore::new(config.state_dir()?));

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let orchestrator = match &args.resume {
            Some(session) => {
                let session: SessionId = session
                    .parse()
                    .map_err(|e| Error::InvalidInput(format!("invalid session id {}: {}", session, e)))?;
                Orchestrator::resume(session, executor, store).await?
            }
            None => {
                let specs = load_task_dir(&args.tasks_dir)?;
                Orchestrator::new(&specs, config, executor, store)?
            }
        };
        run_session(orchestrator).await
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(report.exit_code())
}

async fn run_session(orchestrator: Orchestrator) -> Result<SessionReport> {
    let cancel = CancellationToken::new();
    let mut orchestrator = orchestrator.with_cancellation(cancel.clone());
    let session = orchestrator.session_id();
    info!(session = %session, "session ready");

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after checkpoint");
            interrupt.cancel();
        }
    });

    let result = orchestrator.run().await;
    if matches!(result, Err(Error::Cancelled)) {
        eprintln!("session {} interrupted; resume with --resume {}", session, session);
    }
    result
}

fn tasks_root(tasks_dir: &Path) -> PathBuf {
    tasks_dir
        .canonicalize()
        .unwrap_or_else(|_| tasks_dir.to_path_buf())
}
