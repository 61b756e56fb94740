//! notebook-sandbox - operator CLI
//!
//! Usage:
//!   notebook-sandbox exec --session notebook:1 --code 'print(1)'
//!   notebook-sandbox exec --session notebook:1 --file cell.py --keep
//!   notebook-sandbox vm ensure|show|destroy --session notebook:1
//!   notebook-sandbox janitor [--ttl 3600] [--interval 60]

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use notebook_sandbox::engine::preprocess::COMMAND_TIMEOUT_STATUS;
use notebook_sandbox::{get_runtime, logging, vm, Result, Runtime, SandboxError};

#[derive(Parser, Debug)]
#[command(name = "notebook-sandbox")]
#[command(about = "Per-session Python sandboxes for notebook cells")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RUNTIME_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one cell in a session and print the result as JSON
    Exec {
        #[arg(long)]
        session: String,

        /// Read the cell from a file
        #[arg(long, conflicts_with = "code", required_unless_present = "code")]
        file: Option<PathBuf>,

        /// Cell source
        #[arg(long)]
        code: Option<String>,

        /// Leave the session VM in place afterwards
        #[arg(long)]
        keep: bool,
    },

    /// Inspect or manage a session VM directly
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },

    /// Sweep idle sessions and finished runs until Ctrl-C
    Janitor {
        /// Idle time after which a session is destroyed, in seconds
        #[arg(long, env = "RUNTIME_SESSION_TTL_SEC")]
        ttl: Option<i64>,

        /// Seconds between sweeps
        #[arg(long, default_value = "60")]
        interval: u64,
    },
}

#[derive(Subcommand, Debug)]
enum VmAction {
    Ensure {
        #[arg(long)]
        session: String,
    },
    Show {
        #[arg(long)]
        session: String,
    },
    Destroy {
        #[arg(long)]
        session: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = logging::init_logging(args.log_json) {
        eprintln!("Error: {}", e);
        exit(1);
    }

    let outcome = match args.command {
        Commands::Exec { session, file, code, keep } => exec(&session, file, code, keep).await,
        Commands::Vm { action } => vm_command(action).await,
        Commands::Janitor { ttl, interval } => janitor(ttl, Duration::from_secs(interval.max(1))).await,
    };

    match outcome {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(e.exit_code());
        }
    }
}

async fn exec(session_id: &str, file: Option<PathBuf>, code: Option<String>, keep: bool) -> Result<i32> {
    let source = match (file, code) {
        (Some(path), _) => tokio::fs::read_to_string(&path).await?,
        (None, Some(code)) => code,
        (None, None) => {
            return Err(SandboxError::PreconditionViolation("one of --file or --code is required".into()))
        }
    };

    let runtime = get_runtime()?;
    runtime.create_session(session_id).await?;
    let outcome = runtime.run_code(session_id, &source).await;

    if !keep {
        if let Err(e) = runtime.stop_session(session_id).await {
            warn!(session_id = %session_id, error = %e, "failed to stop session");
        }
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.command_timed_out() {
        return Ok(COMMAND_TIMEOUT_STATUS);
    }
    Ok(0)
}

async fn vm_command(action: VmAction) -> Result<i32> {
    let manager = vm::get_vm_manager()?;
    match action {
        VmAction::Ensure { session } => {
            let vm = manager.ensure_session_vm(&session, None).await?;
            println!("{}", vm.to_stable_json()?);
        }
        VmAction::Show { session } => {
            let vm = manager.get_session_vm(&session).await?;
            println!("{}", vm.to_stable_json()?);
        }
        VmAction::Destroy { session } => {
            let existed = manager.destroy_session_vm(&session).await?;
            println!("{}", serde_json::json!({ "session_id": session, "destroyed": existed }));
        }
    }
    Ok(0)
}

async fn janitor(ttl: Option<i64>, interval: Duration) -> Result<i32> {
    let runtime: Arc<Runtime> = get_runtime()?;
    let ttl = ttl.unwrap_or(runtime.sessions().config().session_ttl_secs);
    info!(ttl_secs = ttl, interval_secs = interval.as_secs(), "janitor started");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sessions = runtime.cleanup_expired_sessions(ttl).await;
                let runs = runtime.runs().evict_expired().await;
                if !sessions.is_empty() || runs > 0 {
                    info!(sessions = sessions.len(), runs, "janitor sweep");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("janitor stopping");
                return Ok(0);
            }
        }
    }
}
