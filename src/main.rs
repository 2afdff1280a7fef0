mod commands;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use resync::config::Config;
use resync::push::BroadcastTransport;
use resync::SyncContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "resync")]
#[command(about = "Keep a consistent, fresh view of a remote resource API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/resync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource and print it
  Get {
    resource: String,
    /// Key parameter as name=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Subscribe to a resource and print every update
  Watch {
    resource: String,
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Poll interval in seconds
    #[arg(long, default_value_t = 10)]
    every: u64,
    /// Listen for change notifications on this table (JSON lines on stdin)
    #[arg(long)]
    table: Option<String>,
  },
  /// Track the long-running server job
  Job {
    #[command(subcommand)]
    action: JobAction,
  },
}

#[derive(Subcommand, Debug)]
enum JobAction {
  /// Start a job and follow it to completion
  Trigger {
    /// Start even if a job is already tracked
    #[arg(long)]
    force: bool,
  },
  /// Show the tracked job
  Status,
  /// Commit the result of a completed job
  Confirm,
  /// Forget the tracked job
  Clear,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
  let (name, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected name=value, got {}", s))?;
  if name.is_empty() {
    return Err(format!("empty parameter name in {}", s));
  }
  Ok((name.to_string(), value.to_string()))
}

/// Log to a daily rolling file; stdout is reserved for command output.
fn init_logging() -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("resync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "resync.log"));
  let filter = EnvFilter::try_from_env("RESYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let transport = BroadcastTransport::default();
  let ctx = SyncContext::from_config(&config, Arc::new(transport.clone()))?;
  ctx.start();

  let result = match args.command {
    Command::Get { resource, params } => commands::get(&ctx, &config, &resource, params).await,
    Command::Watch {
      resource,
      params,
      every,
      table,
    } => commands::watch(&ctx, &config, &transport, &resource, params, every, table).await,
    Command::Job { action } => match action {
      JobAction::Trigger { force } => commands::job_trigger(&ctx, force).await,
      JobAction::Status => commands::job_status(&ctx).await,
      JobAction::Confirm => commands::job_confirm(&ctx).await,
      JobAction::Clear => commands::job_clear(&ctx),
    },
  };

  ctx.shutdown();
  result
}
