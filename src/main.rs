mod cache;
mod config;
mod event;
mod network;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use cache::{CacheStorage, CacheStore, MemoryStorage, SqliteStorage};
use config::Config;
use event::{EventSource, HostEvent, HostReply, WorkerHost};
use network::{FetchRequest, HttpFetcher, RequestMode};
use worker::{CacheController, ControllerSettings, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "offline-shell")]
#[command(about = "Offline cache controller for an installable math-practice web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-shell.yaml, then $XDG_CONFIG_HOME/offline-shell/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database (overrides storage.path)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Keep caches in memory for this run only
  #[arg(long, conflicts_with = "db")]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Populate the shell store with the boot assets
  Install,

  /// Sweep stale cache generations and take control
  Activate,

  /// Send one request through the controller
  Fetch {
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Issue the request as a top-level document load
    #[arg(long)]
    navigate: bool,

    /// Write the response body to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// Post a control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { data: String },

  /// Read newline-delimited JSON host events from stdin
  Events,

  /// Show lifecycle state and cache stores
  Status,
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = Config::data_dir()?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::never(&log_dir, "offline-shell.log");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| "offline_shell=info".into()),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging()?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(db) = args.db {
    config.storage.path = Some(db);
  }

  if args.ephemeral {
    run(&config, Arc::new(MemoryStorage::new()), args.command).await
  } else {
    let path = config.database_path()?;
    info!(path = %path.display(), "opening cache database");
    run(&config, Arc::new(SqliteStorage::open(&path)?), args.command).await
  }
}

async fn run<S: CacheStorage>(config: &Config, storage: Arc<S>, command: Command) -> Result<()> {
  let fetcher = Arc::new(HttpFetcher::new(config)?);
  let settings = ControllerSettings::from_config(config)?;
  let origin = settings.origin.clone();

  let controller = CacheController::new(
    settings,
    CacheStore::new(Arc::clone(&storage), config.shell.name.clone()),
    CacheStore::new(Arc::clone(&storage), config.runtime_cache.clone()),
    Arc::clone(&fetcher),
  )?;
  let host = WorkerHost::new(controller, fetcher);

  match command {
    Command::Install => print_reply(&host.dispatch(HostEvent::Install).await?)?,
    Command::Activate => print_reply(&host.dispatch(HostEvent::Activate).await?)?,
    Command::Fetch {
      url,
      method,
      navigate,
      output,
    } => {
      // Relative paths resolve against the origin
      let url = origin
        .join(&url)
        .map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
      let mode = if navigate {
        RequestMode::Navigate
      } else {
        RequestMode::default()
      };
      let request = FetchRequest::get(url).with_method(&method).with_mode(mode);
      let reply = host.fetch(request).await;
      if let (Some(path), HostReply::Response { body, .. }) = (&output, &reply) {
        std::fs::write(path, body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
      }
      print_reply(&reply)?;
    }
    Command::Message { data } => {
      let data: Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Invalid message JSON: {}", e))?;
      print_reply(&host.dispatch(HostEvent::Message { data }).await?)?;
    }
    Command::Events => {
      let mut events = EventSource::new(BufReader::new(tokio::io::stdin()));
      let mut stdout = tokio::io::stdout();
      host.serve(&mut events, &mut stdout).await?;
    }
    Command::Status => print_status(host.worker(), storage.as_ref(), &origin)?,
  }

  // Let background cache writes land before the process exits
  host.settle().await;
  Ok(())
}

fn print_reply(reply: &HostReply) -> Result<()> {
  let json =
    serde_json::to_string_pretty(reply).map_err(|e| eyre!("Failed to encode reply: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn print_status<S, N>(
  worker: &CacheController<S, N>,
  storage: &S,
  origin: &Url,
) -> Result<()>
where
  S: CacheStorage,
  N: network::Fetcher,
{
  println!("origin:      {}", origin);
  println!("state:       {}", worker.state());
  println!("controlling: {}", worker.lifecycle().is_controlling());
  println!("shell:       {}", worker.shell().name());
  println!("runtime:     {}", worker.runtime().name());
  println!(
    "active:      {}",
    storage.active_version()?.as_deref().unwrap_or("-")
  );
  println!("stores:");
  for name in storage.keys()? {
    let entries = storage.entry_keys(&name)?;
    println!("  {:<24} {} entries", name, entries.len());
  }
  Ok(())
}
