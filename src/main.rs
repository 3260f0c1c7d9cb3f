mod cache;
mod classify;
mod config;
mod control;
mod dispatcher;
mod engine;
mod fallback;
mod http;
mod lifecycle;
mod retry;
mod strategy;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use control::ControlMessage;
use engine::Engine;
use http::{Destination, HttpClient, Network, OfflineNetwork, Request};
use retry::RetryStorage;

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "An offline-first caching proxy with per-category strategies")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./cachegate.yaml, then $XDG_CONFIG_HOME/cachegate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep every store in memory instead of the SQLite database
  #[arg(long)]
  ephemeral: bool,

  /// Treat the network as unreachable
  #[arg(long)]
  offline: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send one request through the engine and print the response
  Fetch {
    /// Absolute URL or a path relative to the configured origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Declared destination (document, script, style, image, font, audio)
    #[arg(long)]
    dest: Option<Destination>,
    #[arg(long)]
    accept: Option<String>,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// Open the declared stores and warm them
  Install,
  /// Delete stores left by other versions
  Activate,
  /// Print the entry count of every store
  Stats,
  /// Remove every entry of a store
  Clean { store: String },
  /// Trim a store down to a soft limit
  Purge { store: String, limit: usize },
  /// Replay queued mutating requests
  Replay,
  /// Send a raw control message, e.g. '{"type":"GET_CACHE_STATS"}'
  Control { message: String },
  /// Print the category and strategy a URL maps to
  Classify {
    url: String,
    #[arg(long)]
    dest: Option<Destination>,
  },
}

/// Initialize the tracing subscriber. Logs go to `log_file` when given, else stderr.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let Some(path) = log_file else {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(io::stderr))
      .with(filter)
      .init();
    return Ok(None);
  };

  let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  std::fs::create_dir_all(directory)
    .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(directory, file_name));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();
  Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file.as_deref())?;

  let config = config::Config::load(args.config.as_deref())?;

  let network: Arc<dyn Network> = if args.offline {
    Arc::new(OfflineNetwork)
  } else {
    Arc::new(HttpClient::new(config.fetch_timeout())?)
  };

  if args.ephemeral {
    run(config, MemoryStorage::new(), network, args.command).await
  } else {
    let path = config.database_path()?;
    info!(database = %path.display(), "opening cache");
    run(config, SqliteStorage::open(&path)?, network, args.command).await
  }
}

async fn run<S: CacheStorage + RetryStorage>(
  config: config::Config,
  storage: S,
  network: Arc<dyn Network>,
  command: Command,
) -> Result<()> {
  let engine = Engine::new(config, Arc::new(storage), network)?;

  match command {
    Command::Fetch {
      url,
      method,
      dest,
      accept,
      data,
    } => {
      let mut request = Request::new(&method, target(&engine, &url)?);
      if let Some(dest) = dest {
        request = request.with_destination(dest);
      }
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }
      if let Some(data) = data {
        request = request.with_body(data.into_bytes());
      }

      let delivery = engine.handle(request).await?;
      eprintln!(
        "{} ({}, {})",
        delivery.response.status, delivery.category, delivery.source
      );
      for (name, value) in &delivery.response.headers {
        eprintln!("{}: {}", name, value);
      }
      io::stdout()
        .write_all(&delivery.response.body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
    }
    Command::Install => {
      let report = engine.install().await?;
      println!("warmed {}, failed {}", report.warmed, report.failed);
    }
    Command::Activate => {
      let report = engine.activate().await?;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      println!("{} store(s) kept", report.kept.len());
    }
    Command::Stats => {
      for (name, count) in engine.stats()? {
        println!("{:<24} {}", name, count);
      }
    }
    Command::Clean { store } => {
      let existed = engine.clean_store(&store)?;
      println!("{} {}", store, if existed { "cleaned" } else { "did not exist" });
    }
    Command::Purge { store, limit } => {
      let removed = engine.lifecycle().purge(&store, limit)?;
      println!("removed {} entr{} from {}", removed, if removed == 1 { "y" } else { "ies" }, store);
    }
    Command::Replay => {
      let report = engine.connectivity_restored().await?;
      println!(
        "replayed {}, failed {}, remaining {}",
        report.replayed, report.failed, report.remaining
      );
    }
    Command::Control { message } => {
      let reply = engine.control(ControlMessage::parse(&message)?).await;
      println!("{}", reply.to_json()?);
    }
    Command::Classify { url, dest } => {
      let mut request = Request::get(target(&engine, &url)?);
      if let Some(dest) = dest {
        request = request.with_destination(dest);
      }
      let category = engine.classify(&request);
      println!("{} {}", category, engine.strategy_for(category));
    }
  }

  Ok(())
}

/// Absolute URLs are taken as-is; anything else is resolved against the origin.
fn target<S: CacheStorage + RetryStorage>(engine: &Engine<S>, url: &str) -> Result<Url> {
  match Url::parse(url) {
    Ok(url) => Ok(url),
    Err(_) => engine.config().resolve(url),
  }
}
