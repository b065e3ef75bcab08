use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use curio_sync::bus::{BusEvent, Filter};
use curio_sync::config::Config;
use curio_sync::location::LocationDecision;
use curio_sync::store::Record;
use curio_sync::Engine;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "curio-sync")]
#[command(about = "Offline-first location content cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/curio-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a cached record
  Read { id: String },
  /// Print the cached records of a region, refreshing it if stale
  Region {
    region: String,
    /// Wait this many seconds for the refresh before printing
    #[arg(long, default_value_t = 0)]
    wait: u64,
  },
  /// Replace the payload of a record
  Write { id: String, payload: String },
  /// Add a new record
  Create {
    id: String,
    region: String,
    payload: String,
  },
  /// Report a location and fetch the surrounding regions
  Locate {
    #[arg(allow_hyphen_values = true)]
    lat: f64,
    #[arg(allow_hyphen_values = true)]
    lon: f64,
    /// Horizontal accuracy in meters
    #[arg(long, default_value_t = 10.0)]
    accuracy: f64,
    #[arg(long, default_value_t = 30)]
    wait: u64,
  },
  /// Push pending changes and refresh stale regions
  Sync {
    #[arg(long, default_value_t = 60)]
    wait: u64,
  },
  /// Print change events as they happen
  Watch {
    #[arg(long, conflicts_with = "id")]
    region: Option<String>,
    #[arg(long)]
    id: Option<String>,
  },
}

/// Initialize logging to a daily rolling file, plus stderr when verbose.
/// The returned guard flushes the file writer when dropped.
fn init_tracing(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let file_appender = tracing_appender::rolling::daily(log_dir, "curio-sync.log");
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  // RUST_LOG overrides the default level (e.g., RUST_LOG=curio_sync=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(stderr_layer)
    .with(filter)
    .init();

  Ok(guard)
}

fn parse_payload(raw: &str) -> Result<serde_json::Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Payload is not valid JSON: {}", e))
}

fn print_record(record: &Record) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(record)?);
  Ok(())
}

async fn settle(engine: &Engine, wait: u64) {
  if wait > 0 && !engine.coordinator().wait_idle(Duration::from_secs(wait)).await {
    eprintln!("Still syncing after {wait}s; remaining work resumes on next start");
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(&Config::log_dir()?, args.verbose)?;
  info!(command = ?args.command, "curio-sync starting");

  let mut engine = Engine::open(&config)?;

  match args.command {
    Command::Read { id } => match engine.facade().read(&id)? {
      Some(record) => print_record(&record)?,
      None => return Err(eyre!("Record not found: {}", id)),
    },
    Command::Region { region, wait } => {
      engine.start()?;
      engine.facade().read_region(&region)?;
      settle(&engine, wait).await;
      for record in engine.facade().read_region(&region)? {
        print_record(&record)?;
      }
    }
    Command::Write { id, payload } => {
      engine.start()?;
      let record = engine.facade().write(&id, parse_payload(&payload)?)?;
      print_record(&record)?;
      settle(&engine, config.sync.request_timeout_secs).await;
    }
    Command::Create { id, region, payload } => {
      engine.start()?;
      let record = engine.facade().create(&id, &region, parse_payload(&payload)?)?;
      print_record(&record)?;
      settle(&engine, config.sync.request_timeout_secs).await;
    }
    Command::Locate {
      lat,
      lon,
      accuracy,
      wait,
    } => {
      engine.start()?;
      let timestamp_ms = chrono::Utc::now().timestamp_millis();
      match engine.location().on_location_update(lat, lon, accuracy, timestamp_ms) {
        LocationDecision::Ignored(reason) => {
          return Err(eyre!("Location ignored: {:?}", reason));
        }
        LocationDecision::Unchanged(cell) => println!("Cell {cell} is up to date"),
        LocationDecision::Triggered { cell, regions } => {
          println!("Cell {cell}: fetching {} regions", regions.len());
          settle(&engine, wait).await;
        }
      }
    }
    Command::Sync { wait } => {
      let resync = engine.start()?;
      println!("Pushing {} records, pulling {} regions", resync.pushes, resync.pulls);
      settle(&engine, wait).await;
    }
    Command::Watch { region, id } => {
      let filter = match (region, id) {
        (Some(region), _) => Filter::Region(region),
        (None, Some(id)) => Filter::Record(id),
        (None, None) => Filter::All,
      };
      let mut events = engine.facade().subscribe(filter);
      engine.start()?;

      loop {
        tokio::select! {
          event = events.next() => match event {
            Some(event) => print_event(&event),
            None => break,
          },
          _ = tokio::signal::ctrl_c() => break,
        }
      }
    }
  }

  engine.shutdown().await;
  Ok(())
}

fn print_event(event: &BusEvent) {
  match event {
    BusEvent::Change(change) => println!(
      "{:?} {} in {} (version {})",
      change.kind, change.id, change.region, change.new_version
    ),
    BusEvent::Conflict(conflict) => println!(
      "Conflict on {}: {:?} copy kept (remote version {})",
      conflict.id, conflict.winner, conflict.remote_version
    ),
    BusEvent::SyncFailed {
      scope,
      attempts,
      error,
    } => println!("Sync of {scope:?} failed after {attempts} attempts: {error}"),
    BusEvent::AuthRequired { scope, error } => {
      println!("Authentication required ({scope:?}): {error}")
    }
  }
}
