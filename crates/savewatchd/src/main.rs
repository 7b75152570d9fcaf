//! savewatchd - VRChat save-data telemetry daemon.
//!
//! Tails VRChat output logs, extracts save-data events and writes them to
//! InfluxDB. Read offsets are persisted so a restart resumes where the
//! previous run stopped.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use savewatch_core::offsets::{OffsetStore, autosave};
use savewatch_core::parser::timestamp::resolve_timezone;
use savewatch_core::sink::{InfluxConfig, InfluxSink, Sink};
use savewatch_core::supervisor::{Supervisor, SupervisorConfig};
use savewatch_core::watcher::WatcherSettings;

/// VRChat log directory relative to the user's home.
const VRCHAT_LOG_SUBDIR: &str = "AppData/LocalLow/VRChat/VRChat";

/// VRChat save-data telemetry daemon.
#[derive(Parser, Debug)]
#[command(name = "savewatchd", about = "VRChat save-data telemetry daemon", version = savewatch_core::VERSION)]
struct Args {
    /// InfluxDB base URL, e.g. http://localhost:8086.
    #[arg(long, env = "INFLUX_URL")]
    influx_url: String,

    /// InfluxDB API token.
    #[arg(long, env = "INFLUX_TOKEN", hide_env_values = true)]
    influx_token: String,

    #[arg(long, env = "INFLUX_ORG")]
    influx_org: String,

    #[arg(long, env = "INFLUX_BUCKET")]
    influx_bucket: String,

    /// Directory containing output_log_*.txt files.
    /// Defaults to ~/AppData/LocalLow/VRChat/VRChat.
    #[arg(long, env = "VRCHAT_LOG_DIR", value_name = "PATH")]
    log_dir: Option<PathBuf>,

    /// IANA zone of the timestamps written in the logs (default Asia/Tokyo).
    #[arg(long, env = "TZ")]
    timezone: Option<String>,

    /// Where read offsets are persisted.
    #[arg(long, env = "SAVEWATCH_OFFSET_FILE", default_value = "offsets.json")]
    offset_file: PathBuf,

    /// Directory rescan interval in seconds.
    #[arg(long, env = "SAVEWATCH_SCAN_INTERVAL", default_value = "10")]
    scan_interval: u64,

    /// Offset autosave interval in seconds; 0 saves only at shutdown.
    #[arg(long, env = "SAVEWATCH_SAVE_INTERVAL", default_value = "60")]
    save_interval: u64,

    /// Seconds without a new line before a watcher stops.
    #[arg(long, env = "SAVEWATCH_IDLE_TIMEOUT", default_value = "3600")]
    idle_timeout: u64,

    /// Directory for the per-run diagnostic log file.
    #[arg(long, env = "SAVEWATCH_DIAG_DIR", default_value = "logs")]
    diag_dir: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn supervisor_config(&self) -> SupervisorConfig {
        let log_dir = self.log_dir.clone().unwrap_or_else(default_log_dir);
        SupervisorConfig {
            scan_interval: Duration::from_secs(self.scan_interval.max(1)),
            watcher: WatcherSettings {
                idle_timeout: Duration::from_secs(self.idle_timeout),
                ..WatcherSettings::default()
            },
            timezone: resolve_timezone(self.timezone.as_deref()),
            ..SupervisorConfig::new(log_dir)
        }
    }

    fn influx_config(&self) -> InfluxConfig {
        InfluxConfig {
            url: self.influx_url.clone(),
            token: self.influx_token.clone(),
            org: self.influx_org.clone(),
            bucket: self.influx_bucket.clone(),
        }
    }

    fn save_every(&self) -> Option<Duration> {
        (self.save_interval > 0).then(|| Duration::from_secs(self.save_interval))
    }
}

/// `~/AppData/LocalLow/VRChat/VRChat`, home taken from USERPROFILE or HOME.
fn default_log_dir() -> PathBuf {
    let home = std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_default();
    home.join(VRCHAT_LOG_SUBDIR)
}

/// Per-run diagnostic log file name.
fn diag_file_path(dir: &Path, started: chrono::DateTime<chrono::Local>) -> PathBuf {
    dir.join(format!("{}.log", started.format("%Y%m%d_%H%M%S")))
}

/// Initializes tracing: stderr output plus a plain-text copy in `diag_dir`.
/// Default level is INFO. Use -q for quiet mode (errors only).
///
/// Returns the diagnostic file path, or the error that prevented creating it.
fn init_logging(verbose: u8, quiet: bool, diag_dir: &Path) -> Result<PathBuf, std::io::Error> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["savewatchd", "savewatch_core"] {
        if let Ok(directive) = format!("{target}={level}").parse() {
            filter = filter.add_directive(directive);
        }
    }

    let path = diag_file_path(diag_dir, chrono::Local::now());
    let diag_file = std::fs::create_dir_all(diag_dir).and_then(|()| File::create(&path));
    let file_layer = diag_file.as_ref().ok().and_then(|file| {
        let file = file.try_clone().ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    diag_file.map(|_| path)
}

fn main() -> ExitCode {
    // `.env` values fill in variables the real environment does not set.
    let dotenv = dotenvy::dotenv();
    let args = Args::parse();

    match init_logging(args.verbose, args.quiet, &args.diag_dir) {
        Ok(path) => info!(path = %path.display(), "diagnostic log file"),
        Err(e) => warn!(
            dir = %args.diag_dir.display(),
            error = %e,
            "diagnostic log file disabled"
        ),
    }
    match dotenv {
        Ok(path) => info!(path = %path.display(), "loaded environment file"),
        Err(e) if e.not_found() => debug!("no .env file found"),
        Err(e) => warn!(error = %e, "failed to load .env file"),
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> ExitCode {
    info!(version = savewatch_core::VERSION, "savewatchd starting");

    let config = args.supervisor_config();
    info!(
        log_dir = %config.log_dir.display(),
        timezone = config.timezone.name(),
        offset_file = %args.offset_file.display(),
        scan_secs = config.scan_interval.as_secs(),
        save_secs = args.save_interval,
        idle_secs = config.watcher.idle_timeout.as_secs(),
        "config"
    );

    let sink = match InfluxSink::new(args.influx_config()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "failed to create InfluxDB client");
            return ExitCode::FAILURE;
        }
    };
    info!(url = %args.influx_url, bucket = sink.bucket(), "InfluxDB sink ready");

    let offsets = Arc::new(OffsetStore::load(&args.offset_file));
    let supervisor = Supervisor::new(config, offsets.clone(), sink.clone());

    let periodic_save = args
        .save_every()
        .map(|every| tokio::spawn(autosave(offsets.clone(), every)));

    tokio::select! {
        _ = supervisor.run() => {}
        _ = shutdown_signal() => info!("Received shutdown signal"),
    }

    info!("Shutting down...");
    if let Some(task) = periodic_save {
        task.abort();
        let _ = task.await;
    }
    supervisor.shutdown().await;
    // final save, after every other writer of the store has stopped
    offsets.save();
    sink.close().await;
    info!("Shutdown complete");
    ExitCode::SUCCESS
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
