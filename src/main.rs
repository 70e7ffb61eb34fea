//! OCR Worker - out-of-process text recognition
//!
//! Reads length-prefixed MessagePack requests from stdin and answers on stdout.
//! Logs go to stderr so they never corrupt the frame stream.

mod config;
mod protocol;
mod recognition;
mod service;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{RecognizerConfig, WorkerConfig};
use crate::recognition::{ModelManager, OcrsFactory, RecognitionManager};
use crate::service::{Dispatcher, ExitReason, IdleSupervisor, Service};

/// OCR worker side-process
#[derive(Parser, Debug)]
#[command(name = "ocr-worker")]
#[command(about = "Framed MessagePack OCR worker over stdin/stdout")]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `ocr_worker=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Release the recognizer after this many idle seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Config is read before logging exists; its problems are reported after init
    let (mut config, config_origin) = load_or_create_config(args.config.as_deref());

    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level));
    match config_origin {
        Ok(ConfigOrigin::Loaded(path)) => info!("Loaded configuration from {:?}", path),
        Ok(ConfigOrigin::Created(path)) => info!("Wrote default configuration to {:?}", path),
        Ok(ConfigOrigin::Defaults) => info!("Using default configuration"),
        Err(e) => warn!("Configuration problem, using defaults: {:#}", e),
    }

    if let Some(secs) = args.idle_timeout_secs {
        config.service.idle_timeout_secs = secs;
    }

    let factory = build_factory(&config.recognizer)?;
    let manager = Arc::new(RecognitionManager::with_idle_timeout(
        Box::new(factory),
        config.service.idle_timeout(),
    ));

    let stop = Arc::new(AtomicBool::new(false));
    let _supervisor = IdleSupervisor::spawn(
        manager.clone(),
        stop.clone(),
        config.service.idle_check_interval(),
    )
    .context("Failed to start idle supervisor")?;

    let dispatcher = Dispatcher::new(manager, stop.clone());
    let mut service = Service::with_max_frame_bytes(
        std::io::stdin().lock(),
        std::io::stdout().lock(),
        dispatcher,
        config.service.max_frame_bytes,
    );

    spawn_signal_handler(stop, service.dispatch_lock())
        .context("Failed to start signal handler")?;

    info!(
        "OCR worker ready (idle timeout {}s, max frame {} bytes)",
        config.service.idle_timeout_secs, config.service.max_frame_bytes
    );

    match service.run() {
        Ok(ExitReason::StreamClosed) => info!("OCR worker exiting: input closed"),
        Ok(ExitReason::ShutdownRequested) => info!("OCR worker exiting: shutdown requested"),
        Err(e) => {
            error!("OCR worker stopping on protocol fault: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// Install the stderr subscriber. `RUST_LOG` takes precedence over `fallback`.
fn init_logging(fallback: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

/// Where the active configuration came from
enum ConfigOrigin {
    Loaded(PathBuf),
    Created(PathBuf),
    Defaults,
}

/// Load configuration from `explicit` or the default location.
///
/// A missing default file is created with the defaults. The second value says where the
/// config came from, or why it was ignored.
fn load_or_create_config(
    explicit: Option<&std::path::Path>,
) -> (WorkerConfig, Result<ConfigOrigin>) {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match storage::default_config_path() {
            Ok(path) if path.exists() => path,
            Ok(path) => {
                let config = WorkerConfig::default();
                let origin = config::save_config(&config, &path)
                    .map(|()| ConfigOrigin::Created(path.clone()))
                    .with_context(|| format!("failed to write defaults to {:?}", path));
                return (config, origin);
            }
            Err(_) => return (WorkerConfig::default(), Ok(ConfigOrigin::Defaults)),
        },
    };

    match config::load_config(&path) {
        Ok(config) => (config, Ok(ConfigOrigin::Loaded(path))),
        Err(e) => (
            WorkerConfig::default(),
            Err(e.context(format!("failed to load {:?}", path))),
        ),
    }
}

fn build_factory(config: &RecognizerConfig) -> Result<OcrsFactory> {
    let models = match &config.models_dir {
        Some(dir) => ModelManager::with_dir(dir.clone())?,
        None => ModelManager::new()?,
    }
    .with_auto_download(config.auto_download);

    info!(
        "Model directory: {:?} (cached: {})",
        models.models_dir(),
        models.are_models_ready()
    );
    Ok(OcrsFactory::new(models))
}

/// SIGINT/SIGTERM: stop reading, let the in-flight request finish, then exit cleanly
fn spawn_signal_handler(stop: Arc<AtomicBool>, dispatch_lock: Arc<Mutex<()>>) -> Result<()> {
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!("Signal handling unavailable: {}", e);
                    return;
                }
            };

            if let Err(e) = rt.block_on(wait_for_signal()) {
                warn!("Signal handling unavailable: {}", e);
                return;
            }

            info!("Termination signal received");
            stop.store(true, Ordering::SeqCst);
            let _guard = dispatch_lock.lock();
            info!("OCR worker exiting on signal");
            std::process::exit(0);
        })?;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
