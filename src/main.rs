//! btaudiod — Bluetooth audio management daemon.
//!
//! Wires the pieces together: loads the store, initializes logging
//! (stdout plus the event-bus ring), runs the coordinator's startup
//! sequence, and waits for a shutdown signal or an exit request
//! (restart command, adapter switch). The exit code tells the
//! surrounding supervisor what to do next.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use btaudio_bus::EventBus;
use btaudio_core::{exit_code, Error};
use btaudio_daemon::{BusLayer, Context, ControlApi, Coordinator};
use btaudio_store::Store;

/// Grace period for outstanding tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const DEFAULT_DATA_DIR: &str = "/data";

fn data_dir() -> PathBuf {
    std::env::var("DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR))
}

/// `LOG_LEVEL` overrides the stored setting, at startup only.
fn init_logging(bus: &EventBus, stored_level: &str) {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| stored_level.to_string());
    let directive = match level.as_str() {
        "warning" => "warn",
        other => other,
    };
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(BusLayer::new(bus.clone()))
        .init();
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {e}");
            std::process::exit(exit_code::INIT_FAILED);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    let bus = EventBus::new();
    let data_dir = data_dir();

    let store = match Store::open(&data_dir, bus.clone()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("cannot load persistent store: {e}");
            return exit_code::INIT_FAILED;
        }
    };
    let settings = store.get_settings().await;
    init_logging(&bus, &settings.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "btaudiod starting"
    );

    let ctx = Context::new(store, bus, data_dir);
    let (coordinator, mut exit_rx) = match Coordinator::start(ctx).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "startup failed");
            return startup_exit_code(&e);
        }
    };

    // the in-process command surface; a transport crate or embedding
    // binary drives it from here
    let _api = ControlApi::new(coordinator.clone());

    let code = tokio::select! {
        code = exit_rx.recv() => {
            let code = code.unwrap_or(exit_code::OK);
            info!(code, "exit requested");
            code
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            exit_code::OK
        }
    };

    if tokio::time::timeout(SHUTDOWN_GRACE, coordinator.shutdown())
        .await
        .is_err()
    {
        warn!("shutdown exceeded grace period, abandoning remaining tasks");
    }
    info!("goodbye");
    code
}

fn startup_exit_code(err: &Error) -> i32 {
    match err {
        Error::DbusUnavailable(_) => exit_code::DBUS_UNAVAILABLE,
        Error::PulseUnavailable(_) => exit_code::PULSE_UNAVAILABLE,
        _ => exit_code::INIT_FAILED,
    }
}

async fn shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                // fall back to ctrl-c only
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
