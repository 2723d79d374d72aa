//! MPD process supervision.
//!
//! One supervisor per connected device with MPD enabled: writes the
//! config, spawns `mpd --no-daemon`, keeps a control client connected,
//! and restarts the daemon on crashes — up to three times inside a
//! minute, after which it reports failure and leaves the device alone.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use btaudio_core::{Address, Error, Result};

use crate::client::MpdClient;
use crate::config::MpdLayout;

const CLIENT_CONNECT_ATTEMPTS: u32 = 5;
const CLIENT_CONNECT_DELAY: Duration = Duration::from_millis(500);
const RESTART_LIMIT: u32 = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Transport commands bridged from AVRCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
}

struct Shared {
    client: Mutex<Option<MpdClient>>,
}

/// A running per-device MPD instance.
pub struct MpdSupervisor {
    address: Address,
    port: u16,
    layout: MpdLayout,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

impl MpdSupervisor {
    /// Write the config, start the daemon, and connect the control
    /// client. `on_failure` is signalled with the device address when
    /// the restart budget is exhausted.
    pub async fn start(
        address: Address,
        port: u16,
        display_name: &str,
        sink_name: &str,
        data_dir: &Path,
        on_failure: mpsc::Sender<Address>,
    ) -> Result<Self> {
        let layout = MpdLayout::new(data_dir, &address);
        tokio::fs::create_dir_all(layout.music_dir())
            .await
            .map_err(|e| Error::MpdFailed {
                address: address.to_string(),
                detail: format!("cannot create {}: {e}", layout.music_dir().display()),
            })?;
        let conf = layout.render(port, display_name, sink_name);
        tokio::fs::write(layout.conf_file(), conf)
            .await
            .map_err(|e| Error::MpdFailed {
                address: address.to_string(),
                detail: format!("cannot write config: {e}"),
            })?;

        let child = spawn_daemon(&address, &layout).await?;
        let client = connect_client(&address, port).await?;
        info!(%address, port, "MPD started");

        let shared = Arc::new(Shared {
            client: Mutex::new(Some(client)),
        });
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor_loop(
            address.clone(),
            port,
            layout.clone(),
            child,
            Arc::clone(&shared),
            cancel.clone(),
            on_failure,
        ));
        Ok(Self {
            address,
            port,
            layout,
            shared,
            cancel,
            monitor,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route an AVRCP transport command to the daemon.
    pub async fn handle_command(&self, command: TransportCommand) {
        let mut guard = self.shared.client.lock().await;
        if !ensure_client(&mut guard, &self.address, self.port).await {
            return;
        }
        let Some(client) = guard.as_mut() else {
            return;
        };
        let result = match command {
            TransportCommand::Play => client.play().await,
            TransportCommand::Pause => client.pause().await,
            TransportCommand::PlayPause => client.play_pause().await,
            TransportCommand::Stop => client.stop().await,
            TransportCommand::Next => client.next().await,
            TransportCommand::Previous => client.previous().await,
        };
        if let Err(e) = result {
            warn!(address = %self.address, ?command, error = %e, "MPD command failed");
            *guard = None;
        }
    }

    /// Sync the daemon's volume to the hardware level.
    pub async fn set_volume(&self, pct: u8) {
        let mut guard = self.shared.client.lock().await;
        if !ensure_client(&mut guard, &self.address, self.port).await {
            return;
        }
        let Some(client) = guard.as_mut() else {
            return;
        };
        if let Err(e) = client.set_volume(pct).await {
            debug!(address = %self.address, error = %e, "MPD set_volume failed");
            *guard = None;
        }
    }

    /// Gracefully stop the daemon and remove transient files.
    pub async fn stop(self) {
        self.cancel.cancel();
        {
            let mut guard = self.shared.client.lock().await;
            if let Some(mut client) = guard.take() {
                let _ = client.kill().await;
            }
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, self.monitor)
            .await
            .is_err()
        {
            warn!(address = %self.address, "MPD monitor did not stop within grace");
        }
        let _ = tokio::fs::remove_file(self.layout.conf_file()).await;
        let _ = tokio::fs::remove_file(self.layout.pid_file()).await;
        info!(address = %self.address, "MPD stopped");
    }
}

async fn ensure_client(
    guard: &mut Option<MpdClient>,
    address: &Address,
    port: u16,
) -> bool {
    if let Some(client) = guard.as_mut() {
        if client.ping().await.is_ok() {
            return true;
        }
        *guard = None;
    }
    match MpdClient::connect(port).await {
        Ok(client) => {
            *guard = Some(client);
            true
        }
        Err(e) => {
            debug!(%address, port, error = %e, "MPD client reconnect failed");
            false
        }
    }
}

async fn spawn_daemon(address: &Address, layout: &MpdLayout) -> Result<Child> {
    let mut child = Command::new("mpd")
        .arg("--no-daemon")
        .arg("--stderr")
        .arg(layout.conf_file())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::MpdFailed {
            address: address.to_string(),
            detail: format!("spawn mpd: {e}"),
        })?;
    // forward the daemon's stderr into our log
    if let Some(stderr) = child.stderr.take() {
        let address = address.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.is_empty() {
                    info!(%address, "[mpd] {line}");
                }
            }
        });
    }
    Ok(child)
}

async fn connect_client(address: &Address, port: u16) -> Result<MpdClient> {
    let mut last_err = None;
    for attempt in 0..CLIENT_CONNECT_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(CLIENT_CONNECT_DELAY).await;
        }
        match MpdClient::connect(port).await {
            Ok(client) => return Ok(client),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::MpdFailed {
        address: address.to_string(),
        detail: "client connect failed".into(),
    }))
}

async fn monitor_loop(
    address: Address,
    port: u16,
    layout: MpdLayout,
    mut child: Child,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    on_failure: mpsc::Sender<Address>,
) {
    let mut crashes: Vec<Instant> = Vec::new();
    loop {
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                // give the daemon a moment to honor the kill command,
                // then make sure it is gone
                match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.kill().await;
                    }
                }
                return;
            }
            status = child.wait() => status,
        };
        if cancel.is_cancelled() {
            return;
        }
        warn!(%address, ?status, "MPD exited unexpectedly");
        *shared.client.lock().await = None;

        let now = Instant::now();
        crashes.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
        crashes.push(now);
        if crashes.len() as u32 > RESTART_LIMIT {
            warn!(%address, "MPD crashed more than {RESTART_LIMIT} times in {}s, giving up", RESTART_WINDOW.as_secs());
            let _ = on_failure.send(address.clone()).await;
            return;
        }

        match spawn_daemon(&address, &layout).await {
            Ok(new_child) => {
                child = new_child;
                match connect_client(&address, port).await {
                    Ok(client) => {
                        *shared.client.lock().await = Some(client);
                        info!(%address, restart = crashes.len(), "MPD restarted");
                    }
                    Err(e) => {
                        warn!(%address, error = %e, "MPD restarted but client connect failed");
                    }
                }
            }
            Err(e) => {
                warn!(%address, error = %e, "MPD respawn failed");
                let _ = on_failure.send(address.clone()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires the mpd binary"]
    async fn start_and_stop_real_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let address = Address::parse("AA:BB:CC:DD:EE:01").unwrap();
        if let Ok(supervisor) = MpdSupervisor::start(
            address,
            6600,
            "Test Speaker",
            "bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink",
            dir.path(),
            tx,
        )
        .await
        {
            supervisor.stop().await;
        }
    }
}
