//! Sink event subscription.
//!
//! Runs `pactl subscribe` and, on every sink event, re-reads the sink
//! list to detect running/idle edges and volume changes. If the server
//! restarts, the subscription is re-established with exponential
//! backoff (1 s → 30 s).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use btaudio_core::SinkState;

use crate::client::PulseClient;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Edge-detected sink events delivered to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum PulseEvent {
    /// Audio started flowing on a sink.
    SinkRunning { sink: String },
    /// Audio stopped flowing (running → idle/suspended).
    SinkIdle { sink: String },
    /// A sink appeared.
    SinkAdded { sink: String },
    /// A sink went away.
    SinkRemoved { sink: String },
    /// Volume or mute changed on a sink.
    SinkVolume {
        sink: String,
        volume_pct: u32,
        mute: bool,
    },
}

/// The running monitor; cancel to stop.
pub struct SinkMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SinkMonitor {
    /// Spawn the monitor loop, delivering events into `tx`.
    pub fn spawn(client: PulseClient, tx: mpsc::Sender<PulseEvent>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor_loop(client, tx, token).await;
        });
        Self { cancel, handle }
    }

    /// Stop the loop and wait for it to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn monitor_loop(
    client: PulseClient,
    tx: mpsc::Sender<PulseEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match subscribe_once(&client, &tx, &cancel).await {
            Ok(()) => return, // cancelled cleanly
            Err(e) => {
                warn!(error = %e, "sink subscription lost, retrying in {}s", backoff.as_secs());
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

/// Run one `pactl subscribe` session until it dies or we are cancelled.
async fn subscribe_once(
    client: &PulseClient,
    tx: &mpsc::Sender<PulseEvent>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut child = client
        .pactl()
        .arg("subscribe")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("no stdout on pactl subscribe"))?;
    let mut lines = BufReader::new(stdout).lines();
    info!("sink event subscription started");

    // seed the state map so the first events produce correct edges
    let mut states: HashMap<String, SinkState> = HashMap::new();
    let mut volumes: HashMap<String, (u32, bool)> = HashMap::new();
    if let Ok(sinks) = client.list_bt_sinks().await {
        for sink in sinks {
            states.insert(sink.name.clone(), sink.state);
            volumes.insert(sink.name, (sink.volume_pct, sink.mute));
        }
    }

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(());
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Err(std::io::Error::other("pactl subscribe closed its stream"));
        };
        if !line.contains("on sink #") {
            continue;
        }
        // any sink event: re-list and diff
        let sinks = match client.list_bt_sinks().await {
            Ok(sinks) => sinks,
            Err(e) => {
                debug!(error = %e, "sink list during event handling failed");
                continue;
            }
        };
        let mut seen = std::collections::HashSet::new();
        for sink in &sinks {
            seen.insert(sink.name.clone());
            let prev = states.insert(sink.name.clone(), sink.state);
            match (prev, sink.state) {
                (None, _) => {
                    let _ = tx
                        .send(PulseEvent::SinkAdded {
                            sink: sink.name.clone(),
                        })
                        .await;
                }
                (Some(SinkState::Running), now) if now != SinkState::Running => {
                    let _ = tx
                        .send(PulseEvent::SinkIdle {
                            sink: sink.name.clone(),
                        })
                        .await;
                }
                (Some(prev), SinkState::Running) if prev != SinkState::Running => {
                    let _ = tx
                        .send(PulseEvent::SinkRunning {
                            sink: sink.name.clone(),
                        })
                        .await;
                }
                _ => {}
            }
            let vol = (sink.volume_pct, sink.mute);
            if let Some(prev_vol) = volumes.insert(sink.name.clone(), vol) {
                if prev_vol != vol {
                    let _ = tx
                        .send(PulseEvent::SinkVolume {
                            sink: sink.name.clone(),
                            volume_pct: sink.volume_pct,
                            mute: sink.mute,
                        })
                        .await;
                }
            }
        }
        let gone: Vec<String> = states
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            states.remove(&name);
            volumes.remove(&name);
            let _ = tx.send(PulseEvent::SinkRemoved { sink: name }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a running PulseAudio server"]
    async fn monitor_starts_and_stops() {
        let client = PulseClient::connect().await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let monitor = SinkMonitor::spawn(client, tx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.stop().await;
    }
}
