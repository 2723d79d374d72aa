//! Discovery scans.
//!
//! A scan runs in the background for the configured duration; devices
//! appear incrementally through coalesced `devices_changed` events and
//! a `scan_finished` event closes it out. Starting a scan while one is
//! running restarts it.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use btaudio_core::{Address, Event, Result};

use super::Coordinator;

/// Coalesce window for device broadcasts while scanning.
const SCAN_BROADCAST_DEBOUNCE: Duration = Duration::from_secs(1);

impl Coordinator {
    /// Start (or restart) a background discovery scan. Returns the
    /// scan duration in seconds.
    pub async fn start_scan(&self) -> Result<u64> {
        let duration_s = self
            .inner
            .ctx
            .store
            .get_settings()
            .await
            .scan_duration_seconds;
        let duration = Duration::from_secs(duration_s);

        {
            let mut scan = self.inner.scan.lock();
            if let Some(task) = scan.task.take() {
                debug!("restarting in-flight scan");
                task.abort();
            }
            scan.until = Some(Instant::now() + duration);
        }
        self.inner
            .ctx
            .bus
            .publish(Event::ScanStarted { duration_s });

        let this = self.clone();
        let task = tokio::spawn(async move {
            let error = this.run_scan(duration).await.err().map(|e| e.to_string());
            {
                let mut scan = this.inner.scan.lock();
                scan.until = None;
                scan.task = None;
            }
            this.broadcast_devices();
            if let Some(error) = &error {
                warn!(error, "scan failed");
            } else {
                info!("scan finished");
            }
            this.inner.ctx.bus.publish(Event::ScanFinished { error });
        });
        self.inner.scan.lock().task = Some(task);
        Ok(duration_s)
    }

    /// Whether a scan is running, and how long it has left.
    pub fn scan_status(&self) -> (bool, Option<u64>) {
        let scan = self.inner.scan.lock();
        match scan.until {
            Some(until) => {
                let now = Instant::now();
                if now < until {
                    (true, Some(until.duration_since(now).as_secs()))
                } else {
                    (false, None)
                }
            }
            None => (false, None),
        }
    }

    /// Hold a filtered discovery session open for `duration`,
    /// surfacing discovered devices as runtime entries.
    async fn run_scan(&self, duration: Duration) -> Result<()> {
        let mut stream = self.inner.adapter.discover().await?;
        let deadline = Instant::now() + duration;
        let mut last_broadcast = Instant::now() - SCAN_BROADCAST_DEBOUNCE;

        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = self.inner.shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                bluer::AdapterEvent::DeviceAdded(raw) => {
                    let Ok(address) = Address::parse(&raw.to_string()) else {
                        continue;
                    };
                    self.adopt_discovered(&address).await;
                    if last_broadcast.elapsed() >= SCAN_BROADCAST_DEBOUNCE {
                        last_broadcast = Instant::now();
                        self.broadcast_devices();
                    }
                }
                bluer::AdapterEvent::DeviceRemoved(raw) => {
                    if let Ok(address) = Address::parse(&raw.to_string()) {
                        let stored = self
                            .with_entry(&address, |e| e.runtime.stored())
                            .unwrap_or(false);
                        if !stored {
                            self.inner.devices.lock().remove(&address);
                        } else {
                            self.with_entry(&address, |e| {
                                e.runtime.present_in_bluez = false;
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        // dropping the stream ends our discovery session
        drop(stream);
        Ok(())
    }

    /// Record a device surfaced by discovery.
    async fn adopt_discovered(&self, address: &Address) {
        let Ok(device) = self.inner.adapter.device(address) else {
            return;
        };
        let snapshot = device.snapshot().await;
        let name = snapshot
            .name
            .clone()
            .unwrap_or_else(|| address.to_string());
        self.ensure_entry(address, name);
        self.with_entry(address, |e| {
            e.runtime.present_in_bluez = true;
            e.runtime.paired_in_bluez = snapshot.paired;
            e.runtime.rssi = snapshot.rssi;
            e.runtime.uuids = snapshot.uuids.clone();
            if let Some(name) = snapshot.name.clone() {
                e.runtime.name = name;
            }
        });
        debug!(%address, "device discovered");
    }
}
