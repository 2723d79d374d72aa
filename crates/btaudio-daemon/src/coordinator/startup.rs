//! Startup sequence.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as PMutex;
use tokio::sync::{mpsc, Mutex as TMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use btaudio_bluez::{BluezAdapter, PairingAgent};
use btaudio_core::{Address, DeviceState, Result};
use btaudio_media::{HfpBlock, MprisPlayer};
use btaudio_pulse::{PulseClient, SinkMonitor};

use crate::context::Context;
use crate::reconnect::ReconnectController;

use super::{Coordinator, Inner, ScanState};

impl Coordinator {
    /// Run the full startup sequence. A failure of any step aborts
    /// startup; resources acquired so far are released by drop.
    ///
    /// Returns the coordinator and the receiver on which an exit code
    /// is delivered when the daemon asks to terminate (restart command,
    /// adapter switch).
    pub async fn start(ctx: Context) -> Result<(Coordinator, mpsc::Receiver<i32>)> {
        // 1. the store is loaded by the caller (it is part of ctx)
        let settings = ctx.store.get_settings().await;

        // 2-3. connect to the bus, resolve the configured adapter
        let adapter = BluezAdapter::resolve(&settings.selected_adapter).await?;
        info!(adapter = adapter.name(), address = %adapter.address(), "using adapter");

        // 4. register agent and media player
        let agent = PairingAgent::register(adapter.session()).await?;
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let player = MprisPlayer::register(adapter.name(), media_tx).await?;

        // 5. block HFP unless a stored device needs it
        let hfp_block = if ctx.store.has_hfp_devices().await {
            info!("HFP-profile device stored, leaving HFP available");
            None
        } else {
            match HfpBlock::register(player.connection()).await {
                Ok(block) => Some(block),
                Err(e) => {
                    warn!(error = %e, "HFP blocking unavailable");
                    None
                }
            }
        };

        // 6. connect PulseAudio
        let pulse = PulseClient::connect().await?;

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let (avrcp_tx, avrcp_rx) = mpsc::channel(64);
        let (pulse_tx, pulse_rx) = mpsc::channel(64);
        let (mpd_fail_tx, mpd_fail_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let (reconnect, reconnect_rx) =
            ReconnectController::new(Arc::clone(&ctx.store), ctx.bus.clone());

        let coordinator = Coordinator {
            inner: Arc::new(Inner {
                ctx,
                adapter,
                agent: PMutex::new(Some(agent)),
                player: TMutex::new(player),
                hfp_block: TMutex::new(hfp_block),
                pulse,
                reconnect,
                devices: PMutex::new(Default::default()),
                locks: PMutex::new(Default::default()),
                suppress_reconnect: PMutex::new(Default::default()),
                keepalives: TMutex::new(Default::default()),
                mpds: TMutex::new(Default::default()),
                mpd_volume_applied: PMutex::new(Default::default()),
                scan: PMutex::new(ScanState {
                    task: None,
                    until: None,
                }),
                last_avrcp: PMutex::new(None),
                last_broadcast: PMutex::new(None),
                signal_tx,
                avrcp_tx,
                mpd_fail_tx,
                exit_tx,
                shutdown: CancellationToken::new(),
                sink_monitor: PMutex::new(None),
                event_loop: PMutex::new(None),
                poller: PMutex::new(None),
            }),
        };

        // 7. construct runtime entries for stored devices, purge stale
        //    BlueZ cache entries
        coordinator.adopt_stored_devices().await?;
        coordinator.purge_stale_bluez_devices().await;

        // 8. adopt devices connected at the BlueZ level but unmanaged
        coordinator.adopt_connected_unmanaged().await;

        // 9. sink poller and event monitor
        let monitor = SinkMonitor::spawn(coordinator.inner.pulse.clone(), pulse_tx);
        *coordinator.inner.sink_monitor.lock() = Some(monitor);
        let poller = tokio::spawn(super::poller::run(coordinator.clone()));
        *coordinator.inner.poller.lock() = Some(poller);

        // 10. reconnect controller bootstrap
        coordinator.inner.reconnect.bootstrap().await;

        // event loop before step 11 so post-connect setup sees signals
        let event_loop = tokio::spawn(super::events::run(
            coordinator.clone(),
            signal_rx,
            pulse_rx,
            media_rx,
            avrcp_rx,
            mpd_fail_rx,
            reconnect_rx,
        ));
        *coordinator.inner.event_loop.lock() = Some(event_loop);

        // 11. idle mode + MPD for devices that were already connected
        let connected: Vec<Address> = coordinator
            .inner
            .devices
            .lock()
            .values()
            .filter(|e| e.runtime.connected)
            .map(|e| e.runtime.address.clone())
            .collect();
        for address in connected {
            let lock = coordinator.device_lock(&address);
            let _guard = lock.lock().await;
            coordinator.apply_idle_mode(&address).await;
            coordinator.start_mpd_if_enabled(&address).await;
        }

        coordinator.broadcast_devices();
        info!("coordinator started");
        Ok((coordinator, exit_rx))
    }

    /// Create runtime entries (and signal monitors) for every stored
    /// device; detect the ones already connected from a previous run.
    async fn adopt_stored_devices(&self) -> Result<()> {
        for persisted in self.inner.ctx.store.devices().await {
            let address = persisted.address.clone();
            self.attach_persisted(&persisted);
            let device = match self.inner.adapter.device(&address) {
                Ok(device) => device,
                Err(e) => {
                    debug!(%address, error = %e, "stored device has no BlueZ object yet");
                    continue;
                }
            };
            let snapshot = device.snapshot().await;
            self.with_entry(&address, |e| {
                e.runtime.present_in_bluez = true;
                e.runtime.paired_in_bluez = snapshot.paired;
                e.runtime.rssi = snapshot.rssi;
                e.runtime.uuids = snapshot.uuids.clone();
            });
            match device.spawn_monitor(self.inner.signal_tx.clone()).await {
                Ok(handle) => {
                    self.with_entry(&address, |e| e.monitor = Some(handle));
                }
                Err(e) => debug!(%address, error = %e, "signal monitor failed"),
            }
            if snapshot.connected {
                info!(%address, "device already connected at startup");
                self.mark_connected(&address);
            }
        }
        Ok(())
    }

    /// Remove BlueZ-cached device objects that are neither stored nor
    /// connected — leftovers of old discovery sessions that would show
    /// as ghosts in the device list.
    async fn purge_stale_bluez_devices(&self) {
        let stored: HashSet<Address> = self
            .inner
            .ctx
            .store
            .devices()
            .await
            .into_iter()
            .map(|d| d.address)
            .collect();
        let addresses = match self.inner.adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!(error = %e, "cannot enumerate BlueZ devices for cleanup");
                return;
            }
        };
        for address in addresses {
            if stored.contains(&address) {
                continue;
            }
            let Ok(device) = self.inner.adapter.device(&address) else {
                continue;
            };
            let snapshot = device.snapshot().await;
            if snapshot.paired || snapshot.connected {
                continue;
            }
            if let Err(e) = self.inner.adapter.remove_device(&address).await {
                debug!(%address, error = %e, "stale device removal failed");
            } else {
                info!(%address, "removed stale cached device");
            }
        }
    }

    /// Devices connected at the BlueZ level but absent from the store
    /// (store wiped, or paired by another tool) get runtime entries so
    /// API operations work on them.
    async fn adopt_connected_unmanaged(&self) {
        let addresses = match self.inner.adapter.device_addresses().await {
            Ok(addresses) => addresses,
            Err(_) => return,
        };
        for address in addresses {
            if self.inner.devices.lock().contains_key(&address) {
                continue;
            }
            let Ok(device) = self.inner.adapter.device(&address) else {
                continue;
            };
            let snapshot = device.snapshot().await;
            if !snapshot.connected {
                continue;
            }
            info!(%address, "adopting connected unmanaged device");
            self.ensure_entry(
                &address,
                snapshot.name.clone().unwrap_or_else(|| address.to_string()),
            );
            self.with_entry(&address, |e| {
                e.runtime.present_in_bluez = true;
                e.runtime.paired_in_bluez = snapshot.paired;
                e.runtime.uuids = snapshot.uuids.clone();
                e.runtime.state = DeviceState::Connected;
                e.runtime.connected = true;
                e.runtime.last_connected_at = Some(Utc::now());
            });
            if let Ok(handle) = device.spawn_monitor(self.inner.signal_tx.clone()).await {
                self.with_entry(&address, |e| e.monitor = Some(handle));
            }
        }
    }
}
