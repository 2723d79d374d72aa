//! The device lifecycle coordinator.
//!
//! Owns the runtime device map and the per-device locks, drives
//! connect/disconnect/forget against BlueZ and PulseAudio, runs the
//! sink poller and the idle-mode engine, and publishes every state
//! transition on the event bus.
//!
//! Concurrency shape: quick state lives behind `parking_lot` mutexes
//! (never held across an await); per-device operations serialize on a
//! `tokio::sync::Mutex` per address; everything long-running is a task
//! cancelled through the shutdown token.

mod events;
mod ops;
mod poller;
mod scan;
mod startup;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex as PMutex;
use tokio::sync::{mpsc, Mutex as TMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use btaudio_bluez::{BluezAdapter, DeviceSignal, PairingAgent};
use btaudio_core::{
    Address, DeviceState, Event, PersistedDevice, RuntimeDevice, SinkState,
};
use btaudio_media::{AvrcpSignal, AvrcpWatch, HfpBlock, MprisPlayer};
use btaudio_mpd::MpdSupervisor;
use btaudio_pulse::{KeepAlive, PulseClient, SinkMonitor};

use crate::context::Context;
use crate::idle::IdlePhase;
use crate::reconnect::ReconnectController;

/// How long an AVRCP property change identifies the source device for
/// MPRIS command routing.
const AVRCP_DEVICE_WINDOW: Duration = Duration::from_secs(2);
/// Cooldown after a fruitless AVRCP player search.
const AVRCP_SEARCH_COOLDOWN: Duration = Duration::from_secs(60);
/// Consecutive poll ticks a connected device's sink may stay absent
/// (after having been seen) before the link is recycled.
const ABSENT_TICKS_BEFORE_RECYCLE: u32 = 2;

/// Everything the coordinator tracks about one device.
pub(crate) struct DeviceEntry {
    pub runtime: RuntimeDevice,
    pub phase: IdlePhase,
    /// BlueZ property-signal pump; aborted on forget.
    pub monitor: Option<JoinHandle<()>>,
    pub avrcp: Option<AvrcpWatch>,
    pub avrcp_cooldown_until: Option<Instant>,
    pub suspend_timer: Option<JoinHandle<()>>,
    pub auto_disconnect_timer: Option<JoinHandle<()>>,
    /// We suspended the sink (power-save), so we resume it on teardown.
    pub suspended_by_us: bool,
    /// Sink observed at least once since this connection came up.
    pub sink_seen: bool,
    pub absent_ticks: u32,
}

impl DeviceEntry {
    fn new(runtime: RuntimeDevice) -> Self {
        Self {
            runtime,
            phase: IdlePhase::default(),
            monitor: None,
            avrcp: None,
            avrcp_cooldown_until: None,
            suspend_timer: None,
            auto_disconnect_timer: None,
            suspended_by_us: false,
            sink_seen: false,
            absent_ticks: 0,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.suspend_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.auto_disconnect_timer.take() {
            timer.abort();
        }
    }
}

pub(crate) struct ScanState {
    pub task: Option<JoinHandle<()>>,
    pub until: Option<Instant>,
}

pub(crate) struct Inner {
    pub ctx: Context,
    pub adapter: BluezAdapter,
    // registration handle; dropped (unregistered) on shutdown
    pub agent: PMutex<Option<PairingAgent>>,
    pub player: TMutex<MprisPlayer>,
    pub hfp_block: TMutex<Option<HfpBlock>>,
    pub pulse: PulseClient,
    pub reconnect: ReconnectController,

    pub devices: PMutex<HashMap<Address, DeviceEntry>>,
    pub locks: PMutex<HashMap<Address, Arc<TMutex<()>>>>,
    pub suppress_reconnect: PMutex<HashSet<Address>>,
    pub keepalives: TMutex<HashMap<Address, KeepAlive>>,
    pub mpds: TMutex<HashMap<Address, MpdSupervisor>>,
    pub mpd_volume_applied: PMutex<HashSet<Address>>,
    pub scan: PMutex<ScanState>,
    pub last_avrcp: PMutex<Option<(Address, Instant)>>,
    pub last_broadcast: PMutex<Option<Vec<RuntimeDevice>>>,

    pub signal_tx: mpsc::Sender<DeviceSignal>,
    pub avrcp_tx: mpsc::Sender<AvrcpSignal>,
    pub mpd_fail_tx: mpsc::Sender<Address>,
    pub exit_tx: mpsc::Sender<i32>,
    pub shutdown: CancellationToken,

    pub sink_monitor: PMutex<Option<SinkMonitor>>,
    pub event_loop: PMutex<Option<JoinHandle<()>>>,
    pub poller: PMutex<Option<JoinHandle<()>>>,
}

/// Handle to the coordinator; cheap to clone into tasks.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

impl Coordinator {
    // -- entry helpers (never hold the map lock across an await) --

    pub(crate) fn with_entry<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&mut DeviceEntry) -> R,
    ) -> Option<R> {
        self.inner.devices.lock().get_mut(address).map(f)
    }

    /// Insert an entry for a device if none exists yet.
    pub(crate) fn ensure_entry(&self, address: &Address, name: String) {
        let mut devices = self.inner.devices.lock();
        devices
            .entry(address.clone())
            .or_insert_with(|| DeviceEntry::new(RuntimeDevice::new(address.clone(), name)));
    }

    pub(crate) fn attach_persisted(&self, device: &PersistedDevice) {
        let mut devices = self.inner.devices.lock();
        let entry = devices
            .entry(device.address.clone())
            .or_insert_with(|| {
                DeviceEntry::new(RuntimeDevice::new(device.address.clone(), device.name.clone()))
            });
        entry.runtime.name = device.name.clone();
        entry.runtime.persisted = Some(device.clone());
    }

    pub(crate) fn device_lock(&self, address: &Address) -> Arc<TMutex<()>> {
        self.inner
            .locks
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(TMutex::new(())))
            .clone()
    }

    pub(crate) fn is_connected(&self, address: &Address) -> bool {
        self.with_entry(address, |e| e.runtime.connected)
            .unwrap_or(false)
    }

    pub(crate) fn is_transitioning(&self, address: &Address) -> bool {
        self.with_entry(address, |e| e.runtime.transitioning)
            .unwrap_or(false)
    }

    pub(crate) fn avrcp_enabled(&self, address: &Address) -> bool {
        self.with_entry(address, |e| {
            e.runtime
                .persisted
                .as_ref()
                .map(|p| p.avrcp_enabled)
                .unwrap_or(true)
        })
        .unwrap_or(true)
    }

    /// Snapshot of every runtime device, address-ordered.
    pub fn devices_snapshot(&self) -> Vec<RuntimeDevice> {
        let devices = self.inner.devices.lock();
        let mut out: Vec<RuntimeDevice> =
            devices.values().map(|e| e.runtime.clone()).collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }

    /// Publish `devices_changed` if the snapshot differs from the last
    /// published one.
    pub(crate) fn broadcast_devices(&self) {
        let snapshot = self.devices_snapshot();
        let mut last = self.inner.last_broadcast.lock();
        if last.as_ref() == Some(&snapshot) {
            return;
        }
        *last = Some(snapshot.clone());
        self.inner.ctx.bus.publish(Event::DevicesChanged {
            devices: snapshot,
        });
    }

    // -- resource teardown shared by disconnect / forget / shutdown --

    /// Stop the keep-alive, the MPD supervisor, and any timers for one
    /// device; resume the sink if we suspended it.
    pub(crate) async fn teardown_device_resources(&self, address: &Address) {
        let suspended = self
            .with_entry(address, |e| {
                e.cancel_timers();
                std::mem::take(&mut e.suspended_by_us)
            })
            .unwrap_or(false);

        if let Some(keepalive) = self.inner.keepalives.lock().await.remove(address) {
            keepalive.stop().await;
        }
        self.with_entry(address, |e| e.runtime.keep_alive_active = false);

        if let Some(mpd) = self.inner.mpds.lock().await.remove(address) {
            mpd.stop().await;
        }
        self.with_entry(address, |e| e.runtime.mpd_running = false);
        self.inner.mpd_volume_applied.lock().remove(address);

        if suspended {
            if let Ok(Some(sink)) = self.inner.pulse.sink_for_address(address).await {
                if let Err(e) = self.inner.pulse.resume_sink(&sink.name).await {
                    debug!(%address, error = %e, "resume during teardown failed");
                }
            }
        }
    }

    /// Record a connection in the runtime entry. `sink_seen` and the
    /// absent-tick counter are reset when the connect operation starts,
    /// not here — step 7 of the connect sequence may already have
    /// observed the sink.
    pub(crate) fn mark_connected(&self, address: &Address) {
        self.with_entry(address, |e| {
            e.runtime.connected = true;
            e.runtime.present_in_bluez = true;
            e.runtime.state = DeviceState::Connected;
            e.runtime.last_connected_at = Some(Utc::now());
        });
    }

    /// Record a disconnection in the runtime entry.
    pub(crate) fn mark_disconnected(&self, address: &Address) {
        self.with_entry(address, |e| {
            e.runtime.connected = false;
            e.runtime.state = DeviceState::Discovered;
            e.runtime.sink_state = SinkState::Absent;
            e.runtime.last_disconnected_at = Some(Utc::now());
            e.phase = IdlePhase::IdleDefault;
            e.sink_seen = false;
            e.absent_ticks = 0;
        });
    }

    /// Adapter descriptors for `list-adapters`.
    pub async fn list_adapters(&self) -> btaudio_core::Result<Vec<btaudio_bluez::AdapterInfo>> {
        self.inner.adapter.list_all().await
    }

    pub async fn get_settings(&self) -> btaudio_core::GlobalSettings {
        self.inner.ctx.store.get_settings().await
    }

    pub async fn put_settings(
        &self,
        patch: &btaudio_core::SettingsPatch,
    ) -> btaudio_core::Result<btaudio_core::GlobalSettings> {
        self.inner.ctx.store.put_settings(patch).await
    }

    /// Attach a bus subscriber (control API pass-through).
    pub fn subscribe(&self, replay: btaudio_bus::Replay) -> btaudio_bus::Subscription {
        self.inner.ctx.bus.subscribe(replay)
    }

    /// Request process exit with the given code; main handles teardown.
    pub(crate) fn request_exit(&self, code: i32) {
        if self.inner.exit_tx.try_send(code).is_err() {
            warn!(code, "exit already requested");
        }
    }

    /// Graceful teardown, reverse order of startup.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        if let Some(task) = self.inner.poller.lock().take() {
            task.abort();
        }
        {
            let mut scan = self.inner.scan.lock();
            if let Some(task) = scan.task.take() {
                task.abort();
            }
            scan.until = None;
        }

        let addresses: Vec<Address> = self.inner.devices.lock().keys().cloned().collect();
        for address in &addresses {
            self.teardown_device_resources(address).await;
        }
        self.inner.reconnect.cancel_all();

        let monitor = self.inner.sink_monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        if let Some(task) = self.inner.event_loop.lock().take() {
            task.abort();
        }

        {
            let mut devices = self.inner.devices.lock();
            for entry in devices.values_mut() {
                if let Some(monitor) = entry.monitor.take() {
                    monitor.abort();
                }
                entry.avrcp = None;
            }
        }

        if let Some(mut block) = self.inner.hfp_block.lock().await.take() {
            block.unregister().await;
        }
        self.inner.player.lock().await.unregister().await;
        drop(self.inner.agent.lock().take());

        debug!("coordinator shut down");
    }
}
