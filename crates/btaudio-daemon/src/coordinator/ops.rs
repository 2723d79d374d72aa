//! Device lifecycle operations.
//!
//! Every operation on one address serializes on that address's lock;
//! `pair`, `connect`, `disconnect`, `forget`, `force_reconnect` and
//! settings writes never interleave for the same device.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use btaudio_bluez::{uuids, BluezDevice};
use btaudio_core::{
    Address, AudioProfile, DevicePatch, DeviceState, Error, IdleMode, PersistedDevice, Result,
    SinkState,
};
use btaudio_media::PlaybackStatus;
use btaudio_mpd::MpdSupervisor;
use btaudio_pulse::KeepAlive;

use crate::idle::{self, IdleAction, IdleConfig, IdlePhase};
use crate::reconnect::FireOutcome;

use super::{Coordinator, AVRCP_SEARCH_COOLDOWN};

const SERVICES_WAIT: Duration = Duration::from_secs(10);
const SINK_WAIT: Duration = Duration::from_secs(30);
const BUSY_RETRY_DELAY: Duration = Duration::from_secs(1);
const FORCE_RECONNECT_SETTLE: Duration = Duration::from_secs(10);
const PROFILE_FALLBACK_SETTLE: Duration = Duration::from_secs(3);

impl Coordinator {
    /// Look up the BlueZ object for an address and make sure a runtime
    /// entry (with a signal monitor) exists for it.
    pub(crate) async fn ensure_managed(&self, address: &Address) -> Result<BluezDevice> {
        let device = self.inner.adapter.device(address)?;
        let name = device.display_name().await;
        self.ensure_entry(address, name);
        if let Some(persisted) = self.inner.ctx.store.get_device(address).await {
            self.attach_persisted(&persisted);
        }
        let has_monitor = self
            .with_entry(address, |e| e.monitor.is_some())
            .unwrap_or(false);
        if !has_monitor {
            match device.spawn_monitor(self.inner.signal_tx.clone()).await {
                Ok(handle) => {
                    self.with_entry(address, |e| e.monitor = Some(handle));
                }
                Err(e) => debug!(%address, error = %e, "signal monitor failed"),
            }
        }
        Ok(device)
    }

    /// Pair, trust, persist, and follow through with a full connect.
    pub async fn pair(&self, address: &Address) -> Result<()> {
        self.inner.reconnect.cancel(address);
        self.inner.suppress_reconnect.lock().remove(address);
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;

        let bus = &self.inner.ctx.bus;
        bus.status(format!("Pairing with {address}..."));
        let result = async {
            let device = self.ensure_managed(address).await?;
            self.with_entry(address, |e| {
                e.runtime.state = DeviceState::Pairing;
                e.runtime.transitioning = true;
            });
            self.broadcast_devices();

            device.pair().await?;
            device.set_trusted(true).await?;
            let name = device.display_name().await;
            let persisted = self
                .inner
                .ctx
                .store
                .record_paired(address.clone(), name)
                .await?;
            self.attach_persisted(&persisted);
            self.with_entry(address, |e| e.runtime.paired_in_bluez = true);
            self.broadcast_devices();

            self.connect_locked(address).await
        }
        .await;

        self.with_entry(address, |e| e.runtime.transitioning = false);
        bus.clear_status();
        self.broadcast_devices();
        result
    }

    /// Connect a stored (or freshly paired) device. Idempotent.
    pub async fn connect(&self, address: &Address) -> Result<()> {
        // step 1: a user connect overrides any scheduled reconnect and
        // clears disconnect suppression
        self.inner.reconnect.cancel(address);
        self.inner.suppress_reconnect.lock().remove(address);

        let lock = self.device_lock(address);
        let _guard = lock.lock().await;
        self.connect_locked(address).await
    }

    /// The connect sequence, caller already holds the device lock.
    pub(crate) async fn connect_locked(&self, address: &Address) -> Result<()> {
        let bus = self.inner.ctx.bus.clone();
        self.with_entry(address, |e| {
            e.runtime.state = DeviceState::Connecting;
            e.runtime.transitioning = true;
            e.phase = crate::idle::IdlePhase::IdleDefault;
            e.sink_seen = false;
            e.absent_ticks = 0;
        });
        self.broadcast_devices();
        bus.status(format!("Connecting to {address}..."));

        let result = self.connect_inner(address).await;

        match &result {
            Ok(()) => {}
            Err(e) => {
                warn!(%address, error = %e, "connect failed");
                // tear down whatever partial state came up, reverse order
                self.teardown_device_resources(address).await;
                self.with_entry(address, |e| {
                    e.runtime.state = DeviceState::Discovered;
                });
            }
        }
        self.with_entry(address, |e| e.runtime.transitioning = false);
        bus.clear_status();
        self.broadcast_devices();
        result
    }

    async fn connect_inner(&self, address: &Address) -> Result<()> {
        let bus = self.inner.ctx.bus.clone();
        let device = self.ensure_managed(address).await?;

        // step 3: always issue Connect() — pairing only brings up the
        // bare link, the explicit call sets up the audio profiles.
        // One retry on Busy.
        match device.connect().await {
            Ok(()) => {}
            Err(Error::Busy { .. }) => {
                debug!(%address, "connect busy, retrying once");
                tokio::time::sleep(BUSY_RETRY_DELAY).await;
                device.connect().await?;
            }
            Err(e) => return Err(e),
        }

        // step 4
        bus.status(format!("Waiting for services on {address}..."));
        device.wait_for_services(SERVICES_WAIT).await?;

        // step 5: AVRCP player watch, degrade on absence
        self.watch_avrcp(address).await;

        // step 6: audio profile ladder
        let profile = self.audio_profile(address).await;
        bus.status(format!(
            "Waiting for {} sink for {address}...",
            profile.label()
        ));
        self.activate_profile(&device, address, profile).await?;

        // step 7
        let sink = self.inner.pulse.wait_for_sink(address, SINK_WAIT).await?;
        self.with_entry(address, |e| {
            e.sink_seen = true;
            e.runtime.sink_state = sink.state;
        });

        // a disconnect that raced the setup aborts the operation
        if !device.is_connected().await.unwrap_or(false) {
            return Err(Error::BluezUnknown(format!(
                "{address}: device dropped during connect"
            )));
        }

        // A2DP devices: drop the HFP link so the speaker negotiates
        // AVRCP absolute volume instead of HFP gain commands
        if profile == AudioProfile::A2dp {
            if let Err(e) = device.disconnect_profile(uuids::HFP).await {
                debug!(%address, error = %e, "HFP profile disconnect failed");
            }
        }

        // steps 8-9
        self.mark_connected(address);
        self.apply_idle_mode(address).await;
        self.start_mpd_if_enabled(address).await;
        Ok(())
    }

    /// The profile ladder: direct card-profile set, explicit BlueZ
    /// `ConnectProfile`, then a Bluetooth module reload.
    async fn activate_profile(
        &self,
        device: &BluezDevice,
        address: &Address,
        profile: AudioProfile,
    ) -> Result<()> {
        if self.inner.pulse.set_card_profile(address, profile).await {
            return Ok(());
        }

        let uuid = match profile {
            AudioProfile::A2dp => uuids::A2DP_SINK,
            AudioProfile::Hfp => uuids::HFP,
        };
        info!(%address, profile = profile.label(), "card profile missing, trying ConnectProfile");
        if let Err(e) = device.connect_profile(uuid).await {
            debug!(%address, error = %e, "ConnectProfile failed");
        }
        tokio::time::sleep(PROFILE_FALLBACK_SETTLE).await;
        if self.inner.pulse.set_card_profile(address, profile).await {
            return Ok(());
        }

        info!(%address, "profile still missing, reloading audio Bluetooth module");
        self.inner
            .ctx
            .bus
            .status(format!("Reloading audio subsystem for {address}..."));
        if let Err(e) = self.inner.pulse.reload_bluetooth_module().await {
            debug!(error = %e, "module reload failed");
        }
        // the reload drops Bluetooth cards; bring the device back
        if let Err(e) = device.connect().await {
            debug!(%address, error = %e, "reconnect after module reload failed");
        }
        let _ = device.wait_for_services(SERVICES_WAIT).await;
        tokio::time::sleep(PROFILE_FALLBACK_SETTLE).await;
        if self.inner.pulse.set_card_profile(address, profile).await {
            return Ok(());
        }

        Err(Error::AudioProfileFailed {
            address: address.to_string(),
            profile: profile.label().to_string(),
        })
    }

    /// Subscribe to the device's AVRCP player, honoring the search
    /// cooldown so brief disconnect/reconnect flaps do not re-search.
    pub(crate) async fn watch_avrcp(&self, address: &Address) {
        let (has_watch, cooling) = self
            .with_entry(address, |e| {
                let cooling = e
                    .avrcp_cooldown_until
                    .is_some_and(|until| Instant::now() < until);
                (e.avrcp.is_some(), cooling)
            })
            .unwrap_or((false, false));
        if has_watch || cooling {
            return;
        }
        // clone the connection out so the player lock is not held for
        // the duration of the (retrying) search
        let connection = self.inner.player.lock().await.connection().clone();
        let result = btaudio_media::avrcp::watch_media_player(
            &connection,
            self.inner.adapter.name(),
            address,
            self.inner.avrcp_tx.clone(),
        )
        .await;
        match result {
            Ok(Some(watch)) => {
                self.with_entry(address, |e| {
                    e.avrcp = Some(watch);
                    e.avrcp_cooldown_until = None;
                });
            }
            Ok(None) => {
                self.with_entry(address, |e| {
                    e.avrcp_cooldown_until = Some(Instant::now() + AVRCP_SEARCH_COOLDOWN);
                });
            }
            Err(e) => {
                debug!(%address, error = %e, "AVRCP watch failed");
                self.with_entry(address, |e| {
                    e.avrcp_cooldown_until = Some(Instant::now() + AVRCP_SEARCH_COOLDOWN);
                });
            }
        }
    }

    /// User-initiated disconnect: suppress auto-reconnect, tear down,
    /// drop the link.
    pub async fn disconnect(&self, address: &Address) -> Result<()> {
        self.inner.reconnect.cancel(address);
        self.inner
            .suppress_reconnect
            .lock()
            .insert(address.clone());
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;
        self.disconnect_locked(address).await
    }

    /// Disconnect with the lock held. Used by the user path, forget,
    /// force-reconnect, and the auto-disconnect timer (which does not
    /// suppress reconnection).
    pub(crate) async fn disconnect_locked(&self, address: &Address) -> Result<()> {
        let bus = self.inner.ctx.bus.clone();
        bus.status(format!("Disconnecting {address}..."));
        self.with_entry(address, |e| {
            e.runtime.state = DeviceState::Disconnecting;
            e.runtime.transitioning = true;
        });
        self.broadcast_devices();

        self.teardown_device_resources(address).await;
        match self.inner.adapter.device(address) {
            Ok(device) => {
                if let Err(e) = device.disconnect().await {
                    warn!(%address, error = %e, "disconnect failed");
                }
            }
            Err(e) => debug!(%address, error = %e, "no BlueZ object to disconnect"),
        }

        self.mark_disconnected(address);
        self.with_entry(address, |e| e.runtime.transitioning = false);
        bus.clear_status();
        self.broadcast_devices();
        Ok(())
    }

    /// Disconnect-then-connect recovery cycle, both under one lock hold.
    pub async fn force_reconnect(&self, address: &Address) -> Result<()> {
        self.inner.reconnect.cancel(address);
        self.inner.suppress_reconnect.lock().remove(address);
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;

        let bus = self.inner.ctx.bus.clone();
        bus.status(format!("Force reconnecting {address}..."));
        // suppress while the link drops so the observed disconnect does
        // not race a competing reconnect schedule
        self.inner
            .suppress_reconnect
            .lock()
            .insert(address.clone());
        if let Err(e) = self.disconnect_locked(address).await {
            warn!(%address, error = %e, "force reconnect: disconnect failed, continuing");
        }
        bus.status(format!("Waiting for {address} to reset..."));
        tokio::time::sleep(FORCE_RECONNECT_SETTLE).await;
        self.inner.suppress_reconnect.lock().remove(address);
        self.connect_locked(address).await
    }

    /// Forget: user-disconnect semantics, then remove from BlueZ and
    /// the store. Safe on a device that is only discovered.
    pub async fn forget(&self, address: &Address) -> Result<()> {
        self.inner.reconnect.cancel(address);
        self.inner
            .suppress_reconnect
            .lock()
            .insert(address.clone());
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;

        let bus = self.inner.ctx.bus.clone();
        bus.status(format!("Forgetting {address}..."));
        self.with_entry(address, |e| {
            e.runtime.state = DeviceState::Forgetting;
            e.runtime.transitioning = true;
        });

        self.teardown_device_resources(address).await;
        if let Ok(device) = self.inner.adapter.device(address) {
            if let Err(e) = device.disconnect().await {
                debug!(%address, error = %e, "disconnect during forget failed");
            }
        }
        if let Err(e) = self.inner.adapter.remove_device(address).await {
            warn!(%address, error = %e, "BlueZ removal failed during forget");
        }
        self.inner.ctx.store.release_mpd_port(address).await?;
        self.inner.ctx.store.remove_device(address).await?;

        // terminate subscriptions and drop the runtime entry
        if let Some(mut entry) = self.inner.devices.lock().remove(address) {
            if let Some(monitor) = entry.monitor.take() {
                monitor.abort();
            }
            entry.avrcp = None;
            entry.cancel_timers();
        }
        self.inner.locks.lock().remove(address);
        self.inner.suppress_reconnect.lock().remove(address);

        info!(%address, "device forgotten");
        bus.clear_status();
        self.broadcast_devices();
        Ok(())
    }

    // -- idle mode --

    pub(crate) async fn audio_profile(&self, address: &Address) -> AudioProfile {
        self.inner
            .ctx
            .store
            .get_device(address)
            .await
            .map(|d| d.audio_profile)
            .unwrap_or_default()
    }

    pub(crate) async fn idle_config(&self, address: &Address) -> IdleConfig {
        let persisted = self.inner.ctx.store.get_device(address).await;
        match persisted {
            Some(device) => IdleConfig {
                mode: device.idle_mode,
                power_save_delay: Duration::from_secs(u64::from(device.power_save_delay_s)),
                auto_disconnect_after: Duration::from_secs(
                    u64::from(device.auto_disconnect_minutes) * 60,
                ),
            },
            None => IdleConfig {
                mode: IdleMode::Default,
                power_save_delay: Duration::ZERO,
                auto_disconnect_after: Duration::from_secs(30 * 60),
            },
        }
    }

    /// Apply the configured idle mode against the sink's current state.
    pub(crate) async fn apply_idle_mode(&self, address: &Address) {
        let config = self.idle_config(address).await;
        let sink_state = match self.inner.pulse.sink_for_address(address).await {
            Ok(Some(sink)) => sink.state,
            _ => SinkState::Absent,
        };
        if sink_state == SinkState::Running || sink_state == SinkState::Absent {
            return;
        }
        let phase = self
            .with_entry(address, |e| e.phase)
            .unwrap_or(IdlePhase::IdleDefault);
        let (next, actions) = idle::on_sink_idle(phase, &config);
        self.with_entry(address, |e| e.phase = next);
        self.execute_idle_actions(address, actions).await;
    }

    /// Run the side effects an idle-machine transition produced.
    pub(crate) async fn execute_idle_actions(&self, address: &Address, actions: Vec<IdleAction>) {
        for action in actions {
            match action {
                IdleAction::CancelTimers => {
                    self.with_entry(address, |e| e.cancel_timers());
                }
                IdleAction::StopKeepAlive => self.stop_keepalive(address).await,
                IdleAction::StartKeepAlive => self.start_keepalive(address).await,
                IdleAction::StartSuspendTimer(delay) => self.arm_suspend_timer(address, delay),
                IdleAction::SuspendSink => self.do_suspend_sink(address).await,
                IdleAction::StartAutoDisconnectTimer(delay) => {
                    self.arm_auto_disconnect_timer(address, delay)
                }
                IdleAction::Disconnect => {
                    // idle auto-disconnect: reconnect stays permitted
                    let this = self.clone();
                    let address = address.clone();
                    tokio::spawn(async move {
                        info!(%address, "auto-disconnect after idle timeout");
                        let lock = this.device_lock(&address);
                        let _guard = lock.lock().await;
                        let _ = this.disconnect_locked(&address).await;
                    });
                }
            }
        }
    }

    pub(crate) async fn start_keepalive(&self, address: &Address) {
        if !self.is_connected(address) {
            return;
        }
        let mut keepalives = self.inner.keepalives.lock().await;
        if keepalives.contains_key(address) {
            return;
        }
        let method = match self.inner.ctx.store.get_device(address).await {
            Some(device) => device.keep_alive_method,
            None => return,
        };
        let sink = match self.inner.pulse.sink_for_address(address).await {
            Ok(Some(sink)) => sink.name,
            _ => {
                debug!(%address, "no sink yet, keep-alive deferred");
                return;
            }
        };
        let server = self.inner.pulse.server().map(str::to_string);
        keepalives.insert(address.clone(), KeepAlive::start(sink, method, server));
        drop(keepalives);
        self.with_entry(address, |e| e.runtime.keep_alive_active = true);
        self.broadcast_devices();
    }

    pub(crate) async fn stop_keepalive(&self, address: &Address) {
        let keepalive = self.inner.keepalives.lock().await.remove(address);
        if let Some(keepalive) = keepalive {
            keepalive.stop().await;
            self.with_entry(address, |e| e.runtime.keep_alive_active = false);
            self.broadcast_devices();
        }
    }

    fn arm_suspend_timer(&self, address: &Address, delay: Duration) {
        let this = self.clone();
        let addr = address.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_suspend_timer_fired(&addr).await;
        });
        self.with_entry(address, |e| {
            if let Some(old) = e.suspend_timer.replace(timer) {
                old.abort();
            }
        });
    }

    async fn on_suspend_timer_fired(&self, address: &Address) {
        let phase = self
            .with_entry(address, |e| {
                e.suspend_timer = None;
                e.phase
            })
            .unwrap_or(IdlePhase::IdleDefault);
        let (next, actions) = idle::on_suspend_timer(phase);
        self.with_entry(address, |e| e.phase = next);
        self.execute_idle_actions(address, actions).await;
    }

    async fn do_suspend_sink(&self, address: &Address) {
        if let Ok(Some(sink)) = self.inner.pulse.sink_for_address(address).await {
            match self.inner.pulse.suspend_sink(&sink.name).await {
                Ok(()) => {
                    self.with_entry(address, |e| {
                        e.suspended_by_us = true;
                        e.runtime.sink_state = SinkState::Suspended;
                    });
                    self.broadcast_devices();
                }
                Err(e) => warn!(%address, error = %e, "sink suspend failed"),
            }
        }
    }

    fn arm_auto_disconnect_timer(&self, address: &Address, delay: Duration) {
        info!(%address, minutes = delay.as_secs() / 60, "auto-disconnect timer armed");
        let this = self.clone();
        let addr = address.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.on_auto_disconnect_timer_fired(&addr).await;
        });
        self.with_entry(address, |e| {
            if let Some(old) = e.auto_disconnect_timer.replace(timer) {
                old.abort();
            }
        });
    }

    async fn on_auto_disconnect_timer_fired(&self, address: &Address) {
        let phase = self
            .with_entry(address, |e| {
                e.auto_disconnect_timer = None;
                e.phase
            })
            .unwrap_or(IdlePhase::IdleDefault);
        let (next, actions) = idle::on_auto_disconnect_timer(phase);
        self.with_entry(address, |e| e.phase = next);
        self.execute_idle_actions(address, actions).await;
    }

    // -- MPD --

    pub(crate) async fn start_mpd_if_enabled(&self, address: &Address) {
        let Some(persisted) = self.inner.ctx.store.get_device(address).await else {
            return;
        };
        if !persisted.mpd_enabled {
            return;
        }
        if self.inner.mpds.lock().await.contains_key(address) {
            return;
        }
        let sink = match self.inner.pulse.sink_for_address(address).await {
            Ok(Some(sink)) => sink,
            _ => {
                debug!(%address, "no sink yet, MPD start deferred");
                return;
            }
        };
        let port = match self.inner.ctx.store.allocate_mpd_port(address).await {
            Ok(port) => port,
            Err(e) => {
                warn!(%address, error = %e, "MPD port allocation failed");
                return;
            }
        };
        // device name plus a MAC suffix disambiguates twin speakers
        let suffix: String = address
            .to_string()
            .replace(':', "")
            .chars()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let display_name = format!("{} ({suffix})", persisted.name);

        match MpdSupervisor::start(
            address.clone(),
            port,
            &display_name,
            &sink.name,
            &self.inner.ctx.data_dir,
            self.inner.mpd_fail_tx.clone(),
        )
        .await
        {
            Ok(supervisor) => {
                self.init_mpd_volume(address, &supervisor, &sink.name, persisted.mpd_hw_volume_pct)
                    .await;
                self.inner
                    .mpds
                    .lock()
                    .await
                    .insert(address.clone(), supervisor);
                self.with_entry(address, |e| e.runtime.mpd_running = true);
                if self.avrcp_enabled(address) {
                    let player = self.inner.player.lock().await;
                    let _ = player.set_playback_status(PlaybackStatus::Playing).await;
                }
                self.broadcast_devices();
            }
            Err(e) => warn!(%address, error = %e, "MPD start failed"),
        }
    }

    /// First start sets the hardware level so MPD is the single volume
    /// control; if a stream is already running, sync MPD to the
    /// hardware instead.
    async fn init_mpd_volume(
        &self,
        address: &Address,
        supervisor: &MpdSupervisor,
        sink_name: &str,
        hw_volume_pct: u8,
    ) {
        let first_start = self.inner.mpd_volume_applied.lock().insert(address.clone());
        let sink = match self.inner.pulse.sink_for_address(address).await {
            Ok(Some(sink)) => sink,
            _ => return,
        };
        if first_start && sink.state != SinkState::Running {
            if let Err(e) = self.inner.pulse.set_sink_volume(sink_name, hw_volume_pct).await {
                debug!(%address, error = %e, "hardware volume init failed");
            }
        } else {
            supervisor.set_volume(sink.volume_pct.min(100) as u8).await;
        }
    }

    pub(crate) async fn stop_mpd(&self, address: &Address) {
        let supervisor = self.inner.mpds.lock().await.remove(address);
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
            self.with_entry(address, |e| e.runtime.mpd_running = false);
            self.broadcast_devices();
        }
    }

    // -- settings --

    /// Apply a device settings patch and react to what changed.
    pub async fn update_device_settings(
        &self,
        address: &Address,
        patch: &DevicePatch,
    ) -> Result<PersistedDevice> {
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;

        let updated = self.inner.ctx.store.update_device(address, patch).await?;
        self.attach_persisted(&updated);
        let connected = self.is_connected(address);

        if let Some(profile) = patch.audio_profile {
            if profile == AudioProfile::Hfp {
                // one registration is host-global; release it before a
                // device actually needs HFP
                if let Some(mut block) = self.inner.hfp_block.lock().await.take() {
                    block.unregister().await;
                }
            }
            if connected {
                // re-run the ladder in the background so the settings
                // write returns promptly
                let this = self.clone();
                let addr = address.clone();
                tokio::spawn(async move {
                    let lock = this.device_lock(&addr);
                    let _guard = lock.lock().await;
                    let Ok(device) = this.ensure_managed(&addr).await else {
                        return;
                    };
                    match this.activate_profile(&device, &addr, profile).await {
                        Ok(()) => {
                            if let Ok(sink) = this.inner.pulse.wait_for_sink(&addr, SINK_WAIT).await
                            {
                                this.with_entry(&addr, |e| {
                                    e.sink_seen = true;
                                    e.runtime.sink_state = sink.state;
                                });
                                this.apply_idle_mode(&addr).await;
                                this.start_mpd_if_enabled(&addr).await;
                            }
                            this.inner
                                .ctx
                                .bus
                                .status(format!("Audio profile switched to {}", profile.label()));
                        }
                        Err(e) => {
                            warn!(address = %addr, error = %e, "profile switch failed");
                            this.inner.ctx.bus.status(e.user_message());
                        }
                    }
                    this.broadcast_devices();
                });
            }
        }

        let idle_changed = patch.idle_mode.is_some()
            || patch.keep_alive_method.is_some()
            || patch.power_save_delay_s.is_some()
            || patch.auto_disconnect_minutes.is_some();
        if idle_changed && connected {
            let staying_power_save = updated.idle_mode == IdleMode::PowerSave;
            self.stop_keepalive(address).await;
            let suspended = self
                .with_entry(address, |e| {
                    e.cancel_timers();
                    e.phase = IdlePhase::IdleDefault;
                    std::mem::take(&mut e.suspended_by_us)
                })
                .unwrap_or(false);
            // resume unless the new mode would immediately re-suspend —
            // that resume/suspend race can make the suspend silently fail
            if suspended && !staying_power_save {
                if let Ok(Some(sink)) = self.inner.pulse.sink_for_address(address).await {
                    let _ = self.inner.pulse.resume_sink(&sink.name).await;
                }
            }
            self.apply_idle_mode(address).await;
        }

        let mpd_changed = patch.mpd_enabled.is_some()
            || patch.mpd_port.is_some()
            || patch.mpd_hw_volume_pct.is_some();
        if mpd_changed && connected {
            self.stop_mpd(address).await;
            if updated.mpd_enabled {
                self.start_mpd_if_enabled(address).await;
            } else {
                self.inner.ctx.store.release_mpd_port(address).await?;
            }
        }
        // eager allocation so the API response shows the port even when
        // the device is not connected yet
        if patch.mpd_enabled == Some(true) && updated.mpd_port.is_none() {
            self.inner.ctx.store.allocate_mpd_port(address).await?;
        }

        if let Some(enabled) = patch.avrcp_enabled {
            if connected {
                let player = self.inner.player.lock().await;
                if !enabled {
                    let _ = player.set_playback_status(PlaybackStatus::Stopped).await;
                } else if self
                    .with_entry(address, |e| e.runtime.sink_state == SinkState::Running)
                    .unwrap_or(false)
                {
                    let _ = player.set_playback_status(PlaybackStatus::Playing).await;
                }
            }
        }

        let refreshed = self
            .inner
            .ctx
            .store
            .get_device(address)
            .await
            .unwrap_or(updated);
        self.attach_persisted(&refreshed);
        self.broadcast_devices();
        Ok(refreshed)
    }

    // -- adapter switch / restart --

    /// Two-phase adapter switch: tear down every device, persist the
    /// selection, then exit with the restart-required code.
    pub async fn set_adapter(&self, adapter: &str, clean: bool) -> Result<()> {
        let addresses: Vec<Address> = self.inner.devices.lock().keys().cloned().collect();
        for address in &addresses {
            let connected = self.is_connected(address);
            if clean {
                if let Err(e) = self.forget(address).await {
                    warn!(%address, error = %e, "forget during adapter switch failed");
                }
            } else if connected {
                if let Err(e) = self.disconnect(address).await {
                    warn!(%address, error = %e, "disconnect during adapter switch failed");
                }
            }
        }

        self.inner
            .ctx
            .store
            .set_selected_adapter(adapter.to_string())
            .await?;
        if let Ok(new_adapter) = adapter.parse::<Address>() {
            self.inner.ctx.bus.publish(btaudio_core::Event::AdapterSwitchRequired {
                adapter: new_adapter,
            });
        }
        self.inner
            .ctx
            .bus
            .status("Adapter changed — restart required");
        self.request_exit(btaudio_core::exit_code::RESTART_REQUIRED);
        Ok(())
    }

    /// Graceful shutdown with the restart code; the supervisor brings
    /// the daemon back up.
    pub fn restart(&self) {
        self.inner.ctx.bus.status("Restarting...");
        self.request_exit(btaudio_core::exit_code::RESTART_REQUIRED);
    }

    /// Gate checks and connect for one fired reconnect attempt.
    pub(crate) async fn handle_reconnect_fire(&self, address: &Address, attempt: u32) -> FireOutcome {
        let settings = self.inner.ctx.store.get_settings().await;
        if !settings.auto_reconnect {
            return FireOutcome::Cancel;
        }
        let Some(device) = self.inner.ctx.store.get_device(address).await else {
            return FireOutcome::Cancel;
        };
        if !device.auto_connect {
            return FireOutcome::Cancel;
        }
        if self.inner.suppress_reconnect.lock().contains(address) {
            return FireOutcome::Cancel;
        }
        if self.is_connected(address) {
            return FireOutcome::Connected;
        }
        info!(%address, attempt, "reconnect attempt firing");
        let lock = self.device_lock(address);
        let _guard = lock.lock().await;
        match self.connect_locked(address).await {
            Ok(()) => FireOutcome::Connected,
            Err(e) => {
                warn!(%address, attempt, error = %e, "reconnect attempt failed");
                FireOutcome::Failed
            }
        }
    }
}
