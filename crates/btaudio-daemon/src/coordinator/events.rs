//! The coordinator's event loop.
//!
//! All asynchronous inputs — BlueZ property signals, PulseAudio sink
//! events, MPRIS commands, AVRCP property changes, MPD failures, and
//! due reconnect attempts — arrive here as typed messages. Handlers
//! never block the loop: anything that needs a device lock is spawned.

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use btaudio_bluez::{DeviceSignal, DeviceSignalKind};
use btaudio_core::{Address, AvrcpEntry, Event, MprisEntry};
use btaudio_media::{AvrcpSignal, MediaCommand, PlaybackStatus};
use btaudio_mpd::TransportCommand;
use btaudio_pulse::PulseEvent;

use super::{Coordinator, AVRCP_DEVICE_WINDOW};

pub(super) async fn run(
    coordinator: Coordinator,
    mut signal_rx: mpsc::Receiver<DeviceSignal>,
    mut pulse_rx: mpsc::Receiver<PulseEvent>,
    mut media_rx: mpsc::UnboundedReceiver<MediaCommand>,
    mut avrcp_rx: mpsc::Receiver<AvrcpSignal>,
    mut mpd_fail_rx: mpsc::Receiver<Address>,
    mut reconnect_rx: mpsc::Receiver<crate::reconnect::ReconnectRequest>,
) {
    let shutdown = coordinator.inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            Some(signal) = signal_rx.recv() => {
                coordinator.handle_device_signal(signal);
            }
            Some(event) = pulse_rx.recv() => {
                coordinator.handle_pulse_event(event).await;
            }
            Some(command) = media_rx.recv() => {
                coordinator.handle_media_command(command).await;
            }
            Some(signal) = avrcp_rx.recv() => {
                coordinator.handle_avrcp_signal(signal);
            }
            Some(address) = mpd_fail_rx.recv() => {
                coordinator.handle_mpd_failure(address).await;
            }
            Some(request) = reconnect_rx.recv() => {
                let this = coordinator.clone();
                tokio::spawn(async move {
                    let outcome = this.handle_reconnect_fire(&request.address, request.attempt).await;
                    let _ = request.reply.send(outcome);
                });
            }
            else => return,
        }
    }
}

impl Coordinator {
    /// A BlueZ property signal for one device.
    fn handle_device_signal(&self, signal: DeviceSignal) {
        let address = signal.address;
        match signal.kind {
            DeviceSignalKind::Connected(true) => self.on_bluez_connected(&address),
            DeviceSignalKind::Connected(false) => self.on_bluez_disconnected(&address),
            DeviceSignalKind::Rssi(rssi) => {
                self.with_entry(&address, |e| e.runtime.rssi = rssi);
            }
            DeviceSignalKind::Uuids(uuids) => {
                self.with_entry(&address, |e| e.runtime.uuids = uuids);
            }
            DeviceSignalKind::NameChanged(name) => {
                self.with_entry(&address, |e| e.runtime.name = name);
            }
            DeviceSignalKind::ServicesResolved(_) => {}
        }
    }

    /// The device came up at the BlueZ level — the speaker initiated,
    /// or BlueZ auto-connected a trusted device. Run the idempotent
    /// connect sequence to finish the audio setup.
    fn on_bluez_connected(&self, address: &Address) {
        info!(%address, "device connected (BlueZ signal)");
        self.with_entry(address, |e| {
            e.runtime.present_in_bluez = true;
            e.runtime.last_connected_at = Some(Utc::now());
        });
        if self.is_transitioning(address) {
            debug!(%address, "connect already in progress, signal ignored");
            return;
        }
        let this = self.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = this.connect(&address).await {
                warn!(%address, error = %e, "post-signal connect setup failed");
            }
        });
    }

    /// The device dropped at the BlueZ level.
    fn on_bluez_disconnected(&self, address: &Address) {
        info!(%address, "device disconnected (BlueZ signal)");
        let was_transitioning = self.is_transitioning(address);
        self.mark_disconnected(address);

        let this = self.clone();
        let addr = address.clone();
        tokio::spawn(async move {
            this.teardown_device_resources(&addr).await;
            this.broadcast_devices();
        });

        if was_transitioning {
            // a connect/disconnect operation owns the device right now;
            // it observes the drop itself
            debug!(%address, "operation in flight, not scheduling reconnect");
            return;
        }
        let suppressed = self.inner.suppress_reconnect.lock().remove(address);
        if suppressed {
            info!(%address, "user-initiated disconnect, no reconnect");
            return;
        }
        self.inner.reconnect.on_unexpected_disconnect(address);
    }

    /// A sink event from the PulseAudio monitor. Idle-mode transitions
    /// belong to the poller; this path keeps the speaker's display and
    /// the per-device MPD in sync with low latency.
    async fn handle_pulse_event(&self, event: PulseEvent) {
        match event {
            PulseEvent::SinkVolume {
                sink,
                volume_pct,
                mute,
            } => {
                let Some(address) = Address::from_sink_name(&sink) else {
                    return;
                };
                let value = if mute {
                    format!("{volume_pct}% (muted)")
                } else {
                    format!("{volume_pct}%")
                };
                self.inner.ctx.bus.publish(Event::AvrcpEvent(AvrcpEntry {
                    address: address.clone(),
                    property: "Volume".into(),
                    value,
                    ts: Utc::now(),
                }));
                // keep MPD's notion of volume aligned with the hardware
                let mpds = self.inner.mpds.lock().await;
                if let Some(supervisor) = mpds.get(&address) {
                    supervisor.set_volume(volume_pct.min(100) as u8).await;
                }
            }
            PulseEvent::SinkRunning { sink } => {
                let Some(address) = Address::from_sink_name(&sink) else {
                    return;
                };
                if self.avrcp_enabled(&address) {
                    let player = self.inner.player.lock().await;
                    let _ = player.set_playback_status(PlaybackStatus::Playing).await;
                }
            }
            PulseEvent::SinkIdle { sink } => {
                let Some(address) = Address::from_sink_name(&sink) else {
                    return;
                };
                if self.avrcp_enabled(&address) {
                    let player = self.inner.player.lock().await;
                    let _ = player.set_playback_status(PlaybackStatus::Stopped).await;
                }
            }
            PulseEvent::SinkAdded { sink } | PulseEvent::SinkRemoved { sink } => {
                debug!(sink, "sink set changed");
            }
        }
    }

    /// A command from the speaker's buttons via the MPRIS player.
    async fn handle_media_command(&self, command: MediaCommand) {
        let address = self.resolve_avrcp_target();
        self.inner.ctx.bus.publish(Event::MprisEvent(MprisEntry {
            address: address.clone(),
            command: command.name().to_string(),
            detail: command.detail(),
            ts: Utc::now(),
        }));

        if let Some(address) = &address {
            if !self.avrcp_enabled(address) {
                info!(%address, command = command.name(), "AVRCP disabled, command ignored");
                return;
            }
            self.route_to_mpd(address, &command).await;
            return;
        }

        // no recent AVRCP activity to attribute the press; with exactly
        // one MPD running the target is unambiguous
        let single = {
            let mpds = self.inner.mpds.lock().await;
            if mpds.len() == 1 {
                mpds.keys().next().cloned()
            } else {
                None
            }
        };
        match single {
            Some(address) => {
                if !self.avrcp_enabled(&address) {
                    return;
                }
                info!(%address, command = command.name(), "routing to the only MPD instance");
                self.route_to_mpd(&address, &command).await;
            }
            None => {
                debug!(command = command.name(), "cannot attribute MPRIS command, dropped");
            }
        }
    }

    async fn route_to_mpd(&self, address: &Address, command: &MediaCommand) {
        let mpds = self.inner.mpds.lock().await;
        let Some(supervisor) = mpds.get(address) else {
            return;
        };
        match command {
            MediaCommand::Play => supervisor.handle_command(TransportCommand::Play).await,
            MediaCommand::Pause => supervisor.handle_command(TransportCommand::Pause).await,
            MediaCommand::PlayPause => {
                supervisor.handle_command(TransportCommand::PlayPause).await
            }
            MediaCommand::Stop => supervisor.handle_command(TransportCommand::Stop).await,
            MediaCommand::Next => supervisor.handle_command(TransportCommand::Next).await,
            MediaCommand::Previous => {
                supervisor.handle_command(TransportCommand::Previous).await
            }
            MediaCommand::Volume(pct) => supervisor.set_volume(*pct).await,
            MediaCommand::Seek { .. } => {}
        }
    }

    /// A property change from a device's own AVRCP player node.
    fn handle_avrcp_signal(&self, signal: AvrcpSignal) {
        if signal.property == "Status" {
            *self.inner.last_avrcp.lock() =
                Some((signal.address.clone(), Instant::now()));
        }
        self.inner.ctx.bus.publish(Event::AvrcpEvent(AvrcpEntry {
            address: signal.address,
            property: signal.property,
            value: signal.value,
            ts: Utc::now(),
        }));
    }

    /// Which device a bare MPRIS command belongs to, based on recent
    /// AVRCP activity.
    fn resolve_avrcp_target(&self) -> Option<Address> {
        let last = self.inner.last_avrcp.lock();
        last.as_ref().and_then(|(address, at)| {
            (Instant::now().duration_since(*at) < AVRCP_DEVICE_WINDOW)
                .then(|| address.clone())
        })
    }

    /// An MPD supervisor exhausted its restart budget. The device stays
    /// connected; the condition degrades with a warning and shows up in
    /// the device list.
    async fn handle_mpd_failure(&self, address: Address) {
        warn!(%address, "MPD gave up after repeated crashes");
        self.inner.mpds.lock().await.remove(&address);
        self.inner.mpd_volume_applied.lock().remove(&address);
        self.with_entry(&address, |e| e.runtime.mpd_running = false);
        self.broadcast_devices();
    }
}
