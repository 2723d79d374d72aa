//! The sink poller.
//!
//! Every five seconds the Bluetooth sink list is diffed against the
//! runtime map. Edges drive the idle-mode machine; a connected device
//! whose sink stays absent after having been seen is treated as an
//! unexpected disconnect (codec renegotiation shows up exactly like
//! this, hence the two-tick debounce). `devices_changed` is emitted at
//! most once per tick, and only when the snapshot actually changed.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use btaudio_core::{Address, SinkState};

use crate::idle;

use super::{Coordinator, ABSENT_TICKS_BEFORE_RECYCLE};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub(super) async fn run(coordinator: Coordinator) {
    let shutdown = coordinator.inner.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        coordinator.poll_sinks_once().await;
    }
}

impl Coordinator {
    pub(crate) async fn poll_sinks_once(&self) {
        let sinks = match self.inner.pulse.list_bt_sinks().await {
            Ok(sinks) => sinks,
            Err(e) => {
                debug!(error = %e, "sink poll failed");
                return;
            }
        };
        let by_address: HashMap<Address, SinkState> = sinks
            .iter()
            .filter_map(|sink| sink.address().map(|addr| (addr, sink.state)))
            .collect();

        let addresses: Vec<Address> = self.inner.devices.lock().keys().cloned().collect();
        for address in addresses {
            let observed = by_address
                .get(&address)
                .copied()
                .unwrap_or(SinkState::Absent);
            let previous = self
                .with_entry(&address, |e| {
                    let prev = e.runtime.sink_state;
                    e.runtime.sink_state = observed;
                    if observed != SinkState::Absent {
                        e.sink_seen = true;
                        e.absent_ticks = 0;
                    }
                    prev
                })
                .unwrap_or(SinkState::Absent);

            if observed == previous {
                if observed == SinkState::Absent {
                    self.note_absent_tick(&address).await;
                }
                continue;
            }
            self.handle_sink_edge(&address, previous, observed).await;
        }

        // at most one coalesced emission per tick
        self.broadcast_devices();
    }

    async fn handle_sink_edge(&self, address: &Address, from: SinkState, to: SinkState) {
        debug!(%address, ?from, ?to, "sink edge");
        match (from, to) {
            (_, SinkState::Running) => {
                let phase = self
                    .with_entry(address, |e| e.phase)
                    .unwrap_or_default();
                let (next, actions) = idle::on_sink_running(phase);
                self.with_entry(address, |e| {
                    e.phase = next;
                    e.suspended_by_us = false;
                });
                self.execute_idle_actions(address, actions).await;
            }
            (SinkState::Running, SinkState::Idle | SinkState::Suspended)
            | (SinkState::Absent, SinkState::Idle | SinkState::Suspended) => {
                if !self.is_connected(address) {
                    return;
                }
                let config = self.idle_config(address).await;
                let phase = self
                    .with_entry(address, |e| e.phase)
                    .unwrap_or_default();
                let (next, actions) = idle::on_sink_idle(phase, &config);
                self.with_entry(address, |e| e.phase = next);
                self.execute_idle_actions(address, actions).await;
            }
            (_, SinkState::Absent) => {
                self.note_absent_tick(address).await;
            }
            _ => {}
        }
    }

    /// A connected device without a sink: count ticks and recycle the
    /// link once the debounce threshold is hit.
    async fn note_absent_tick(&self, address: &Address) {
        let recycle = self
            .with_entry(address, |e| {
                if !e.runtime.connected || !e.sink_seen || e.runtime.transitioning {
                    return false;
                }
                e.absent_ticks += 1;
                e.absent_ticks >= ABSENT_TICKS_BEFORE_RECYCLE
            })
            .unwrap_or(false);
        if !recycle {
            return;
        }
        warn!(%address, "sink vanished while connected, recycling the link");
        self.with_entry(address, |e| {
            e.sink_seen = false;
            e.absent_ticks = 0;
        });
        let this = self.clone();
        let address = address.clone();
        tokio::spawn(async move {
            match this.inner.adapter.device(&address) {
                Ok(device) if device.is_connected().await.unwrap_or(false) => {
                    // dropping the link raises the Connected=false
                    // signal, which runs the unexpected-disconnect path
                    if let Err(e) = device.disconnect().await {
                        warn!(%address, error = %e, "link recycle disconnect failed");
                    }
                }
                _ => {
                    // BlueZ already lost the device; run the path directly
                    info!(%address, "device gone from BlueZ, treating as unexpected disconnect");
                    this.mark_disconnected(&address);
                    this.teardown_device_resources(&address).await;
                    if !this.inner.suppress_reconnect.lock().remove(&address) {
                        this.inner.reconnect.on_unexpected_disconnect(&address);
                    }
                    this.broadcast_devices();
                }
            }
        });
    }
}
