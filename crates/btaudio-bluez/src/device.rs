//! Per-device BlueZ wrapper.
//!
//! Wraps `org.bluez.Device1` for pairing, connecting, profile
//! activation, and property snapshots. Property-change signals are not
//! handled in ad-hoc closures: `spawn_monitor` pumps them into a typed
//! channel the coordinator consumes.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use btaudio_core::{Address, Error, Result};

use crate::error::map_bluez_error;

/// Semantic D-Bus call timeouts.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROFILE_TIMEOUT: Duration = Duration::from_secs(10);
const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A property snapshot of one device.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub name: Option<String>,
    pub paired: bool,
    pub connected: bool,
    pub trusted: bool,
    pub rssi: Option<i16>,
    pub uuids: Vec<String>,
}

/// Typed property-change message pumped into the coordinator.
#[derive(Debug, Clone)]
pub struct DeviceSignal {
    pub address: Address,
    pub kind: DeviceSignalKind,
}

#[derive(Debug, Clone)]
pub enum DeviceSignalKind {
    Connected(bool),
    ServicesResolved(bool),
    Rssi(Option<i16>),
    Uuids(Vec<String>),
    NameChanged(String),
}

/// Typed handle for one `org.bluez.Device1` object.
pub struct BluezDevice {
    address: Address,
    device: bluer::Device,
}

impl BluezDevice {
    pub(crate) fn new(address: Address, device: bluer::Device) -> Self {
        Self { address, device }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Read all properties we care about, tolerating partial failures
    /// (a device can vanish between reads during discovery).
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let uuids = self
            .device
            .uuids()
            .await
            .ok()
            .flatten()
            .map(|set| {
                let mut v: Vec<String> = set.iter().map(|u| u.to_string()).collect();
                v.sort();
                v
            })
            .unwrap_or_default();
        DeviceSnapshot {
            name: self.device.name().await.ok().flatten(),
            paired: self.device.is_paired().await.unwrap_or(false),
            connected: self.device.is_connected().await.unwrap_or(false),
            trusted: self.device.is_trusted().await.unwrap_or(false),
            rssi: self.device.rssi().await.ok().flatten(),
            uuids,
        }
    }

    pub async fn is_connected(&self) -> Result<bool> {
        self.device
            .is_connected()
            .await
            .map_err(|e| map_bluez_error(&self.address, e))
    }

    pub async fn is_paired(&self) -> Result<bool> {
        self.device
            .is_paired()
            .await
            .map_err(|e| map_bluez_error(&self.address, e))
    }

    /// Display name, falling back to the address.
    pub async fn display_name(&self) -> String {
        self.device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Initiate pairing. Already-paired is not an error.
    pub async fn pair(&self) -> Result<()> {
        if self.is_paired().await.unwrap_or(false) {
            debug!(address = %self.address, "already paired");
            return Ok(());
        }
        info!(address = %self.address, "pairing");
        match timeout(PAIR_TIMEOUT, self.device.pair()).await {
            Ok(Ok(())) => {
                info!(address = %self.address, "paired");
                Ok(())
            }
            Ok(Err(e)) if e.kind == bluer::ErrorKind::AlreadyExists => Ok(()),
            Ok(Err(e)) => Err(map_bluez_error(&self.address, e)),
            Err(_) => Err(Error::DeviceUnreachable {
                address: self.address.to_string(),
                detail: format!("pairing timed out after {}s", PAIR_TIMEOUT.as_secs()),
            }),
        }
    }

    /// Mark trusted so BlueZ accepts the speaker's own reconnects.
    pub async fn set_trusted(&self, trusted: bool) -> Result<()> {
        self.device
            .set_trusted(trusted)
            .await
            .map_err(|e| map_bluez_error(&self.address, e))?;
        debug!(address = %self.address, trusted, "trust updated");
        Ok(())
    }

    /// Connect all profiles. The explicit `Connect()` is required even
    /// when a link already exists — pairing only brings up the bare
    /// link, not A2DP.
    pub async fn connect(&self) -> Result<()> {
        info!(address = %self.address, "connecting");
        match timeout(CONNECT_TIMEOUT, self.device.connect()).await {
            Ok(Ok(())) => {
                info!(address = %self.address, "connected");
                Ok(())
            }
            Ok(Err(e)) => Err(map_bluez_error(&self.address, e)),
            Err(_) => Err(Error::DeviceUnreachable {
                address: self.address.to_string(),
                detail: format!("connect timed out after {}s", CONNECT_TIMEOUT.as_secs()),
            }),
        }
    }

    /// Disconnect the whole device. Not-connected is not an error.
    pub async fn disconnect(&self) -> Result<()> {
        info!(address = %self.address, "disconnecting");
        match timeout(DISCONNECT_TIMEOUT, self.device.disconnect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind == bluer::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(map_bluez_error(&self.address, e)),
            Err(_) => Err(Error::BluezUnknown(format!(
                "{}: disconnect timed out",
                self.address
            ))),
        }
    }

    /// Connect one profile by UUID (explicit A2DP/HFP activation).
    pub async fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        debug!(address = %self.address, %uuid, "ConnectProfile");
        match timeout(PROFILE_TIMEOUT, self.device.connect_profile(&uuid)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(map_bluez_error(&self.address, e)),
            Err(_) => Err(Error::BluezUnknown(format!(
                "{}: ConnectProfile({uuid}) timed out",
                self.address
            ))),
        }
    }

    /// Disconnect one profile by UUID without dropping the device link.
    /// An inactive profile is not an error.
    pub async fn disconnect_profile(&self, uuid: Uuid) -> Result<()> {
        debug!(address = %self.address, %uuid, "DisconnectProfile");
        match timeout(PROFILE_TIMEOUT, self.device.disconnect_profile(&uuid)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e))
                if matches!(
                    e.kind,
                    bluer::ErrorKind::NotConnected | bluer::ErrorKind::DoesNotExist
                ) =>
            {
                Ok(())
            }
            Ok(Err(e)) => Err(map_bluez_error(&self.address, e)),
            Err(_) => Err(Error::BluezUnknown(format!(
                "{}: DisconnectProfile({uuid}) timed out",
                self.address
            ))),
        }
    }

    /// Wait for `ServicesResolved` after a connect, up to `wait`.
    ///
    /// Returns `false` on timeout; the caller decides whether that
    /// degrades or aborts.
    pub async fn wait_for_services(&self, wait: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.device.is_services_resolved().await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => return Err(map_bluez_error(&self.address, e)),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    address = %self.address,
                    "services not resolved within {}s", wait.as_secs()
                );
                return Ok(false);
            }
            tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
        }
    }

    /// Pump property-change signals into `tx` until the channel closes
    /// or the task is aborted. The handle is owned by the runtime device
    /// and aborted on forget, terminating the subscription
    /// deterministically.
    pub async fn spawn_monitor(
        &self,
        tx: mpsc::Sender<DeviceSignal>,
    ) -> Result<JoinHandle<()>> {
        let mut events = Box::pin(
            self.device
                .events()
                .await
                .map_err(|e| map_bluez_error(&self.address, e))?,
        );
        let address = self.address.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let property = match event {
                    bluer::DeviceEvent::PropertyChanged(property) => property,
                    #[allow(unreachable_patterns)]
                    _ => continue,
                };
                let kind = match property {
                    bluer::DeviceProperty::Connected(v) => DeviceSignalKind::Connected(v),
                    bluer::DeviceProperty::ServicesResolved(v) => {
                        DeviceSignalKind::ServicesResolved(v)
                    }
                    bluer::DeviceProperty::Rssi(v) => DeviceSignalKind::Rssi(Some(v)),
                    bluer::DeviceProperty::Uuids(set) => {
                        let mut v: Vec<String> =
                            set.iter().map(|u| u.to_string()).collect();
                        v.sort();
                        DeviceSignalKind::Uuids(v)
                    }
                    bluer::DeviceProperty::Name(name) => DeviceSignalKind::NameChanged(name),
                    _ => continue,
                };
                let signal = DeviceSignal {
                    address: address.clone(),
                    kind,
                };
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
            debug!(%address, "device signal monitor ended");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_default_is_disconnected() {
        let snap = DeviceSnapshot::default();
        assert!(!snap.connected);
        assert!(!snap.paired);
        assert!(snap.uuids.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires BlueZ and a paired device"]
    async fn snapshot_reads_live_properties() {
        let adapter = crate::BluezAdapter::resolve("auto").await.unwrap();
        for address in adapter.device_addresses().await.unwrap() {
            let device = adapter.device(&address).unwrap();
            let _ = device.snapshot().await;
        }
    }
}
