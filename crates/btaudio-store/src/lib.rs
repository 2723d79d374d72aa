//! # btaudio-store
//!
//! Persistent state of the daemon: `paired_devices.json` and
//! `settings.json` in the data directory. Every write serializes the
//! full document to a sibling `.tmp`, fsyncs, and renames into place —
//! a reader never observes a partial document.
//!
//! The store assumes it is the only writer; a process-wide `RwLock`
//! guards read-modify-write cycles.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use btaudio_bus::EventBus;
use btaudio_core::{
    Address, DevicePatch, Error, Event, GlobalSettings, PersistedDevice, Result, SettingsPatch,
    MPD_PORT_MAX, MPD_PORT_MIN,
};

pub const DEVICES_FILE: &str = "paired_devices.json";
pub const SETTINGS_FILE: &str = "settings.json";

/// On-disk shape of `paired_devices.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesDoc {
    devices: Vec<PersistedDevice>,
}

#[derive(Debug)]
struct Inner {
    devices: Vec<PersistedDevice>,
    settings: GlobalSettings,
}

/// The persistent store. Clone-free; share via `Arc`.
#[derive(Debug)]
pub struct Store {
    devices_path: PathBuf,
    settings_path: PathBuf,
    inner: RwLock<Inner>,
    bus: EventBus,
}

impl Store {
    /// Load both documents from `data_dir`.
    ///
    /// Absent files initialize to an empty device list / default settings.
    /// Malformed files fail with `StoreCorrupt` — never silently discarded.
    pub async fn open(data_dir: impl AsRef<Path>, bus: EventBus) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| Error::StoreCorrupt {
                path: data_dir.display().to_string(),
                detail: format!("cannot create data directory: {e}"),
            })?;
        let devices_path = data_dir.join(DEVICES_FILE);
        let settings_path = data_dir.join(SETTINGS_FILE);

        let devices = match read_json::<DevicesDoc>(&devices_path).await? {
            Some(doc) => {
                let mut seen = std::collections::HashSet::new();
                for device in &doc.devices {
                    if !seen.insert(device.address.clone()) {
                        return Err(Error::StoreCorrupt {
                            path: devices_path.display().to_string(),
                            detail: format!("duplicate device entry {}", device.address),
                        });
                    }
                }
                info!(count = doc.devices.len(), "loaded paired devices");
                doc.devices
            }
            None => {
                info!("no paired devices store yet");
                Vec::new()
            }
        };
        let settings = match read_json::<GlobalSettings>(&settings_path).await? {
            Some(settings) => settings,
            None => {
                info!("no settings file yet, using defaults");
                GlobalSettings::default()
            }
        };

        Ok(Self {
            devices_path,
            settings_path,
            inner: RwLock::new(Inner { devices, settings }),
            bus,
        })
    }

    // -- Devices --

    /// Snapshot of all stored devices.
    pub async fn devices(&self) -> Vec<PersistedDevice> {
        self.inner.read().await.devices.clone()
    }

    pub async fn get_device(&self, address: &Address) -> Option<PersistedDevice> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .find(|d| &d.address == address)
            .cloned()
    }

    /// Devices marked for auto-connect (reconnect bootstrap set).
    pub async fn auto_connect_devices(&self) -> Vec<PersistedDevice> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .filter(|d| d.auto_connect)
            .cloned()
            .collect()
    }

    /// Whether any stored device is configured for HFP audio.
    pub async fn has_hfp_devices(&self) -> bool {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .any(|d| d.audio_profile == btaudio_core::AudioProfile::Hfp)
    }

    /// Record a successful pair: insert a fresh record, or refresh the
    /// name of an existing one while keeping its settings.
    pub async fn record_paired(&self, address: Address, name: String) -> Result<PersistedDevice> {
        let mut inner = self.inner.write().await;
        let device = match inner.devices.iter_mut().find(|d| d.address == address) {
            Some(existing) => {
                existing.name = name;
                existing.clone()
            }
            None => {
                let device = PersistedDevice::new(address, name, Utc::now());
                inner.devices.push(device.clone());
                device
            }
        };
        self.save_devices(&inner).await?;
        info!(address = %device.address, name = %device.name, "device stored");
        Ok(device)
    }

    /// Insert or replace a full device record.
    pub async fn upsert_device(&self, device: PersistedDevice) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner
            .devices
            .iter_mut()
            .find(|d| d.address == device.address)
        {
            Some(existing) => *existing = device,
            None => inner.devices.push(device),
        }
        self.save_devices(&inner).await
    }

    /// Apply a validated patch to a stored device.
    pub async fn update_device(
        &self,
        address: &Address,
        patch: &DevicePatch,
    ) -> Result<PersistedDevice> {
        let mut inner = self.inner.write().await;
        if let Some(Some(port)) = patch.mpd_port {
            let taken = inner
                .devices
                .iter()
                .any(|d| d.mpd_port == Some(port) && &d.address != address);
            if taken {
                return Err(Error::InvalidRequest(format!(
                    "mpd_port {port} already assigned to another device"
                )));
            }
        }
        let device = inner
            .devices
            .iter_mut()
            .find(|d| &d.address == address)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown device {address}")))?;
        patch.apply_to(device)?;
        let updated = device.clone();
        self.save_devices(&inner).await?;
        debug!(address = %address, "device settings updated");
        Ok(updated)
    }

    /// Remove a device. Returns whether it existed.
    pub async fn remove_device(&self, address: &Address) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let before = inner.devices.len();
        inner.devices.retain(|d| &d.address != address);
        let removed = inner.devices.len() != before;
        if removed {
            self.save_devices(&inner).await?;
            info!(address = %address, "device removed from store");
        }
        Ok(removed)
    }

    // -- MPD port pool --

    /// Assign an MPD port: the persisted choice if it is still unused by
    /// others, otherwise the lowest free port in the pool.
    pub async fn allocate_mpd_port(&self, address: &Address) -> Result<u16> {
        let mut inner = self.inner.write().await;
        let used: Vec<(u16, Address)> = inner
            .devices
            .iter()
            .filter_map(|d| d.mpd_port.map(|p| (p, d.address.clone())))
            .collect();
        let device = inner
            .devices
            .iter_mut()
            .find(|d| &d.address == address)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown device {address}")))?;
        if let Some(port) = device.mpd_port {
            let conflict = used
                .iter()
                .any(|(p, owner)| *p == port && owner != address);
            if !conflict {
                return Ok(port);
            }
        }
        let free = (MPD_PORT_MIN..=MPD_PORT_MAX).find(|port| {
            !used
                .iter()
                .any(|(p, owner)| p == port && owner != address)
        });
        match free {
            Some(port) => {
                device.mpd_port = Some(port);
                self.save_devices(&inner).await?;
                info!(address = %address, port, "MPD port allocated");
                Ok(port)
            }
            None => Err(Error::NoFreeMpdPort),
        }
    }

    /// Release a device's MPD port back to the pool.
    pub async fn release_mpd_port(&self, address: &Address) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(device) = inner.devices.iter_mut().find(|d| &d.address == address) else {
            return Ok(());
        };
        if let Some(port) = device.mpd_port.take() {
            self.save_devices(&inner).await?;
            info!(address = %address, port, "MPD port released");
        }
        Ok(())
    }

    // -- Settings --

    pub async fn get_settings(&self) -> GlobalSettings {
        self.inner.read().await.settings.clone()
    }

    /// Apply a validated patch to the global settings.
    pub async fn put_settings(&self, patch: &SettingsPatch) -> Result<GlobalSettings> {
        let mut inner = self.inner.write().await;
        patch.apply_to(&mut inner.settings)?;
        let updated = inner.settings.clone();
        self.save_settings(&inner).await?;
        Ok(updated)
    }

    /// Persist a new adapter selection (adapter-switch phase 2).
    pub async fn set_selected_adapter(&self, adapter: String) -> Result<GlobalSettings> {
        let patch = SettingsPatch {
            selected_adapter: Some(adapter),
            ..Default::default()
        };
        self.put_settings(&patch).await
    }

    // -- Persistence --

    async fn save_devices(&self, inner: &Inner) -> Result<()> {
        let doc = DevicesDoc {
            devices: inner.devices.clone(),
        };
        write_json_atomic(&self.devices_path, &doc).await?;
        self.bus.publish(Event::StoreChanged);
        Ok(())
    }

    async fn save_settings(&self, inner: &Inner) -> Result<()> {
        write_json_atomic(&self.settings_path, &inner.settings).await?;
        self.bus.publish(Event::StoreChanged);
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::StoreCorrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::StoreCorrupt {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
}

/// Serialize to `<path>.tmp`, fsync, rename over the target.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::StoreCorrupt {
        path: path.display().to_string(),
        detail: format!("serialize: {e}"),
    })?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |e: std::io::Error| Error::StoreCorrupt {
        path: path.display().to_string(),
        detail: e.to_string(),
    };
    let mut file = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
    file.write_all(&bytes).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use btaudio_core::{AudioProfile, IdleMode};
    use tempfile::tempdir;

    fn addr(n: u8) -> Address {
        Address::parse(&format!("AA:BB:CC:DD:EE:{n:02X}")).unwrap()
    }

    async fn store_in(dir: &Path) -> Store {
        Store::open(dir, EventBus::new()).await.unwrap()
    }

    #[tokio::test]
    async fn open_without_files_starts_empty() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        assert!(store.devices().await.is_empty());
        assert_eq!(store.get_settings().await, GlobalSettings::default());
    }

    #[tokio::test]
    async fn malformed_store_is_fatal() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(DEVICES_FILE), b"{\"devices\": [tru")
            .await
            .unwrap();
        let err = Store::open(dir.path(), EventBus::new()).await.unwrap_err();
        assert_eq!(err.kind(), btaudio_core::ErrorKind::StoreCorrupt);
    }

    #[tokio::test]
    async fn duplicate_addresses_are_fatal() {
        let dir = tempdir().unwrap();
        let record = serde_json::json!({
            "address": "AA:BB:CC:DD:EE:01",
            "name": "Twin",
            "paired_at": "2025-03-01T12:00:00Z"
        });
        let doc = serde_json::json!({ "devices": [record, record] });
        tokio::fs::write(dir.path().join(DEVICES_FILE), doc.to_string())
            .await
            .unwrap();
        assert!(Store::open(dir.path(), EventBus::new()).await.is_err());
    }

    #[tokio::test]
    async fn record_paired_then_reload() {
        let dir = tempdir().unwrap();
        {
            let store = store_in(dir.path()).await;
            store
                .record_paired(addr(1), "Kitchen Speaker".into())
                .await
                .unwrap();
        }
        let store = store_in(dir.path()).await;
        let devices = store.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Kitchen Speaker");
        assert!(devices[0].auto_connect);
    }

    #[tokio::test]
    async fn record_paired_twice_keeps_settings() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.record_paired(addr(1), "Old Name".into()).await.unwrap();
        store
            .update_device(
                &addr(1),
                &DevicePatch {
                    idle_mode: Some(IdleMode::KeepAlive),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let device = store.record_paired(addr(1), "New Name".into()).await.unwrap();
        assert_eq!(device.name, "New Name");
        assert_eq!(device.idle_mode, IdleMode::KeepAlive);
        assert_eq!(store.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn write_leaves_no_tmp_file() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.record_paired(addr(1), "Speaker".into()).await.unwrap();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".tmp"), "leftover temp file {name}");
        }
        // and the document on disk is complete JSON
        let bytes = tokio::fs::read(dir.path().join(DEVICES_FILE)).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["devices"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn port_allocation_lowest_free() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.record_paired(addr(1), "One".into()).await.unwrap();
        store.record_paired(addr(2), "Two".into()).await.unwrap();
        store.record_paired(addr(3), "Three".into()).await.unwrap();

        assert_eq!(store.allocate_mpd_port(&addr(1)).await.unwrap(), 6600);
        assert_eq!(store.allocate_mpd_port(&addr(2)).await.unwrap(), 6601);
        // repeated allocation returns the persisted choice
        assert_eq!(store.allocate_mpd_port(&addr(1)).await.unwrap(), 6600);

        // forget the first; the next device takes the lowest free port
        store.remove_device(&addr(1)).await.unwrap();
        assert_eq!(store.allocate_mpd_port(&addr(3)).await.unwrap(), 6600);
    }

    #[tokio::test]
    async fn port_pool_exhaustion() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        for n in 0..10u8 {
            store.record_paired(addr(n), format!("S{n}")).await.unwrap();
            store.allocate_mpd_port(&addr(n)).await.unwrap();
        }
        store.record_paired(addr(11), "Eleventh".into()).await.unwrap();
        let err = store.allocate_mpd_port(&addr(11)).await.unwrap_err();
        assert_eq!(err.kind(), btaudio_core::ErrorKind::NoFreeMpdPort);
    }

    #[tokio::test]
    async fn explicit_port_conflict_rejected() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.record_paired(addr(1), "One".into()).await.unwrap();
        store.record_paired(addr(2), "Two".into()).await.unwrap();
        assert_eq!(store.allocate_mpd_port(&addr(1)).await.unwrap(), 6600);
        let err = store
            .update_device(
                &addr(2),
                &DevicePatch {
                    mpd_port: Some(Some(6600)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), btaudio_core::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn release_port_persists() {
        let dir = tempdir().unwrap();
        {
            let store = store_in(dir.path()).await;
            store.record_paired(addr(1), "One".into()).await.unwrap();
            store.allocate_mpd_port(&addr(1)).await.unwrap();
            store.release_mpd_port(&addr(1)).await.unwrap();
        }
        let store = store_in(dir.path()).await;
        assert_eq!(store.devices().await[0].mpd_port, None);
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let dir = tempdir().unwrap();
        {
            let store = store_in(dir.path()).await;
            store
                .put_settings(&SettingsPatch {
                    auto_reconnect: Some(false),
                    scan_duration_seconds: Some(45),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let store = store_in(dir.path()).await;
        let settings = store.get_settings().await;
        assert!(!settings.auto_reconnect);
        assert_eq!(settings.scan_duration_seconds, 45);
    }

    #[tokio::test]
    async fn writes_emit_store_changed() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let sub = bus.subscribe(btaudio_bus::Replay::default());
        let store = Store::open(dir.path(), bus).await.unwrap();
        store.record_paired(addr(1), "One".into()).await.unwrap();
        assert_eq!(sub.try_recv(), Some(Event::StoreChanged));
    }

    #[tokio::test]
    async fn hfp_device_detection() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path()).await;
        store.record_paired(addr(1), "One".into()).await.unwrap();
        assert!(!store.has_hfp_devices().await);
        store
            .update_device(
                &addr(1),
                &DevicePatch {
                    audio_profile: Some(AudioProfile::Hfp),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.has_hfp_devices().await);
    }
}
