//! The persisted and runtime device models.
//!
//! `PersistedDevice` and `GlobalSettings` are the on-disk shapes;
//! `RuntimeDevice` is the in-memory view published to subscribers.
//! Patches are explicit structs with every field optional — unknown
//! keys are rejected during deserialization, and range checks happen
//! in `apply_to` before anything touches the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{Error, Result};

/// Valid MPD port pool, inclusive.
pub const MPD_PORT_MIN: u16 = 6600;
pub const MPD_PORT_MAX: u16 = 6609;

/// Audio profile a device's PulseAudio card is driven towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AudioProfile {
    #[default]
    A2dp,
    Hfp,
}

impl AudioProfile {
    pub fn label(&self) -> &'static str {
        match self {
            AudioProfile::A2dp => "A2DP",
            AudioProfile::Hfp => "HFP",
        }
    }
}

/// What the daemon does while a connected device's sink is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdleMode {
    #[default]
    Default,
    PowerSave,
    KeepAlive,
    AutoDisconnect,
}

/// How keep-alive audio is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMethod {
    /// 2 Hz sine at low amplitude; defeats digital-silence detection.
    #[default]
    Infrasound,
    /// PCM zeros; cheapest, but some speakers still sleep on it.
    Silence,
}

/// PulseAudio sink state as observed by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkState {
    #[default]
    Absent,
    Suspended,
    Idle,
    Running,
}

/// One paired device as stored in `paired_devices.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub address: Address,
    pub name: String,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    pub paired_at: DateTime<Utc>,
    #[serde(default)]
    pub audio_profile: AudioProfile,
    #[serde(default)]
    pub idle_mode: IdleMode,
    #[serde(default)]
    pub keep_alive_method: KeepAliveMethod,
    #[serde(default)]
    pub power_save_delay_s: u32,
    #[serde(default = "default_auto_disconnect_minutes")]
    pub auto_disconnect_minutes: u32,
    #[serde(default)]
    pub mpd_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpd_port: Option<u16>,
    #[serde(default = "default_hw_volume")]
    pub mpd_hw_volume_pct: u8,
    #[serde(default = "default_true")]
    pub avrcp_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_auto_disconnect_minutes() -> u32 {
    30
}

fn default_hw_volume() -> u8 {
    100
}

impl PersistedDevice {
    /// A fresh record for a just-paired device, everything at defaults.
    pub fn new(address: Address, name: String, paired_at: DateTime<Utc>) -> Self {
        Self {
            address,
            name,
            auto_connect: true,
            paired_at,
            audio_profile: AudioProfile::default(),
            idle_mode: IdleMode::default(),
            keep_alive_method: KeepAliveMethod::default(),
            power_save_delay_s: 0,
            auto_disconnect_minutes: default_auto_disconnect_minutes(),
            mpd_enabled: false,
            mpd_port: None,
            mpd_hw_volume_pct: default_hw_volume(),
            avrcp_enabled: true,
        }
    }
}

/// Partial update of a device record. Unknown keys are a request error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub auto_connect: Option<bool>,
    pub audio_profile: Option<AudioProfile>,
    pub idle_mode: Option<IdleMode>,
    pub keep_alive_method: Option<KeepAliveMethod>,
    pub power_save_delay_s: Option<u32>,
    pub auto_disconnect_minutes: Option<u32>,
    pub mpd_enabled: Option<bool>,
    pub mpd_port: Option<Option<u16>>,
    pub mpd_hw_volume_pct: Option<u8>,
    pub avrcp_enabled: Option<bool>,
}

impl DevicePatch {
    /// Validate ranges and apply onto an existing record.
    pub fn apply_to(&self, device: &mut PersistedDevice) -> Result<()> {
        if let Some(delay) = self.power_save_delay_s {
            if delay > 300 {
                return Err(Error::InvalidRequest(format!(
                    "power_save_delay_s {delay} outside 0-300"
                )));
            }
        }
        if let Some(minutes) = self.auto_disconnect_minutes {
            if !(1..=1440).contains(&minutes) {
                return Err(Error::InvalidRequest(format!(
                    "auto_disconnect_minutes {minutes} outside 1-1440"
                )));
            }
        }
        if let Some(Some(port)) = self.mpd_port {
            if !(MPD_PORT_MIN..=MPD_PORT_MAX).contains(&port) {
                return Err(Error::InvalidRequest(format!(
                    "mpd_port {port} outside {MPD_PORT_MIN}-{MPD_PORT_MAX}"
                )));
            }
        }
        if let Some(vol) = self.mpd_hw_volume_pct {
            if vol > 100 {
                return Err(Error::InvalidRequest(format!(
                    "mpd_hw_volume_pct {vol} outside 0-100"
                )));
            }
        }
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(Error::InvalidRequest("name must not be empty".into()));
            }
            device.name = name.clone();
        }
        if let Some(v) = self.auto_connect {
            device.auto_connect = v;
        }
        if let Some(v) = self.audio_profile {
            device.audio_profile = v;
        }
        if let Some(v) = self.idle_mode {
            device.idle_mode = v;
        }
        if let Some(v) = self.keep_alive_method {
            device.keep_alive_method = v;
        }
        if let Some(v) = self.power_save_delay_s {
            device.power_save_delay_s = v;
        }
        if let Some(v) = self.auto_disconnect_minutes {
            device.auto_disconnect_minutes = v;
        }
        if let Some(v) = self.mpd_enabled {
            device.mpd_enabled = v;
        }
        if let Some(v) = self.mpd_port {
            device.mpd_port = v;
        }
        if let Some(v) = self.mpd_hw_volume_pct {
            device.mpd_hw_volume_pct = v;
        }
        if let Some(v) = self.avrcp_enabled {
            device.avrcp_enabled = v;
        }
        Ok(())
    }
}

/// Daemon-wide settings stored in `settings.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Adapter MAC, or the sentinel `"auto"`.
    #[serde(default = "default_adapter")]
    pub selected_adapter: String,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,
    #[serde(default = "default_reconnect_max_backoff")]
    pub reconnect_max_backoff_seconds: u64,
    #[serde(default = "default_scan_duration")]
    pub scan_duration_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_adapter() -> String {
    "auto".into()
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_reconnect_max_backoff() -> u64 {
    300
}

fn default_scan_duration() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            selected_adapter: default_adapter(),
            auto_reconnect: true,
            reconnect_interval_seconds: default_reconnect_interval(),
            reconnect_max_backoff_seconds: default_reconnect_max_backoff(),
            scan_duration_seconds: default_scan_duration(),
            log_level: default_log_level(),
        }
    }
}

impl GlobalSettings {
    /// Whether the configured adapter is the auto sentinel.
    pub fn adapter_is_auto(&self) -> bool {
        self.selected_adapter.eq_ignore_ascii_case("auto")
    }
}

/// Partial update of the global settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub selected_adapter: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub reconnect_interval_seconds: Option<u64>,
    pub reconnect_max_backoff_seconds: Option<u64>,
    pub scan_duration_seconds: Option<u64>,
    pub log_level: Option<String>,
}

impl SettingsPatch {
    pub fn apply_to(&self, settings: &mut GlobalSettings) -> Result<()> {
        let interval = self
            .reconnect_interval_seconds
            .unwrap_or(settings.reconnect_interval_seconds);
        let max_backoff = self
            .reconnect_max_backoff_seconds
            .unwrap_or(settings.reconnect_max_backoff_seconds);
        if interval < 1 {
            return Err(Error::InvalidRequest(
                "reconnect_interval_seconds must be at least 1".into(),
            ));
        }
        if max_backoff < interval {
            return Err(Error::InvalidRequest(format!(
                "reconnect_max_backoff_seconds {max_backoff} below interval {interval}"
            )));
        }
        if let Some(duration) = self.scan_duration_seconds {
            if !(1..=600).contains(&duration) {
                return Err(Error::InvalidRequest(format!(
                    "scan_duration_seconds {duration} outside 1-600"
                )));
            }
        }
        if let Some(level) = &self.log_level {
            if !matches!(level.as_str(), "debug" | "info" | "warning" | "error") {
                return Err(Error::InvalidRequest(format!("unknown log_level {level:?}")));
            }
        }
        if let Some(adapter) = &self.selected_adapter {
            if !adapter.eq_ignore_ascii_case("auto") {
                Address::parse(adapter)?;
            }
            settings.selected_adapter = adapter.clone();
        }
        if let Some(v) = self.auto_reconnect {
            settings.auto_reconnect = v;
        }
        settings.reconnect_interval_seconds = interval;
        settings.reconnect_max_backoff_seconds = max_backoff;
        if let Some(v) = self.scan_duration_seconds {
            settings.scan_duration_seconds = v;
        }
        if let Some(v) = &self.log_level {
            settings.log_level = v.clone();
        }
        Ok(())
    }
}

/// Where a runtime device currently is in its lifecycle. The per-address
/// lock serializes the transitions; this tag answers "is it busy?" without
/// taking the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Discovered,
    Pairing,
    Connecting,
    Connected,
    Disconnecting,
    Forgetting,
}

/// The live view of one managed device, published on `devices_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDevice {
    pub address: Address,
    pub name: String,
    /// Present for stored devices; `None` for merely discovered ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persisted: Option<PersistedDevice>,
    pub state: DeviceState,
    pub present_in_bluez: bool,
    pub paired_in_bluez: bool,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(default)]
    pub uuids: Vec<String>,
    pub sink_state: SinkState,
    pub keep_alive_active: bool,
    /// Whether this device's MPD instance is up (false also covers the
    /// degraded gave-up-after-crashes condition).
    #[serde(default)]
    pub mpd_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// True while the per-device lock is held by an operation.
    pub transitioning: bool,
}

impl RuntimeDevice {
    pub fn new(address: Address, name: String) -> Self {
        Self {
            address,
            name,
            persisted: None,
            state: DeviceState::Discovered,
            present_in_bluez: false,
            paired_in_bluez: false,
            connected: false,
            rssi: None,
            uuids: Vec::new(),
            sink_state: SinkState::Absent,
            keep_alive_active: false,
            mpd_running: false,
            last_connected_at: None,
            last_disconnected_at: None,
            transitioning: false,
        }
    }

    pub fn stored(&self) -> bool {
        self.persisted.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> PersistedDevice {
        PersistedDevice::new(
            Address::parse("AA:BB:CC:DD:EE:01").unwrap(),
            "Kitchen Speaker".into(),
            Utc::now(),
        )
    }

    #[test]
    fn patch_rejects_unknown_keys() {
        let err = serde_json::from_str::<DevicePatch>(r#"{"idle_mode":"keep_alive","bogus":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn patch_validates_ranges() {
        let mut device = sample_device();
        let patch = DevicePatch {
            power_save_delay_s: Some(301),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut device).is_err());

        let patch = DevicePatch {
            mpd_port: Some(Some(6610)),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut device).is_err());

        let patch = DevicePatch {
            auto_disconnect_minutes: Some(0),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut device).is_err());
    }

    #[test]
    fn patch_applies_fields() {
        let mut device = sample_device();
        let patch = DevicePatch {
            idle_mode: Some(IdleMode::KeepAlive),
            keep_alive_method: Some(KeepAliveMethod::Silence),
            mpd_enabled: Some(true),
            ..Default::default()
        };
        patch.apply_to(&mut device).unwrap();
        assert_eq!(device.idle_mode, IdleMode::KeepAlive);
        assert_eq!(device.keep_alive_method, KeepAliveMethod::Silence);
        assert!(device.mpd_enabled);
        // untouched fields keep their values
        assert_eq!(device.name, "Kitchen Speaker");
        assert!(device.auto_connect);
    }

    #[test]
    fn patch_can_clear_mpd_port() {
        let mut device = sample_device();
        device.mpd_port = Some(6600);
        let patch = DevicePatch {
            mpd_port: Some(None),
            ..Default::default()
        };
        patch.apply_to(&mut device).unwrap();
        assert_eq!(device.mpd_port, None);
    }

    #[test]
    fn settings_patch_enforces_backoff_relation() {
        let mut settings = GlobalSettings::default();
        let patch = SettingsPatch {
            reconnect_interval_seconds: Some(120),
            reconnect_max_backoff_seconds: Some(60),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut settings).is_err());

        // raising the interval alone must also respect the existing cap
        let patch = SettingsPatch {
            reconnect_interval_seconds: Some(600),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut settings).is_err());
    }

    #[test]
    fn settings_patch_validates_adapter() {
        let mut settings = GlobalSettings::default();
        let patch = SettingsPatch {
            selected_adapter: Some("not-a-mac".into()),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut settings).is_err());

        let patch = SettingsPatch {
            selected_adapter: Some("00:1A:7D:DA:71:11".into()),
            ..Default::default()
        };
        patch.apply_to(&mut settings).unwrap();
        assert!(!settings.adapter_is_auto());
    }

    #[test]
    fn persisted_device_roundtrips_with_defaults() {
        let json = r#"{
            "address": "AA:BB:CC:DD:EE:01",
            "name": "Bose Mini",
            "paired_at": "2025-03-01T12:00:00Z"
        }"#;
        let device: PersistedDevice = serde_json::from_str(json).unwrap();
        assert!(device.auto_connect);
        assert_eq!(device.idle_mode, IdleMode::Default);
        assert_eq!(device.auto_disconnect_minutes, 30);
        assert_eq!(device.mpd_hw_volume_pct, 100);
        assert!(device.avrcp_enabled);
        assert_eq!(device.mpd_port, None);
    }
}
