//! The control API.
//!
//! Transport-agnostic command surface: a request enum in, an
//! acknowledgement or a structured error out, plus an event
//! subscription with optional ring replay. Whatever carries these
//! messages (a web server, a CLI socket) lives outside the core.

use serde::{Deserialize, Serialize};

use btaudio_bluez::AdapterInfo;
use btaudio_bus::{Replay, Subscription};
use btaudio_core::{
    Address, DevicePatch, Error, ErrorKind, GlobalSettings, PersistedDevice, RuntimeDevice,
    SettingsPatch,
};

use crate::coordinator::Coordinator;

/// Commands accepted by the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Request {
    ListDevices,
    ListAdapters,
    SetAdapter {
        adapter: String,
        #[serde(default)]
        clean: bool,
    },
    StartScan,
    ScanStatus,
    Pair { address: Address },
    Connect { address: Address },
    Disconnect { address: Address },
    Forget { address: Address },
    ForceReconnect { address: Address },
    UpdateDeviceSettings {
        address: Address,
        patch: DevicePatch,
    },
    GetSettings,
    PutSettings { patch: SettingsPatch },
    Restart,
}

/// One Bluetooth adapter, as reported by `list-adapters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub address: Address,
    pub powered: bool,
    pub discovering: bool,
    pub selected: bool,
}

impl From<AdapterInfo> for AdapterDescriptor {
    fn from(info: AdapterInfo) -> Self {
        Self {
            name: info.name,
            address: info.address,
            powered: info.powered,
            discovering: info.discovering,
            selected: info.selected,
        }
    }
}

/// Successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Devices { devices: Vec<RuntimeDevice> },
    Adapters { adapters: Vec<AdapterDescriptor> },
    ScanStarted { duration_s: u64 },
    ScanStatus {
        scanning: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        seconds_remaining: Option<u64>,
    },
    Device { device: PersistedDevice },
    Settings { settings: GlobalSettings },
    RestartRequired,
}

/// The error shape every failed command returns: the discriminated
/// kind plus a message worded for the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
            detail: err.to_string(),
        }
    }
}

/// The command surface handed to whatever transport fronts the daemon.
#[derive(Clone)]
pub struct ControlApi {
    coordinator: Coordinator,
}

impl ControlApi {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Execute one command.
    pub async fn handle(&self, request: Request) -> Result<Reply, ApiError> {
        match request {
            Request::ListDevices => Ok(Reply::Devices {
                devices: self.coordinator.devices_snapshot(),
            }),
            Request::ListAdapters => {
                let adapters = self
                    .coordinator
                    .list_adapters()
                    .await?
                    .into_iter()
                    .map(AdapterDescriptor::from)
                    .collect();
                Ok(Reply::Adapters { adapters })
            }
            Request::SetAdapter { adapter, clean } => {
                self.coordinator.set_adapter(&adapter, clean).await?;
                Ok(Reply::RestartRequired)
            }
            Request::StartScan => {
                let duration_s = self.coordinator.start_scan().await?;
                Ok(Reply::ScanStarted { duration_s })
            }
            Request::ScanStatus => {
                let (scanning, seconds_remaining) = self.coordinator.scan_status();
                Ok(Reply::ScanStatus {
                    scanning,
                    seconds_remaining,
                })
            }
            Request::Pair { address } => {
                self.coordinator.pair(&address).await?;
                Ok(Reply::Ack)
            }
            Request::Connect { address } => {
                self.coordinator.connect(&address).await?;
                Ok(Reply::Ack)
            }
            Request::Disconnect { address } => {
                self.coordinator.disconnect(&address).await?;
                Ok(Reply::Ack)
            }
            Request::Forget { address } => {
                self.coordinator.forget(&address).await?;
                Ok(Reply::Ack)
            }
            Request::ForceReconnect { address } => {
                self.coordinator.force_reconnect(&address).await?;
                Ok(Reply::Ack)
            }
            Request::UpdateDeviceSettings { address, patch } => {
                let device = self
                    .coordinator
                    .update_device_settings(&address, &patch)
                    .await?;
                Ok(Reply::Device { device })
            }
            Request::GetSettings => Ok(Reply::Settings {
                settings: self.coordinator.get_settings().await,
            }),
            Request::PutSettings { patch } => {
                let settings = self.coordinator.put_settings(&patch).await?;
                Ok(Reply::Settings { settings })
            }
            Request::Restart => {
                self.coordinator.restart();
                Ok(Reply::Ack)
            }
        }
    }

    /// Attach an event subscriber, optionally replaying the AVRCP,
    /// MPRIS and log rings first.
    pub fn subscribe(&self, replay: Replay) -> Subscription {
        self.coordinator.subscribe(replay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_deserialize_kebab_case() {
        let request: Request = serde_json::from_str(
            r#"{"command": "update-device-settings",
                "address": "AA:BB:CC:DD:EE:01",
                "patch": {"idle_mode": "power_save", "power_save_delay_s": 30}}"#,
        )
        .unwrap();
        match request {
            Request::UpdateDeviceSettings { address, patch } => {
                assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:01");
                assert_eq!(patch.power_save_delay_s, Some(30));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_patch_keys_fail_at_the_boundary() {
        let result: Result<Request, _> = serde_json::from_str(
            r#"{"command": "update-device-settings",
                "address": "AA:BB:CC:DD:EE:01",
                "patch": {"no_such_setting": true}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn api_error_carries_kind_and_user_message() {
        let err: ApiError = Error::AuthRejected {
            address: "AA:BB:CC:DD:EE:01".into(),
            detail: "Authentication Rejected".into(),
        }
        .into();
        assert_eq!(err.kind, ErrorKind::AuthRejected);
        assert!(err.message.contains("paired list"));
        assert!(err.detail.contains("Authentication Rejected"));
    }

    #[test]
    fn set_adapter_clean_defaults_false() {
        let request: Request =
            serde_json::from_str(r#"{"command": "set-adapter", "adapter": "00:1A:7D:DA:71:11"}"#)
                .unwrap();
        match request {
            Request::SetAdapter { clean, .. } => assert!(!clean),
            other => panic!("unexpected {other:?}"),
        }
    }
}
