//! The daemon-wide error type.
//!
//! Every failure that can cross a component boundary is one of these
//! kinds. Backend crates map their native errors (bluer, zbus, I/O) into
//! this type at the seam so the coordinator and control API only ever see
//! the discriminated form.

use thiserror::Error;

/// Convenience Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminated error kinds, mirrored into control API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnreachable,
    AuthRejected,
    Busy,
    AlreadyPaired,
    BluezUnknown,
    AudioProfileFailed,
    SinkTimeout,
    NoFreeMpdPort,
    MpdFailed,
    AdapterNotFound,
    AdapterNotPowered,
    StoreCorrupt,
    PulseUnavailable,
    DbusUnavailable,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("device {address} is unreachable: {detail}")]
    DeviceUnreachable { address: String, detail: String },

    #[error("device {address} refused authentication: {detail}")]
    AuthRejected { address: String, detail: String },

    #[error("operation already in progress on {address}")]
    Busy { address: String },

    #[error("device {address} is already paired")]
    AlreadyPaired { address: String },

    #[error("BlueZ error: {0}")]
    BluezUnknown(String),

    #[error("could not activate {profile} audio profile for {address}")]
    AudioProfileFailed { address: String, profile: String },

    #[error("sink for {address} did not appear within {timeout_s}s")]
    SinkTimeout { address: String, timeout_s: u64 },

    #[error("no free MPD port in 6600-6609")]
    NoFreeMpdPort,

    #[error("MPD for {address} failed: {detail}")]
    MpdFailed { address: String, detail: String },

    #[error("Bluetooth adapter not found: {0}")]
    AdapterNotFound(String),

    #[error("Bluetooth adapter {0} is not powered")]
    AdapterNotPowered(String),

    #[error("persistent store is corrupt at {path}: {detail}")]
    StoreCorrupt { path: String, detail: String },

    #[error("PulseAudio unavailable: {0}")]
    PulseUnavailable(String),

    #[error("system D-Bus unavailable: {0}")]
    DbusUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    pub fn invalid_address(s: &str) -> Self {
        Error::InvalidRequest(format!("not a Bluetooth address: {s:?}"))
    }

    /// The discriminant carried in control API error responses.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DeviceUnreachable { .. } => ErrorKind::DeviceUnreachable,
            Error::AuthRejected { .. } => ErrorKind::AuthRejected,
            Error::Busy { .. } => ErrorKind::Busy,
            Error::AlreadyPaired { .. } => ErrorKind::AlreadyPaired,
            Error::BluezUnknown(_) => ErrorKind::BluezUnknown,
            Error::AudioProfileFailed { .. } => ErrorKind::AudioProfileFailed,
            Error::SinkTimeout { .. } => ErrorKind::SinkTimeout,
            Error::NoFreeMpdPort => ErrorKind::NoFreeMpdPort,
            Error::MpdFailed { .. } => ErrorKind::MpdFailed,
            Error::AdapterNotFound(_) => ErrorKind::AdapterNotFound,
            Error::AdapterNotPowered(_) => ErrorKind::AdapterNotPowered,
            Error::StoreCorrupt { .. } => ErrorKind::StoreCorrupt,
            Error::PulseUnavailable(_) => ErrorKind::PulseUnavailable,
            Error::DbusUnavailable(_) => ErrorKind::DbusUnavailable,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// A message worded for the person clicking the button, not for the log.
    pub fn user_message(&self) -> String {
        match self {
            Error::DeviceUnreachable { .. } => {
                "Device is not responding — make sure it is powered on and in range".into()
            }
            Error::AuthRejected { .. } => {
                "Device refused pairing — clear the speaker's paired list and try again".into()
            }
            Error::Busy { .. } => "Another operation is in progress — try again shortly".into(),
            Error::AlreadyPaired { .. } => "Device is already paired".into(),
            Error::AudioProfileFailed { profile, .. } => format!(
                "Could not activate the {profile} audio profile — \
                 try disconnecting and reconnecting the device"
            ),
            Error::SinkTimeout { .. } => {
                "The device connected but no audio output appeared".into()
            }
            Error::NoFreeMpdPort => "All ten MPD ports are in use".into(),
            Error::MpdFailed { .. } => {
                "The media player daemon keeps crashing — the device stays connected".into()
            }
            Error::AdapterNotFound(_) => "The selected Bluetooth adapter was not found".into(),
            Error::AdapterNotPowered(_) => "The Bluetooth adapter is powered off".into(),
            Error::PulseUnavailable(_) => "The audio server is not reachable".into(),
            other => other.to_string(),
        }
    }

    /// Errors that abort startup (once running, nothing is fatal).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Error::StoreCorrupt { .. }
                | Error::DbusUnavailable(_)
                | Error::AdapterNotFound(_)
                | Error::PulseUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = Error::AuthRejected {
            address: "AA:BB:CC:DD:EE:FF".into(),
            detail: "rejected".into(),
        };
        assert_eq!(err.kind(), ErrorKind::AuthRejected);
        assert!(err.user_message().contains("paired list"));
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::StoreCorrupt {
            path: "/data/paired_devices.json".into(),
            detail: "eof".into()
        }
        .is_fatal_at_startup());
        assert!(Error::DbusUnavailable("no bus".into()).is_fatal_at_startup());
        assert!(!Error::NoFreeMpdPort.is_fatal_at_startup());
        assert!(!Error::Busy {
            address: "AA:BB:CC:DD:EE:FF".into()
        }
        .is_fatal_at_startup());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AudioProfileFailed).unwrap();
        assert_eq!(json, "\"audio_profile_failed\"");
    }
}
