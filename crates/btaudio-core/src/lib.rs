//! # btaudio-core
//!
//! Shared types for the btaudiod daemon: the canonical device address,
//! the persisted and runtime device models, event payloads, and the
//! daemon-wide error type.
//!
//! Everything here is plain data — no I/O, no D-Bus, no PulseAudio.
//! The heavier crates (`btaudio-bluez`, `btaudio-pulse`, ...) convert
//! their backend-specific types into these at their seams.

pub mod address;
pub mod device;
pub mod error;
pub mod event;

pub use address::Address;
pub use device::{
    AudioProfile, DevicePatch, DeviceState, GlobalSettings, IdleMode, KeepAliveMethod,
    PersistedDevice, RuntimeDevice, SettingsPatch, SinkState, MPD_PORT_MAX, MPD_PORT_MIN,
};
pub use error::{Error, ErrorKind, Result};
pub use event::{AvrcpEntry, Event, LogEntry, MprisEntry};

/// Process exit codes understood by the surrounding supervisor.
pub mod exit_code {
    /// Normal shutdown.
    pub const OK: i32 = 0;
    /// Adapter switch persisted — the supervisor should restart us.
    pub const RESTART_REQUIRED: i32 = 64;
    /// Fatal initialization error (store corrupt, agent registration, ...).
    pub const INIT_FAILED: i32 = 70;
    /// System D-Bus unavailable.
    pub const DBUS_UNAVAILABLE: i32 = 71;
    /// PulseAudio unavailable past the reconnect window.
    pub const PULSE_UNAVAILABLE: i32 = 72;
}
