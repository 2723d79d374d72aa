//! # btaudio-bluez
//!
//! Typed wrappers around the BlueZ D-Bus objects this daemon touches:
//! the adapter (discovery, device removal), individual devices (pairing,
//! connecting, profile activation, property signals), and the
//! "just works" pairing agent.
//!
//! BlueZ errors are mapped into the daemon's discriminated error kinds
//! at this seam; nothing above this crate sees a raw `bluer::Error`.

#![cfg(target_os = "linux")]

pub mod adapter;
pub mod agent;
pub mod device;
pub mod error;
pub mod uuids;

pub use adapter::{AdapterInfo, BluezAdapter};
pub use agent::PairingAgent;
pub use device::{BluezDevice, DeviceSignal, DeviceSignalKind, DeviceSnapshot};
pub use error::map_bluez_error;
