//! # btaudio-pulse
//!
//! PulseAudio control plane for Bluetooth sinks.
//!
//! The server is driven through `pactl`/`pacat` child processes with the
//! resolved `PULSE_SERVER` in their environment. The native protocol
//! client was deliberately not used: the C binding drags a blocking
//! callback mainloop into an otherwise single-threaded cooperative
//! daemon, and `pactl` is already required on the host for card-profile
//! switching.

pub mod client;
pub mod keepalive;
pub mod monitor;
mod parse;

pub use client::{PulseClient, SinkInfo};
pub use keepalive::KeepAlive;
pub use monitor::{PulseEvent, SinkMonitor};
