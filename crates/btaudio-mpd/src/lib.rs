//! # btaudio-mpd
//!
//! One embedded MPD daemon per enabled device, outputting through the
//! device's PulseAudio sink. The supervisor generates the config,
//! spawns and restarts the daemon, and bridges AVRCP transport
//! commands to a control client on the daemon's port.

pub mod client;
pub mod config;
pub mod supervisor;

pub use client::MpdClient;
pub use config::MpdLayout;
pub use supervisor::{MpdSupervisor, TransportCommand};
