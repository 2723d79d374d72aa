//! # btaudio-daemon
//!
//! The orchestration layer: the coordinator owning the device map and
//! per-device locks, the reconnection controller, the sink poller and
//! idle-mode engine, the control API, and the tracing-to-bus bridge.

pub mod context;
pub mod control;
pub mod coordinator;
pub mod idle;
pub mod logging;
pub mod reconnect;

pub use context::Context;
pub use control::{ApiError, ControlApi, Reply, Request};
pub use coordinator::Coordinator;
pub use logging::BusLayer;
pub use reconnect::ReconnectController;
