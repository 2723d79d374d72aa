//! Event payloads fanned out through the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::device::RuntimeDevice;

/// One AVRCP property change, kept in a replay ring for late subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvrcpEntry {
    pub address: Address,
    pub property: String,
    pub value: String,
    pub ts: DateTime<Utc>,
}

/// One command received through the MPRIS player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MprisEntry {
    /// Resolved source device, when the recent-activity window had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub ts: DateTime<Utc>,
}

/// One log record mirrored onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub logger: String,
    pub message: String,
}

/// Everything a subscriber can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    DevicesChanged { devices: Vec<RuntimeDevice> },
    ScanStarted { duration_s: u64 },
    ScanFinished { error: Option<String> },
    /// Short human banner; `None` clears it.
    Status { message: Option<String> },
    AvrcpEvent(AvrcpEntry),
    MprisEvent(MprisEntry),
    LogEntry(LogEntry),
    AdapterSwitchRequired { adapter: Address },
    StoreChanged,
}

impl Event {
    /// The topic string, e.g. for subscriber-side filtering.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::DevicesChanged { .. } => "devices_changed",
            Event::ScanStarted { .. } => "scan_started",
            Event::ScanFinished { .. } => "scan_finished",
            Event::Status { .. } => "status",
            Event::AvrcpEvent(_) => "avrcp_event",
            Event::MprisEvent(_) => "mpris_event",
            Event::LogEntry(_) => "log_entry",
            Event::AdapterSwitchRequired { .. } => "adapter_switch_required",
            Event::StoreChanged => "store_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_topic_tag() {
        let event = Event::ScanStarted { duration_s: 30 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "scan_started");
        assert_eq!(json["data"]["duration_s"], 30);
    }

    #[test]
    fn status_none_clears_banner() {
        let event = Event::Status { message: None };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["data"]["message"].is_null());
    }
}
