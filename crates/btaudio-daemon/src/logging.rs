//! Bridge from `tracing` records to the event bus.
//!
//! Subscribers of the control API see recent daemon logs through the
//! `log_entry` ring without scraping the journal.

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use btaudio_bus::EventBus;
use btaudio_core::{Event, LogEntry};

pub struct BusLayer {
    bus: EventBus,
}

impl BusLayer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl<S: tracing::Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        self.bus.publish(Event::LogEntry(LogEntry {
            ts: Utc::now(),
            level: metadata.level().to_string().to_lowercase(),
            logger: metadata.target().to_string(),
            message: visitor.into_message(),
        }));
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl RecordVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let extras: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if self.message.is_empty() {
            extras.join(" ")
        } else {
            format!("{} {}", self.message, extras.join(" "))
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_reach_the_bus_ring() {
        let bus = EventBus::new();
        let subscriber = tracing_subscriber::registry().with(BusLayer::new(bus.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(device = "AA:BB:CC:DD:EE:01", "connect started");
        });
        let sub = bus.subscribe(btaudio_bus::Replay {
            log: true,
            ..Default::default()
        });
        match sub.try_recv() {
            Some(Event::LogEntry(entry)) => {
                assert_eq!(entry.level, "info");
                assert!(entry.message.contains("connect started"));
                assert!(entry.message.contains("AA:BB:CC:DD:EE:01"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
