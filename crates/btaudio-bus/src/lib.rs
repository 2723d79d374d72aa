//! # btaudio-bus
//!
//! In-process pub/sub fanning daemon events out to API subscribers.
//!
//! Each subscriber owns an independent bounded queue; a slow subscriber
//! loses its oldest entries (counted, never blocking the publisher).
//! Three replay rings let a freshly attached subscriber catch up on
//! recent AVRCP events, MPRIS commands, and log records before live
//! delivery begins.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use btaudio_core::{AvrcpEntry, Event, LogEntry, MprisEntry};

/// Per-subscriber queue capacity.
pub const QUEUE_CAPACITY: usize = 64;
/// Replay ring size for `avrcp_event` and `mpris_event`.
pub const EVENT_RING_CAPACITY: usize = 50;
/// Replay ring size for `log_entry`.
pub const LOG_RING_CAPACITY: usize = 500;

/// Which rings to replay into a new subscription before live events.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replay {
    pub avrcp: bool,
    pub mpris: bool,
    pub log: bool,
}

impl Replay {
    pub fn all() -> Self {
        Self {
            avrcp: true,
            mpris: true,
            log: true,
        }
    }
}

struct SubscriberInner {
    queue: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
    notify: Notify,
}

impl SubscriberInner {
    /// Push one event, evicting the oldest entry when full. O(1).
    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock();
            if queue.len() == QUEUE_CAPACITY {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// A live subscription. Dropping it detaches from the bus.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Receive the next event, waiting if the queue is empty.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.inner.queue.lock().pop_front() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Take the next event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.inner.queue.lock().pop_front()
    }

    /// How many events this subscriber has lost to queue overflow.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct BusInner {
    subscribers: Mutex<Vec<Weak<SubscriberInner>>>,
    avrcp_ring: Mutex<VecDeque<AvrcpEntry>>,
    mpris_ring: Mutex<VecDeque<MprisEntry>>,
    log_ring: Mutex<VecDeque<LogEntry>>,
}

/// Handle to the bus; cheap to clone and thread through the daemon.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                avrcp_ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
                mpris_ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
                log_ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            }),
        }
    }

    /// Attach a subscriber, optionally seeding its queue from the rings.
    ///
    /// Replayed entries count against the queue capacity like any other
    /// event, so requesting the full log ring on a cold start will only
    /// retain the most recent `QUEUE_CAPACITY` records.
    pub fn subscribe(&self, replay: Replay) -> Subscription {
        let sub = Arc::new(SubscriberInner {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        if replay.avrcp {
            for entry in self.inner.avrcp_ring.lock().iter() {
                sub.push(Event::AvrcpEvent(entry.clone()));
            }
        }
        if replay.mpris {
            for entry in self.inner.mpris_ring.lock().iter() {
                sub.push(Event::MprisEvent(entry.clone()));
            }
        }
        if replay.log {
            for entry in self.inner.log_ring.lock().iter() {
                sub.push(Event::LogEntry(entry.clone()));
            }
        }
        let total = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.retain(|weak| weak.strong_count() > 0);
            subscribers.push(Arc::downgrade(&sub));
            subscribers.len()
        };
        // logged outside the lock: log records themselves flow through
        // publish(), which takes the same lock
        debug!(total, "bus subscriber attached");
        Subscription { inner: sub }
    }

    /// Publish to every live subscriber and record replayable topics.
    pub fn publish(&self, event: Event) {
        match &event {
            Event::AvrcpEvent(entry) => {
                push_ring(&self.inner.avrcp_ring, entry.clone(), EVENT_RING_CAPACITY)
            }
            Event::MprisEvent(entry) => {
                push_ring(&self.inner.mpris_ring, entry.clone(), EVENT_RING_CAPACITY)
            }
            Event::LogEntry(entry) => {
                push_ring(&self.inner.log_ring, entry.clone(), LOG_RING_CAPACITY)
            }
            _ => {}
        }
        let subscribers = self.inner.subscribers.lock();
        for weak in subscribers.iter() {
            if let Some(sub) = weak.upgrade() {
                sub.push(event.clone());
            }
        }
    }

    /// Publish a `status` banner.
    pub fn status(&self, message: impl Into<String>) {
        self.publish(Event::Status {
            message: Some(message.into()),
        });
    }

    /// Clear the `status` banner.
    pub fn clear_status(&self) {
        self.publish(Event::Status { message: None });
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

fn push_ring<T>(ring: &Mutex<VecDeque<T>>, entry: T, capacity: usize) {
    let mut ring = ring.lock();
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use btaudio_core::Address;
    use chrono::Utc;

    fn avrcp(n: u32) -> Event {
        Event::AvrcpEvent(AvrcpEntry {
            address: Address::parse("AA:BB:CC:DD:EE:01").unwrap(),
            property: "Volume".into(),
            value: format!("{n}%"),
            ts: Utc::now(),
        })
    }

    #[test]
    fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe(Replay::default());
        let b = bus.subscribe(Replay::default());
        bus.publish(Event::StoreChanged);
        assert_eq!(a.try_recv(), Some(Event::StoreChanged));
        assert_eq!(b.try_recv(), Some(Event::StoreChanged));
        assert_eq!(a.try_recv(), None);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Replay::default());
        for n in 0..QUEUE_CAPACITY as u32 + 3 {
            bus.publish(avrcp(n));
        }
        assert_eq!(sub.dropped_count(), 3);
        // the three oldest entries are gone; the first visible one is n=3
        match sub.try_recv() {
            Some(Event::AvrcpEvent(entry)) => assert_eq!(entry.value, "3%"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let slow = bus.subscribe(Replay::default());
        for n in 0..QUEUE_CAPACITY as u32 + 1 {
            bus.publish(avrcp(n));
        }
        let fresh = bus.subscribe(Replay::default());
        bus.publish(Event::StoreChanged);
        assert_eq!(slow.dropped_count(), 1);
        assert_eq!(fresh.dropped_count(), 0);
        assert_eq!(fresh.try_recv(), Some(Event::StoreChanged));
    }

    #[test]
    fn replay_seeds_new_subscriber() {
        let bus = EventBus::new();
        bus.publish(avrcp(1));
        bus.publish(avrcp(2));
        let sub = bus.subscribe(Replay {
            avrcp: true,
            ..Default::default()
        });
        match sub.try_recv() {
            Some(Event::AvrcpEvent(entry)) => assert_eq!(entry.value, "1%"),
            other => panic!("unexpected {other:?}"),
        }
        match sub.try_recv() {
            Some(Event::AvrcpEvent(entry)) => assert_eq!(entry.value, "2%"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn ring_is_bounded() {
        let bus = EventBus::new();
        for n in 0..EVENT_RING_CAPACITY as u32 + 10 {
            bus.publish(avrcp(n));
        }
        let sub = bus.subscribe(Replay {
            avrcp: true,
            ..Default::default()
        });
        // ring holds the newest 50; queue keeps them all (50 < 64)
        match sub.try_recv() {
            Some(Event::AvrcpEvent(entry)) => assert_eq!(entry.value, "10%"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropped_subscription_detaches() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Replay::default());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(Event::StoreChanged);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(Replay::default());
        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(Event::StoreChanged);
        });
        let event = sub.recv().await;
        assert_eq!(event, Event::StoreChanged);
    }
}
