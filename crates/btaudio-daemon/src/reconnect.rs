//! The reconnection controller.
//!
//! One schedule task per device. The first attempt is a fixed quick
//! retry at 10 s (transient drops — AVRCP hiccups, brief range loss);
//! later attempts back off by ×1.5 from the configured base, capped at
//! the configured maximum, all with ±20 % jitter.
//!
//! The controller only handles timing. At each firing it asks the
//! coordinator to run the gates (global auto-reconnect, per-device
//! auto-connect, stored, not suppressed) and the actual connect; a
//! gate failure cancels the schedule.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use btaudio_bus::EventBus;
use btaudio_core::Address;
use btaudio_store::Store;

/// Fixed delay of the quick first attempt.
const QUICK_RETRY_SECS: f64 = 10.0;
/// Jitter applied to every delay.
const JITTER_FRACTION: f64 = 0.2;

/// Adapter-disruption guard: this many drops inside the window opens a
/// suppression period.
const DISRUPTION_MIN_DROPS: usize = 2;
const DISRUPTION_WINDOW: Duration = Duration::from_secs(3);
const SUPPRESSION_PERIOD: Duration = Duration::from_secs(60);

/// Outcome the coordinator reports for one fired attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Connected; the schedule ends.
    Connected,
    /// Attempt failed; keep backing off.
    Failed,
    /// A gate failed; the schedule ends without rescheduling.
    Cancel,
}

/// A due attempt, sent to the coordinator.
pub struct ReconnectRequest {
    pub address: Address,
    pub attempt: u32,
    pub reply: oneshot::Sender<FireOutcome>,
}

/// Nominal-then-jittered delay for attempt `k` (1-based).
///
/// `jitter` is in [-JITTER_FRACTION, +JITTER_FRACTION].
fn delay_for_attempt(attempt: u32, base_s: u64, cap_s: u64, jitter: f64) -> Duration {
    let nominal = if attempt <= 1 {
        QUICK_RETRY_SECS
    } else {
        let exp = (attempt - 2) as i32;
        (base_s as f64 * 1.5f64.powi(exp)).min(cap_s as f64)
    };
    Duration::from_secs_f64(nominal * (1.0 + jitter))
}

fn random_jitter() -> f64 {
    rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION)
}

/// Tracks connected→disconnected transitions to detect an adapter-wide
/// disruption (USB reset, rfkill) and open a suppression window so the
/// controller does not hammer a recovering adapter.
struct DisruptionGuard {
    drops: VecDeque<Instant>,
    suppressed_until: Option<Instant>,
}

impl DisruptionGuard {
    fn new() -> Self {
        Self {
            drops: VecDeque::new(),
            suppressed_until: None,
        }
    }

    /// Record one drop. Returns true when this drop newly opens the
    /// suppression window.
    fn note(&mut self, now: Instant) -> bool {
        while let Some(front) = self.drops.front() {
            if now.duration_since(*front) > DISRUPTION_WINDOW {
                self.drops.pop_front();
            } else {
                break;
            }
        }
        self.drops.push_back(now);
        if self.drops.len() >= DISRUPTION_MIN_DROPS && !self.active(now) {
            self.suppressed_until = Some(now + SUPPRESSION_PERIOD);
            return true;
        }
        false
    }

    fn active(&self, now: Instant) -> bool {
        self.suppressed_until.is_some_and(|until| now < until)
    }

    fn until(&self) -> Option<Instant> {
        self.suppressed_until
    }
}

struct Inner {
    store: Arc<Store>,
    bus: EventBus,
    fire_tx: mpsc::Sender<ReconnectRequest>,
    tasks: Mutex<HashMap<Address, JoinHandle<()>>>,
    guard: Mutex<DisruptionGuard>,
}

/// Handle to the controller; cheap to clone.
#[derive(Clone)]
pub struct ReconnectController {
    inner: Arc<Inner>,
}

impl ReconnectController {
    /// Create the controller. The receiver side of the returned channel
    /// belongs to the coordinator's event loop.
    pub fn new(store: Arc<Store>, bus: EventBus) -> (Self, mpsc::Receiver<ReconnectRequest>) {
        let (fire_tx, fire_rx) = mpsc::channel(16);
        let controller = Self {
            inner: Arc::new(Inner {
                store,
                bus,
                fire_tx,
                tasks: Mutex::new(HashMap::new()),
                guard: Mutex::new(DisruptionGuard::new()),
            }),
        };
        (controller, fire_rx)
    }

    /// A device dropped unexpectedly: feed the disruption guard and
    /// schedule the quick first attempt.
    pub fn on_unexpected_disconnect(&self, address: &Address) {
        let now = Instant::now();
        let opened = self.inner.guard.lock().note(now);
        if opened {
            warn!("multiple devices dropped at once, pausing reconnects for 60s");
            self.inner.bus.status(
                "Several devices disconnected at once — pausing reconnect attempts for a minute",
            );
        }
        self.schedule(address.clone(), None);
    }

    /// On startup, schedule attempts for every auto-connect device,
    /// staggered over 0–2 s so a powered rack does not page all
    /// speakers simultaneously.
    pub async fn bootstrap(&self) {
        let devices = self.inner.store.auto_connect_devices().await;
        if devices.is_empty() {
            return;
        }
        info!(count = devices.len(), "scheduling startup reconnects");
        for device in devices {
            let stagger = Duration::from_millis(rand::thread_rng().gen_range(0..2000));
            self.schedule(device.address, Some(stagger));
        }
    }

    /// Drop any scheduled attempt for a device.
    pub fn cancel(&self, address: &Address) {
        if let Some(task) = self.inner.tasks.lock().remove(address) {
            task.abort();
            debug!(%address, "reconnect schedule cancelled");
        }
    }

    /// Drop every schedule (shutdown, adapter switch).
    pub fn cancel_all(&self) {
        let mut tasks = self.inner.tasks.lock();
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    /// Whether a schedule is currently pending for the device.
    pub fn is_scheduled(&self, address: &Address) -> bool {
        self.inner
            .tasks
            .lock()
            .get(address)
            .is_some_and(|t| !t.is_finished())
    }

    fn schedule(&self, address: Address, initial_delay: Option<Duration>) {
        let mut tasks = self.inner.tasks.lock();
        if let Some(existing) = tasks.get(&address) {
            if !existing.is_finished() {
                debug!(%address, "reconnect already scheduled");
                return;
            }
        }
        let inner = Arc::clone(&self.inner);
        let key = address.clone();
        let task = tokio::spawn(run_schedule(inner, address, initial_delay));
        tasks.insert(key, task);
    }
}

/// The per-device schedule: quick retry, then backoff, until the
/// coordinator reports success or a gate cancels.
async fn run_schedule(inner: Arc<Inner>, address: Address, initial_delay: Option<Duration>) {
    if let Some(delay) = initial_delay {
        tokio::time::sleep(delay).await;
    }
    let mut attempt = 1u32;
    loop {
        let settings = inner.store.get_settings().await;
        let delay = delay_for_attempt(
            attempt,
            settings.reconnect_interval_seconds,
            settings.reconnect_max_backoff_seconds,
            random_jitter(),
        );
        debug!(%address, attempt, delay_s = delay.as_secs_f64(), "reconnect scheduled");
        tokio::time::sleep(delay).await;

        // hold during a suppression window, then restart at the quick step
        let until = inner.guard.lock().until();
        if let Some(until) = until {
            if Instant::now() < until {
                debug!(%address, "suppression window active, holding reconnect");
                tokio::time::sleep_until(until).await;
                attempt = 1;
                continue;
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ReconnectRequest {
            address: address.clone(),
            attempt,
            reply: reply_tx,
        };
        if inner.fire_tx.send(request).await.is_err() {
            break; // coordinator gone
        }
        match reply_rx.await {
            Ok(FireOutcome::Failed) => attempt += 1,
            Ok(FireOutcome::Connected) => {
                info!(%address, attempt, "reconnected");
                break;
            }
            Ok(FireOutcome::Cancel) | Err(_) => break,
        }
    }
    inner.tasks.lock().remove(&address);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_the_quick_retry() {
        let d = delay_for_attempt(1, 30, 300, 0.0);
        assert_eq!(d, Duration::from_secs(10));
        // jitter bounds
        assert_eq!(delay_for_attempt(1, 30, 300, -0.2), Duration::from_secs(8));
        assert_eq!(delay_for_attempt(1, 30, 300, 0.2), Duration::from_secs(12));
    }

    #[test]
    fn backoff_follows_base_times_one_point_five() {
        // base=30, cap=300: attempts 2..5 nominally 30, 45, 67.5, 101.25
        assert_eq!(delay_for_attempt(2, 30, 300, 0.0), Duration::from_secs(30));
        assert_eq!(delay_for_attempt(3, 30, 300, 0.0), Duration::from_secs(45));
        assert_eq!(
            delay_for_attempt(4, 30, 300, 0.0),
            Duration::from_secs_f64(67.5)
        );
    }

    #[test]
    fn jittered_delays_stay_in_the_documented_ranges() {
        for _ in 0..200 {
            let jitter = random_jitter();
            let d2 = delay_for_attempt(2, 30, 300, jitter).as_secs_f64();
            assert!((24.0..=36.0).contains(&d2), "attempt 2 out of range: {d2}");
            let d3 = delay_for_attempt(3, 30, 300, jitter).as_secs_f64();
            assert!((36.0..=54.0).contains(&d3), "attempt 3 out of range: {d3}");
            let d4 = delay_for_attempt(4, 30, 300, jitter).as_secs_f64();
            assert!((54.0..=81.0).contains(&d4), "attempt 4 out of range: {d4}");
        }
    }

    #[test]
    fn backoff_is_capped() {
        let d = delay_for_attempt(20, 30, 300, 0.0);
        assert_eq!(d, Duration::from_secs(300));
        // the cap is jittered too
        let d = delay_for_attempt(20, 30, 300, 0.2);
        assert_eq!(d, Duration::from_secs(360));
    }

    #[test]
    fn disruption_guard_opens_on_burst() {
        let mut guard = DisruptionGuard::new();
        let t0 = Instant::now();
        assert!(!guard.note(t0));
        assert!(!guard.active(t0));
        // second drop inside the 3s window trips the guard
        assert!(guard.note(t0 + Duration::from_secs(2)));
        assert!(guard.active(t0 + Duration::from_secs(2)));
        // still suppressed just before the window closes
        assert!(guard.active(t0 + Duration::from_secs(61)));
        assert!(!guard.active(t0 + Duration::from_secs(63)));
    }

    #[test]
    fn disruption_guard_ignores_spread_out_drops() {
        let mut guard = DisruptionGuard::new();
        let t0 = Instant::now();
        assert!(!guard.note(t0));
        assert!(!guard.note(t0 + Duration::from_secs(5)));
        assert!(!guard.note(t0 + Duration::from_secs(10)));
        assert!(!guard.active(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn disruption_guard_does_not_reopen_while_active() {
        let mut guard = DisruptionGuard::new();
        let t0 = Instant::now();
        guard.note(t0);
        assert!(guard.note(t0 + Duration::from_secs(1)));
        // further drops during the window do not re-trigger the event
        assert!(!guard.note(t0 + Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn schedule_fires_and_honors_cancel_outcome() {
        tokio::time::pause();
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store = Arc::new(Store::open(dir.path(), bus.clone()).await.unwrap());
        let address = Address::parse("AA:BB:CC:DD:EE:01").unwrap();
        store
            .record_paired(address.clone(), "Speaker".into())
            .await
            .unwrap();

        let (controller, mut fire_rx) = ReconnectController::new(store, bus);
        controller.on_unexpected_disconnect(&address);

        // quick retry is nominally 10s; jitter keeps it under 13s
        tokio::time::advance(Duration::from_secs(13)).await;
        let request = fire_rx.recv().await.expect("first attempt fires");
        assert_eq!(request.attempt, 1);
        request.reply.send(FireOutcome::Cancel).unwrap();
        tokio::task::yield_now().await;

        // after a cancel nothing else may fire
        tokio::time::advance(Duration::from_secs(600)).await;
        tokio::task::yield_now().await;
        assert!(fire_rx.try_recv().is_err());
        assert!(!controller.is_scheduled(&address));
    }
}
