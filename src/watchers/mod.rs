//! Fixed-interval pollers that turn persisted state changes into
//! notification events.
//!
//! A watcher owns one [`WatchCycle`]. The first cycle after `start()` only
//! seeds the cycle's tracking map; later cycles report transitions. Cycles
//! never overlap, and a failing cycle is logged and retried on the next tick.

mod status;
mod sync;

pub use status::StatusWatcher;
pub use sync::ExternalSyncWatcher;

use crate::notify::{NotificationEvent, NotificationSink};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One poll over a source of persisted state.
#[async_trait]
pub trait WatchCycle: Send + 'static {
    fn name(&self) -> &'static str;

    /// Diff current state against the tracking map and update it.
    ///
    /// With `seeding` set, only record what is there and report nothing.
    async fn run_cycle(&mut self, seeding: bool) -> Result<Vec<NotificationEvent>>;
}

struct Shared<C> {
    cycle: tokio::sync::Mutex<C>,
    seeded: AtomicBool,
    sink: Arc<dyn NotificationSink>,
}

impl<C: WatchCycle> Shared<C> {
    async fn poll(&self) -> usize {
        let Ok(mut cycle) = self.cycle.try_lock() else {
            debug!("previous watcher cycle still running; skipping tick");
            return 0;
        };
        let seeding = !self.seeded.load(Ordering::SeqCst);
        let events = match cycle.run_cycle(seeding).await {
            Ok(events) => events,
            Err(e) => {
                warn!(watcher = cycle.name(), error = %format!("{:#}", e), "watcher cycle failed");
                return 0;
            }
        };
        self.seeded.store(true, Ordering::SeqCst);
        if seeding {
            debug!(watcher = cycle.name(), "watcher seeded");
            return 0;
        }

        let mut emitted = 0;
        for event in &events {
            match self.sink.emit(event) {
                Ok(()) => emitted += 1,
                Err(e) => warn!(watcher = cycle.name(), error = %e, "failed to emit notification"),
            }
        }
        emitted
    }
}

/// Runs a [`WatchCycle`] on a tokio interval.
pub struct PollingWatcher<C> {
    shared: Arc<Shared<C>>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: WatchCycle> PollingWatcher<C> {
    pub fn new(cycle: C, sink: Arc<dyn NotificationSink>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                cycle: tokio::sync::Mutex::new(cycle),
                seeded: AtomicBool::new(false),
                sink,
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Start polling. The first tick seeds. No-op while already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        self.shared.seeded.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.poll().await;
            }
        }));
    }

    /// Stop polling. Safe before `start()` and when called repeatedly.
    pub fn stop(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Run one cycle now and return the number of events emitted.
    pub async fn poll_once(&self) -> usize {
        self.shared.poll().await
    }
}

impl<C> Drop for PollingWatcher<C> {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{MemorySink, NotificationEventType, Severity};
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        calls: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl WatchCycle for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run_cycle(&mut self, _seeding: bool) -> Result<Vec<NotificationEvent>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(n) {
                anyhow::bail!("datastore unavailable");
            }
            Ok(vec![NotificationEvent::new(
                NotificationEventType::AgentStarted,
                "f-1",
                "Login",
                format!("tick {}", n),
                Severity::Info,
            )])
        }
    }

    fn watcher(fail_on: Option<usize>) -> (PollingWatcher<Counter>, Arc<MemorySink>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(MemorySink::new());
        let w = PollingWatcher::new(
            Counter {
                calls: calls.clone(),
                fail_on,
            },
            sink.clone(),
            Duration::from_millis(10),
        );
        (w, sink, calls)
    }

    #[tokio::test]
    async fn test_first_poll_only_seeds() {
        let (w, sink, _) = watcher(None);
        assert_eq!(w.poll_once().await, 0);
        assert_eq!(w.poll_once().await, 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_cycle_does_not_stop_polling() {
        let (w, sink, _) = watcher(Some(2));
        w.poll_once().await;
        assert_eq!(w.poll_once().await, 0);
        assert_eq!(w.poll_once().await, 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (w, _, calls) = watcher(None);
        w.stop();
        w.start();
        w.start();
        assert!(w.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        w.stop();
        w.stop();
        assert!(!w.is_running());
        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
