use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const MUTEX_POISON_MESSAGE: &str = "timer mutex poisoned, cannot recover - aborting";

/// Wall clock drift tolerated before a lazy timer refuses to run and before
/// the watchdog decides the machine was asleep.
const CLOCK_TOLERANCE: Duration = Duration::from_secs(5);

/// How often the sleep watchdog pings.
const PING_PERIOD: Duration = Duration::from_secs(60);

/// A named map of cancellation handles.
///
/// Setting a timer under an existing name replaces it; a fired timer
/// removes itself. `set_lazy` additionally records the expected wall clock
/// fire time and drops the callback when the observed clock has jumped past
/// it, so work scheduled before a suspend does not run on a stale premise.
#[derive(Debug, Clone, Default)]
pub struct TimerContainer {
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TimerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<F>(&self, name: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(name.into(), delay, None, callback);
    }

    pub fn set_lazy<F>(&self, name: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expected = SystemTime::now() + delay;
        self.schedule(name.into(), delay, Some(expected), callback);
    }

    fn schedule<F>(&self, name: String, delay: Duration, expected: Option<SystemTime>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        let key = name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.lock().expect(MUTEX_POISON_MESSAGE).remove(&key);
            if let Some(expected) = expected {
                if SystemTime::now() > expected + CLOCK_TOLERANCE {
                    tracing::debug!("dropping lazy timer {key:?} after clock jump");
                    return;
                }
            }
            callback();
        });
        if let Some(previous) = self
            .timers
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .insert(name, handle)
        {
            previous.abort();
        }
    }

    pub fn clear(&self, name: &str) {
        if let Some(handle) = self.timers.lock().expect(MUTEX_POISON_MESSAGE).remove(name) {
            handle.abort();
        }
    }

    pub fn clear_all(&self) {
        for (_, handle) in self.timers.lock().expect(MUTEX_POISON_MESSAGE).drain() {
            handle.abort();
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.timers
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.timers.lock().expect(MUTEX_POISON_MESSAGE).len()
    }
}

/// Process wide sleep detector.
///
/// A background task naps for a minute at a time and compares the wall
/// clock on wake-up; having overslept by more than the tolerance means the
/// machine was suspended, and every subscriber gets a `wake` ping.
/// Responders re-probe on wake, queries reset their schedules.
#[derive(Debug)]
pub struct SleepWatchdog {
    tx: broadcast::Sender<()>,
}

impl SleepWatchdog {
    fn start() -> Self {
        let (tx, _) = broadcast::channel(8);
        let pinger = tx.clone();
        tokio::spawn(async move {
            loop {
                let before = SystemTime::now();
                tokio::time::sleep(PING_PERIOD).await;
                if let Ok(elapsed) = before.elapsed() {
                    if elapsed > PING_PERIOD + CLOCK_TOLERANCE {
                        tracing::info!("wall clock jumped {elapsed:?}, assuming wake from sleep");
                        let _ = pinger.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    fn global() -> &'static SleepWatchdog {
        static WATCHDOG: OnceLock<SleepWatchdog> = OnceLock::new();
        WATCHDOG.get_or_init(SleepWatchdog::start)
    }
}

/// Subscribe to the process wide wake event.
pub fn wake_events() -> broadcast::Receiver<()> {
    SleepWatchdog::global().tx.subscribe()
}

#[cfg(test)]
mod tests {
    use super::TimerContainer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn should_fire_and_forget() {
        let timers = TimerContainer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        timers.set("announce", Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.has("announce"));
        assert_eq!(timers.count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.has("announce"));
        assert_eq!(timers.count(), 0);
    }

    #[tokio::test]
    async fn should_replace_timer_with_same_name() {
        let timers = TimerContainer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        timers.set("retry", Duration::from_millis(20), move || {
            count.fetch_add(10, Ordering::SeqCst);
        });
        let count = Arc::clone(&fired);
        timers.set("retry", Duration::from_millis(20), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_clear_timers() {
        let timers = TimerContainer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        timers.set("goodbye", Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        timers.clear("goodbye");
        assert!(!timers.has("goodbye"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn should_run_lazy_timer_without_clock_jump() {
        let timers = TimerContainer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        timers.set_lazy("reissue", Duration::from_millis(10), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
