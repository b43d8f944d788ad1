use lancast_proto::packet::question::Question;
use lancast_proto::packet::record::Record;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::timer::TimerContainer;

const MUTEX_POISON_MESSAGE: &str = "cache mutex poisoned, cannot recover - aborting";

/// Delay before a flushed or goodbye record actually leaves the cache, so
/// the packet that carried it can still be processed whole.
const LINGER: Duration = Duration::from_secs(1);

/// Records younger than this survive `flush_related`: they arrived in the
/// same packet as the flushing record.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Randomized reissue points, as fractions of the TTL.
const REISSUE_WINDOWS: [(f64, f64); 4] = [(0.80, 0.82), (0.85, 0.87), (0.90, 0.92), (0.95, 0.97)];

/// Default cutoff fraction for `find`.
const FIND_CUTOFF: f64 = 0.25;

#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// The record is getting stale, interested parties should ask again.
    Reissue(Record),
    /// The record reached its TTL and left the cache.
    Expired(Record),
}

#[derive(Debug)]
struct Entry {
    record: Record,
    inserted_at: Instant,
}

impl Entry {
    fn elapsed_secs(&self) -> u32 {
        self.inserted_at.elapsed().as_secs() as u32
    }

    /// Remaining lifetime strictly above `fraction` of the original TTL?
    fn is_above(&self, fraction: f64) -> bool {
        let remaining = f64::from(self.record.ttl) - self.inserted_at.elapsed().as_secs_f64();
        remaining > f64::from(self.record.ttl) * fraction
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<u32, Entry>,
}

/// A record collection with a lifetime attached to every record.
///
/// Four randomized reissue events fire while a record ages, an expiry event
/// fires when the TTL runs out. Reissue timers are lazy: after a wall clock
/// jump they stay quiet instead of flooding the link with stale refresh
/// queries. Everything handed out is a clone whose TTL has been decremented
/// by the time already served; the stored copy never escapes. Clone the
/// handle freely, it refers to the same underlying collection.
#[derive(Debug, Clone)]
pub struct SharedCache {
    state: Arc<Mutex<State>>,
    timers: TimerContainer,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            timers: TimerContainer::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Insert or refresh a record. Re-adding resets the reissue and expiry
    /// schedule; a goodbye (TTL 0) is kept around briefly instead of being
    /// dropped on the floor.
    pub fn add(&self, record: Record) {
        if record.ttl == 0 {
            self.set_to_expire(record);
            return;
        }
        let hash = record.hash();
        self.schedule(hash, record.ttl);
        let mut state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        state.entries.insert(
            hash,
            Entry {
                record,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn add_each(&self, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.add(record);
        }
    }

    /// Schedule deletion in one second, keeping the record visible until
    /// then. Used for goodbyes and cache-flush evictions.
    pub fn set_to_expire(&self, record: Record) {
        let hash = record.hash();
        self.clear_timers(hash);
        self.timers
            .set(expire_timer(hash), LINGER, self.expiry_callback(hash));
        let mut state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        match state.entries.get_mut(&hash) {
            Some(entry) => entry.record = record,
            None => {
                state.entries.insert(
                    hash,
                    Entry {
                        record,
                        inserted_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Cache-flush: schedule expiry for every record sharing the given
    /// record's identity that has been here long enough to predate the
    /// current packet.
    pub fn flush_related(&self, record: &Record) {
        let namehash = record.namehash();
        let flushes: Vec<u32> = {
            let state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
            state
                .entries
                .iter()
                .filter(|(hash, entry)| {
                    entry.record.namehash() == namehash
                        && **hash != record.hash()
                        && entry.inserted_at.elapsed() >= FLUSH_GRACE
                })
                .map(|(hash, _)| *hash)
                .collect()
        };
        for hash in &flushes {
            self.clear_timers(*hash);
            self.timers
                .set(expire_timer(*hash), LINGER, self.expiry_callback(*hash));
        }
        if !flushes.is_empty() {
            tracing::debug!("flushing {} superseded record(s)", flushes.len());
        }
    }

    /// Clones of the records answering `question`, TTL decremented, kept
    /// only while above the cutoff fraction (default one quarter) of their
    /// original TTL.
    pub fn find(&self, question: &Question, cutoff: Option<f64>) -> Vec<Record> {
        let cutoff = cutoff.unwrap_or(FIND_CUTOFF);
        let state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        state
            .entries
            .values()
            .filter(|entry| entry.record.can_answer(question))
            .filter(|entry| entry.is_above(cutoff))
            .map(|entry| entry.record.clone_with_elapsed(entry.elapsed_secs()))
            .collect()
    }

    /// Clones of every record whose remaining lifetime is above the given
    /// fraction of its original TTL.
    pub fn get_above_ttl(&self, cutoff: f64) -> Vec<Record> {
        let state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        state
            .entries
            .values()
            .filter(|entry| entry.is_above(cutoff))
            .map(|entry| entry.record.clone_with_elapsed(entry.elapsed_secs()))
            .collect()
    }

    /// The cached equivalent of `record`, TTL decremented.
    pub fn get(&self, record: &Record) -> Option<Record> {
        let state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        state
            .entries
            .get(&record.hash())
            .map(|entry| entry.record.clone_with_elapsed(entry.elapsed_secs()))
    }

    pub fn has(&self, record: &Record) -> bool {
        self.state
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .contains_key(&record.hash())
    }

    /// A cached unique record that contradicts the given one, if any.
    pub fn find_conflict(&self, record: &Record) -> Option<Record> {
        let state = self.state.lock().expect(MUTEX_POISON_MESSAGE);
        state
            .entries
            .values()
            .find(|entry| entry.record.conflicts_with(record))
            .map(|entry| entry.record.clone())
    }

    pub fn size(&self) -> usize {
        self.state
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn schedule(&self, hash: u32, ttl: u32) {
        self.clear_timers(hash);
        let ttl_ms = u64::from(ttl) * 1000;
        let mut rng = rand::thread_rng();

        for (index, (low, high)) in REISSUE_WINDOWS.iter().enumerate() {
            let fraction = rng.gen_range(*low..*high);
            let delay = Duration::from_millis((ttl_ms as f64 * fraction) as u64);
            let state = Arc::downgrade(&self.state);
            let events = self.events.clone();
            self.timers
                .set_lazy(reissue_timer(hash, index), delay, move || {
                    if let Some(record) = snapshot(&state, hash) {
                        let _ = events.send(CacheEvent::Reissue(record));
                    }
                });
        }

        self.timers.set(
            expire_timer(hash),
            Duration::from_secs(u64::from(ttl)),
            self.expiry_callback(hash),
        );
    }

    fn expiry_callback(&self, hash: u32) -> impl FnOnce() + Send + 'static {
        let state = Arc::downgrade(&self.state);
        let events = self.events.clone();
        move || {
            let Some(state) = state.upgrade() else { return };
            let removed = state
                .lock()
                .expect(MUTEX_POISON_MESSAGE)
                .entries
                .remove(&hash);
            if let Some(entry) = removed {
                let _ = events.send(CacheEvent::Expired(entry.record));
            }
        }
    }

    fn clear_timers(&self, hash: u32) {
        for index in 0..REISSUE_WINDOWS.len() {
            self.timers.clear(&reissue_timer(hash, index));
        }
        self.timers.clear(&expire_timer(hash));
    }
}

fn reissue_timer(hash: u32, index: usize) -> String {
    format!("reissue:{hash:08x}:{index}")
}

fn expire_timer(hash: u32) -> String {
    format!("expire:{hash:08x}")
}

fn snapshot(state: &Weak<Mutex<State>>, hash: u32) -> Option<Record> {
    let state = state.upgrade()?;
    let state = state.lock().expect(MUTEX_POISON_MESSAGE);
    state
        .entries
        .get(&hash)
        .map(|entry| entry.record.clone_with_elapsed(entry.elapsed_secs()))
}

#[cfg(test)]
mod tests {
    use super::{CacheEvent, SharedCache};
    use lancast_proto::packet::question::Question;
    use lancast_proto::packet::record::{Record, RecordType};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn host(last: u8) -> Record {
        Record::a("host.local.", Ipv4Addr::new(10, 0, 0, last))
    }

    /// Advance the paused clock and let due timer tasks run.
    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn should_return_clones_with_decremented_ttl() {
        let cache = SharedCache::new();
        cache.add(host(1));

        advance(Duration::from_secs(30)).await;
        let found = cache.get(&host(1)).expect("record should be cached");
        assert_eq!(found.ttl, 90);
        // the stored copy is untouched
        advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&host(1)).unwrap().ttl, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn should_find_records_for_question() {
        let cache = SharedCache::new();
        cache.add(host(1));
        cache.add(Record::srv("Test._test._tcp.local.", "host.local.", 4444));

        let found = cache.find(&Question::new("host.local.", RecordType::A), None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], host(1));

        let any = cache.find(
            &Question::new("host.local.", lancast_proto::packet::QueryType::ANY),
            None,
        );
        assert_eq!(any.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_drop_records_below_cutoff_from_find() {
        let cache = SharedCache::new();
        cache.add(host(1));

        // 100 of 120 seconds served: remaining fraction is below a quarter.
        advance(Duration::from_secs(100)).await;
        let found = cache.find(&Question::new("host.local.", RecordType::A), None);
        assert!(found.is_empty());
        // but an explicit zero cutoff still sees it
        let found = cache.find(&Question::new("host.local.", RecordType::A), Some(0.0));
        assert_eq!(found.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_emit_reissue_then_expire() {
        let cache = SharedCache::new();
        let mut events = cache.subscribe();
        cache.add(host(1));

        advance(Duration::from_secs(121)).await;

        let mut reissues = 0;
        let mut expired = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CacheEvent::Reissue(record) => {
                    assert_eq!(record, host(1));
                    assert!(record.ttl < 30);
                    reissues += 1;
                }
                CacheEvent::Expired(record) => {
                    assert_eq!(record, host(1));
                    expired += 1;
                }
            }
        }
        assert_eq!(reissues, 4);
        assert_eq!(expired, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_refresh_schedule_on_readd() {
        let cache = SharedCache::new();
        cache.add(host(1));

        advance(Duration::from_secs(90)).await;
        cache.add(host(1));

        // The old expiry at t=120 must not fire against the refreshed entry.
        advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get(&host(1)).unwrap().ttl, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn should_keep_goodbyes_for_one_second() {
        let cache = SharedCache::new();
        let mut events = cache.subscribe();
        cache.add(host(1).with_ttl(0));

        assert!(cache.has(&host(1)));
        advance(Duration::from_millis(1100)).await;
        assert!(!cache.has(&host(1)));
        assert!(matches!(events.try_recv(), Ok(CacheEvent::Expired(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn should_flush_related_but_spare_recent_siblings() {
        let cache = SharedCache::new();
        cache.add(host(1));

        advance(Duration::from_secs(5)).await;
        // host(2) and host(3) arrive in the same packet; host(2) is unique,
        // so the stale host(1) gets flushed while host(3) survives.
        cache.add(host(3));
        cache.flush_related(&host(2));
        cache.add(host(2));

        advance(Duration::from_millis(1100)).await;
        assert!(!cache.has(&host(1)));
        assert!(cache.has(&host(2)));
        assert!(cache.has(&host(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn should_find_conflicting_unique_records() {
        let cache = SharedCache::new();
        cache.add(host(1));

        assert!(cache.find_conflict(&host(2)).is_some());
        assert!(cache.find_conflict(&host(1)).is_none());
    }
}
