//! Executor response cache keyed by correlation id.
//!
//! A request that arrives again while its first copy is still executing
//! waits for that execution; one that arrives after completion gets the cached
//! bytes replayed. Either way the handler runs at most once per correlation id
//! for as long as the entry lives.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::PublishProperties;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::worker::BackgroundRunnable;

/// Response as published, minus the per-delivery properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub payload: Bytes,
    pub properties: PublishProperties,
}

#[derive(Debug)]
enum State {
    InFlight(watch::Sender<Option<CachedResponse>>),
    Complete(CachedResponse),
}

#[derive(Debug)]
struct Entry {
    state: State,
    expires_at: Instant,
}

/// Outcome of [`ResponseCache::begin`].
#[derive(Debug)]
pub enum Lookup {
    /// Already answered; replay this response.
    Hit(CachedResponse),
    /// Another copy is executing; wait on the receiver.
    Pending(watch::Receiver<Option<CachedResponse>>),
    /// First sighting; the caller owns execution and must call `complete`.
    Miss,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<Uuid, Entry>,
}

impl ResponseCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `id`, claiming it as in flight on a miss.
    pub fn begin(&self, id: Uuid, expires_at: Instant) -> Lookup {
        match self.entries.entry(id) {
            MapEntry::Occupied(entry) => match &entry.get().state {
                State::Complete(response) => Lookup::Hit(response.clone()),
                State::InFlight(tx) => Lookup::Pending(tx.subscribe()),
            },
            MapEntry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(None);
                entry.insert(Entry {
                    state: State::InFlight(tx),
                    expires_at,
                });
                Lookup::Miss
            }
        }
    }

    /// Publishes the outcome for `id` to any waiters.
    ///
    /// A `cacheable` response is kept until `expires_at`; otherwise the entry
    /// is dropped so a retry executes afresh.
    pub fn complete(&self, id: Uuid, response: CachedResponse, cacheable: bool, expires_at: Instant) {
        if cacheable {
            if let Some(mut entry) = self.entries.get_mut(&id) {
                if let State::InFlight(tx) = &entry.state {
                    tx.send_replace(Some(response.clone()));
                }
                entry.state = State::Complete(response);
                entry.expires_at = expires_at;
            }
        } else if let Some((_, entry)) = self.entries.remove(&id) {
            if let State::InFlight(tx) = entry.state {
                tx.send_replace(Some(response));
            }
        }
    }

    /// Drops completed entries whose lifetime has ended. In-flight entries stay.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| matches!(entry.state, State::InFlight(_)) || entry.expires_at > now);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// Tasks accepted by the [`CacheSweeper`].
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep immediately instead of waiting for the next tick.
    SweepNow,
}

/// Background runnable that evicts expired cache entries on every tick.
#[derive(Debug)]
pub struct CacheSweeper {
    cache: Arc<ResponseCache>,
}

impl CacheSweeper {
    #[must_use]
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }

    fn sweep(&self) {
        let evicted = self.cache.sweep(Instant::now());
        if evicted > 0 {
            debug!(evicted, remaining = self.cache.len(), "swept response cache");
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CacheSweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::SweepNow => self.sweep(),
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::BackgroundWorker;

    fn response(bytes: &'static [u8]) -> CachedResponse {
        CachedResponse {
            payload: Bytes::from_static(bytes),
            properties: PublishProperties::default(),
        }
    }

    #[tokio::test]
    async fn first_sighting_claims_then_replays() {
        let cache = ResponseCache::new();
        let id = Uuid::new_v4();
        let expiry = Instant::now() + Duration::from_secs(5);

        assert!(matches!(cache.begin(id, expiry), Lookup::Miss));
        let Lookup::Pending(mut rx) = cache.begin(id, expiry) else {
            panic!("second sighting should wait");
        };

        cache.complete(id, response(b"ok"), true, expiry);
        let waited = rx.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(waited, Some(response(b"ok")));

        match cache.begin(id, expiry) {
            Lookup::Hit(hit) => assert_eq!(hit, response(b"ok")),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn uncacheable_outcome_wakes_waiters_and_forgets() {
        let cache = ResponseCache::new();
        let id = Uuid::new_v4();
        let expiry = Instant::now() + Duration::from_secs(5);

        assert!(matches!(cache.begin(id, expiry), Lookup::Miss));
        let Lookup::Pending(mut rx) = cache.begin(id, expiry) else {
            panic!("second sighting should wait");
        };
        cache.complete(id, response(b"busy"), false, expiry);

        assert!(rx.wait_for(Option::is_some).await.is_ok());
        assert!(cache.is_empty());
        assert!(matches!(cache.begin(id, expiry), Lookup::Miss));
    }

    #[tokio::test]
    async fn sweep_keeps_in_flight_and_live_entries() {
        let cache = ResponseCache::new();
        let now = Instant::now();
        let (expired, live, running) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        cache.begin(expired, now);
        cache.complete(expired, response(b"a"), true, now);
        cache.begin(live, now);
        cache.complete(live, response(b"b"), true, now + Duration::from_secs(60));
        cache.begin(running, now);

        assert_eq!(cache.sweep(now + Duration::from_millis(1)), 1);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_on_tick() {
        let cache = Arc::new(ResponseCache::new());
        let id = Uuid::new_v4();
        let expiry = Instant::now() + Duration::from_millis(50);
        cache.begin(id, expiry);
        cache.complete(id, response(b"x"), true, expiry);

        let mut worker =
            BackgroundWorker::start(CacheSweeper::new(Arc::clone(&cache)), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(150)).await;
        worker.stop().await;

        assert!(cache.is_empty());
    }
}
