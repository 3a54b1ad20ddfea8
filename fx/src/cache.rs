//! Quote snapshot caching with single-flight fetches.
//!
//! Both cache strategies share one core: a whole [`CacheEntry`] behind a
//! mutex plus at most one in-flight fetch. The fetch runs on its own task and
//! is shared between waiters, so dropping one waiter never cancels the fetch
//! for the others. The lock is held only to read or swap the entry `Arc`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{SourceError, SourceFailure};
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

/// Last known state of one cached source.
///
/// Replaced as a whole after every fetch; readers never see a half-updated
/// entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub source_id: SourceId,
    /// Last successful snapshot.
    pub quotes: Option<Arc<QuoteSet>>,
    /// Wall-clock time of the last successful snapshot.
    pub fetched_at: Option<DateTime<Utc>>,
    /// Failures the fetch behind `quotes` got past, e.g. fallback members
    /// tried before the one that answered.
    pub exceptions: Vec<SourceFailure>,
    /// Error of the most recent attempt, cleared by any success.
    pub last_error: Option<SourceError>,
    refreshed_at: Option<Instant>,
    attempted_at: Option<Instant>,
}

impl CacheEntry {
    fn empty(source_id: SourceId) -> Self {
        Self {
            source_id,
            quotes: None,
            fetched_at: None,
            exceptions: Vec::new(),
            last_error: None,
            refreshed_at: None,
            attempted_at: None,
        }
    }

    /// Whether no fetch has ever completed.
    pub fn never_fetched(&self) -> bool {
        self.attempted_at.is_none()
    }

    /// Snapshot if it was refreshed within `max_age`.
    fn fresh_within(&self, max_age: Duration, now: Instant) -> Option<Arc<QuoteSet>> {
        let refreshed_at = self.refreshed_at?;
        if now.saturating_duration_since(refreshed_at) < max_age {
            self.quotes.clone()
        } else {
            None
        }
    }

    /// Whether the last success is at least `interval` old.
    fn due(&self, interval: Duration, now: Instant) -> bool {
        match self.refreshed_at {
            Some(refreshed_at) => now >= refreshed_at + interval,
            None => true,
        }
    }
}

/// Cache counters.
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn fetch_started(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    fn fetch_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Underlying fetches started.
    pub fetches: u64,
    /// Underlying fetches that failed.
    pub failures: u64,
}

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Arc<QuoteSet>, SourceError>>>;

pub(crate) struct FlightState {
    pub(crate) entry: Arc<CacheEntry>,
    in_flight: Option<SharedFetch>,
}

/// One cached source: its entry, its in-flight fetch and its counters.
pub(crate) struct SingleFlight {
    source: Arc<dyn QuoteSource>,
    state: Arc<Mutex<FlightState>>,
    pub(crate) counters: Arc<CacheCounters>,
}

impl SingleFlight {
    pub(crate) fn new(source: Arc<dyn QuoteSource>) -> Self {
        let entry = Arc::new(CacheEntry::empty(source.id().clone()));
        Self {
            source,
            state: Arc::new(Mutex::new(FlightState {
                entry,
                in_flight: None,
            })),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn QuoteSource> {
        &self.source
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, FlightState> {
        self.state.lock()
    }

    pub(crate) fn entry(&self) -> Arc<CacheEntry> {
        self.state.lock().entry.clone()
    }

    /// Join the in-flight fetch, or start one. Must be called with the state
    /// lock held so two callers cannot both start a fetch.
    pub(crate) fn join_or_start(&self, state: &mut FlightState) -> SharedFetch {
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }

        self.counters.fetch_started();
        let source = self.source.clone();
        let shared_state = self.state.clone();
        let counters = self.counters.clone();

        let handle = tokio::spawn(async move {
            let result = source.get_quotes_with_exceptions().await;
            let now = Instant::now();

            let mut state = shared_state.lock();
            let previous = state.entry.clone();
            let (entry, result) = match result {
                Ok((quotes, exceptions)) => {
                    debug!(
                        source = %source.id(),
                        quotes = quotes.len(),
                        exceptions = exceptions.len(),
                        "Cache refreshed"
                    );
                    let quotes = Arc::new(quotes);
                    let entry = CacheEntry {
                        source_id: previous.source_id.clone(),
                        quotes: Some(quotes.clone()),
                        fetched_at: Some(Utc::now()),
                        exceptions,
                        last_error: None,
                        refreshed_at: Some(now),
                        attempted_at: Some(now),
                    };
                    (entry, Ok(quotes))
                }
                Err(e) => {
                    warn!(source = %source.id(), error = %e, "Cache refresh failed");
                    counters.fetch_failed();
                    let entry = CacheEntry {
                        last_error: Some(e.clone()),
                        attempted_at: Some(now),
                        ..(*previous).clone()
                    };
                    (entry, Err(e))
                }
            };
            state.entry = Arc::new(entry);
            state.in_flight = None;
            result
        });

        let cleanup_state = self.state.clone();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    cleanup_state.lock().in_flight = None;
                    if e.is_cancelled() {
                        Err(SourceError::Cancelled)
                    } else {
                        Err(SourceError::Network(format!("fetch task failed: {e}")))
                    }
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(fetch.clone());
        fetch
    }

    /// Fetch now, joining any fetch already running.
    pub(crate) async fn refresh(&self) -> Result<Arc<QuoteSet>, SourceError> {
        let fetch = {
            let mut state = self.state.lock();
            self.join_or_start(&mut state)
        };
        fetch.await
    }

    /// Forget the cached snapshot. An in-flight fetch still lands.
    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        state.entry = Arc::new(CacheEntry::empty(self.source.id().clone()));
    }
}

/// Cache-aside wrapper: snapshots are reused for `ttl`, misses share one
/// fetch, failures are not cached.
pub struct CachedQuoteSource {
    flight: SingleFlight,
    ttl: Duration,
}

impl CachedQuoteSource {
    pub fn new(source: Arc<dyn QuoteSource>, ttl: Duration) -> Self {
        Self {
            flight: SingleFlight::new(source),
            ttl,
        }
    }

    /// Current snapshot, fresh or not, without fetching.
    pub fn peek(&self) -> Option<Arc<QuoteSet>> {
        self.flight.entry().quotes.clone()
    }

    pub fn entry(&self) -> Arc<CacheEntry> {
        self.flight.entry()
    }

    /// The wrapped source.
    pub fn inner(&self) -> &Arc<dyn QuoteSource> {
        self.flight.source()
    }

    pub fn invalidate(&self) {
        self.flight.invalidate();
    }

    pub fn stats(&self) -> CacheStats {
        self.flight.counters.snapshot()
    }

    /// Fetch now regardless of the TTL.
    pub async fn refresh(&self) -> Result<Arc<QuoteSet>, SourceError> {
        self.flight.refresh().await
    }

    /// Snapshot shared with the cache.
    pub async fn get(&self) -> Result<Arc<QuoteSet>, SourceError> {
        let fetch = {
            let mut state = self.flight.lock();
            if let Some(quotes) = state.entry.fresh_within(self.ttl, Instant::now()) {
                self.flight.counters.hit();
                return Ok(quotes);
            }
            self.flight.counters.miss();
            self.flight.join_or_start(&mut state)
        };
        fetch.await
    }
}

#[async_trait]
impl QuoteSource for CachedQuoteSource {
    fn id(&self) -> &SourceId {
        self.flight.source().id()
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        self.get().await.map(|quotes| (*quotes).clone())
    }
}

/// Stale-while-revalidate refresher.
///
/// A call returns the last snapshot at once, however old, and kicks off a
/// refresh when the snapshot is `interval` old or the previous attempt
/// failed. Only the first call ever, or a call after the optional `validity`
/// window has lapsed, waits for the network.
pub struct BackgroundFetcher {
    flight: SingleFlight,
    interval: Duration,
    validity: Option<Duration>,
}

impl BackgroundFetcher {
    pub fn new(source: Arc<dyn QuoteSource>, interval: Duration) -> Self {
        Self {
            flight: SingleFlight::new(source),
            interval,
            validity: None,
        }
    }

    /// Treat snapshots older than `validity` as absent.
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = Some(validity);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn peek(&self) -> Option<Arc<QuoteSet>> {
        let entry = self.flight.entry();
        self.usable(&entry, Instant::now())
    }

    pub fn entry(&self) -> Arc<CacheEntry> {
        self.flight.entry()
    }

    pub fn inner(&self) -> &Arc<dyn QuoteSource> {
        self.flight.source()
    }

    pub fn invalidate(&self) {
        self.flight.invalidate();
    }

    pub fn stats(&self) -> CacheStats {
        self.flight.counters.snapshot()
    }

    /// Fetch now and wait for the result.
    pub async fn refresh(&self) -> Result<Arc<QuoteSet>, SourceError> {
        self.flight.refresh().await
    }

    fn usable(&self, entry: &CacheEntry, now: Instant) -> Option<Arc<QuoteSet>> {
        match self.validity {
            Some(validity) => entry.fresh_within(validity, now),
            None => entry.quotes.clone(),
        }
    }

    pub async fn get(&self) -> Result<Arc<QuoteSet>, SourceError> {
        let now = Instant::now();
        let fetch = {
            let mut state = self.flight.lock();
            let entry = state.entry.clone();

            if let Some(quotes) = self.usable(&entry, now) {
                self.flight.counters.hit();
                if entry.due(self.interval, now) || entry.last_error.is_some() {
                    debug!(source = %entry.source_id, "Serving stale snapshot while refreshing");
                    // The refresh task runs on its own; nobody waits for it here.
                    drop(self.flight.join_or_start(&mut state));
                }
                return Ok(quotes);
            }

            self.flight.counters.miss();
            match &entry.last_error {
                Some(error) if entry.quotes.is_none() => {
                    drop(self.flight.join_or_start(&mut state));
                    return Err(error.clone());
                }
                _ => self.flight.join_or_start(&mut state),
            }
        };
        fetch.await
    }
}

#[async_trait]
impl QuoteSource for BackgroundFetcher {
    fn id(&self) -> &SourceId {
        self.flight.source().id()
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        self.get().await.map(|quotes| (*quotes).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockQuoteSource;
    use ratebridge_common::{BidAsk, CurrencyPair};
    use rust_decimal_macros::dec;

    fn btc_usd() -> CurrencyPair {
        CurrencyPair::parse("BTC_USD").unwrap()
    }

    fn mock(price: rust_decimal::Decimal) -> Arc<MockQuoteSource> {
        let source = Arc::new(MockQuoteSource::new("kraken"));
        source.set_quote(btc_usd(), BidAsk::single(price));
        source
    }

    fn price(quotes: &QuoteSet) -> rust_decimal::Decimal {
        quotes
            .get(&SourceId::new("kraken"), &btc_usd())
            .unwrap()
            .mid()
    }

    /// Let spawned refresh tasks run.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_aside_ttl() {
        let source = mock(dec!(50000));
        let cache = CachedQuoteSource::new(source.clone(), Duration::from_secs(30));

        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.get().await.unwrap();
        assert_eq!(source.calls(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_aside_does_not_cache_failures() {
        let source = mock(dec!(50000));
        source.set_failure(Some(SourceError::Timeout));
        let cache = CachedQuoteSource::new(source.clone(), Duration::from_secs(30));

        assert_eq!(cache.get().await, Err(SourceError::Timeout));

        source.set_failure(None);
        assert!(cache.get().await.is_ok());
        assert_eq!(source.calls(), 2);
        assert!(cache.entry().last_error.is_none());
        assert_eq!(cache.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_fifty_callers() {
        let source = mock(dec!(50000));
        source.set_delay(Duration::from_millis(100));
        let cache = Arc::new(CachedQuoteSource::new(source.clone(), Duration::from_secs(30)));

        let callers: Vec<_> = (0..50)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_cancel_fetch() {
        let source = mock(dec!(50000));
        source.set_delay(Duration::from_millis(100));
        let cache = Arc::new(CachedQuoteSource::new(source.clone(), Duration::from_secs(30)));

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get().await })
        };
        settle().await;
        first.abort();

        assert!(cache.get().await.is_ok());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_serves_stale_and_refreshes() {
        let source = mock(dec!(50000));
        let fetcher = BackgroundFetcher::new(source.clone(), Duration::from_secs(60));

        // Cold start waits for the first fetch.
        let first = fetcher.get().await.unwrap();
        assert_eq!(price(&first), dec!(50000));

        source.set_quote(btc_usd(), BidAsk::single(dec!(51000)));
        tokio::time::advance(Duration::from_secs(61)).await;

        // Stale snapshot comes back immediately, refresh happens behind it.
        let stale = fetcher.get().await.unwrap();
        assert_eq!(price(&stale), dec!(50000));
        settle().await;

        let fresh = fetcher.get().await.unwrap();
        assert_eq!(price(&fresh), dec!(51000));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_single_refresh_for_stale_callers() {
        let source = mock(dec!(50000));
        let fetcher = Arc::new(BackgroundFetcher::new(source.clone(), Duration::from_secs(60)));
        fetcher.get().await.unwrap();

        source.set_quote(btc_usd(), BidAsk::single(dec!(51000)));
        source.set_delay(Duration::from_millis(100));
        tokio::time::advance(Duration::from_secs(61)).await;

        let callers: Vec<_> = (0..50)
            .map(|_| {
                let fetcher = fetcher.clone();
                tokio::spawn(async move { fetcher.get().await })
            })
            .collect();

        for result in futures::future::join_all(callers).await {
            let quotes = result.unwrap().unwrap();
            assert_eq!(price(&quotes), dec!(50000));
        }

        // Joins the refresh the stale callers started.
        let fresh = fetcher.refresh().await.unwrap();
        assert_eq!(price(&fresh), dec!(51000));
        assert_eq!(source.calls(), 2);
        assert_eq!(fetcher.stats().fetches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_keeps_snapshot_on_failure() {
        let source = mock(dec!(50000));
        let fetcher = BackgroundFetcher::new(source.clone(), Duration::from_secs(60));
        fetcher.get().await.unwrap();

        source.set_failure(Some(SourceError::Http { status: 502 }));
        assert!(fetcher.refresh().await.is_err());

        let entry = fetcher.entry();
        assert!(entry.quotes.is_some());
        assert_eq!(entry.last_error, Some(SourceError::Http { status: 502 }));
        assert_eq!(price(&fetcher.get().await.unwrap()), dec!(50000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_recovers_from_poisoning() {
        let source = mock(dec!(50000));
        source.set_failure(Some(SourceError::Timeout));
        let fetcher = BackgroundFetcher::new(source.clone(), Duration::from_secs(60));

        assert_eq!(fetcher.get().await, Err(SourceError::Timeout));

        // Nothing usable yet: the stored error is surfaced and a retry starts.
        source.set_failure(None);
        assert_eq!(fetcher.get().await, Err(SourceError::Timeout));
        settle().await;

        assert!(fetcher.get().await.is_ok());
        assert!(fetcher.entry().last_error.is_none());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_validity_window() {
        let source = mock(dec!(50000));
        let fetcher = BackgroundFetcher::new(source.clone(), Duration::from_secs(60))
            .with_validity(Duration::from_secs(300));
        fetcher.get().await.unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(fetcher.peek().is_none());

        source.set_quote(btc_usd(), BidAsk::single(dec!(52000)));
        let quotes = fetcher.get().await.unwrap();
        assert_eq!(price(&quotes), dec!(52000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_keeps_fallback_exceptions() {
        let failing = Arc::new(MockQuoteSource::new("bitstamp"));
        failing.set_failure(Some(SourceError::Timeout));
        let chain = Arc::new(crate::fallback::FallbackQuoteSource::new(
            SourceId::new("kraken"),
            vec![failing, mock(dec!(50000))],
        ));
        let cache = CachedQuoteSource::new(chain, Duration::from_secs(30));

        let quotes = cache.get().await.unwrap();
        assert_eq!(price(&quotes), dec!(50000));

        let entry = cache.entry();
        assert_eq!(entry.exceptions.len(), 1);
        assert_eq!(entry.exceptions[0].source_id, SourceId::new("bitstamp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let source = mock(dec!(50000));
        let cache = CachedQuoteSource::new(source.clone(), Duration::from_secs(30));
        cache.get().await.unwrap();
        assert!(cache.peek().is_some());

        cache.invalidate();
        assert!(cache.peek().is_none());
        assert!(cache.entry().never_fetched());

        cache.get().await.unwrap();
        assert_eq!(source.calls(), 2);
    }
}
