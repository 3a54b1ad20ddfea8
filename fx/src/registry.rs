//! Registered quote sources and their caches.
//!
//! The registry is an explicit table built at startup. Reconfiguring builds a
//! fresh table with fresh caches and swaps the `Arc`; batches already running
//! keep the table they started with.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapters;
use crate::cache::{BackgroundFetcher, CacheEntry, CacheStats, CachedQuoteSource};
use crate::config::{CacheConfig, CacheMode, EngineConfig};
use crate::error::{FxError, FxResult, SourceError, SourceFailure};
use crate::fallback::{FallbackInfo, FallbackQuoteSource};
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

/// What one source contributed to a batch.
#[derive(Debug, Clone, Default)]
pub struct SourceFetch {
    pub quotes: Option<Arc<QuoteSet>>,
    pub exceptions: Vec<SourceFailure>,
}

enum SourceCache {
    None,
    CacheAside(CachedQuoteSource),
    Background(BackgroundFetcher),
}

/// A registered source: its fallback chain behind its cache.
pub struct SourceSlot {
    id: SourceId,
    chain: Arc<FallbackQuoteSource>,
    mode: CacheMode,
    cache: SourceCache,
}

impl SourceSlot {
    pub fn new(chain: Arc<FallbackQuoteSource>, mode: CacheMode, config: &CacheConfig) -> Self {
        let inner: Arc<dyn QuoteSource> = chain.clone();
        let cache = match mode {
            CacheMode::None => SourceCache::None,
            CacheMode::CacheAside => SourceCache::CacheAside(CachedQuoteSource::new(inner, config.ttl())),
            CacheMode::Background => {
                let fetcher = BackgroundFetcher::new(inner, config.refresh_interval());
                SourceCache::Background(match config.validity() {
                    Some(validity) => fetcher.with_validity(validity),
                    None => fetcher,
                })
            }
        };
        Self {
            id: chain.id().clone(),
            chain,
            mode,
            cache,
        }
    }

    /// Slot around a single source.
    pub fn from_source(source: Arc<dyn QuoteSource>, mode: CacheMode, config: &CacheConfig) -> Self {
        Self::new(Arc::new(FallbackQuoteSource::single(source)), mode, config)
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    /// Same chain behind a fresh cache.
    fn rebuilt(&self, config: &CacheConfig) -> Self {
        Self::new(self.chain.clone(), self.mode, config)
    }

    /// Quotes for a batch, through the cache.
    pub async fn fetch(&self) -> SourceFetch {
        let result = match &self.cache {
            SourceCache::None => {
                return match self.chain.fetch().await {
                    Ok(outcome) => SourceFetch {
                        quotes: outcome.succeeded().then(|| Arc::new(outcome.quotes)),
                        exceptions: outcome.exceptions,
                    },
                    Err(e) => self.failed(e),
                };
            }
            SourceCache::CacheAside(cache) => cache.get().await,
            SourceCache::Background(fetcher) => fetcher.get().await,
        };
        match result {
            Ok(quotes) => self.cached(quotes),
            Err(e) => self.failed(e),
        }
    }

    /// Quotes for a preview: the cached snapshot if any, otherwise straight
    /// from the chain without touching the cache.
    pub async fn preview(&self) -> SourceFetch {
        if let Some(quotes) = self.peek() {
            return self.cached(quotes);
        }
        match self.chain.fetch().await {
            Ok(outcome) => SourceFetch {
                quotes: outcome.succeeded().then(|| Arc::new(outcome.quotes)),
                exceptions: outcome.exceptions,
            },
            Err(e) => self.failed(e),
        }
    }

    /// Cached snapshot, without fetching.
    pub fn peek(&self) -> Option<Arc<QuoteSet>> {
        match &self.cache {
            SourceCache::None => None,
            SourceCache::CacheAside(cache) => cache.peek(),
            SourceCache::Background(fetcher) => fetcher.peek(),
        }
    }

    /// Current cache entry. `None` for uncached sources.
    pub fn entry(&self) -> Option<Arc<CacheEntry>> {
        match &self.cache {
            SourceCache::None => None,
            SourceCache::CacheAside(cache) => Some(cache.entry()),
            SourceCache::Background(fetcher) => Some(fetcher.entry()),
        }
    }

    /// Refresh the cache now. A no-op for uncached sources.
    pub async fn refresh(&self) -> Result<(), SourceError> {
        match &self.cache {
            SourceCache::None => Ok(()),
            SourceCache::CacheAside(cache) => cache.refresh().await.map(|_| ()),
            SourceCache::Background(fetcher) => fetcher.refresh().await.map(|_| ()),
        }
    }

    pub fn invalidate(&self) {
        match &self.cache {
            SourceCache::None => {}
            SourceCache::CacheAside(cache) => cache.invalidate(),
            SourceCache::Background(fetcher) => fetcher.invalidate(),
        }
    }

    pub fn stats(&self) -> Option<CacheStats> {
        match &self.cache {
            SourceCache::None => None,
            SourceCache::CacheAside(cache) => Some(cache.stats()),
            SourceCache::Background(fetcher) => Some(fetcher.stats()),
        }
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            chain: self.chain.info(),
            mode: self.mode,
            stats: self.stats(),
        }
    }

    /// A cached snapshot with the exceptions stored alongside it.
    fn cached(&self, quotes: Arc<QuoteSet>) -> SourceFetch {
        let exceptions = match self.entry() {
            Some(entry) => match &entry.quotes {
                Some(current) if Arc::ptr_eq(current, &quotes) => entry.exceptions.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        SourceFetch {
            quotes: Some(quotes),
            exceptions,
        }
    }

    fn failed(&self, error: SourceError) -> SourceFetch {
        warn!(source = %self.id, error = %error, "Source unavailable");
        let exceptions = match error {
            SourceError::AllSourcesFailed { failures } => failures,
            other => vec![SourceFailure::new(self.id.clone(), &other)],
        };
        SourceFetch {
            quotes: None,
            exceptions,
        }
    }
}

/// Listing entry for one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    #[serde(flatten)]
    pub chain: FallbackInfo,
    pub mode: CacheMode,
    pub stats: Option<CacheStats>,
}

/// Immutable table of sources.
pub type SourceTable = BTreeMap<SourceId, Arc<SourceSlot>>;

/// Swappable source table.
pub struct SourceRegistry {
    table: RwLock<Arc<SourceTable>>,
    cache_config: RwLock<CacheConfig>,
}

impl SourceRegistry {
    pub fn new(slots: impl IntoIterator<Item = SourceSlot>, cache_config: CacheConfig) -> Self {
        let table = slots
            .into_iter()
            .map(|slot| (slot.id().clone(), Arc::new(slot)))
            .collect();
        Self {
            table: RwLock::new(Arc::new(table)),
            cache_config: RwLock::new(cache_config),
        }
    }

    /// Build every configured source with its adapters and cache.
    pub fn from_config(config: &EngineConfig) -> FxResult<Self> {
        config.validate().map_err(FxError::Config)?;

        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| FxError::Config(format!("HTTP client: {e}")))?;

        let slots = config.sources.iter().map(|source| {
            let members = source
                .members
                .iter()
                .map(|member| {
                    let member_id = if source.members.len() == 1 {
                        source.id.clone()
                    } else {
                        SourceId::new(member.name())
                    };
                    adapters::build(member_id, member, &client, config.http_timeout())
                })
                .collect();
            let chain = Arc::new(FallbackQuoteSource::new(source.id.clone(), members));
            let mode = source.cache.unwrap_or(config.cache.mode);
            info!(source = %source.id, mode = %mode, members = source.members.len(), "Registered source");
            SourceSlot::new(chain, mode, &config.cache)
        });

        Ok(Self::new(slots, config.cache.clone()))
    }

    /// Current table. Callers keep using it even if a swap happens.
    pub fn table(&self) -> Arc<SourceTable> {
        self.table.read().clone()
    }

    pub fn get(&self, id: &SourceId) -> Option<Arc<SourceSlot>> {
        self.table.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<SourceId> {
        self.table.read().keys().cloned().collect()
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache_config.read().clone()
    }

    /// Replace the whole table.
    pub fn swap(&self, table: SourceTable) -> Arc<SourceTable> {
        std::mem::replace(&mut *self.table.write(), Arc::new(table))
    }

    /// Rebuild every cache with new settings and swap the table in.
    pub fn reconfigure(&self, cache_config: CacheConfig) {
        let fresh: SourceTable = self
            .table()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::new(slot.rebuilt(&cache_config))))
            .collect();
        info!(
            ttl_secs = cache_config.ttl_secs,
            refresh_interval_secs = cache_config.refresh_interval_secs,
            "Source caches reconfigured"
        );
        *self.cache_config.write() = cache_config;
        self.swap(fresh);
    }

    /// Refresh every cached source concurrently.
    pub async fn refresh_all(&self) -> Vec<(SourceId, Result<(), SourceError>)> {
        let table = self.table();
        let refreshes = table.iter().map(|(id, slot)| async move {
            let result = slot.refresh().await;
            if let Err(e) = &result {
                warn!(source = %id, error = %e, "Scheduled refresh failed");
            }
            (id.clone(), result)
        });
        join_all(refreshes).await
    }

    /// Refresh all sources every `period` until `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn_refresher(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let results = self.refresh_all().await;
                        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                        debug!(sources = results.len(), failed, "Refresh round complete");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Source refresher stopped");
                            return;
                        }
                    }
                }
            }
        })
    }
}
