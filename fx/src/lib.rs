//! RateBridge Rate Engine
//!
//! Aggregates exchange quotes into per-pair bid/ask rates.
//!
//! # Features
//!
//! - Exchange adapters behind one `QuoteSource` trait, composed into
//!   ordered fallback chains
//! - Cache-aside and stale-while-revalidate caching with single-flight fetches
//! - A small rule language (`X_USD = kraken(X_BTC) * BTC_USD;`) over bid/ask
//!   intervals
//! - Batch fetching that hits each source once and isolates failures per pair
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ratebridge_fx::{EngineConfig, RateFetcher, RuleSet, SourceRegistry};
//! use ratebridge_common::CurrencyPair;
//!
//! let registry = SourceRegistry::from_config(&EngineConfig::from_env())?;
//! let fetcher = RateFetcher::new(Arc::new(registry));
//!
//! let rules = RuleSet::parse("X_USD = kraken(X_USD);", "coingecko(X_X)")?;
//! let result = fetcher.fetch_rate(&CurrencyPair::parse("BTC_USD")?, &rules).await;
//! println!("{}", result.into_rate()?);
//! ```

pub mod adapters;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod provider;
pub mod quote;
pub mod registry;
pub mod rules;

pub use cache::{BackgroundFetcher, CacheEntry, CacheStats, CachedQuoteSource};
pub use config::{AdapterConfig, CacheConfig, CacheMode, EngineConfig, SourceConfig};
pub use engine::{FetchResult, RateFetcher};
pub use error::{ErrorSet, FxError, FxResult, RuleError, RuleParseError, SourceError, SourceFailure};
pub use fallback::{FallbackOutcome, FallbackQuoteSource};
pub use provider::{QuoteSource, StaticQuoteSource};
pub use quote::{Quote, QuoteSet, SourceId};
pub use registry::{SourceInfo, SourceRegistry, SourceSlot};
pub use rules::{BoundRule, RuleEvaluation, RuleSet};

#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockQuoteSource;
