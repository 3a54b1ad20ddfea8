//! Batch rate fetching.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use ratebridge_common::{BidAsk, CurrencyPair};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::error::{ErrorSet, FxError, FxResult, RuleError, SourceFailure};
use crate::quote::{QuoteSet, SourceId};
use crate::registry::{SourceFetch, SourceRegistry, SourceTable};
use crate::rules::{BoundRule, RuleEvaluation, RuleSet};

/// Resolved rate for one pair, with everything needed to audit it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub pair: CurrencyPair,
    /// Rule as bound to the pair.
    pub rule: String,
    /// Rule with quote references replaced by the values used.
    pub evaluated_rule: String,
    pub bid_ask: Option<BidAsk>,
    pub errors: ErrorSet,
    /// Source failures met while fetching this pair's dependencies.
    pub exceptions: Vec<SourceFailure>,
    pub latency_ms: u64,
    pub fetched_at: DateTime<Utc>,
}

impl FetchResult {
    fn new(
        rule: &BoundRule,
        evaluation: RuleEvaluation,
        exceptions: Vec<SourceFailure>,
        spread: rust_decimal::Decimal,
        started: Instant,
    ) -> Self {
        let RuleEvaluation {
            mut bid_ask,
            mut errors,
            evaluated,
        } = evaluation;

        if let Some(value) = bid_ask {
            if !spread.is_zero() {
                match value.widen(spread) {
                    Ok(widened) => bid_ask = Some(widened),
                    Err(e) => {
                        errors.insert(RuleError::from(e));
                        bid_ask = None;
                    }
                }
            }
        }

        if bid_ask.is_none() && errors.is_empty() {
            errors.insert(RuleError::RateUnavailable {
                pair: rule.pair.clone(),
            });
        }

        Self {
            pair: rule.pair.clone(),
            rule: rule.to_string(),
            evaluated_rule: evaluated,
            bid_ask,
            errors,
            exceptions,
            latency_ms: started.elapsed().as_millis() as u64,
            fetched_at: Utc::now(),
        }
    }

    fn unavailable(pair: &CurrencyPair) -> Self {
        Self {
            pair: pair.clone(),
            rule: String::new(),
            evaluated_rule: String::new(),
            bid_ask: None,
            errors: RuleError::RateUnavailable { pair: pair.clone() }.into(),
            exceptions: Vec::new(),
            latency_ms: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.bid_ask.is_some()
    }

    /// The rate, or [`FxError::RateUnavailable`] with the recorded errors.
    pub fn into_rate(self) -> FxResult<BidAsk> {
        self.bid_ask.ok_or(FxError::RateUnavailable {
            pair: self.pair,
            errors: self.errors,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Live,
    /// Read cached snapshots when present, never write to a cache.
    Preview,
}

type SharedSourceFetch = Shared<BoxFuture<'static, SourceFetch>>;

/// Resolves currency pairs through a rule set against the registered
/// sources.
///
/// Within one batch every distinct source is fetched at most once, however
/// many pairs depend on it, and a failing source only degrades the pairs
/// whose rule needs it.
pub struct RateFetcher {
    registry: Arc<SourceRegistry>,
}

impl RateFetcher {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Resolve one pair.
    #[instrument(skip(self, rules), fields(pair = %pair))]
    pub async fn fetch_rate(&self, pair: &CurrencyPair, rules: &RuleSet) -> FetchResult {
        let mut results = self
            .run_batch(std::slice::from_ref(pair), rules, FetchMode::Live)
            .await;
        results
            .remove(pair)
            .unwrap_or_else(|| FetchResult::unavailable(pair))
    }

    /// Resolve a batch of pairs. Only an empty batch is an error; every pair
    /// otherwise gets a result of its own.
    #[instrument(skip(self, pairs, rules), fields(pairs = pairs.len()))]
    pub async fn fetch_rates(
        &self,
        pairs: &[CurrencyPair],
        rules: &RuleSet,
    ) -> FxResult<HashMap<CurrencyPair, FetchResult>> {
        if pairs.is_empty() {
            return Err(FxError::InvalidArgument("no currency pairs requested".into()));
        }
        Ok(self.run_batch(pairs, rules, FetchMode::Live).await)
    }

    /// Like [`fetch_rates`](Self::fetch_rates) for a draft rule set, without
    /// writing to any cache.
    #[instrument(skip(self, pairs, draft), fields(pairs = pairs.len()))]
    pub async fn preview(
        &self,
        pairs: &[CurrencyPair],
        draft: &RuleSet,
    ) -> FxResult<HashMap<CurrencyPair, FetchResult>> {
        if pairs.is_empty() {
            return Err(FxError::InvalidArgument("no currency pairs requested".into()));
        }
        Ok(self.run_batch(pairs, draft, FetchMode::Preview).await)
    }

    /// Parse draft rule text and preview it.
    pub async fn preview_text(
        &self,
        pairs: &[CurrencyPair],
        rules: &str,
        default_rule: &str,
    ) -> FxResult<HashMap<CurrencyPair, FetchResult>> {
        let draft = RuleSet::parse(rules, default_rule)?;
        self.preview(pairs, &draft).await
    }

    async fn run_batch(
        &self,
        pairs: &[CurrencyPair],
        rules: &RuleSet,
        mode: FetchMode,
    ) -> HashMap<CurrencyPair, FetchResult> {
        let started = Instant::now();
        let table = self.registry.table();

        let bound: Vec<BoundRule> = pairs
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|pair| {
                if pair.is_identity() {
                    BoundRule::identity(pair)
                } else {
                    rules.bind(pair)
                }
            })
            .collect();

        let needed: BTreeSet<SourceId> = bound
            .iter()
            .flat_map(|rule| rule.sources())
            .filter(|id| table.contains_key(id))
            .collect();
        let fetches = start_fetches(&table, &needed, mode);

        let spread = rules.spread();
        let evaluations = bound.iter().map(|rule| {
            let fetches = &fetches;
            async move {
                let deps: Vec<SourceId> = rule
                    .sources()
                    .into_iter()
                    .filter(|id| fetches.contains_key(id))
                    .collect();
                let outcomes = join_all(deps.iter().map(|id| fetches[id].clone())).await;

                let mut quotes = QuoteSet::new();
                let mut exceptions = Vec::new();
                for (id, outcome) in deps.into_iter().zip(outcomes) {
                    quotes.mark_known(id);
                    if let Some(snapshot) = &outcome.quotes {
                        quotes.extend(snapshot);
                    }
                    exceptions.extend(outcome.exceptions);
                }

                // A pair priced against itself stays at exactly one.
                let spread = if rule.pair.is_identity() {
                    rust_decimal::Decimal::ZERO
                } else {
                    spread
                };
                FetchResult::new(rule, rule.evaluate(&quotes), exceptions, spread, started)
            }
        });
        let results = join_all(evaluations).await;

        let resolved = results.iter().filter(|r| r.is_ok()).count();
        debug!(
            pairs = results.len(),
            sources = needed.len(),
            resolved,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rate batch complete"
        );

        results.into_iter().map(|r| (r.pair.clone(), r)).collect()
    }
}

/// One shared fetch per distinct source, started together.
fn start_fetches(
    table: &SourceTable,
    needed: &BTreeSet<SourceId>,
    mode: FetchMode,
) -> HashMap<SourceId, SharedSourceFetch> {
    needed
        .iter()
        .filter_map(|id| {
            let slot = table.get(id)?.clone();
            let fetch = async move {
                match mode {
                    FetchMode::Live => slot.fetch().await,
                    FetchMode::Preview => slot.preview().await,
                }
            }
            .boxed()
            .shared();
            Some((id.clone(), fetch))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedQuoteSource;
    use crate::config::{CacheConfig, CacheMode};
    use crate::error::SourceError;
    use crate::fallback::FallbackQuoteSource;
    use crate::provider::{MockQuoteSource, QuoteSource};
    use crate::registry::SourceSlot;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn pair(s: &str) -> CurrencyPair {
        CurrencyPair::parse(s).unwrap()
    }

    fn mock(id: &str, quotes: &[(&str, Decimal, Decimal)]) -> Arc<MockQuoteSource> {
        let source = Arc::new(MockQuoteSource::new(id));
        for (p, bid, ask) in quotes {
            source.set_quote(pair(p), BidAsk::new(*bid, *ask));
        }
        source
    }

    fn fetcher(sources: Vec<Arc<MockQuoteSource>>, mode: CacheMode) -> RateFetcher {
        let config = CacheConfig::default();
        let slots: Vec<SourceSlot> = sources
            .into_iter()
            .map(|s| SourceSlot::from_source(s, mode, &config))
            .collect();
        RateFetcher::new(Arc::new(SourceRegistry::new(slots, config)))
    }

    #[tokio::test]
    async fn test_one_fetch_per_source() {
        let kraken = mock(
            "kraken",
            &[
                ("BTC_USD", dec!(50000), dec!(50010)),
                ("BTC_EUR", dec!(46000), dec!(46010)),
                ("ETH_USD", dec!(3000), dec!(3001)),
            ],
        );
        let engine = fetcher(vec![kraken.clone()], CacheMode::None);
        let rules = RuleSet::parse("", "kraken(X_X)").unwrap();

        let pairs = [pair("BTC_USD"), pair("BTC_EUR"), pair("ETH_USD")];
        let results = engine.fetch_rates(&pairs, &rules).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.is_ok()));
        assert_eq!(kraken.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_isolated() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50010))]);
        kraken.set_failure(Some(SourceError::Timeout));
        let bitstamp = mock("bitstamp", &[("BTC_EUR", dec!(46000), dec!(46010))]);
        let engine = fetcher(vec![kraken, bitstamp], CacheMode::None);

        let rules = RuleSet::parse(
            "BTC_USD = kraken(BTC_USD);
             BTC_EUR = bitstamp(BTC_EUR);",
            "0",
        )
        .unwrap();
        let results = engine
            .fetch_rates(&[pair("BTC_USD"), pair("BTC_EUR")], &rules)
            .await
            .unwrap();

        let usd = &results[&pair("BTC_USD")];
        assert!(usd.bid_ask.is_none());
        assert!(usd.errors.has_code("PAIR_UNAVAILABLE"));
        assert_eq!(usd.exceptions.len(), 1);
        assert_eq!(usd.exceptions[0].source_id, SourceId::new("kraken"));

        let eur = &results[&pair("BTC_EUR")];
        assert_eq!(eur.bid_ask, Some(BidAsk::new(dec!(46000), dec!(46010))));
        assert!(eur.exceptions.is_empty());
    }

    #[tokio::test]
    async fn test_rule_examples_end_to_end() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50010))]);
        let bitstamp = mock("bitstamp", &[("BTC_USD", dec!(19990), dec!(20010))]);
        let engine = fetcher(vec![kraken, bitstamp], CacheMode::None);
        let btc_usd = pair("BTC_USD");

        let result = engine
            .fetch_rate(&btc_usd, &RuleSet::parse("", "kraken(BTC_USD)").unwrap())
            .await;
        assert_eq!(result.bid_ask, Some(BidAsk::new(dec!(50000), dec!(50010))));
        assert_eq!(result.rule, "kraken(BTC_USD)");
        assert_eq!(result.evaluated_rule, "(50000 | 50010)");

        let result = engine
            .fetch_rate(&btc_usd, &RuleSet::parse("", "bitstamp(BTC_USD) * 1.01").unwrap())
            .await;
        assert_eq!(result.bid_ask.unwrap().mid(), dec!(20200));

        let result = engine
            .fetch_rate(&btc_usd, &RuleSet::parse("", "kraken(BTC_USD) / 0").unwrap())
            .await;
        assert!(result.bid_ask.is_none());
        assert!(result.errors.contains(&RuleError::DivideByZero));
        assert!(matches!(
            result.into_rate(),
            Err(FxError::RateUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_source_not_fetched() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50010))]);
        let engine = fetcher(vec![kraken.clone()], CacheMode::None);
        let rules = RuleSet::parse("", "nowhere(BTC_USD)").unwrap();

        let result = engine.fetch_rate(&pair("BTC_USD"), &rules).await;
        assert!(result.errors.contains(&RuleError::UnknownSource {
            source_id: SourceId::new("nowhere")
        }));
        assert_eq!(kraken.calls(), 0);
    }

    #[tokio::test]
    async fn test_identity_and_spread() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(100), dec!(100))]);
        let engine = fetcher(vec![kraken], CacheMode::None);
        let rules = RuleSet::parse("", "kraken(X_X)")
            .unwrap()
            .with_spread(dec!(0.01));

        let results = engine
            .fetch_rates(&[pair("USD_USD"), pair("BTC_USD")], &rules)
            .await
            .unwrap();

        let identity = &results[&pair("USD_USD")];
        assert_eq!(identity.rule, "1");
        assert_eq!(identity.bid_ask, Some(BidAsk::single(dec!(1))));

        let btc = &results[&pair("BTC_USD")];
        assert_eq!(btc.bid_ask, Some(BidAsk::new(dec!(99), dec!(101))));
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let engine = fetcher(Vec::new(), CacheMode::None);
        let rules = RuleSet::parse("", "1").unwrap();
        assert!(matches!(
            engine.fetch_rates(&[], &rules).await,
            Err(FxError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.preview_text(&[pair("BTC_USD")], "BTC_USD = (", "1").await,
            Err(FxError::RuleParse(_))
        ));
    }

    #[tokio::test]
    async fn test_fallback_chain_in_batch() {
        let a = mock("a", &[]);
        a.set_failure(Some(SourceError::Http { status: 503 }));
        let b = mock("b", &[("BTC_USD", dec!(50000), dec!(50010))]);
        let chain = Arc::new(FallbackQuoteSource::new(
            SourceId::new("kraken"),
            vec![a.clone(), b.clone()],
        ));

        let config = CacheConfig::default();
        let registry = SourceRegistry::new(
            [SourceSlot::new(chain, CacheMode::None, &config)],
            config,
        );
        let engine = RateFetcher::new(Arc::new(registry));
        let rules = RuleSet::parse("", "kraken(BTC_USD)").unwrap();

        let result = engine.fetch_rate(&pair("BTC_USD"), &rules).await;
        assert!(result.is_ok());
        assert_eq!(result.exceptions.len(), 1);
        assert_eq!(result.exceptions[0].source_id, SourceId::new("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_across_batches() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50010))]);
        kraken.set_delay(Duration::from_millis(50));
        let engine = Arc::new(fetcher(vec![kraken.clone()], CacheMode::CacheAside));
        let rules = Arc::new(RuleSet::parse("", "kraken(X_X)").unwrap());

        let callers: Vec<_> = (0..50)
            .map(|_| {
                let engine = engine.clone();
                let rules = rules.clone();
                tokio::spawn(async move { engine.fetch_rate(&pair("BTC_USD"), &rules).await })
            })
            .collect();

        for result in join_all(callers).await {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(kraken.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preview_does_not_fill_cache() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50010))]);
        let engine = fetcher(vec![kraken.clone()], CacheMode::CacheAside);
        let btc = pair("BTC_USD");

        let preview = engine
            .preview_text(&[btc.clone()], "", "kraken(BTC_USD) * 2")
            .await
            .unwrap();
        assert_eq!(preview[&btc].bid_ask.unwrap().bid(), dec!(100000));

        let slot = engine.registry().get(&SourceId::new("kraken")).unwrap();
        assert!(slot.peek().is_none());

        // Once the cache holds a snapshot, previews read it instead of fetching.
        let rules = RuleSet::parse("", "kraken(BTC_USD)").unwrap();
        engine.fetch_rate(&btc, &rules).await;
        let calls = kraken.calls();
        engine
            .preview_text(&[btc.clone()], "", "kraken(BTC_USD)")
            .await
            .unwrap();
        assert_eq!(kraken.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cache_stale_while_revalidate() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(50000), dec!(50000))]);
        let engine = fetcher(vec![kraken.clone()], CacheMode::Background);
        let rules = RuleSet::parse("", "kraken(BTC_USD)").unwrap();
        let btc = pair("BTC_USD");

        assert_eq!(
            engine.fetch_rate(&btc, &rules).await.bid_ask,
            Some(BidAsk::single(dec!(50000)))
        );

        kraken.set_quote(btc.clone(), BidAsk::single(dec!(60000)));
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(
            engine.fetch_rate(&btc, &rules).await.bid_ask,
            Some(BidAsk::single(dec!(50000)))
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            engine.fetch_rate(&btc, &rules).await.bid_ask,
            Some(BidAsk::single(dec!(60000)))
        );
    }

    #[tokio::test]
    async fn test_cached_source_wraps_any_quote_source() {
        let kraken = mock("kraken", &[("BTC_USD", dec!(1), dec!(2))]);
        let cached = CachedQuoteSource::new(kraken.clone(), Duration::from_secs(30));
        cached.get_quotes().await.unwrap();
        cached.get_quotes().await.unwrap();
        assert_eq!(cached.id(), &SourceId::new("kraken"));
        assert_eq!(kraken.calls(), 1);
    }

    proptest! {
        #[test]
        fn prop_batch_deterministic(bid in 1u64..100_000, width in 0u64..100) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let kraken = mock(
                "kraken",
                &[("BTC_USD", Decimal::from(bid), Decimal::from(bid + width))],
            );
            let engine = fetcher(vec![kraken], CacheMode::None);
            let rules = RuleSet::parse("", "mid(kraken(X_X)) * 1.5 + kraken(USD_BTC)").unwrap();

            let (first, second) = runtime.block_on(async {
                let a = engine.fetch_rate(&pair("BTC_USD"), &rules).await;
                let b = engine.fetch_rate(&pair("BTC_USD"), &rules).await;
                (a, b)
            });
            prop_assert_eq!(first.bid_ask, second.bid_ask);
            prop_assert_eq!(first.evaluated_rule, second.evaluated_rule);
        }
    }
}
