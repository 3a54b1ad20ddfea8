//! Quotes and quote sets.

use ratebridge_common::{BidAsk, CurrencyPair};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::RuleError;

/// Identifier of a price source, normalized to lower case (`kraken`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SourceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<SourceId> for String {
    fn from(value: SourceId) -> Self {
        value.0
    }
}

/// One price from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub source_id: SourceId,
    pub pair: CurrencyPair,
    pub bid_ask: BidAsk,
}

/// Quotes keyed by (source, pair).
///
/// Also tracks which sources are known to the set, fetched or not, so a
/// lookup can tell an unregistered source from a registered one that simply
/// lacks the pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteSet {
    quotes: HashMap<(SourceId, CurrencyPair), BidAsk>,
    known_sources: BTreeSet<SourceId>,
}

impl QuoteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty set that knows about one source.
    pub fn for_source(source_id: SourceId) -> Self {
        let mut set = Self::new();
        set.mark_known(source_id);
        set
    }

    /// Insert or replace a quote.
    pub fn insert(&mut self, source_id: SourceId, pair: CurrencyPair, bid_ask: BidAsk) {
        self.known_sources.insert(source_id.clone());
        self.quotes.insert((source_id, pair), bid_ask);
    }

    pub fn mark_known(&mut self, source_id: SourceId) {
        self.known_sources.insert(source_id);
    }

    pub fn knows_source(&self, source_id: &SourceId) -> bool {
        self.known_sources.contains(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.known_sources.iter()
    }

    /// Exact lookup, no inversion.
    pub fn get(&self, source_id: &SourceId, pair: &CurrencyPair) -> Option<BidAsk> {
        self.quotes
            .get(&(source_id.clone(), pair.clone()))
            .copied()
    }

    /// Resolve a quote, inverting the opposite pair if only that is quoted.
    pub fn resolve(&self, source_id: &SourceId, pair: &CurrencyPair) -> Result<BidAsk, RuleError> {
        if !self.knows_source(source_id) {
            return Err(RuleError::UnknownSource {
                source_id: source_id.clone(),
            });
        }

        if let Some(bid_ask) = self.get(source_id, pair) {
            return Ok(bid_ask);
        }

        self.get(source_id, &pair.inverse())
            .and_then(|inverse| inverse.inverse().ok())
            .ok_or_else(|| RuleError::PairUnavailable {
                source_id: source_id.clone(),
                pair: pair.clone(),
            })
    }

    /// Copy every quote and known source of `other` into this set.
    pub fn extend(&mut self, other: &QuoteSet) {
        self.known_sources
            .extend(other.known_sources.iter().cloned());
        self.quotes
            .extend(other.quotes.iter().map(|(k, v)| (k.clone(), *v)));
    }

    /// Re-key every quote under `source_id`. Used when a fallback member
    /// answers on behalf of the chain.
    pub fn relabel(self, source_id: &SourceId) -> QuoteSet {
        let mut set = QuoteSet::for_source(source_id.clone());
        for ((_, pair), bid_ask) in self.quotes {
            set.quotes.insert((source_id.clone(), pair), bid_ask);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Quote> + '_ {
        self.quotes.iter().map(|((source_id, pair), bid_ask)| Quote {
            source_id: source_id.clone(),
            pair: pair.clone(),
            bid_ask: *bid_ask,
        })
    }
}

impl FromIterator<Quote> for QuoteSet {
    fn from_iter<T: IntoIterator<Item = Quote>>(iter: T) -> Self {
        let mut set = QuoteSet::new();
        for quote in iter {
            set.insert(quote.source_id, quote.pair, quote.bid_ask);
        }
        set
    }
}
