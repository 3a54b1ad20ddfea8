//! Quote source trait and in-memory implementations.

use async_trait::async_trait;
use ratebridge_common::{BidAsk, CurrencyPair};

use crate::error::{SourceError, SourceFailure};
use crate::quote::{QuoteSet, SourceId};

/// A price feed that returns a snapshot of quotes for many pairs at once.
///
/// Implementations return transport errors as-is; retries belong to the
/// cache and fallback layers.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Identifier quotes are filed under.
    fn id(&self) -> &SourceId;

    /// Fetch the current quote snapshot.
    async fn get_quotes(&self) -> Result<QuoteSet, SourceError>;

    /// Like [`get_quotes`](Self::get_quotes), plus the failures met on the
    /// way to a snapshot that still succeeded.
    async fn get_quotes_with_exceptions(
        &self,
    ) -> Result<(QuoteSet, Vec<SourceFailure>), SourceError> {
        self.get_quotes().await.map(|quotes| (quotes, Vec::new()))
    }
}

/// Fixed quote table, used for configured pegs.
pub struct StaticQuoteSource {
    id: SourceId,
    quotes: QuoteSet,
}

impl StaticQuoteSource {
    pub fn new(id: SourceId) -> Self {
        Self {
            quotes: QuoteSet::for_source(id.clone()),
            id,
        }
    }

    pub fn with_quote(mut self, pair: CurrencyPair, bid_ask: BidAsk) -> Self {
        self.quotes.insert(self.id.clone(), pair, bid_ask);
        self
    }
}

#[async_trait]
impl QuoteSource for StaticQuoteSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        Ok(self.quotes.clone())
    }
}

/// Mock quote source for testing.
#[cfg(any(test, feature = "test-utils"))]
pub struct MockQuoteSource {
    id: SourceId,
    quotes: dashmap::DashMap<CurrencyPair, BidAsk>,
    failure: parking_lot::Mutex<Option<SourceError>>,
    delay: parking_lot::Mutex<Option<std::time::Duration>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-utils"))]
impl MockQuoteSource {
    /// Create a new mock source.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self {
            id: SourceId::new(id),
            quotes: dashmap::DashMap::new(),
            failure: parking_lot::Mutex::new(None),
            delay: parking_lot::Mutex::new(None),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Set a quote for a currency pair.
    pub fn set_quote(&self, pair: CurrencyPair, bid_ask: BidAsk) {
        self.quotes.insert(pair, bid_ask);
    }

    /// Make every following fetch fail with `error`, or succeed again with `None`.
    pub fn set_failure(&self, error: Option<SourceError>) {
        *self.failure.lock() = error;
    }

    /// Sleep this long inside every fetch.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl QuoteSource for MockQuoteSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let mut set = QuoteSet::for_source(self.id.clone());
        for entry in self.quotes.iter() {
            set.insert(self.id.clone(), entry.key().clone(), *entry.value());
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok, block_on};

    fn pair(s: &str) -> CurrencyPair {
        CurrencyPair::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_mock_source() {
        let source = MockQuoteSource::new("test");
        source.set_quote(pair("USD_EUR"), BidAsk::new(dec!(0.91), dec!(0.93)));

        let quotes = source.get_quotes().await.unwrap();
        let rate = quotes.get(source.id(), &pair("USD_EUR")).unwrap();

        assert_eq!(rate.bid(), dec!(0.91));
        assert_eq!(rate.ask(), dec!(0.93));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_source_failure() {
        let source = MockQuoteSource::new("test");
        source.set_failure(Some(SourceError::Timeout));
        let err = assert_err!(source.get_quotes().await);
        assert_eq!(err, SourceError::Timeout);

        source.set_failure(None);
        assert_ok!(source.get_quotes().await);
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn test_static_source() {
        let source = StaticQuoteSource::new(SourceId::new("peg"))
            .with_quote(pair("USDT_USD"), BidAsk::single(dec!(1)));

        let quotes = assert_ok!(block_on(source.get_quotes()));
        assert_eq!(quotes.len(), 1);
        assert!(quotes.knows_source(&SourceId::new("peg")));
    }
}
