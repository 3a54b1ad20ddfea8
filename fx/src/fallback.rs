//! Ordered fallback over several quote sources.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{SourceError, SourceFailure};
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

/// Result of walking a fallback chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackOutcome {
    /// Quotes from the first member that succeeded, relabeled to the chain id.
    /// Empty when every member failed.
    pub quotes: QuoteSet,
    /// One entry per member that failed before the answer was found.
    pub exceptions: Vec<SourceFailure>,
    /// Member that answered.
    pub answered_by: Option<SourceId>,
}

impl FallbackOutcome {
    pub fn succeeded(&self) -> bool {
        self.answered_by.is_some()
    }
}

/// Summary of a chain for listings.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackInfo {
    pub id: SourceId,
    pub members: Vec<SourceId>,
}

/// Tries each member in order and returns the first success.
pub struct FallbackQuoteSource {
    id: SourceId,
    sources: Vec<Arc<dyn QuoteSource>>,
}

impl FallbackQuoteSource {
    /// Create a chain reporting under `id`.
    pub fn new(id: SourceId, sources: Vec<Arc<dyn QuoteSource>>) -> Self {
        Self { id, sources }
    }

    /// A chain of one, reporting under the member's own id.
    pub fn single(source: Arc<dyn QuoteSource>) -> Self {
        Self {
            id: source.id().clone(),
            sources: vec![source],
        }
    }

    pub fn info(&self) -> FallbackInfo {
        FallbackInfo {
            id: self.id.clone(),
            members: self.sources.iter().map(|s| s.id().clone()).collect(),
        }
    }

    /// Walk the chain. Member failures are collected, not returned; only
    /// cancellation stops the walk with an error.
    pub async fn fetch(&self) -> Result<FallbackOutcome, SourceError> {
        let mut exceptions = Vec::new();

        for source in &self.sources {
            match source.get_quotes().await {
                Ok(quotes) => {
                    debug!(
                        source = %self.id,
                        member = %source.id(),
                        quotes = quotes.len(),
                        "Fallback member answered"
                    );
                    return Ok(FallbackOutcome {
                        quotes: quotes.relabel(&self.id),
                        exceptions,
                        answered_by: Some(source.id().clone()),
                    });
                }
                Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
                Err(e) => {
                    warn!(
                        source = %self.id,
                        member = %source.id(),
                        error = %e,
                        "Fallback member failed"
                    );
                    exceptions.push(SourceFailure::new(source.id().clone(), &e));
                }
            }
        }

        Ok(FallbackOutcome {
            quotes: QuoteSet::for_source(self.id.clone()),
            exceptions,
            answered_by: None,
        })
    }
}

#[async_trait]
impl QuoteSource for FallbackQuoteSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        self.get_quotes_with_exceptions()
            .await
            .map(|(quotes, _)| quotes)
    }

    async fn get_quotes_with_exceptions(
        &self,
    ) -> Result<(QuoteSet, Vec<SourceFailure>), SourceError> {
        let outcome = self.fetch().await?;
        if outcome.succeeded() {
            Ok((outcome.quotes, outcome.exceptions))
        } else {
            Err(SourceError::AllSourcesFailed {
                failures: outcome.exceptions,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockQuoteSource;
    use ratebridge_common::{BidAsk, CurrencyPair};
    use rust_decimal_macros::dec;

    fn pair(s: &str) -> CurrencyPair {
        CurrencyPair::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let a = Arc::new(MockQuoteSource::new("a"));
        a.set_failure(Some(SourceError::Http { status: 503 }));
        let b = Arc::new(MockQuoteSource::new("b"));
        b.set_quote(pair("BTC_USD"), BidAsk::single(dec!(50000)));
        let c = Arc::new(MockQuoteSource::new("c"));

        let chain = FallbackQuoteSource::new(
            SourceId::new("chain"),
            vec![a.clone(), b.clone(), c.clone()],
        );
        let outcome = chain.fetch().await.unwrap();

        assert_eq!(outcome.answered_by, Some(SourceId::new("b")));
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].source_id, SourceId::new("a"));
        assert!(outcome
            .quotes
            .get(&SourceId::new("chain"), &pair("BTC_USD"))
            .is_some());
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_is_empty_not_error() {
        let a = Arc::new(MockQuoteSource::new("a"));
        a.set_failure(Some(SourceError::Timeout));
        let b = Arc::new(MockQuoteSource::new("b"));
        b.set_failure(Some(SourceError::Network("refused".into())));

        let chain = FallbackQuoteSource::new(SourceId::new("chain"), vec![a, b]);
        let outcome = chain.fetch().await.unwrap();
        assert!(!outcome.succeeded());
        assert!(outcome.quotes.is_empty());
        assert!(outcome.quotes.knows_source(&SourceId::new("chain")));
        assert_eq!(outcome.exceptions.len(), 2);

        match chain.get_quotes().await {
            Err(SourceError::AllSourcesFailed { failures }) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let a = Arc::new(MockQuoteSource::new("a"));
        a.set_failure(Some(SourceError::Cancelled));
        let b = Arc::new(MockQuoteSource::new("b"));

        let chain = FallbackQuoteSource::new(SourceId::new("chain"), vec![a, b.clone()]);
        assert_eq!(chain.fetch().await, Err(SourceError::Cancelled));
        assert_eq!(b.calls(), 0);
    }
}
