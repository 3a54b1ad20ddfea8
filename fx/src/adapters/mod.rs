//! Exchange adapters.
//!
//! Each adapter is a [`QuoteSource`](crate::provider::QuoteSource) that pulls
//! one public ticker endpoint and turns the body into a [`QuoteSet`]. Parsing
//! is a plain function over the response text so it can be exercised without
//! a network.

pub mod bitstamp;
pub mod coingecko;
pub mod kraken;
pub mod symbols;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::AdapterConfig;
use crate::error::SourceError;
use crate::provider::{QuoteSource, StaticQuoteSource};
use crate::quote::SourceId;

pub use bitstamp::BitstampSource;
pub use coingecko::CoingeckoSource;
pub use kraken::KrakenSource;

/// GET `url` and return the body, mapping non-2xx statuses to
/// [`SourceError::Http`].
pub(crate) async fn get_text(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<String, SourceError> {
    let response = client.get(url).timeout(timeout).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Http {
            status: status.as_u16(),
        });
    }
    let body = response.text().await?;
    debug!(url, bytes = body.len(), "Fetched quote body");
    Ok(body)
}

/// Build the quote source described by one adapter entry.
///
/// The source reports itself under `id`, which is the registry id for a
/// single-member chain and the member's own id otherwise.
pub fn build(
    id: SourceId,
    config: &AdapterConfig,
    client: &reqwest::Client,
    timeout: Duration,
) -> Arc<dyn QuoteSource> {
    match config {
        AdapterConfig::Kraken { base_url } => Arc::new(KrakenSource::new(
            id,
            client.clone(),
            base_url.clone(),
            timeout,
        )),
        AdapterConfig::Bitstamp { base_url } => Arc::new(BitstampSource::new(
            id,
            client.clone(),
            base_url.clone(),
            timeout,
        )),
        AdapterConfig::Coingecko { base_url } => Arc::new(CoingeckoSource::new(
            id,
            client.clone(),
            base_url.clone(),
            timeout,
        )),
        AdapterConfig::Static { quotes } => {
            let source = quotes
                .iter()
                .fold(StaticQuoteSource::new(id), |source, quote| {
                    source.with_quote(quote.pair.clone(), quote.bid_ask())
                });
            Arc::new(source)
        }
    }
}
