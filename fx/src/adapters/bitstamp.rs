//! Bitstamp ticker adapter.

use async_trait::async_trait;
use ratebridge_common::{BidAsk, CurrencyPair};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use super::symbols::SkipList;
use crate::error::SourceError;
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

pub const DEFAULT_BASE_URL: &str = "https://www.bitstamp.net";

#[derive(Debug, Deserialize)]
struct Ticker {
    pair: String,
    bid: String,
    ask: String,
}

pub struct BitstampSource {
    id: SourceId,
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    skip: SkipList,
}

impl BitstampSource {
    pub fn new(id: SourceId, client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            id,
            client,
            base_url,
            timeout,
            skip: SkipList::new(),
        }
    }

    /// Parse the ticker list. Rows with unreadable prices are dropped.
    pub fn parse(&self, body: &str) -> Result<QuoteSet, SourceError> {
        let tickers: Vec<Ticker> = serde_json::from_str(body)?;

        let mut quotes = QuoteSet::for_source(self.id.clone());
        for ticker in tickers {
            let Some(pair) = self
                .skip
                .normalize(&ticker.pair, |raw| CurrencyPair::parse(raw).ok())
            else {
                continue;
            };
            if let (Ok(bid), Ok(ask)) = (Decimal::from_str(&ticker.bid), Decimal::from_str(&ticker.ask)) {
                quotes.insert(self.id.clone(), pair, BidAsk::new(bid, ask));
            }
        }
        Ok(quotes)
    }
}

#[async_trait]
impl QuoteSource for BitstampSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        let url = format!("{}/api/v2/ticker/", self.base_url.trim_end_matches('/'));
        let body = super::get_text(&self.client, &url, self.timeout).await?;
        self.parse(&body)
    }
}
