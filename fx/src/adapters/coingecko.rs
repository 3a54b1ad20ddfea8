//! CoinGecko exchange-rate table adapter.
//!
//! The endpoint lists the value of one BTC in many currencies, so every quote
//! is `BTC_<CODE>` with no spread.

use async_trait::async_trait;
use ratebridge_common::{BidAsk, Currency, CurrencyPair};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::symbols::SkipList;
use crate::error::SourceError;
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

pub const DEFAULT_BASE_URL: &str = "https://api.coingecko.com";

#[derive(Debug, Deserialize)]
struct RatesResponse {
    rates: HashMap<String, Rate>,
}

#[derive(Debug, Deserialize)]
struct Rate {
    value: serde_json::Number,
}

pub struct CoingeckoSource {
    id: SourceId,
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    skip: SkipList,
}

impl CoingeckoSource {
    pub fn new(id: SourceId, client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            id,
            client,
            base_url,
            timeout,
            skip: SkipList::new(),
        }
    }

    pub fn parse(&self, body: &str) -> Result<QuoteSet, SourceError> {
        let response: RatesResponse = serde_json::from_str(body)?;

        let mut quotes = QuoteSet::for_source(self.id.clone());
        for (code, rate) in &response.rates {
            if code.eq_ignore_ascii_case("btc") {
                continue;
            }
            let Some(pair) = self.skip.normalize(code, |raw| {
                Currency::new(raw)
                    .ok()
                    .map(|quote| CurrencyPair::new(Currency::btc(), quote))
            }) else {
                continue;
            };
            let text = rate.value.to_string();
            let value = Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text));
            if let Ok(value) = value {
                quotes.insert(self.id.clone(), pair, BidAsk::single(value));
            }
        }
        Ok(quotes)
    }
}

#[async_trait]
impl QuoteSource for CoingeckoSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        let url = format!(
            "{}/api/v3/exchange_rates",
            self.base_url.trim_end_matches('/')
        );
        let body = super::get_text(&self.client, &url, self.timeout).await?;
        self.parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_rates() {
        let gecko = CoingeckoSource::new(
            SourceId::new("coingecko"),
            reqwest::Client::new(),
            DEFAULT_BASE_URL.to_string(),
            Duration::from_secs(5),
        );
        let body = r#"{"rates": {
            "btc": {"name": "Bitcoin", "unit": "BTC", "value": 1.0, "type": "crypto"},
            "usd": {"name": "US Dollar", "unit": "$", "value": 50000.5, "type": "fiat"},
            "eth": {"name": "Ether", "unit": "ETH", "value": 1.5e1, "type": "crypto"}
        }}"#;

        let quotes = gecko.parse(body).unwrap();
        assert_eq!(quotes.len(), 2);

        let usd = quotes
            .get(gecko.id(), &CurrencyPair::parse("BTC_USD").unwrap())
            .unwrap();
        assert_eq!(usd, BidAsk::single(dec!(50000.5)));

        let eth = quotes
            .get(gecko.id(), &CurrencyPair::parse("BTC_ETH").unwrap())
            .unwrap();
        assert_eq!(eth.mid(), dec!(15));
    }
}
