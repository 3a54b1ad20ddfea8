//! Kraken public ticker adapter.

use async_trait::async_trait;
use ratebridge_common::{BidAsk, Currency, CurrencyPair, CurrencyTable};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::symbols::SkipList;
use crate::error::SourceError;
use crate::provider::QuoteSource;
use crate::quote::{QuoteSet, SourceId};

pub const DEFAULT_BASE_URL: &str = "https://api.kraken.com";

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, Ticker>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    /// Ask `[price, whole lot volume, lot volume]`.
    a: Vec<String>,
    /// Bid, same layout.
    b: Vec<String>,
}

pub struct KrakenSource {
    id: SourceId,
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    skip: SkipList,
}

impl KrakenSource {
    pub fn new(id: SourceId, client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            id,
            client,
            base_url,
            timeout,
            skip: SkipList::new(),
        }
    }

    /// Parse a ticker response body.
    pub fn parse(&self, body: &str) -> Result<QuoteSet, SourceError> {
        let response: TickerResponse = serde_json::from_str(body)?;
        if !response.error.is_empty() {
            return Err(SourceError::Remote(response.error.join(", ")));
        }

        let mut quotes = QuoteSet::for_source(self.id.clone());
        for (symbol, ticker) in &response.result {
            let Some(pair) = self.skip.normalize(symbol, normalize_symbol) else {
                continue;
            };
            let bid = ticker.b.first().and_then(|v| Decimal::from_str(v).ok());
            let ask = ticker.a.first().and_then(|v| Decimal::from_str(v).ok());
            match (bid, ask) {
                (Some(bid), Some(ask)) => quotes.insert(self.id.clone(), pair, BidAsk::new(bid, ask)),
                _ => debug!(symbol = %symbol, "Ticker without usable bid/ask"),
            }
        }
        Ok(quotes)
    }
}

#[async_trait]
impl QuoteSource for KrakenSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    async fn get_quotes(&self) -> Result<QuoteSet, SourceError> {
        let url = format!("{}/0/public/Ticker", self.base_url.trim_end_matches('/'));
        let body = super::get_text(&self.client, &url, self.timeout).await?;
        self.parse(&body)
    }
}

/// Map a Kraken asset code to its common code.
fn asset_code(code: &str) -> String {
    match code {
        "XBT" | "XXBT" => "BTC".to_string(),
        "XDG" | "XXDG" => "DOGE".to_string(),
        _ if code.len() == 4 && (code.starts_with('X') || code.starts_with('Z')) => {
            asset_code(&code[1..])
        }
        _ => code.to_string(),
    }
}

/// Split a Kraken pair name (`XXBTZUSD`, `XDGUSD`, `LTCEUR`) into a pair.
fn normalize_symbol(raw: &str) -> Option<CurrencyPair> {
    if !raw.is_ascii() {
        return None;
    }
    let table = CurrencyTable::global();
    let to_pair = |base: &str, quote: &str| {
        let base = Currency::new(asset_code(base)).ok()?;
        let quote = Currency::new(asset_code(quote)).ok()?;
        Some(CurrencyPair::new(base, quote))
    };

    if raw.len() == 8 && matches!(&raw[..1], "X" | "Z") && matches!(&raw[4..5], "X" | "Z") {
        return to_pair(&raw[..4], &raw[4..]);
    }

    (2..raw.len().saturating_sub(1)).find_map(|split| {
        let (base, quote) = raw.split_at(split);
        if table.is_known(&asset_code(base)) && table.is_known(&asset_code(quote)) {
            to_pair(base, quote)
        } else {
            None
        }
    })
}
