//! Currency pair patterns with `X` wildcards.

use ratebridge_common::{Currency, CurrencyPair};
use serde::Serialize;
use std::fmt;

/// One side of a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Slot {
    /// `X`: any currency.
    Any,
    Code(Currency),
}

impl Slot {
    fn matches(&self, currency: &Currency) -> bool {
        match self {
            Slot::Any => true,
            Slot::Code(code) => code == currency,
        }
    }

    fn bind(&self, requested: &Currency) -> Currency {
        match self {
            Slot::Any => requested.clone(),
            Slot::Code(code) => code.clone(),
        }
    }

    fn parse(text: &str) -> Option<Self> {
        if text.eq_ignore_ascii_case("x") {
            Some(Slot::Any)
        } else {
            Currency::new(text).ok().map(Slot::Code)
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Any => f.write_str("X"),
            Slot::Code(code) => write!(f, "{code}"),
        }
    }
}

/// A pair pattern such as `BTC_USD`, `X_USD` or `X_X`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PairPattern {
    pub base: Slot,
    pub quote: Slot,
}

impl PairPattern {
    /// Parse `BASE_QUOTE` where either side may be `X`.
    pub fn parse(text: &str) -> Option<Self> {
        let (base, quote) = text.split_once('_')?;
        Some(Self {
            base: Slot::parse(base)?,
            quote: Slot::parse(quote)?,
        })
    }

    pub fn exact(pair: &CurrencyPair) -> Self {
        Self {
            base: Slot::Code(pair.base.clone()),
            quote: Slot::Code(pair.quote.clone()),
        }
    }

    pub fn matches(&self, pair: &CurrencyPair) -> bool {
        self.base.matches(&pair.base) && self.quote.matches(&pair.quote)
    }

    /// Concrete pair for a request: `X` in base position takes the requested
    /// base, `X` in quote position the requested quote.
    pub fn bind(&self, requested: &CurrencyPair) -> CurrencyPair {
        CurrencyPair::new(self.base.bind(&requested.base), self.quote.bind(&requested.quote))
    }

    pub fn is_wildcard(&self) -> bool {
        self.base == Slot::Any || self.quote == Slot::Any
    }
}

impl fmt::Display for PairPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}
