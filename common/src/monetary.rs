//! Currency codes, currency pairs and bid/ask prices.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::currency_table::CurrencyTable;
use crate::error::{ArithmeticError, CommonError};

/// Upper-case currency code (ISO 4217 for fiat, ticker for crypto).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    /// Create a currency from a code, normalizing to upper case.
    ///
    /// Codes must be 2 to 12 ASCII alphanumerics.
    pub fn new(code: impl AsRef<str>) -> Result<Self, CommonError> {
        let code = code.as_ref().trim();
        let valid = (2..=12).contains(&code.len())
            && code.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(CommonError::InvalidCurrencyCode(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn usd() -> Self {
        Self("USD".to_string())
    }

    pub fn eur() -> Self {
        Self("EUR".to_string())
    }

    pub fn btc() -> Self {
        Self("BTC".to_string())
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Currency {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.0
    }
}

/// An ordered (base, quote) currency pair.
///
/// Displays and parses as `BASE_QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    /// Base currency (the one being priced).
    pub base: Currency,
    /// Quote currency (the pricing currency).
    pub quote: Currency,
}

impl CurrencyPair {
    /// Create a new currency pair.
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// Get the inverse pair.
    pub fn inverse(&self) -> Self {
        Self {
            base: self.quote.clone(),
            quote: self.base.clone(),
        }
    }

    /// Whether base and quote are the same currency.
    pub fn is_identity(&self) -> bool {
        self.base == self.quote
    }

    /// Parse a pair from `BASE_QUOTE`, `BASE/QUOTE`, `BASE-QUOTE`, or a
    /// concatenated symbol such as `BTCUSD`.
    ///
    /// Concatenated symbols are split at the first position where both halves
    /// are registered in the currency table.
    pub fn parse(symbol: &str) -> Result<Self, CommonError> {
        let symbol = symbol.trim();
        if let Some(idx) = symbol.find(&['_', '/', '-'][..]) {
            let base = Currency::new(&symbol[..idx])
                .map_err(|_| CommonError::InvalidPair(symbol.to_string()))?;
            let quote = Currency::new(&symbol[idx + 1..])
                .map_err(|_| CommonError::InvalidPair(symbol.to_string()))?;
            return Ok(Self::new(base, quote));
        }

        if !symbol.is_ascii() {
            return Err(CommonError::InvalidPair(symbol.to_string()));
        }

        let table = CurrencyTable::global();
        for split in 2..symbol.len().saturating_sub(1) {
            let (base, quote) = symbol.split_at(split);
            if table.is_known(base) && table.is_known(quote) {
                if let (Ok(base), Ok(quote)) = (Currency::new(base), Currency::new(quote)) {
                    return Ok(Self::new(base, quote));
                }
            }
        }

        Err(CommonError::InvalidPair(symbol.to_string()))
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = CommonError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyPair> for String {
    fn from(value: CurrencyPair) -> Self {
        value.to_string()
    }
}

/// An immutable bid/ask price. `bid <= ask` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BidAskParts")]
pub struct BidAsk {
    bid: Decimal,
    ask: Decimal,
}

#[derive(Deserialize)]
struct BidAskParts {
    bid: Decimal,
    ask: Decimal,
}

impl From<BidAskParts> for BidAsk {
    fn from(parts: BidAskParts) -> Self {
        BidAsk::new(parts.bid, parts.ask)
    }
}

impl BidAsk {
    /// Create a bid/ask pair. The two values are ordered so bid is the lower.
    pub fn new(bid: Decimal, ask: Decimal) -> Self {
        if bid <= ask {
            Self { bid, ask }
        } else {
            Self { bid: ask, ask: bid }
        }
    }

    /// A price with no spread.
    pub fn single(value: Decimal) -> Self {
        Self {
            bid: value,
            ask: value,
        }
    }

    pub fn bid(&self) -> Decimal {
        self.bid
    }

    pub fn ask(&self) -> Decimal {
        self.ask
    }

    /// Mid-market price, `(bid + ask) / 2`.
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// The price of the inverse pair: `(1 / ask, 1 / bid)`.
    pub fn inverse(&self) -> Result<Self, ArithmeticError> {
        let bid = Decimal::ONE
            .checked_div(self.ask)
            .ok_or(ArithmeticError::DivideByZero)?;
        let ask = Decimal::ONE
            .checked_div(self.bid)
            .ok_or(ArithmeticError::DivideByZero)?;
        Ok(Self::new(bid, ask))
    }

    pub fn checked_add(&self, other: &Self) -> Result<Self, ArithmeticError> {
        Ok(Self::new(
            self.bid
                .checked_add(other.bid)
                .ok_or(ArithmeticError::Overflow)?,
            self.ask
                .checked_add(other.ask)
                .ok_or(ArithmeticError::Overflow)?,
        ))
    }

    /// Subtraction widens: the lowest bid loses against the highest ask.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, ArithmeticError> {
        Ok(Self::new(
            self.bid
                .checked_sub(other.ask)
                .ok_or(ArithmeticError::Overflow)?,
            self.ask
                .checked_sub(other.bid)
                .ok_or(ArithmeticError::Overflow)?,
        ))
    }

    pub fn checked_mul(&self, other: &Self) -> Result<Self, ArithmeticError> {
        Ok(Self::new(
            self.bid
                .checked_mul(other.bid)
                .ok_or(ArithmeticError::Overflow)?,
            self.ask
                .checked_mul(other.ask)
                .ok_or(ArithmeticError::Overflow)?,
        ))
    }

    /// `self * other.inverse()`.
    pub fn checked_div(&self, other: &Self) -> Result<Self, ArithmeticError> {
        if other.bid.is_zero() || other.ask.is_zero() {
            return Err(ArithmeticError::DivideByZero);
        }
        Ok(Self::new(
            self.bid
                .checked_div(other.ask)
                .ok_or(ArithmeticError::Overflow)?,
            self.ask
                .checked_div(other.bid)
                .ok_or(ArithmeticError::Overflow)?,
        ))
    }

    pub fn negated(&self) -> Self {
        Self::new(-self.ask, -self.bid)
    }

    /// Widen by a relative spread: `bid * (1 - spread)`, `ask * (1 + spread)`.
    pub fn widen(&self, spread: Decimal) -> Result<Self, ArithmeticError> {
        let bid = (Decimal::ONE - spread)
            .checked_mul(self.bid)
            .ok_or(ArithmeticError::Overflow)?;
        let ask = (Decimal::ONE + spread)
            .checked_mul(self.ask)
            .ok_or(ArithmeticError::Overflow)?;
        Ok(Self::new(bid, ask))
    }
}

impl fmt::Display for BidAsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bid == self.ask {
            write!(f, "{}", self.bid.normalize())
        } else {
            write!(f, "({} | {})", self.bid.normalize(), self.ask.normalize())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair(s: &str) -> CurrencyPair {
        CurrencyPair::parse(s).unwrap()
    }

    #[test]
    fn test_currency_normalized() {
        let c = Currency::new("btc").unwrap();
        assert_eq!(c.code(), "BTC");
        assert_eq!(c, Currency::btc());
        assert!(Currency::new("B").is_err());
        assert!(Currency::new("BT C").is_err());
    }

    #[test]
    fn test_pair_separators() {
        assert_eq!(pair("btc_usd"), pair("BTC/USD"));
        assert_eq!(pair("BTC-USD").to_string(), "BTC_USD");
        assert!(CurrencyPair::parse("BTC_").is_err());
    }

    #[test]
    fn test_pair_concatenated() {
        assert_eq!(pair("BTCUSD"), pair("BTC_USD"));
        assert_eq!(pair("usdteur"), pair("USDT_EUR"));
        assert!(CurrencyPair::parse("QQQQWWWW").is_err());
    }

    #[test]
    fn test_pair_inverse() {
        let p = pair("BTC_USD");
        assert_eq!(p.inverse(), pair("USD_BTC"));
        assert_eq!(p.inverse().inverse(), p);
    }

    #[test]
    fn test_pair_serde_roundtrip() {
        let json = serde_json::to_string(&pair("eth_eur")).unwrap();
        assert_eq!(json, "\"ETH_EUR\"");
        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pair("ETH_EUR"));
    }

    #[test]
    fn test_bid_ask_ordered() {
        let ba = BidAsk::new(dec!(10), dec!(9));
        assert_eq!(ba.bid(), dec!(9));
        assert_eq!(ba.ask(), dec!(10));
        assert_eq!(ba.mid(), dec!(9.5));
    }

    #[test]
    fn test_bid_ask_deserialize_reorders() {
        let ba: BidAsk = serde_json::from_str(r#"{"bid":"2","ask":"1"}"#).unwrap();
        assert_eq!(ba, BidAsk::new(dec!(1), dec!(2)));
    }

    #[test]
    fn test_bid_ask_arithmetic() {
        let a = BidAsk::new(dec!(100), dec!(102));
        let b = BidAsk::new(dec!(2), dec!(4));

        assert_eq!(a.checked_add(&b).unwrap(), BidAsk::new(dec!(102), dec!(106)));
        assert_eq!(a.checked_sub(&b).unwrap(), BidAsk::new(dec!(96), dec!(100)));
        assert_eq!(a.checked_mul(&b).unwrap(), BidAsk::new(dec!(200), dec!(408)));
        assert_eq!(a.checked_div(&b).unwrap(), BidAsk::new(dec!(25), dec!(51)));
        assert_eq!(a.negated(), BidAsk::new(dec!(-102), dec!(-100)));
    }

    #[test]
    fn test_bid_ask_divide_by_zero() {
        let a = BidAsk::single(dec!(1));
        let zero = BidAsk::single(Decimal::ZERO);
        assert_eq!(a.checked_div(&zero), Err(ArithmeticError::DivideByZero));
        assert_eq!(zero.inverse(), Err(ArithmeticError::DivideByZero));
    }

    #[test]
    fn test_bid_ask_inverse() {
        let ba = BidAsk::new(dec!(4), dec!(5));
        let inv = ba.inverse().unwrap();
        assert_eq!(inv.bid(), dec!(0.2));
        assert_eq!(inv.ask(), dec!(0.25));
    }

    #[test]
    fn test_bid_ask_widen() {
        let ba = BidAsk::single(dec!(100)).widen(dec!(0.01)).unwrap();
        assert_eq!(ba.bid(), dec!(99));
        assert_eq!(ba.ask(), dec!(101));
    }

    #[test]
    fn test_bid_ask_display() {
        assert_eq!(BidAsk::single(dec!(20200.00)).to_string(), "20200");
        assert_eq!(
            BidAsk::new(dec!(50000), dec!(50010.5)).to_string(),
            "(50000 | 50010.5)"
        );
    }
}
