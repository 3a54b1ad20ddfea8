//! Currency metadata registry used for rounding and display.
//!
//! The table is built once per process from a static seed list plus any
//! crypto codes the running configuration knows about. Unknown codes never
//! fail: they borrow the USD pattern with the code as symbol.

use once_cell::sync::OnceCell;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::HashMap;

/// Highest scale a `Decimal` can carry.
const MAX_SCALE: u32 = 28;

/// Divisibility given to crypto codes registered without metadata.
const DEFAULT_CRYPTO_DIVISIBILITY: u32 = 8;

// (code, name, divisibility, symbol, crypto)
const SEED: &[(&str, &str, u32, &str, bool)] = &[
    ("USD", "US Dollar", 2, "$", false),
    ("EUR", "Euro", 2, "€", false),
    ("GBP", "British Pound", 2, "£", false),
    ("JPY", "Japanese Yen", 0, "¥", false),
    ("CHF", "Swiss Franc", 2, "CHF", false),
    ("CAD", "Canadian Dollar", 2, "CA$", false),
    ("AUD", "Australian Dollar", 2, "A$", false),
    ("NZD", "New Zealand Dollar", 2, "NZ$", false),
    ("CNY", "Chinese Yuan", 2, "CN¥", false),
    ("HKD", "Hong Kong Dollar", 2, "HK$", false),
    ("SGD", "Singapore Dollar", 2, "S$", false),
    ("INR", "Indian Rupee", 2, "₹", false),
    ("KRW", "South Korean Won", 0, "₩", false),
    ("THB", "Thai Baht", 2, "฿", false),
    ("IDR", "Indonesian Rupiah", 2, "Rp", false),
    ("PHP", "Philippine Peso", 2, "₱", false),
    ("MYR", "Malaysian Ringgit", 2, "RM", false),
    ("VND", "Vietnamese Dong", 0, "₫", false),
    ("BRL", "Brazilian Real", 2, "R$", false),
    ("MXN", "Mexican Peso", 2, "MX$", false),
    ("ARS", "Argentine Peso", 2, "ARS", false),
    ("CLP", "Chilean Peso", 0, "CLP", false),
    ("COP", "Colombian Peso", 2, "COP", false),
    ("PEN", "Peruvian Sol", 2, "S/", false),
    ("SEK", "Swedish Krona", 2, "kr", false),
    ("NOK", "Norwegian Krone", 2, "kr", false),
    ("DKK", "Danish Krone", 2, "kr", false),
    ("PLN", "Polish Zloty", 2, "zł", false),
    ("CZK", "Czech Koruna", 2, "Kč", false),
    ("HUF", "Hungarian Forint", 2, "Ft", false),
    ("TRY", "Turkish Lira", 2, "₺", false),
    ("UAH", "Ukrainian Hryvnia", 2, "₴", false),
    ("ILS", "Israeli New Shekel", 2, "₪", false),
    ("AED", "UAE Dirham", 2, "AED", false),
    ("SAR", "Saudi Riyal", 2, "SAR", false),
    ("KWD", "Kuwaiti Dinar", 3, "KD", false),
    ("BHD", "Bahraini Dinar", 3, "BD", false),
    ("OMR", "Omani Rial", 3, "OMR", false),
    ("ZAR", "South African Rand", 2, "R", false),
    ("NGN", "Nigerian Naira", 2, "₦", false),
    ("KES", "Kenyan Shilling", 2, "KSh", false),
    ("BTC", "Bitcoin", 8, "BTC", true),
    ("SATS", "Satoshis", 0, "sats", true),
    ("LBTC", "Liquid Bitcoin", 8, "LBTC", true),
    ("LTC", "Litecoin", 8, "LTC", true),
    ("BCH", "Bitcoin Cash", 8, "BCH", true),
    ("ETH", "Ether", 8, "ETH", true),
    ("DOGE", "Dogecoin", 8, "DOGE", true),
    ("DASH", "Dash", 8, "DASH", true),
    ("XMR", "Monero", 12, "XMR", true),
    ("USDT", "Tether", 6, "USDT", true),
    ("USDC", "USD Coin", 6, "USDC", true),
];

/// Metadata about one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyData {
    pub code: String,
    pub name: String,
    /// Number of decimal places the currency is normally shown with.
    pub divisibility: u32,
    pub symbol: String,
    pub crypto: bool,
}

/// Where the currency symbol goes relative to the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPosition {
    /// `$1,234.56`
    Prefix,
    /// `0.001 BTC`
    Suffix,
}

/// How amounts of one currency are rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberPattern {
    pub symbol: String,
    pub position: SymbolPosition,
    pub group_separator: char,
    pub decimal_separator: char,
}

impl NumberPattern {
    fn usd() -> Self {
        Self {
            symbol: "$".to_string(),
            position: SymbolPosition::Prefix,
            group_separator: ',',
            decimal_separator: '.',
        }
    }

    fn for_currency(data: &CurrencyData) -> Self {
        let position = if data.crypto {
            SymbolPosition::Suffix
        } else {
            SymbolPosition::Prefix
        };
        Self {
            symbol: data.symbol.clone(),
            position,
            ..Self::usd()
        }
    }

    /// Render `value` with exactly `decimals` fractional digits.
    pub fn render(&self, value: Decimal, decimals: u32) -> String {
        let rounded = value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
        let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
            "-"
        } else {
            ""
        };
        let digits = format!("{:.*}", decimals as usize, rounded.abs());
        let (integer, fraction) = match digits.split_once('.') {
            Some((integer, fraction)) => (integer, Some(fraction)),
            None => (digits.as_str(), None),
        };

        let mut number = group_digits(integer, self.group_separator);
        if let Some(fraction) = fraction {
            number.push(self.decimal_separator);
            number.push_str(fraction);
        }

        match self.position {
            SymbolPosition::Prefix => format!("{sign}{}{number}", self.symbol),
            SymbolPosition::Suffix => format!("{sign}{number} {}", self.symbol),
        }
    }
}

fn group_digits(integer: &str, separator: char) -> String {
    let len = integer.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in integer.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

/// Round `value` starting at `divisibility` decimals, adding precision until
/// the relative rounding error drops below 0.1%.
fn round_with_tolerance(value: Decimal, divisibility: u32) -> Decimal {
    if value.is_zero() {
        return value.round_dp(divisibility);
    }

    let tolerance = Decimal::new(1, 3);
    let mut decimals = divisibility;
    loop {
        let rounded =
            value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);
        let error = ((rounded - value) / value).abs();
        if error < tolerance || decimals >= MAX_SCALE {
            return rounded;
        }
        decimals += 1;
    }
}

static GLOBAL: OnceCell<CurrencyTable> = OnceCell::new();

/// Registry of currency code to metadata.
#[derive(Debug, Clone)]
pub struct CurrencyTable {
    currencies: HashMap<String, CurrencyData>,
}

impl CurrencyTable {
    /// Build a table from the seed list only.
    pub fn new() -> Self {
        Self::with_extra_cryptos(std::iter::empty::<&str>())
    }

    /// Build a table from the seed list plus extra crypto codes.
    ///
    /// Extra codes that are already seeded keep their seeded metadata.
    pub fn with_extra_cryptos<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut currencies: HashMap<String, CurrencyData> = SEED
            .iter()
            .map(|(code, name, divisibility, symbol, crypto)| {
                (
                    code.to_string(),
                    CurrencyData {
                        code: code.to_string(),
                        name: name.to_string(),
                        divisibility: *divisibility,
                        symbol: symbol.to_string(),
                        crypto: *crypto,
                    },
                )
            })
            .collect();

        for code in extra {
            let code = code.as_ref().trim().to_ascii_uppercase();
            if code.is_empty() {
                continue;
            }
            currencies.entry(code.clone()).or_insert_with(|| CurrencyData {
                name: code.clone(),
                divisibility: DEFAULT_CRYPTO_DIVISIBILITY,
                symbol: code.clone(),
                crypto: true,
                code,
            });
        }

        Self { currencies }
    }

    /// Install the process-wide table with extra crypto codes.
    ///
    /// Returns `false` if the table was already initialized, in which case
    /// `extra` is ignored.
    pub fn init<I, S>(extra: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        GLOBAL.set(Self::with_extra_cryptos(extra)).is_ok()
    }

    /// The process-wide table, seeded on first use.
    pub fn global() -> &'static CurrencyTable {
        GLOBAL.get_or_init(CurrencyTable::new)
    }

    /// Look up a currency by code (case-insensitive).
    pub fn currency(&self, code: &str) -> Option<&CurrencyData> {
        self.currencies.get(&code.trim().to_ascii_uppercase())
    }

    pub fn is_known(&self, code: &str) -> bool {
        self.currency(code).is_some()
    }

    /// All registered codes, sorted.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.currencies.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    /// Registered divisibility, or USD's for unknown codes.
    pub fn divisibility(&self, code: &str) -> u32 {
        self.currency(code).map(|c| c.divisibility).unwrap_or(2)
    }

    /// Rendering pattern for a code. Unknown codes clone USD's pattern with
    /// the code as symbol.
    pub fn pattern(&self, code: &str) -> NumberPattern {
        match self.currency(code) {
            Some(data) => NumberPattern::for_currency(data),
            None => NumberPattern {
                symbol: code.trim().to_ascii_uppercase(),
                ..NumberPattern::usd()
            },
        }
    }

    /// Round for display: start at the currency's divisibility and add
    /// decimals until the relative rounding error is below 0.1%.
    pub fn round_for_display(&self, value: Decimal, code: &str) -> Decimal {
        round_with_tolerance(value, self.divisibility(code))
    }

    /// Format an amount for humans, keeping enough precision that small
    /// amounts do not collapse to zero.
    pub fn display_format(&self, value: Decimal, code: &str) -> String {
        let divisibility = self.divisibility(code);
        let rounded = round_with_tolerance(value, divisibility);
        let decimals = divisibility.max(rounded.normalize().scale());
        self.pattern(code).render(rounded, decimals)
    }

    /// Format an amount at exactly the currency's divisibility.
    pub fn format(&self, value: Decimal, code: &str) -> String {
        self.pattern(code).render(value, self.divisibility(code))
    }
}

impl Default for CurrencyTable {
    fn default() -> Self {
        Self::new()
    }
}
