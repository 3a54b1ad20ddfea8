//! RateBridge Common Types
//!
//! Currency codes, currency pairs, bid/ask prices and the currency metadata
//! table shared by the rate engine and its callers.

pub mod currency_table;
pub mod error;
pub mod monetary;

pub use currency_table::{CurrencyData, CurrencyTable, NumberPattern, SymbolPosition};
pub use error::*;
pub use monetary::*;
