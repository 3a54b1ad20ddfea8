//! Error types shared across RateBridge crates.

use thiserror::Error;

/// Errors raised while building common types from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommonError {
    /// Currency code is not 2 to 12 ASCII alphanumerics.
    #[error("Invalid currency code: {0:?}")]
    InvalidCurrencyCode(String),

    /// Symbol could not be split into a base and a quote currency.
    #[error("Invalid currency pair: {0:?}")]
    InvalidPair(String),
}

/// Failures of checked bid/ask arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArithmeticError {
    #[error("Division by zero")]
    DivideByZero,

    #[error("Decimal overflow")]
    Overflow,
}
