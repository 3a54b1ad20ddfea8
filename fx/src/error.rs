//! Rate engine error types.

use ratebridge_common::{ArithmeticError, CommonError, CurrencyPair};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::quote::SourceId;

/// Errors returned by a quote source fetch.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every
/// waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Remote answered with a non-success HTTP status.
    #[error("HTTP status {status}")]
    Http { status: u16 },

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Request did not complete in time.
    #[error("Request timed out")]
    Timeout,

    /// Body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Remote reported an error inside a successful response.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Caller cancelled the fetch.
    #[error("Fetch cancelled")]
    Cancelled,

    /// Every member of a fallback chain failed.
    #[error("All {} sources failed", .failures.len())]
    AllSourcesFailed { failures: Vec<SourceFailure> },
}

impl SourceError {
    /// Transient, source-specific failures.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            SourceError::Http { .. } | SourceError::Network(_) | SourceError::Timeout
        )
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if let Some(status) = e.status() {
            SourceError::Http {
                status: status.as_u16(),
            }
        } else if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Decode(e.to_string())
    }
}

/// A failure recorded against one source, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: SourceId,
    pub message: String,
}

impl SourceFailure {
    pub fn new(source_id: SourceId, error: &SourceError) -> Self {
        Self {
            source_id,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_id, self.message)
    }
}

/// Why a rule did not produce a rate for a pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Error, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleError {
    /// Rule references a source that is not registered.
    #[error("Unknown source {source_id}")]
    UnknownSource { source_id: SourceId },

    /// Source is known but has no quote for the pair.
    #[error("{source_id} has no quote for {pair}")]
    PairUnavailable {
        source_id: SourceId,
        pair: CurrencyPair,
    },

    #[error("Division by zero")]
    DivideByZero,

    /// Rule references loop back to a pair already being expanded.
    #[error("Cyclic rule reference through {pair}")]
    CyclicReference { pair: CurrencyPair },

    /// A referenced pair has no explicit rule.
    #[error("No rule matches {pair}")]
    NoRuleMatched { pair: CurrencyPair },

    /// Rule references nest too deeply or expand into too large a rule.
    #[error("Rule for {pair} is too complex to expand")]
    RuleTooComplex { pair: CurrencyPair },

    #[error("Arithmetic overflow")]
    ArithmeticOverflow,

    /// Nothing resolved a rate for the pair.
    #[error("Rate unavailable for {pair}")]
    RateUnavailable { pair: CurrencyPair },
}

impl RuleError {
    /// Stable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            RuleError::UnknownSource { .. } => "UNKNOWN_SOURCE",
            RuleError::PairUnavailable { .. } => "PAIR_UNAVAILABLE",
            RuleError::DivideByZero => "DIVIDE_BY_ZERO",
            RuleError::CyclicReference { .. } => "CYCLIC_REFERENCE",
            RuleError::NoRuleMatched { .. } => "NO_RULE_MATCHED",
            RuleError::RuleTooComplex { .. } => "RULE_TOO_COMPLEX",
            RuleError::ArithmeticOverflow => "ARITHMETIC_OVERFLOW",
            RuleError::RateUnavailable { .. } => "RATE_UNAVAILABLE",
        }
    }
}

impl From<ArithmeticError> for RuleError {
    fn from(e: ArithmeticError) -> Self {
        match e {
            ArithmeticError::DivideByZero => RuleError::DivideByZero,
            ArithmeticError::Overflow => RuleError::ArithmeticOverflow,
        }
    }
}

/// Ordered, deduplicated set of rule errors for one pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ErrorSet(BTreeSet<RuleError>);

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, error: RuleError) {
        self.0.insert(error);
    }

    pub fn contains(&self, error: &RuleError) -> bool {
        self.0.contains(error)
    }

    /// Whether any error has the given code.
    pub fn has_code(&self, code: &str) -> bool {
        self.0.iter().any(|e| e.code() == code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleError> {
        self.0.iter()
    }
}

impl From<RuleError> for ErrorSet {
    fn from(error: RuleError) -> Self {
        let mut set = ErrorSet::new();
        set.insert(error);
        set
    }
}

impl fmt::Display for ErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// Syntax error in rule text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct RuleParseError {
    pub message: String,
    /// Byte offset into the rule text.
    pub offset: usize,
}

impl RuleParseError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Errors that can occur at the rate engine's API boundary.
#[derive(Debug, Error)]
pub enum FxError {
    /// Caller broke the contract (empty pair set and the like).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid rule: {0}")]
    RuleParse(#[from] RuleParseError),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// No rule resolved a rate for the pair.
    #[error("Rate unavailable for {pair}: {errors}")]
    RateUnavailable {
        pair: CurrencyPair,
        errors: ErrorSet,
    },
}

/// Result type for rate engine operations.
pub type FxResult<T> = Result<T, FxError>;
