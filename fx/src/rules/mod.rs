//! Rate rule language.
//!
//! Rules are written as `PATTERN = expr;` statements, for example
//!
//! ```text
//! // Kraken for BTC, everything else through BTC
//! BTC_USD = kraken(BTC_USD);
//! X_USD   = kraken(X_BTC) * BTC_USD;
//! ```
//!
//! Values are bid/ask intervals throughout; see [`expr`] for the arithmetic.

pub mod expr;
mod lexer;
pub mod parser;
pub mod pattern;
pub mod rule_set;

pub use expr::{BinaryOp, BoundExpr, Expr, Side};
pub use parser::{parse_expr, parse_rules};
pub use pattern::{PairPattern, Slot};
pub use rule_set::{BoundRule, RateRule, RuleEvaluation, RuleSet};
