//! Rule expression trees.
//!
//! [`Expr`] is what the parser produces; it may hold wildcard pairs and
//! references to other rules. Binding it to a requested pair yields a
//! [`BoundExpr`] where every pair is concrete and every reference has been
//! inlined, so the sources a rule needs can be read off the tree before any
//! quote is fetched.

use ratebridge_common::{BidAsk, CurrencyPair};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::fmt::{self, Write};

use super::pattern::PairPattern;
use crate::error::{ErrorSet, RuleError};
use crate::quote::{QuoteSet, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }

    fn apply(self, left: &BidAsk, right: &BidAsk) -> Result<BidAsk, RuleError> {
        let result = match self {
            BinaryOp::Add => left.checked_add(right),
            BinaryOp::Sub => left.checked_sub(right),
            BinaryOp::Mul => left.checked_mul(right),
            BinaryOp::Div => left.checked_div(right),
        };
        result.map_err(RuleError::from)
    }
}

/// Side selector: `bid(e)`, `ask(e)`, `mid(e)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
    Mid,
}

impl Side {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bid" => Some(Side::Bid),
            "ask" => Some(Side::Ask),
            "mid" => Some(Side::Mid),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
            Side::Mid => "mid",
        }
    }

    fn apply(self, value: &BidAsk) -> Result<BidAsk, RuleError> {
        let side = match self {
            Side::Bid => value.bid(),
            Side::Ask => value.ask(),
            Side::Mid => value
                .bid()
                .checked_add(value.ask())
                .ok_or(RuleError::ArithmeticOverflow)?
                / Decimal::TWO,
        };
        Ok(BidAsk::single(side))
    }
}

/// Parsed rule expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Number(Decimal),
    /// `source(PAIR)`.
    Quote { source: SourceId, pair: PairPattern },
    /// Bare `PAIR`: the expression of the rule matching that pair.
    Reference(PairPattern),
    Side(Side, Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Group(Box<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n.normalize()),
            Expr::Quote { source, pair } => write!(f, "{source}({pair})"),
            Expr::Reference(pair) => write!(f, "{pair}"),
            Expr::Side(side, inner) => write!(f, "{}({inner})", side.name()),
            Expr::Negate(inner) => write!(f, "-{inner}"),
            Expr::Binary(op, left, right) => write!(f, "{left} {} {right}", op.symbol()),
            Expr::Group(inner) => write!(f, "({inner})"),
        }
    }
}

/// Expression with concrete pairs and references inlined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoundExpr {
    Number(Decimal),
    Quote {
        source: SourceId,
        pair: CurrencyPair,
    },
    /// A reference that could not be expanded.
    Unresolved {
        pair: CurrencyPair,
        error: RuleError,
    },
    Side(Side, Box<BoundExpr>),
    Negate(Box<BoundExpr>),
    Binary(BinaryOp, Box<BoundExpr>, Box<BoundExpr>),
    Group(Box<BoundExpr>),
}

impl BoundExpr {
    /// Sources referenced anywhere in the tree.
    pub fn collect_sources(&self, out: &mut BTreeSet<SourceId>) {
        match self {
            BoundExpr::Number(_) | BoundExpr::Unresolved { .. } => {}
            BoundExpr::Quote { source, .. } => {
                out.insert(source.clone());
            }
            BoundExpr::Side(_, inner) | BoundExpr::Negate(inner) | BoundExpr::Group(inner) => {
                inner.collect_sources(out)
            }
            BoundExpr::Binary(_, left, right) => {
                left.collect_sources(out);
                right.collect_sources(out);
            }
        }
    }

    /// Evaluate against `quotes`, writing the evaluated text to `out`.
    ///
    /// Every branch is visited so all errors get recorded, but any error
    /// makes the whole result `None`.
    pub fn evaluate(
        &self,
        quotes: &QuoteSet,
        errors: &mut ErrorSet,
        out: &mut String,
    ) -> Option<BidAsk> {
        match self {
            BoundExpr::Number(n) => {
                let _ = write!(out, "{}", n.normalize());
                Some(BidAsk::single(*n))
            }
            BoundExpr::Quote { source, pair } => match quotes.resolve(source, pair) {
                Ok(value) => {
                    let _ = write!(out, "{value}");
                    Some(value)
                }
                Err(e) => {
                    let _ = write!(out, "{source}({pair})");
                    errors.insert(e);
                    None
                }
            },
            BoundExpr::Unresolved { pair, error } => {
                let _ = write!(out, "{pair}");
                errors.insert(error.clone());
                None
            }
            BoundExpr::Side(side, inner) => {
                let _ = write!(out, "{}(", side.name());
                let value = inner.evaluate(quotes, errors, out);
                out.push(')');
                record(value.map(|v| side.apply(&v)), errors)
            }
            BoundExpr::Negate(inner) => {
                out.push('-');
                inner.evaluate(quotes, errors, out).map(|v| v.negated())
            }
            BoundExpr::Binary(op, left, right) => {
                let left = left.evaluate(quotes, errors, out);
                let _ = write!(out, " {} ", op.symbol());
                let right = right.evaluate(quotes, errors, out);
                match (left, right) {
                    (Some(l), Some(r)) => record(Some(op.apply(&l, &r)), errors),
                    _ => None,
                }
            }
            BoundExpr::Group(inner) => {
                out.push('(');
                let value = inner.evaluate(quotes, errors, out);
                out.push(')');
                value
            }
        }
    }
}

fn record(value: Option<Result<BidAsk, RuleError>>, errors: &mut ErrorSet) -> Option<BidAsk> {
    match value? {
        Ok(value) => Some(value),
        Err(e) => {
            errors.insert(e);
            None
        }
    }
}

impl fmt::Display for BoundExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundExpr::Number(n) => write!(f, "{}", n.normalize()),
            BoundExpr::Quote { source, pair } => write!(f, "{source}({pair})"),
            BoundExpr::Unresolved { pair, .. } => write!(f, "{pair}"),
            BoundExpr::Side(side, inner) => write!(f, "{}({inner})", side.name()),
            BoundExpr::Negate(inner) => write!(f, "-{inner}"),
            BoundExpr::Binary(op, left, right) => write!(f, "{left} {} {right}", op.symbol()),
            BoundExpr::Group(inner) => write!(f, "({inner})"),
        }
    }
}
