//! Ordered rule tables and rule binding.

use ratebridge_common::{BidAsk, CurrencyPair};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use super::expr::{BoundExpr, Expr};
use super::parser::{parse_expr, parse_rules};
use super::pattern::PairPattern;
use crate::error::{ErrorSet, RuleError, RuleParseError};
use crate::quote::{QuoteSet, SourceId};

/// One `PATTERN = expr` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRule {
    pub pattern: PairPattern,
    pub expr: Expr,
}

impl fmt::Display for RateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {};", self.pattern, self.expr)
    }
}

/// Ordered rules plus a mandatory default.
///
/// The first rule whose pattern matches a pair wins; the default applies when
/// none does. References inside expressions only ever look at the explicit
/// rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<RateRule>,
    default: Expr,
    spread: Decimal,
}

impl RuleSet {
    pub fn new(default: Expr) -> Self {
        Self {
            rules: Vec::new(),
            default,
            spread: Decimal::ZERO,
        }
    }

    /// Parse rule text and a default expression.
    pub fn parse(rules: &str, default: &str) -> Result<Self, RuleParseError> {
        let mut set = Self::new(parse_expr(default)?);
        for (pattern, expr) in parse_rules(rules)? {
            set.rules.push(RateRule { pattern, expr });
        }
        Ok(set)
    }

    pub fn with_rule(mut self, pattern: PairPattern, expr: Expr) -> Self {
        self.rules.push(RateRule { pattern, expr });
        self
    }

    /// Relative spread applied to every resolved rate, e.g. `0.01` for 1%.
    pub fn with_spread(mut self, spread: Decimal) -> Self {
        self.spread = spread;
        self
    }

    pub fn spread(&self) -> Decimal {
        self.spread
    }

    pub fn rules(&self) -> &[RateRule] {
        &self.rules
    }

    pub fn default_rule(&self) -> &Expr {
        &self.default
    }

    /// First explicit rule matching `pair`.
    pub fn find(&self, pair: &CurrencyPair) -> Option<&RateRule> {
        self.rules.iter().find(|rule| rule.pattern.matches(pair))
    }

    /// Expression selected for `pair`, falling back to the default.
    pub fn select(&self, pair: &CurrencyPair) -> &Expr {
        self.find(pair).map(|rule| &rule.expr).unwrap_or(&self.default)
    }

    /// Bind the selected rule to `pair`: wildcards are filled in and rule
    /// references are inlined.
    ///
    /// Inlining stops at [`MAX_REFERENCE_DEPTH`] nested references or once the
    /// bound tree reaches [`MAX_BOUND_NODES`]; a reference past either limit
    /// is left unresolved with [`RuleError::RuleTooComplex`].
    pub fn bind(&self, pair: &CurrencyPair) -> BoundRule {
        let mut binder = Binder {
            rules: self,
            stack: vec![pair.clone()],
            nodes: 0,
        };
        let expr = binder.bind(self.select(pair), pair);
        BoundRule {
            pair: pair.clone(),
            expr,
        }
    }
}

/// Most rule references that may be inlined inside one another.
pub const MAX_REFERENCE_DEPTH: usize = 16;

/// Largest bound expression, in nodes, a reference may still expand into.
pub const MAX_BOUND_NODES: usize = 4_096;

struct Binder<'a> {
    rules: &'a RuleSet,
    /// Pairs being expanded, outermost first.
    stack: Vec<CurrencyPair>,
    nodes: usize,
}

impl Binder<'_> {
    fn bind(&mut self, expr: &Expr, requested: &CurrencyPair) -> BoundExpr {
        self.nodes += 1;
        match expr {
            Expr::Number(n) => BoundExpr::Number(*n),
            Expr::Quote { source, pair } => BoundExpr::Quote {
                source: source.clone(),
                pair: pair.bind(requested),
            },
            Expr::Reference(pattern) => {
                let pair = pattern.bind(requested);
                if self.stack.contains(&pair) {
                    return BoundExpr::Unresolved {
                        error: RuleError::CyclicReference { pair: pair.clone() },
                        pair,
                    };
                }
                let Some(rule) = self.rules.find(&pair) else {
                    return BoundExpr::Unresolved {
                        error: RuleError::NoRuleMatched { pair: pair.clone() },
                        pair,
                    };
                };
                if self.stack.len() > MAX_REFERENCE_DEPTH || self.nodes >= MAX_BOUND_NODES {
                    return BoundExpr::Unresolved {
                        error: RuleError::RuleTooComplex { pair: pair.clone() },
                        pair,
                    };
                }
                self.stack.push(pair.clone());
                let inner = self.bind(&rule.expr, &pair);
                self.stack.pop();
                BoundExpr::Group(Box::new(inner))
            }
            Expr::Side(side, inner) => BoundExpr::Side(*side, Box::new(self.bind(inner, requested))),
            Expr::Negate(inner) => BoundExpr::Negate(Box::new(self.bind(inner, requested))),
            Expr::Binary(op, left, right) => BoundExpr::Binary(
                *op,
                Box::new(self.bind(left, requested)),
                Box::new(self.bind(right, requested)),
            ),
            Expr::Group(inner) => BoundExpr::Group(Box::new(self.bind(inner, requested))),
        }
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{rule}")?;
        }
        write!(f, "// default: {}", self.default)
    }
}

/// Outcome of evaluating a bound rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleEvaluation {
    pub bid_ask: Option<BidAsk>,
    pub errors: ErrorSet,
    /// Rule text with every resolved quote replaced by its value.
    pub evaluated: String,
}

/// A rule bound to one requested pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRule {
    pub pair: CurrencyPair,
    pub expr: BoundExpr,
}

impl BoundRule {
    /// Rule for a pair priced at exactly one of itself.
    pub fn identity(pair: &CurrencyPair) -> Self {
        Self {
            pair: pair.clone(),
            expr: BoundExpr::Number(Decimal::ONE),
        }
    }

    /// Sources this rule needs fetched.
    pub fn sources(&self) -> BTreeSet<SourceId> {
        let mut sources = BTreeSet::new();
        self.expr.collect_sources(&mut sources);
        sources
    }

    /// Evaluate against `quotes`. Pure: same quotes, same result.
    pub fn evaluate(&self, quotes: &QuoteSet) -> RuleEvaluation {
        let mut errors = ErrorSet::new();
        let mut evaluated = String::new();
        let bid_ask = self.expr.evaluate(quotes, &mut errors, &mut evaluated);
        RuleEvaluation {
            bid_ask: if errors.is_empty() { bid_ask } else { None },
            errors,
            evaluated,
        }
    }
}

impl fmt::Display for BoundRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}
