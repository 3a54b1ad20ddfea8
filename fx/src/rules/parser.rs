//! Recursive-descent parser for rule text.
//!
//! ```text
//! rules      := (statement)*
//! statement  := PATTERN '=' expr ';'
//! expr       := term (('+' | '-') term)*
//! term       := unary (('*' | '/') unary)*
//! unary      := '-' unary | primary
//! primary    := NUMBER | '(' expr ')' | SIDE '(' expr ')' | SOURCE '(' PAIR ')' | PAIR
//! ```

use super::expr::{BinaryOp, Expr, Side};
use super::lexer::{tokenize, Token, TokenKind};
use super::pattern::PairPattern;
use crate::error::RuleParseError;
use crate::quote::SourceId;

/// Parse a list of `PATTERN = expr;` statements.
pub fn parse_rules(text: &str) -> Result<Vec<(PairPattern, Expr)>, RuleParseError> {
    let mut parser = Parser::new(text)?;
    let mut rules = Vec::new();

    while !parser.at(&TokenKind::Eof) {
        let pattern = parser.pattern()?;
        parser.expect(TokenKind::Equals, "'='")?;
        let expr = parser.expr()?;
        if !parser.eat(&TokenKind::Semicolon) && !parser.at(&TokenKind::Eof) {
            return Err(parser.error("expected ';'"));
        }
        rules.push((pattern, expr));
    }
    Ok(rules)
}

/// Parse a single expression.
pub fn parse_expr(text: &str) -> Result<Expr, RuleParseError> {
    let mut parser = Parser::new(text)?;
    let expr = parser.expr()?;
    parser.eat(&TokenKind::Semicolon);
    if !parser.at(&TokenKind::Eof) {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

/// Deepest expression tree the parser accepts.
pub const MAX_DEPTH: usize = 64;

/// An expression with the height of its tree.
type Parsed = (Expr, usize);

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(text: &str) -> Result<Self, RuleParseError> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
            depth: 0,
        })
    }

    fn peek(&self) -> &Token {
        // tokenize always ends with Eof and the parser never moves past it
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &TokenKind {
        let idx = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), RuleParseError> {
        if self.eat(&kind) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {what}")))
        }
    }

    fn error(&self, message: &str) -> RuleParseError {
        RuleParseError::new(message, self.peek().offset)
    }

    fn pattern(&mut self) -> Result<PairPattern, RuleParseError> {
        let token = self.advance();
        match &token.kind {
            TokenKind::Word(word) => PairPattern::parse(word).ok_or_else(|| {
                RuleParseError::new(format!("invalid pair '{word}'"), token.offset)
            }),
            _ => Err(RuleParseError::new("expected a currency pair", token.offset)),
        }
    }

    fn expr(&mut self) -> Result<Expr, RuleParseError> {
        self.sum().map(|(expr, _)| expr)
    }

    fn sum(&mut self) -> Result<Parsed, RuleParseError> {
        let (mut left, mut height) = self.term()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok((left, height)),
            };
            let offset = self.advance().offset;
            let (right, right_height) = self.term()?;
            height = grow(height.max(right_height), offset)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Parsed, RuleParseError> {
        let (mut left, mut height) = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => return Ok((left, height)),
            };
            let offset = self.advance().offset;
            let (right, right_height) = self.unary()?;
            height = grow(height.max(right_height), offset)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Parsed, RuleParseError> {
        if self.at(&TokenKind::Minus) {
            let offset = self.advance().offset;
            let (inner, height) = self.nested(offset, Self::unary)?;
            return Ok((Expr::Negate(Box::new(inner)), grow(height, offset)?));
        }
        self.primary()
    }

    /// Run `parse` one nesting level down, refusing to go past `MAX_DEPTH`.
    fn nested(
        &mut self,
        offset: usize,
        parse: fn(&mut Self) -> Result<Parsed, RuleParseError>,
    ) -> Result<Parsed, RuleParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(RuleParseError::new("expression nested too deeply", offset));
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn primary(&mut self) -> Result<Parsed, RuleParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(value) => Ok((Expr::Number(value), 1)),
            TokenKind::LParen => {
                let (inner, height) = self.nested(token.offset, Self::sum)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok((Expr::Group(Box::new(inner)), grow(height, token.offset)?))
            }
            TokenKind::Word(word) if self.at(&TokenKind::LParen) => {
                self.advance();
                let parsed = match Side::from_name(&word) {
                    Some(side) => {
                        let (inner, height) = self.nested(token.offset, Self::sum)?;
                        (Expr::Side(side, Box::new(inner)), grow(height, token.offset)?)
                    }
                    None => {
                        let quote = Expr::Quote {
                            source: SourceId::new(&word),
                            pair: self.pattern()?,
                        };
                        (quote, 1)
                    }
                };
                self.expect(TokenKind::RParen, "')'")?;
                Ok(parsed)
            }
            TokenKind::Word(word) => PairPattern::parse(&word)
                .map(|pattern| (Expr::Reference(pattern), 1))
                .ok_or_else(|| {
                    RuleParseError::new(format!("expected a currency pair, found '{word}'"), token.offset)
                }),
            TokenKind::Eof => Err(RuleParseError::new("unexpected end of input", token.offset)),
            _ => Err(RuleParseError::new("expected an expression", token.offset)),
        }
    }
}

/// Height of a node over a subtree of `height`.
fn grow(height: usize, offset: usize) -> Result<usize, RuleParseError> {
    if height >= MAX_DEPTH {
        return Err(RuleParseError::new("expression nested too deeply", offset));
    }
    Ok(height + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_precedence_and_rendering() {
        let expr = parse_expr("kraken(BTC_USD) * 1.01 + -2 / (bitstamp(x_usd) - 1)").unwrap();
        assert_eq!(
            expr.to_string(),
            "kraken(BTC_USD) * 1.01 + -2 / (bitstamp(X_USD) - 1)"
        );
        match expr {
            Expr::Binary(BinaryOp::Add, left, _) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Mul, _, _)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_side_and_reference() {
        let expr = parse_expr("mid(kraken(BTC_USD)) * USD_EUR").unwrap();
        assert_eq!(expr.to_string(), "mid(kraken(BTC_USD)) * USD_EUR");
        match expr {
            Expr::Binary(_, left, right) => {
                assert!(matches!(*left, Expr::Side(Side::Mid, _)));
                assert!(matches!(*right, Expr::Reference(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_expr("2.50").unwrap(), Expr::Number(dec!(2.50)));
    }

    #[test]
    fn test_rule_list() {
        let text = "
            // direct quotes
            BTC_USD = kraken(BTC_USD);
            X_USD = kraken(X_BTC) * BTC_USD;
            USDT_USD = 1
        ";
        let rules = parse_rules(text).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1].0.to_string(), "X_USD");
        assert_eq!(rules[2].1, Expr::Number(dec!(1)));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse_rules("BTC_USD kraken(BTC_USD);").unwrap_err().offset, 8);
        assert_eq!(parse_expr("kraken(BTC_USD").unwrap_err().offset, 14);
        assert!(parse_expr("kraken(42)").is_err());
        assert!(parse_expr("1 +").is_err());
        assert!(parse_expr("banana").is_err());
        assert!(parse_rules("BTC_USD = 1 BTC_EUR = 2;").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000));
        let err = parse_expr(&deep).unwrap_err();
        assert_eq!(err.message, "expression nested too deeply");
        assert_eq!(err.offset, MAX_DEPTH);

        let negations = format!("{}1", "-".repeat(50_000));
        assert!(parse_expr(&negations).is_err());

        let sides = format!("{}1{}", "mid(".repeat(1_000), ")".repeat(1_000));
        assert!(parse_expr(&sides).is_err());

        let chain = vec!["1"; 10_000].join(" + ");
        assert!(parse_rules(&format!("BTC_USD = {chain};")).is_err());
    }

    #[test]
    fn test_nesting_within_limit() {
        let ok = format!("{}1{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert!(parse_expr(&ok).is_ok());

        let chain = vec!["kraken(BTC_USD)"; 32].join(" * ");
        assert!(parse_expr(&chain).is_ok());
    }
}
