//! Tokenizer for rule text.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::RuleParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Number(Decimal),
    /// Source ids, side selectors and pair tokens such as `BTC_USD` or `X_X`.
    Word(String),
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Equals,
    Semicolon,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub offset: usize,
}

pub(crate) fn tokenize(text: &str) -> Result<Vec<Token>, RuleParseError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'=' => TokenKind::Equals,
            b';' => TokenKind::Semicolon,
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                let lexeme = &text[start..i];
                let value = Decimal::from_str(lexeme).map_err(|_| {
                    RuleParseError::new(format!("invalid number '{lexeme}'"), start)
                })?;
                tokens.push(Token {
                    kind: TokenKind::Number(value),
                    offset: start,
                });
                continue;
            }
            c if c.is_ascii_alphabetic() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Word(text[start..i].to_string()),
                    offset: start,
                });
                continue;
            }
            _ => {
                let found = text[start..].chars().next().unwrap_or('?');
                return Err(RuleParseError::new(
                    format!("unexpected character '{found}'"),
                    start,
                ));
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
        i += 1;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: text.len(),
    });
    Ok(tokens)
}
