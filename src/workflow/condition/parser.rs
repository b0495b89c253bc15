// SPDX-License-Identifier: MIT

//! Condition expression parser
//!
//! Grammar (`and` binds tighter than `or`):
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | "true" | "false" | path [op literal]
//! ```

use super::ast::{CompareOp, Expression, Literal};
use crate::sdk::error::ConditionError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    True,
    False,
    Null,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Path(p) => p.clone(),
            Token::Str(s) => format!("'{}'", s),
            Token::Num(n) => n.to_string(),
            Token::Op(op) => op.to_string(),
            Token::And => "and".into(),
            Token::Or => "or".into(),
            Token::Not => "not".into(),
            Token::True => "true".into(),
            Token::False => "false".into(),
            Token::Null => "null".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
        }
    }
}

/// Parse a `when` expression
pub fn parse(input: &str) -> Result<Expression, ConditionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if let Some((token, offset)) = parser.tokens.get(parser.pos) {
        return Err(parser.unexpected(token, *offset));
    }
    Ok(expr)
}

fn is_path_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        let two_char_op = match (c, next) {
            ('=', Some('=')) => Some(CompareOp::Eq),
            ('!', Some('=')) => Some(CompareOp::NotEq),
            ('>', Some('=')) => Some(CompareOp::Gte),
            ('<', Some('=')) => Some(CompareOp::Lte),
            _ => None,
        };
        if let Some(op) = two_char_op {
            tokens.push((Token::Op(op), offset));
            i += 2;
            continue;
        }

        match c {
            '>' => {
                tokens.push((Token::Op(CompareOp::Gt), offset));
                i += 1;
            }
            '<' => {
                tokens.push((Token::Op(CompareOp::Lt), offset));
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, offset));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, offset));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].1 != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err(ConditionError::UnterminatedString(input.to_string()));
                }
                let text: String = chars[start..end].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Str(text), offset));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::UnexpectedToken {
                        token: text.clone(),
                        offset,
                        input: input.to_string(),
                    })?;
                tokens.push((Token::Num(n), offset));
            }
            c if is_path_start(c) => {
                let start = i;
                while i < chars.len() && is_path_char(chars[i].1) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "contains" => Token::Op(CompareOp::Contains),
                    _ => Token::Path(word),
                };
                tokens.push((token, offset));
            }
            other => {
                return Err(ConditionError::UnexpectedToken {
                    token: other.to_string(),
                    offset,
                    input: input.to_string(),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Result<(Token, usize), ConditionError> {
        let item = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| ConditionError::UnexpectedEnd(self.input.to_string()))?;
        self.pos += 1;
        Ok(item)
    }

    fn unexpected(&self, token: &Token, offset: usize) -> ConditionError {
        ConditionError::UnexpectedToken {
            token: token.describe(),
            offset,
            input: self.input.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ConditionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expression::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ConditionError> {
        let (token, offset) = self.next()?;
        match token {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.next()? {
                    (Token::RParen, _) => Ok(inner),
                    (other, offset) => Err(self.unexpected(&other, offset)),
                }
            }
            Token::True => Ok(Expression::True),
            Token::False => Ok(Expression::False),
            Token::Path(path) => match self.peek() {
                Some(Token::Op(op)) => {
                    let op = *op;
                    self.pos += 1;
                    let right = self.parse_literal()?;
                    Ok(Expression::Compare { path, op, right })
                }
                _ => Ok(Expression::Truthy(path)),
            },
            other => Err(self.unexpected(&other, offset)),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, ConditionError> {
        match self.next()? {
            (Token::Str(s), _) => Ok(Literal::String(s)),
            (Token::Num(n), _) => Ok(Literal::Number(n)),
            (Token::True, _) => Ok(Literal::Boolean(true)),
            (Token::False, _) => Ok(Literal::Boolean(false)),
            (Token::Null, _) => Ok(Literal::Null),
            (other, offset) => Err(self.unexpected(&other, offset)),
        }
    }
}
