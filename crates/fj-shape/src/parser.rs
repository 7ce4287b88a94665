#![forbid(unsafe_code)]

//! Shape-spec strings such as `"(m, 3*n + 1)"`, `"m n"` or `"_, k**2"`.
//!
//! ```text
//! spec   := '(' dims ')' | dims
//! dims   := ε | dim (',' dim)* ','?
//! dim    := '_' | expr
//! expr   := term (('+' | '-') term)*
//! term   := unary ('*'? unary)*        juxtaposition multiplies
//! unary  := '-' unary | power
//! power  := atom ('**' int)?
//! atom   := int | ident | '(' expr ')'
//! ```

use crate::error::{PolyError, ShapeSyntaxError};
use crate::polynomial::Polynomial;
use crate::spec::{DimExpr, ShapeSpec};
use crate::var::RenameContext;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Wildcard,
    Plus,
    Minus,
    Star,
    StarStar,
    Comma,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Int(value) => format!("'{value}'"),
            Self::Ident(name) => format!("'{name}'"),
            Self::Wildcard => "'_'".to_owned(),
            Self::Plus => "'+'".to_owned(),
            Self::Minus => "'-'".to_owned(),
            Self::Star => "'*'".to_owned(),
            Self::StarStar => "'**'".to_owned(),
            Self::Comma => "','".to_owned(),
            Self::LParen => "'('".to_owned(),
            Self::RParen => "')'".to_owned(),
        }
    }

    fn starts_atom(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Ident(_) | Self::LParen)
    }
}

fn tokenize(spec: &str) -> Result<Vec<(Token, usize)>, ShapeSyntaxError> {
    let bytes = spec.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let ch = bytes[pos];
        let token = match ch {
            b if b.is_ascii_whitespace() => {
                pos += 1;
                continue;
            }
            b'+' => Token::Plus,
            b'-' => Token::Minus,
            b',' => Token::Comma,
            b'(' => Token::LParen,
            b')' => Token::RParen,
            b'*' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 1;
                Token::StarStar
            }
            b'*' => Token::Star,
            b'0'..=b'9' => {
                while pos + 1 < bytes.len() && bytes[pos + 1].is_ascii_digit() {
                    pos += 1;
                }
                let text = &spec[start..=pos];
                let value = text.parse::<i64>().map_err(|_| ShapeSyntaxError {
                    spec: spec.to_owned(),
                    token: format!("'{text}'"),
                    offset: start,
                    arithmetic: None,
                })?;
                Token::Int(value)
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                while pos + 1 < bytes.len()
                    && (bytes[pos + 1].is_ascii_alphanumeric() || bytes[pos + 1] == b'_')
                {
                    pos += 1;
                }
                let text = &spec[start..=pos];
                if text == "_" {
                    Token::Wildcard
                } else {
                    Token::Ident(text.to_owned())
                }
            }
            _ => {
                let bad = spec[start..].chars().next().unwrap_or('?');
                return Err(ShapeSyntaxError {
                    spec: spec.to_owned(),
                    token: format!("'{bad}'"),
                    offset: start,
                    arithmetic: None,
                });
            }
        };
        tokens.push((token, start));
        pos += 1;
    }
    Ok(tokens)
}

struct Parser<'a> {
    spec: &'a str,
    tokens: &'a [(Token, usize)],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self) -> ShapeSyntaxError {
        self.error_at(self.pos, None)
    }

    fn error_at(&self, pos: usize, arithmetic: Option<PolyError>) -> ShapeSyntaxError {
        match self.tokens.get(pos) {
            Some((token, offset)) => ShapeSyntaxError {
                spec: self.spec.to_owned(),
                token: token.describe(),
                offset: *offset,
                arithmetic,
            },
            None => ShapeSyntaxError {
                spec: self.spec.to_owned(),
                token: "end of input".to_owned(),
                offset: self.spec.len(),
                arithmetic,
            },
        }
    }

    /// Combines two operands, blaming the operator at `op` on overflow.
    fn combine(
        &self,
        op: usize,
        result: Result<Polynomial, PolyError>,
    ) -> Result<Polynomial, ShapeSyntaxError> {
        result.map_err(|err| self.error_at(op, Some(err)))
    }

    fn dims(&mut self) -> Result<Vec<DimExpr>, ShapeSyntaxError> {
        let mut dims = Vec::new();
        while self.peek().is_some() {
            dims.push(self.dim()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if self.peek().is_some() {
            return Err(self.error());
        }
        Ok(dims)
    }

    fn dim(&mut self) -> Result<DimExpr, ShapeSyntaxError> {
        if self.peek() == Some(&Token::Wildcard) {
            self.pos += 1;
            return match self.peek() {
                None | Some(Token::Comma) => Ok(DimExpr::Wildcard),
                Some(_) => Err(self.error()),
            };
        }
        Ok(DimExpr::from_poly(self.expr()?))
    }

    fn expr(&mut self) -> Result<Polynomial, ShapeSyntaxError> {
        let mut acc = self.term()?;
        loop {
            let op = self.pos;
            if self.eat(&Token::Plus) {
                let rhs = self.term()?;
                acc = self.combine(op, acc.checked_add(&rhs))?;
            } else if self.eat(&Token::Minus) {
                let rhs = self.term()?;
                acc = self.combine(op, acc.checked_sub(&rhs))?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn term(&mut self) -> Result<Polynomial, ShapeSyntaxError> {
        let mut acc = self.unary()?;
        loop {
            let op = self.pos;
            if self.eat(&Token::Star) || self.peek().is_some_and(Token::starts_atom) {
                let rhs = self.unary()?;
                acc = self.combine(op, acc.checked_mul(&rhs))?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn unary(&mut self) -> Result<Polynomial, ShapeSyntaxError> {
        let op = self.pos;
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return self.combine(op, operand.checked_neg());
        }
        let base = self.atom()?;
        let op = self.pos;
        if self.eat(&Token::StarStar) {
            let Some(Token::Int(exp)) = self.peek() else {
                return Err(self.error());
            };
            let exp = u32::try_from(*exp).map_err(|_| self.error())?;
            self.pos += 1;
            return self.combine(op, base.checked_pow(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Polynomial, ShapeSyntaxError> {
        match self.peek() {
            Some(Token::Int(value)) => {
                self.pos += 1;
                Ok(Polynomial::constant(*value))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Polynomial::named(name))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error());
                }
                Ok(inner)
            }
            _ => Err(self.error()),
        }
    }
}

/// Index of the `)` closing the `(` at `tokens[0]`, if any.
fn matching_close(tokens: &[(Token, usize)]) -> Option<usize> {
    let mut depth = 0_usize;
    for (idx, (token, _)) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses a shape spec. Variables come back un-renamed (see [`parse_spec_in`]).
pub fn parse_spec(spec: &str) -> Result<ShapeSpec, ShapeSyntaxError> {
    let tokens = tokenize(spec)?;
    let inner: &[(Token, usize)] = match tokens.first() {
        Some((Token::LParen, _)) if matching_close(&tokens) == Some(tokens.len() - 1) => {
            &tokens[1..tokens.len() - 1]
        }
        _ => &tokens,
    };
    let mut parser = Parser {
        spec,
        tokens: inner,
        pos: 0,
    };
    Ok(ShapeSpec::new(parser.dims()?))
}

/// Parses a shape spec and renames its variables through `ctx`.
pub fn parse_spec_in(
    ctx: &mut RenameContext,
    spec: &str,
) -> Result<ShapeSpec, ShapeSyntaxError> {
    let parsed = parse_spec(spec)?;
    remap_ids(ctx, &parsed).map_err(|err| ShapeSyntaxError {
        spec: spec.to_owned(),
        token: format!("'{spec}'"),
        offset: 0,
        arithmetic: Some(err),
    })
}

/// Renames every variable of `spec` through `ctx`. Repeated names within
/// one context stay unified.
pub fn remap_ids(ctx: &mut RenameContext, spec: &ShapeSpec) -> Result<ShapeSpec, PolyError> {
    spec.rename(&mut |var| ctx.unique(var.name()))
}

/// Like [`remap_ids`] but never extends `ctx`: names it has not seen stay
/// as written. Used for specs that may only mention existing variables,
/// such as shape-valued equation params.
pub fn resolve_ids(ctx: &RenameContext, spec: &ShapeSpec) -> Result<ShapeSpec, PolyError> {
    spec.rename(&mut |var| ctx.lookup(var.name()).cloned().unwrap_or_else(|| var.clone()))
}
