//! Sort expression parser and evaluator.
//!
//! `ORDER BY` accepts either a plain field name or an arithmetic
//! expression over fields, numeric literals, `rank()` and
//! `ST_Distance(field, field)`.

use serde_json::Value;
use vellum_error::{Result, VellumError};
use vellum_types::cjson::extract_json_path;
use vellum_types::{KvType, Point, Variant};

#[derive(Debug, Clone, PartialEq)]
pub enum SortExpr {
    Field(String),
    Constant(f64),
    Rank,
    Distance(String, String),
    Binary(Box<SortExpr>, BinOp, Box<SortExpr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl SortExpr {
    /// Parse an expression; a bare identifier parses to `Field` so plain
    /// `ORDER BY name` stays a cheap field compare.
    pub fn parse(input: &str) -> Result<Self> {
        let mut parser = ExprParser {
            src: input.as_bytes(),
            pos: 0,
        };
        let expr = parser.parse_sum()?;
        parser.skip_ws();
        if parser.pos != parser.src.len() {
            return Err(VellumError::params(format!(
                "unexpected trailing input in sort expression '{input}'"
            )));
        }
        Ok(expr)
    }

    /// Whether this is a single bare field reference.
    #[must_use]
    pub fn as_field(&self) -> Option<&str> {
        match self {
            Self::Field(name) => Some(name),
            _ => None,
        }
    }

    /// Evaluate against one document; `rank` is the row's fulltext rank.
    pub fn evaluate(&self, doc: &Value, rank: u8) -> Result<f64> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::Rank => Ok(f64::from(rank)),
            Self::Field(name) => {
                let values = extract_json_path(doc, name);
                match values.first() {
                    Some(v) => match v.convert(KvType::Double)? {
                        Variant::Double(d) => Ok(d),
                        _ => Ok(0.0),
                    },
                    None => Ok(0.0),
                }
            }
            Self::Distance(a, b) => {
                let pa = Point::from_values(&extract_json_path(doc, a))?;
                let pb = Point::from_values(&extract_json_path(doc, b))?;
                Ok(pa.distance(pb))
            }
            Self::Binary(lhs, op, rhs) => {
                let l = lhs.evaluate(doc, rank)?;
                let r = rhs.evaluate(doc, rank)?;
                Ok(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => {
                        if r == 0.0 {
                            return Err(VellumError::query_exec(
                                "division by zero in sort expression",
                            ));
                        }
                        l / r
                    }
                })
            }
        }
    }
}

struct ExprParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn parse_sum(&mut self) -> Result<SortExpr> {
        let mut lhs = self.parse_product()?;
        loop {
            match self.peek() {
                Some(b'+') => {
                    self.pos += 1;
                    let rhs = self.parse_product()?;
                    lhs = SortExpr::Binary(Box::new(lhs), BinOp::Add, Box::new(rhs));
                }
                Some(b'-') => {
                    self.pos += 1;
                    let rhs = self.parse_product()?;
                    lhs = SortExpr::Binary(Box::new(lhs), BinOp::Sub, Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_product(&mut self) -> Result<SortExpr> {
        let mut lhs = self.parse_atom()?;
        loop {
            match self.peek() {
                Some(b'*') => {
                    self.pos += 1;
                    let rhs = self.parse_atom()?;
                    lhs = SortExpr::Binary(Box::new(lhs), BinOp::Mul, Box::new(rhs));
                }
                Some(b'/') => {
                    self.pos += 1;
                    let rhs = self.parse_atom()?;
                    lhs = SortExpr::Binary(Box::new(lhs), BinOp::Div, Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn parse_atom(&mut self) -> Result<SortExpr> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_sum()?;
                if self.peek() != Some(b')') {
                    return Err(VellumError::params("expected ')' in sort expression"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(c) if c.is_ascii_digit() || c == b'-' => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.parse_name(),
            other => Err(VellumError::params(format!(
                "unexpected token {other:?} in sort expression"
            ))),
        }
    }

    fn parse_number(&mut self) -> Result<SortExpr> {
        let start = self.pos;
        if self.src[self.pos] == b'-' {
            self.pos += 1;
        }
        while self
            .src
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'.')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| VellumError::params("bad sort expression"))?;
        text.parse::<f64>()
            .map(SortExpr::Constant)
            .map_err(|_| VellumError::params(format!("bad number '{text}' in sort expression")))
    }

    fn parse_name(&mut self) -> Result<SortExpr> {
        let start = self.pos;
        while self
            .src
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_' || *c == b'.' || *c == b'+')
        {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| VellumError::params("bad sort expression"))?
            .to_owned();

        if self.peek() == Some(b'(') {
            self.pos += 1;
            if name.eq_ignore_ascii_case("rank") {
                if self.peek() != Some(b')') {
                    return Err(VellumError::params("rank() takes no arguments"));
                }
                self.pos += 1;
                return Ok(SortExpr::Rank);
            }
            if name.eq_ignore_ascii_case("st_distance") {
                let SortExpr::Field(a) = self.parse_name()? else {
                    return Err(VellumError::params("ST_Distance takes field names"));
                };
                if self.peek() != Some(b',') {
                    return Err(VellumError::params("expected ',' in ST_Distance"));
                }
                self.pos += 1;
                self.skip_ws();
                let SortExpr::Field(b) = self.parse_name()? else {
                    return Err(VellumError::params("ST_Distance takes field names"));
                };
                if self.peek() != Some(b')') {
                    return Err(VellumError::params("expected ')' in ST_Distance"));
                }
                self.pos += 1;
                return Ok(SortExpr::Distance(a, b));
            }
            return Err(VellumError::params(format!(
                "unknown function '{name}' in sort expression"
            )));
        }
        Ok(SortExpr::Field(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_field() {
        let expr = SortExpr::parse("price").unwrap();
        assert_eq!(expr.as_field(), Some("price"));
        let doc = json!({"price": 42});
        assert_eq!(expr.evaluate(&doc, 0).unwrap(), 42.0);
    }

    #[test]
    fn arithmetic_with_precedence() {
        let expr = SortExpr::parse("price + pages * 2").unwrap();
        let doc = json!({"price": 10, "pages": 5});
        assert_eq!(expr.evaluate(&doc, 0).unwrap(), 20.0);

        let expr = SortExpr::parse("(price + pages) * 2").unwrap();
        assert_eq!(expr.evaluate(&doc, 0).unwrap(), 30.0);
    }

    #[test]
    fn rank_function() {
        let expr = SortExpr::parse("rank() * 2 + price").unwrap();
        let doc = json!({"price": 1});
        assert_eq!(expr.evaluate(&doc, 100).unwrap(), 201.0);
        assert!(expr.as_field().is_none());
    }

    #[test]
    fn distance_function() {
        let expr = SortExpr::parse("ST_Distance(from, to)").unwrap();
        let doc = json!({"from": [0.0, 0.0], "to": [3.0, 4.0]});
        assert_eq!(expr.evaluate(&doc, 0).unwrap(), 5.0);
    }

    #[test]
    fn missing_field_evaluates_to_zero() {
        let expr = SortExpr::parse("absent").unwrap();
        assert_eq!(expr.evaluate(&json!({}), 0).unwrap(), 0.0);
    }

    #[test]
    fn division_by_zero_is_query_exec() {
        let expr = SortExpr::parse("price / zero").unwrap();
        let doc = json!({"price": 1, "zero": 0});
        assert_eq!(
            expr.evaluate(&doc, 0).unwrap_err().code(),
            vellum_error::ErrorCode::QueryExec
        );
    }

    #[test]
    fn parse_errors() {
        assert!(SortExpr::parse("price +").is_err());
        assert!(SortExpr::parse("foo(bar)").is_err());
        assert!(SortExpr::parse("(price").is_err());
    }
}
