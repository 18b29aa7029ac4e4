//! SQL lexer.
//!
//! Converts query text into a token stream. Byte-based scanning with
//! memchr for string literals; positions are byte offsets used in
//! `ParseSql` error messages.

use memchr::memchr2;

use crate::token::{Token, TokenKind};

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the entire input, terminating with an Eof token.
    #[must_use]
    pub fn tokenize(source: &'a str) -> Vec<Token> {
        let mut lexer = Self::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token();
            let eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if eof {
                break;
            }
        }
        tokens
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let start = self.pos;
        let Some(ch) = self.src.get(self.pos).copied() else {
            return Token::eof(start);
        };

        match ch {
            b'\'' => self.lex_string(start),
            b'"' => self.lex_quoted_name(start),
            b'0'..=b'9' => self.lex_number(start),
            b'-' | b'+' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.lex_number(start)
            }
            b'.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number(start),
            c if c.is_ascii_alphabetic() || c == b'_' || c >= 0x80 => self.lex_name(start),
            b'<' | b'>' | b'=' | b'!' => {
                self.pos += 1;
                if matches!(self.src.get(self.pos), Some(b'=' | b'>')) {
                    self.pos += 1;
                }
                self.symbol(start)
            }
            _ => {
                self.pos += 1;
                self.symbol(start)
            }
        }
    }

    fn symbol(&self, start: usize) -> Token {
        Token {
            kind: TokenKind::Symbol,
            text: String::from_utf8_lossy(&self.src[start..self.pos]).into_owned(),
            pos: start,
        }
    }

    fn lex_string(&mut self, start: usize) -> Token {
        self.pos += 1; // opening quote
        let mut text = String::new();
        loop {
            let rest = &self.src[self.pos..];
            match memchr2(b'\'', b'\\', rest) {
                Some(idx) => {
                    text.push_str(&String::from_utf8_lossy(&rest[..idx]));
                    self.pos += idx;
                    if self.src[self.pos] == b'\\' {
                        if let Some(escaped) = self.src.get(self.pos + 1) {
                            text.push(char::from(*escaped));
                            self.pos += 2;
                        } else {
                            self.pos += 1;
                        }
                    } else {
                        self.pos += 1; // closing quote
                        break;
                    }
                }
                None => {
                    // unterminated literal: consume the tail, the parser
                    // reports the error with this position
                    text.push_str(&String::from_utf8_lossy(rest));
                    self.pos = self.src.len();
                    break;
                }
            }
        }
        Token {
            kind: TokenKind::String,
            text,
            pos: start,
        }
    }

    fn lex_quoted_name(&mut self, start: usize) -> Token {
        self.pos += 1;
        let name_start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] != b'"' {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.src[name_start..self.pos]).into_owned();
        if self.pos < self.src.len() {
            self.pos += 1; // closing quote
        }
        Token {
            kind: TokenKind::Name,
            text,
            pos: start,
        }
    }

    fn lex_number(&mut self, start: usize) -> Token {
        if matches!(self.src[self.pos], b'-' | b'+') {
            self.pos += 1;
        }
        while self
            .peek_at(0)
            .is_some_and(|c| c.is_ascii_digit() || c == b'.' || c == b'e' || c == b'E')
        {
            self.pos += 1;
        }
        Token {
            kind: TokenKind::Number,
            text: String::from_utf8_lossy(&self.src[start..self.pos]).into_owned(),
            pos: start,
        }
    }

    fn lex_name(&mut self, start: usize) -> Token {
        while self.peek_at(0).is_some_and(|c| {
            c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'+' || c >= 0x80
        }) {
            self.pos += 1;
        }
        // a trailing '.' belongs to the next token, not the name
        while self.pos > start && self.src[self.pos - 1] == b'.' {
            self.pos -= 1;
        }
        Token {
            kind: TokenKind::Name,
            text: String::from_utf8_lossy(&self.src[start..self.pos]).into_owned(),
            pos: start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<(TokenKind, String)> {
        Lexer::tokenize(sql)
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn basic_select() {
        let toks = kinds("SELECT * FROM books WHERE price > 500");
        assert_eq!(toks[0], (TokenKind::Name, "SELECT".into()));
        assert_eq!(toks[1], (TokenKind::Symbol, "*".into()));
        assert_eq!(toks[5], (TokenKind::Symbol, ">".into()));
        assert_eq!(toks[6], (TokenKind::Number, "500".into()));
        assert_eq!(toks.last().unwrap().0, TokenKind::Eof);
    }

    #[test]
    fn strings_with_escapes() {
        let toks = kinds(r"SELECT 'it\'s'");
        assert_eq!(toks[1], (TokenKind::String, "it's".into()));
    }

    #[test]
    fn quoted_names_keep_plus() {
        let toks = kinds("\"price+pages\" = 5");
        assert_eq!(toks[0], (TokenKind::Name, "price+pages".into()));
    }

    #[test]
    fn signed_and_float_numbers() {
        let toks = kinds("-5 +3 1.25 2e3");
        assert_eq!(toks[0], (TokenKind::Number, "-5".into()));
        assert_eq!(toks[1], (TokenKind::Number, "+3".into()));
        assert_eq!(toks[2], (TokenKind::Number, "1.25".into()));
        assert_eq!(toks[3], (TokenKind::Number, "2e3".into()));
    }

    #[test]
    fn dotted_names() {
        let toks = kinds("books.author_id = authors.id");
        assert_eq!(toks[0], (TokenKind::Name, "books.author_id".into()));
        assert_eq!(toks[2], (TokenKind::Name, "authors.id".into()));
    }

    #[test]
    fn two_char_operators() {
        let toks = kinds("a >= 1 and b <> 2 and c <= 3");
        assert_eq!(toks[1], (TokenKind::Symbol, ">=".into()));
        assert_eq!(toks[5], (TokenKind::Symbol, "<>".into()));
        assert_eq!(toks[9], (TokenKind::Symbol, "<=".into()));
    }
}
