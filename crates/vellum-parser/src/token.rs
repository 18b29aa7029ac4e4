//! Token model for the SQL lexer.

/// Kind of a lexed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Identifier or keyword (bare or double-quoted).
    Name,
    /// Integer or floating literal, optionally signed.
    Number,
    /// Single-quoted string literal.
    String,
    /// A single punctuation character or two-char operator.
    Symbol,
    /// End of input.
    Eof,
}

/// A lexed token with its decoded text and source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Decoded text: unquoted for strings/quoted names, raw otherwise.
    pub text: String,
    /// Byte offset of the token start in the source.
    pub pos: usize,
}

impl Token {
    #[must_use]
    pub fn eof(pos: usize) -> Self {
        Self {
            kind: TokenKind::Eof,
            text: String::new(),
            pos,
        }
    }

    /// Case-insensitive keyword comparison.
    #[must_use]
    pub fn is_kw(&self, kw: &str) -> bool {
        self.kind == TokenKind::Name && self.text.eq_ignore_ascii_case(kw)
    }

    /// Exact symbol comparison.
    #[must_use]
    pub fn is_sym(&self, sym: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == sym
    }
}
