//! Word splitting for documents and queries.

/// A token with its word position and byte range in the source field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordToken {
    pub text: String,
    /// Word-counter position inside the field.
    pub position: u32,
    /// Byte offset of the token start (for match areas).
    pub offset: u32,
    pub len: u32,
}

/// Split UTF-8 text on non-word characters, lowercasing as we go.
/// `extra_symbols` (default `-/+`) count as word content.
#[must_use]
pub fn tokenize(text: &str, extra_symbols: &str) -> Vec<WordToken> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start_offset = 0u32;
    let mut position = 0u32;

    let mut flush = |current: &mut String, start: u32, end: u32, position: &mut u32, out: &mut Vec<WordToken>| {
        if !current.is_empty() {
            out.push(WordToken {
                text: std::mem::take(current),
                position: *position,
                offset: start,
                len: end - start,
            });
            *position += 1;
        }
    };

    for (offset, ch) in text.char_indices() {
        let is_word = ch.is_alphanumeric() || extra_symbols.contains(ch);
        if is_word {
            if current.is_empty() {
                start_offset = offset as u32;
            }
            for lc in ch.to_lowercase() {
                current.push(lc);
            }
        } else {
            flush(&mut current, start_offset, offset as u32, &mut position, &mut out);
        }
    }
    flush(
        &mut current,
        start_offset,
        text.len() as u32,
        &mut position,
        &mut out,
    );
    out
}
