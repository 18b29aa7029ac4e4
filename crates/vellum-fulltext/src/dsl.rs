//! Full-text query DSL.
//!
//! `+must -not =exact word* *suffix term~` plus `@field^boost,field2`
//! field restrictions. Default operation between terms is OR.

use vellum_error::{Result, VellumError};

/// Operation a term contributes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FtOp {
    #[default]
    Or,
    And,
    Not,
}

/// One parsed query term.
#[derive(Debug, Clone, PartialEq)]
pub struct FtDslTerm {
    pub pattern: String,
    pub op: FtOp,
    /// `=`: no stems, no typos, no layout variants.
    pub exact: bool,
    /// Typo lookup requested (`~`, or config default).
    pub typos: bool,
    /// `word*`: match words with this prefix.
    pub prefix_match: bool,
    /// `*word`: match words with this suffix.
    pub suffix_match: bool,
    /// Rank multiplier (`term^2`).
    pub boost: f64,
    /// Max word distance to the previous query position for the
    /// proximity bonus.
    pub distance: u32,
    /// Query position (phrase-order aware).
    pub qpos: u32,
    /// Field filter: `(field index, boost)`; empty means all fields.
    pub field_boosts: Vec<(usize, f64)>,
}

/// Parse a query string. `fields` maps field names to their positional
/// index inside the fulltext index; `default_typos` reflects the config.
pub fn parse_dsl(
    query: &str,
    fields: &[String],
    default_typos: bool,
) -> Result<Vec<FtDslTerm>> {
    let mut terms = Vec::new();
    let mut field_boosts: Vec<(usize, f64)> = Vec::new();
    let mut qpos = 0u32;

    for raw in query.split_whitespace() {
        let mut token = raw;

        if let Some(rest) = token.strip_prefix('@') {
            field_boosts = parse_field_list(rest, fields)?;
            continue;
        }

        let mut term = FtDslTerm {
            pattern: String::new(),
            op: FtOp::Or,
            exact: false,
            typos: default_typos,
            prefix_match: false,
            suffix_match: false,
            boost: 1.0,
            distance: 100,
            qpos,
            field_boosts: field_boosts.clone(),
        };

        loop {
            if let Some(rest) = token.strip_prefix('+') {
                term.op = FtOp::And;
                token = rest;
            } else if let Some(rest) = token.strip_prefix('-') {
                term.op = FtOp::Not;
                token = rest;
            } else if let Some(rest) = token.strip_prefix('=') {
                term.exact = true;
                term.typos = false;
                token = rest;
            } else {
                break;
            }
        }
        if let Some(rest) = token.strip_prefix('*') {
            term.suffix_match = true;
            token = rest;
        }
        if let Some(rest) = token.strip_suffix('~') {
            term.typos = true;
            token = rest;
        }
        if let Some((word, boost)) = token.rsplit_once('^') {
            if let Ok(b) = boost.parse::<f64>() {
                term.boost = b;
                token = word;
            }
        }
        if let Some(rest) = token.strip_suffix('*') {
            term.prefix_match = true;
            token = rest;
        }

        let pattern: String = token.chars().flat_map(char::to_lowercase).collect();
        if pattern.is_empty() {
            continue;
        }
        term.pattern = pattern;
        terms.push(term);
        qpos += 1;
    }

    if terms.is_empty() {
        return Err(VellumError::params("fulltext query has no terms"));
    }
    Ok(terms)
}

fn parse_field_list(spec: &str, fields: &[String]) -> Result<Vec<(usize, f64)>> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        if part == "*" {
            return Ok(Vec::new());
        }
        let (name, boost) = match part.rsplit_once('^') {
            Some((name, boost)) => (
                name,
                boost.parse::<f64>().map_err(|_| {
                    VellumError::params(format!("bad field boost in fulltext query: '{part}'"))
                })?,
            ),
            None => (part, 1.0),
        };
        let idx = fields
            .iter()
            .position(|f| f == name)
            .ok_or_else(|| {
                VellumError::params(format!("unknown fulltext field '{name}' in query"))
            })?;
        out.push((idx, boost));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        vec!["title".to_owned(), "body".to_owned()]
    }

    #[test]
    fn ops_and_flags() {
        let terms = parse_dsl("+war -peace =exact maybe", &fields(), true).unwrap();
        assert_eq!(terms[0].op, FtOp::And);
        assert_eq!(terms[1].op, FtOp::Not);
        assert!(terms[2].exact);
        assert!(!terms[2].typos);
        assert_eq!(terms[3].op, FtOp::Or);
        assert!(terms[3].typos);
    }

    #[test]
    fn wildcards() {
        let terms = parse_dsl("war* *ace", &fields(), false).unwrap();
        assert!(terms[0].prefix_match);
        assert!(!terms[0].suffix_match);
        assert!(terms[1].suffix_match);
        assert_eq!(terms[1].pattern, "ace");
    }

    #[test]
    fn tilde_enables_typos() {
        let terms = parse_dsl("word~", &fields(), false).unwrap();
        assert!(terms[0].typos);
        assert_eq!(terms[0].pattern, "word");
    }

    #[test]
    fn field_restrictions_with_boost() {
        let terms = parse_dsl("@title^2,body war", &fields(), false).unwrap();
        assert_eq!(terms[0].field_boosts, vec![(0, 2.0), (1, 1.0)]);

        let err = parse_dsl("@missing war", &fields(), false).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn term_boost() {
        let terms = parse_dsl("war^1.5", &fields(), false).unwrap();
        assert!((terms[0].boost - 1.5).abs() < f64::EPSILON);
        assert_eq!(terms[0].pattern, "war");
    }

    #[test]
    fn empty_query_is_params_error() {
        assert!(parse_dsl("   ", &fields(), false).is_err());
    }

    #[test]
    fn qpos_increments() {
        let terms = parse_dsl("a b c", &fields(), false).unwrap();
        assert_eq!(terms[2].qpos, 2);
    }
}
