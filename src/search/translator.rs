//! Query translation
//!
//! `AND` (surrounded by whitespace) is a top-level clause separator only.
//! Each clause is unwrapped from one layer of enclosing parentheses, has
//! its bare field references moved under `labels.`, and is handed to the
//! index as its own query string.

use crate::index::IndexQuery;
use regex::Regex;
use std::sync::OnceLock;

/// Fields addressed directly rather than under `labels.`
pub const TOP_LEVEL_FIELDS: [&str; 4] = ["level", "message", "timestamp", "labels"];

/// Longest query string accepted, in bytes
pub const MAX_QUERY_LEN: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query parameter 'q' is required")]
    EmptyQuery,

    #[error("Query is too long ({len} bytes, max {max})")]
    TooLong { len: usize, max: usize },
}

fn and_separator() -> &'static Regex {
    static AND: OnceLock<Regex> = OnceLock::new();
    AND.get_or_init(|| Regex::new(r"\s+AND\s+").expect("valid AND separator pattern"))
}

/// Split on top-level `AND`, dropping empty clauses
pub fn split_clauses(query: &str) -> Vec<&str> {
    and_separator()
        .split(query)
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .collect()
}

/// Remove one layer of parentheses wrapping the whole clause
///
/// `"(a OR b)"` becomes `"a OR b"`; `"(a) OR (b)"` is returned unchanged
/// because the depth returns to zero before the final character.
pub fn strip_outer_parentheses(clause: &str) -> &str {
    let s = clause.trim();
    if s.len() < 2 || !s.starts_with('(') || !s.ends_with(')') {
        return s;
    }

    let last = s.len() - 1;
    let mut depth: i32 = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && i < last {
            return s;
        }
    }

    if depth == 0 {
        &s[1..last]
    } else {
        s
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Prefix non top-level field references with `labels.`
///
/// Dotted references, values and text inside double quotes are left
/// alone.
pub fn rewrite_fields(clause: &str) -> String {
    let chars: Vec<char> = clause.chars().collect();
    let mut out = String::with_capacity(clause.len() + 16);
    let mut in_quotes = false;
    let mut in_value = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && i + 1 < chars.len() {
            out.push(c);
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if c == '"' {
            in_quotes = !in_quotes;
            out.push(c);
            i += 1;
            continue;
        }
        if in_quotes || !is_ident_char(c) {
            if !in_quotes {
                if c == ':' {
                    in_value = true;
                } else if c.is_whitespace() || c == '(' || c == ')' {
                    in_value = false;
                }
            }
            out.push(c);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && is_ident_char(chars[i]) {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();

        let follows_dot = start > 0 && chars[start - 1] == '.';
        let is_field = i < chars.len() && chars[i] == ':';
        let top_level = TOP_LEVEL_FIELDS
            .iter()
            .any(|f| f.eq_ignore_ascii_case(&word));

        if is_field && !in_value && !follows_dot && !top_level {
            out.push_str("labels.");
        }
        out.push_str(&word);
    }

    out
}

/// Translate a user query into an index query
pub fn translate(query: &str) -> Result<IndexQuery, QueryError> {
    if query.len() > MAX_QUERY_LEN {
        return Err(QueryError::TooLong {
            len: query.len(),
            max: MAX_QUERY_LEN,
        });
    }

    let mut clauses: Vec<IndexQuery> = split_clauses(query)
        .into_iter()
        .map(|clause| IndexQuery::QueryString(rewrite_fields(strip_outer_parentheses(clause))))
        .collect();

    match clauses.len() {
        0 => Err(QueryError::EmptyQuery),
        1 => Ok(clauses.remove(0)),
        _ => Ok(IndexQuery::Conjunction(clauses)),
    }
}
