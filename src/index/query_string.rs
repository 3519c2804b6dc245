//! Query-string grammar for the in-process index
//!
//! Supported syntax:
//! - `field:term`, bare `term` (any field)
//! - `"quoted phrase"`, `field:"quoted phrase"`
//! - `term*` prefix match, `*` match everything
//! - `+clause` (must), `-clause` / `NOT clause` (must not)
//! - `OR` between clauses, `AND` making both neighbours required
//! - parenthesized groups
//!
//! Clauses without a prefix are optional: when a group has no required
//! clause, at least one optional clause must match.

use std::collections::HashMap;

/// Field name → analyzed tokens, in order
pub type Fields = HashMap<String, Vec<String>>;

/// Lowercase alphanumeric tokenization shared by indexing and querying
pub fn analyze(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Should,
    Must,
    MustNot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    MatchAll,
    Term { field: Option<String>, token: String },
    Phrase { field: Option<String>, tokens: Vec<String> },
    Prefix { field: Option<String>, prefix: String },
    Group(BooleanQuery),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub occur: Occur,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BooleanQuery {
    pub clauses: Vec<Clause>,
}

// ============================================================
// Lexer
// ============================================================

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    LParen,
    RParen,
    Must,
    MustNot,
    Not,
    Or,
    And,
    Word {
        field: Option<String>,
        value: String,
        quoted: bool,
    },
}

fn read_quoted(chars: &[char], pos: &mut usize) -> Result<String, String> {
    // chars[*pos] is the opening quote
    *pos += 1;
    let mut text = String::new();
    while *pos < chars.len() {
        match chars[*pos] {
            '\\' if *pos + 1 < chars.len() => {
                text.push(chars[*pos + 1]);
                *pos += 2;
            }
            '"' => {
                *pos += 1;
                return Ok(text);
            }
            c => {
                text.push(c);
                *pos += 1;
            }
        }
    }
    Err("unterminated quoted phrase".to_string())
}

fn lex(input: &str) -> Result<Vec<Lexeme>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;
    let mut out = Vec::new();

    while pos < chars.len() {
        let c = chars[pos];
        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        match c {
            '(' => {
                out.push(Lexeme::LParen);
                pos += 1;
            }
            ')' => {
                out.push(Lexeme::RParen);
                pos += 1;
            }
            '+' | '-' if pos + 1 < chars.len() && !chars[pos + 1].is_whitespace() => {
                out.push(if c == '+' { Lexeme::Must } else { Lexeme::MustNot });
                pos += 1;
            }
            '"' => {
                let value = read_quoted(&chars, &mut pos)?;
                out.push(Lexeme::Word {
                    field: None,
                    value,
                    quoted: true,
                });
            }
            _ => {
                let mut word = String::new();
                let mut field = None;
                let mut quoted_value = None;

                while pos < chars.len() {
                    let ch = chars[pos];
                    if ch.is_whitespace() || ch == '(' || ch == ')' {
                        break;
                    }
                    if ch == '\\' && pos + 1 < chars.len() {
                        word.push(chars[pos + 1]);
                        pos += 2;
                        continue;
                    }
                    if ch == ':' && field.is_none() && !word.is_empty() {
                        field = Some(std::mem::take(&mut word).to_lowercase());
                        pos += 1;
                        if pos < chars.len() && chars[pos] == '"' {
                            quoted_value = Some(read_quoted(&chars, &mut pos)?);
                            break;
                        }
                        continue;
                    }
                    word.push(ch);
                    pos += 1;
                }

                let lexeme = match (field, quoted_value) {
                    (field, Some(value)) => Lexeme::Word {
                        field,
                        value,
                        quoted: true,
                    },
                    (None, None) => match word.as_str() {
                        "NOT" => Lexeme::Not,
                        "OR" | "||" => Lexeme::Or,
                        "AND" | "&&" => Lexeme::And,
                        _ => Lexeme::Word {
                            field: None,
                            value: word,
                            quoted: false,
                        },
                    },
                    (Some(field), None) => {
                        if word.is_empty() {
                            return Err(format!("missing value for field '{}'", field));
                        }
                        Lexeme::Word {
                            field: Some(field),
                            value: word,
                            quoted: false,
                        }
                    }
                };
                out.push(lexeme);
            }
        }
    }

    Ok(out)
}

// ============================================================
// Parser
// ============================================================

/// Deepest parenthesized group accepted by `parse`
pub const MAX_NESTING: usize = 64;

/// Parse a query string into a boolean query
pub fn parse(input: &str) -> Result<BooleanQuery, String> {
    let lexemes = lex(input)?;
    let mut pos = 0;
    let query = parse_group(&lexemes, &mut pos, 0)?;
    if pos < lexemes.len() {
        return Err("unbalanced ')'".to_string());
    }
    if query.clauses.is_empty() {
        return Err("empty query".to_string());
    }
    Ok(query)
}

fn parse_group(
    lexemes: &[Lexeme],
    pos: &mut usize,
    depth: usize,
) -> Result<BooleanQuery, String> {
    if depth > MAX_NESTING {
        return Err("query nested too deeply".to_string());
    }

    let mut clauses: Vec<Clause> = Vec::new();
    let mut pending_and = false;

    while *pos < lexemes.len() {
        let mut occur = Occur::Should;

        match &lexemes[*pos] {
            Lexeme::RParen => break,
            Lexeme::Or => {
                *pos += 1;
                continue;
            }
            Lexeme::And => {
                if let Some(last) = clauses.last_mut() {
                    if last.occur == Occur::Should {
                        last.occur = Occur::Must;
                    }
                }
                pending_and = true;
                *pos += 1;
                continue;
            }
            Lexeme::Must => {
                occur = Occur::Must;
                *pos += 1;
            }
            Lexeme::MustNot | Lexeme::Not => {
                occur = Occur::MustNot;
                *pos += 1;
            }
            _ => {}
        }

        if occur == Occur::Should && pending_and {
            occur = Occur::Must;
        }
        pending_and = false;

        let node = match lexemes.get(*pos) {
            Some(Lexeme::LParen) => {
                *pos += 1;
                let inner = parse_group(lexemes, pos, depth + 1)?;
                match lexemes.get(*pos) {
                    Some(Lexeme::RParen) => *pos += 1,
                    _ => return Err("missing ')'".to_string()),
                }
                Node::Group(inner)
            }
            Some(Lexeme::Word {
                field,
                value,
                quoted,
            }) => {
                *pos += 1;
                word_node(field.clone(), value, *quoted)
            }
            Some(other) => return Err(format!("unexpected {:?}", other)),
            None => return Err("query ends with an operator".to_string()),
        };

        clauses.push(Clause { occur, node });
    }

    Ok(BooleanQuery { clauses })
}

fn word_node(field: Option<String>, value: &str, quoted: bool) -> Node {
    if quoted {
        return Node::Phrase {
            field,
            tokens: analyze(value),
        };
    }
    if value == "*" {
        return Node::MatchAll;
    }
    if let Some(stem) = value.strip_suffix('*') {
        if !stem.is_empty() && !stem.contains('*') {
            return Node::Prefix {
                field,
                prefix: stem.to_lowercase(),
            };
        }
    }

    let mut tokens = analyze(value);
    if tokens.len() == 1 {
        Node::Term {
            field,
            token: tokens.remove(0),
        }
    } else {
        Node::Phrase { field, tokens }
    }
}

// ============================================================
// Matching
// ============================================================

fn candidate_fields<'a>(
    fields: &'a Fields,
    field: &'a Option<String>,
) -> Box<dyn Iterator<Item = &'a Vec<String>> + 'a> {
    match field {
        Some(name) => Box::new(fields.get(name).into_iter()),
        None => Box::new(fields.values()),
    }
}

fn node_score(node: &Node, fields: &Fields) -> Option<u32> {
    let hit = match node {
        Node::MatchAll => true,
        Node::Term { field, token } => {
            candidate_fields(fields, field).any(|tokens| tokens.iter().any(|t| t == token))
        }
        Node::Prefix { field, prefix } => candidate_fields(fields, field)
            .any(|tokens| tokens.iter().any(|t| t.starts_with(prefix.as_str()))),
        Node::Phrase { field, tokens } => {
            !tokens.is_empty()
                && candidate_fields(fields, field)
                    .any(|have| have.windows(tokens.len()).any(|w| w == tokens.as_slice()))
        }
        Node::Group(inner) => return score(inner, fields),
    };
    hit.then_some(1)
}

/// Score of a document against the query, or `None` when it does not match
pub fn score(query: &BooleanQuery, fields: &Fields) -> Option<u32> {
    let mut total = 0;
    let mut has_must = false;
    let mut has_should = false;
    let mut should_matched = false;

    for clause in &query.clauses {
        let result = node_score(&clause.node, fields);
        match clause.occur {
            Occur::MustNot => {
                if result.is_some() {
                    return None;
                }
            }
            Occur::Must => {
                has_must = true;
                total += result?;
            }
            Occur::Should => {
                has_should = true;
                if let Some(s) = result {
                    should_matched = true;
                    total += s;
                }
            }
        }
    }

    if !has_must && has_should && !should_matched {
        return None;
    }
    Some(total)
}
