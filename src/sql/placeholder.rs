//! The placeholder normaliser (spec §4.B): rewrites driver-agnostic `?`
//! placeholders into each dialect's native parameter syntax, run once on the
//! finalised SQL text, never during folding itself.

use crate::error::{FatalError, FatalReason};
use crate::sql::dialect::PlaceholderStyle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    BracketQuoted,
    LineComment,
    BlockComment,
    /// PostgreSQL `$tag$...$tag$`. Tracks the tag so the closing delimiter
    /// can be matched exactly.
    DollarQuoted,
}

const JSON_OPERATOR_PRECEDING_KEYWORDS: &[&str] =
    &["LIKE", "IN", "NOT", "THEN", "ELSE", "WHEN", "LIMIT", "OFFSET"];

/// Rewrites every out-of-lexical-context `?` in `sql` into the placeholder
/// style `style` expects, and returns the rewritten text. `expected_params`
/// is the known parameter count; a mismatch with the number of rewritten
/// placeholders is a [`FatalError`], since it signals a bug upstream rather
/// than something a caller can route around.
pub fn normalize(sql: &str, style: PlaceholderStyle, expected_params: usize) -> Result<String, FatalError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut state = LexState::Normal;
    let mut dollar_tag = String::new();
    let mut found = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match state {
            LexState::Normal => {
                if c == '\'' {
                    state = LexState::SingleQuoted;
                    out.push(c);
                } else if c == '"' {
                    state = LexState::DoubleQuoted;
                    out.push(c);
                } else if c == '[' && matches!(style, PlaceholderStyle::AtP) {
                    state = LexState::BracketQuoted;
                    out.push(c);
                } else if c == '-' && chars.get(i + 1) == Some(&'-') {
                    state = LexState::LineComment;
                    out.push(c);
                } else if c == '/' && chars.get(i + 1) == Some(&'*') {
                    state = LexState::BlockComment;
                    out.push(c);
                } else if c == '$' && matches!(style, PlaceholderStyle::Dollar) {
                    if let Some(tag) = try_read_dollar_tag(&chars, i) {
                        dollar_tag = tag.clone();
                        out.push_str(&format!("${tag}$"));
                        i += tag.len() + 2;
                        state = LexState::DollarQuoted;
                        continue;
                    }
                    out.push(c);
                } else if c == '?' {
                    if should_rewrite_question_mark(&out, style) {
                        found += 1;
                        push_placeholder(&mut out, style, found);
                    } else {
                        out.push(c);
                    }
                } else {
                    out.push(c);
                }
            }
            LexState::SingleQuoted => {
                out.push(c);
                if c == '\'' {
                    if chars.get(i + 1) == Some(&'\'') {
                        out.push('\'');
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::DoubleQuoted => {
                out.push(c);
                if c == '"' {
                    if chars.get(i + 1) == Some(&'"') {
                        out.push('"');
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::BracketQuoted => {
                out.push(c);
                if c == ']' {
                    if chars.get(i + 1) == Some(&']') {
                        out.push(']');
                        i += 1;
                    } else {
                        state = LexState::Normal;
                    }
                }
            }
            LexState::LineComment => {
                out.push(c);
                if c == '\n' {
                    state = LexState::Normal;
                }
            }
            LexState::BlockComment => {
                out.push(c);
                if c == '*' && chars.get(i + 1) == Some(&'/') {
                    out.push('/');
                    i += 1;
                    state = LexState::Normal;
                }
            }
            LexState::DollarQuoted => {
                if c == '$' {
                    if let Some(rest) = chars.get(i + 1..i + 1 + dollar_tag.len() + 1) {
                        let candidate: String = rest.iter().collect();
                        if candidate == format!("{dollar_tag}$") {
                            out.push('$');
                            out.push_str(&dollar_tag);
                            out.push('$');
                            i += 1 + dollar_tag.len() + 1;
                            state = LexState::Normal;
                            continue;
                        }
                    }
                }
                out.push(c);
            }
        }
        i += 1;
    }

    if found != expected_params {
        log::error!("placeholder count mismatch: expected {expected_params}, found {found}");
        return Err(FatalError::new(FatalReason::PlaceholderCountMismatch {
            expected: expected_params,
            found,
        }));
    }

    Ok(out)
}

fn push_placeholder(out: &mut String, style: PlaceholderStyle, index: usize) {
    match style {
        PlaceholderStyle::Dollar => out.push_str(&format!("${index}")),
        PlaceholderStyle::AtP => out.push_str(&format!("@p{index}")),
        PlaceholderStyle::Question => out.push('?'),
    }
}

/// PostgreSQL's `?` doubles as a JSON containment/path operator in value
/// position; only treat a `?` as a placeholder when the preceding non-
/// whitespace token looks like it opens a value position.
fn should_rewrite_question_mark(out_so_far: &str, style: PlaceholderStyle) -> bool {
    if !matches!(style, PlaceholderStyle::Dollar) {
        return true;
    }
    let trimmed = out_so_far.trim_end();
    if trimmed.is_empty() {
        return true;
    }
    let last_char = trimmed.chars().last().unwrap();
    if matches!(last_char, ',' | '(' | '=' | '<' | '>' | '+' | '-' | '*' | '/') {
        return true;
    }
    let last_word: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    JSON_OPERATOR_PRECEDING_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(&last_word))
}

/// Attempts to read a `$tag$` opener starting at `chars[i]` (which must be
/// `$`). Returns the tag (possibly empty) on success.
fn try_read_dollar_tag(chars: &[char], i: usize) -> Option<String> {
    let mut j = i + 1;
    let mut tag = String::new();
    while let Some(&c) = chars.get(j) {
        if c == '$' {
            return Some(tag);
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            tag.push(c);
            j += 1;
        } else {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_passthrough_for_mysql_and_sqlite() {
        let sql = "SELECT * FROM t WHERE t.x = ?";
        let out = normalize(sql, PlaceholderStyle::Question, 1).unwrap();
        assert_eq!(out, sql);
    }

    #[test]
    fn rewrites_to_dollar_numbers_for_postgres() {
        let sql = "SELECT * FROM t WHERE t.x = ? AND t.y = ?";
        let out = normalize(sql, PlaceholderStyle::Dollar, 2).unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE t.x = $1 AND t.y = $2");
    }

    #[test]
    fn rewrites_to_at_p_for_sqlserver() {
        let sql = "SELECT TOP (?) * FROM t";
        let out = normalize(sql, PlaceholderStyle::AtP, 1).unwrap();
        assert_eq!(out, "SELECT TOP (@p1) * FROM t");
    }

    #[test]
    fn ignores_question_mark_inside_single_quoted_string() {
        let sql = "SELECT * FROM t WHERE t.x = 'what?' AND t.y = ?";
        let out = normalize(sql, PlaceholderStyle::Dollar, 1).unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE t.x = 'what?' AND t.y = $1");
    }

    #[test]
    fn ignores_question_mark_inside_line_comment() {
        let sql = "SELECT * FROM t -- what?\nWHERE t.y = ?";
        let out = normalize(sql, PlaceholderStyle::Dollar, 1).unwrap();
        assert!(out.ends_with("WHERE t.y = $1"));
    }

    #[test]
    fn ignores_question_mark_inside_dollar_quoted_body() {
        let sql = "SELECT $tag$contains a ? mark$tag$ AS c, t.y FROM t WHERE t.y = ?";
        let out = normalize(sql, PlaceholderStyle::Dollar, 1).unwrap();
        assert!(out.contains("$tag$contains a ? mark$tag$"));
        assert!(out.ends_with("WHERE t.y = $1"));
    }

    #[test]
    fn json_operator_question_mark_left_alone_on_postgres() {
        let sql = "SELECT data ? 'key' FROM t WHERE t.y = ?";
        let out = normalize(sql, PlaceholderStyle::Dollar, 1).unwrap();
        assert_eq!(out, "SELECT data ? 'key' FROM t WHERE t.y = $1");
    }

    #[test]
    fn mismatched_count_is_fatal() {
        let sql = "SELECT * FROM t WHERE t.x = ?";
        let err = normalize(sql, PlaceholderStyle::Dollar, 2).unwrap_err();
        assert_eq!(
            err.reason,
            FatalReason::PlaceholderCountMismatch {
                expected: 2,
                found: 1
            }
        );
    }
}
