//! SQL normalization.
//!
//! Maps a raw query string to a canonical pattern used for grouping, slow
//! query reporting, and N+1 detection: literals are replaced with `?`,
//! `IN (...)` lists are collapsed, whitespace and case are normalized.
//! Normalization is deterministic and idempotent.

use std::sync::LazyLock;

use regex::Regex;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static IN_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bin\s*\(").expect("valid regex"));

/// Outcome of normalizing one SQL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// Canonical pattern: literals replaced, `IN` lists collapsed,
    /// whitespace collapsed, lowercased.
    pub normalized: String,
    /// Uppercase leading keyword when it is one of `SELECT`, `INSERT`,
    /// `UPDATE`, `DELETE`; empty otherwise.
    pub operation: String,
    /// Principal table the statement touches, with schema qualifiers and
    /// quoting stripped; empty when it cannot be determined.
    pub table: String,
}

/// Normalize a raw SQL string.
pub fn normalize(raw: &str) -> NormalizedQuery {
    let replaced = replace_literals(raw);
    let collapsed = collapse_in_lists(&replaced);
    let normalized = WHITESPACE
        .replace_all(collapsed.trim(), " ")
        .to_lowercase();

    let operation = leading_operation(raw);
    let table = extract_table(&normalized);

    NormalizedQuery {
        normalized,
        operation,
        table,
    }
}

const fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace single-quoted string literals and free-standing numeric literals
/// with `?`.
///
/// A doubled single quote inside a string (`''`) is an escaped quote, not a
/// delimiter. Numbers adjacent to identifier characters (`col1`, `utf8mb4`)
/// are left alone.
fn replace_literals(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        // String literal with '' escape handling.
        if c == '\'' {
            let mut j = i + 1;
            while j < chars.len() {
                if chars[j] == '\'' {
                    if j + 1 < chars.len() && chars[j + 1] == '\'' {
                        j += 2; // escaped quote, keep scanning
                        continue;
                    }
                    break;
                }
                j += 1;
            }
            out.push('?');
            i = (j + 1).min(chars.len());
            continue;
        }

        // Numeric literal, optionally signed, not glued to an identifier.
        let prev_is_ident = i > 0 && is_ident_char(chars[i - 1]);
        let starts_number = c.is_ascii_digit()
            || (c == '-' && i + 1 < chars.len() && chars[i + 1].is_ascii_digit());
        if starts_number && !prev_is_ident {
            let mut j = i;
            if chars[j] == '-' {
                j += 1;
            }
            while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                j += 1;
            }
            let next_is_ident = j < chars.len() && is_ident_char(chars[j]);
            if next_is_ident {
                // Part of an identifier such as `2fa_codes`; copy verbatim.
                out.extend(&chars[i..j]);
            } else {
                out.push('?');
            }
            i = j;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// Collapse every `IN ( ... )` list, however nested, to `IN (?)`.
fn collapse_in_lists(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut cursor = 0;

    while let Some(m) = IN_LIST.find_at(sql, cursor) {
        // `\b` in the pattern guarantees word-boundary IN; find the matching
        // closing paren by depth counting.
        let open = m.end() - 1;
        let mut depth = 0usize;
        let mut close = None;
        for (offset, c) in sql[open..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + offset);
                        break;
                    }
                }
                _ => {}
            }
        }

        match close {
            Some(close) => {
                out.push_str(&sql[cursor..m.start()]);
                out.push_str("IN (?)");
                cursor = close + 1;
            }
            None => break, // unbalanced parens, leave the tail as-is
        }
    }

    out.push_str(&sql[cursor..]);
    out
}

fn leading_operation(raw: &str) -> String {
    let first = raw.split_whitespace().next().unwrap_or("");
    let upper = first.to_uppercase();
    match upper.as_str() {
        "SELECT" | "INSERT" | "UPDATE" | "DELETE" => upper,
        _ => String::new(),
    }
}

/// Pull the principal table out of an already-normalized statement.
fn extract_table(normalized: &str) -> String {
    let tokens: Vec<&str> = normalized.split(' ').collect();
    let target = match tokens.first().copied() {
        Some("select") | Some("delete") => token_after(&tokens, "from"),
        Some("insert") => token_after(&tokens, "into"),
        Some("update") => tokens.get(1).copied(),
        _ => None,
    };

    let Some(raw) = target else {
        return String::new();
    };

    // `schema.table` keeps only the last segment; quoting is stripped.
    let bare = raw.rsplit('.').next().unwrap_or(raw);
    bare.trim_matches(|c| c == '`' || c == '"' || c == '(' || c == ')' || c == ',' || c == ';')
        .to_string()
}

fn token_after<'a>(tokens: &[&'a str], keyword: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == keyword)
        .and_then(|i| tokens.get(i + 1).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_string_literals() {
        let q = normalize("SELECT * FROM users WHERE name = 'alice'");
        assert_eq!(q.normalized, "select * from users where name = ?");
        assert_eq!(q.operation, "SELECT");
        assert_eq!(q.table, "users");
    }

    #[test]
    fn handles_escaped_quotes() {
        let q = normalize("SELECT * FROM users WHERE name = 'o''brien'");
        assert_eq!(q.normalized, "select * from users where name = ?");
    }

    #[test]
    fn replaces_numbers_but_not_identifiers() {
        let q = normalize("SELECT col1, 42 FROM t2 WHERE x = 3.5 AND y = -7");
        assert_eq!(
            q.normalized,
            "select col1, ? from t2 where x = ? and y = ?"
        );
    }

    #[test]
    fn collapses_in_lists() {
        let q = normalize("SELECT * FROM posts WHERE id IN (1, 2, 3)");
        assert_eq!(q.normalized, "select * from posts where id in (?)");

        let nested = normalize("SELECT * FROM posts WHERE id IN (SELECT id FROM x WHERE y IN (1,2))");
        assert_eq!(
            nested.normalized,
            "select * from posts where id in (?)"
        );
    }

    #[test]
    fn word_boundary_in_only() {
        // `login` must not trigger list collapsing.
        let q = normalize("SELECT login FROM users WHERE login = 'x'");
        assert_eq!(q.normalized, "select login from users where login = ?");
    }

    #[test]
    fn collapses_whitespace_and_lowercases() {
        let q = normalize("  SELECT   *\n\tFROM   users  ");
        assert_eq!(q.normalized, "select * from users");
    }

    #[test]
    fn operation_detection() {
        assert_eq!(normalize("INSERT INTO t VALUES (1)").operation, "INSERT");
        assert_eq!(normalize("update t set a = 1").operation, "UPDATE");
        assert_eq!(normalize("DELETE FROM t").operation, "DELETE");
        assert_eq!(normalize("BEGIN").operation, "");
        assert_eq!(normalize("").operation, "");
    }

    #[test]
    fn table_extraction() {
        assert_eq!(normalize("SELECT * FROM public.users").table, "users");
        assert_eq!(normalize("INSERT INTO \"orders\" (a) VALUES (1)").table, "orders");
        assert_eq!(normalize("UPDATE `accounts` SET a = 1").table, "accounts");
        assert_eq!(normalize("DELETE FROM sessions WHERE id = 1").table, "sessions");
        assert_eq!(normalize("VACUUM").table, "");
    }

    #[test]
    fn deterministic_and_idempotent() {
        let raw = "SELECT * FROM t WHERE a = 'x' AND b IN (1,2,3) AND c = 42";
        let first = normalize(raw);
        let second = normalize(raw);
        assert_eq!(first, second);

        let again = normalize(&first.normalized);
        assert_eq!(again.normalized, first.normalized);
    }
}
