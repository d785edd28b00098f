//! Placeholder scanning for parameterized SQL.
//!
//! Supports positional `?` and named `?name` placeholders. Named placeholders
//! are rewritten to plain `?` before the text reaches the server; one name may
//! alias several positions. Placeholders inside string literals, quoted
//! identifiers and comments are ignored.

use std::collections::HashMap;

use memchr::{memchr, memchr2};

use crate::error::{Error, Result};

/// A parsed parameterized query.
#[derive(Debug, Clone)]
pub struct Query {
    sql: String,
    param_count: usize,
    named: HashMap<String, Vec<usize>>,
}

impl Query {
    /// Scan `sql` for placeholders.
    pub fn parse(sql: &str) -> Self {
        let bytes = sql.as_bytes();
        let mut out = String::with_capacity(sql.len());
        let mut named: HashMap<String, Vec<usize>> = HashMap::new();
        let mut param_count = 0;
        let mut plain_start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
                b'#' => i = skip_line_comment(bytes, i),
                // `--` starts a comment only when followed by whitespace or
                // the end of the statement.
                b'-' if bytes.get(i + 1) == Some(&b'-')
                    && matches!(bytes.get(i + 2), None | Some(b' ' | b'\t' | b'\r' | b'\n')) =>
                {
                    i = skip_line_comment(bytes, i);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
                b'?' => {
                    out.push_str(&sql[plain_start..=i]);
                    let name_start = i + 1;
                    let mut name_end = name_start;
                    while name_end < bytes.len() && is_name_byte(bytes[name_end]) {
                        name_end += 1;
                    }
                    if name_end > name_start {
                        named
                            .entry(sql[name_start..name_end].to_string())
                            .or_default()
                            .push(param_count);
                    }
                    param_count += 1;
                    plain_start = name_end;
                    i = name_end;
                }
                _ => i += 1,
            }
        }
        out.push_str(&sql[plain_start..]);
        Self {
            sql: out,
            param_count,
            named,
        }
    }

    /// Statement text with named placeholders rewritten to `?`.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Number of placeholders.
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Positional indexes aliased by `name`.
    pub fn indexes_of(&self, name: &str) -> Result<&[usize]> {
        self.named
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::InvalidUsage(format!("no parameter named {name:?}")))
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Skip a quoted region starting at `start`, honoring doubled-quote escapes
/// everywhere and backslash escapes in string literals (not in backtick
/// identifiers).
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    loop {
        let Some(position) = memchr2(quote, b'\\', &bytes[i..]) else {
            return bytes.len();
        };
        let at = i + position;
        if bytes[at] == b'\\' {
            i = if quote == b'`' { at + 1 } else { at + 2 };
        } else if bytes.get(at + 1) == Some(&quote) {
            i = at + 2;
        } else {
            return at + 1;
        }
    }
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    match memchr(b'\n', &bytes[start..]) {
        Some(position) => start + position + 1,
        None => bytes.len(),
    }
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while let Some(position) = memchr(b'*', &bytes[i..]) {
        let at = i + position;
        if bytes.get(at + 1) == Some(&b'/') {
            return at + 2;
        }
        i = at + 1;
    }
    bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_positional_placeholders() {
        let query = Query::parse("SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(query.param_count(), 2);
        assert_eq!(query.sql(), "SELECT * FROM t WHERE a = ? AND b = ?");
    }

    #[test]
    fn named_placeholders_are_rewritten() {
        let query = Query::parse("UPDATE t SET a = ?v, b = ?v WHERE id = ?id");
        assert_eq!(query.param_count(), 3);
        assert_eq!(query.sql(), "UPDATE t SET a = ?, b = ? WHERE id = ?");
        assert_eq!(query.indexes_of("v").unwrap(), &[0, 1]);
        assert_eq!(query.indexes_of("id").unwrap(), &[2]);
        assert!(query.indexes_of("missing").is_err());
    }

    #[test]
    fn literals_and_identifiers_hide_placeholders() {
        let query = Query::parse("SELECT '?', \"?\", `a?b`, ? FROM t");
        assert_eq!(query.param_count(), 1);
    }

    #[test]
    fn escapes_do_not_terminate_literals() {
        let query = Query::parse(r"SELECT 'it''s ?', 'a\'? b', ?");
        assert_eq!(query.param_count(), 1);
    }

    #[test]
    fn comments_hide_placeholders() {
        let query = Query::parse("SELECT ? -- is this one: ?\n, ? /* or ? */ # trailing ?");
        assert_eq!(query.param_count(), 2);
    }
}
