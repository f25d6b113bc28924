//! Lightweight SQL classifier.
//!
//! Deliberately not a grammar: first-keyword classification plus anchor
//! regexes for table extraction. The multi-statement scanner runs over the
//! raw bytes before any comment stripping so that semicolons hidden in
//! comments cannot skew the verdict.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::error::ParseError;

/// First-keyword classification of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCommand {
    Select,
    Insert,
    Update,
    Delete,
    Drop,
    Truncate,
    Alter,
    Create,
    Call,
    Prepare,
    Execute,
    Unknown,
}

impl SqlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlCommand::Select => "SELECT",
            SqlCommand::Insert => "INSERT",
            SqlCommand::Update => "UPDATE",
            SqlCommand::Delete => "DELETE",
            SqlCommand::Drop => "DROP",
            SqlCommand::Truncate => "TRUNCATE",
            SqlCommand::Alter => "ALTER",
            SqlCommand::Create => "CREATE",
            SqlCommand::Call => "CALL",
            SqlCommand::Prepare => "PREPARE",
            SqlCommand::Execute => "EXECUTE",
            SqlCommand::Unknown => "UNKNOWN",
        }
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" => SqlCommand::Select,
            "INSERT" => SqlCommand::Insert,
            "UPDATE" => SqlCommand::Update,
            "DELETE" => SqlCommand::Delete,
            "DROP" => SqlCommand::Drop,
            "TRUNCATE" => SqlCommand::Truncate,
            "ALTER" => SqlCommand::Alter,
            "CREATE" => SqlCommand::Create,
            "CALL" => SqlCommand::Call,
            "PREPARE" => SqlCommand::Prepare,
            "EXECUTE" => SqlCommand::Execute,
            _ => SqlCommand::Unknown,
        }
    }
}

/// Classifier output. `raw_sql` is the byte-for-byte original; `tables` may
/// be incomplete for subqueries and CTEs (the extractor does not recurse).
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub command: SqlCommand,
    pub tables: Vec<String>,
    pub raw_sql: String,
    pub has_where_clause: bool,
    /// CALL target, captured here instead of being smuggled through
    /// `tables[0]`
    pub procedure_name: Option<String>,
}

/// SQL classifier with its anchor patterns compiled once.
pub struct SqlClassifier {
    anchors: HashMap<&'static str, Regex>,
    where_re: Regex,
    call_re: Regex,
}

/// Anchor keywords per command for table extraction.
const SELECT_DELETE_ANCHORS: &[&str] = &["FROM", "JOIN"];
const INSERT_ANCHORS: &[&str] = &["INTO"];
const UPDATE_ANCHORS: &[&str] = &["UPDATE", "JOIN"];
const DDL_ANCHORS: &[&str] = &["TABLE"];

fn is_table_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'`'
}

impl SqlClassifier {
    pub fn new() -> Self {
        let mut anchors = HashMap::new();
        for anchor in ["FROM", "JOIN", "INTO", "UPDATE", "TABLE"] {
            // anchor followed by a comma-separated list of (optionally
            // back-ticked) dotted identifiers
            let pattern = format!(r"\b{anchor}\s+(`?[\w.]+`?(?:\s*,\s*`?[\w.]+`?)*)");
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .expect("anchor pattern is a compile-time constant");
            anchors.insert(anchor, re);
        }

        Self {
            anchors,
            where_re: Regex::new(r"\bWHERE\b").expect("constant pattern"),
            call_re: RegexBuilder::new(r"CALL\s+([\w.]+)\s*\(")
                .case_insensitive(true)
                .build()
                .expect("constant pattern"),
        }
    }

    /// Classify one statement.
    ///
    /// Fails with `InvalidSql` on empty input, comments-only input, and
    /// multi-statement SQL (any `;` outside strings/comments that is
    /// followed by anything other than whitespace).
    pub fn parse(&self, sql: &str) -> Result<ParsedQuery, ParseError> {
        if sql.trim().is_empty() {
            return Err(ParseError::invalid_sql("empty SQL input", sql));
        }

        check_multi_statement(sql)?;

        let stripped = remove_comments(sql);
        let normalized = stripped.to_ascii_uppercase();
        let normalized = normalized.trim();
        if normalized.is_empty() {
            return Err(ParseError::invalid_sql(
                "SQL is empty after comment removal",
                sql,
            ));
        }

        let first_keyword = normalized
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let command = SqlCommand::from_keyword(first_keyword);

        let mut tables = Vec::new();
        let anchor_set: &[&str] = match command {
            SqlCommand::Select | SqlCommand::Delete => SELECT_DELETE_ANCHORS,
            SqlCommand::Insert => INSERT_ANCHORS,
            SqlCommand::Update => UPDATE_ANCHORS,
            SqlCommand::Drop | SqlCommand::Truncate | SqlCommand::Alter | SqlCommand::Create => {
                DDL_ANCHORS
            }
            _ => &[],
        };
        for &anchor in anchor_set {
            self.extract_tables(normalized, sql, anchor, &mut tables);
        }

        let procedure_name = if command == SqlCommand::Call {
            self.call_re
                .captures(sql)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        } else {
            None
        };

        Ok(ParsedQuery {
            command,
            tables,
            raw_sql: sql.to_string(),
            has_where_clause: self.where_re.is_match(normalized),
            procedure_name,
        })
    }

    fn extract_tables(
        &self,
        normalized: &str,
        raw: &str,
        anchor: &'static str,
        out: &mut Vec<String>,
    ) {
        let Some(re) = self.anchors.get(anchor) else {
            return;
        };

        for caps in re.captures_iter(normalized) {
            let Some(list) = caps.get(1) else { continue };
            for token in list.as_str().split(',') {
                let token = token.trim().trim_matches('`');
                // a `(` opens a subquery; the extractor does not recurse
                if token.is_empty() || token.starts_with('(') {
                    continue;
                }

                let name = recover_casing(raw, token);
                let upper = name.to_ascii_uppercase();
                if !out.iter().any(|t| t.to_ascii_uppercase() == upper) {
                    out.push(name);
                }
            }
        }
    }
}

impl Default for SqlClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Find `token` in the raw SQL with word-boundary checks and return the
/// original casing; falls back to the normalized token.
fn recover_casing(raw: &str, token: &str) -> String {
    let raw_upper = raw.to_ascii_uppercase();
    let token_upper = token.to_ascii_uppercase();
    let raw_bytes = raw.as_bytes();

    let mut search_from = 0;
    while let Some(hay) = raw_upper.get(search_from..) {
        let Some(found) = hay.find(&token_upper) else {
            break;
        };
        let start = search_from + found;
        let end = start + token_upper.len();

        let valid_start = start == 0 || !is_table_name_byte(raw_bytes[start - 1]);
        let valid_end = end >= raw_bytes.len() || !is_table_name_byte(raw_bytes[end]);
        if valid_start && valid_end {
            if let Some(original) = raw.get(start..end) {
                return original.to_string();
            }
        }
        search_from = start + 1;
    }
    token.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    SingleQuote,
    DoubleQuote,
    BlockComment,
    LineComment,
    HashComment,
}

/// Reject multi-statement SQL.
///
/// A `;` in Normal state terminates the statement; only whitespace may
/// follow. `''`/`""` are embedded-quote escapes, backslash escapes the next
/// byte inside quoted states. ANSI-quotes mode (where `"` delimits
/// identifiers) is not modeled; treating `"` as a string opener is the more
/// conservative reading.
fn check_multi_statement(sql: &str) -> Result<(), ParseError> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut state = ScanState::Normal;
    let mut i = 0;

    while i < len {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        match state {
            ScanState::Normal => match c {
                b'\'' => state = ScanState::SingleQuote,
                b'"' => state = ScanState::DoubleQuote,
                b'/' if next == Some(b'*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                b'-' if next == Some(b'-') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                b'#' => state = ScanState::HashComment,
                b';' => {
                    if bytes[i + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                        let prefix: String = sql.chars().take(80).collect();
                        warn!(sql_prefix = %prefix, "multi-statement SQL rejected");
                        return Err(ParseError::invalid_sql(
                            "multi-statement SQL: semicolon outside string or comment",
                            sql,
                        ));
                    }
                    return Ok(());
                }
                _ => {}
            },
            ScanState::SingleQuote => match c {
                b'\\' => i += 1,
                b'\'' if next == Some(b'\'') => i += 1,
                b'\'' => state = ScanState::Normal,
                _ => {}
            },
            ScanState::DoubleQuote => match c {
                b'\\' => i += 1,
                b'"' if next == Some(b'"') => i += 1,
                b'"' => state = ScanState::Normal,
                _ => {}
            },
            ScanState::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    state = ScanState::Normal;
                    i += 1;
                }
            }
            ScanState::LineComment | ScanState::HashComment => {
                if c == b'\n' {
                    state = ScanState::Normal;
                }
            }
        }
        i += 1;
    }

    Ok(())
}

/// Strip comments from SQL.
///
/// Block comments become a single space so `DROP/**/TABLE` does not fuse
/// into `DROPTABLE`; line comments are removed to end of line. No nesting.
fn remove_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut out = Vec::with_capacity(len);
    let mut i = 0;

    while i < len {
        if i + 1 < len && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i += 2;
            while i + 1 < len {
                if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    i += 2;
                    break;
                }
                i += 1;
            }
            // an unterminated block comment swallows the rest
            if i + 1 >= len && !(i >= 2 && bytes[i - 2] == b'*' && bytes[i - 1] == b'/') {
                i = len;
            }
            out.push(b' ');
            continue;
        }

        if i + 1 < len && bytes[i] == b'-' && bytes[i + 1] == b'-' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if bytes[i] == b'#' {
            while i < len && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
