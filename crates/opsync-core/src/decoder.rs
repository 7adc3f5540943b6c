//! Decoding of textual change records into [`ChangeEvent`]s
//!
//! A record is recognised only when it starts with `table <schema>.`. It is
//! split into whitespace-delimited tokens: the second token names the table,
//! the third is the operation keyword and every later `key:value` token is a
//! column. Both the bare form
//!
//! ```text
//! table operations.orders INSERT order_id:1 status:'PENDING'
//! ```
//!
//! and the annotated form written by the `test_decoding` plugin
//!
//! ```text
//! table operations.orders: INSERT: order_id[integer]:1 status[text]:'PENDING'
//! ```
//!
//! are accepted. Whitespace inside single quotes or `[...]` type annotations
//! does not split tokens.
//!
//! An UPDATE may carry the previous row first (`old-key: ... new-tuple: ...`);
//! only the columns after `new-tuple:` describe the change. Values written as
//! `unchanged-toast-datum` were not sent and are marked unchanged.

use crate::{ChangeEvent, Entity, FieldMap, OperationKind};
use std::borrow::Cow;
use std::fmt;
use tracing::debug;

const OLD_KEY_MARKER: &str = "old-key:";
const NEW_TUPLE_MARKER: &str = "new-tuple:";
const UNCHANGED_TOAST: &str = "unchanged-toast-datum";

/// Why a record did not produce a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a row change of the watched schema (BEGIN, COMMIT, other schemas).
    NotAChange,
    /// Operation that is not replicated, e.g. `DELETE`.
    Operation(String),
    /// Table of the watched schema with no analytical counterpart.
    UnknownTable(String),
    /// Recognised prefix but not enough tokens to decode.
    Malformed,
}

impl SkipReason {
    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::NotAChange => "not_a_change",
            SkipReason::Operation(_) => "operation",
            SkipReason::UnknownTable(_) => "unknown_table",
            SkipReason::Malformed => "malformed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotAChange => write!(f, "not a row change of the watched schema"),
            SkipReason::Operation(op) => write!(f, "operation '{}' is not replicated", op),
            SkipReason::UnknownTable(t) => write!(f, "table '{}' is not replicated", t),
            SkipReason::Malformed => write!(f, "malformed change record"),
        }
    }
}

/// Decoder for one source schema.
#[derive(Debug, Clone)]
pub struct ChangeDecoder {
    marker: String,
}

impl ChangeDecoder {
    pub fn new(schema: &str) -> Self {
        Self {
            marker: format!("table {}.", schema),
        }
    }

    /// Decode a raw record, or `None` when it should be skipped.
    pub fn decode(&self, raw: &[u8]) -> Option<ChangeEvent> {
        self.classify(raw).ok()
    }

    /// Decode a raw record, reporting why it was skipped.
    pub fn classify(&self, raw: &[u8]) -> Result<ChangeEvent, SkipReason> {
        let text = decode_text(raw);
        self.classify_text(&text)
    }

    pub fn classify_text(&self, text: &str) -> Result<ChangeEvent, SkipReason> {
        let text = text.trim();
        if !text.starts_with(&self.marker) {
            return Err(SkipReason::NotAChange);
        }

        let tokens = tokenize(text);
        if tokens.len() < 3 {
            debug!(record = %truncate(text, 200), "Change record has too few tokens");
            return Err(SkipReason::Malformed);
        }

        let qualified = tokens[1].trim_end_matches(':');
        let table = match qualified.split_once('.') {
            Some((_, table)) if !table.is_empty() => table,
            _ => return Err(SkipReason::Malformed),
        };

        let keyword = tokens[2].trim_end_matches(':');
        let operation = OperationKind::from_keyword(keyword)
            .ok_or_else(|| SkipReason::Operation(keyword.to_string()))?;

        let entity =
            Entity::from_table(table).ok_or_else(|| SkipReason::UnknownTable(table.to_string()))?;

        let mut fields = FieldMap::new();
        for token in &tokens[3..] {
            match *token {
                OLD_KEY_MARKER => continue,
                // the previous row image ends here
                NEW_TUPLE_MARKER => {
                    fields.clear();
                    continue;
                }
                _ => {}
            }
            let Some((key, value)) = token.split_once(':') else {
                continue;
            };
            let column = key.split('[').next().unwrap_or(key);
            if column.is_empty() || value == "null" {
                continue;
            }
            if value == UNCHANGED_TOAST {
                fields.mark_unchanged(column);
            } else {
                fields.insert(column, unquote(value));
            }
        }

        Ok(ChangeEvent::new(entity, operation, fields))
    }
}

/// Decode record bytes as UTF-8, falling back to Latin-1.
pub fn decode_text(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(raw.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Split on whitespace that is outside single quotes and `[...]`.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_quotes = false;
    let mut bracket_depth = 0usize;

    for (idx, ch) in text.char_indices() {
        match ch {
            '\'' if bracket_depth == 0 => in_quotes = !in_quotes,
            '[' if !in_quotes => bracket_depth += 1,
            ']' if !in_quotes => bracket_depth = bracket_depth.saturating_sub(1),
            c if c.is_whitespace() && !in_quotes && bracket_depth == 0 => {
                if let Some(s) = start.take() {
                    tokens.push(&text[s..idx]);
                }
                continue;
            }
            _ => {}
        }
        if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    tokens
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("''", "'")
    } else {
        value.trim_matches('\'').to_string()
    }
}

/// Truncate for log output on a char boundary.
pub fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
