//! Tag edits: fine-grained text operations on tag values
//!
//! An edit carries one or more operation groups. Each group walks a cursor
//! over the current string form of the value:
//! - `Preserve` moves the cursor forward by `count` characters
//! - `Insert` splices `text` at the cursor and moves past it
//! - `Delete` removes `count` characters at the cursor and leaves it in place
//!
//! Groups are applied in order, each to the result of the previous one.
//! Counts are measured in Unicode scalar values.

use crate::error::{Error, Result};
use crate::value::Value;
use crate::version::VersionVector;
use serde::{Deserialize, Serialize};

/// A single edit operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditOp {
    Preserve { count: usize },
    Insert { text: String },
    Delete { count: usize },
}

pub fn preserve(count: usize) -> EditOp {
    EditOp::Preserve { count }
}

pub fn insert(text: impl Into<String>) -> EditOp {
    EditOp::Insert { text: text.into() }
}

pub fn delete(count: usize) -> EditOp {
    EditOp::Delete { count }
}

/// An edit to a tag value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEdit {
    pub version: VersionVector,
    pub operation_groups: Vec<Vec<EditOp>>,
    /// Whether the edit originated outside the local interactive session
    #[serde(default)]
    pub is_remote: bool,
}

impl TagEdit {
    /// Mark the edit as remote
    pub fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }
}

/// Build an edit with a single operation group
pub fn edit(version: impl Into<VersionVector>, ops: Vec<EditOp>) -> TagEdit {
    edits(version, vec![ops])
}

/// Build an edit with several operation groups
pub fn edits(version: impl Into<VersionVector>, groups: Vec<Vec<EditOp>>) -> TagEdit {
    TagEdit {
        version: version.into(),
        operation_groups: groups,
        is_remote: false,
    }
}

/// Combine two edits so that applying the result equals applying `first`
/// then `second`.
pub fn merge_edits(first: &TagEdit, second: &TagEdit) -> TagEdit {
    let mut operation_groups =
        Vec::with_capacity(first.operation_groups.len() + second.operation_groups.len());
    operation_groups.extend(first.operation_groups.iter().cloned());
    operation_groups.extend(second.operation_groups.iter().cloned());

    TagEdit {
        version: first.version.merge(&second.version),
        operation_groups,
        is_remote: first.is_remote || second.is_remote,
    }
}

/// Apply an edit to a value and return the resulting string.
///
/// Counts that run past the end of the current string are clamped.
pub fn apply_edit(value: &Value, edit: &TagEdit) -> String {
    let mut text = value.to_tag_string();
    for group in &edit.operation_groups {
        // clamping never fails
        let _ = apply_group(&mut text, group, false);
    }
    text
}

/// Like [`apply_edit`], but rejects preserve/delete counts that run past the
/// end of the current string.
pub fn try_apply_edit(value: &Value, edit: &TagEdit) -> Result<String> {
    let mut text = value.to_tag_string();
    for group in &edit.operation_groups {
        apply_group(&mut text, group, true)?;
    }
    Ok(text)
}

/// Apply an edit for storage in a tag: an empty result collapses to `Null`.
pub fn apply_tag_edit(value: &Value, edit: &TagEdit) -> Value {
    let text = apply_edit(value, edit);
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    }
}

fn apply_group(text: &mut String, group: &[EditOp], strict: bool) -> Result<()> {
    // byte offset of the cursor
    let mut cursor = 0;
    for op in group {
        match op {
            EditOp::Preserve { count } => {
                let (end, moved) = advance(text, cursor, *count);
                if strict && moved < *count {
                    return Err(out_of_range("preserve", *count, text, cursor));
                }
                cursor = end;
            }
            EditOp::Insert { text: inserted } => {
                text.insert_str(cursor, inserted);
                cursor += inserted.len();
            }
            EditOp::Delete { count } => {
                let (end, moved) = advance(text, cursor, *count);
                if strict && moved < *count {
                    return Err(out_of_range("delete", *count, text, cursor));
                }
                text.replace_range(cursor..end, "");
            }
        }
    }
    Ok(())
}

/// Move `count` characters forward from the byte offset `from`, stopping at
/// the end of the string. Returns the new byte offset and the number of
/// characters actually moved.
fn advance(text: &str, from: usize, count: usize) -> (usize, usize) {
    let rest = &text[from..];
    match rest.char_indices().nth(count) {
        Some((offset, _)) => (from + offset, count),
        None => (text.len(), rest.chars().count()),
    }
}

fn out_of_range(op: &'static str, count: usize, text: &str, cursor: usize) -> Error {
    Error::EditOutOfRange {
        op,
        count,
        position: text[..cursor].chars().count(),
        length: text.chars().count(),
    }
}
