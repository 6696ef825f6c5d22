//! # Diff Reconciler
//!
//! Rebuilds full output values from incremental edit lists.
//!
//! ## Edit Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Edit Semantics                                 │
//! │                                                                         │
//! │  Wire form:  [[action, path, value], ...]                              │
//! │                                                                         │
//! │  ACTION    ROOT (path = [])          NESTED (path = [.., last])        │
//! │  ───────   ────────────────────      ──────────────────────────────    │
//! │  replace   value                     target[last] = value              │
//! │  append    previous + value          target[last] = target[last]+value │
//! │  add       UnsupportedEdit           array: insert at last (shift)     │
//! │                                      object: target[last] = value      │
//! │  delete    UnsupportedEdit           array: remove at last             │
//! │                                      object: remove field last         │
//! │                                                                         │
//! │  Edits apply strictly in order; each observes all prior edits.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Per-Event Accumulation
//! Generative endpoints stream an output tuple per frame. The first frame of
//! an event carries full values; every later frame carries, per output
//! position, an edit list against the value materialized so far.
//! [`DiffAccumulator`] keeps the materialized tuple per event id.

use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Edit Types
// =============================================================================

/// The four edit actions understood by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Replace,
    Append,
    Add,
    Delete,
}

impl EditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditAction::Replace => "replace",
            EditAction::Append => "append",
            EditAction::Add => "add",
            EditAction::Delete => "delete",
        }
    }
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EditAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(EditAction::Replace),
            "append" => Ok(EditAction::Append),
            "add" => Ok(EditAction::Add),
            "delete" => Ok(EditAction::Delete),
            other => Err(CoreError::UnknownEdit {
                action: other.to_string(),
            }),
        }
    }
}

/// One step of an edit path: an object key or a sequence index.
///
/// Servers are loose about which form they send, so a `Key("2")` still
/// addresses index 2 of an array and an `Index(2)` addresses key `"2"` of an
/// object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    fn parse(raw: &Value) -> CoreResult<Self> {
        match raw {
            Value::String(key) => Ok(PathSegment::Key(key.clone())),
            Value::Number(n) => n
                .as_u64()
                .map(|i| PathSegment::Index(i as usize))
                .ok_or_else(|| {
                    CoreError::InvalidEdit(format!("path index {} is not a valid index", n))
                }),
            other => Err(CoreError::InvalidEdit(format!(
                "path segment must be a string or index, got {}",
                other
            ))),
        }
    }

    /// Returns the segment as a sequence index, if it is one.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(k) => k.parse().ok(),
        }
    }

    /// Returns the segment as an object key.
    pub fn as_key(&self) -> String {
        match self {
            PathSegment::Index(i) => i.to_string(),
            PathSegment::Key(k) => k.clone(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{}", i),
            PathSegment::Key(k) => write!(f, "{:?}", k),
        }
    }
}

/// A single `(action, path, value)` instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Edit {
    pub action: EditAction,
    pub path: Vec<PathSegment>,
    pub value: Value,
}

impl Edit {
    /// Creates an edit.
    pub fn new(action: EditAction, path: Vec<PathSegment>, value: Value) -> Self {
        Edit {
            action,
            path,
            value,
        }
    }

    /// Parses one `[action, path, value]` triple.
    ///
    /// `delete` may omit its value.
    pub fn parse(raw: &Value) -> CoreResult<Self> {
        let parts = raw
            .as_array()
            .ok_or_else(|| CoreError::InvalidEdit(format!("edit must be an array, got {}", raw)))?;

        let action = parts
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidEdit("edit action must be a string".into()))?
            .parse::<EditAction>()?;

        let path = match parts.get(1) {
            Some(Value::Array(segments)) => segments
                .iter()
                .map(PathSegment::parse)
                .collect::<CoreResult<Vec<_>>>()?,
            Some(other) => {
                return Err(CoreError::InvalidEdit(format!(
                    "edit path must be an array, got {}",
                    other
                )))
            }
            None => return Err(CoreError::InvalidEdit("edit is missing its path".into())),
        };

        let value = parts.get(2).cloned().unwrap_or(Value::Null);

        Ok(Edit::new(action, path, value))
    }

    /// Parses an edit list `[[action, path, value], ...]`.
    pub fn parse_list(raw: &Value) -> CoreResult<Vec<Self>> {
        raw.as_array()
            .ok_or_else(|| {
                CoreError::InvalidEdit(format!("edit list must be an array, got {}", raw))
            })?
            .iter()
            .map(Edit::parse)
            .collect()
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Applies `edits` to `previous` in order and returns the new value.
pub fn apply_diff(previous: Value, edits: &[Edit]) -> CoreResult<Value> {
    edits
        .iter()
        .try_fold(previous, |value, edit| apply_edit(value, edit))
}

/// Parses a raw edit list and applies it to `previous`.
pub fn apply_raw_diff(previous: Value, raw_edits: &Value) -> CoreResult<Value> {
    let edits = Edit::parse_list(raw_edits)?;
    apply_diff(previous, &edits)
}

fn apply_edit(mut target: Value, edit: &Edit) -> CoreResult<Value> {
    let Some((last, parents)) = edit.path.split_last() else {
        return match edit.action {
            EditAction::Replace => Ok(edit.value.clone()),
            EditAction::Append => concat(&target, &edit.value),
            action => Err(CoreError::UnsupportedEdit {
                action: action.to_string(),
            }),
        };
    };

    let container = navigate_mut(&mut target, parents, &edit.path)?;

    match edit.action {
        EditAction::Replace => match container {
            Value::Array(items) => {
                let index = array_index(last, &edit.path)?;
                if index < items.len() {
                    items[index] = edit.value.clone();
                } else if index == items.len() {
                    items.push(edit.value.clone());
                } else {
                    return Err(out_of_bounds(&edit.path, index, items.len()));
                }
            }
            Value::Object(map) => {
                map.insert(last.as_key(), edit.value.clone());
            }
            other => return Err(not_a_container(&edit.path, other)),
        },

        EditAction::Append => {
            let slot = child_mut(container, last).ok_or_else(|| CoreError::InvalidPath {
                path: format_path(&edit.path),
                reason: "append target does not exist".into(),
            })?;
            let joined = concat(slot, &edit.value)?;
            *slot = joined;
        }

        EditAction::Add => match container {
            Value::Array(items) => {
                let index = array_index(last, &edit.path)?;
                if index > items.len() {
                    return Err(out_of_bounds(&edit.path, index, items.len()));
                }
                items.insert(index, edit.value.clone());
            }
            Value::Object(map) => {
                map.insert(last.as_key(), edit.value.clone());
            }
            other => return Err(not_a_container(&edit.path, other)),
        },

        EditAction::Delete => match container {
            Value::Array(items) => {
                let index = array_index(last, &edit.path)?;
                if index >= items.len() {
                    return Err(out_of_bounds(&edit.path, index, items.len()));
                }
                items.remove(index);
            }
            Value::Object(map) => {
                map.remove(&last.as_key());
            }
            other => return Err(not_a_container(&edit.path, other)),
        },
    }

    Ok(target)
}

fn navigate_mut<'a>(
    root: &'a mut Value,
    segments: &[PathSegment],
    full_path: &[PathSegment],
) -> CoreResult<&'a mut Value> {
    let mut current = root;
    for segment in segments {
        current = child_mut(current, segment).ok_or_else(|| CoreError::InvalidPath {
            path: format_path(full_path),
            reason: format!("segment {} does not exist", segment),
        })?;
    }
    Ok(current)
}

fn child_mut<'a>(container: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match container {
        Value::Array(items) => segment.as_index().and_then(move |i| items.get_mut(i)),
        Value::Object(map) => map.get_mut(&segment.as_key()),
        _ => None,
    }
}

fn array_index(segment: &PathSegment, full_path: &[PathSegment]) -> CoreResult<usize> {
    segment.as_index().ok_or_else(|| CoreError::InvalidPath {
        path: format_path(full_path),
        reason: format!("{} is not a sequence index", segment),
    })
}

/// `left + right` for the operand pairs generative outputs actually stream.
fn concat(left: &Value, right: &Value) -> CoreResult<Value> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::String(a), Value::Number(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::Number(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        (Value::Number(a), Value::Number(b)) => add_numbers(a, b),
        (Value::Array(a), Value::Array(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::Array(joined))
        }
        (l, r) => Err(CoreError::InvalidEdit(format!(
            "cannot append {} to {}",
            type_name(r),
            type_name(l)
        ))),
    }
}

fn add_numbers(a: &Number, b: &Number) -> CoreResult<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| CoreError::InvalidEdit(format!("{} + {} is not a finite number", a, b)))
}

fn out_of_bounds(path: &[PathSegment], index: usize, len: usize) -> CoreError {
    CoreError::InvalidPath {
        path: format_path(path),
        reason: format!("index {} out of bounds for length {}", index, len),
    }
}

fn not_a_container(path: &[PathSegment], value: &Value) -> CoreError {
    CoreError::InvalidPath {
        path: format_path(path),
        reason: format!("parent is a {}, not a container", type_name(value)),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn format_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

// =============================================================================
// Diff Accumulator
// =============================================================================

/// Last materialized output tuple per event id.
///
/// Output schemas are positional, so each event maps to one slot per output.
#[derive(Debug, Default)]
pub struct DiffAccumulator {
    streams: HashMap<String, Vec<Value>>,
}

impl DiffAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs one generative frame in place.
    ///
    /// The first frame for `event_id` is stored verbatim. Every later frame
    /// holds one edit list per output position; each is applied to the stored
    /// value and the frame slot is overwritten with the full result.
    ///
    /// A frame is applied as a whole: if any position fails, neither the
    /// stored tuple nor `data` is changed.
    pub fn apply_stream(&mut self, event_id: &str, data: &mut [Value]) -> CoreResult<()> {
        let Some(stored) = self.streams.get_mut(event_id) else {
            self.streams.insert(event_id.to_string(), data.to_vec());
            return Ok(());
        };

        let mut next = stored.clone();
        if next.len() < data.len() {
            next.resize(data.len(), Value::Null);
        }
        for (position, edits) in data.iter().enumerate() {
            let previous = std::mem::take(&mut next[position]);
            next[position] = apply_raw_diff(previous, edits)?;
        }

        data.clone_from_slice(&next[..data.len()]);
        *stored = next;
        Ok(())
    }

    /// Drops the materialized tuple for a closed event.
    pub fn discard(&mut self, event_id: &str) -> bool {
        self.streams.remove(event_id).is_some()
    }

    /// Returns the materialized tuple for an event, if any.
    pub fn current(&self, event_id: &str) -> Option<&[Value]> {
        self.streams.get(event_id).map(Vec::as_slice)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.streams.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
