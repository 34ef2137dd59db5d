//! Structural patches over JSON documents.
//!
//! [`diff`] computes a minimal list of `add` / `replace` / `remove`
//! operations that turns one document into another, and [`apply`] replays
//! such a list. Both are pure: `apply` works on a copy and either returns
//! the fully patched document or an error, never a half-applied one.
//!
//! Object members that appear are `add`ed, members that disappear are
//! `remove`d, and scalars (or values whose type changed) are `replace`d.
//! Arrays are compared element by element over their common prefix; the
//! tail is appended or removed from the end.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::PatchError;

/// One step of a patch path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Array index.
    Index(usize),
    /// Object key.
    Key(String),
}

impl PathSegment {
    fn as_key(&self) -> Cow<'_, str> {
        match self {
            Self::Key(key) => Cow::Borrowed(key),
            Self::Index(index) => Cow::Owned(index.to_string()),
        }
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(index) => Some(*index),
            Self::Key(key) => key.parse().ok(),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.write_str(key),
            Self::Index(index) => write!(f, "{index}"),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        Self::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Insert a new member or array element.
    Add,
    /// Overwrite an existing value.
    Replace,
    /// Delete a member or array element.
    Remove,
}

impl PatchOp {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Remove => "remove",
        }
    }
}

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Operation.
    pub op: PatchOp,
    /// Location, outermost segment first.
    pub path: Vec<PathSegment>,
    /// New value for `add` and `replace`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub value: Option<Value>,
}

// A present `"value": null` is a real value, not an absent one.
fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl Patch {
    /// `add` at `path`.
    #[must_use]
    pub fn add(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    /// `replace` at `path`.
    #[must_use]
    pub fn replace(path: Vec<PathSegment>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    /// `remove` at `path`.
    #[must_use]
    pub fn remove(path: Vec<PathSegment>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Path rendered as `/a/b/0`.
    #[must_use]
    pub fn rendered_path(&self) -> String {
        render(&self.path)
    }
}

fn render(path: &[PathSegment]) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.iter().fold(String::new(), |mut out, segment| {
        out.push('/');
        out.push_str(&segment.as_key());
        out
    })
}

/// Compute the patches that turn `old` into `new`.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Vec<Patch> {
    diff_at(Vec::new(), old, new)
}

/// Like [`diff`], with every path prefixed by `base`.
#[must_use]
pub fn diff_at(base: Vec<PathSegment>, old: &Value, new: &Value) -> Vec<Patch> {
    let mut out = Vec::new();
    let mut path = base;
    diff_into(&mut path, old, new, &mut out);
    out
}

fn diff_into(path: &mut Vec<PathSegment>, old: &Value, new: &Value, out: &mut Vec<Patch>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(before), Value::Object(after)) => {
            for (key, old_value) in before {
                path.push(PathSegment::Key(key.clone()));
                match after.get(key) {
                    Some(new_value) => diff_into(path, old_value, new_value, out),
                    None => out.push(Patch::remove(path.clone())),
                }
                path.pop();
            }
            for (key, new_value) in after {
                if !before.contains_key(key) {
                    path.push(PathSegment::Key(key.clone()));
                    out.push(Patch::add(path.clone(), new_value.clone()));
                    path.pop();
                }
            }
        }
        (Value::Array(before), Value::Array(after)) => {
            let common = before.len().min(after.len());
            for (index, (old_item, new_item)) in before.iter().zip(after).enumerate() {
                path.push(PathSegment::Index(index));
                diff_into(path, old_item, new_item, out);
                path.pop();
            }
            for (index, new_value) in after.iter().enumerate().skip(common) {
                path.push(PathSegment::Index(index));
                out.push(Patch::add(path.clone(), new_value.clone()));
                path.pop();
            }
            for index in (common..before.len()).rev() {
                path.push(PathSegment::Index(index));
                out.push(Patch::remove(path.clone()));
                path.pop();
            }
        }
        _ => out.push(Patch::replace(path.clone(), new.clone())),
    }
}

/// Apply `patches` in order to a copy of `doc`.
///
/// # Errors
///
/// Returns a [`PatchError`] if any patch does not fit the document; the
/// input document is never modified.
pub fn apply(doc: &Value, patches: &[Patch]) -> Result<Value, PatchError> {
    let mut next = doc.clone();
    for patch in patches {
        apply_one(&mut next, patch)?;
    }
    Ok(next)
}

fn take_value(patch: &Patch) -> Result<Value, PatchError> {
    patch.value.clone().ok_or_else(|| PatchError::MissingValue {
        op: patch.op.name(),
        path: patch.rendered_path(),
    })
}

fn child<'a>(value: &'a mut Value, segment: &PathSegment, at: &[PathSegment]) -> Result<&'a mut Value, PatchError> {
    match value {
        Value::Object(map) => map
            .get_mut(segment.as_key().as_ref())
            .ok_or_else(|| PatchError::PathNotFound(render(at))),
        Value::Array(items) => {
            let index = segment
                .as_index()
                .ok_or_else(|| PatchError::TypeMismatch(render(at)))?;
            items
                .get_mut(index)
                .ok_or_else(|| PatchError::PathNotFound(render(at)))
        }
        _ => Err(PatchError::TypeMismatch(render(at))),
    }
}

fn apply_one(doc: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let Some((last, parents)) = patch.path.split_last() else {
        return match patch.op {
            PatchOp::Replace => {
                *doc = take_value(patch)?;
                Ok(())
            }
            PatchOp::Add | PatchOp::Remove => Err(PatchError::EmptyPath),
        };
    };

    let mut target = doc;
    for (depth, segment) in parents.iter().enumerate() {
        target = child(target, segment, &patch.path[..=depth])?;
    }

    match target {
        Value::Object(map) => {
            let key = last.as_key();
            match patch.op {
                PatchOp::Add | PatchOp::Replace => {
                    map.insert(key.into_owned(), take_value(patch)?);
                }
                PatchOp::Remove => {
                    if map.remove(key.as_ref()).is_none() {
                        return Err(PatchError::PathNotFound(patch.rendered_path()));
                    }
                }
            }
        }
        Value::Array(items) => {
            let index = last
                .as_index()
                .ok_or_else(|| PatchError::TypeMismatch(patch.rendered_path()))?;
            match patch.op {
                PatchOp::Add if index <= items.len() => items.insert(index, take_value(patch)?),
                PatchOp::Replace if index < items.len() => items[index] = take_value(patch)?,
                PatchOp::Remove if index < items.len() => {
                    items.remove(index);
                }
                _ => return Err(PatchError::PathNotFound(patch.rendered_path())),
            }
        }
        _ => return Err(PatchError::TypeMismatch(patch.rendered_path())),
    }
    Ok(())
}
