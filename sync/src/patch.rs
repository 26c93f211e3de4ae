//! JSON-patch subset: `add`, `replace` and `remove` over JSON-pointer paths
//!
//! Semantics:
//! - `add` creates the target, including missing intermediate objects. Inside
//!   an array it inserts at the index, or appends when the index is `-`.
//! - `replace` requires the target to exist.
//! - `remove` of an absent target is a no-op; removing the root is rejected.

use enginelink_core::{BridgeError, BridgeResult, NotFoundKind, Value};
use serde::{Deserialize, Serialize};

/// A single patch operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl Operation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Operation::Add {
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Operation::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Operation::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Operation::Add { path, .. }
            | Operation::Replace { path, .. }
            | Operation::Remove { path } => path,
        }
    }

    /// Parse an operation from an untyped document
    ///
    /// `add` and `replace` without a `value` are rejected.
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        serde_json::from_value(value).map_err(|e| BridgeError::InvalidOperation(e.to_string()))
    }
}

/// Split a JSON pointer into unescaped segments; `""` is the root
pub fn parse_pointer(path: &str) -> BridgeResult<Vec<String>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| BridgeError::InvalidPath(format!("'{}' must start with '/'", path)))?;

    Ok(rest
        .split('/')
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Build a JSON pointer from segments
pub fn format_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&segment.as_ref().replace('~', "~0").replace('/', "~1"));
    }
    out
}

/// Apply operations in order to `doc`
///
/// On error `doc` may be partially modified; callers apply to a working copy.
pub fn apply_operations(doc: &mut Value, ops: &[Operation]) -> BridgeResult<()> {
    for op in ops {
        apply_operation(doc, op)?;
    }
    Ok(())
}

/// Apply a single operation to `doc`
pub fn apply_operation(doc: &mut Value, op: &Operation) -> BridgeResult<()> {
    let segments = parse_pointer(op.path())?;
    match op {
        Operation::Add { value, .. } => add(doc, &segments, value.clone()),
        Operation::Replace { path, value } => replace(doc, &segments, path, value.clone()),
        Operation::Remove { .. } => remove(doc, &segments),
    }
}

fn add(doc: &mut Value, segments: &[String], value: Value) -> BridgeResult<()> {
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut target = doc;
    for segment in parents {
        if target.is_null() {
            *target = Value::Object(Default::default());
        }
        target = match target {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => {
                let len = items.len();
                let index = array_index(segment, len)?;
                items
                    .get_mut(index)
                    .ok_or_else(|| out_of_bounds(segment, len))?
            }
            _ => return Err(not_container(segment)),
        };
    }

    if target.is_null() {
        *target = Value::Object(Default::default());
    }

    match target {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, items.len())?;
            if index > items.len() {
                return Err(out_of_bounds(last, items.len()));
            }
            items.insert(index, value);
            Ok(())
        }
        _ => Err(not_container(last)),
    }
}

fn replace(doc: &mut Value, segments: &[String], path: &str, value: Value) -> BridgeResult<()> {
    let target = lookup_mut(doc, segments)
        .ok_or_else(|| BridgeError::not_found(NotFoundKind::Path, path))?;
    *target = value;
    Ok(())
}

fn remove(doc: &mut Value, segments: &[String]) -> BridgeResult<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(BridgeError::InvalidPath("cannot remove the document root".into()));
    };

    let Some(parent) = lookup_mut(doc, parents) else {
        return Ok(());
    };

    match parent {
        Value::Object(map) => {
            map.remove(last.as_str());
        }
        Value::Array(items) => {
            if let Some(index) = parse_index(last) {
                if index < items.len() {
                    items.remove(index);
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Resolve a path to a mutable reference, `None` if any segment is missing
fn lookup_mut<'a>(doc: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut target = doc;
    for segment in segments {
        target = match target {
            Value::Object(map) => map.get_mut(segment.as_str())?,
            Value::Array(items) => {
                let index = parse_index(segment)?;
                items.get_mut(index)?
            }
            _ => return None,
        };
    }
    Some(target)
}

/// Read-only path lookup
pub fn lookup<'a>(doc: &'a Value, path: &str) -> BridgeResult<Option<&'a Value>> {
    let segments = parse_pointer(path)?;
    let mut target = doc;
    for segment in &segments {
        let next = match target {
            Value::Object(map) => map.get(segment.as_str()),
            Value::Array(items) => parse_index(segment).and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => target = value,
            None => return Ok(None),
        }
    }
    Ok(Some(target))
}

/// Structural diff producing operations that turn `from` into `to`
///
/// Applying the result to an exact copy of `from` reproduces `to` exactly.
/// Arrays of differing length are replaced wholesale so no index shifting is
/// involved.
pub fn diff(from: &Value, to: &Value) -> Vec<Operation> {
    let mut ops = Vec::new();
    let mut path = Vec::new();
    diff_into(from, to, &mut path, &mut ops);
    ops
}

fn diff_into(from: &Value, to: &Value, path: &mut Vec<String>, ops: &mut Vec<Operation>) {
    if from == to {
        return;
    }

    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            for key in a.keys() {
                if !b.contains_key(key) {
                    path.push(key.clone());
                    ops.push(Operation::remove(format_pointer(path.as_slice())));
                    path.pop();
                }
            }
            for (key, new) in b {
                path.push(key.clone());
                match a.get(key) {
                    Some(old) => diff_into(old, new, path, ops),
                    None => ops.push(Operation::add(format_pointer(path.as_slice()), new.clone())),
                }
                path.pop();
            }
        }
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (index, (old, new)) in a.iter().zip(b).enumerate() {
                path.push(index.to_string());
                diff_into(old, new, path, ops);
                path.pop();
            }
        }
        _ => ops.push(Operation::replace(format_pointer(path.as_slice()), to.clone())),
    }
}

/// Canonical decimal array index: digits only, no leading zero
fn parse_index(segment: &str) -> Option<usize> {
    let canonical = !segment.is_empty()
        && segment.bytes().all(|b| b.is_ascii_digit())
        && (segment == "0" || !segment.starts_with('0'));
    if !canonical {
        return None;
    }
    segment.parse().ok()
}

fn array_index(segment: &str, len: usize) -> BridgeResult<usize> {
    if segment == "-" {
        return Ok(len);
    }
    parse_index(segment)
        .ok_or_else(|| BridgeError::InvalidPath(format!("'{}' is not an array index", segment)))
}

fn out_of_bounds(segment: &str, len: usize) -> BridgeError {
    BridgeError::InvalidPath(format!("index {} out of bounds (len {})", segment, len))
}

fn not_container(segment: &str) -> BridgeError {
    BridgeError::InvalidPath(format!("cannot descend into scalar at '{}'", segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patched(mut doc: Value, ops: &[Operation]) -> BridgeResult<Value> {
        apply_operations(&mut doc, ops)?;
        Ok(doc)
    }

    #[test]
    fn test_pointer_parsing() {
        assert!(parse_pointer("").unwrap().is_empty());
        assert_eq!(parse_pointer("/a/b/0").unwrap(), vec!["a", "b", "0"]);
        assert_eq!(parse_pointer("/a~1b/c~0d").unwrap(), vec!["a/b", "c~d"]);
        assert!(parse_pointer("a/b").is_err());
        assert_eq!(format_pointer(&["a/b", "c~d"]), "/a~1b/c~0d");
    }

    #[test]
    fn test_add_to_empty_object() {
        let doc = patched(json!({}), &[Operation::add("/x", json!(5))]).unwrap();
        assert_eq!(doc, json!({"x": 5}));
    }

    #[test]
    fn test_add_creates_intermediate_objects() {
        let doc = patched(json!({}), &[Operation::add("/player/pos/x", json!(3))]).unwrap();
        assert_eq!(doc, json!({"player": {"pos": {"x": 3}}}));
    }

    #[test]
    fn test_add_into_arrays() {
        let doc = patched(
            json!({"items": [1, 3]}),
            &[
                Operation::add("/items/1", json!(2)),
                Operation::add("/items/-", json!(4)),
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"items": [1, 2, 3, 4]}));

        let err = patched(json!({"items": []}), &[Operation::add("/items/5", json!(1))]);
        assert!(matches!(err, Err(BridgeError::InvalidPath(_))));
    }

    #[test]
    fn test_non_canonical_array_indexes_are_rejected() {
        let items = json!({"items": [1, 2, 3]});

        for path in ["/items/01", "/items/+1", "/items/ 1", "/items/"] {
            let err = patched(items.clone(), &[Operation::add(path, json!(9))]);
            assert!(matches!(err, Err(BridgeError::InvalidPath(_))), "{}", path);
        }

        let err = patched(items.clone(), &[Operation::replace("/items/+1", json!(9))]);
        assert!(matches!(err, Err(BridgeError::NotFound { .. })));

        let doc = patched(items.clone(), &[Operation::remove("/items/01")]).unwrap();
        assert_eq!(doc, items);
        assert_eq!(lookup(&items, "/items/00").unwrap(), None);

        let doc = patched(
            items.clone(),
            &[
                Operation::replace("/items/0", json!(0)),
                Operation::remove("/items/2"),
            ],
        )
        .unwrap();
        assert_eq!(doc, json!({"items": [0, 2]}));
        assert_eq!(lookup(&items, "/items/0").unwrap(), Some(&json!(1)));
    }

    #[test]
    fn test_add_through_scalar_fails() {
        let err = patched(json!({"hp": 3}), &[Operation::add("/hp/max", json!(10))]);
        assert!(matches!(err, Err(BridgeError::InvalidPath(_))));
    }

    #[test]
    fn test_remove_leaves_siblings() {
        let doc = patched(json!({"x": 1, "y": 2}), &[Operation::remove("/x")]).unwrap();
        assert_eq!(doc, json!({"y": 2}));
    }

    #[test]
    fn test_remove_absent_path_is_noop() {
        let doc = patched(
            json!({"y": 2}),
            &[Operation::remove("/x"), Operation::remove("/a/b/c")],
        )
        .unwrap();
        assert_eq!(doc, json!({"y": 2}));

        assert!(patched(json!({}), &[Operation::remove("")]).is_err());
    }

    #[test]
    fn test_remove_array_element() {
        let doc = patched(json!({"q": [1, 2, 3]}), &[Operation::remove("/q/0")]).unwrap();
        assert_eq!(doc, json!({"q": [2, 3]}));
    }

    #[test]
    fn test_replace_requires_existing_path() {
        let doc = patched(json!({"hp": 10}), &[Operation::replace("/hp", json!(4))]).unwrap();
        assert_eq!(doc, json!({"hp": 4}));

        let err = patched(json!({}), &[Operation::replace("/hp", json!(4))]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotFound {
                kind: NotFoundKind::Path,
                ..
            }
        ));
    }

    #[test]
    fn test_root_replace() {
        let doc = patched(json!({"a": 1}), &[Operation::replace("", json!([1]))]).unwrap();
        assert_eq!(doc, json!([1]));
    }

    #[test]
    fn test_operation_from_value() {
        let op = Operation::from_value(json!({"op": "add", "path": "/x", "value": 5})).unwrap();
        assert_eq!(op, Operation::add("/x", json!(5)));

        let missing_value = Operation::from_value(json!({"op": "replace", "path": "/x"}));
        assert!(matches!(missing_value, Err(BridgeError::InvalidOperation(_))));

        let unknown = Operation::from_value(json!({"op": "move", "from": "/a", "path": "/b"}));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_lookup() {
        let doc = json!({"a": {"b": [10, 20]}});
        assert_eq!(lookup(&doc, "/a/b/1").unwrap(), Some(&json!(20)));
        assert_eq!(lookup(&doc, "/a/c").unwrap(), None);
        assert_eq!(lookup(&doc, "").unwrap(), Some(&doc));
    }

    #[test]
    fn test_diff_reproduces_target() {
        let from = json!({
            "players": {"p1": {"hp": 10, "pos": [0, 0]}, "p2": {"hp": 3}},
            "round": 1,
            "log": ["start"],
        });
        let to = json!({
            "players": {"p1": {"hp": 8, "pos": [1, 0]}, "p3": {"hp": 12}},
            "round": 2,
            "log": ["start", "hit"],
            "winner": null,
        });

        let ops = diff(&from, &to);
        assert_eq!(patched(from.clone(), &ops).unwrap(), to);
        assert!(diff(&to, &to).is_empty());
    }

    #[test]
    fn test_diff_type_change_replaces() {
        let ops = diff(&json!({"a": {"b": 1}}), &json!({"a": "flat"}));
        assert_eq!(ops, vec![Operation::replace("/a", json!("flat"))]);

        let ops = diff(&json!(1), &json!({"a": 1}));
        assert_eq!(ops, vec![Operation::replace("", json!({"a": 1}))]);
    }
}
