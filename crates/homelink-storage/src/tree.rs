//! Operations on a JSON value tree addressed by [`StorePath`].
//!
//! Null values and empty objects do not exist in the tree: setting a node
//! to `null` removes it, and a parent left without children is removed too.

use homelink_core::StorePath;
use serde_json::{Map, Value};

/// Value at `path`, if present.
pub fn get<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.as_object()?.get(segment)?;
    }
    if is_empty(node) {
        None
    } else {
        Some(node)
    }
}

/// Replace the value at `path`. `Value::Null` removes the node.
pub fn set(root: &mut Value, path: &StorePath, value: Value) {
    if is_empty(&value) {
        remove(root, path.segments());
        return;
    }
    let mut node = root;
    for segment in path.segments() {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    *node = value;
}

/// Merge `children` into the object at `path`.
pub fn merge_children(root: &mut Value, path: &StorePath, children: Map<String, Value>) {
    for (key, value) in children {
        set(root, &path.child(&key), value);
    }
}

/// Leaves of `value` as `(absolute path, leaf value)` pairs.
///
/// Arrays are stored as single leaves.
pub fn flatten(path: &StorePath, value: &Value) -> Vec<(StorePath, Value)> {
    let mut leaves = Vec::new();
    collect_leaves(path, value, &mut leaves);
    leaves
}

fn collect_leaves(path: &StorePath, value: &Value, out: &mut Vec<(StorePath, Value)>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                collect_leaves(&path.child(key), child, out);
            }
        }
        leaf => out.push((path.clone(), leaf.clone())),
    }
}

/// Rebuild the subtree under `base` from absolute leaves.
pub fn assemble<I>(base: &StorePath, leaves: I) -> Option<Value>
where
    I: IntoIterator<Item = (StorePath, Value)>,
{
    let mut root = Value::Null;
    let depth = base.segments().len();
    for (path, value) in leaves {
        if !path.starts_with(base) {
            continue;
        }
        let relative = StorePath::new(&path.segments()[depth..].join("/"));
        set(&mut root, &relative, value);
    }
    if is_empty(&root) {
        None
    } else {
        Some(root)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn remove(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::Null;
        return;
    };
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.remove(head);
        } else if let Some(child) = map.get_mut(head) {
            remove(child, rest);
            if is_empty(child) {
                map.remove(head);
            }
        }
    }
}
