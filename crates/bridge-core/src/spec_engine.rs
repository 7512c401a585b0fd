//! Declarative JSON-to-JSON transformation engine
//!
//! A spec is compiled once and applied to every message of a bridge. The
//! bundled [`ChainSpecEngine`] understands a chain of stages:
//!
//! ```text
//! [
//!   { "operation": "shift",   "spec": { "user": { "id": "customer.id", "*": "rest.&" } } },
//!   { "operation": "default", "spec": { "source": "bridge" } },
//!   { "operation": "remove",  "spec": { "rest": { "password": "" } } }
//! ]
//! ```
//!
//! - `shift` walks the input alongside the spec. Spec keys match input keys
//!   literally, `*` matches any key. Leaf strings (or arrays of strings) are
//!   dotted output paths; `&` and `&N` are replaced by the key matched at the
//!   current level or `N` levels up.
//! - `default` adds keys that are absent, recursing into objects.
//! - `remove` drops keys whose spec value is a string and recurses into
//!   objects. `*` matches any key.

use crate::error::{BridgeError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Engine able to compile a declarative spec
pub trait TransformEngine: Send + Sync {
    /// Compile a spec, failing with [`BridgeError::Spec`] when it is invalid
    fn compile(&self, spec: &Value) -> Result<Arc<dyn CompiledSpec>>;
}

/// A compiled spec ready to be applied
pub trait CompiledSpec: Send + Sync + Debug {
    /// Apply to a document. `None` means the spec produced no output.
    fn apply(&self, input: Value) -> Option<Value>;
}

// ============================================================================
// Chain engine
// ============================================================================

/// Engine for `shift` / `default` / `remove` stage chains
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainSpecEngine;

impl TransformEngine for ChainSpecEngine {
    fn compile(&self, spec: &Value) -> Result<Arc<dyn CompiledSpec>> {
        let stages = match spec {
            Value::Array(items) => items.iter().map(compile_stage).collect::<Result<Vec<_>>>()?,
            Value::Object(_) => vec![compile_stage(spec)?],
            other => {
                return Err(BridgeError::spec(format!(
                    "spec must be an array of stages, got {}",
                    type_name(other)
                )))
            }
        };
        Ok(Arc::new(Chain { stages }))
    }
}

#[derive(Debug)]
struct Chain {
    stages: Vec<Stage>,
}

impl CompiledSpec for Chain {
    fn apply(&self, input: Value) -> Option<Value> {
        self.stages
            .iter()
            .try_fold(input, |doc, stage| stage.apply(doc))
    }
}

#[derive(Debug)]
enum Stage {
    Shift(ShiftNode),
    Default(Map<String, Value>),
    Remove(RemoveNode),
}

impl Stage {
    fn apply(&self, doc: Value) -> Option<Value> {
        match self {
            Self::Shift(node) => {
                if !doc.is_object() && !doc.is_array() {
                    return None;
                }
                let mut out = Map::new();
                let mut keys = Vec::new();
                shift(node, &doc, &mut keys, &mut out);
                Some(Value::Object(out))
            }
            Self::Default(defaults) => match doc {
                Value::Null => Some(Value::Object(defaults.clone())),
                Value::Object(mut map) => {
                    apply_defaults(&mut map, defaults);
                    Some(Value::Object(map))
                }
                other => Some(other),
            },
            Self::Remove(node) => {
                let mut doc = doc;
                remove(node, &mut doc);
                Some(doc)
            }
        }
    }
}

fn compile_stage(stage: &Value) -> Result<Stage> {
    let stage = stage
        .as_object()
        .ok_or_else(|| BridgeError::spec("each stage must be an object"))?;

    let operation = stage
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::spec("stage is missing its 'operation'"))?;

    let spec = stage
        .get("spec")
        .and_then(Value::as_object)
        .ok_or_else(|| BridgeError::spec(format!("'{operation}' stage needs an object 'spec'")))?;

    match operation {
        "shift" => Ok(Stage::Shift(compile_shift(spec, 1)?)),
        "default" => Ok(Stage::Default(spec.clone())),
        "remove" => Ok(Stage::Remove(compile_remove(spec)?)),
        other => Err(BridgeError::spec(format!("unknown operation '{other}'"))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Shift
// ============================================================================

#[derive(Debug, Default)]
struct ShiftNode {
    literals: HashMap<String, ShiftAction>,
    wildcard: Option<Box<ShiftAction>>,
}

#[derive(Debug)]
enum ShiftAction {
    Write(Vec<OutputPath>),
    Descend(ShiftNode),
}

#[derive(Debug)]
struct OutputPath(Vec<Vec<PathPart>>);

#[derive(Debug)]
enum PathPart {
    Literal(String),
    /// Key matched this many levels up
    Key(usize),
}

fn compile_shift(spec: &Map<String, Value>, depth: usize) -> Result<ShiftNode> {
    let mut node = ShiftNode::default();
    for (key, value) in spec {
        let action = match value {
            Value::String(path) => ShiftAction::Write(vec![compile_path(path, depth)?]),
            Value::Array(paths) => ShiftAction::Write(
                paths
                    .iter()
                    .map(|p| {
                        p.as_str()
                            .ok_or_else(|| BridgeError::spec(format!("output paths under '{key}' must be strings")))
                            .and_then(|p| compile_path(p, depth))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(child) => ShiftAction::Descend(compile_shift(child, depth + 1)?),
            other => {
                return Err(BridgeError::spec(format!(
                    "shift value for '{key}' cannot be a {}",
                    type_name(other)
                )))
            }
        };

        if key == "*" {
            node.wildcard = Some(Box::new(action));
        } else {
            node.literals.insert(key.clone(), action);
        }
    }
    Ok(node)
}

fn compile_path(path: &str, depth: usize) -> Result<OutputPath> {
    let mut segments = Vec::new();
    for segment in path.split('.') {
        if segment.is_empty() {
            return Err(BridgeError::spec(format!("malformed output path '{path}'")));
        }

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = segment.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '&' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                parts.push(PathPart::Literal(std::mem::take(&mut literal)));
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let up = if digits.is_empty() {
                0
            } else {
                digits
                    .parse::<usize>()
                    .map_err(|_| BridgeError::spec(format!("malformed output path '{path}'")))?
            };
            if up >= depth {
                return Err(BridgeError::spec(format!(
                    "'&{up}' in '{path}' refers above the top of the spec"
                )));
            }
            parts.push(PathPart::Key(up));
        }
        if !literal.is_empty() {
            parts.push(PathPart::Literal(literal));
        }
        segments.push(parts);
    }
    Ok(OutputPath(segments))
}

impl OutputPath {
    fn render(&self, keys: &[String]) -> Vec<String> {
        self.0
            .iter()
            .map(|parts| {
                parts
                    .iter()
                    .map(|part| match part {
                        PathPart::Literal(s) => s.as_str(),
                        PathPart::Key(up) => keys
                            .len()
                            .checked_sub(up + 1)
                            .and_then(|i| keys.get(i))
                            .map(String::as_str)
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .collect()
    }
}

fn shift(node: &ShiftNode, input: &Value, keys: &mut Vec<String>, out: &mut Map<String, Value>) {
    let entries: Vec<(String, &Value)> = match input {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect(),
        _ => return,
    };

    for (key, value) in entries {
        let Some(action) = node.literals.get(&key).or(node.wildcard.as_deref()) else {
            continue;
        };
        keys.push(key);
        match action {
            ShiftAction::Write(paths) => {
                for path in paths {
                    write_at(out, &path.render(keys), value.clone());
                }
            }
            ShiftAction::Descend(child) => shift(child, value, keys, out),
        }
        keys.pop();
    }
}

/// Write a value at a dotted path, collecting repeated writes into an array
fn write_at(out: &mut Map<String, Value>, segments: &[String], value: Value) {
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut current = out;
    for segment in parents {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        match slot {
            Value::Object(map) => current = map,
            _ => return,
        }
    }

    if !current.contains_key(leaf) {
        current.insert(leaf.clone(), value);
        return;
    }
    match current.get_mut(leaf) {
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {}
    }
}

// ============================================================================
// Default
// ============================================================================

fn apply_defaults(doc: &mut Map<String, Value>, defaults: &Map<String, Value>) {
    for (key, default) in defaults {
        if !doc.contains_key(key) {
            doc.insert(key.clone(), default.clone());
            continue;
        }
        if let (Some(Value::Object(existing)), Value::Object(nested)) = (doc.get_mut(key), default) {
            apply_defaults(existing, nested);
        }
    }
}

// ============================================================================
// Remove
// ============================================================================

#[derive(Debug, Default)]
struct RemoveNode {
    rules: Vec<(String, RemoveAction)>,
}

#[derive(Debug)]
enum RemoveAction {
    Drop,
    Descend(RemoveNode),
}

fn compile_remove(spec: &Map<String, Value>) -> Result<RemoveNode> {
    let mut node = RemoveNode::default();
    for (key, value) in spec {
        let action = match value {
            Value::String(_) => RemoveAction::Drop,
            Value::Object(child) => RemoveAction::Descend(compile_remove(child)?),
            other => {
                return Err(BridgeError::spec(format!(
                    "remove value for '{key}' cannot be a {}",
                    type_name(other)
                )))
            }
        };
        node.rules.push((key.clone(), action));
    }
    Ok(node)
}

fn remove(node: &RemoveNode, doc: &mut Value) {
    match doc {
        Value::Array(items) => items.iter_mut().for_each(|item| remove(node, item)),
        Value::Object(map) => {
            for (key, action) in &node.rules {
                match (key.as_str(), action) {
                    ("*", RemoveAction::Drop) => map.clear(),
                    ("*", RemoveAction::Descend(child)) => {
                        map.values_mut().for_each(|v| remove(child, v))
                    }
                    (key, RemoveAction::Drop) => {
                        map.shift_remove(key);
                    }
                    (key, RemoveAction::Descend(child)) => {
                        if let Some(v) = map.get_mut(key) {
                            remove(child, v);
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(spec: Value, input: Value) -> Option<Value> {
        ChainSpecEngine.compile(&spec).unwrap().apply(input)
    }

    #[test]
    fn test_shift_renames_and_nests() {
        let out = run(
            json!([{"operation": "shift", "spec": {"id": "order.id", "total": ["order.amount", "amount"]}}]),
            json!({"id": 7, "total": 12.5, "secret": "x"}),
        );
        assert_eq!(
            out,
            Some(json!({"order": {"id": 7, "amount": 12.5}, "amount": 12.5}))
        );
    }

    #[test]
    fn test_shift_wildcard_with_key_references() {
        let out = run(
            json!({"operation": "shift", "spec": {"rates": {"*": "prices.&1_&"}}}),
            json!({"rates": {"aud": 1, "usd": 2}}),
        );
        assert_eq!(out, Some(json!({"prices": {"rates_aud": 1, "rates_usd": 2}})));
    }

    #[test]
    fn test_shift_literal_wins_over_wildcard() {
        let out = run(
            json!([{"operation": "shift", "spec": {"a": "first", "*": "others.&"}}]),
            json!({"a": 1, "b": 2}),
        );
        assert_eq!(out, Some(json!({"first": 1, "others": {"b": 2}})));
    }

    #[test]
    fn test_shift_of_scalar_yields_nothing() {
        assert_eq!(run(json!([{"operation": "shift", "spec": {"a": "b"}}]), json!(5)), None);
    }

    #[test]
    fn test_default_and_remove() {
        let out = run(
            json!([
                {"operation": "default", "spec": {"meta": {"source": "bridge", "v": 1}}},
                {"operation": "remove", "spec": {"meta": {"v": ""}, "password": ""}}
            ]),
            json!({"meta": {"v": 2}, "password": "hunter2", "name": "n"}),
        );
        assert_eq!(out, Some(json!({"meta": {"source": "bridge"}, "name": "n"})));
    }

    #[test]
    fn test_invalid_specs_fail_to_compile() {
        let bad = [
            json!("shift"),
            json!([{"operation": "explode", "spec": {}}]),
            json!([{"operation": "shift"}]),
            json!([{"operation": "shift", "spec": {"a": 1}}]),
            json!([{"operation": "shift", "spec": {"a": "x..y"}}]),
            json!([{"operation": "shift", "spec": {"a": "&3"}}]),
            json!([{"operation": "remove", "spec": {"a": true}}]),
        ];
        for spec in bad {
            let err = ChainSpecEngine.compile(&spec).unwrap_err();
            assert!(matches!(err, BridgeError::Spec { .. }), "{spec} compiled");
        }
    }
}
