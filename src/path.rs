//! Dependency path expressions.
//!
//! A path names a store property and optionally walks into it:
//! `"todos"`, `"user.address.city"`, `"todos.0.title"`. The last segment may be
//! a method-style projection, which is kept whole even if its argument contains
//! dots: `"todos.map(meta.done)"`, `"todos.filter(done)"`, `"users.keys()"`,
//! `"users.values()"`, `"todos.len()"`.

use crate::error::{Result, StoreError};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

/// Trailing projection applied after the field walk
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Method {
    /// Select a (dotted) field of every entry
    Map(Vec<String>),
    /// Keep the entries whose (dotted) field is truthy
    Filter(Vec<String>),
    Keys,
    Values,
    Len,
}

/// Parsed dependency path
#[derive(Clone, PartialEq, Eq)]
pub struct DependencyPath {
    source: Rc<str>,
    root: Rc<str>,
    fields: Vec<String>,
    method: Option<Method>,
}

impl DependencyPath {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason| StoreError::InvalidPath {
            path: source.into(),
            reason,
        };

        let segments = split_top_level(source).ok_or_else(|| invalid("unbalanced parentheses"))?;
        let count = segments.len();
        let mut fields = Vec::with_capacity(count);
        let mut method = None;

        for (position, segment) in segments.into_iter().enumerate() {
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            match segment.find('(') {
                None if segment.contains(')') => return Err(invalid("unbalanced parentheses")),
                None => fields.push(segment.to_owned()),
                Some(open) => {
                    if position == 0 {
                        return Err(invalid("path must start with a property name"));
                    }
                    if position + 1 != count {
                        return Err(invalid("method must be the last segment"));
                    }
                    let Some(args) = segment[open + 1..].strip_suffix(')') else {
                        return Err(invalid("unbalanced parentheses"));
                    };
                    method = Some(parse_method(&segment[..open], args.trim()).map_err(invalid)?);
                }
            }
        }

        let mut fields = fields.into_iter();
        let root = fields.next().ok_or_else(|| invalid("empty path"))?;
        Ok(DependencyPath {
            source: source.into(),
            root: root.into(),
            fields: fields.collect(),
            method,
        })
    }

    /// The store property the path starts at
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Walk `root_value` (the value of [`root`](Self::root)) along the path
    ///
    /// Missing fields evaluate to `null` rather than failing.
    pub fn apply(&self, root_value: &Value) -> Value {
        let mut current = root_value;
        for field in &self.fields {
            match lookup(current, field) {
                Some(next) => current = next,
                None => return Value::Null,
            }
        }
        match &self.method {
            None => current.clone(),
            Some(method) => project(current, method),
        }
    }
}

impl fmt::Debug for DependencyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DependencyPath({:?})", self.source)
    }
}

impl fmt::Display for DependencyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn split_top_level(source: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (index, ch) in source.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1)?,
            '.' if depth == 0 => {
                segments.push(source[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return None;
    }
    segments.push(source[start..].trim());
    Some(segments)
}

fn parse_method(name: &str, args: &str) -> std::result::Result<Method, &'static str> {
    let no_args = |method| {
        if args.is_empty() {
            Ok(method)
        } else {
            Err("method takes no arguments")
        }
    };
    let field_args = || {
        let fields: Vec<String> = args.split('.').map(|f| f.trim().to_owned()).collect();
        if fields.iter().any(String::is_empty) {
            Err("method expects a field path")
        } else {
            Ok(fields)
        }
    };
    match name.trim() {
        "map" => field_args().map(Method::Map),
        "filter" => field_args().map(Method::Filter),
        "keys" => no_args(Method::Keys),
        "values" => no_args(Method::Values),
        "len" | "length" => no_args(Method::Len),
        _ => Err("unknown method"),
    }
}

fn lookup<'v>(value: &'v Value, field: &str) -> Option<&'v Value> {
    match value {
        Value::Object(map) => map.get(field),
        Value::Array(items) => field.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    }
}

fn lookup_path<'v>(value: &'v Value, fields: &[String]) -> &'v Value {
    fields
        .iter()
        .try_fold(value, |current, field| lookup(current, field))
        .unwrap_or(&Value::Null)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn project(value: &Value, method: &Method) -> Value {
    match (method, value) {
        (Method::Map(fields), Value::Array(items)) => items
            .iter()
            .map(|item| lookup_path(item, fields).clone())
            .collect(),
        (Method::Map(fields), Value::Object(map)) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), lookup_path(item, fields).clone()))
                .collect(),
        ),
        (Method::Filter(fields), Value::Array(items)) => items
            .iter()
            .filter(|item| truthy(lookup_path(item, fields)))
            .cloned()
            .collect(),
        (Method::Filter(fields), Value::Object(map)) => Value::Object(
            map.iter()
                .filter(|(_, item)| truthy(lookup_path(item, fields)))
                .map(|(key, item)| (key.clone(), item.clone()))
                .collect::<Map<_, _>>(),
        ),
        (Method::Keys, Value::Object(map)) => map.keys().cloned().map(Value::String).collect(),
        (Method::Keys, Value::Array(items)) => (0..items.len()).map(Value::from).collect(),
        (Method::Values, Value::Object(map)) => map.values().cloned().collect(),
        (Method::Values, Value::Array(items)) => Value::Array(items.clone()),
        (Method::Len, Value::Array(items)) => items.len().into(),
        (Method::Len, Value::Object(map)) => map.len().into(),
        (Method::Len, Value::String(s)) => s.chars().count().into(),
        _ => Value::Null,
    }
}
