//! Structured record model.
//!
//! Records are JSON documents checked once at the boundary: they must be
//! objects carrying a string `resourceType`. Inside the engine every aspect
//! works against this checked form.

use crate::core::error::RecordError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One structured healthcare record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Record {
    document: Value,
}

impl Record {
    /// Check and wrap a JSON document.
    pub fn new(document: Value) -> Result<Self, RecordError> {
        let object = document.as_object().ok_or(RecordError::NotAnObject)?;
        match object.get("resourceType") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => Ok(Self { document }),
            Some(_) => Err(RecordError::InvalidResourceType),
            None => Err(RecordError::MissingResourceType),
        }
    }

    /// Parse a record from JSON text.
    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        let document: Value =
            serde_json::from_str(text).map_err(|e| RecordError::Parse(e.to_string()))?;
        Self::new(document)
    }

    /// The record type tag.
    pub fn resource_type(&self) -> &str {
        self.document
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// The record id, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.document.get("id").and_then(Value::as_str)
    }

    /// The underlying document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Whether a top-level field is present and not null.
    pub fn has_field(&self, name: &str) -> bool {
        matches!(self.document.get(name), Some(v) if !v.is_null())
    }

    /// Resolve a path to a single value.
    ///
    /// Segments are separated by `.`; an index may follow a segment as in
    /// `name[0].given`. Without an index, arrays are not traversed.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        get_path(&self.document, path)
    }

    /// Resolve a path to every matching value, flattening arrays on the way.
    pub fn select(&self, path: &str) -> Vec<&Value> {
        select(&self.document, path)
    }

    /// Contained records declared under `contained`.
    pub fn contained(&self) -> Vec<&Value> {
        self.document
            .get("contained")
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default()
    }
}

impl TryFrom<Value> for Record {
    type Error = RecordError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Record::new(value)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.document
    }
}

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment<'p> {
    name: &'p str,
    index: Option<usize>,
}

fn parse_segments(path: &str) -> Vec<Segment<'_>> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|raw| match raw.find('[') {
            Some(open) if raw.ends_with(']') => Segment {
                name: &raw[..open],
                index: raw[open + 1..raw.len() - 1].parse().ok(),
            },
            _ => Segment { name: raw, index: None },
        })
        .collect()
}

/// Resolve a path against any JSON value.
pub fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = root;
    for segment in parse_segments(path) {
        current = current.get(segment.name)?;
        if let Some(index) = segment.index {
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// Resolve a path against any JSON value, flattening arrays.
pub fn select<'v>(root: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut current: Vec<&Value> = vec![root];
    for segment in parse_segments(path) {
        let mut next = Vec::new();
        for value in current {
            let candidates: Vec<&Value> = match value {
                Value::Array(items) => items.iter().filter_map(|v| v.get(segment.name)).collect(),
                other => other.get(segment.name).into_iter().collect(),
            };
            for candidate in candidates {
                match (segment.index, candidate) {
                    (Some(i), Value::Array(items)) => next.extend(items.get(i)),
                    (Some(_), _) => {}
                    (None, Value::Array(items)) => next.extend(items.iter()),
                    (None, v) => next.push(v),
                }
            }
        }
        current = next;
    }
    current.into_iter().filter(|v| !v.is_null()).collect()
}

/// Visit every object in a document with its dotted path.
pub fn walk_objects<'v, F>(root: &'v Value, visit: &mut F)
where
    F: FnMut(&str, &'v Map<String, Value>),
{
    fn inner<'v, F>(value: &'v Value, path: &mut String, visit: &mut F)
    where
        F: FnMut(&str, &'v Map<String, Value>),
    {
        match value {
            Value::Object(map) => {
                visit(path, map);
                for (key, child) in map {
                    let len = path.len();
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(key);
                    inner(child, path, visit);
                    path.truncate(len);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{}]", i));
                    inner(child, path, visit);
                    path.truncate(len);
                }
            }
            _ => {}
        }
    }

    let mut path = String::new();
    inner(root, &mut path, visit);
}
