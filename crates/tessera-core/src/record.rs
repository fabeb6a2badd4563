//! Stored records and graph directions

use crate::id::Rid;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Field name holding the source vertex of an edge
pub const EDGE_OUT: &str = "out";
/// Field name holding the target vertex of an edge
pub const EDGE_IN: &str = "in";

/// Direction of an edge traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Follow edges leaving the vertex
    Outgoing,
    /// Follow edges entering the vertex
    Incoming,
    /// Both directions
    Both,
}

impl Direction {
    /// Returns the opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
            Direction::Both => Direction::Both,
        }
    }

    /// Prefix of the vertex field holding edge links in this direction
    pub fn field_prefix(self) -> &'static str {
        match self {
            Direction::Outgoing => "out_",
            Direction::Incoming => "in_",
            Direction::Both => "",
        }
    }
}

/// What kind of element a record is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Vertex,
    Edge,
    Document,
}

/// Insertion-ordered field collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fields {
    inner: IndexMap<String, Value>,
}

impl Fields {
    pub fn new() -> Self {
        Self {
            inner: IndexMap::new(),
        }
    }

    /// Create with a single field
    pub fn with<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        let mut fields = Self::new();
        fields.set(key, value);
        fields
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.inner.get_mut(key)
    }

    /// Remove a field, keeping the order of the remaining ones
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.inner.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    /// Merge with another field collection (other takes precedence)
    pub fn merge(&mut self, other: Fields) {
        self.inner.extend(other.inner);
    }

    pub fn into_inner(self) -> IndexMap<String, Value> {
        self.inner
    }
}

impl IntoIterator for Fields {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl FromIterator<(String, Value)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

/// A stored record: vertex, edge or plain document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Persistent identity
    pub rid: Rid,

    /// Class the record belongs to
    pub class: String,

    /// Element kind
    pub kind: RecordKind,

    /// User fields
    pub fields: Fields,

    /// Version incremented on every save
    pub version: u32,
}

impl Record {
    /// Create a record that has not been saved yet
    pub fn new<S: Into<String>>(class: S, kind: RecordKind) -> Self {
        Self {
            rid: Rid::temporary(),
            class: class.into(),
            kind,
            fields: Fields::new(),
            version: 0,
        }
    }

    pub fn with_fields<S: Into<String>>(class: S, kind: RecordKind, fields: Fields) -> Self {
        Self {
            fields,
            ..Self::new(class, kind)
        }
    }

    pub fn is_vertex(&self) -> bool {
        self.kind == RecordKind::Vertex
    }

    pub fn is_edge(&self) -> bool {
        self.kind == RecordKind::Edge
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.fields.set(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Field lookup including the `@rid`, `@class` and `@version` attributes
    pub fn attribute(&self, name: &str) -> Value {
        match name {
            "@rid" => Value::Link(self.rid),
            "@class" => Value::String(self.class.clone()),
            "@version" => Value::Integer(self.version as i64),
            _ => self.fields.get(name).cloned().unwrap_or_default(),
        }
    }

    /// Source vertex of an edge
    pub fn edge_out(&self) -> Option<Rid> {
        self.fields.get(EDGE_OUT).and_then(Value::as_link)
    }

    /// Target vertex of an edge
    pub fn edge_in(&self) -> Option<Rid> {
        self.fields.get(EDGE_IN).and_then(Value::as_link)
    }

    /// Edge links stored on a vertex for one direction, with the edge
    /// class each field refers to
    pub fn edge_fields(&self, direction: Direction) -> Vec<(&str, &Value)> {
        let prefixes: &[&str] = match direction {
            Direction::Both => &["out_", "in_"],
            Direction::Outgoing => &["out_"],
            Direction::Incoming => &["in_"],
        };
        self.fields
            .iter()
            .filter_map(|(name, value)| {
                prefixes
                    .iter()
                    .find_map(|p| name.strip_prefix(p))
                    .map(|class| (class, value))
            })
            .collect()
    }
}
