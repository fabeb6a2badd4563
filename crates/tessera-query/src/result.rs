//! Result rows
//!
//! A row is either a view over a stored element or a detached projection.
//! Mutation statements wrap elements in an updatable variant that keeps the
//! record as it was before the statement touched it.

use indexmap::IndexMap;
use std::collections::BTreeMap;
use tessera_core::{Error, Record, Result, Rid, Value};

/// Element with the snapshot taken before mutation
#[derive(Debug, Clone, PartialEq)]
pub struct Updatable {
    pub current: Record,
    pub previous: Option<Record>,
}

/// Row payload
#[derive(Debug, Clone, PartialEq)]
pub enum RowContent {
    Element(Record),
    Projection(IndexMap<String, Value>),
    Updatable(Updatable),
}

/// One row of query output
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    content: RowContent,
    metadata: IndexMap<String, Value>,
}

/// Identity used by DISTINCT: persistent elements compare by rid,
/// everything else structurally
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DistinctKey {
    Identity(Rid),
    Values(Vec<(String, Value)>),
}

impl Default for Row {
    fn default() -> Self {
        Self::new()
    }
}

impl Row {
    /// An empty projection
    pub fn new() -> Self {
        Self::projection(IndexMap::new())
    }

    pub fn element(record: Record) -> Self {
        Self {
            content: RowContent::Element(record),
            metadata: IndexMap::new(),
        }
    }

    pub fn projection(values: IndexMap<String, Value>) -> Self {
        Self {
            content: RowContent::Projection(values),
            metadata: IndexMap::new(),
        }
    }

    /// Projection with a single property
    pub fn with<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        let mut row = Self::new();
        row.set_property(key, value);
        row
    }

    pub fn updatable(record: Record) -> Self {
        Self {
            content: RowContent::Updatable(Updatable {
                current: record,
                previous: None,
            }),
            metadata: IndexMap::new(),
        }
    }

    pub fn content(&self) -> &RowContent {
        &self.content
    }

    pub fn into_content(self) -> RowContent {
        self.content
    }

    pub fn is_element(&self) -> bool {
        !matches!(self.content, RowContent::Projection(_))
    }

    pub fn is_projection(&self) -> bool {
        matches!(self.content, RowContent::Projection(_))
    }

    pub fn as_element(&self) -> Option<&Record> {
        match &self.content {
            RowContent::Element(record) => Some(record),
            RowContent::Updatable(u) => Some(&u.current),
            RowContent::Projection(_) => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Record> {
        match &mut self.content {
            RowContent::Element(record) => Some(record),
            RowContent::Updatable(u) => Some(&mut u.current),
            RowContent::Projection(_) => None,
        }
    }

    /// The element, or a type mismatch for projections
    pub fn require_element(&self) -> Result<&Record> {
        self.as_element().ok_or_else(|| Error::TypeMismatch {
            expected: "element".to_string(),
            found: "projection".to_string(),
        })
    }

    pub fn into_element(self) -> Option<Record> {
        match self.content {
            RowContent::Element(record) => Some(record),
            RowContent::Updatable(u) => Some(u.current),
            RowContent::Projection(_) => None,
        }
    }

    pub fn as_updatable(&self) -> Option<&Updatable> {
        match &self.content {
            RowContent::Updatable(u) => Some(u),
            _ => None,
        }
    }

    /// Turn an element row into an updatable one; projections are rejected
    pub fn into_updatable(self) -> Result<Row> {
        let metadata = self.metadata;
        let content = match self.content {
            RowContent::Element(record) => RowContent::Updatable(Updatable {
                current: record,
                previous: None,
            }),
            updatable @ RowContent::Updatable(_) => updatable,
            RowContent::Projection(_) => {
                return Err(Error::CommandExecution(
                    "Cannot update a projection row".to_string(),
                ));
            }
        };
        Ok(Row { content, metadata })
    }

    /// Record the pre-mutation snapshot
    pub fn set_previous(&mut self, previous: Record) {
        if let RowContent::Updatable(u) = &mut self.content {
            u.previous = Some(previous);
        }
    }

    /// The snapshot taken before mutation, as an element row
    pub fn unwrap_previous(self) -> Result<Row> {
        match self.content {
            RowContent::Updatable(Updatable {
                previous: Some(previous),
                ..
            }) => Ok(Row::element(previous)),
            RowContent::Updatable(Updatable { current, .. }) => Err(Error::IllegalState(format!(
                "No previous value recorded for {}",
                current.rid
            ))),
            _ => Err(Error::IllegalState("Row is not updatable".to_string())),
        }
    }

    pub fn rid(&self) -> Option<Rid> {
        self.as_element().map(|r| r.rid)
    }

    /// Property by name; `@rid`, `@class` and `@version` resolve on elements
    pub fn property(&self, name: &str) -> Value {
        match &self.content {
            RowContent::Projection(values) => values.get(name).cloned().unwrap_or_default(),
            _ => self
                .as_element()
                .map(|r| r.attribute(name))
                .unwrap_or_default(),
        }
    }

    pub fn has_property(&self, name: &str) -> bool {
        match &self.content {
            RowContent::Projection(values) => values.contains_key(name),
            _ => self
                .as_element()
                .is_some_and(|r| r.fields.contains(name) || name.starts_with('@')),
        }
    }

    pub fn set_property<K: Into<String>, V: Into<Value>>(&mut self, name: K, value: V) {
        match &mut self.content {
            RowContent::Projection(values) => {
                values.insert(name.into(), value.into());
            }
            RowContent::Element(record) => record.set(name, value),
            RowContent::Updatable(u) => u.current.set(name, value),
        }
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Value> {
        match &mut self.content {
            RowContent::Projection(values) => values.shift_remove(name),
            RowContent::Element(record) => record.remove(name),
            RowContent::Updatable(u) => u.current.remove(name),
        }
    }

    pub fn property_names(&self) -> Vec<String> {
        match &self.content {
            RowContent::Projection(values) => values.keys().cloned().collect(),
            _ => self
                .as_element()
                .map(|r| r.fields.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Side metadata such as `$depth`, not visible as a property
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn remove_metadata(&mut self, key: &str) -> Option<Value> {
        self.metadata.shift_remove(key)
    }

    pub fn distinct_key(&self) -> DistinctKey {
        match self.as_element() {
            Some(record) if record.rid.is_persistent() => DistinctKey::Identity(record.rid),
            Some(record) => DistinctKey::Values(
                record.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            ),
            None => match &self.content {
                RowContent::Projection(values) => DistinctKey::Values(
                    values.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ),
                _ => DistinctKey::Values(Vec::new()),
            },
        }
    }

    /// The row as a value: elements become links, projections maps
    pub fn to_value(&self) -> Value {
        match (&self.content, self.rid()) {
            (RowContent::Projection(values), _) => Value::Map(
                values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            (_, Some(rid)) if rid.is_persistent() => Value::Link(rid),
            _ => Value::Map(
                self.as_element()
                    .map(|r| r.fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            ),
        }
    }

    /// JSON rendering for callers and tooling
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        if let Some(record) = self.as_element() {
            object.insert("@rid".to_string(), Value::Link(record.rid).to_json());
            object.insert("@class".to_string(), serde_json::Value::String(record.class.clone()));
            for (k, v) in record.fields.iter() {
                object.insert(k.clone(), v.to_json());
            }
        } else if let RowContent::Projection(values) = &self.content {
            for (k, v) in values {
                object.insert(k.clone(), v.to_json());
            }
        }
        serde_json::Value::Object(object)
    }
}

impl From<Record> for Row {
    fn from(record: Record) -> Self {
        Row::element(record)
    }
}
