//! Secondary indexes
//!
//! Indexes map keys to record rids. Ordered kinds answer range cursors;
//! hash and full-text kinds only answer exact-key lookups and full
//! iteration. Composite keys are stored as [`Value::List`] and range
//! bounds compare by prefix, so a one-field bound selects every entry
//! whose first field matches.
//!
//! Cursors are resumable: [`MemoryIndex::next_key`] returns one key group
//! past the last key seen, so a query streams entries without holding the
//! index lock between rows. Integer and float keys compare by numeric value
//! in bounds, so `3` and `3.0` select the same entries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tessera_core::{Error, Record, Result, Rid, Value};
use tracing::debug;

use crate::transaction::RecordChange;

/// One `(key, rid)` pair produced by a cursor
pub type IndexEntry = (Value, Rid);

/// Index algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    Unique,
    NotUnique,
    UniqueHash,
    NotUniqueHash,
    FullText,
}

impl IndexKind {
    /// Supports range cursors
    pub fn is_ordered(self) -> bool {
        matches!(self, IndexKind::Unique | IndexKind::NotUnique)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, IndexKind::Unique | IndexKind::UniqueHash)
    }

    pub fn is_full_text(self) -> bool {
        self == IndexKind::FullText
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub class: String,
    pub fields: Vec<String>,
    pub kind: IndexKind,
    /// Records whose key is null are left out of the index
    pub ignore_nulls: bool,
}

impl IndexDefinition {
    pub fn new<N: Into<String>, C: Into<String>>(
        name: N,
        class: C,
        fields: &[&str],
        kind: IndexKind,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            kind,
            ignore_nulls: false,
        }
    }

    pub fn ignore_nulls(mut self, ignore: bool) -> Self {
        self.ignore_nulls = ignore;
        self
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }

    /// Keys a record contributes; an empty list means a null key
    fn keys_for(&self, record: &Record) -> Vec<Value> {
        let values: Vec<Value> = self
            .fields
            .iter()
            .map(|f| record.get(f).cloned().unwrap_or_default())
            .collect();

        if values.iter().all(Value::is_null) {
            return Vec::new();
        }

        if self.kind.is_full_text() {
            return values
                .iter()
                .filter_map(Value::as_str)
                .flat_map(full_text_words)
                .map(Value::String)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
        }

        if self.is_composite() {
            vec![Value::List(values)]
        } else {
            values
        }
    }
}

/// Split text into lowercase words for full-text keys
pub fn full_text_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Compare one key part with a bound part, integers and floats by value
fn compare_key_part(key: &Value, bound: &Value) -> Ordering {
    match (key, bound) {
        (Value::Integer(k), Value::Float(b)) => (*k as f64).total_cmp(b),
        (Value::Float(k), Value::Integer(b)) => k.total_cmp(&(*b as f64)),
        _ => key.cmp(bound),
    }
}

/// Compare a stored key with a (possibly shorter) bound
pub fn compare_key_prefix(key: &Value, bound: &Value) -> Ordering {
    match (key, bound) {
        (Value::List(key), Value::List(bound)) => {
            for (k, b) in key.iter().zip(bound.iter()) {
                match compare_key_part(k, b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            if key.len() < bound.len() {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        (Value::List(key), bound) => match key.first() {
            Some(first) => compare_key_part(first, bound),
            None => Ordering::Less,
        },
        (key, bound) => compare_key_part(key, bound),
    }
}

/// Smallest value in key order that is numerically equal to `bound`
fn lowest_equal(bound: &Value) -> Value {
    match bound {
        Value::Float(f) if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
            Value::Integer(*f as i64)
        }
        Value::List(parts) => Value::List(parts.iter().map(lowest_equal).collect()),
        other => other.clone(),
    }
}

/// Key interval of a scan. Bounds shorter than a composite key match by
/// prefix; a missing bound is open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyRange {
    pub from: Option<(Value, bool)>,
    pub to: Option<(Value, bool)>,
}

impl KeyRange {
    /// Every non-null key
    pub fn all() -> Self {
        Self::default()
    }

    pub fn exact(key: Value) -> Self {
        Self {
            from: Some((key.clone(), true)),
            to: Some((key, true)),
        }
    }

    pub fn between(from: Value, from_inclusive: bool, to: Value, to_inclusive: bool) -> Self {
        Self {
            from: Some((from, from_inclusive)),
            to: Some((to, to_inclusive)),
        }
    }

    pub fn major(from: Value, inclusive: bool) -> Self {
        Self {
            from: Some((from, inclusive)),
            to: None,
        }
    }

    pub fn minor(to: Value, inclusive: bool) -> Self {
        Self {
            from: None,
            to: Some((to, inclusive)),
        }
    }

    fn is_full(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    fn is_point(&self) -> bool {
        matches!((&self.from, &self.to), (Some((a, true)), Some((b, true))) if a == b)
    }

    fn above_lower(&self, key: &Value) -> bool {
        match &self.from {
            Some((bound, inclusive)) => match compare_key_prefix(key, bound) {
                Ordering::Greater => true,
                Ordering::Equal => *inclusive,
                Ordering::Less => false,
            },
            None => true,
        }
    }

    fn below_upper(&self, key: &Value) -> bool {
        match &self.to {
            Some((bound, inclusive)) => match compare_key_prefix(key, bound) {
                Ordering::Less => true,
                Ordering::Equal => *inclusive,
                Ordering::Greater => false,
            },
            None => true,
        }
    }

    /// Map position at or before the first key of the range
    fn lower_seek(&self) -> Bound<Value> {
        match &self.from {
            Some((bound, _)) => Bound::Included(lowest_equal(bound)),
            None => Bound::Unbounded,
        }
    }

    /// Map position at or after the last key of the range
    fn upper_seek(&self) -> Bound<Value> {
        match &self.to {
            Some((Value::Integer(i), _)) => Bound::Included(Value::Float(*i as f64)),
            Some((Value::Float(f), _)) => Bound::Included(Value::Float(*f)),
            Some((Value::List(_), _)) | None => Bound::Unbounded,
            Some((bound, _)) => Bound::Included(bound.clone()),
        }
    }
}

/// An in-memory index rebuilt from storage on open
#[derive(Debug)]
pub struct MemoryIndex {
    definition: IndexDefinition,
    entries: BTreeMap<Value, BTreeSet<Rid>>,
    nulls: BTreeSet<Rid>,
    usage: AtomicU64,
}

impl MemoryIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            entries: BTreeMap::new(),
            nulls: BTreeSet::new(),
            usage: AtomicU64::new(0),
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn kind(&self) -> IndexKind {
        self.definition.kind
    }

    /// Number of distinct non-null keys
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    /// Total entries, nulls included
    pub fn size(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum::<usize>() + self.nulls.len()
    }

    /// Fail if adding `record` would break uniqueness
    pub fn check_unique(&self, record: &Record) -> Result<()> {
        if !self.definition.kind.is_unique() {
            return Ok(());
        }
        for key in self.definition.keys_for(record) {
            if let Some(rids) = self.entries.get(&key) {
                if rids.iter().any(|rid| *rid != record.rid) {
                    return Err(Error::SchemaViolation(format!(
                        "Duplicate key {:?} in unique index {}",
                        key, self.definition.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn put(&mut self, record: &Record) {
        let keys = self.definition.keys_for(record);
        if keys.is_empty() {
            if !self.definition.ignore_nulls {
                self.nulls.insert(record.rid);
            }
            return;
        }
        for key in keys {
            self.entries.entry(key).or_default().insert(record.rid);
        }
    }

    pub fn remove(&mut self, record: &Record) {
        let keys = self.definition.keys_for(record);
        if keys.is_empty() {
            self.nulls.remove(&record.rid);
            return;
        }
        for key in keys {
            if let Some(rids) = self.entries.get_mut(&key) {
                rids.remove(&record.rid);
                if rids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Count entries fetched through this index
    pub fn record_usage(&self, entries: u64) {
        self.usage.fetch_add(entries, AtomicOrdering::Relaxed);
    }

    pub fn usage_count(&self) -> u64 {
        self.usage.load(AtomicOrdering::Relaxed)
    }

    fn require_ordered(&self, operation: &str) -> Result<()> {
        if self.definition.kind.is_ordered() {
            Ok(())
        } else {
            Err(Error::CommandExecution(format!(
                "Index {} does not support {} cursors",
                self.definition.name, operation
            )))
        }
    }

    /// The key group following `after` in scan direction, or the first one
    /// when `after` is `None`. Ranges other than a point or a full scan need
    /// an ordered index.
    pub fn next_key(
        &self,
        range: &KeyRange,
        after: Option<&Value>,
        ascending: bool,
    ) -> Result<Option<(Value, Vec<Rid>)>> {
        if !range.is_full() && !range.is_point() {
            self.require_ordered("range")?;
        }
        let found = if ascending {
            let start = match after {
                Some(key) => Bound::Excluded(key.clone()),
                None => range.lower_seek(),
            };
            self.entries
                .range((start, Bound::Unbounded))
                .find(|(key, _)| range.above_lower(key))
                .filter(|(key, _)| range.below_upper(key))
        } else {
            let end = match after {
                Some(key) => Bound::Excluded(key.clone()),
                None => range.upper_seek(),
            };
            self.entries
                .range((Bound::Unbounded, end))
                .rev()
                .find(|(key, _)| range.below_upper(key))
                .filter(|(key, _)| range.above_lower(key))
        };
        Ok(found.map(|(key, rids)| {
            let mut rids: Vec<Rid> = rids.iter().copied().collect();
            if !ascending {
                rids.reverse();
            }
            (key.clone(), rids)
        }))
    }

    /// Every entry of `range`, walking it key by key
    pub fn scan(&self, range: &KeyRange, ascending: bool) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut last = None;
        while let Some((key, rids)) = self.next_key(range, last.as_ref(), ascending)? {
            entries.extend(rids.into_iter().map(|rid| (key.clone(), rid)));
            last = Some(key);
        }
        Ok(entries)
    }

    /// Exact-key lookup; works on every index kind
    pub fn get(&self, key: &Value) -> Vec<IndexEntry> {
        let lookup = if self.definition.kind.is_full_text() {
            match key.as_str() {
                Some(text) => Value::String(text.to_lowercase()),
                None => key.clone(),
            }
        } else {
            key.clone()
        };
        self.scan(&KeyRange::exact(lookup), true).unwrap_or_default()
    }

    /// Whether `rid` is stored under exactly `key`
    pub fn contains_entry(&self, key: &Value, rid: Rid) -> bool {
        self.entries.get(key).is_some_and(|rids| rids.contains(&rid))
    }

    /// Rids stored under the null key
    pub fn null_rids(&self) -> Vec<Rid> {
        self.nulls.iter().copied().collect()
    }
}

/// Registry of all indexes of a database
#[derive(Debug, Default)]
pub struct IndexManager {
    indexes: HashMap<String, MemoryIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            indexes: HashMap::new(),
        }
    }

    pub fn create_index(&mut self, definition: IndexDefinition) -> Result<&mut MemoryIndex> {
        let key = definition.name.to_lowercase();
        if self.indexes.contains_key(&key) {
            return Err(Error::IndexAlreadyExists(definition.name));
        }
        debug!("Creating index {} on {}", definition.name, definition.class);
        Ok(self
            .indexes
            .entry(key)
            .or_insert_with(|| MemoryIndex::new(definition)))
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.indexes
            .remove(&name.to_lowercase())
            .map(|_| ())
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&MemoryIndex> {
        self.indexes.get(&name.to_lowercase())
    }

    pub fn definitions(&self) -> Vec<IndexDefinition> {
        let mut defs: Vec<_> = self
            .indexes
            .values()
            .map(|i| i.definition().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Indexes defined on any of the given classes
    pub fn indexes_on(&self, classes: &[String]) -> Vec<&MemoryIndex> {
        let mut found: Vec<&MemoryIndex> = self
            .indexes
            .values()
            .filter(|i| {
                classes
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&i.definition().class))
            })
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    /// Check unique constraints for a set of pending changes
    pub fn validate<F>(&self, changes: &[RecordChange], class_chain: F) -> Result<()>
    where
        F: Fn(&str) -> Vec<String>,
    {
        for change in changes {
            if let Some(after) = &change.after {
                for index in self.indexes_on(&class_chain(&after.class)) {
                    index.check_unique(after)?;
                }
            }
        }
        Ok(())
    }

    /// Apply committed changes to every affected index
    pub fn apply<F>(&mut self, changes: &[RecordChange], class_chain: F)
    where
        F: Fn(&str) -> Vec<String>,
    {
        for change in changes {
            if let Some(before) = &change.before {
                let classes = class_chain(&before.class);
                for index in self.indexes.values_mut() {
                    if classes
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(&index.definition.class))
                    {
                        index.remove(before);
                    }
                }
            }
            if let Some(after) = &change.after {
                let classes = class_chain(&after.class);
                for index in self.indexes.values_mut() {
                    if classes
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(&index.definition.class))
                    {
                        index.put(after);
                    }
                }
            }
        }
    }
}
