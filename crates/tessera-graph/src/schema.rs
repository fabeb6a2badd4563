//! Class hierarchy and cluster mapping
//!
//! Every class owns one cluster. `V` and `E` are the root vertex and edge
//! classes; a class is a vertex (edge) class when it descends from `V`
//! (`E`). Class names are matched case-insensitively.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tessera_core::{ClusterId, Error, RecordKind, Result};

/// Root class of all vertices
pub const VERTEX_CLASS: &str = "V";
/// Root class of all edges
pub const EDGE_CLASS: &str = "E";

/// A class definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaClass {
    pub name: String,
    pub superclasses: Vec<String>,
    pub cluster: ClusterId,
    pub cluster_name: String,
}

/// All classes of a database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    classes: BTreeMap<String, SchemaClass>,
    clusters: HashMap<ClusterId, String>,
    next_cluster: ClusterId,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// A schema holding only the `V` and `E` root classes
    pub fn new() -> Self {
        let mut schema = Self {
            classes: BTreeMap::new(),
            clusters: HashMap::new(),
            next_cluster: 1,
        };
        schema.insert_class(VERTEX_CLASS, Vec::new());
        schema.insert_class(EDGE_CLASS, Vec::new());
        schema
    }

    fn insert_class(&mut self, name: &str, superclasses: Vec<String>) -> &SchemaClass {
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        let class = SchemaClass {
            name: name.to_string(),
            superclasses,
            cluster,
            cluster_name: name.to_lowercase(),
        };
        self.clusters.insert(cluster, name.to_lowercase());
        self.classes.entry(name.to_lowercase()).or_insert(class)
    }

    /// Define a class below the given superclasses
    pub fn create_class(&mut self, name: &str, superclasses: &[&str]) -> Result<&SchemaClass> {
        if self.classes.contains_key(&name.to_lowercase()) {
            return Err(Error::ClassAlreadyExists(name.to_string()));
        }
        let mut supers = Vec::with_capacity(superclasses.len());
        for parent in superclasses {
            supers.push(self.require_class(parent)?.name.clone());
        }
        Ok(self.insert_class(name, supers))
    }

    pub fn get_class(&self, name: &str) -> Option<&SchemaClass> {
        self.classes.get(&name.to_lowercase())
    }

    pub fn require_class(&self, name: &str) -> Result<&SchemaClass> {
        self.get_class(name)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    pub fn exists_class(&self, name: &str) -> bool {
        self.get_class(name).is_some()
    }

    pub fn classes(&self) -> impl Iterator<Item = &SchemaClass> {
        self.classes.values()
    }

    /// The class itself followed by every ancestor
    pub fn superclass_chain(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(class) = self.get_class(&current) {
                if chain.iter().any(|c: &String| c.eq_ignore_ascii_case(&class.name)) {
                    continue;
                }
                chain.push(class.name.clone());
                pending.extend(class.superclasses.iter().rev().cloned());
            }
        }
        chain
    }

    /// True when `name` is `parent` or descends from it
    pub fn is_subclass_of(&self, name: &str, parent: &str) -> bool {
        self.superclass_chain(name)
            .iter()
            .any(|c| c.eq_ignore_ascii_case(parent))
    }

    /// The class itself followed by every descendant
    pub fn subclasses(&self, name: &str) -> Vec<String> {
        self.classes
            .values()
            .filter(|c| self.is_subclass_of(&c.name, name))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Clusters holding records of the class, optionally with subclasses
    pub fn class_clusters(&self, name: &str, polymorphic: bool) -> Result<Vec<ClusterId>> {
        let class = self.require_class(name)?;
        if !polymorphic {
            return Ok(vec![class.cluster]);
        }
        let mut clusters: Vec<ClusterId> = self
            .subclasses(&class.name)
            .iter()
            .filter_map(|c| self.get_class(c).map(|c| c.cluster))
            .collect();
        clusters.sort_unstable();
        Ok(clusters)
    }

    /// Class owning a cluster
    pub fn class_of_cluster(&self, cluster: ClusterId) -> Option<&SchemaClass> {
        let name = self.clusters.get(&cluster)?;
        self.get_class(name)
    }

    /// Cluster id for a cluster name
    pub fn cluster_id(&self, cluster_name: &str) -> Option<ClusterId> {
        self.classes
            .values()
            .find(|c| c.cluster_name.eq_ignore_ascii_case(cluster_name))
            .map(|c| c.cluster)
    }

    /// Element kind of records stored in this class
    pub fn record_kind(&self, name: &str) -> RecordKind {
        if self.is_subclass_of(name, VERTEX_CLASS) {
            RecordKind::Vertex
        } else if self.is_subclass_of(name, EDGE_CLASS) {
            RecordKind::Edge
        } else {
            RecordKind::Document
        }
    }
}
