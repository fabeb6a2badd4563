//! Vertex and edge operations
//!
//! Adjacency is stored on the vertices: a vertex keeps one link list per
//! edge class and direction (`out_Friend`, `in_Friend`), and every edge
//! record stores its endpoints in `out` and `in`. The operations below keep
//! both sides consistent.

use crate::database::DatabaseSession;
use tessera_core::{Direction, EDGE_IN, EDGE_OUT, Error, Fields, Record, Result, Rid, Value};
use tracing::debug;

fn edge_field(direction: Direction, edge_class: &str) -> String {
    format!("{}{}", direction.field_prefix(), edge_class)
}

impl DatabaseSession {
    /// Create and save a vertex
    pub fn create_vertex(&mut self, class: &str, fields: Fields) -> Result<Record> {
        let mut record = self.new_record(class)?;
        if !record.is_vertex() {
            return Err(Error::CommandExecution(format!(
                "Class {} is not a vertex class",
                class
            )));
        }
        record.fields = fields;
        self.save(record)
    }

    /// Create an edge between two vertices and link both endpoints
    pub fn create_edge(&mut self, class: &str, from: Rid, to: Rid, fields: Fields) -> Result<Record> {
        let mut record = self.new_record(class)?;
        if !record.is_edge() {
            return Err(Error::CommandExecution(format!(
                "Class {} is not an edge class",
                class
            )));
        }
        record.fields = fields;
        record.set(EDGE_OUT, from);
        record.set(EDGE_IN, to);

        self.atomically(|session| {
            for endpoint in [from, to] {
                if !session.load(endpoint)?.is_vertex() {
                    return Err(Error::CommandExecution(format!(
                        "Edge endpoint {} is not a vertex",
                        endpoint
                    )));
                }
            }
            let edge = session.save(record)?;
            session.attach_edge(from, Direction::Outgoing, &edge.class, edge.rid)?;
            session.attach_edge(to, Direction::Incoming, &edge.class, edge.rid)?;
            debug!("Created edge {} {} -> {}", edge.rid, from, to);
            Ok(edge)
        })
    }

    /// Add an edge link to a vertex's adjacency list
    pub fn attach_edge(
        &mut self,
        vertex: Rid,
        direction: Direction,
        edge_class: &str,
        edge: Rid,
    ) -> Result<()> {
        let mut record = self.load(vertex)?;
        let field = edge_field(direction, edge_class);
        let mut links = record.get(&field).map(Value::links).unwrap_or_default();
        if !links.contains(&edge) {
            links.push(edge);
        }
        record.set(field, Value::List(links.into_iter().map(Value::Link).collect()));
        self.save(record).map(|_| ())
    }

    /// Remove an edge link from a vertex's adjacency list
    pub fn detach_edge(
        &mut self,
        vertex: Rid,
        direction: Direction,
        edge_class: &str,
        edge: Rid,
    ) -> Result<()> {
        let Some(mut record) = self.try_load(vertex)? else {
            return Ok(());
        };
        let field = edge_field(direction, edge_class);
        let links: Vec<Rid> = record
            .get(&field)
            .map(Value::links)
            .unwrap_or_default()
            .into_iter()
            .filter(|rid| *rid != edge)
            .collect();
        if links.is_empty() {
            record.remove(&field);
        } else {
            record.set(field, Value::List(links.into_iter().map(Value::Link).collect()));
        }
        self.save(record).map(|_| ())
    }

    /// Delete an edge and unlink it from both endpoints
    pub fn delete_edge(&mut self, edge: Rid) -> Result<()> {
        let record = self.load(edge)?;
        if !record.is_edge() {
            return Err(Error::CommandExecution(format!("{} is not an edge", edge)));
        }
        self.atomically(|session| {
            if let Some(out) = record.edge_out() {
                session.detach_edge(out, Direction::Outgoing, &record.class, edge)?;
            }
            if let Some(inc) = record.edge_in() {
                session.detach_edge(inc, Direction::Incoming, &record.class, edge)?;
            }
            session.delete(edge)
        })
    }

    /// Delete a vertex together with every incident edge
    pub fn delete_vertex(&mut self, vertex: Rid) -> Result<()> {
        let record = self.load(vertex)?;
        if !record.is_vertex() {
            return Err(Error::CommandExecution(format!("{} is not a vertex", vertex)));
        }
        self.atomically(|session| {
            for edge in session.edges(vertex, Direction::Both, &[])? {
                if session.try_load(edge)?.is_some() {
                    session.delete_edge(edge)?;
                }
            }
            session.delete(vertex)
        })
    }

    fn matches_edge_class(&self, field_class: &str, classes: &[&str]) -> Result<bool> {
        if classes.is_empty() {
            return Ok(true);
        }
        let schema = self.database().schema()?;
        Ok(classes.iter().any(|c| schema.is_subclass_of(field_class, c)))
    }

    fn edges_one_way(
        &mut self,
        vertex: &Record,
        direction: Direction,
        classes: &[&str],
    ) -> Result<Vec<Rid>> {
        let mut edges = Vec::new();
        for (class, links) in vertex.edge_fields(direction) {
            if self.matches_edge_class(class, classes)? {
                edges.extend(links.links());
            }
        }
        Ok(edges)
    }

    /// Edges incident to a vertex; a missing vertex has none
    pub fn edges(&mut self, vertex: Rid, direction: Direction, classes: &[&str]) -> Result<Vec<Rid>> {
        let Some(record) = self.try_load(vertex)? else {
            return Ok(Vec::new());
        };
        match direction {
            Direction::Both => {
                let mut edges = self.edges_one_way(&record, Direction::Outgoing, classes)?;
                edges.extend(self.edges_one_way(&record, Direction::Incoming, classes)?);
                Ok(edges)
            }
            _ => self.edges_one_way(&record, direction, classes),
        }
    }

    /// Vertices adjacent to a vertex through edges of the given classes
    pub fn neighbors(
        &mut self,
        vertex: Rid,
        direction: Direction,
        classes: &[&str],
    ) -> Result<Vec<Rid>> {
        let directions: &[Direction] = match direction {
            Direction::Both => &[Direction::Outgoing, Direction::Incoming],
            Direction::Outgoing => &[Direction::Outgoing],
            Direction::Incoming => &[Direction::Incoming],
        };
        let mut result = Vec::new();
        for dir in directions {
            for edge in self.edges(vertex, *dir, classes)? {
                let Some(edge) = self.try_load(edge)? else {
                    continue;
                };
                let other = match dir {
                    Direction::Incoming => edge.edge_out(),
                    _ => edge.edge_in(),
                };
                result.extend(other);
            }
        }
        Ok(result)
    }

    /// Endpoints of an edge: `out`, `in`, or both
    pub fn edge_vertices(&mut self, edge: Rid, direction: Direction) -> Result<Vec<Rid>> {
        let Some(record) = self.try_load(edge)? else {
            return Ok(Vec::new());
        };
        Ok(match direction {
            Direction::Outgoing => record.edge_out().into_iter().collect(),
            Direction::Incoming => record.edge_in().into_iter().collect(),
            Direction::Both => record.edge_out().into_iter().chain(record.edge_in()).collect(),
        })
    }
}
