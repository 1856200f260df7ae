//! The graph-store port.
//!
//! The engine talks to its store through one capability,
//! [`GraphStore::query`], passing a typed [`Statement`] and named
//! [`Params`]. A remote adapter sends [`Statement::text`] (Cypher) with the
//! parameters as-is; an embedded adapter such as
//! [`LocalGraphStore`](crate::LocalGraphStore) interprets the statement
//! directly. Labels and relationship types are the only values spliced into
//! statement text, and the engine only builds statements whose identifiers
//! pass [`is_identifier`].
//!
//! # Parameter and column contract
//!
//! | Statement | Params | Rows |
//! |---|---|---|
//! | `CreateNode` | `props` | one `{id}` |
//! | `FindNode` | `id` | zero or one `{node, label}` |
//! | `FindCurrentNodes` | `value` | `{node, label}` per match |
//! | `CreateEdge` | `from_id`, `to_id`, `props` | one `{id}`, none if an endpoint is missing |
//! | `MergeEdge` | `anchor_id`, `neighbor_id`, `props` | one `{id}`, none if an endpoint is missing |
//! | `CloseNode` / `CloseEdge` | `id`, `tt_end` | one `{id}` if a current record was closed |
//! | `CloseIncidentEdges` | `id`, `tt_end` | one `{closed}` |
//! | `IncidentEdges` | `id` | `{rel_type, outgoing, neighbor_id, props}` per edge |
//! | `DetachDelete` | `id` | one `{deleted}` |
//! | `Lineage` / `Timeline` | `id` / `root_id` | `{node, label, hops}` per record |
//! | `CreateIndex` | none | none |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Open property map of a node or edge.
pub type Properties = Map<String, JsonValue>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or failed at the transport level.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// An index or constraint with this name is already declared.
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// A uniqueness rule was violated.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store refused the statement or its parameters.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// The single capability the engine needs from a graph database.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn query(&self, statement: &Statement, params: &Params) -> Result<Vec<Row>, StoreError>;
}

#[async_trait]
impl<T: GraphStore + ?Sized> GraphStore for Arc<T> {
    async fn query(&self, statement: &Statement, params: &Params) -> Result<Vec<Row>, StoreError> {
        (**self).query(statement, params).await
    }
}

/// Named statement parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, JsonValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// A required string parameter.
    pub fn str(&self, name: &str) -> Result<&str, StoreError> {
        self.get(name)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Rejected(format!("missing string parameter `{name}`")))
    }

    /// A required map parameter.
    pub fn object(&self, name: &str) -> Result<&Properties, StoreError> {
        self.get(name)
            .and_then(JsonValue::as_object)
            .ok_or_else(|| StoreError::Rejected(format!("missing map parameter `{name}`")))
    }
}

/// One result row, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, JsonValue>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(JsonValue::as_str)
    }

    pub fn get_object(&self, column: &str) -> Option<&Properties> {
        self.get(column).and_then(JsonValue::as_object)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.get(column).and_then(JsonValue::as_bool)
    }

    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.get(column).and_then(JsonValue::as_u64)
    }
}

impl FromIterator<(String, JsonValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Direction of a relationship relative to the node it is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSimilarity {
    Cosine,
    Euclidean,
}

impl VectorSimilarity {
    fn as_str(self) -> &'static str {
        match self {
            VectorSimilarity::Cosine => "cosine",
            VectorSimilarity::Euclidean => "euclidean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexKind {
    /// Point lookups and equality filters.
    Exact,
    /// Ordered comparisons over timestamps.
    Range,
    /// Fuzzy text matching.
    FullText,
    Vector {
        dimensions: usize,
        similarity: VectorSimilarity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexTarget {
    Node { label: String },
    Relationship { rel_type: String },
}

/// Declaration of one single-property index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub kind: IndexKind,
    pub target: IndexTarget,
    pub property: String,
    /// Ask the store to treat a repeat declaration as a no-op.
    pub if_not_exists: bool,
}

impl IndexSpec {
    pub fn text(&self) -> String {
        let guard = if self.if_not_exists {
            " IF NOT EXISTS"
        } else {
            ""
        };
        let (pattern, var) = match &self.target {
            IndexTarget::Node { label } => (format!("(n:{label})"), "n"),
            IndexTarget::Relationship { rel_type } => (format!("()-[r:{rel_type}]-()"), "r"),
        };
        let prop = &self.property;
        let name = &self.name;
        match self.kind {
            IndexKind::Exact | IndexKind::Range => {
                format!("CREATE INDEX {name}{guard} FOR {pattern} ON ({var}.{prop})")
            }
            IndexKind::FullText => {
                format!("CREATE FULLTEXT INDEX {name}{guard} FOR {pattern} ON EACH [{var}.{prop}]")
            }
            IndexKind::Vector {
                dimensions,
                similarity,
            } => format!(
                "CREATE VECTOR INDEX {name}{guard} FOR {pattern} ON ({var}.{prop}) \
                 OPTIONS {{indexConfig: {{`vector.dimensions`: {dimensions}, \
                 `vector.similarity_function`: '{}'}}}}",
                similarity.as_str()
            ),
        }
    }
}

/// Every statement shape the engine issues.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateNode {
        label: String,
    },
    FindNode,
    FindCurrentNodes {
        label: String,
        property: String,
    },
    CreateEdge {
        rel_type: String,
    },
    /// Get-or-create an edge keyed on (endpoints, type). `direction` is
    /// relative to the anchor. With `on_create_only` an existing edge keeps
    /// its properties; otherwise they are overwritten with `props`.
    MergeEdge {
        rel_type: String,
        direction: Direction,
        on_create_only: bool,
    },
    CloseNode,
    CloseEdge,
    CloseIncidentEdges,
    IncidentEdges,
    DetachDelete,
    /// Walk `rel_type` edges outward from `id`, at most `max_hops` deep.
    Lineage {
        rel_type: String,
        max_hops: usize,
    },
    /// Follow one `first_type` edge out of the root, then up to `max_hops`
    /// `next_type` edges. `hops` counts the first edge.
    Timeline {
        first_type: String,
        next_type: String,
        max_hops: usize,
    },
    CreateIndex(IndexSpec),
}

impl Statement {
    /// Cypher text for remote stores.
    pub fn text(&self) -> String {
        match self {
            Statement::CreateNode { label } => {
                format!("CREATE (n:{label}) SET n = $props RETURN n.id AS id")
            }
            Statement::FindNode => "MATCH (n {id: $id}) \
                 RETURN properties(n) AS node, labels(n)[0] AS label LIMIT 1"
                .to_string(),
            Statement::FindCurrentNodes { label, property } => format!(
                "MATCH (n:{label}) WHERE n.{property} = $value AND n.tt_end IS NULL \
                 RETURN properties(n) AS node, labels(n)[0] AS label"
            ),
            Statement::CreateEdge { rel_type } => format!(
                "MATCH (a {{id: $from_id}}), (b {{id: $to_id}}) \
                 CREATE (a)-[r:{rel_type}]->(b) SET r = $props RETURN r.id AS id"
            ),
            Statement::MergeEdge {
                rel_type,
                direction,
                on_create_only,
            } => {
                let pattern = match direction {
                    Direction::Outgoing => format!("(a)-[r:{rel_type}]->(b)"),
                    Direction::Incoming => format!("(b)-[r:{rel_type}]->(a)"),
                };
                let set = if *on_create_only {
                    "ON CREATE SET r = $props"
                } else {
                    "SET r = $props"
                };
                format!(
                    "MATCH (a {{id: $anchor_id}}), (b {{id: $neighbor_id}}) \
                     MERGE {pattern} {set} RETURN r.id AS id"
                )
            }
            Statement::CloseNode => "MATCH (n {id: $id}) WHERE n.tt_end IS NULL \
                 SET n.tt_end = $tt_end RETURN n.id AS id"
                .to_string(),
            Statement::CloseEdge => "MATCH ()-[r {id: $id}]->() WHERE r.tt_end IS NULL \
                 SET r.tt_end = $tt_end RETURN r.id AS id"
                .to_string(),
            Statement::CloseIncidentEdges => "MATCH (n {id: $id})-[r]-() WHERE r.tt_end IS NULL \
                 SET r.tt_end = $tt_end RETURN count(DISTINCT r) AS closed"
                .to_string(),
            Statement::IncidentEdges => "MATCH (n {id: $id})-[r]-(m) \
                 RETURN type(r) AS rel_type, startNode(r) = n AS outgoing, \
                 m.id AS neighbor_id, properties(r) AS props"
                .to_string(),
            Statement::DetachDelete => "MATCH (n {id: $id}) WITH n, count(n) AS deleted \
                 DETACH DELETE n RETURN deleted"
                .to_string(),
            Statement::Lineage { rel_type, max_hops } => format!(
                "MATCH path = (n {{id: $id}})-[:{rel_type}*1..{max_hops}]->(m) \
                 RETURN properties(m) AS node, labels(m)[0] AS label, \
                 min(length(path)) AS hops ORDER BY hops"
            ),
            Statement::Timeline {
                first_type,
                next_type,
                max_hops,
            } => format!(
                "MATCH (root {{id: $root_id}})-[:{first_type}]->(first) \
                 MATCH path = (first)-[:{next_type}*0..{max_hops}]->(n) \
                 RETURN properties(n) AS node, labels(n)[0] AS label, \
                 min(length(path)) + 1 AS hops"
            ),
            Statement::CreateIndex(spec) => spec.text(),
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`: safe to splice into statement text.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
