//! Embedded graph store backed by `redb`.
//!
//! Interprets each [`Statement`] with the semantics its Cypher text
//! expresses, so the engine can run without an external database: in tests,
//! in tools, or as a small single-process deployment. Every statement runs
//! in its own redb transaction, which makes each one atomic on its own while
//! multi-statement operations stay non-atomic exactly as they are against a
//! remote store.
//!
//! Lookups by node id hit the `nodes` table directly; everything else is a
//! linear scan over `edges`. Fine at the scale this store is meant for.

use crate::record::{ID, TT_END};
use crate::store::{
    Direction, GraphStore, IndexKind, IndexSpec, Params, Properties, Row, Statement, StoreError,
};
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use ulid::Ulid;

/// Node id → JSON [`StoredNode`].
const NODES: TableDefinition<&str, &str> = TableDefinition::new("nodes");
/// Internal ULID key → JSON [`StoredEdge`]. ULIDs are time-sortable, so a
/// scan yields edges in insertion order.
const EDGES: TableDefinition<&str, &str> = TableDefinition::new("edges");
/// Index name → JSON [`IndexSpec`].
const INDEXES: TableDefinition<&str, &str> = TableDefinition::new("indexes");

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}
impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Rejected(format!("malformed record: {e}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    label: String,
    props: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEdge {
    rel_type: String,
    from: String,
    to: String,
    props: Properties,
}

impl StoredEdge {
    fn is_current(&self) -> bool {
        self.props.get(TT_END).is_none_or(JsonValue::is_null)
    }

    fn touches(&self, id: &str) -> bool {
        self.from == id || self.to == id
    }

    fn id(&self) -> JsonValue {
        self.props.get(ID).cloned().unwrap_or(JsonValue::Null)
    }
}

fn is_open(props: &Properties) -> bool {
    props.get(TT_END).is_none_or(JsonValue::is_null)
}

fn node_row(node: StoredNode) -> Row {
    Row::new()
        .with("node", JsonValue::Object(node.props))
        .with("label", node.label)
}

fn traversal_row(node: StoredNode, hops: u64) -> Row {
    node_row(node).with("hops", hops)
}

fn get_node(
    table: &impl ReadableTable<&'static str, &'static str>,
    id: &str,
) -> Result<Option<StoredNode>, StoreError> {
    match table.get(id)? {
        Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
        None => Ok(None),
    }
}

fn all_edges(
    table: &impl ReadableTable<&'static str, &'static str>,
) -> Result<Vec<(String, StoredEdge)>, StoreError> {
    let mut edges = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        edges.push((key.value().to_string(), serde_json::from_str(value.value())?));
    }
    Ok(edges)
}

/// Outgoing adjacency restricted to one relationship type, in edge order.
fn adjacency<'a>(edges: &'a [(String, StoredEdge)], rel_type: &str) -> HashMap<&'a str, Vec<&'a str>> {
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for (_, edge) in edges.iter().filter(|(_, e)| e.rel_type == rel_type) {
        out.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    out
}

/// Embedded implementation of [`GraphStore`].
pub struct LocalGraphStore {
    db: Database,
}

impl LocalGraphStore {
    /// Open or create a store file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store. Data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(NODES)?;
            write_txn.open_table(EDGES)?;
            write_txn.open_table(INDEXES)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Every index declared so far.
    pub fn declared_indexes(&self) -> Result<Vec<IndexSpec>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(INDEXES)?;
        let mut specs = Vec::new();
        for entry in table.iter()? {
            let (_name, value) = entry?;
            specs.push(serde_json::from_str(value.value())?);
        }
        Ok(specs)
    }

    fn execute(&self, statement: &Statement, params: &Params) -> Result<Vec<Row>, StoreError> {
        match statement {
            Statement::CreateNode { label } => self.create_node(label, params.object("props")?),
            Statement::FindNode => self.find_node(params.str("id")?),
            Statement::FindCurrentNodes { label, property } => {
                let value = params
                    .get("value")
                    .ok_or_else(|| StoreError::Rejected("missing parameter `value`".into()))?;
                self.find_current_nodes(label, property, value)
            }
            Statement::CreateEdge { rel_type } => self.create_edge(
                rel_type,
                params.str("from_id")?,
                params.str("to_id")?,
                params.object("props")?,
            ),
            Statement::MergeEdge {
                rel_type,
                direction,
                on_create_only,
            } => {
                let anchor = params.str("anchor_id")?;
                let neighbor = params.str("neighbor_id")?;
                let (from, to) = match direction {
                    Direction::Outgoing => (anchor, neighbor),
                    Direction::Incoming => (neighbor, anchor),
                };
                self.merge_edge(rel_type, from, to, params.object("props")?, *on_create_only)
            }
            Statement::CloseNode => self.close_node(params.str("id")?, tt_end_param(params)?),
            Statement::CloseEdge => self.close_edge(params.str("id")?, tt_end_param(params)?),
            Statement::CloseIncidentEdges => {
                self.close_incident_edges(params.str("id")?, tt_end_param(params)?)
            }
            Statement::IncidentEdges => self.incident_edges(params.str("id")?),
            Statement::DetachDelete => self.detach_delete(params.str("id")?),
            Statement::Lineage { rel_type, max_hops } => {
                self.lineage(params.str("id")?, rel_type, *max_hops)
            }
            Statement::Timeline {
                first_type,
                next_type,
                max_hops,
            } => self.timeline(params.str("root_id")?, first_type, next_type, *max_hops),
            Statement::CreateIndex(spec) => self.create_index(spec),
        }
    }

    fn create_node(&self, label: &str, props: &Properties) -> Result<Vec<Row>, StoreError> {
        let id = props
            .get(ID)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| StoreError::Rejected("node properties need a string `id`".into()))?;
        let node = StoredNode {
            label: label.to_string(),
            props: props.clone(),
        };
        let value = serde_json::to_string(&node)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut nodes = write_txn.open_table(NODES)?;
            if nodes.get(id)?.is_some() {
                // Dropping write_txn rolls back.
                return Err(StoreError::Conflict(format!("node id {id} already exists")));
            }
            nodes.insert(id, value.as_str())?;
        }
        write_txn.commit()?;
        Ok(vec![Row::new().with("id", id)])
    }

    fn find_node(&self, id: &str) -> Result<Vec<Row>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        Ok(get_node(&nodes, id)?.map(node_row).into_iter().collect())
    }

    fn find_current_nodes(
        &self,
        label: &str,
        property: &str,
        value: &JsonValue,
    ) -> Result<Vec<Row>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        let mut rows = Vec::new();
        for entry in nodes.iter()? {
            let (_id, raw) = entry?;
            let node: StoredNode = serde_json::from_str(raw.value())?;
            if node.label == label && node.props.get(property) == Some(value) && is_open(&node.props)
            {
                rows.push(node_row(node));
            }
        }
        Ok(rows)
    }

    fn create_edge(
        &self,
        rel_type: &str,
        from: &str,
        to: &str,
        props: &Properties,
    ) -> Result<Vec<Row>, StoreError> {
        let edge = StoredEdge {
            rel_type: rel_type.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            props: props.clone(),
        };
        let write_txn = self.db.begin_write()?;
        {
            let nodes = write_txn.open_table(NODES)?;
            if get_node(&nodes, from)?.is_none() || get_node(&nodes, to)?.is_none() {
                return Ok(Vec::new());
            }
            let mut edges = write_txn.open_table(EDGES)?;
            let key = Ulid::new().to_string();
            edges.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(vec![Row::new().with("id", edge.id())])
    }

    fn merge_edge(
        &self,
        rel_type: &str,
        from: &str,
        to: &str,
        props: &Properties,
        on_create_only: bool,
    ) -> Result<Vec<Row>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let nodes = write_txn.open_table(NODES)?;
            if get_node(&nodes, from)?.is_none() || get_node(&nodes, to)?.is_none() {
                return Ok(Vec::new());
            }
            let mut edges = write_txn.open_table(EDGES)?;
            let existing = all_edges(&edges)?
                .into_iter()
                .find(|(_, e)| e.rel_type == rel_type && e.from == from && e.to == to);
            let (key, edge) = match existing {
                Some((key, mut edge)) => {
                    if !on_create_only {
                        edge.props = props.clone();
                    }
                    (key, edge)
                }
                None => (
                    Ulid::new().to_string(),
                    StoredEdge {
                        rel_type: rel_type.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                        props: props.clone(),
                    },
                ),
            };
            edges.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
            edge.id()
        };
        write_txn.commit()?;
        Ok(vec![Row::new().with("id", id)])
    }

    fn close_node(&self, id: &str, tt_end: &JsonValue) -> Result<Vec<Row>, StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut nodes = write_txn.open_table(NODES)?;
            let Some(mut node) = get_node(&nodes, id)? else {
                return Ok(Vec::new());
            };
            if !is_open(&node.props) {
                return Ok(Vec::new());
            }
            node.props.insert(TT_END.to_string(), tt_end.clone());
            nodes.insert(id, serde_json::to_string(&node)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(vec![Row::new().with("id", id)])
    }

    /// Close every current edge matching `keep` and return the closed edges.
    fn close_edges_where(
        &self,
        tt_end: &JsonValue,
        keep: impl Fn(&StoredEdge) -> bool,
    ) -> Result<Vec<StoredEdge>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let mut closed = Vec::new();
        {
            let mut edges = write_txn.open_table(EDGES)?;
            for (key, mut edge) in all_edges(&edges)? {
                if !edge.is_current() || !keep(&edge) {
                    continue;
                }
                edge.props.insert(TT_END.to_string(), tt_end.clone());
                edges.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
                closed.push(edge);
            }
        }
        write_txn.commit()?;
        Ok(closed)
    }

    fn close_edge(&self, id: &str, tt_end: &JsonValue) -> Result<Vec<Row>, StoreError> {
        let closed = self.close_edges_where(tt_end, |e| {
            e.props.get(ID).and_then(JsonValue::as_str) == Some(id)
        })?;
        Ok(closed.iter().map(|e| Row::new().with("id", e.id())).collect())
    }

    fn close_incident_edges(&self, id: &str, tt_end: &JsonValue) -> Result<Vec<Row>, StoreError> {
        let closed = self.close_edges_where(tt_end, |e| e.touches(id))?;
        Ok(vec![Row::new().with("closed", closed.len())])
    }

    fn incident_edges(&self, id: &str) -> Result<Vec<Row>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let edges = read_txn.open_table(EDGES)?;
        Ok(all_edges(&edges)?
            .into_iter()
            .filter(|(_, e)| e.touches(id))
            .map(|(_, e)| {
                let outgoing = e.from == id;
                let neighbor = if outgoing { e.to } else { e.from };
                Row::new()
                    .with("rel_type", e.rel_type)
                    .with("outgoing", outgoing)
                    .with("neighbor_id", neighbor)
                    .with("props", JsonValue::Object(e.props))
            })
            .collect())
    }

    fn detach_delete(&self, id: &str) -> Result<Vec<Row>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut nodes = write_txn.open_table(NODES)?;
            let deleted = nodes.remove(id)?.is_some();
            let mut edges = write_txn.open_table(EDGES)?;
            for (key, _) in all_edges(&edges)?.into_iter().filter(|(_, e)| e.touches(id)) {
                edges.remove(key.as_str())?;
            }
            deleted
        };
        write_txn.commit()?;
        Ok(vec![Row::new().with("deleted", u64::from(deleted))])
    }

    fn lineage(&self, id: &str, rel_type: &str, max_hops: usize) -> Result<Vec<Row>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        let edges = all_edges(&read_txn.open_table(EDGES)?)?;
        let next = adjacency(&edges, rel_type);

        let mut rows = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([id]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(id, 0)]);
        while let Some((current, hops)) = queue.pop_front() {
            if hops == max_hops {
                continue;
            }
            for &to in next.get(current).into_iter().flatten() {
                if !seen.insert(to) {
                    continue;
                }
                if let Some(node) = get_node(&nodes, to)? {
                    rows.push(traversal_row(node, (hops + 1) as u64));
                    queue.push_back((to, hops + 1));
                }
            }
        }
        Ok(rows)
    }

    fn timeline(
        &self,
        root_id: &str,
        first_type: &str,
        next_type: &str,
        max_hops: usize,
    ) -> Result<Vec<Row>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let nodes = read_txn.open_table(NODES)?;
        if get_node(&nodes, root_id)?.is_none() {
            return Ok(Vec::new());
        }
        let edges = all_edges(&read_txn.open_table(EDGES)?)?;
        let first = adjacency(&edges, first_type);
        let next = adjacency(&edges, next_type);

        let mut rows = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([root_id]);
        // (record, NEXT hops taken after the first edge)
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        for &start in first.get(root_id).into_iter().flatten() {
            if seen.insert(start) {
                queue.push_back((start, 0));
            }
        }
        while let Some((current, hops)) = queue.pop_front() {
            let Some(node) = get_node(&nodes, current)? else {
                continue;
            };
            rows.push(traversal_row(node, (hops + 1) as u64));
            if hops == max_hops {
                continue;
            }
            for &to in next.get(current).into_iter().flatten() {
                if seen.insert(to) {
                    queue.push_back((to, hops + 1));
                }
            }
        }
        Ok(rows)
    }

    fn create_index(&self, spec: &IndexSpec) -> Result<Vec<Row>, StoreError> {
        if let IndexKind::Vector { dimensions: 0, .. } = spec.kind {
            return Err(StoreError::Rejected(format!(
                "vector index {} needs at least one dimension",
                spec.name
            )));
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut indexes = write_txn.open_table(INDEXES)?;
            if indexes.get(spec.name.as_str())?.is_some() {
                return if spec.if_not_exists {
                    Ok(Vec::new())
                } else {
                    Err(StoreError::AlreadyExists(spec.name.clone()))
                };
            }
            indexes.insert(spec.name.as_str(), serde_json::to_string(spec)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(Vec::new())
    }
}

fn tt_end_param(params: &Params) -> Result<&JsonValue, StoreError> {
    params
        .get(TT_END)
        .ok_or_else(|| StoreError::Rejected("missing parameter `tt_end`".into()))
}

#[async_trait]
impl GraphStore for LocalGraphStore {
    async fn query(&self, statement: &Statement, params: &Params) -> Result<Vec<Row>, StoreError> {
        self.execute(statement, params)
    }
}
