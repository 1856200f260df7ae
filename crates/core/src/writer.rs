//! Version writer: creating, superseding and closing records.

use crate::record::{decode_time, encode_time, TemporalStamp, ID, TT_END, TT_START, VT_END, VT_START};
use crate::store::{Direction, GraphStore, Params, Properties, Statement, StoreError};
use crate::{require_id, require_identifier, BitemporalGraph, GraphError, Operation, Result};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Steps of [`BitemporalGraph::update_node`], in execution order.
///
/// None of them is destructive, and each is safe to repeat:
///
/// - `CheckOriginal` only reads.
/// - `CreateSuccessor` is skipped when a successor with the same id and
///   label already exists, provided the original is still current or is
///   already replaced by that successor.
/// - `LinkReplaces` gets-or-creates the `REPLACES` edge.
/// - `CloseOriginal` only closes a node that is still current.
///
/// A failure after `CreateSuccessor` surfaces as
/// [`GraphError::Interrupted`] naming the step; calling `update_node` again
/// with the same arguments completes the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStep {
    CheckOriginal,
    CreateSuccessor,
    LinkReplaces,
    CloseOriginal,
}

impl UpdateStep {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStep::CheckOriginal => "check_original",
            UpdateStep::CreateSuccessor => "create_successor",
            UpdateStep::LinkReplaces => "link_replaces",
            UpdateStep::CloseOriginal => "close_original",
        }
    }
}

impl<S: GraphStore> BitemporalGraph<S> {
    /// Create one current node and return its id.
    ///
    /// `data` must carry a non-empty string `id` that no stored node uses
    /// yet. `vt_start` defaults to now and `vt_end` may be supplied if it
    /// does not precede `vt_start`. `tt_start` is always stamped by the
    /// engine; supplying `tt_start` or `tt_end` is an error.
    pub async fn write_node(&self, label: &str, data: Properties) -> Result<String> {
        let op = Operation::WriteNode;
        let props = self.prepare_node(op, label, data)?;
        self.create_node(op, label, props).await
    }

    /// Create one current edge `from_id -[rel_type]-> to_id` and return its id.
    ///
    /// Both endpoints must exist when the statement runs, otherwise
    /// [`GraphError::NotFound`]. `props` may carry an `id` (a ULID is
    /// generated otherwise) and `vt_start`/`vt_end` like [`write_node`].
    ///
    /// [`write_node`]: BitemporalGraph::write_node
    pub async fn write_edge(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        props: Option<Properties>,
    ) -> Result<String> {
        let op = Operation::WriteEdge;
        require_id(op, "from_id", from_id)?;
        require_id(op, "to_id", to_id)?;
        require_identifier(op, "relationship type", rel_type)?;
        let props = self.prepare_edge(op, props.unwrap_or_default())?;

        let rows = self
            .run(
                op,
                &format!("creating {rel_type} edge {from_id} -> {to_id}"),
                Statement::CreateEdge {
                    rel_type: rel_type.to_string(),
                },
                Params::new()
                    .with("from_id", from_id)
                    .with("to_id", to_id)
                    .with("props", props.clone()),
            )
            .await?;
        if rows.is_empty() {
            return Err(GraphError::not_found(op, format!("{from_id} -> {to_id}")));
        }
        Ok(edge_id_from(&rows, &props))
    }

    /// Supersede `old_id` with a new version built from `new_data`.
    ///
    /// Writes the successor, links it with a `REPLACES` edge pointing from
    /// the successor to `old_id`, then closes `old_id`. Returns the
    /// successor's id. The steps are separate round trips; see
    /// [`UpdateStep`] for the partial-failure contract.
    pub async fn update_node(&self, old_id: &str, label: &str, new_data: Properties) -> Result<String> {
        let op = Operation::UpdateNode;
        require_id(op, "old_id", old_id)?;
        let props = self.prepare_node(op, label, new_data)?;
        let new_id = node_id(&props).to_string();
        if new_id == old_id {
            return Err(GraphError::invalid(
                op,
                format!("successor id must differ from the replaced id {old_id}"),
            ));
        }

        debug!(old_id, new_id = %new_id, step = UpdateStep::CheckOriginal.as_str(), "update step");
        let original = self
            .find_node(op, old_id)
            .await?
            .ok_or_else(|| GraphError::not_found(op, old_id))?;

        debug!(old_id, new_id = %new_id, step = UpdateStep::CreateSuccessor.as_str(), "update step");
        match self.find_node(op, &new_id).await? {
            Some(existing) if existing.label == label => {
                if !original.is_current() && !self.replaces(op, &new_id, old_id).await? {
                    return Err(GraphError::invalid(
                        op,
                        format!("{old_id} is already closed and was not replaced by {new_id}"),
                    ));
                }
                debug!(new_id = %new_id, "successor already stored; resuming update");
            }
            Some(existing) => {
                return Err(GraphError::invalid(
                    op,
                    format!(
                        "id {new_id} is already used by a {} node",
                        existing.label
                    ),
                ));
            }
            None => {
                if !original.is_current() {
                    return Err(GraphError::invalid(
                        op,
                        format!("{old_id} is already closed; update its current version"),
                    ));
                }
                self.create_node(op, label, props).await?;
            }
        }

        // From here on the successor exists: failures leave partial state.
        let step = UpdateStep::LinkReplaces;
        debug!(old_id, new_id = %new_id, step = step.as_str(), "update step");
        self.link(op, &new_id, old_id, &self.config.replaces_type)
            .await
            .map_err(|e| {
                warn!(old_id, new_id = %new_id, error = %e, "update interrupted");
                e.interrupted(op, step.as_str())
            })?;

        let step = UpdateStep::CloseOriginal;
        debug!(old_id, new_id = %new_id, step = step.as_str(), "update step");
        self.close_node(op, old_id).await.map_err(|e| {
            warn!(old_id, new_id = %new_id, error = %e, "update interrupted");
            e.interrupted(op, step.as_str())
        })?;

        info!(old_id, new_id = %new_id, label, "node superseded");
        Ok(new_id)
    }

    /// Soft-delete: close the node's transaction time.
    ///
    /// Returns `true` if a current node was closed. A missing or already
    /// closed node is a no-op returning `false`, so repeated calls are safe.
    pub async fn delete_node(&self, id: &str) -> Result<bool> {
        let op = Operation::DeleteNode;
        require_id(op, "id", id)?;
        let closed = self.close_node(op, id).await?;
        if !closed {
            debug!(id, "delete_node: no current node; nothing to close");
        }
        Ok(closed)
    }

    /// Close a current edge by its `id` property. Same no-op contract as
    /// [`delete_node`](BitemporalGraph::delete_node).
    pub async fn close_edge(&self, edge_id: &str) -> Result<bool> {
        let op = Operation::CloseEdge;
        require_id(op, "edge_id", edge_id)?;
        let rows = self
            .run(
                op,
                &format!("closing edge {edge_id}"),
                Statement::CloseEdge,
                Params::new()
                    .with("id", edge_id)
                    .with(TT_END, encode_time(self.now())),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Validate caller data and stamp it for a new node.
    fn prepare_node(&self, op: Operation, label: &str, mut data: Properties) -> Result<Properties> {
        require_identifier(op, "label", label)?;
        match data.get(ID) {
            Some(JsonValue::String(id)) if !id.trim().is_empty() => {}
            Some(_) => return Err(GraphError::invalid(op, "`id` must be a non-empty string")),
            None => return Err(GraphError::invalid(op, "`id` is required")),
        }
        if label == self.config.entity_label {
            if let Some(embedding) = data.get("embedding") {
                self.check_embedding(op, embedding)?;
            }
        }
        self.stamp(op, &mut data)?;
        Ok(data)
    }

    fn prepare_edge(&self, op: Operation, mut props: Properties) -> Result<Properties> {
        match props.get(ID) {
            None | Some(JsonValue::Null) => {
                props.insert(ID.to_string(), JsonValue::String(Ulid::new().to_string()));
            }
            Some(JsonValue::String(id)) if !id.trim().is_empty() => {}
            Some(_) => return Err(GraphError::invalid(op, "edge `id` must be a non-empty string")),
        }
        self.stamp(op, &mut props)?;
        Ok(props)
    }

    /// Write `tt_start = now` and a normalized valid-time interval.
    fn stamp(&self, op: Operation, props: &mut Properties) -> Result<()> {
        for reserved in [TT_START, TT_END] {
            if props.contains_key(reserved) {
                return Err(GraphError::invalid(
                    op,
                    format!("`{reserved}` is assigned by the engine"),
                ));
            }
        }
        let now = self.now();
        let vt_start = match props.get(VT_START) {
            None | Some(JsonValue::Null) => now,
            Some(v) => decode_time(v).ok_or_else(|| {
                GraphError::invalid(op, "`vt_start` must be an RFC 3339 timestamp")
            })?,
        };
        let mut stamp = TemporalStamp::opened(vt_start, now);
        stamp.vt_end = match props.get(VT_END) {
            None | Some(JsonValue::Null) => None,
            Some(v) => Some(decode_time(v).ok_or_else(|| {
                GraphError::invalid(op, "`vt_end` must be an RFC 3339 timestamp")
            })?),
        };
        stamp
            .validate()
            .map_err(|reason| GraphError::invalid(op, reason))?;
        stamp.write_into(props);
        Ok(())
    }

    fn check_embedding(&self, op: Operation, embedding: &JsonValue) -> Result<()> {
        let expected = self.config.embedding_dimensions;
        let values = embedding
            .as_array()
            .ok_or_else(|| GraphError::invalid(op, "`embedding` must be an array of numbers"))?;
        if values.len() != expected {
            return Err(GraphError::invalid(
                op,
                format!(
                    "embedding dimension mismatch: expected {expected}, got {}",
                    values.len()
                ),
            ));
        }
        if !values.iter().all(JsonValue::is_number) {
            return Err(GraphError::invalid(op, "`embedding` must be an array of numbers"));
        }
        Ok(())
    }

    async fn create_node(&self, op: Operation, label: &str, props: Properties) -> Result<String> {
        let id = node_id(&props).to_string();
        let result = self
            .run(
                op,
                &format!("creating node {id}"),
                Statement::CreateNode {
                    label: label.to_string(),
                },
                Params::new().with("props", props),
            )
            .await;
        match result {
            Ok(rows) => {
                debug!(id = %id, label, "node created");
                Ok(rows
                    .first()
                    .and_then(|r| r.get_str(ID))
                    .map(str::to_string)
                    .unwrap_or(id))
            }
            Err(GraphError::Store {
                source: StoreError::Conflict(_),
                ..
            }) => Err(GraphError::invalid(
                op,
                format!("a node with id {id} already exists"),
            )),
            Err(e) => Err(e),
        }
    }

    /// Get-or-create a fresh current edge `from -[rel_type]-> to`. An
    /// existing edge keeps its original stamps.
    pub(crate) async fn link(&self, op: Operation, from: &str, to: &str, rel_type: &str) -> Result<()> {
        let props = self.prepare_edge(op, Properties::new())?;
        let rows = self
            .run(
                op,
                &format!("linking {from} -[{rel_type}]-> {to}"),
                Statement::MergeEdge {
                    rel_type: rel_type.to_string(),
                    direction: Direction::Outgoing,
                    on_create_only: true,
                },
                Params::new()
                    .with("anchor_id", from)
                    .with("neighbor_id", to)
                    .with("props", props),
            )
            .await?;
        if rows.is_empty() {
            return Err(GraphError::not_found(op, format!("{from} -> {to}")));
        }
        Ok(())
    }

    /// Is there a `REPLACES` edge from `new_id` to `old_id`?
    async fn replaces(&self, op: Operation, new_id: &str, old_id: &str) -> Result<bool> {
        let relationships = self.incident(op, new_id).await?;
        Ok(relationships.iter().any(|r| {
            r.rel_type == self.config.replaces_type
                && r.direction == Direction::Outgoing
                && r.neighbor_id == old_id
        }))
    }

    /// Close a current node; `false` if there was none to close.
    pub(crate) async fn close_node(&self, op: Operation, id: &str) -> Result<bool> {
        let rows = self
            .run(
                op,
                &format!("closing node {id}"),
                Statement::CloseNode,
                Params::new()
                    .with("id", id)
                    .with(TT_END, encode_time(self.now())),
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

fn node_id(props: &Properties) -> &str {
    props.get(ID).and_then(JsonValue::as_str).unwrap_or_default()
}

fn edge_id_from(rows: &[crate::Row], props: &Properties) -> String {
    rows.first()
        .and_then(|r| r.get_str(ID))
        .unwrap_or_else(|| node_id(props))
        .to_string()
}

#[cfg(test)]
mod tests {
    use crate::{BitemporalGraph, ErrorKind, LocalGraphStore, Properties};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn graph() -> BitemporalGraph<LocalGraphStore> {
        BitemporalGraph::new(LocalGraphStore::open_in_memory().unwrap())
    }

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn fixed_clock() -> DateTime<Utc> {
        "2025-01-01T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn write_node_defaults_vt_start_to_creation_time() {
        let graph = graph().with_clock(fixed_clock);
        let id = graph
            .write_node("Thought", props(json!({ "id": "t1", "text": "hello" })))
            .await
            .unwrap();
        assert_eq!(id, "t1");

        let node = graph.node("t1").await.unwrap().unwrap();
        assert!(node.is_current());
        assert_eq!(node.stamp.vt_start, fixed_clock());
        assert_eq!(node.stamp.tt_start, fixed_clock());
        assert_eq!(node.stamp.vt_end, None);
        assert_eq!(node.properties["text"], "hello");
    }

    #[tokio::test]
    async fn write_node_keeps_supplied_valid_time() {
        let graph = graph();
        graph
            .write_node(
                "Thought",
                props(json!({
                    "id": "t1",
                    "vt_start": "2020-05-01T10:00:00+02:00",
                    "vt_end": "2021-01-01T00:00:00Z"
                })),
            )
            .await
            .unwrap();
        let node = graph.node("t1").await.unwrap().unwrap();
        assert_eq!(
            node.stamp.vt_start,
            "2020-05-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(node.stamp.vt_end.is_some());
    }

    #[tokio::test]
    async fn write_node_rejects_bad_input() {
        let graph = graph();
        let cases = [
            ("Thought", json!({ "text": "no id" })),
            ("Thought", json!({ "id": "" })),
            ("Thought", json!({ "id": 7 })),
            ("Bad Label", json!({ "id": "x" })),
            ("Thought", json!({ "id": "x", "tt_start": "2024-01-01T00:00:00Z" })),
            ("Thought", json!({ "id": "x", "vt_start": "yesterday" })),
            (
                "Thought",
                json!({ "id": "x", "vt_start": "2024-02-01T00:00:00Z", "vt_end": "2024-01-01T00:00:00Z" }),
            ),
        ];
        for (label, data) in cases {
            let err = graph.write_node(label, props(data.clone())).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "case {data}");
        }
    }

    #[tokio::test]
    async fn write_node_rejects_duplicate_id() {
        let graph = graph();
        graph.write_node("Thought", props(json!({ "id": "t1" }))).await.unwrap();
        let err = graph
            .write_node("Thought", props(json!({ "id": "t1" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn entity_embedding_must_match_configured_dimension() {
        let graph = graph();
        let err = graph
            .write_node("Entity", props(json!({ "id": "e1", "embedding": [0.1, 0.2] })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 384, got 2"));

        let embedding = vec![0.0_f32; 384];
        graph
            .write_node("Entity", props(json!({ "id": "e1", "embedding": embedding })))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn write_edge_requires_both_endpoints() {
        let graph = graph();
        graph.write_node("Thought", props(json!({ "id": "a" }))).await.unwrap();
        let err = graph.write_edge("a", "missing", "NEXT", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        graph.write_node("Thought", props(json!({ "id": "b" }))).await.unwrap();
        let edge_id = graph
            .write_edge("a", "b", "NEXT", Some(props(json!({ "id": "e1", "weight": 2 }))))
            .await
            .unwrap();
        assert_eq!(edge_id, "e1");

        let rels = graph.relationships("a").await.unwrap();
        assert_eq!(rels.len(), 1);
        assert!(rels[0].is_current());
        assert_eq!(rels[0].properties["weight"], 2);
        assert!(rels[0].stamp().is_ok());
    }

    #[tokio::test]
    async fn update_rejects_missing_or_identical_ids() {
        let graph = graph();
        let err = graph
            .update_node("ghost", "Entity", props(json!({ "id": "ghost-v2" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(graph.node("ghost-v2").await.unwrap().is_none());

        graph.write_node("Entity", props(json!({ "id": "n1" }))).await.unwrap();
        let err = graph
            .update_node("n1", "Entity", props(json!({ "id": "n1" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn update_of_closed_version_is_rejected() {
        let graph = graph();
        graph.write_node("Entity", props(json!({ "id": "n1" }))).await.unwrap();
        graph
            .update_node("n1", "Entity", props(json!({ "id": "n1-v2" })))
            .await
            .unwrap();
        let err = graph
            .update_node("n1", "Entity", props(json!({ "id": "n1-v3" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(graph.node("n1-v3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_original_cannot_gain_a_second_successor() {
        let graph = graph();
        graph.write_node("Entity", props(json!({ "id": "n1" }))).await.unwrap();
        graph
            .update_node("n1", "Entity", props(json!({ "id": "n1-v2" })))
            .await
            .unwrap();
        graph.write_node("Entity", props(json!({ "id": "other" }))).await.unwrap();

        let err = graph
            .update_node("n1", "Entity", props(json!({ "id": "other" })))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let successors: Vec<String> = graph
            .relationships("n1")
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.rel_type == "REPLACES")
            .map(|r| r.neighbor_id)
            .collect();
        assert_eq!(successors, vec!["n1-v2".to_string()]);
        assert!(graph.relationships("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeating_a_completed_update_is_harmless() {
        let graph = graph();
        graph.write_node("Entity", props(json!({ "id": "n1" }))).await.unwrap();
        for _ in 0..2 {
            graph
                .update_node("n1", "Entity", props(json!({ "id": "n1-v2" })))
                .await
                .unwrap();
        }
        let rels = graph.relationships("n1-v2").await.unwrap();
        assert_eq!(rels.len(), 1, "REPLACES edge must not be duplicated");
    }

    #[tokio::test]
    async fn close_edge_is_idempotent() {
        let graph = graph();
        graph.write_node("Thought", props(json!({ "id": "a" }))).await.unwrap();
        graph.write_node("Thought", props(json!({ "id": "b" }))).await.unwrap();
        graph
            .write_edge("a", "b", "NEXT", Some(props(json!({ "id": "e1" }))))
            .await
            .unwrap();

        assert!(graph.close_edge("e1").await.unwrap());
        assert!(!graph.close_edge("e1").await.unwrap());
        assert!(!graph.close_edge("nope").await.unwrap());
        let rels = graph.relationships("a").await.unwrap();
        assert!(!rels[0].is_current());
    }
}
