//! History reader: timelines, lineages and point-in-time lookups.

use crate::record::{decode_time, NodeRecord, ID, VT_START};
use crate::store::{GraphStore, Params, Properties, Row, Statement};
use crate::{require_id, require_identifier, BitemporalGraph, GraphError, Operation, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::debug;

/// Discriminator column of a timeline item. A stored property of the same
/// name is dropped so the serialized item has a single `kind` key.
const KIND: &str = "kind";

/// One flattened timeline record: every stored property plus `id` and the
/// configured `kind` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineItem {
    pub id: String,
    pub kind: String,
    #[serde(flatten)]
    pub properties: Properties,
}

impl TimelineItem {
    pub fn vt_start(&self) -> Option<DateTime<Utc>> {
        self.properties.get(VT_START).and_then(decode_time)
    }
}

/// A traversal row: the record and how many hops away it was found.
struct Visited {
    props: Properties,
    label: String,
    hops: u64,
}

fn visited(op: Operation, anchor: &str, row: &Row) -> Result<Visited> {
    let props = row
        .get_object("node")
        .cloned()
        .ok_or_else(|| GraphError::corrupt(op, anchor, "traversal row has no `node` column"))?;
    Ok(Visited {
        props,
        label: row.get_str("label").unwrap_or_default().to_string(),
        hops: row.get_u64("hops").unwrap_or(u64::MAX),
    })
}

/// Keep the closest sighting of each record id; stores may report a record
/// once per path that reaches it.
fn dedupe_by_id(rows: Vec<Visited>) -> Vec<(String, Visited)> {
    let mut best: HashMap<String, Visited> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for v in rows {
        let Some(id) = v.props.get(ID).and_then(JsonValue::as_str).map(str::to_string) else {
            continue;
        };
        match best.get(&id).map(|seen| seen.hops <= v.hops) {
            Some(true) => {}
            Some(false) => {
                best.insert(id, v);
            }
            None => {
                order.push(id.clone());
                best.insert(id, v);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| best.remove(&id).map(|v| (id, v)))
        .collect()
}

impl<S: GraphStore> BitemporalGraph<S> {
    /// Rebuild the chain hanging off `root_id`.
    ///
    /// Follows the configured first relationship out of the root, then up
    /// to `timeline.max_hops` next-relationship hops. Items are ordered by
    /// ascending `vt_start`; records sharing a `vt_start` keep traversal
    /// order, and records without a readable `vt_start` sort last. A
    /// missing root or a root with no chain yields an empty timeline.
    pub async fn get_timeline(&self, root_id: &str) -> Result<Vec<TimelineItem>> {
        let op = Operation::GetTimeline;
        require_id(op, "root_id", root_id)?;
        let timeline = &self.config.timeline;

        let rows = self
            .run(
                op,
                &format!("reading timeline of {root_id}"),
                Statement::Timeline {
                    first_type: timeline.first_type.clone(),
                    next_type: timeline.next_type.clone(),
                    max_hops: timeline.max_hops,
                },
                Params::new().with("root_id", root_id),
            )
            .await?;
        let rows = rows
            .iter()
            .map(|row| visited(op, root_id, row))
            .collect::<Result<Vec<_>>>()?;

        let mut entries: Vec<(Option<DateTime<Utc>>, u64, TimelineItem)> = dedupe_by_id(rows)
            .into_iter()
            .map(|(id, v)| {
                let vt_start = v.props.get(VT_START).and_then(decode_time);
                let mut properties = v.props;
                properties.remove(ID);
                properties.remove(KIND);
                let item = TimelineItem {
                    id,
                    kind: timeline.record_kind.clone(),
                    properties,
                };
                (vt_start, v.hops, item)
            })
            .collect();

        // `None` sorts after every timestamp.
        entries.sort_by(|(a_vt, a_hops, _), (b_vt, b_hops, _)| {
            let a_key = (a_vt.is_none(), *a_vt, *a_hops);
            let b_key = (b_vt.is_none(), *b_vt, *b_hops);
            a_key.cmp(&b_key)
        });

        debug!(root_id, items = entries.len(), "timeline rebuilt");
        Ok(entries.into_iter().map(|(_, _, item)| item).collect())
    }

    /// The version chain ending at `id`, oldest first.
    ///
    /// Walks `REPLACES` edges backward from `id` (successor → predecessor),
    /// bounded by `lineage_max_hops`. Order comes from the edges alone,
    /// never from timestamps.
    pub async fn lineage(&self, id: &str) -> Result<Vec<NodeRecord>> {
        let op = Operation::ReadLineage;
        require_id(op, "id", id)?;
        let newest = self
            .find_node(op, id)
            .await?
            .ok_or_else(|| GraphError::not_found(op, id))?;

        let rows = self
            .run(
                op,
                &format!("reading lineage of {id}"),
                Statement::Lineage {
                    rel_type: self.config.replaces_type.clone(),
                    max_hops: self.config.lineage_max_hops,
                },
                Params::new().with("id", id),
            )
            .await?;
        let rows = rows
            .iter()
            .map(|row| visited(op, id, row))
            .collect::<Result<Vec<_>>>()?;

        let mut predecessors = dedupe_by_id(rows)
            .into_iter()
            .filter(|(pid, _)| pid != id)
            .map(|(pid, v)| {
                NodeRecord::from_properties(v.label, &v.props)
                    .map(|record| (v.hops, record))
                    .map_err(|reason| GraphError::corrupt(op, pid, reason))
            })
            .collect::<Result<Vec<_>>>()?;
        predecessors.sort_by(|(a, _), (b, _)| b.cmp(a));

        let mut chain: Vec<NodeRecord> = predecessors.into_iter().map(|(_, r)| r).collect();
        chain.push(newest);
        Ok(chain)
    }

    /// Fetch a node in any temporal state.
    pub async fn node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let op = Operation::ReadNode;
        require_id(op, "id", id)?;
        self.find_node(op, id).await
    }

    /// Fetch a node only if the system held it as current at `at`.
    pub async fn node_as_of(&self, id: &str, at: DateTime<Utc>) -> Result<Option<NodeRecord>> {
        Ok(self
            .node(id)
            .await?
            .filter(|node| node.stamp.was_recorded_at(at)))
    }

    /// Current nodes with `label` whose `property` equals `value`.
    pub async fn current_nodes(
        &self,
        label: &str,
        property: &str,
        value: impl Into<JsonValue>,
    ) -> Result<Vec<NodeRecord>> {
        let op = Operation::ReadCurrentNodes;
        require_identifier(op, "label", label)?;
        require_identifier(op, "property", property)?;
        let rows = self
            .run(
                op,
                &format!("reading current {label} nodes by {property}"),
                Statement::FindCurrentNodes {
                    label: label.to_string(),
                    property: property.to_string(),
                },
                Params::new().with("value", value),
            )
            .await?;
        rows.iter()
            .map(|row| {
                NodeRecord::from_row(row).map_err(|reason| GraphError::corrupt(op, label, reason))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, hops: u64) -> Visited {
        let mut props = Properties::new();
        props.insert(ID.to_string(), JsonValue::String(id.to_string()));
        Visited {
            props,
            label: "Thought".to_string(),
            hops,
        }
    }

    #[test]
    fn dedupe_keeps_closest_and_first_seen_order() {
        let out = dedupe_by_id(vec![row("a", 3), row("b", 1), row("a", 2), row("c", 1), row("b", 4)]);
        let ids: Vec<(&str, u64)> = out.iter().map(|(id, v)| (id.as_str(), v.hops)).collect();
        assert_eq!(ids, vec![("a", 2), ("b", 1), ("c", 1)]);
    }

    #[test]
    fn dedupe_drops_rows_without_id() {
        let mut nameless = row("x", 1);
        nameless.props.clear();
        assert!(dedupe_by_id(vec![nameless]).is_empty());
    }

    #[tokio::test]
    async fn stored_kind_does_not_duplicate_the_discriminator() {
        let graph = BitemporalGraph::new(crate::LocalGraphStore::open_in_memory().unwrap());
        let data = serde_json::json!({ "id": "S" });
        graph
            .write_node("Session", data.as_object().cloned().unwrap())
            .await
            .unwrap();
        let data = serde_json::json!({ "id": "t1", "kind": "note", "text": "hi" });
        graph
            .write_node("Thought", data.as_object().cloned().unwrap())
            .await
            .unwrap();
        graph.write_edge("S", "t1", "TRIGGERS", None).await.unwrap();

        let timeline = graph.get_timeline("S").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert!(!timeline[0].properties.contains_key(KIND));

        let json = serde_json::to_string(&timeline[0]).unwrap();
        assert_eq!(json.matches("\"kind\"").count(), 1);
        let value: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value["kind"], "thought");
        assert_eq!(value["text"], "hi");
    }

    #[test]
    fn timeline_item_flattens_properties() {
        let mut properties = Properties::new();
        properties.insert("text".into(), JsonValue::String("hi".into()));
        properties.insert(VT_START.into(), JsonValue::String("2024-01-01T00:00:00Z".into()));
        let item = TimelineItem {
            id: "t1".into(),
            kind: "thought".into(),
            properties,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["id"], "t1");
        assert_eq!(json["kind"], "thought");
        assert_eq!(json["text"], "hi");
        assert!(item.vt_start().is_some());
    }
}
