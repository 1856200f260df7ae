//! Entity merger: folding a duplicate node into the node that survives.

use crate::config::SourceRetention;
use crate::record::{encode_time, Relationship, TT_END};
use crate::store::{Direction, GraphStore, Params, Statement};
use crate::{require_id, require_identifier, BitemporalGraph, GraphError, Operation, Result};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Steps of [`BitemporalGraph::merge_nodes`], in execution order.
///
/// `ReadRelationships` only reads. `CopyRelationships` gets-or-creates each
/// relationship on the target and overwrites its properties, so repeating
/// it never duplicates. `RetireSource` is the only destructive step and
/// runs last: a failure before it leaves both nodes holding the same
/// relationships, never a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    ReadRelationships,
    CopyRelationships,
    RetireSource,
}

impl MergeStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStep::ReadRelationships => "read_relationships",
            MergeStep::CopyRelationships => "copy_relationships",
            MergeStep::RetireSource => "retire_source",
        }
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub target_id: String,
    pub source_id: String,
    /// `false` when the source did not exist and nothing was done.
    pub source_found: bool,
    pub relationships_copied: usize,
    /// Relationships left alone: those between source and target, which
    /// would collapse into self-loops, and closed ones whose counterpart is
    /// still current on the target.
    pub relationships_skipped: usize,
    pub retention: SourceRetention,
}

impl<S: GraphStore> BitemporalGraph<S> {
    /// Every relationship incident to `id`, current and closed, with its
    /// direction relative to `id`.
    pub async fn relationships(&self, id: &str) -> Result<Vec<Relationship>> {
        let op = Operation::ReadRelationships;
        require_id(op, "id", id)?;
        self.incident(op, id).await
    }

    /// Consolidate `source_id` into `target_id`.
    ///
    /// Every relationship of the source is re-created between the target
    /// and the same neighbor, in the same direction, carrying the original
    /// properties and stamps. The source is then retired according to
    /// [`GraphConfig::merge_retention`](crate::GraphConfig::merge_retention).
    ///
    /// A missing target is [`GraphError::NotFound`]; a missing source is a
    /// successful no-op, and so is a source already closed and linked to the
    /// target by a previous merge under [`SourceRetention::Close`]. Merging a
    /// node into itself is rejected.
    pub async fn merge_nodes(&self, target_id: &str, source_id: &str) -> Result<MergeReport> {
        let op = Operation::MergeNodes;
        require_id(op, "target_id", target_id)?;
        require_id(op, "source_id", source_id)?;
        if target_id == source_id {
            return Err(GraphError::invalid(
                op,
                format!("cannot merge {source_id} into itself"),
            ));
        }

        let retention = self.config.merge_retention;
        let mut report = MergeReport {
            target_id: target_id.to_string(),
            source_id: source_id.to_string(),
            source_found: false,
            relationships_copied: 0,
            relationships_skipped: 0,
            retention,
        };

        if self.find_node(op, target_id).await?.is_none() {
            return Err(GraphError::not_found(op, target_id));
        }
        let Some(source) = self.find_node(op, source_id).await? else {
            debug!(target_id, source_id, "merge source absent; nothing to consolidate");
            return Ok(report);
        };
        report.source_found = true;

        debug!(target_id, source_id, step = MergeStep::ReadRelationships.as_str(), "merge step");
        let relationships = self.incident(op, source_id).await?;

        let linked = self.merged_into(&relationships, target_id);
        if retention == SourceRetention::Close && linked && !source.is_current() {
            debug!(target_id, source_id, "source already retired into target; merge complete");
            return Ok(report);
        }

        // A closed copy must not overwrite a relationship the target still
        // holds as current.
        let live_on_target: HashSet<(String, Direction, String)> = self
            .incident(op, target_id)
            .await?
            .into_iter()
            .filter(Relationship::is_current)
            .map(|r| (r.rel_type, r.direction, r.neighbor_id))
            .collect();

        let step = MergeStep::CopyRelationships;
        debug!(target_id, source_id, step = step.as_str(), count = relationships.len(), "merge step");
        for rel in &relationships {
            if rel.neighbor_id == target_id {
                report.relationships_skipped += 1;
                continue;
            }
            let neighbor = if rel.neighbor_id == source_id {
                target_id
            } else {
                rel.neighbor_id.as_str()
            };
            let key = (rel.rel_type.clone(), rel.direction, neighbor.to_string());
            if !rel.is_current() && live_on_target.contains(&key) {
                report.relationships_skipped += 1;
                continue;
            }
            self.copy_relationship(op, target_id, neighbor, rel)
                .await
                .map_err(|e| {
                    warn!(target_id, source_id, error = %e, "merge interrupted");
                    e.interrupted(op, step.as_str())
                })?;
            report.relationships_copied += 1;
        }

        let step = MergeStep::RetireSource;
        debug!(target_id, source_id, step = step.as_str(), ?retention, "merge step");
        self.retire_source(op, target_id, source_id, retention, linked)
            .await
            .map_err(|e| {
                warn!(target_id, source_id, error = %e, "merge interrupted");
                e.interrupted(op, step.as_str())
            })?;

        info!(
            target_id,
            source_id,
            copied = report.relationships_copied,
            skipped = report.relationships_skipped,
            "nodes merged"
        );
        Ok(report)
    }

    /// Does `relationships` hold a current `MERGED_INTO` edge out to `target_id`?
    fn merged_into(&self, relationships: &[Relationship], target_id: &str) -> bool {
        relationships.iter().any(|r| {
            r.is_current()
                && r.rel_type == self.config.merged_into_type
                && r.direction == Direction::Outgoing
                && r.neighbor_id == target_id
        })
    }

    pub(crate) async fn incident(&self, op: Operation, id: &str) -> Result<Vec<Relationship>> {
        let rows = self
            .run(
                op,
                &format!("reading relationships of {id}"),
                Statement::IncidentEdges,
                Params::new().with("id", id),
            )
            .await?;
        rows.iter()
            .map(|row| Relationship::from_row(row).map_err(|reason| GraphError::corrupt(op, id, reason)))
            .collect()
    }

    async fn copy_relationship(
        &self,
        op: Operation,
        target_id: &str,
        neighbor_id: &str,
        rel: &Relationship,
    ) -> Result<()> {
        require_identifier(op, "relationship type", &rel.rel_type)?;
        let rows = self
            .run(
                op,
                &format!(
                    "copying {} relationship {target_id} / {neighbor_id}",
                    rel.rel_type
                ),
                Statement::MergeEdge {
                    rel_type: rel.rel_type.clone(),
                    direction: rel.direction,
                    on_create_only: false,
                },
                Params::new()
                    .with("anchor_id", target_id)
                    .with("neighbor_id", neighbor_id)
                    .with("props", rel.properties.clone()),
            )
            .await?;
        if rows.is_empty() {
            return Err(GraphError::not_found(op, neighbor_id));
        }
        Ok(())
    }

    async fn retire_source(
        &self,
        op: Operation,
        target_id: &str,
        source_id: &str,
        retention: SourceRetention,
        linked: bool,
    ) -> Result<()> {
        match retention {
            SourceRetention::HardDelete => {
                self.run(
                    op,
                    &format!("deleting merged node {source_id}"),
                    Statement::DetachDelete,
                    Params::new().with("id", source_id),
                )
                .await?;
            }
            // The link is written after the incident edges are closed, so an
            // existing one means only closing the node itself is left.
            SourceRetention::Close if linked => {
                self.close_node(op, source_id).await?;
            }
            SourceRetention::Close => {
                self.run(
                    op,
                    &format!("closing relationships of merged node {source_id}"),
                    Statement::CloseIncidentEdges,
                    Params::new()
                        .with("id", source_id)
                        .with(TT_END, encode_time(self.now())),
                )
                .await?;
                let merged_into = self.config.merged_into_type.clone();
                self.link(op, source_id, target_id, &merged_into).await?;
                self.close_node(op, source_id).await?;
            }
        }
        Ok(())
    }
}
