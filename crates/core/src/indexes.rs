//! Index manager: the indexes entity lookups and time-window queries rely on.

use crate::config::GraphConfig;
use crate::record::{TT_END, TT_START, VT_END, VT_START};
use crate::store::{
    GraphStore, IndexKind, IndexSpec, IndexTarget, Params, Statement, StoreError,
    VectorSimilarity,
};
use crate::{BitemporalGraph, GraphError, Operation, Result};
use serde::Serialize;
use tracing::{debug, info};

/// Names of the declared indexes, split by whether the store reported them
/// as already present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub declared: Vec<String>,
    pub already_present: Vec<String>,
}

/// The full index set for `config`.
///
/// Fulltext declarations go out without `IF NOT EXISTS`: stores that lack
/// idempotent fulltext declaration reject the guard, so a repeat surfaces
/// as [`StoreError::AlreadyExists`] and is absorbed by
/// [`BitemporalGraph::create_entity_indexes`].
pub fn entity_index_specs(config: &GraphConfig) -> Vec<IndexSpec> {
    let label = &config.entity_label;
    let prefix = label.to_lowercase();
    let node = || IndexTarget::Node {
        label: label.clone(),
    };

    let mut specs = vec![
        IndexSpec {
            name: format!("{prefix}_name"),
            kind: IndexKind::Exact,
            target: node(),
            property: "name".to_string(),
            if_not_exists: true,
        },
        IndexSpec {
            name: format!("{prefix}_type"),
            kind: IndexKind::Exact,
            target: node(),
            property: "type".to_string(),
            if_not_exists: true,
        },
        IndexSpec {
            name: format!("{prefix}_name_fulltext"),
            kind: IndexKind::FullText,
            target: node(),
            property: "name".to_string(),
            if_not_exists: false,
        },
        IndexSpec {
            name: format!("{prefix}_embedding"),
            kind: IndexKind::Vector {
                dimensions: config.embedding_dimensions,
                similarity: VectorSimilarity::Cosine,
            },
            target: node(),
            property: "embedding".to_string(),
            if_not_exists: true,
        },
    ];

    for rel_type in [&config.mentions_type, &config.related_type] {
        let prefix = rel_type.to_lowercase();
        for property in [VT_START, VT_END, TT_START, TT_END] {
            specs.push(IndexSpec {
                name: format!("{prefix}_{property}"),
                kind: IndexKind::Range,
                target: IndexTarget::Relationship {
                    rel_type: rel_type.clone(),
                },
                property: property.to_string(),
                if_not_exists: true,
            });
        }
    }
    specs
}

impl<S: GraphStore> BitemporalGraph<S> {
    /// Declare every entity and relationship index. Safe to re-run.
    ///
    /// An "already exists" answer is absorbed only for fulltext indexes.
    /// Any other failure aborts the remaining declarations and is returned.
    pub async fn create_entity_indexes(&self) -> Result<IndexReport> {
        let op = Operation::CreateEntityIndexes;
        let mut report = IndexReport::default();

        for spec in entity_index_specs(&self.config) {
            let name = spec.name.clone();
            let fulltext = spec.kind == IndexKind::FullText;
            debug!(index = %name, "declaring index");
            match self
                .store
                .query(&Statement::CreateIndex(spec), &Params::new())
                .await
            {
                Ok(_) => report.declared.push(name),
                Err(StoreError::AlreadyExists(_)) if fulltext => {
                    debug!(index = %name, "fulltext index already present");
                    report.already_present.push(name);
                }
                Err(e) => {
                    return Err(GraphError::from_store(
                        op,
                        format!("declaring index {name}"),
                        e,
                    ))
                }
            }
        }

        info!(
            declared = report.declared.len(),
            already_present = report.already_present.len(),
            "entity indexes ready"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalGraphStore;

    #[test]
    fn spec_set_covers_entities_and_both_relationship_types() {
        let specs = entity_index_specs(&GraphConfig::default());
        assert_eq!(specs.len(), 12);

        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        for expected in [
            "entity_name",
            "entity_type",
            "entity_name_fulltext",
            "entity_embedding",
            "mentions_vt_start",
            "mentions_tt_end",
            "related_to_vt_end",
            "related_to_tt_start",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }

        let fulltext: Vec<_> = specs
            .iter()
            .filter(|s| s.kind == IndexKind::FullText)
            .collect();
        assert_eq!(fulltext.len(), 1);
        assert!(!fulltext[0].if_not_exists);
        assert!(specs
            .iter()
            .filter(|s| s.kind != IndexKind::FullText)
            .all(|s| s.if_not_exists));
    }

    #[test]
    fn vector_dimension_follows_config() {
        let config = GraphConfig {
            embedding_dimensions: 768,
            ..GraphConfig::default()
        };
        let specs = entity_index_specs(&config);
        assert!(specs.iter().any(|s| matches!(
            s.kind,
            IndexKind::Vector {
                dimensions: 768,
                similarity: VectorSimilarity::Cosine
            }
        )));
    }

    #[tokio::test]
    async fn second_run_reports_fulltext_as_present() {
        let graph = BitemporalGraph::new(LocalGraphStore::open_in_memory().unwrap());
        let first = graph.create_entity_indexes().await.unwrap();
        assert_eq!(first.declared.len(), 12);
        assert!(first.already_present.is_empty());

        let second = graph.create_entity_indexes().await.unwrap();
        assert_eq!(second.already_present, vec!["entity_name_fulltext".to_string()]);
        assert_eq!(second.declared.len(), 11);
        assert_eq!(graph.store().declared_indexes().unwrap().len(), 12);
    }
}
