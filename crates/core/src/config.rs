//! Schema configuration: labels, relationship types and traversal caps.

use crate::store::is_identifier;
use serde::{Deserialize, Serialize};

/// What happens to the source node once a merge has copied its
/// relationships onto the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRetention {
    /// Detach-delete the source. Its history, including any closed
    /// relationships, is gone afterwards. Treats a merge as a correction.
    #[default]
    HardDelete,
    /// Close the source and its relationships and record a `MERGED_INTO`
    /// edge from source to target. Keeps the audit trail.
    Close,
}

/// How the history reader walks from a root record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Relationship from the root to the first record of the chain.
    pub first_type: String,
    /// Relationship linking each record to the next one.
    pub next_type: String,
    /// Maximum number of `next_type` hops after the first record.
    pub max_hops: usize,
    /// Discriminator written to every timeline item's `kind`.
    pub record_kind: String,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            first_type: "TRIGGERS".to_string(),
            next_type: "NEXT".to_string(),
            max_hops: 100,
            record_kind: "thought".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Label of the nodes carrying `name`, `type` and `embedding`.
    pub entity_label: String,
    /// Length every entity `embedding` must have.
    pub embedding_dimensions: usize,
    /// Record → entity relationship indexed for time-window queries.
    pub mentions_type: String,
    /// Entity → entity relationship indexed for time-window queries.
    pub related_type: String,
    /// Lineage edge, always written successor → predecessor.
    pub replaces_type: String,
    /// Edge recorded from a retired merge source to its target.
    pub merged_into_type: String,
    pub merge_retention: SourceRetention,
    pub timeline: TimelineConfig,
    /// Cap on `REPLACES` hops followed when reading a lineage.
    pub lineage_max_hops: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            entity_label: "Entity".to_string(),
            embedding_dimensions: 384,
            mentions_type: "MENTIONS".to_string(),
            related_type: "RELATED_TO".to_string(),
            replaces_type: "REPLACES".to_string(),
            merged_into_type: "MERGED_INTO".to_string(),
            merge_retention: SourceRetention::default(),
            timeline: TimelineConfig::default(),
            lineage_max_hops: 1000,
        }
    }
}

impl GraphConfig {
    /// Check that every name interpolated into statement text is a plain
    /// identifier and that traversal caps are non-zero.
    pub fn validate(&self) -> Result<(), String> {
        let names = [
            ("entity_label", &self.entity_label),
            ("mentions_type", &self.mentions_type),
            ("related_type", &self.related_type),
            ("replaces_type", &self.replaces_type),
            ("merged_into_type", &self.merged_into_type),
            ("timeline.first_type", &self.timeline.first_type),
            ("timeline.next_type", &self.timeline.next_type),
        ];
        for (field, value) in names {
            if !is_identifier(value) {
                return Err(format!("{field} `{value}` is not a valid identifier"));
            }
        }
        if self.embedding_dimensions == 0 {
            return Err("embedding_dimensions must be >= 1".to_string());
        }
        if self.timeline.max_hops == 0 {
            return Err("timeline.max_hops must be >= 1".to_string());
        }
        if self.lineage_max_hops == 0 {
            return Err("lineage_max_hops must be >= 1".to_string());
        }
        if self.timeline.record_kind.trim().is_empty() {
            return Err("timeline.record_kind must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GraphConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding_dimensions, 384);
        assert_eq!(config.timeline.max_hops, 100);
        assert_eq!(config.merge_retention, SourceRetention::HardDelete);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: GraphConfig = serde_json::from_str(
            r#"{ "merge_retention": "close", "timeline": { "max_hops": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.merge_retention, SourceRetention::Close);
        assert_eq!(config.timeline.max_hops, 5);
        assert_eq!(config.timeline.next_type, "NEXT");
        assert_eq!(config.entity_label, "Entity");
    }

    #[test]
    fn rejects_injection_in_relationship_type() {
        let config = GraphConfig {
            related_type: "RELATED_TO]->() DETACH DELETE n //".to_string(),
            ..GraphConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("related_type"));
    }

    #[test]
    fn rejects_zero_caps() {
        let mut config = GraphConfig::default();
        config.timeline.max_hops = 0;
        assert!(config.validate().is_err());
    }
}
