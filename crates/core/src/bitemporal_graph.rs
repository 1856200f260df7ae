//! Strata: bitemporal graph versioning over a pluggable graph store.
//!
//! Every node and edge carries two independent time axes:
//!
//! **Valid time** (`vt_start` / `vt_end`) captures when something was true
//! *in the modeled world*. **Transaction time** (`tt_start` / `tt_end`)
//! captures when the system *recorded* it. A record is current while its
//! `tt_end` is unset; closing it is the only mutation an existing record
//! ever sees.
//!
//! The engine never executes graph patterns itself. It speaks to a
//! [`GraphStore`] through typed [`Statement`]s and layers the versioning
//! protocol on top:
//!
//! - [`BitemporalGraph::write_node`] / [`write_edge`] create current records.
//! - [`BitemporalGraph::update_node`] writes a successor and links it to its
//!   predecessor with a `REPLACES` edge (new → old), then closes the old one.
//! - [`BitemporalGraph::delete_node`] soft-closes a node.
//! - [`BitemporalGraph::merge_nodes`] folds a duplicate node into a survivor.
//! - [`BitemporalGraph::create_entity_indexes`] declares the indexes the
//!   query layer relies on.
//! - [`BitemporalGraph::get_timeline`] rebuilds a bounded, valid-time ordered
//!   history for a root record.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use strata::{BitemporalGraph, LocalGraphStore};
//! use serde_json::json;
//!
//! # async fn demo() -> strata::Result<()> {
//! let store = LocalGraphStore::open("graph.redb").expect("open store");
//! let graph = BitemporalGraph::new(store);
//!
//! graph.create_entity_indexes().await?;
//! let data = json!({ "id": "n1", "name": "Acme" });
//! graph.write_node("Entity", data.as_object().cloned().unwrap_or_default()).await?;
//!
//! let next = json!({ "id": "n1-v2", "name": "Acme Corp" });
//! graph
//!     .update_node("n1", "Entity", next.as_object().cloned().unwrap_or_default())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`write_edge`]: BitemporalGraph::write_edge

mod config;
mod history;
mod indexes;
mod local_store;
mod merge;
mod record;
mod store;
mod writer;

use chrono::{DateTime, Utc};
use tracing::debug;

pub use config::{GraphConfig, SourceRetention, TimelineConfig};
pub use history::TimelineItem;
pub use indexes::{entity_index_specs, IndexReport};
pub use local_store::LocalGraphStore;
pub use merge::{MergeReport, MergeStep};
pub use record::{
    decode_time, encode_time, NodeRecord, Relationship, TemporalStamp, ID, TT_END, TT_START,
    VT_END, VT_START,
};
pub use store::{
    Direction, GraphStore, IndexKind, IndexSpec, IndexTarget, Params, Properties, Row, Statement,
    StoreError, VectorSimilarity,
};
pub use writer::UpdateStep;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// The public operation a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Configure,
    WriteNode,
    WriteEdge,
    UpdateNode,
    DeleteNode,
    CloseEdge,
    MergeNodes,
    CreateEntityIndexes,
    GetTimeline,
    ReadNode,
    ReadCurrentNodes,
    ReadLineage,
    ReadRelationships,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Configure => "configure",
            Operation::WriteNode => "write_node",
            Operation::WriteEdge => "write_edge",
            Operation::UpdateNode => "update_node",
            Operation::DeleteNode => "delete_node",
            Operation::CloseEdge => "close_edge",
            Operation::MergeNodes => "merge_nodes",
            Operation::CreateEntityIndexes => "create_entity_indexes",
            Operation::GetTimeline => "get_timeline",
            Operation::ReadNode => "read_node",
            Operation::ReadCurrentNodes => "read_current_nodes",
            Operation::ReadLineage => "read_lineage",
            Operation::ReadRelationships => "read_relationships",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("{op}: not found: {id}")]
    NotFound { op: Operation, id: String },
    #[error("{op}: invalid argument: {reason}")]
    InvalidArgument { op: Operation, reason: String },
    #[error("{op}: store unavailable while {context}: {source}")]
    StoreUnavailable {
        op: Operation,
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("{op}: index already exists: {name}")]
    IndexAlreadyExists { op: Operation, name: String },
    #[error("{op}: store error while {context}: {source}")]
    Store {
        op: Operation,
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("{op}: corrupt record {id}: {reason}")]
    Corrupt {
        op: Operation,
        id: String,
        reason: String,
    },
    /// A step of a multi-step operation failed after earlier steps had
    /// already been applied. The store holds exactly the state reached
    /// before `step`; re-running the whole operation resumes safely.
    #[error("{op} interrupted at step `{step}`: {source}")]
    Interrupted {
        op: Operation,
        step: &'static str,
        #[source]
        source: Box<GraphError>,
    },
}

/// Coarse classification used by callers to map failures onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    StoreUnavailable,
    IndexAlreadyExists,
    Store,
    Corrupt,
}

impl GraphError {
    pub(crate) fn not_found(op: Operation, id: impl Into<String>) -> Self {
        GraphError::NotFound { op, id: id.into() }
    }

    pub(crate) fn invalid(op: Operation, reason: impl Into<String>) -> Self {
        GraphError::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(op: Operation, id: impl Into<String>, reason: impl Into<String>) -> Self {
        GraphError::Corrupt {
            op,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Translate a port-level failure. `context` names what the engine was
    /// doing, including the ids involved.
    pub(crate) fn from_store(op: Operation, context: impl Into<String>, source: StoreError) -> Self {
        let context = context.into();
        match source {
            StoreError::Unavailable(_) => GraphError::StoreUnavailable {
                op,
                context,
                source,
            },
            StoreError::AlreadyExists(name) => GraphError::IndexAlreadyExists { op, name },
            StoreError::Conflict(_) | StoreError::Rejected(_) => GraphError::Store {
                op,
                context,
                source,
            },
        }
    }

    pub(crate) fn interrupted(self, op: Operation, step: &'static str) -> Self {
        GraphError::Interrupted {
            op,
            step,
            source: Box::new(self),
        }
    }

    /// The operation the failure surfaced from.
    pub fn operation(&self) -> Operation {
        match self {
            GraphError::NotFound { op, .. }
            | GraphError::InvalidArgument { op, .. }
            | GraphError::StoreUnavailable { op, .. }
            | GraphError::IndexAlreadyExists { op, .. }
            | GraphError::Store { op, .. }
            | GraphError::Corrupt { op, .. }
            | GraphError::Interrupted { op, .. } => *op,
        }
    }

    /// Classification of the root cause; `Interrupted` reports its cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::NotFound { .. } => ErrorKind::NotFound,
            GraphError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            GraphError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            GraphError::IndexAlreadyExists { .. } => ErrorKind::IndexAlreadyExists,
            GraphError::Store { .. } => ErrorKind::Store,
            GraphError::Corrupt { .. } => ErrorKind::Corrupt,
            GraphError::Interrupted { source, .. } => source.kind(),
        }
    }

    /// Whether re-issuing the same call may succeed. The engine itself
    /// never retries.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }

    /// Name of the step that failed, for interrupted multi-step operations.
    pub fn failed_step(&self) -> Option<&'static str> {
        match self {
            GraphError::Interrupted { step, .. } => Some(*step),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Bitemporal versioning engine bound to one graph store.
///
/// Holds no mutable state of its own: every call is an independent round
/// trip (or short sequence of round trips) against the store, so one
/// instance can be shared freely across tasks. Multi-step operations are
/// not atomic; see [`UpdateStep`] and [`MergeStep`] for what a partial
/// failure leaves behind.
pub struct BitemporalGraph<S> {
    store: S,
    config: GraphConfig,
    clock: fn() -> DateTime<Utc>,
}

impl<S: GraphStore> BitemporalGraph<S> {
    /// Bind the engine to `store` with the default schema configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: GraphConfig::default(),
            clock: Utc::now,
        }
    }

    /// Bind the engine to `store` with an explicit configuration.
    pub fn with_config(store: S, config: GraphConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|reason| GraphError::invalid(Operation::Configure, reason))?;
        Ok(Self {
            store,
            config,
            clock: Utc::now,
        })
    }

    /// Replace the wall clock used for transaction-time stamps.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Issue one statement, translating store failures into [`GraphError`].
    pub(crate) async fn run(
        &self,
        op: Operation,
        context: &str,
        statement: Statement,
        params: Params,
    ) -> Result<Vec<Row>> {
        debug!(operation = %op, statement = ?statement, context, "issuing statement");
        self.store
            .query(&statement, &params)
            .await
            .map_err(|e| GraphError::from_store(op, context, e))
    }

    /// Look up a node by id in any temporal state.
    pub(crate) async fn find_node(&self, op: Operation, id: &str) -> Result<Option<NodeRecord>> {
        let rows = self
            .run(
                op,
                &format!("reading node {id}"),
                Statement::FindNode,
                Params::new().with("id", id),
            )
            .await?;
        match rows.first() {
            Some(row) => NodeRecord::from_row(row)
                .map(Some)
                .map_err(|reason| GraphError::corrupt(op, id, reason)),
            None => Ok(None),
        }
    }
}

pub(crate) fn require_id(op: Operation, what: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(GraphError::invalid(op, format!("{what} must not be empty")));
    }
    Ok(())
}

pub(crate) fn require_identifier(op: Operation, what: &str, name: &str) -> Result<()> {
    if store::is_identifier(name) {
        Ok(())
    } else {
        Err(GraphError::invalid(
            op,
            format!("{what} `{name}` is not a valid identifier"),
        ))
    }
}
