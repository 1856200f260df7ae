use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;
use strata::{
    BitemporalGraph, ErrorKind, GraphConfig, GraphError, GraphStore, LocalGraphStore, Params,
    Properties, Row, SourceRetention, Statement, StoreError,
};

/// Wraps a real store and fails once, on the statement matching `fails_on`
/// after `skip` earlier matches went through. With `persistent` it keeps
/// failing every match from then on.
struct ScriptedStore {
    inner: LocalGraphStore,
    fails_on: fn(&Statement) -> bool,
    failure: StoreError,
    armed: Mutex<Option<usize>>,
    persistent: bool,
    issued: Mutex<Vec<Statement>>,
}

impl ScriptedStore {
    fn new(fails_on: fn(&Statement) -> bool, skip: usize, failure: StoreError) -> Self {
        Self {
            inner: LocalGraphStore::open_in_memory().unwrap(),
            fails_on,
            failure,
            armed: Mutex::new(Some(skip)),
            persistent: false,
            issued: Mutex::new(Vec::new()),
        }
    }

    fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    fn never() -> Self {
        Self::new(|_| false, 0, StoreError::Unavailable("unused".into()))
    }

    fn issued(&self) -> Vec<Statement> {
        self.issued.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphStore for ScriptedStore {
    async fn query(&self, statement: &Statement, params: &Params) -> Result<Vec<Row>, StoreError> {
        self.issued.lock().unwrap().push(statement.clone());
        if (self.fails_on)(statement) {
            let mut armed = self.armed.lock().unwrap();
            match *armed {
                Some(0) => {
                    if !self.persistent {
                        *armed = None;
                    }
                    return Err(self.failure.clone());
                }
                Some(n) => *armed = Some(n - 1),
                None => {}
            }
        }
        self.inner.query(statement, params).await
    }
}

fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn unreachable_store_surfaces_as_retryable() {
    let store = ScriptedStore::new(
        |_| true,
        0,
        StoreError::Unavailable("connection refused".into()),
    )
    .persistent();
    let graph = BitemporalGraph::new(store);
    let err = graph
        .write_node("Entity", props(json!({ "id": "e1" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());
    assert!(err.to_string().contains("e1"));
}

#[tokio::test]
async fn interrupted_update_resumes_on_retry() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CloseNode),
        0,
        StoreError::Unavailable("timeout".into()),
    );
    let graph = BitemporalGraph::new(store);
    graph.write_node("Entity", props(json!({ "id": "n1" }))).await.unwrap();

    let err = graph
        .update_node("n1", "Entity", props(json!({ "id": "n1-v2" })))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Interrupted { .. }));
    assert_eq!(err.failed_step(), Some("close_original"));
    assert!(err.is_retryable());

    // Intermediate state: successor and link exist, original still current.
    assert!(graph.node("n1").await.unwrap().unwrap().is_current());
    assert!(graph.node("n1-v2").await.unwrap().is_some());

    // The scripted failure fired once; the retry goes through.
    let new_id = graph
        .update_node("n1", "Entity", props(json!({ "id": "n1-v2" })))
        .await
        .unwrap();
    assert_eq!(new_id, "n1-v2");
    assert!(!graph.node("n1").await.unwrap().unwrap().is_current());
    assert_eq!(graph.relationships("n1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_merge_deletion_leaves_both_nodes_intact() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::DetachDelete),
        0,
        StoreError::Unavailable("broken pipe".into()),
    );
    let graph = BitemporalGraph::new(store);
    for id in ["target", "source", "peer"] {
        graph.write_node("Entity", props(json!({ "id": id }))).await.unwrap();
    }
    graph.write_edge("source", "peer", "RELATED_TO", None).await.unwrap();

    let err = graph.merge_nodes("target", "source").await.unwrap_err();
    assert_eq!(err.failed_step(), Some("retire_source"));

    assert!(graph.node("source").await.unwrap().is_some());
    assert_eq!(graph.relationships("source").await.unwrap().len(), 1);
    assert_eq!(graph.relationships("target").await.unwrap().len(), 1);

    graph.merge_nodes("target", "source").await.unwrap();
    assert!(graph.node("source").await.unwrap().is_none());
    assert_eq!(graph.relationships("target").await.unwrap().len(), 1);
}

fn close_retention() -> GraphConfig {
    GraphConfig {
        merge_retention: SourceRetention::Close,
        ..GraphConfig::default()
    }
}

async fn current_related(graph: &BitemporalGraph<ScriptedStore>, id: &str) -> Vec<bool> {
    graph
        .relationships(id)
        .await
        .unwrap()
        .iter()
        .filter(|r| r.rel_type == "RELATED_TO")
        .map(|r| r.is_current())
        .collect()
}

#[tokio::test]
async fn repeated_close_merge_leaves_target_untouched() {
    let graph = BitemporalGraph::with_config(ScriptedStore::never(), close_retention()).unwrap();
    for id in ["target", "source", "peer"] {
        graph.write_node("Entity", props(json!({ "id": id }))).await.unwrap();
    }
    graph
        .write_edge("source", "peer", "RELATED_TO", Some(props(json!({ "id": "r1" }))))
        .await
        .unwrap();

    let first = graph.merge_nodes("target", "source").await.unwrap();
    assert_eq!(first.relationships_copied, 1);
    assert_eq!(current_related(&graph, "target").await, vec![true]);

    let second = graph.merge_nodes("target", "source").await.unwrap();
    assert!(second.source_found);
    assert_eq!(second.relationships_copied, 0);
    assert_eq!(current_related(&graph, "target").await, vec![true]);
}

#[tokio::test]
async fn close_merge_interrupted_before_closing_source_resumes() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CloseNode),
        0,
        StoreError::Unavailable("timeout".into()),
    );
    let graph = BitemporalGraph::with_config(store, close_retention()).unwrap();
    for id in ["target", "source", "peer"] {
        graph.write_node("Entity", props(json!({ "id": id }))).await.unwrap();
    }
    graph.write_edge("source", "peer", "RELATED_TO", None).await.unwrap();

    let err = graph.merge_nodes("target", "source").await.unwrap_err();
    assert_eq!(err.failed_step(), Some("retire_source"));
    assert!(graph.node("source").await.unwrap().unwrap().is_current());
    assert_eq!(current_related(&graph, "source").await, vec![false]);

    let report = graph.merge_nodes("target", "source").await.unwrap();
    assert_eq!(report.relationships_copied, 0);
    assert_eq!(current_related(&graph, "target").await, vec![true]);
    assert!(!graph.node("source").await.unwrap().unwrap().is_current());

    let merged: Vec<_> = graph
        .relationships("source")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.rel_type == "MERGED_INTO")
        .collect();
    assert_eq!(merged.len(), 1);
    assert!(merged[0].is_current());
}

#[tokio::test]
async fn self_merge_issues_no_statements() {
    let graph = BitemporalGraph::new(ScriptedStore::never());
    let err = graph.merge_nodes("a", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(graph.store().issued().is_empty());
}

#[tokio::test]
async fn non_fulltext_index_failure_aborts_setup() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CreateIndex(spec) if spec.name == "entity_embedding"),
        0,
        StoreError::Rejected("vector indexes unsupported".into()),
    );
    let graph = BitemporalGraph::new(store);
    let err = graph.create_entity_indexes().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.to_string().contains("entity_embedding"));

    // Nothing after the failing declaration was attempted.
    let issued = graph.store().issued();
    assert!(matches!(issued.last(), Some(Statement::CreateIndex(spec)) if spec.name == "entity_embedding"));
}

#[tokio::test]
async fn already_exists_on_guarded_index_is_not_swallowed() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CreateIndex(spec) if spec.name == "entity_type"),
        0,
        StoreError::AlreadyExists("entity_type".into()),
    );
    let graph = BitemporalGraph::new(store);
    let err = graph.create_entity_indexes().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IndexAlreadyExists);
}

#[tokio::test]
async fn node_creation_failures_carry_context() {
    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CreateNode { .. }),
        0,
        StoreError::Rejected("label not allowed".into()),
    );
    let graph = BitemporalGraph::new(store);
    let err = graph
        .write_node("Entity", props(json!({ "id": "e7" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.to_string().contains("creating node e7"));

    let store = ScriptedStore::new(
        |s| matches!(s, Statement::CreateNode { .. }),
        0,
        StoreError::Conflict("duplicate".into()),
    );
    let graph = BitemporalGraph::new(store);
    let err = graph
        .write_node("Entity", props(json!({ "id": "e7" })))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(graph.store().issued().len(), 1);
}
