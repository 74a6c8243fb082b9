/// End-to-end integration tests for the extraction pipeline.
///
/// Tests the complete flow:
///   walk → Tier-1 extraction → store merge → query → cross-project link
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use codemesh::extract::{FileExtractor, Pipeline, PipelineConfig, PipelineOutput};
use codemesh::link::{collect_references, ConfigResolver, Matcher};
use codemesh::llm::MockProvider;
use codemesh::mesh::{
    edge_id, node_id, EdgeType, Extraction, MeshDocument, MeshEdge, MeshNode, NodeType,
    ProjectInfo, Properties, SourceLocation,
};
use codemesh::schema::store::SchemaStore;
use codemesh::store::Db;
use codemesh::trust::TrustEngine;

const FASTAPI_APP: &str = r#"from fastapi import FastAPI
from models import Order

app = FastAPI()

class Order(Base):
    __tablename__ = "orders"

@app.get("/orders")
def list_orders():
    return []

@app.post("/orders")
def create_order(payload):
    return payload
"#;

fn project_info(id: &str) -> ProjectInfo {
    ProjectInfo {
        id: id.to_string(),
        path: format!("/tmp/{id}"),
        branch: Some("main".to_string()),
        commit: None,
    }
}

async fn extract(root: &Path, provider: Option<Arc<MockProvider>>, ai: bool) -> PipelineOutput {
    let config = PipelineConfig {
        ai_enabled: ai,
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        Arc::new(SchemaStore::with_builtins()),
        Arc::new(TrustEngine::new()),
        provider.map(|p| p as Arc<dyn codemesh::llm::LlmProvider>),
        config,
    );
    let extractor = FileExtractor::new(&[], &[], 512).unwrap();
    let (entries, ctx) = extractor.collect(root).unwrap();
    pipeline
        .run(project_info("shop"), root, entries, ctx, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tier1_extracts_endpoints_and_tables_from_one_file() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("app.py"), FASTAPI_APP).unwrap();
    fs::write(
        temp.path().join("requirements.txt"),
        "fastapi==0.110\nsqlalchemy>=2.0\n",
    )
    .unwrap();

    let output = extract(temp.path(), None, false).await;
    let doc = &output.document;
    assert!(output.failures.is_empty());

    let endpoint = doc
        .nodes
        .iter()
        .find(|n| n.node_type == NodeType::ApiEndpoint && n.name == "GET /orders")
        .expect("route extracted as an endpoint");
    assert!(endpoint.extraction.confidence >= 0.5);
    assert_eq!(
        endpoint.properties.get("method").and_then(|v| v.as_str()),
        Some("GET")
    );

    let table = doc
        .nodes
        .iter()
        .find(|n| n.node_type == NodeType::DatabaseTable)
        .expect("__tablename__ extracted as a table");
    assert_eq!(table.name, "orders");

    // Every entity hangs off the file node.
    let file_node = doc
        .nodes
        .iter()
        .find(|n| n.node_type == NodeType::File)
        .unwrap();
    assert!(doc.edges.iter().any(|e| {
        e.edge_type == EdgeType::Contains && e.from_id == file_node.id && e.to_id == endpoint.id
    }));
    assert!(doc.edges.iter().any(|e| {
        e.edge_type == EdgeType::Contains && e.from_id == file_node.id && e.to_id == table.id
    }));
}

#[tokio::test]
async fn test_extract_then_store_then_query() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("app.py"), FASTAPI_APP).unwrap();
    fs::write(temp.path().join("requirements.txt"), "fastapi\nsqlalchemy\n").unwrap();

    let output = extract(temp.path(), None, false).await;
    let mut db = Db::open_in_memory().unwrap();
    let summary = db.store_document(&output.document, "main", false, &[]).unwrap();
    assert_eq!(summary.nodes, output.document.nodes.len());
    assert_eq!(summary.dangling_dropped, 0);

    let stats = db.project_stats("shop", "main").unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.by_type["ApiEndpoint"], 2);
    assert_eq!(stats.by_type["DatabaseTable"], 1);

    // Second store of the same document is idempotent.
    db.store_document(&output.document, "main", true, &[]).unwrap();
    let again = db.project_stats("shop", "main").unwrap();
    assert_eq!(again.nodes, stats.nodes);
    assert_eq!(db.dangling_edge_count().unwrap(), 0);
}

#[tokio::test]
async fn test_unparseable_model_output_degrades_without_crashing() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("app.py"), "def handler():\n    pass\n").unwrap();

    // Every completion returns garbage: verification must degrade to
    // rejection and discovery must fail quietly.
    let mock = Arc::new(MockProvider::with_responses(["certainly! here is my answer"]));
    let output = extract(temp.path(), Some(mock), true).await;

    assert!(output.failures.is_empty(), "provider garbage is not a file failure");
    assert!(output.document.statistics.tier2_rejected >= 1);
    assert!(output
        .document
        .nodes
        .iter()
        .any(|n| n.node_type == NodeType::File), "file node survives");
}

// ── Cross-project linking ────────────────────────────────────────────

fn resource_node(project: &str, node_type: NodeType, name: &str, topic: &str) -> MeshNode {
    let mut properties = Properties::new();
    properties.insert(
        "topic".to_string(),
        serde_json::Value::String(topic.to_string()),
    );
    MeshNode {
        id: node_id(project, "worker.py", node_type, name, 0),
        node_type,
        name: name.to_string(),
        properties,
        source: SourceLocation {
            file: "worker.py".to_string(),
            line_start: 1,
            line_end: 3,
        },
        project_id: project.to_string(),
        extraction: Extraction::tier1(None, None, 0.9),
    }
}

fn file_node(project: &str) -> MeshNode {
    MeshNode {
        id: node_id(project, "worker.py", NodeType::File, "worker.py", 0),
        node_type: NodeType::File,
        name: "worker.py".to_string(),
        properties: Properties::new(),
        source: SourceLocation {
            file: "worker.py".to_string(),
            line_start: 1,
            line_end: 10,
        },
        project_id: project.to_string(),
        extraction: Extraction::tier1(None, None, 1.0),
    }
}

fn document_for(project: &str, nodes: Vec<MeshNode>) -> MeshDocument {
    let mut doc = MeshDocument::new(project_info(project));
    let file = file_node(project);
    let edges: Vec<MeshEdge> = nodes
        .iter()
        .map(|n| MeshEdge {
            id: edge_id(EdgeType::Contains, &file.id, &n.id),
            edge_type: EdgeType::Contains,
            from_id: file.id.clone(),
            to_id: n.id.clone(),
            properties: Properties::new(),
            extraction: Extraction::tier1(None, None, 1.0),
        })
        .collect();
    doc.nodes.push(file);
    doc.nodes.extend(nodes);
    doc.edges = edges;
    doc
}

#[tokio::test]
async fn test_queue_topic_links_two_projects_without_llm() {
    let mut db = Db::open_in_memory().unwrap();

    let producer = resource_node(
        "orders-api",
        NodeType::QueueProducer,
        "publish_order",
        "orders.created",
    );
    let consumer = resource_node(
        "billing-worker",
        NodeType::QueueConsumer,
        "handle_order",
        "orders.created",
    );
    db.store_document(&document_for("orders-api", vec![producer]), "main", false, &[])
        .unwrap();
    db.store_document(
        &document_for("billing-worker", vec![consumer]),
        "main",
        false,
        &[],
    )
    .unwrap();

    let mut refs = Vec::new();
    for project in ["orders-api", "billing-worker"] {
        let nodes = db
            .nodes_by_types(project, "main", &[NodeType::QueueProducer, NodeType::QueueConsumer])
            .unwrap();
        refs.extend(collect_references(project, &nodes));
    }
    assert_eq!(refs.len(), 2);

    // A reachable provider is configured but the static pass must pair
    // the identical topics on its own.
    let mock = Arc::new(MockProvider::with_responses([r#"{"pairs": []}"#]));
    let outcome = Matcher::new(Some(mock.clone())).link(refs).await;

    assert_eq!(outcome.links.len(), 1);
    let link = &outcome.links[0];
    assert_eq!(link.link_type, EdgeType::PublishesTo);
    assert!(link.confidence >= 0.9);
    assert_eq!(link.source.project_id, "orders-api");
    assert_eq!(link.target.project_id, "billing-worker");
    assert_eq!(mock.call_count(), 0, "static match must not consult the model");

    // The link persists as a cross-project edge.
    db.insert_link(link).unwrap();
    assert!(db.insert_cross_project_edge("main", &link.to_edge()).unwrap());
    assert_eq!(db.clear_links_between("orders-api", "billing-worker").unwrap(), 1);
}

#[tokio::test]
async fn test_config_placeholder_resolves_before_matching() {
    let producer_root = tempdir().unwrap();
    fs::write(
        producer_root.path().join(".env"),
        "ORDERS_TOPIC=orders.created\n",
    )
    .unwrap();

    let producer = resource_node(
        "orders-api",
        NodeType::QueueProducer,
        "publish_order",
        "${ORDERS_TOPIC}",
    );
    let consumer = resource_node(
        "billing-worker",
        NodeType::QueueConsumer,
        "handle_order",
        "orders.created",
    );

    let mut refs = collect_references("orders-api", &[producer]);
    ConfigResolver::load(producer_root.path()).resolve(&mut refs);
    assert_eq!(refs[0].effective_value(), "orders.created");
    assert_eq!(refs[0].config_source.as_deref(), Some(".env"));

    refs.extend(collect_references("billing-worker", &[consumer]));
    let outcome = Matcher::new(None).link(refs).await;
    assert_eq!(outcome.links.len(), 1);
    assert_eq!(outcome.links[0].link_type, EdgeType::PublishesTo);
}
