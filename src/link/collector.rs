//! Reference collection from stored mesh nodes.
use crate::link::{ExternalReference, RefOperation, RefType};
use crate::mesh::{MeshNode, NodeType};

/// Pull the externally-visible references out of a project's nodes.
/// Only node types that describe shared resources participate; the
/// reference value prefers a specific property over the node name.
pub fn collect_references(project: &str, nodes: &[MeshNode]) -> Vec<ExternalReference> {
    let mut refs = Vec::new();
    for node in nodes {
        let (ref_type, operation, value) = match node.node_type {
            NodeType::QueueProducer => (
                RefType::Queue,
                RefOperation::Publish,
                property_or_name(node, "topic"),
            ),
            NodeType::QueueConsumer => (
                RefType::Queue,
                RefOperation::Subscribe,
                property_or_name(node, "topic"),
            ),
            NodeType::ServiceCall => (
                RefType::ApiCall,
                RefOperation::Call,
                property_or_name(node, "url"),
            ),
            NodeType::ApiEndpoint => (
                RefType::ApiCall,
                RefOperation::Serve,
                property_or_name(node, "path"),
            ),
            NodeType::DatabaseTable => (
                RefType::Database,
                RefOperation::Use,
                property_or_name(node, "table"),
            ),
            _ => continue,
        };
        if value.is_empty() {
            continue;
        }
        refs.push(ExternalReference::new(
            ref_type,
            project,
            &node.id,
            &value,
            operation,
        ));
    }
    refs
}

fn property_or_name(node: &MeshNode, key: &str) -> String {
    node.properties
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(&node.name)
        .to_string()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{node_id, Extraction, Properties, SourceLocation};

    fn node(node_type: NodeType, name: &str, prop: Option<(&str, &str)>) -> MeshNode {
        let mut properties = Properties::new();
        if let Some((k, v)) = prop {
            properties.insert(k.to_string(), serde_json::Value::String(v.to_string()));
        }
        MeshNode {
            id: node_id("p", "a.py", node_type, name, 0),
            node_type,
            name: name.to_string(),
            properties,
            source: SourceLocation {
                file: "a.py".to_string(),
                line_start: 1,
                line_end: 1,
            },
            project_id: "p".to_string(),
            extraction: Extraction::tier1(None, None, 0.8),
        }
    }

    #[test]
    fn test_collects_resource_nodes_only() {
        let nodes = vec![
            node(NodeType::Function, "handler", None),
            node(NodeType::QueueProducer, "publish_order", Some(("topic", "orders.created"))),
            node(NodeType::DatabaseTable, "orders", None),
        ];
        let refs = collect_references("p", &nodes);
        assert_eq!(refs.len(), 2);

        let queue = refs.iter().find(|r| r.ref_type == RefType::Queue).unwrap();
        assert_eq!(queue.raw_value, "orders.created", "property wins over name");
        assert_eq!(queue.operation, RefOperation::Publish);

        let table = refs.iter().find(|r| r.ref_type == RefType::Database).unwrap();
        assert_eq!(table.raw_value, "orders", "falls back to node name");
        assert_eq!(table.operation, RefOperation::Use);
    }

    #[test]
    fn test_endpoint_uses_path_property() {
        let nodes = vec![node(
            NodeType::ApiEndpoint,
            "GET /orders",
            Some(("path", "/orders")),
        )];
        let refs = collect_references("p", &nodes);
        assert_eq!(refs[0].raw_value, "/orders");
        assert_eq!(refs[0].operation, RefOperation::Serve);
    }
}
