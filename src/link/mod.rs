//! Cross-project linking: external references, config resolution and
//! the two-pass matcher.
pub mod collector;
pub mod matcher;
pub mod resolver;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::mesh::{edge_id, EdgeType, Extraction, MeshEdge, Properties};

pub use collector::collect_references;
pub use matcher::{LinkOutcome, Matcher};
pub use resolver::ConfigResolver;

/// What kind of shared resource a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Queue,
    ApiCall,
    Database,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Queue => "queue",
            RefType::ApiCall => "api_call",
            RefType::Database => "database",
        }
    }
}

/// Which side of the shared resource the owning node sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefOperation {
    Publish,
    Subscribe,
    Call,
    Serve,
    Use,
}

impl RefOperation {
    /// Complementary operations are the ones worth linking: a producer
    /// to a consumer, a caller to an endpoint, two users of one table.
    pub fn complements(&self, other: RefOperation) -> bool {
        matches!(
            (*self, other),
            (RefOperation::Publish, RefOperation::Subscribe)
                | (RefOperation::Subscribe, RefOperation::Publish)
                | (RefOperation::Call, RefOperation::Serve)
                | (RefOperation::Serve, RefOperation::Call)
                | (RefOperation::Use, RefOperation::Use)
        )
    }
}

/// An external resource reference extracted from one project's nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub id: String,
    pub ref_type: RefType,
    pub project_id: String,
    pub node_id: String,
    /// Possibly a config placeholder like `${ORDERS_TOPIC}`.
    pub raw_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<String>,
    pub operation: RefOperation,
    /// Which config file supplied the resolved value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<String>,
}

impl ExternalReference {
    pub fn new(
        ref_type: RefType,
        project_id: &str,
        node_id: &str,
        raw_value: &str,
        operation: RefOperation,
    ) -> Self {
        let key = format!("{}\x1f{project_id}\x1f{node_id}\x1f{raw_value}", ref_type.as_str());
        Self {
            id: format!("r{:016x}", xxh3_64(key.as_bytes())),
            ref_type,
            project_id: project_id.to_string(),
            node_id: node_id.to_string(),
            raw_value: raw_value.to_string(),
            resolved_value: None,
            operation,
            config_source: None,
        }
    }

    /// The value used for matching: resolved when the resolver found
    /// one, raw otherwise.
    pub fn effective_value(&self) -> &str {
        self.resolved_value.as_deref().unwrap_or(&self.raw_value)
    }
}

/// An accepted pairing between two projects' references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossProjectLink {
    pub source: ExternalReference,
    pub target: ExternalReference,
    pub link_type: EdgeType,
    pub confidence: f64,
    /// `static:<value>` or the AI pass's explanation.
    pub reason: String,
}

impl CrossProjectLink {
    /// The mesh edge this link materializes as.
    pub fn to_edge(&self) -> MeshEdge {
        let mut properties = Properties::new();
        properties.insert("cross_project".to_string(), serde_json::Value::Bool(true));
        properties.insert(
            "reason".to_string(),
            serde_json::Value::String(self.reason.clone()),
        );
        MeshEdge {
            id: edge_id(self.link_type, &self.source.node_id, &self.target.node_id),
            edge_type: self.link_type,
            from_id: self.source.node_id.clone(),
            to_id: self.target.node_id.clone(),
            properties,
            extraction: Extraction {
                tier: 0,
                schema_id: None,
                pattern_id: None,
                confidence: self.confidence,
                extracted_at: chrono::Utc::now(),
            },
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complementary_operations() {
        assert!(RefOperation::Publish.complements(RefOperation::Subscribe));
        assert!(RefOperation::Serve.complements(RefOperation::Call));
        assert!(RefOperation::Use.complements(RefOperation::Use));
        assert!(!RefOperation::Publish.complements(RefOperation::Publish));
        assert!(!RefOperation::Call.complements(RefOperation::Subscribe));
    }

    #[test]
    fn test_reference_identity_is_stable() {
        let a = ExternalReference::new(RefType::Queue, "p", "n1", "orders", RefOperation::Publish);
        let b = ExternalReference::new(RefType::Queue, "p", "n1", "orders", RefOperation::Publish);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_link_edge_is_tagged() {
        let source =
            ExternalReference::new(RefType::Queue, "x", "n1", "orders", RefOperation::Publish);
        let target =
            ExternalReference::new(RefType::Queue, "y", "n2", "orders", RefOperation::Subscribe);
        let link = CrossProjectLink {
            source,
            target,
            link_type: EdgeType::PublishesTo,
            confidence: 0.95,
            reason: "static:orders".to_string(),
        };
        let edge = link.to_edge();
        assert_eq!(edge.edge_type, EdgeType::PublishesTo);
        assert_eq!(edge.properties["cross_project"], true);
    }
}
