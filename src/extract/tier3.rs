//! Tier-3: full-file rediscovery for low-confidence files.
//!
//! Output is strictly additive: the pipeline merges it against Tier-1
//! results, preferring whichever extraction is more confident for the
//! same span. Suggested patterns ride along as evolution candidates.
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::extract::files::SourceFile;
use crate::llm::{parse_json_response, CompletionRequest, LlmError, LlmProvider};
use crate::mesh::{
    edge_id, node_id, EdgeType, Extraction, MeshEdge, MeshNode, NodeType, Properties,
    SourceLocation,
};

const DEFAULT_MAX_CONTENT_BYTES: usize = 48 * 1024;
const DEFAULT_DISCOVERY_CONFIDENCE: f64 = 0.7;

/// A regex candidate proposed by the model, handed to the evolver for
/// validation before anything is persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct SuggestedPattern {
    pub name: String,
    pub regex: String,
    pub node_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub nodes: Vec<MeshNode>,
    pub edges: Vec<MeshEdge>,
    pub framework: Option<String>,
    pub confidence: f64,
    pub suggested_patterns: Vec<SuggestedPattern>,
}

#[derive(Deserialize)]
struct DiscoveryResponse {
    #[serde(default)]
    framework: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    nodes: Vec<DiscoveredNode>,
    #[serde(default)]
    edges: Vec<DiscoveredEdge>,
    #[serde(default)]
    suggested_patterns: Vec<SuggestedPattern>,
}

#[derive(Deserialize)]
struct DiscoveredNode {
    #[serde(rename = "type")]
    node_type: String,
    name: String,
    #[serde(default)]
    line_start: Option<usize>,
    #[serde(default)]
    line_end: Option<usize>,
    #[serde(default)]
    properties: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct DiscoveredEdge {
    #[serde(rename = "type")]
    edge_type: String,
    from: String,
    to: String,
}

pub struct Discoverer {
    provider: Arc<dyn LlmProvider>,
    max_content_bytes: usize,
}

impl Discoverer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }

    pub async fn discover(
        &self,
        project: &str,
        file: &SourceFile,
    ) -> Result<Discovery, LlmError> {
        let content = truncate_utf8(&file.content, self.max_content_bytes);
        let prompt = format!(
            "Analyze this {language} source file and derive its structure.\n\
             File: {path}\n\n\
             ```\n{content}\n```\n\n\
             Respond with JSON:\n\
             {{\"framework\": \"...\" | null, \"confidence\": 0.0-1.0,\n \
             \"nodes\": [{{\"type\": \"Function|Class|Method|Interface|Module|ApiEndpoint|DatabaseTable|QueueProducer|QueueConsumer|ServiceCall\",\n   \
             \"name\": \"...\", \"line_start\": N, \"line_end\": N, \"properties\": {{}}}}],\n \
             \"edges\": [{{\"type\": \"CALLS|IMPORTS|INHERITS|READS_FROM|WRITES_TO|PUBLISHES_TO|SUBSCRIBES_TO|EXPOSES\", \"from\": \"name\", \"to\": \"name\"}}],\n \
             \"suggested_patterns\": [{{\"name\": \"...\", \"regex\": \"...\", \"node_type\": \"...\", \"description\": \"...\"}}]}}",
            language = file.language.unwrap_or("unknown"),
            path = file.path,
        );
        let request = CompletionRequest::new(prompt)
            .with_system("You analyze source code structure. Respond with JSON only.")
            .max_tokens(4096);

        let raw = self.provider.complete(&request).await?;
        let parsed: DiscoveryResponse = serde_json::from_value(parse_json_response(&raw)?)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        Ok(self.materialize(project, file, parsed))
    }

    /// Turn the parsed response into mesh nodes/edges with tier-3
    /// provenance. Unknown node/edge types are dropped, not errors.
    fn materialize(
        &self,
        project: &str,
        file: &SourceFile,
        parsed: DiscoveryResponse,
    ) -> Discovery {
        let confidence = parsed.confidence.unwrap_or(DEFAULT_DISCOVERY_CONFIDENCE);
        let mut nodes = Vec::new();
        let mut by_name: HashMap<String, String> = HashMap::new();
        let mut ordinals: HashMap<(String, String), usize> = HashMap::new();

        for d in parsed.nodes {
            let Some(node_type) = NodeType::parse(&d.node_type) else {
                debug!("Dropping discovered node with unknown type {:?}", d.node_type);
                continue;
            };
            let ordinal = {
                let n = ordinals
                    .entry((d.node_type.clone(), d.name.clone()))
                    .or_insert(0);
                let current = *n;
                *n += 1;
                current
            };
            let line_start = d.line_start.unwrap_or(1).max(1);
            let line_end = d.line_end.unwrap_or(line_start).max(line_start);
            let id = node_id(project, &file.path, node_type, &d.name, ordinal);
            by_name.entry(d.name.clone()).or_insert_with(|| id.clone());

            let mut properties = Properties::new();
            if let Some(props) = d.properties {
                properties.extend(props);
            }

            nodes.push(MeshNode {
                id,
                node_type,
                name: d.name,
                properties,
                source: SourceLocation {
                    file: file.path.clone(),
                    line_start,
                    line_end,
                },
                project_id: project.to_string(),
                extraction: Extraction::tier3(d.confidence.unwrap_or(confidence)),
            });
        }

        let mut edges = Vec::new();
        for d in parsed.edges {
            let Some(edge_type) = EdgeType::parse(&d.edge_type) else {
                debug!("Dropping discovered edge with unknown type {:?}", d.edge_type);
                continue;
            };
            let (Some(from_id), Some(to_id)) = (by_name.get(&d.from), by_name.get(&d.to)) else {
                continue;
            };
            edges.push(MeshEdge {
                id: edge_id(edge_type, from_id, to_id),
                edge_type,
                from_id: from_id.clone(),
                to_id: to_id.clone(),
                properties: Properties::new(),
                extraction: Extraction::tier3(confidence),
            });
        }

        Discovery {
            nodes,
            edges,
            framework: parsed.framework,
            confidence,
            suggested_patterns: parsed.suggested_patterns,
        }
    }
}

/// Truncate at a UTF-8 boundary at or below `max` bytes.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Tests ────────────────────────────────────────────────────────────
