//! Tier-2: model-assisted verification of sampled Tier-1 output.
//!
//! The verifier never fails the pipeline: provider errors and
//! unparseable model output both degrade to a rejection with zero
//! confidence, which the trust engine records like any other outcome.
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::extract::files::SourceFile;
use crate::llm::{parse_json_response, CompletionRequest, LlmProvider};
use crate::mesh::{Correction, MeshNode};
use crate::trust::VerifyStatus;

const DEFAULT_CONTEXT_LINES: usize = 3;

/// Result of verifying one node. `node` carries any corrections already
/// applied; a rejected node keeps its original content so the caller
/// can hand it to Tier-3.
#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub status: VerifyStatus,
    pub confidence: f64,
    pub node: MeshNode,
    pub correction: Option<Correction>,
    pub reasoning: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    status: String,
    #[serde(default)]
    corrected_name: Option<String>,
    #[serde(default)]
    corrected_line_start: Option<usize>,
    #[serde(default)]
    corrected_line_end: Option<usize>,
    #[serde(default)]
    corrected_properties: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct Verifier {
    provider: Arc<dyn LlmProvider>,
    context_lines: usize,
}

impl Verifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            context_lines: DEFAULT_CONTEXT_LINES,
        }
    }

    pub fn with_context_lines(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    pub async fn verify(&self, node: &MeshNode, file: &SourceFile) -> VerifyOutcome {
        let prompt = self.build_prompt(node, file);
        let request = CompletionRequest::new(prompt)
            .with_system("You verify code extractions. Respond with JSON only.");

        let raw = match self.provider.complete(&request).await {
            Ok(text) => text,
            Err(err) => {
                debug!(node = %node.id, "Verification call failed: {err}");
                return rejected(node, format!("provider error: {err}"));
            }
        };

        let parsed: VerifyResponse = match parse_json_response(&raw)
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| crate::llm::LlmError::InvalidResponse(e.to_string()))
            }) {
            Ok(p) => p,
            Err(err) => {
                debug!(node = %node.id, "Unparseable verification output: {err}");
                return rejected(node, format!("unparseable response: {err}"));
            }
        };

        let reasoning = parsed.reasoning.clone().unwrap_or_default();
        match parsed.status.as_str() {
            "verified" => {
                let confidence = parsed.confidence.unwrap_or(0.95);
                let mut node = node.clone();
                node.extraction.confidence = node.extraction.confidence.max(confidence);
                VerifyOutcome {
                    status: VerifyStatus::Verified,
                    confidence,
                    node,
                    correction: None,
                    reasoning,
                }
            }
            "corrected" => self.apply_correction(node, file, parsed, reasoning),
            "rejected" => {
                let confidence = parsed.confidence.unwrap_or(0.0);
                VerifyOutcome {
                    status: VerifyStatus::Rejected,
                    confidence,
                    node: node.clone(),
                    correction: Some(correction_record(node, None, None, file, &reasoning)),
                    reasoning,
                }
            }
            other => {
                debug!(node = %node.id, "Unknown verification status {other:?}");
                rejected(node, format!("unknown status: {other}"))
            }
        }
    }

    fn apply_correction(
        &self,
        node: &MeshNode,
        file: &SourceFile,
        parsed: VerifyResponse,
        reasoning: String,
    ) -> VerifyOutcome {
        let mut updated = node.clone();
        if let Some(name) = parsed.corrected_name {
            updated.name = name;
        }
        if let Some(start) = parsed.corrected_line_start {
            updated.source.line_start = start;
        }
        if let Some(end) = parsed.corrected_line_end {
            updated.source.line_end = end.max(updated.source.line_start);
        }
        if let Some(props) = parsed.corrected_properties {
            for (key, value) in props {
                updated.properties.insert(key, value);
            }
        }
        let confidence = parsed.confidence.unwrap_or(0.85);
        updated.extraction.confidence = confidence;

        let correction = correction_record(
            node,
            Some(updated.source.line_start),
            Some(updated.source.line_end),
            file,
            &reasoning,
        );

        VerifyOutcome {
            status: VerifyStatus::Corrected,
            confidence,
            node: updated,
            correction: Some(correction),
            reasoning,
        }
    }

    fn build_prompt(&self, node: &MeshNode, file: &SourceFile) -> String {
        let snippet = context_snippet(file, node, self.context_lines);
        format!(
            "A pattern extracted this entity from {path}:\n\
             - type: {node_type}\n\
             - name: {name}\n\
             - lines: {start}-{end}\n\
             - properties: {props}\n\n\
             Source context (numbered lines):\n{snippet}\n\n\
             Is the extraction correct? Respond with JSON:\n\
             {{\"status\": \"verified\" | \"corrected\" | \"rejected\",\n \
             \"corrected_name\": \"...\", \"corrected_line_start\": N,\n \
             \"corrected_line_end\": N, \"corrected_properties\": {{}},\n \
             \"confidence\": 0.0-1.0, \"reasoning\": \"...\"}}",
            path = node.source.file,
            node_type = node.node_type.as_str(),
            name = node.name,
            start = node.source.line_start,
            end = node.source.line_end,
            props = serde_json::to_string(&node.properties).unwrap_or_else(|_| "{}".to_string()),
        )
    }
}

fn rejected(node: &MeshNode, reasoning: String) -> VerifyOutcome {
    VerifyOutcome {
        status: VerifyStatus::Rejected,
        confidence: 0.0,
        node: node.clone(),
        correction: None,
        reasoning,
    }
}

fn correction_record(
    node: &MeshNode,
    corrected_start: Option<usize>,
    corrected_end: Option<usize>,
    file: &SourceFile,
    reasoning: &str,
) -> Correction {
    Correction {
        pattern_id: node
            .extraction
            .pattern_id
            .clone()
            .unwrap_or_default(),
        file: node.source.file.clone(),
        original_start: node.source.line_start,
        original_end: node.source.line_end,
        corrected_start,
        corrected_end,
        snippet: context_snippet(file, node, 0),
        reasoning: reasoning.to_string(),
    }
}

/// Numbered source lines around the node's range.
fn context_snippet(file: &SourceFile, node: &MeshNode, context: usize) -> String {
    let lines: Vec<&str> = file.content.lines().collect();
    let start = node.source.line_start.saturating_sub(context + 1);
    let end = (node.source.line_end + context).min(lines.len());
    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:>4} | {line}", start + i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ────────────────────────────────────────────────────────────
