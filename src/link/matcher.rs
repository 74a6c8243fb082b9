//! Two-pass reference matching.
//!
//! Pass one is static: normalized exact-value equality between
//! same-type references with complementary operations. Pass two hands
//! whatever is left to the model, pairwise per project pair, and
//! accepts only pairings that validate against the known references.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::link::{CrossProjectLink, ExternalReference, RefOperation, RefType};
use crate::llm::{parse_json_response, CompletionRequest, LlmProvider};
use crate::mesh::EdgeType;

const STATIC_CONFIDENCE: f64 = 0.95;
const MIN_AI_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Default)]
pub struct LinkOutcome {
    pub links: Vec<CrossProjectLink>,
    /// References that neither pass could pair, reported but unlinked.
    pub unmatched: Vec<ExternalReference>,
}

#[derive(Deserialize)]
struct AiPairing {
    source_id: String,
    target_id: String,
    link_type: String,
    confidence: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct AiResponse {
    #[serde(default)]
    pairs: Vec<AiPairing>,
}

pub struct Matcher {
    provider: Option<Arc<dyn LlmProvider>>,
}

impl Matcher {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { provider }
    }

    pub async fn link(&self, refs: Vec<ExternalReference>) -> LinkOutcome {
        let mut matched: HashSet<String> = HashSet::new();
        let mut links = Vec::new();

        // ── Static pass ──────────────────────────────────────────────
        for (i, a) in refs.iter().enumerate() {
            for b in refs.iter().skip(i + 1) {
                if a.project_id == b.project_id
                    || a.ref_type != b.ref_type
                    || !a.operation.complements(b.operation)
                {
                    continue;
                }
                if normalize(a.effective_value()) != normalize(b.effective_value()) {
                    continue;
                }
                let (source, target) = orient(a, b);
                links.push(CrossProjectLink {
                    source: source.clone(),
                    target: target.clone(),
                    link_type: link_type_for(a.ref_type),
                    confidence: STATIC_CONFIDENCE,
                    reason: format!("static:{}", a.effective_value()),
                });
                matched.insert(a.id.clone());
                matched.insert(b.id.clone());
            }
        }
        info!(links = links.len(), "Static link pass complete");

        let mut unmatched: Vec<ExternalReference> = refs
            .into_iter()
            .filter(|r| !matched.contains(&r.id))
            .collect();

        // ── AI pass ──────────────────────────────────────────────────
        if let Some(provider) = &self.provider {
            let ai_links = self.ai_pass(provider.as_ref(), &unmatched).await;
            let newly_matched: HashSet<String> = ai_links
                .iter()
                .flat_map(|l| [l.source.id.clone(), l.target.id.clone()])
                .collect();
            unmatched.retain(|r| !newly_matched.contains(&r.id));
            links.extend(ai_links);
        }

        LinkOutcome { links, unmatched }
    }

    async fn ai_pass(
        &self,
        provider: &dyn LlmProvider,
        unmatched: &[ExternalReference],
    ) -> Vec<CrossProjectLink> {
        let by_id: HashMap<&str, &ExternalReference> =
            unmatched.iter().map(|r| (r.id.as_str(), r)).collect();
        let projects: BTreeSet<&str> = unmatched.iter().map(|r| r.project_id.as_str()).collect();
        let projects: Vec<&str> = projects.into_iter().collect();

        let mut links = Vec::new();
        for (i, a) in projects.iter().enumerate() {
            for b in projects.iter().skip(i + 1) {
                let left: Vec<&ExternalReference> = unmatched
                    .iter()
                    .filter(|r| r.project_id == *a)
                    .collect();
                let right: Vec<&ExternalReference> = unmatched
                    .iter()
                    .filter(|r| r.project_id == *b)
                    .collect();
                if left.is_empty() || right.is_empty() {
                    continue;
                }

                let prompt = pairing_prompt(a, &left, b, &right);
                let request = CompletionRequest::new(prompt)
                    .with_system("You match external resource references across services. Respond with JSON only.");
                let raw = match provider.complete(&request).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!("AI link pass failed for {a}/{b}: {e}");
                        continue;
                    }
                };
                let parsed: AiResponse = match parse_json_response(&raw)
                    .and_then(|v| {
                        serde_json::from_value(v)
                            .map_err(|e| crate::llm::LlmError::InvalidResponse(e.to_string()))
                    }) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("Unparseable AI link response for {a}/{b}: {e}");
                        continue;
                    }
                };

                for pair in parsed.pairs {
                    let (Some(source), Some(target)) = (
                        by_id.get(pair.source_id.as_str()),
                        by_id.get(pair.target_id.as_str()),
                    ) else {
                        debug!("AI pairing references unknown ids, skipping");
                        continue;
                    };
                    if source.project_id == target.project_id {
                        continue;
                    }
                    let Some(link_type) = EdgeType::parse(&pair.link_type) else {
                        debug!("AI pairing has unknown link type {:?}", pair.link_type);
                        continue;
                    };
                    if pair.confidence < MIN_AI_CONFIDENCE {
                        continue;
                    }
                    links.push(CrossProjectLink {
                        source: (*source).clone(),
                        target: (*target).clone(),
                        link_type,
                        confidence: pair.confidence,
                        reason: if pair.reason.is_empty() {
                            "ai".to_string()
                        } else {
                            format!("ai:{}", pair.reason)
                        },
                    });
                }
            }
        }
        links
    }
}

/// Case- and separator-insensitive comparison key.
fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn link_type_for(ref_type: RefType) -> EdgeType {
    match ref_type {
        RefType::Queue => EdgeType::PublishesTo,
        RefType::ApiCall => EdgeType::Calls,
        RefType::Database => EdgeType::DependsOn,
    }
}

/// Which reference is the edge's source. Publishers and callers point
/// at their counterparts; symmetric pairs order by project id so the
/// result is deterministic.
fn orient<'a>(
    a: &'a ExternalReference,
    b: &'a ExternalReference,
) -> (&'a ExternalReference, &'a ExternalReference) {
    match (a.operation, b.operation) {
        (RefOperation::Publish, _) | (RefOperation::Call, _) => (a, b),
        (_, RefOperation::Publish) | (_, RefOperation::Call) => (b, a),
        _ => {
            if a.project_id <= b.project_id {
                (a, b)
            } else {
                (b, a)
            }
        }
    }
}

fn pairing_prompt(
    project_a: &str,
    left: &[&ExternalReference],
    project_b: &str,
    right: &[&ExternalReference],
) -> String {
    let describe = |refs: &[&ExternalReference]| {
        refs.iter()
            .map(|r| {
                format!(
                    "  - id={} type={} op={:?} value={}",
                    r.id,
                    r.ref_type.as_str(),
                    r.operation,
                    r.effective_value()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Two services share infrastructure. Unmatched references:\n\
         Project {project_a}:\n{}\n\
         Project {project_b}:\n{}\n\n\
         Pair references that point at the same resource. Respond with JSON:\n\
         {{\"pairs\": [{{\"source_id\": \"...\", \"target_id\": \"...\",\n   \
         \"link_type\": \"PUBLISHES_TO|CALLS|DEPENDS_ON\",\n   \
         \"confidence\": 0.0-1.0, \"reason\": \"...\"}}]}}",
        describe(left),
        describe(right),
    )
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;

    fn reference(
        ref_type: RefType,
        project: &str,
        node: &str,
        value: &str,
        operation: RefOperation,
    ) -> ExternalReference {
        ExternalReference::new(ref_type, project, node, value, operation)
    }

    #[tokio::test]
    async fn test_static_queue_match() {
        let refs = vec![
            reference(RefType::Queue, "x", "n1", "orders.created", RefOperation::Publish),
            reference(RefType::Queue, "y", "n2", "orders.created", RefOperation::Subscribe),
        ];
        let outcome = Matcher::new(None).link(refs).await;

        assert_eq!(outcome.links.len(), 1);
        let link = &outcome.links[0];
        assert_eq!(link.link_type, EdgeType::PublishesTo);
        assert!(link.confidence >= 0.9);
        assert_eq!(link.source.project_id, "x", "producer is the source");
        assert!(outcome.unmatched.is_empty());
    }

    #[tokio::test]
    async fn test_normalization_bridges_separators() {
        let refs = vec![
            reference(RefType::Database, "x", "n1", "user_accounts", RefOperation::Use),
            reference(RefType::Database, "y", "n2", "User-Accounts", RefOperation::Use),
        ];
        let outcome = Matcher::new(None).link(refs).await;
        assert_eq!(outcome.links.len(), 1);
        assert_eq!(outcome.links[0].link_type, EdgeType::DependsOn);
    }

    #[tokio::test]
    async fn test_same_project_and_same_operation_never_match() {
        let refs = vec![
            reference(RefType::Queue, "x", "n1", "orders", RefOperation::Publish),
            reference(RefType::Queue, "x", "n2", "orders", RefOperation::Subscribe),
            reference(RefType::Queue, "y", "n3", "payments", RefOperation::Publish),
        ];
        let outcome = Matcher::new(None).link(refs).await;
        assert!(outcome.links.is_empty());
        assert_eq!(outcome.unmatched.len(), 3);
    }

    #[tokio::test]
    async fn test_ai_pass_validates_pairings() {
        let a = reference(RefType::ApiCall, "x", "n1", "${SVC_URL}", RefOperation::Call);
        let b = reference(RefType::ApiCall, "y", "n2", "/v2/orders", RefOperation::Serve);
        let response = format!(
            r#"{{"pairs": [
                {{"source_id": "{}", "target_id": "{}", "link_type": "CALLS", "confidence": 0.8, "reason": "url resolves to the orders endpoint"}},
                {{"source_id": "bogus", "target_id": "{}", "link_type": "CALLS", "confidence": 0.9}},
                {{"source_id": "{}", "target_id": "{}", "link_type": "CALLS", "confidence": 0.2}}
            ]}}"#,
            a.id, b.id, b.id, a.id, b.id,
        );
        let mock = Arc::new(MockProvider::with_responses([response]));
        let outcome = Matcher::new(Some(mock)).link(vec![a, b]).await;

        assert_eq!(outcome.links.len(), 1, "unknown ids and low confidence dropped");
        assert_eq!(outcome.links[0].link_type, EdgeType::Calls);
        assert!(outcome.links[0].reason.starts_with("ai:"));
        assert!(outcome.unmatched.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_are_reported() {
        let refs = vec![reference(
            RefType::Queue,
            "x",
            "n1",
            "lonely.topic",
            RefOperation::Publish,
        )];
        let outcome = Matcher::new(None).link(refs).await;
        assert!(outcome.links.is_empty());
        assert_eq!(outcome.unmatched.len(), 1);
    }
}
