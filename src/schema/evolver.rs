//! Schema evolution: turning verification feedback into new pattern
//! versions.
//!
//! Evolution only ever produces data (a regex and template), never
//! code, and every candidate passes a validation gate before promotion:
//! it must compile and must match at least as many occurrences as the
//! pattern it replaces on the validation samples. A promoted version
//! starts with fresh trust counters under its new pattern id.
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::extract::files::SourceFile;
use crate::extract::tier3::SuggestedPattern;
use crate::llm::{parse_json_response, CompletionRequest, LlmError, LlmProvider};
use crate::mesh::{Correction, NodeType};
use crate::schema::{Pattern, Schema, ScopeMethod, Template};
use crate::trust::{HealthThresholds, TrustSnapshot};

const MAX_CORRECTION_EXAMPLES: usize = 10;
const DISCOVERY_MIN_CONFIDENCE: f64 = 0.6;

/// Whether a pattern's verification record warrants an evolution
/// attempt.
pub fn needs_evolution(snapshot: &TrustSnapshot, thresholds: &HealthThresholds) -> bool {
    if snapshot.total < thresholds.min_samples {
        return false;
    }
    let total = snapshot.total as f64;
    snapshot.corrected as f64 / total > thresholds.correction_rate
        || snapshot.rejected as f64 / total > thresholds.rejection_rate
}

/// Validation gate shared by evolution and framework adoption. The
/// candidate must compile and, on every sample, match at least as many
/// occurrences as the pattern it replaces (or at least one occurrence
/// when there is no predecessor).
pub fn validate_candidate(
    candidate: &Pattern,
    previous: Option<&Pattern>,
    samples: &[SourceFile],
) -> bool {
    let Ok(candidate_re) = candidate.compile() else {
        debug!("Candidate pattern {} does not compile", candidate.name);
        return false;
    };

    match previous {
        Some(prev) => {
            let Ok(prev_re) = prev.compile() else {
                // A predecessor that stopped compiling can only be improved on.
                return true;
            };
            samples.iter().all(|file| {
                candidate_re.find_iter(&file.content).count()
                    >= prev_re.find_iter(&file.content).count()
            })
        }
        None => samples
            .iter()
            .any(|file| candidate_re.find_iter(&file.content).count() > 0),
    }
}

#[derive(Deserialize)]
struct EvolutionResponse {
    regex: String,
    #[serde(default)]
    flags: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct Evolver {
    provider: Arc<dyn LlmProvider>,
}

impl Evolver {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Ask the model for a replacement regex and validate it. Returns
    /// the promotable new version, or `None` when the candidate failed
    /// the gate (the old pattern then stays active).
    pub async fn evolve_pattern(
        &self,
        pattern: &Pattern,
        corrections: &[Correction],
        samples: &[SourceFile],
    ) -> Result<Option<Pattern>, LlmError> {
        let examples = corrections
            .iter()
            .take(MAX_CORRECTION_EXAMPLES)
            .map(|c| {
                format!(
                    "- in {} lines {}-{}{}: {}\n  snippet: {}",
                    c.file,
                    c.original_start,
                    c.original_end,
                    match (c.corrected_start, c.corrected_end) {
                        (Some(s), Some(e)) => format!(" (should be {s}-{e})"),
                        _ => String::new(),
                    },
                    c.reasoning,
                    c.snippet.replace('\n', "\\n"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "This extraction regex keeps producing wrong results:\n\
             regex: {regex}\n\
             flags: {flags}\n\n\
             Recorded corrections:\n{examples}\n\n\
             Propose an improved regex that fixes these failures while\n\
             keeping every currently-correct match. Keep the same named\n\
             capture groups. Respond with JSON:\n\
             {{\"regex\": \"...\", \"flags\": \"m\", \"reasoning\": \"...\"}}",
            regex = pattern.regex,
            flags = pattern.flags,
        );
        let request = CompletionRequest::new(prompt)
            .with_system("You improve extraction regexes. Respond with JSON only.");

        let raw = self.provider.complete(&request).await?;
        let parsed: EvolutionResponse = serde_json::from_value(parse_json_response(&raw)?)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let mut candidate = pattern.clone();
        candidate.version = pattern.version + 1;
        candidate.id = format!("{}:{}:{}", pattern.schema_id, pattern.name, candidate.version);
        candidate.regex = parsed.regex;
        if let Some(flags) = parsed.flags {
            candidate.flags = flags;
        }
        candidate.evolved_from = Some(pattern.id.clone());
        candidate.is_active = true;

        if !validate_candidate(&candidate, Some(pattern), samples) {
            warn!(
                pattern = %pattern.id,
                reasoning = parsed.reasoning.as_deref().unwrap_or(""),
                "Discarding evolution candidate that failed validation"
            );
            return Ok(None);
        }

        info!(
            old = %pattern.id,
            new = %candidate.id,
            "Evolved pattern passed validation"
        );
        Ok(Some(candidate))
    }

    /// Build a brand-new schema from a Tier-3 framework discovery.
    /// Suggested patterns that fail to compile or never match the
    /// sample are dropped; the schema is only created when at least one
    /// pattern survives.
    pub fn adopt_discovery(
        &self,
        language: &str,
        framework: &str,
        confidence: f64,
        suggestions: &[SuggestedPattern],
        samples: &[SourceFile],
    ) -> Option<(Schema, Vec<Pattern>)> {
        if confidence < DISCOVERY_MIN_CONFIDENCE {
            return None;
        }

        let schema_id = format!("{language}-{}", normalize_framework(framework));
        let mut schema = Schema::new(&schema_id, framework, language);
        schema.parent_id = base_schema_for(language).map(str::to_string);

        let mut patterns = Vec::new();
        for (i, suggestion) in suggestions.iter().enumerate() {
            let Some(node_type) = NodeType::parse(&suggestion.node_type) else {
                debug!("Discovery suggested unknown node type {:?}", suggestion.node_type);
                continue;
            };
            let pattern = Pattern {
                id: format!("{schema_id}:{}:1", suggestion.name),
                schema_id: schema_id.clone(),
                name: suggestion.name.clone(),
                version: 1,
                regex: suggestion.regex.clone(),
                flags: "m".to_string(),
                captures: Vec::new(),
                template: Template::Node {
                    node_type,
                    name: "${name}".to_string(),
                    properties: Default::default(),
                },
                scope: ScopeMethod::None,
                confidence: 0.6,
                is_active: true,
                evolved_from: None,
            };
            if validate_candidate(&pattern, None, samples) {
                patterns.push(pattern);
            } else {
                debug!(
                    "Dropping suggested pattern {} ({} of {})",
                    suggestion.name,
                    i + 1,
                    suggestions.len()
                );
            }
        }

        if patterns.is_empty() {
            return None;
        }
        Some((schema, patterns))
    }
}

fn normalize_framework(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

fn base_schema_for(language: &str) -> Option<&'static str> {
    match language {
        "python" => Some("base-python"),
        "typescript" => Some("base-typescript"),
        "javascript" => Some("base-javascript"),
        "rust" => Some("base-rust"),
        "go" => Some("base-go"),
        _ => None,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::trust::{TrustKey, TrustLevel};
    use std::collections::BTreeMap;

    fn sample(content: &str) -> SourceFile {
        SourceFile {
            path: "app.py".to_string(),
            language: Some("python"),
            content: content.to_string(),
        }
    }

    fn old_pattern() -> Pattern {
        Pattern {
            id: "base-python:function:1".to_string(),
            schema_id: "base-python".to_string(),
            name: "function".to_string(),
            version: 1,
            regex: r"^def (?P<name>\w+)".to_string(),
            flags: "m".to_string(),
            captures: vec![],
            template: Template::Node {
                node_type: NodeType::Function,
                name: "${name}".to_string(),
                properties: BTreeMap::new(),
            },
            scope: ScopeMethod::Indentation,
            confidence: 0.8,
            is_active: true,
            evolved_from: None,
        }
    }

    fn snapshot(total: u64, corrected: u64, rejected: u64) -> TrustSnapshot {
        TrustSnapshot {
            key: TrustKey::new("base-python", "base-python:function:1", "python"),
            total,
            corrected,
            rejected,
            accuracy: 1.0 - (corrected + rejected) as f64 / total.max(1) as f64,
            level: TrustLevel::Low,
        }
    }

    #[test]
    fn test_needs_evolution_thresholds() {
        let t = HealthThresholds::default();
        assert!(needs_evolution(&snapshot(100, 15, 0), &t), "15% corrections");
        assert!(needs_evolution(&snapshot(100, 0, 6), &t), "6% rejections");
        assert!(!needs_evolution(&snapshot(100, 5, 2), &t), "within tolerance");
        assert!(!needs_evolution(&snapshot(10, 9, 1), &t), "too few samples");
    }

    #[test]
    fn test_validation_rejects_uncompilable() {
        let mut candidate = old_pattern();
        candidate.regex = "(unclosed".to_string();
        assert!(!validate_candidate(&candidate, Some(&old_pattern()), &[]));
    }

    #[test]
    fn test_validation_rejects_fewer_matches() {
        let samples = vec![sample("def a():\n    pass\nasync def b():\n    pass\n")];
        let old = {
            let mut p = old_pattern();
            p.regex = r"^(?:async )?def (?P<name>\w+)".to_string();
            p
        };
        // Candidate only matches plain defs, losing the async one.
        let candidate = old_pattern();
        assert!(!validate_candidate(&candidate, Some(&old), &samples));
        // And the other direction passes.
        assert!(validate_candidate(&old, Some(&old_pattern()), &samples));
    }

    #[tokio::test]
    async fn test_evolution_promotes_valid_candidate() {
        let mock = Arc::new(MockProvider::with_responses([
            r#"{"regex": "^(?:async )?def (?P<name>\\w+)", "flags": "m"}"#,
        ]));
        let evolver = Evolver::new(mock);
        let samples = vec![sample("def a():\n    pass\nasync def b():\n    pass\n")];
        let corrections = vec![Correction {
            pattern_id: "base-python:function:1".to_string(),
            file: "app.py".to_string(),
            original_start: 3,
            original_end: 4,
            corrected_start: None,
            corrected_end: None,
            snippet: "async def b():".to_string(),
            reasoning: "missed async functions".to_string(),
        }];

        let evolved = evolver
            .evolve_pattern(&old_pattern(), &corrections, &samples)
            .await
            .unwrap()
            .expect("candidate should pass validation");
        assert_eq!(evolved.version, 2);
        assert_eq!(evolved.evolved_from.as_deref(), Some("base-python:function:1"));
        assert!(evolved.is_active);
    }

    #[tokio::test]
    async fn test_evolution_discards_regression() {
        // Proposed regex matches nothing, strictly worse.
        let mock = Arc::new(MockProvider::with_responses([
            r#"{"regex": "^zzz (?P<name>\\w+)", "flags": "m"}"#,
        ]));
        let evolver = Evolver::new(mock);
        let samples = vec![sample("def a():\n    pass\n")];
        let result = evolver
            .evolve_pattern(&old_pattern(), &[], &samples)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_adopt_discovery_gates_on_confidence_and_validity() {
        let mock = Arc::new(MockProvider::new());
        let evolver = Evolver::new(mock);
        let samples = vec![sample("@task\ndef handle():\n    pass\n")];
        let suggestions = vec![
            SuggestedPattern {
                name: "task".to_string(),
                regex: r"@task\s*\n\s*def (?P<name>\w+)".to_string(),
                node_type: "QueueConsumer".to_string(),
                description: "task decorator".to_string(),
            },
            SuggestedPattern {
                name: "broken".to_string(),
                regex: "(unclosed".to_string(),
                node_type: "Function".to_string(),
                description: String::new(),
            },
        ];

        // Below the confidence floor: nothing happens.
        assert!(evolver
            .adopt_discovery("python", "celery", 0.5, &suggestions, &samples)
            .is_none());

        let (schema, patterns) = evolver
            .adopt_discovery("python", "celery", 0.8, &suggestions, &samples)
            .expect("schema adopted");
        assert_eq!(schema.id, "python-celery");
        assert_eq!(schema.parent_id.as_deref(), Some("base-python"));
        assert_eq!(patterns.len(), 1, "invalid suggestion dropped");
        assert_eq!(patterns[0].name, "task");
    }
}
