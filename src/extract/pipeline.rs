//! The tier escalation pipeline.
//!
//! Files fan out across a bounded worker pool; within a file, Tier-2
//! and Tier-3 calls share a separate, smaller in-flight cap with a
//! per-call timeout. Trust counters are the only shared mutable state.
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::extract::files::{FileEntry, FileExtractor, ProjectContext, SourceFile};
use crate::extract::tier1::Tier1Matcher;
use crate::extract::tier2::Verifier;
use crate::extract::tier3::{Discoverer, SuggestedPattern};
use crate::llm::LlmProvider;
use crate::mesh::{
    Correction, MeshDocument, MeshEdge, MeshNode, NodeType, ProjectInfo, Statistics,
};
use crate::schema::store::SchemaStore;
use crate::trust::{Sampler, TrustEngine, TrustKey, VerifyStatus};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ai_enabled: bool,
    pub max_concurrent_files: usize,
    pub max_concurrent_llm: usize,
    pub llm_timeout_secs: u64,
    /// Files whose mean node confidence stays below this after Tier-2
    /// go to Tier-3.
    pub tier3_threshold: f64,
    pub sample_seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ai_enabled: false,
            max_concurrent_files: 8,
            max_concurrent_llm: 4,
            llm_timeout_secs: 60,
            tier3_threshold: 0.6,
            sample_seed: 0x5eed,
        }
    }
}

/// Framework guess captured from Tier-3, fed to the evolver afterwards.
#[derive(Debug, Clone)]
pub struct DiscoveryFeedback {
    pub language: String,
    pub framework: Option<String>,
    pub confidence: f64,
    pub file: String,
    pub suggested_patterns: Vec<SuggestedPattern>,
}

#[derive(Debug, Clone)]
pub struct FileFailure {
    pub file: String,
    pub message: String,
}

#[derive(Debug)]
pub struct PipelineOutput {
    pub document: MeshDocument,
    pub corrections: Vec<Correction>,
    pub discoveries: Vec<DiscoveryFeedback>,
    pub failures: Vec<FileFailure>,
}

struct FileResult {
    path: String,
    language: Option<&'static str>,
    nodes: Vec<MeshNode>,
    edges: Vec<MeshEdge>,
    corrections: Vec<Correction>,
    discovery: Option<DiscoveryFeedback>,
    tier2_verified: usize,
    tier2_corrected: usize,
    tier2_rejected: usize,
    tier3_nodes: usize,
}

pub struct Pipeline {
    schemas: Arc<SchemaStore>,
    trust: Arc<TrustEngine>,
    provider: Option<Arc<dyn LlmProvider>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        schemas: Arc<SchemaStore>,
        trust: Arc<TrustEngine>,
        provider: Option<Arc<dyn LlmProvider>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            schemas,
            trust,
            provider,
            config,
        }
    }

    /// Run the full tier ladder over the given files and assemble a
    /// mesh document. Per-file failures land in `failures`, never abort
    /// the batch. Cancellation stops scheduling new files; in-flight
    /// files finish.
    pub async fn run(
        &self,
        project: ProjectInfo,
        root: &Path,
        entries: Vec<FileEntry>,
        ctx: ProjectContext,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput> {
        let matcher = Arc::new(Tier1Matcher::new());
        let ctx = Arc::new(ctx);
        let file_permits = Arc::new(Semaphore::new(self.config.max_concurrent_files.max(1)));
        let llm_permits = Arc::new(Semaphore::new(self.config.max_concurrent_llm.max(1)));
        let sampler = Arc::new(Mutex::new(Sampler::new(self.config.sample_seed)));

        let mut tasks: JoinSet<std::result::Result<FileResult, FileFailure>> = JoinSet::new();
        let total = entries.len();

        for entry in entries {
            if cancel.is_cancelled() {
                info!("Cancellation requested, not scheduling remaining files");
                break;
            }

            let schemas = Arc::clone(&self.schemas);
            let trust = Arc::clone(&self.trust);
            let provider = self.provider.clone().filter(|_| self.config.ai_enabled);
            let matcher = Arc::clone(&matcher);
            let ctx = Arc::clone(&ctx);
            let file_permits = Arc::clone(&file_permits);
            let llm_permits = Arc::clone(&llm_permits);
            let sampler = Arc::clone(&sampler);
            let config = self.config.clone();
            let project_id = project.id.clone();
            let root = root.to_path_buf();

            tasks.spawn(async move {
                let _permit = file_permits
                    .acquire_owned()
                    .await
                    .map_err(|e| failure(&entry.path, e))?;

                let file = FileExtractor::load(&root, &entry).map_err(|e| failure(&entry.path, e))?;
                process_file(
                    &project_id, &file, &schemas, &matcher, &ctx, &trust, provider,
                    &llm_permits, &sampler, &config,
                )
                .await
                .map_err(|e| failure(&entry.path, e))
            });
        }

        let mut results = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(fail)) => {
                    warn!(file = %fail.file, "Extraction failed: {}", fail.message);
                    failures.push(fail);
                }
                Err(e) => failures.push(FileFailure {
                    file: String::new(),
                    message: format!("worker panicked: {e}"),
                }),
            }
        }

        // Task completion order is nondeterministic; sort for stable output.
        results.sort_by(|a, b| a.path.cmp(&b.path));

        let mut document = MeshDocument::new(project);
        let mut corrections = Vec::new();
        let mut discoveries = Vec::new();
        let mut stats = Statistics {
            files_processed: results.len(),
            errors: failures.len(),
            ..Default::default()
        };

        for result in results {
            let lang_stats = result
                .language
                .map(|l| stats.by_language.entry(l.to_string()).or_default());
            if let Some(ls) = lang_stats {
                ls.files += 1;
                ls.nodes += result.nodes.len();
                ls.edges += result.edges.len();
            }
            stats.tier1_nodes += result
                .nodes
                .iter()
                .filter(|n| n.extraction.tier == 1 && n.node_type != NodeType::File)
                .count();
            stats.tier2_verified += result.tier2_verified;
            stats.tier2_corrected += result.tier2_corrected;
            stats.tier2_rejected += result.tier2_rejected;
            stats.tier3_nodes += result.tier3_nodes;

            document.nodes.extend(result.nodes);
            document.edges.extend(result.edges);
            corrections.extend(result.corrections);
            discoveries.extend(result.discovery);
        }
        stats.total_nodes = document.nodes.len();
        stats.total_edges = document.edges.len();
        document.statistics = stats;

        info!(
            files = document.statistics.files_processed,
            of = total,
            nodes = document.statistics.total_nodes,
            edges = document.statistics.total_edges,
            "Extraction finished"
        );

        Ok(PipelineOutput {
            document,
            corrections,
            discoveries,
            failures,
        })
    }
}

fn failure(file: &str, err: impl std::fmt::Display) -> FileFailure {
    FileFailure {
        file: file.to_string(),
        message: err.to_string(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    project: &str,
    file: &SourceFile,
    schemas: &SchemaStore,
    matcher: &Tier1Matcher,
    ctx: &ProjectContext,
    trust: &TrustEngine,
    provider: Option<Arc<dyn LlmProvider>>,
    llm_permits: &Semaphore,
    sampler: &Mutex<Sampler>,
    config: &PipelineConfig,
) -> Result<FileResult> {
    let extraction = matcher.extract(project, file, schemas, ctx)?;
    let mut nodes = extraction.nodes;
    let mut edges = extraction.edges;

    let mut result = FileResult {
        path: file.path.clone(),
        language: file.language,
        nodes: Vec::new(),
        edges: Vec::new(),
        corrections: Vec::new(),
        discovery: None,
        tier2_verified: 0,
        tier2_corrected: 0,
        tier2_rejected: 0,
        tier3_nodes: 0,
    };

    let Some(provider) = provider else {
        result.nodes = nodes;
        result.edges = edges;
        return Ok(result);
    };

    // ── Tier-2: verify a trust-sampled subset ────────────────────────
    let verifier = Verifier::new(Arc::clone(&provider));
    let timeout = Duration::from_secs(config.llm_timeout_secs);
    let mut rejected_ids = Vec::new();
    let mut had_rejection = false;

    for node in &mut nodes {
        let (Some(schema_id), Some(pattern_id)) = (
            node.extraction.schema_id.clone(),
            node.extraction.pattern_id.clone(),
        ) else {
            continue;
        };
        let key = TrustKey::new(&schema_id, &pattern_id, file.language.unwrap_or("unknown"));
        let rate = trust.sample_rate(&key);
        let should_verify = sampler.lock().expect("sampler poisoned").sample(rate);
        if !should_verify {
            continue;
        }

        let _permit = match llm_permits.acquire().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let outcome = match tokio::time::timeout(timeout, verifier.verify(node, file)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(node = %node.id, "Verification timed out");
                trust.record(&key, VerifyStatus::Rejected);
                result.tier2_rejected += 1;
                rejected_ids.push(node.id.clone());
                had_rejection = true;
                continue;
            }
        };

        trust.record(&key, outcome.status);
        match outcome.status {
            VerifyStatus::Verified => {
                result.tier2_verified += 1;
                *node = outcome.node;
            }
            VerifyStatus::Corrected => {
                result.tier2_corrected += 1;
                *node = outcome.node;
                result.corrections.extend(outcome.correction);
            }
            VerifyStatus::Rejected => {
                result.tier2_rejected += 1;
                rejected_ids.push(node.id.clone());
                result.corrections.extend(outcome.correction);
                had_rejection = true;
            }
        }
    }

    if !rejected_ids.is_empty() {
        nodes.retain(|n| !rejected_ids.contains(&n.id));
        edges.retain(|e| {
            !rejected_ids.contains(&e.from_id) && !rejected_ids.contains(&e.to_id)
        });
    }

    // ── Tier-3: rediscovery when confidence stays low ────────────────
    if had_rejection || mean_confidence(&nodes) < config.tier3_threshold {
        let discoverer = Discoverer::new(provider);
        let permit = llm_permits.acquire().await;
        if permit.is_ok() {
            match tokio::time::timeout(timeout, discoverer.discover(project, file)).await {
                Ok(Ok(discovery)) => {
                    result.tier3_nodes = discovery.nodes.len();
                    merge_tier3(&mut nodes, &mut edges, discovery.nodes, discovery.edges);
                    result.discovery = Some(DiscoveryFeedback {
                        language: file.language.unwrap_or("unknown").to_string(),
                        framework: discovery.framework,
                        confidence: discovery.confidence,
                        file: file.path.clone(),
                        suggested_patterns: discovery.suggested_patterns,
                    });
                }
                Ok(Err(e)) => debug!(file = %file.path, "Discovery failed: {e}"),
                Err(_) => debug!(file = %file.path, "Discovery timed out"),
            }
        }
    }

    result.nodes = nodes;
    result.edges = edges;
    Ok(result)
}

/// Mean confidence of non-file nodes; 1.0 for an empty set so empty
/// files never trigger Tier-3.
fn mean_confidence(nodes: &[MeshNode]) -> f64 {
    let scored: Vec<f64> = nodes
        .iter()
        .filter(|n| n.node_type != NodeType::File)
        .map(|n| n.extraction.confidence)
        .collect();
    if scored.is_empty() {
        return 1.0;
    }
    scored.iter().sum::<f64>() / scored.len() as f64
}

/// Merge Tier-3 output into the Tier-1/2 set. When a discovered node
/// overlaps an existing node of a compatible type, the more confident
/// extraction wins; ties go to the higher tier. Everything else is
/// additive.
fn merge_tier3(
    nodes: &mut Vec<MeshNode>,
    edges: &mut Vec<MeshEdge>,
    tier3_nodes: Vec<MeshNode>,
    tier3_edges: Vec<MeshEdge>,
) {
    let mut id_rewrites: HashMap<String, String> = HashMap::new();

    for candidate in tier3_nodes {
        let existing = nodes.iter().position(|n| {
            n.node_type.compatible_with(candidate.node_type) && n.overlaps(&candidate)
        });
        match existing {
            Some(i) => {
                let current = &mut nodes[i];
                let replace = candidate.extraction.confidence > current.extraction.confidence
                    || (candidate.extraction.confidence == current.extraction.confidence
                        && candidate.extraction.tier > current.extraction.tier);
                if replace {
                    id_rewrites.insert(candidate.id.clone(), current.id.clone());
                    let id = current.id.clone();
                    *current = candidate;
                    // The winning content keeps the established id so
                    // edges stay valid.
                    current.id = id;
                } else {
                    id_rewrites.insert(candidate.id.clone(), current.id.clone());
                }
            }
            None => nodes.push(candidate),
        }
    }

    for mut edge in tier3_edges {
        if let Some(id) = id_rewrites.get(&edge.from_id) {
            edge.from_id = id.clone();
        }
        if let Some(id) = id_rewrites.get(&edge.to_id) {
            edge.to_id = id.clone();
        }
        let valid = nodes.iter().any(|n| n.id == edge.from_id)
            && nodes.iter().any(|n| n.id == edge.to_id);
        if valid && !edges.iter().any(|e| e.id == edge.id) {
            edges.push(edge);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockProvider;
    use crate::mesh::{node_id, Extraction, Properties, SourceLocation};
    use std::fs;
    use tempfile::tempdir;

    fn write_project(files: &[(&str, &str)]) -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        for (path, content) in files {
            let full = temp.path().join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(full, content).unwrap();
        }
        temp
    }

    fn project() -> ProjectInfo {
        ProjectInfo {
            id: "demo".to_string(),
            path: "/tmp/demo".to_string(),
            branch: Some("main".to_string()),
            commit: None,
        }
    }

    fn pipeline(provider: Option<Arc<dyn LlmProvider>>, config: PipelineConfig) -> Pipeline {
        Pipeline::new(
            Arc::new(SchemaStore::with_builtins()),
            Arc::new(TrustEngine::new()),
            provider,
            config,
        )
    }

    async fn run_on(
        p: &Pipeline,
        root: &Path,
    ) -> PipelineOutput {
        let extractor = FileExtractor::new(&[], &[], 512).unwrap();
        let (entries, ctx) = extractor.collect(root).unwrap();
        p.run(project(), root, entries, ctx, CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tier1_only_run() {
        let temp = write_project(&[
            ("app.py", "def alpha():\n    pass\n\ndef beta():\n    pass\n"),
            ("util.py", "def gamma():\n    pass\n"),
        ]);
        let p = pipeline(None, PipelineConfig::default());
        let output = run_on(&p, temp.path()).await;

        assert_eq!(output.document.statistics.files_processed, 2);
        assert_eq!(output.document.statistics.tier1_nodes, 3);
        assert_eq!(output.document.statistics.tier2_verified, 0);
        assert!(output.failures.is_empty());
    }

    #[tokio::test]
    async fn test_reextraction_is_deterministic() {
        let temp = write_project(&[("app.py", "def alpha():\n    pass\n")]);
        let p = pipeline(None, PipelineConfig::default());
        let a = run_on(&p, temp.path()).await;
        let b = run_on(&p, temp.path()).await;

        let ids_a: Vec<&String> = a.document.nodes.iter().map(|n| &n.id).collect();
        let ids_b: Vec<&String> = b.document.nodes.iter().map(|n| &n.id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.document.edges.len(), b.document.edges.len());
    }

    #[tokio::test]
    async fn test_rejection_removes_node_and_triggers_discovery() {
        let temp = write_project(&[("app.py", "def alpha():\n    pass\n")]);
        // Trust starts at low so every node is sampled. First response
        // rejects the function; the discovery response re-derives it.
        let mock = Arc::new(MockProvider::with_responses([
            r#"{"status": "rejected", "reasoning": "not a real function"}"#.to_string(),
            // Module node from imports is absent, so the remaining
            // verifications reuse the rejection until discovery runs.
            r#"{"confidence": 0.9, "nodes": [{"type": "Function", "name": "alpha", "line_start": 1, "line_end": 2}], "edges": []}"#.to_string(),
        ]));
        let config = PipelineConfig {
            ai_enabled: true,
            ..Default::default()
        };
        let p = pipeline(Some(mock.clone()), config);
        let output = run_on(&p, temp.path()).await;

        assert_eq!(output.document.statistics.tier2_rejected, 1);
        assert_eq!(output.document.statistics.tier3_nodes, 1);
        let alpha = output
            .document
            .nodes
            .iter()
            .find(|n| n.name == "alpha")
            .expect("rediscovered function");
        assert_eq!(alpha.extraction.tier, 3);
        assert!(mock.call_count() >= 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_scheduling() {
        let temp = write_project(&[
            ("a.py", "def a():\n    pass\n"),
            ("b.py", "def b():\n    pass\n"),
        ]);
        let p = pipeline(None, PipelineConfig::default());
        let extractor = FileExtractor::new(&[], &[], 512).unwrap();
        let (entries, ctx) = extractor.collect(temp.path()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = p
            .run(project(), temp.path(), entries, ctx, cancel)
            .await
            .unwrap();
        assert_eq!(output.document.statistics.files_processed, 0);
    }

    fn node_at(name: &str, tier: u8, confidence: f64, start: usize, end: usize) -> MeshNode {
        let mut extraction = Extraction::tier1(None, None, confidence);
        extraction.tier = tier;
        MeshNode {
            id: node_id("p", "a.py", NodeType::Function, name, tier as usize),
            node_type: NodeType::Function,
            name: name.to_string(),
            properties: Properties::new(),
            source: SourceLocation {
                file: "a.py".to_string(),
                line_start: start,
                line_end: end,
            },
            project_id: "p".to_string(),
            extraction,
        }
    }

    #[test]
    fn test_merge_prefers_higher_confidence() {
        let mut nodes = vec![node_at("f", 1, 0.85, 1, 5)];
        let mut edges = Vec::new();
        let keep_id = nodes[0].id.clone();

        // Lower-confidence overlap loses.
        merge_tier3(&mut nodes, &mut edges, vec![node_at("f2", 3, 0.6, 2, 4)], vec![]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "f");

        // Higher-confidence overlap wins but keeps the established id.
        merge_tier3(&mut nodes, &mut edges, vec![node_at("f3", 3, 0.95, 2, 4)], vec![]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "f3");
        assert_eq!(nodes[0].id, keep_id);

        // Non-overlapping discovery is additive.
        merge_tier3(&mut nodes, &mut edges, vec![node_at("g", 3, 0.7, 10, 12)], vec![]);
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn test_mean_confidence_ignores_file_node() {
        let mut file_node = node_at("a.py", 1, 1.0, 1, 10);
        file_node.node_type = NodeType::File;
        let nodes = vec![file_node, node_at("f", 1, 0.5, 1, 2)];
        assert!((mean_confidence(&nodes) - 0.5).abs() < 1e-9);
        assert_eq!(mean_confidence(&[]), 1.0);
    }
}

