//! The sync engine: one entry point that walks a project, runs the
//! extraction tiers, merges into the store and feeds verification
//! results back into schema evolution.
//!
//! Runs for the same (project, branch) are serialized; the mode (full
//! versus incremental) is decided from the last recorded commit and
//! the git diff since then.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::extract::files::{detect_language, FileEntry, FileExtractor, SourceFile};
use crate::extract::pipeline::{FileFailure, Pipeline, PipelineOutput};
use crate::git;
use crate::llm::LlmProvider;
use crate::mesh::{Correction, ProjectInfo, Statistics};
use crate::schema::evolver::{needs_evolution, Evolver};
use crate::schema::store::SchemaStore;
use crate::store::Db;
use crate::trust::TrustEngine;

const MAX_CORRECTION_CONTEXT: usize = 10;

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub project_id: String,
    pub root: PathBuf,
    /// Overrides the branch detected from git.
    pub branch: Option<String>,
    /// Forces a full re-extraction even when a prior commit is known.
    pub full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
    UpToDate,
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub project_id: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub mode: SyncMode,
    pub files_stored: usize,
    pub files_deleted: usize,
    pub nodes: usize,
    pub edges: usize,
    pub statistics: Statistics,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_files: Vec<String>,
    pub evolved_patterns: usize,
    pub adopted_schemas: usize,
}

impl SyncReport {
    fn up_to_date(project_id: String, branch: String, commit: Option<String>) -> Self {
        Self {
            project_id,
            branch,
            commit,
            mode: SyncMode::UpToDate,
            files_stored: 0,
            files_deleted: 0,
            nodes: 0,
            edges: 0,
            statistics: Statistics::default(),
            failed_files: Vec::new(),
            evolved_patterns: 0,
            adopted_schemas: 0,
        }
    }
}

pub struct SyncEngine {
    config: Config,
    trust: Arc<TrustEngine>,
    provider: Option<Arc<dyn LlmProvider>>,
    locks: StdMutex<HashMap<(String, String), Arc<TokioMutex<()>>>>,
}

impl SyncEngine {
    pub fn new(config: Config, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            config,
            trust: Arc::new(TrustEngine::new()),
            provider,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, project: &str, branch: &str) -> Arc<TokioMutex<()>> {
        let mut map = self.locks.lock().expect("lock map poisoned");
        Arc::clone(
            map.entry((project.to_string(), branch.to_string()))
                .or_default(),
        )
    }

    /// Run one sync. Per-file extraction failures are reported in the
    /// result; only store-level or walk-level failures abort the run.
    pub async fn sync(&self, request: SyncRequest, cancel: CancellationToken) -> Result<SyncReport> {
        let git_ctx = git::context(&request.root)?;
        let branch = request
            .branch
            .clone()
            .or_else(|| git_ctx.as_ref().map(|c| c.branch.clone()))
            .unwrap_or_else(|| "main".to_string());
        let commit = git_ctx.map(|c| c.commit);

        let lock = self.lock_for(&request.project_id, &branch);
        let _guard = lock.lock().await;

        let mut db = Db::open(&self.config.db_path)?;
        let mut schemas = db.load_schema_store()?;
        if schemas.schemas().next().is_none() {
            info!("Seeding store with built-in schemas");
            schemas = SchemaStore::with_builtins();
            db.save_bundle(&schemas.export_bundle())?;
        }
        self.trust.load(db.load_trust()?);

        // ── Decide full versus incremental ───────────────────────────
        let last = db.last_recorded_commit(&request.project_id)?;
        let mut mode = SyncMode::Full;
        let mut changes = None;
        if !request.full {
            if let (Some(last), Some(current)) = (&last, &commit) {
                if last == current {
                    info!(project = %request.project_id, "Already at {current}, nothing to sync");
                    return Ok(SyncReport::up_to_date(request.project_id, branch, commit));
                }
                match git::changed_files(&request.root, last, None) {
                    Ok(diff) => {
                        mode = SyncMode::Incremental;
                        changes = Some(diff);
                    }
                    // The recorded commit may have been rebased away.
                    Err(e) => warn!("Diff against {last} failed, falling back to full sync: {e}"),
                }
            }
        }

        let extractor = FileExtractor::new(
            &self.config.extraction.include,
            &self.config.extraction.exclude,
            self.config.extraction.max_file_size_kb,
        )?;
        let (mut entries, ctx) = extractor.collect(&request.root)?;
        let mut deleted_files = Vec::new();
        if let Some(changes) = &changes {
            let wanted: HashSet<String> = changes.to_extract().into_iter().collect();
            entries.retain(|e| wanted.contains(&e.path));
            deleted_files = changes.deleted.clone();
            info!(
                changed = entries.len(),
                deleted = deleted_files.len(),
                "Incremental sync"
            );
        }

        let project = ProjectInfo {
            id: request.project_id.clone(),
            path: request.root.display().to_string(),
            branch: Some(branch.clone()),
            commit: commit.clone(),
        };

        let pipeline = Pipeline::new(
            Arc::new(schemas.clone()),
            Arc::clone(&self.trust),
            self.provider.clone(),
            self.config.pipeline_config(),
        );
        let output = pipeline
            .run(project, &request.root, entries, ctx, cancel)
            .await?;

        let summary = db.store_document(
            &output.document,
            &branch,
            mode == SyncMode::Incremental,
            &deleted_files,
        )?;
        db.append_corrections(&output.corrections)?;
        db.save_trust(&self.trust.snapshot())?;
        db.record_extraction(
            &request.project_id,
            Some(&branch),
            commit.as_deref(),
            &output.document.statistics,
        )?;

        let (evolved_patterns, adopted_schemas) =
            if self.config.evolution.enabled && self.provider.is_some() {
                self.evolve(&mut db, &mut schemas, &request.root, &output)
                    .await?
            } else {
                (0, 0)
            };

        Ok(SyncReport {
            project_id: request.project_id,
            branch,
            commit,
            mode,
            files_stored: summary.files_stored,
            files_deleted: summary.files_deleted,
            nodes: summary.nodes,
            edges: summary.edges,
            statistics: output.document.statistics,
            failed_files: output
                .failures
                .iter()
                .map(|f: &FileFailure| f.file.clone())
                .collect(),
            evolved_patterns,
            adopted_schemas,
        })
    }

    /// Post-sync evolution pass: version up patterns whose verification
    /// record slipped past the thresholds, and adopt schemas for
    /// frameworks Tier-3 discovered.
    async fn evolve(
        &self,
        db: &mut Db,
        schemas: &mut SchemaStore,
        root: &Path,
        output: &PipelineOutput,
    ) -> Result<(usize, usize)> {
        let Some(provider) = self.provider.clone() else {
            return Ok((0, 0));
        };
        let evolver = Evolver::new(provider);
        let thresholds = self.config.health_thresholds();

        let mut evolved = 0;
        for snap in self.trust.snapshot() {
            if !needs_evolution(&snap, &thresholds) {
                continue;
            }
            let Some(pattern) = schemas.find_pattern(&snap.key.pattern_id).cloned() else {
                continue;
            };
            if !pattern.is_active {
                continue;
            }
            let corrections = db.corrections_for_pattern(&pattern.id, MAX_CORRECTION_CONTEXT)?;
            if corrections.is_empty() {
                continue;
            }
            let samples = load_correction_samples(root, &corrections);

            match evolver.evolve_pattern(&pattern, &corrections, &samples).await {
                Ok(Some(new_pattern)) => {
                    let mut retired = pattern.clone();
                    retired.is_active = false;
                    db.save_pattern(&retired)?;
                    db.save_pattern(&new_pattern)?;
                    schemas.promote(new_pattern)?;
                    evolved += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(pattern = %pattern.id, "Evolution attempt failed: {e}"),
            }
        }

        let mut adopted = 0;
        for discovery in &output.discoveries {
            let Some(framework) = &discovery.framework else {
                continue;
            };
            if discovery.suggested_patterns.is_empty() {
                continue;
            }
            let samples = load_file_samples(root, std::slice::from_ref(&discovery.file));
            let Some((schema, patterns)) = evolver.adopt_discovery(
                &discovery.language,
                framework,
                discovery.confidence,
                &discovery.suggested_patterns,
                &samples,
            ) else {
                continue;
            };
            if schemas.schema(&schema.id).is_ok() {
                continue;
            }

            info!(schema = %schema.id, patterns = patterns.len(), "Adopting discovered framework schema");
            db.save_schema(&schema)?;
            schemas.insert_schema(schema);
            for pattern in patterns {
                db.save_pattern(&pattern)?;
                if let Err(e) = schemas.insert_pattern(pattern) {
                    warn!("Adopted pattern rejected by store: {e}");
                }
            }
            adopted += 1;
        }

        Ok((evolved, adopted))
    }
}

/// Validation samples for evolution: the files the corrections came
/// from, loaded once each. Files that vanished since are skipped.
fn load_correction_samples(root: &Path, corrections: &[Correction]) -> Vec<SourceFile> {
    let files: Vec<String> = {
        let mut seen = HashSet::new();
        corrections
            .iter()
            .filter(|c| seen.insert(c.file.clone()))
            .map(|c| c.file.clone())
            .collect()
    };
    load_file_samples(root, &files)
}

fn load_file_samples(root: &Path, files: &[String]) -> Vec<SourceFile> {
    files
        .iter()
        .filter_map(|path| {
            let entry = FileEntry {
                path: path.clone(),
                language: detect_language(path),
            };
            FileExtractor::load(root, &entry).ok()
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────
