//! Command-line interface.
//!
//! Every command is a thin wrapper over a library seam; the heavy
//! lifting lives in `extract`, `store`, `sync` and `link`. Commands
//! that read the model print machine-readable JSON with `--json`.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::extract::{FileExtractor, Pipeline, Verifier};
use crate::git;
use crate::link::{collect_references, ConfigResolver, Matcher};
use crate::llm::{HttpProvider, LlmProvider};
use crate::mesh::{MeshDocument, NodeType, ProjectInfo};
use crate::schema::store::{SchemaBundle, SchemaStore};
use crate::store::Db;
use crate::sync::{SyncEngine, SyncRequest};
use crate::trust::{schema_health, Sampler, TrustEngine, VerifyStatus};

/// Node types the linker treats as externally visible resources.
const LINKABLE_TYPES: &[NodeType] = &[
    NodeType::QueueProducer,
    NodeType::QueueConsumer,
    NodeType::ServiceCall,
    NodeType::ApiEndpoint,
    NodeType::DatabaseTable,
];

#[derive(Parser)]
#[command(name = "codemesh", version, about = "Self-improving code knowledge mesh")]
pub struct Cli {
    /// Path to the config file (defaults to ./codemesh.json).
    #[arg(long, global = true, default_value = "")]
    config: String,

    /// Overrides the configured database path.
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a project into a mesh JSON document
    Extract {
        path: PathBuf,
        /// Project id; defaults to the directory name.
        #[arg(long)]
        project: Option<String>,
        /// Write the document here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Enable the AI tiers for this run.
        #[arg(long)]
        ai: bool,
        /// Extra include globs, on top of the configured ones.
        #[arg(long)]
        include: Vec<String>,
        /// Extra exclude globs.
        #[arg(long)]
        exclude: Vec<String>,
        /// Only extract these repo-relative files, comma separated.
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        /// Only extract files changed since this commit.
        #[arg(long)]
        since: Option<String>,
    },
    /// Show which schemas would apply to a project's files
    Analyze { path: PathBuf },
    /// Re-verify every node of a mesh document against its source
    Verify {
        input: PathBuf,
        /// Project root the document was extracted from.
        #[arg(long)]
        root: PathBuf,
        /// Write the updated document here.
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Model override for this run.
        #[arg(long)]
        model: Option<String>,
        /// Stop after this many nodes.
        #[arg(long)]
        max_nodes: Option<usize>,
        /// Re-check only this fraction of nodes instead of all of them.
        #[arg(long)]
        sample_rate: Option<f64>,
    },
    /// List stored schemas and their active patterns
    Schemas,
    /// Show trust counters and per-schema health
    Trust {
        #[arg(long)]
        schema: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Export schemas and patterns as a JSON bundle
    SchemaExport {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Import a schema bundle into the store
    SchemaImport { input: PathBuf },
    /// Seed the store with the built-in schemas
    SchemaInit,
    /// Show the branch and commit of a work tree
    GitStatus { path: PathBuf },
    /// Show files changed between two revisions
    GitChanges {
        path: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: Option<String>,
    },
    /// Extraction history for a project
    History {
        project: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Record a mesh document's statistics as an extraction run
    RecordExtraction { input: PathBuf },
    /// Merge a mesh document into the graph store
    Store {
        input: PathBuf,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Only replace the files present in the document.
        #[arg(long)]
        incremental: bool,
        /// Files to remove from the store, comma separated.
        #[arg(long, value_delimiter = ',')]
        deleted_files: Vec<String>,
    },
    /// Aggregate counts or node listings for a stored project
    Query {
        project: String,
        #[arg(long, default_value = "main")]
        branch: String,
        /// List nodes of this type instead of printing counts.
        #[arg(long, value_name = "TYPE")]
        node_type: Option<String>,
        /// List the nodes extracted from this file.
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Walk, extract, merge and evolve in one step
    Sync {
        path: PathBuf,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        /// Force a full re-extraction.
        #[arg(long)]
        full: bool,
    },
    /// Find cross-project links between extracted projects
    Link {
        /// Mesh JSON files, or ids of projects already in the store.
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<String>,
        #[arg(long, default_value = "main")]
        branch: String,
        /// Run the AI pass over references the static pass left
        /// unmatched.
        #[arg(long)]
        ai: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    config.validate()?;

    match cli.command {
        Command::Extract {
            path,
            project,
            output,
            ai,
            include,
            exclude,
            files,
            since,
        } => {
            config.extraction.include.extend(include);
            config.extraction.exclude.extend(exclude);
            cmd_extract(&config, &path, project, output, ai, &files, since.as_deref()).await
        }
        Command::Analyze { path } => cmd_analyze(&config, &path),
        Command::Verify {
            input,
            root,
            output,
            model,
            max_nodes,
            sample_rate,
        } => {
            if let Some(model) = model {
                config.ai.model = model;
            }
            cmd_verify(&config, &input, &root, output, max_nodes, sample_rate).await
        }
        Command::Schemas => cmd_schemas(&config),
        Command::Trust { schema, json } => cmd_trust(&config, schema.as_deref(), json),
        Command::SchemaExport { output } => cmd_schema_export(&config, output),
        Command::SchemaImport { input } => cmd_schema_import(&config, &input),
        Command::SchemaInit => cmd_schema_init(&config),
        Command::GitStatus { path } => cmd_git_status(&path),
        Command::GitChanges { path, from, to } => cmd_git_changes(&path, &from, to.as_deref()),
        Command::History { project, limit } => cmd_history(&config, &project, limit),
        Command::RecordExtraction { input } => cmd_record_extraction(&config, &input),
        Command::Store {
            input,
            branch,
            incremental,
            deleted_files,
        } => cmd_store(&config, &input, &branch, incremental, &deleted_files),
        Command::Query {
            project,
            branch,
            node_type,
            file,
            json,
        } => cmd_query(&config, &project, &branch, node_type.as_deref(), file.as_deref(), json),
        Command::Sync {
            path,
            project,
            branch,
            full,
        } => cmd_sync(config, path, project, branch, full).await,
        Command::Link { inputs, branch, ai } => cmd_link(&config, &inputs, &branch, ai).await,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn make_provider(config: &Config, enabled: bool) -> Result<Option<Arc<dyn LlmProvider>>> {
    if !enabled {
        return Ok(None);
    }
    let provider = HttpProvider::new(config.provider_config())
        .context("failed to build LLM provider client")?;
    Ok(Some(Arc::new(provider)))
}

fn load_or_seed_schemas(db: &Db) -> Result<SchemaStore> {
    let store = db.load_schema_store()?;
    if store.schemas().next().is_some() {
        return Ok(store);
    }
    let store = SchemaStore::with_builtins();
    db.save_bundle(&store.export_bundle())?;
    Ok(store)
}

fn default_project_id(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string())
}

/// Token cancelled on Ctrl-C; in-flight files finish, nothing new is
/// scheduled.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let child = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight files");
            child.cancel();
        }
    });
    cancel
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.set_message(message);
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

// ── Commands ─────────────────────────────────────────────────────────

/// Narrow the walked entry set to an explicit file list and/or the
/// files changed since a commit. An empty list and no commit keep
/// everything.
fn scope_entries(
    entries: &mut Vec<crate::extract::FileEntry>,
    files: &[String],
    changed: Option<&git::ChangeSet>,
) {
    if let Some(changes) = changed {
        let wanted: std::collections::HashSet<String> =
            changes.to_extract().into_iter().collect();
        entries.retain(|e| wanted.contains(&e.path));
    }
    if !files.is_empty() {
        entries.retain(|e| files.iter().any(|f| f == &e.path));
    }
}

async fn cmd_extract(
    config: &Config,
    path: &Path,
    project: Option<String>,
    output: Option<PathBuf>,
    ai: bool,
    files: &[String],
    since: Option<&str>,
) -> Result<()> {
    let root = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve project path {}", path.display()))?;
    let project_id = project.unwrap_or_else(|| default_project_id(&root));

    let git_ctx = git::context(&root)?;
    let info = ProjectInfo {
        id: project_id,
        path: root.display().to_string(),
        branch: git_ctx.as_ref().map(|c| c.branch.clone()),
        commit: git_ctx.map(|c| c.commit),
    };

    let db = Db::open(&config.db_path)?;
    let schemas = load_or_seed_schemas(&db)?;
    let trust = Arc::new(TrustEngine::new());
    trust.load(db.load_trust()?);

    let mut pipeline_config = config.pipeline_config();
    pipeline_config.ai_enabled |= ai;
    let provider = make_provider(config, pipeline_config.ai_enabled)?;

    let extractor = FileExtractor::new(
        &config.extraction.include,
        &config.extraction.exclude,
        config.extraction.max_file_size_kb,
    )?;
    let (mut entries, ctx) = extractor.collect(&root)?;
    let changed = match since {
        Some(commit) => Some(git::changed_files(&root, commit, None)?),
        None => None,
    };
    scope_entries(&mut entries, files, changed.as_ref());

    let bar = spinner(format!("Extracting {} files", entries.len()));
    let pipeline = Pipeline::new(Arc::new(schemas), Arc::clone(&trust), provider, pipeline_config);
    let result = pipeline
        .run(info, &root, entries, ctx, cancel_on_ctrl_c())
        .await?;
    bar.finish_and_clear();

    db.save_trust(&trust.snapshot())?;
    db.append_corrections(&result.corrections)?;

    for failure in &result.failures {
        warn!(file = %failure.file, "Extraction failed: {}", failure.message);
    }

    match output {
        Some(path) => {
            result.document.save(&path)?;
            println!(
                "Wrote {} nodes, {} edges to {}",
                result.document.statistics.total_nodes,
                result.document.statistics.total_edges,
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&result.document)?),
    }
    Ok(())
}

fn cmd_analyze(config: &Config, path: &Path) -> Result<()> {
    let root = std::fs::canonicalize(path)?;
    let db = Db::open(&config.db_path)?;
    let schemas = load_or_seed_schemas(&db)?;

    let extractor = FileExtractor::new(
        &config.extraction.include,
        &config.extraction.exclude,
        config.extraction.max_file_size_kb,
    )?;
    let (entries, ctx) = extractor.collect(&root)?;

    let mut by_schema: std::collections::BTreeMap<String, usize> = Default::default();
    let mut by_language: std::collections::BTreeMap<&str, usize> = Default::default();
    let mut unmatched = 0usize;
    let total = entries.len();
    for entry in entries {
        if let Some(language) = entry.language {
            *by_language.entry(language).or_default() += 1;
        }
        let Ok(file) = FileExtractor::load(&root, &entry) else {
            continue;
        };
        let matches = schemas.find_matching_schemas(&file, &ctx);
        if matches.is_empty() {
            unmatched += 1;
        }
        for m in matches {
            *by_schema.entry(m.schema.id).or_default() += 1;
        }
    }

    println!("{total} extractable files");
    for (language, count) in &by_language {
        println!("  {language}: {count}");
    }
    println!("\nSchema coverage:");
    for (schema, count) in &by_schema {
        println!("  {schema}: {count} files");
    }
    if unmatched > 0 {
        println!("  (fallback extractor): {unmatched} files");
    }
    Ok(())
}

async fn cmd_verify(
    config: &Config,
    input: &Path,
    root: &Path,
    output: Option<PathBuf>,
    max_nodes: Option<usize>,
    sample_rate: Option<f64>,
) -> Result<()> {
    if let Some(rate) = sample_rate {
        anyhow::ensure!((0.0..=1.0).contains(&rate), "--sample-rate must be in [0, 1]");
    }
    let mut document = MeshDocument::load(input)?;
    let provider =
        make_provider(config, true)?.context("verification requires an LLM provider")?;
    let verifier = Verifier::new(provider);
    let mut sampler = Sampler::new(config.extraction.sample_seed);

    let mut verified = 0usize;
    let mut corrected = 0usize;
    let mut rejected = 0usize;
    let mut rejected_ids = Vec::new();

    // Group nodes by file so each source loads once.
    let mut cache: std::collections::HashMap<String, crate::extract::SourceFile> =
        Default::default();
    let mut checked = 0usize;
    for node in &mut document.nodes {
        if node.node_type == NodeType::File {
            continue;
        }
        if max_nodes.is_some_and(|limit| checked >= limit) {
            break;
        }
        if sample_rate.is_some_and(|rate| !sampler.sample(rate)) {
            continue;
        }
        checked += 1;
        let file = match cache.entry(node.source.file.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let entry = crate::extract::FileEntry {
                    path: node.source.file.clone(),
                    language: crate::extract::files::detect_language(&node.source.file),
                };
                match FileExtractor::load(root, &entry) {
                    Ok(file) => e.insert(file),
                    Err(err) => {
                        warn!(file = %node.source.file, "Cannot load source: {err}");
                        continue;
                    }
                }
            }
        };

        let outcome = verifier.verify(node, file).await;
        match outcome.status {
            VerifyStatus::Verified => {
                verified += 1;
                *node = outcome.node;
            }
            VerifyStatus::Corrected => {
                corrected += 1;
                *node = outcome.node;
            }
            VerifyStatus::Rejected => {
                rejected += 1;
                rejected_ids.push(node.id.clone());
            }
        }
    }

    document.nodes.retain(|n| !rejected_ids.contains(&n.id));
    document
        .edges
        .retain(|e| !rejected_ids.contains(&e.from_id) && !rejected_ids.contains(&e.to_id));
    document.statistics.tier2_verified += verified;
    document.statistics.tier2_corrected += corrected;
    document.statistics.tier2_rejected += rejected;
    document.statistics.total_nodes = document.nodes.len();
    document.statistics.total_edges = document.edges.len();

    println!("verified: {verified}, corrected: {corrected}, rejected: {rejected}");
    if let Some(path) = output {
        document.save(&path)?;
        println!("Wrote updated document to {}", path.display());
    }
    Ok(())
}

fn cmd_schemas(config: &Config) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let store = load_or_seed_schemas(&db)?;

    let mut schemas: Vec<_> = store.schemas().collect();
    schemas.sort_by(|a, b| a.id.cmp(&b.id));
    for schema in schemas {
        let patterns = store.load_patterns(&schema.id)?;
        let parent = schema
            .parent_id
            .as_deref()
            .map(|p| format!(" (extends {p})"))
            .unwrap_or_default();
        println!(
            "{} [{}]{} - {} active patterns",
            schema.id,
            schema.language,
            parent,
            patterns.len()
        );
        for pattern in patterns {
            println!("    {} v{} conf {:.2}", pattern.name, pattern.version, pattern.confidence);
        }
    }
    Ok(())
}

fn cmd_trust(config: &Config, schema: Option<&str>, json: bool) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let mut snapshots = db.load_trust()?;
    if let Some(schema) = schema {
        snapshots.retain(|s| s.key.schema_id == schema);
    }
    let health = schema_health(&snapshots, &config.health_thresholds());

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "patterns": snapshots,
                "schemas": health,
            }))?
        );
        return Ok(());
    }

    for snap in &snapshots {
        println!(
            "{} / {} [{}]: {} samples, accuracy {:.2}, level {}",
            snap.key.schema_id,
            snap.key.pattern_id,
            snap.key.language,
            snap.total,
            snap.accuracy,
            snap.level.as_str(),
        );
    }
    for h in &health {
        if !h.is_healthy() {
            println!("UNHEALTHY {}: {}", h.schema_id, h.issues.join("; "));
        }
    }
    Ok(())
}

fn cmd_schema_export(config: &Config, output: Option<PathBuf>) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let store = load_or_seed_schemas(&db)?;
    let bundle = store.export_bundle();
    let data = serde_json::to_string_pretty(&bundle)?;
    match output {
        Some(path) => {
            std::fs::write(&path, data)?;
            println!(
                "Exported {} schemas, {} patterns to {}",
                bundle.schemas.len(),
                bundle.patterns.len(),
                path.display()
            );
        }
        None => println!("{data}"),
    }
    Ok(())
}

fn cmd_schema_import(config: &Config, input: &Path) -> Result<()> {
    let data = std::fs::read_to_string(input)
        .with_context(|| format!("cannot read bundle {}", input.display()))?;
    let bundle: SchemaBundle = serde_json::from_str(&data).context("malformed schema bundle")?;

    let db = Db::open(&config.db_path)?;
    let mut store = db.load_schema_store()?;
    let loaded = store.import_bundle(bundle);
    let saved = db.save_bundle(&store.export_bundle())?;
    println!("Imported {loaded} patterns ({saved} rows saved)");
    Ok(())
}

fn cmd_schema_init(config: &Config) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let store = SchemaStore::with_builtins();
    let saved = db.save_bundle(&store.export_bundle())?;
    println!("Seeded {saved} built-in patterns");
    Ok(())
}

fn cmd_git_status(path: &Path) -> Result<()> {
    match git::context(path)? {
        Some(ctx) => println!("{} @ {}", ctx.branch, ctx.commit),
        None => println!("not a git work tree"),
    }
    Ok(())
}

fn cmd_git_changes(path: &Path, from: &str, to: Option<&str>) -> Result<()> {
    let changes = git::changed_files(path, from, to)?;
    println!("{}", serde_json::to_string_pretty(&changes)?);
    Ok(())
}

fn cmd_history(config: &Config, project: &str, limit: usize) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let history = db.extraction_history(project, limit)?;
    println!("{}", serde_json::to_string_pretty(&history)?);
    Ok(())
}

fn cmd_record_extraction(config: &Config, input: &Path) -> Result<()> {
    let document = MeshDocument::load(input)?;
    let db = Db::open(&config.db_path)?;
    let id = db.record_extraction(
        &document.project.id,
        document.project.branch.as_deref(),
        document.project.commit.as_deref(),
        &document.statistics,
    )?;
    println!("Recorded extraction #{id} for {}", document.project.id);
    Ok(())
}

fn cmd_store(
    config: &Config,
    input: &Path,
    branch: &str,
    incremental: bool,
    deleted_files: &[String],
) -> Result<()> {
    let document = MeshDocument::load(input)?;
    let mut db = Db::open(&config.db_path)?;
    let summary = db.store_document(&document, branch, incremental, deleted_files)?;
    println!(
        "Stored {} files ({} nodes, {} edges), deleted {}, dropped {} dangling edges",
        summary.files_stored,
        summary.nodes,
        summary.edges,
        summary.files_deleted,
        summary.dangling_dropped,
    );
    Ok(())
}

fn cmd_query(
    config: &Config,
    project: &str,
    branch: &str,
    node_type: Option<&str>,
    file: Option<&str>,
    json: bool,
) -> Result<()> {
    let db = Db::open(&config.db_path)?;

    let nodes = match (node_type, file) {
        (Some(t), _) => {
            let node_type =
                NodeType::parse(t).with_context(|| format!("unknown node type {t}"))?;
            Some(db.nodes_by_types(project, branch, &[node_type])?)
        }
        (None, Some(f)) => Some(db.file_nodes(project, branch, f)?),
        (None, None) => None,
    };
    if let Some(nodes) = nodes {
        if json {
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        } else {
            for node in &nodes {
                println!(
                    "{} {} ({}:{})",
                    node.node_type.as_str(),
                    node.name,
                    node.source.file,
                    node.source.line_start
                );
            }
            println!("{} nodes", nodes.len());
        }
        return Ok(());
    }

    let stats = db.project_stats(project, branch)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!(
        "{project}@{branch}: {} files, {} nodes, {} edges",
        stats.files, stats.nodes, stats.edges
    );
    for (node_type, count) in &stats.by_type {
        println!("  {node_type}: {count}");
    }
    Ok(())
}

async fn cmd_sync(
    config: Config,
    path: PathBuf,
    project: Option<String>,
    branch: Option<String>,
    full: bool,
) -> Result<()> {
    let root = std::fs::canonicalize(&path)?;
    let project_id = project.unwrap_or_else(|| default_project_id(&root));
    let provider = make_provider(&config, config.ai.enabled)?;

    let bar = spinner(format!("Syncing {project_id}"));
    let engine = SyncEngine::new(config, provider);
    let report = engine
        .sync(
            SyncRequest {
                project_id,
                root,
                branch,
                full,
            },
            cancel_on_ctrl_c(),
        )
        .await?;
    bar.finish_and_clear();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cmd_link(config: &Config, inputs: &[String], branch: &str, ai: bool) -> Result<()> {
    let db = Db::open(&config.db_path)?;
    let provider = make_provider(config, ai)?;

    let mut refs = Vec::new();
    let mut projects = Vec::new();
    for input in inputs {
        // A path to a mesh document, or the id of a stored project.
        let (project_id, nodes, root) = if Path::new(input).is_file() {
            let document = MeshDocument::load(input)?;
            let nodes: Vec<_> = document
                .nodes
                .into_iter()
                .filter(|n| LINKABLE_TYPES.contains(&n.node_type))
                .collect();
            (document.project.id, nodes, document.project.path)
        } else {
            let info = db.get_project(input)?.with_context(|| {
                format!("{input} is neither a mesh file nor a stored project")
            })?;
            let nodes = db.nodes_by_types(input, branch, LINKABLE_TYPES)?;
            (input.clone(), nodes, info.path)
        };

        let mut project_refs = collect_references(&project_id, &nodes);
        ConfigResolver::load(Path::new(&root)).resolve(&mut project_refs);
        refs.extend(project_refs);
        projects.push(project_id);
    }

    let matcher = Matcher::new(provider);
    let outcome = matcher.link(refs).await;

    for (i, a) in projects.iter().enumerate() {
        for b in projects.iter().skip(i + 1) {
            db.clear_links_between(a, b)?;
        }
    }
    let mut inserted_edges = 0usize;
    for link in &outcome.links {
        db.insert_link(link)?;
        if db.insert_cross_project_edge(branch, &link.to_edge())? {
            inserted_edges += 1;
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "links": outcome.links,
            "edges_inserted": inserted_edges,
            "unmatched": outcome.unmatched.len(),
        }))?
    );
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_accepts_file_and_commit_scoping() {
        let cli = Cli::try_parse_from([
            "codemesh", "extract", ".", "--files", "a.py,b.py", "--since", "abc123",
        ])
        .unwrap();
        match cli.command {
            Command::Extract { files, since, .. } => {
                assert_eq!(files, vec!["a.py", "b.py"]);
                assert_eq!(since.as_deref(), Some("abc123"));
            }
            _ => panic!("expected extract"),
        }
    }

    #[test]
    fn test_verify_accepts_sample_rate() {
        let cli = Cli::try_parse_from([
            "codemesh", "verify", "mesh.json", "--root", ".", "--sample-rate", "0.2",
        ])
        .unwrap();
        match cli.command {
            Command::Verify { sample_rate, .. } => assert_eq!(sample_rate, Some(0.2)),
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_link_takes_mesh_files() {
        let cli = Cli::try_parse_from(["codemesh", "link", "a.mesh.json", "b.mesh.json", "--ai"])
            .unwrap();
        match cli.command {
            Command::Link { inputs, ai, .. } => {
                assert_eq!(inputs, vec!["a.mesh.json", "b.mesh.json"]);
                assert!(ai);
            }
            _ => panic!("expected link"),
        }
    }

    #[test]
    fn test_link_needs_at_least_two_inputs() {
        assert!(Cli::try_parse_from(["codemesh", "link", "alone"]).is_err());
    }

    #[test]
    fn test_scope_entries_intersects_files_and_changes() {
        let entry = |path: &str| crate::extract::FileEntry {
            path: path.to_string(),
            language: crate::extract::files::detect_language(path),
        };
        let changes = git::ChangeSet {
            added: vec!["a.py".to_string()],
            modified: vec!["b.py".to_string()],
            deleted: vec!["c.py".to_string()],
        };

        let mut entries = vec![entry("a.py"), entry("b.py"), entry("d.py")];
        scope_entries(&mut entries, &[], Some(&changes));
        assert_eq!(entries.len(), 2, "deleted and untouched files drop out");

        scope_entries(&mut entries, &["b.py".to_string()], None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "b.py");
    }
}
