//! File extractor: walks a project, detects languages, collects the
//! dependency context used by schema detection.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::error::Result;

/// A file selected for extraction; content is loaded lazily by the
/// pipeline so the walker never holds a whole tree in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Repo-relative path, forward slashes.
    pub path: String,
    pub language: Option<&'static str>,
}

/// A file with its content loaded, ready for Tier-1 matching.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: String,
    pub language: Option<&'static str>,
    pub content: String,
}

/// Project-wide facts gathered during the walk, used by schema
/// detection (dependency-name signals).
#[derive(Debug, Clone, Default)]
pub struct ProjectContext {
    pub root: PathBuf,
    pub dependencies: HashSet<String>,
}

/// Map an extension to a language name shared with schema definitions.
pub fn detect_language(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension().and_then(|e| e.to_str())?;
    match ext {
        "py" => Some("python"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" | "mjs" => Some("javascript"),
        "rs" => Some("rust"),
        "go" => Some("go"),
        "java" => Some("java"),
        "kt" => Some("kotlin"),
        "cs" => Some("csharp"),
        "rb" => Some("ruby"),
        "php" => Some("php"),
        _ => None,
    }
}

pub struct FileExtractor {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    max_file_size: u64,
}

impl FileExtractor {
    pub fn new(include: &[String], exclude: &[String], max_file_size_kb: usize) -> Result<Self> {
        Ok(Self {
            include: build_globset(include)?,
            exclude: build_globset(exclude)?,
            max_file_size: (max_file_size_kb as u64) * 1024,
        })
    }

    /// Walk the project and return the extraction candidates plus the
    /// dependency context. Respects .gitignore via the walker.
    pub fn collect(&self, root: &Path) -> Result<(Vec<FileEntry>, ProjectContext)> {
        let mut entries = Vec::new();
        let mut ctx = ProjectContext {
            root: root.to_path_buf(),
            dependencies: HashSet::new(),
        };

        let walker = WalkBuilder::new(root).hidden(false).build();
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }

            let rel = match path.strip_prefix(root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };

            if is_manifest(&rel) {
                if let Ok(content) = std::fs::read_to_string(path) {
                    collect_dependencies(&rel, &content, &mut ctx.dependencies);
                }
            }

            let language = detect_language(&rel);
            if language.is_none() {
                continue;
            }
            if let Some(inc) = &self.include {
                if !inc.is_match(&rel) {
                    continue;
                }
            }
            if let Some(exc) = &self.exclude {
                if exc.is_match(&rel) {
                    continue;
                }
            }
            if let Ok(meta) = entry.metadata() {
                if meta.len() > self.max_file_size {
                    debug!("Skipping oversized file: {rel} ({} bytes)", meta.len());
                    continue;
                }
            }

            entries.push(FileEntry { path: rel, language });
        }

        // Deterministic processing order regardless of walker order.
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok((entries, ctx))
    }

    /// Load one entry's content from disk.
    pub fn load(root: &Path, entry: &FileEntry) -> Result<SourceFile> {
        let content = std::fs::read_to_string(root.join(&entry.path))?;
        Ok(SourceFile {
            path: entry.path.clone(),
            language: entry.language,
            content,
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(g) => {
                builder.add(g);
            }
            Err(e) => warn!("Ignoring invalid glob {pattern}: {e}"),
        }
    }
    Ok(builder.build().ok())
}

fn is_manifest(rel: &str) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    matches!(
        name,
        "package.json" | "requirements.txt" | "pyproject.toml" | "Cargo.toml" | "go.mod"
    )
}

/// Extract dependency names from a manifest into the project context.
fn collect_dependencies(rel: &str, content: &str, deps: &mut HashSet<String>) {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    match name {
        "package.json" => {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                for key in ["dependencies", "devDependencies"] {
                    if let Some(map) = value.get(key).and_then(|v| v.as_object()) {
                        deps.extend(map.keys().cloned());
                    }
                }
            }
        }
        "requirements.txt" => {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let dep: String = line
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
                    .collect();
                if !dep.is_empty() {
                    deps.insert(dep.to_lowercase());
                }
            }
        }
        "pyproject.toml" | "Cargo.toml" => {
            if let Ok(value) = content.parse::<toml::Value>() {
                if let Some(table) = value.get("dependencies").and_then(|v| v.as_table()) {
                    deps.extend(table.keys().cloned());
                }
                if let Some(list) = value
                    .get("project")
                    .and_then(|p| p.get("dependencies"))
                    .and_then(|v| v.as_array())
                {
                    for item in list.iter().filter_map(|v| v.as_str()) {
                        let dep: String = item
                            .chars()
                            .take_while(|c| {
                                c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.'
                            })
                            .collect();
                        if !dep.is_empty() {
                            deps.insert(dep.to_lowercase());
                        }
                    }
                }
            }
        }
        "go.mod" => {
            for line in content.lines() {
                let line = line.trim();
                if let Some(rest) = line.strip_prefix("require ") {
                    if let Some(module) = rest.split_whitespace().next() {
                        deps.insert(module.to_string());
                    }
                } else if line.contains('/') && line.contains(" v") {
                    if let Some(module) = line.split_whitespace().next() {
                        deps.insert(module.to_string());
                    }
                }
            }
        }
        _ => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────────
