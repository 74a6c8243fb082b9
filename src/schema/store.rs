//! Schema/pattern store: detection scoring, inheritance resolution and
//! JSON interchange.
use std::collections::HashMap;

use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MeshError, Result};
use crate::extract::files::{ProjectContext, SourceFile};
use crate::schema::{DEPENDENCY_BOOST, GLOB_BOOST, Pattern, Schema};

/// A schema that matched a file, with its detection score. The score is
/// also the confidence boost Tier-1 adds to the file's result.
#[derive(Debug, Clone)]
pub struct SchemaMatch {
    pub schema: Schema,
    pub score: f64,
}

/// JSON interchange bundle (`schema-export` / `schema-import`).
#[derive(Debug, Serialize, Deserialize)]
pub struct SchemaBundle {
    pub version: String,
    pub schemas: Vec<Schema>,
    pub patterns: Vec<Pattern>,
}

#[derive(Debug, Clone, Default)]
pub struct SchemaStore {
    schemas: HashMap<String, Schema>,
    /// Patterns grouped by owning schema id, all versions included.
    patterns: HashMap<String, Vec<Pattern>>,
}

impl SchemaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store preloaded with the built-in base schemas.
    pub fn with_builtins() -> Self {
        let mut store = Self::new();
        for (schema, patterns) in super::builtin::builtin_schemas() {
            store.schemas.insert(schema.id.clone(), schema);
            for pattern in patterns {
                // Built-ins are assumed valid; still guard against typos.
                if let Err(e) = pattern.compile() {
                    warn!("Skipping built-in pattern {}: {e}", pattern.name);
                    continue;
                }
                store
                    .patterns
                    .entry(pattern.schema_id.clone())
                    .or_default()
                    .push(pattern);
            }
        }
        store
    }

    pub fn schema(&self, id: &str) -> Result<&Schema> {
        self.schemas
            .get(id)
            .ok_or_else(|| MeshError::SchemaNotFound(id.to_string()))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.values()
    }

    pub fn all_patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.values().flatten()
    }

    pub fn find_pattern(&self, pattern_id: &str) -> Option<&Pattern> {
        self.all_patterns().find(|p| p.id == pattern_id)
    }

    pub fn insert_schema(&mut self, schema: Schema) {
        self.schemas.insert(schema.id.clone(), schema);
    }

    /// Insert a pattern after validating its regex. Invalid patterns are
    /// rejected here so Tier-1 never sees an uncompilable rule.
    pub fn insert_pattern(&mut self, pattern: Pattern) -> Result<()> {
        if let Err(source) = pattern.compile() {
            return Err(MeshError::InvalidPattern {
                name: pattern.name.clone(),
                source,
            });
        }
        self.patterns
            .entry(pattern.schema_id.clone())
            .or_default()
            .push(pattern);
        Ok(())
    }

    /// Promote an evolved pattern: deactivate every active pattern in
    /// the same (schema, name) lineage, then insert the new version.
    /// Keeps the one-active-version-per-lineage invariant.
    pub fn promote(&mut self, new_pattern: Pattern) -> Result<()> {
        if let Some(patterns) = self.patterns.get_mut(&new_pattern.schema_id) {
            for p in patterns.iter_mut() {
                if p.name == new_pattern.name {
                    p.is_active = false;
                }
            }
        }
        self.insert_pattern(new_pattern)
    }

    /// Rank schemas against a file. Score is the sum of detection signal
    /// hits weighted by each signal's boost; zero-score schemas and
    /// schemas whose parent chain is not fully loaded are excluded.
    pub fn find_matching_schemas(
        &self,
        file: &SourceFile,
        ctx: &ProjectContext,
    ) -> Vec<SchemaMatch> {
        let Some(language) = file.language else {
            return Vec::new();
        };

        let mut matches: Vec<SchemaMatch> = self
            .schemas
            .values()
            .filter(|s| s.active && s.language == language && self.parent_chain_loaded(s))
            .filter_map(|s| {
                let score = self.detection_score(s, file, ctx);
                (score > 0.0).then(|| SchemaMatch {
                    schema: s.clone(),
                    score,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.schema.id.cmp(&b.schema.id))
        });
        matches
    }

    /// Active patterns for a schema, resolved through the inheritance
    /// chain. Child patterns override parent patterns with the same name.
    pub fn load_patterns(&self, schema_id: &str) -> Result<Vec<Pattern>> {
        let mut chain = Vec::new();
        let mut current = Some(schema_id.to_string());
        while let Some(id) = current {
            let schema = self.schema(&id)?;
            chain.push(id);
            current = schema.parent_id.clone();
        }

        // Walk from root to leaf so children overwrite parents.
        let mut by_name: HashMap<String, Pattern> = HashMap::new();
        for id in chain.iter().rev() {
            for pattern in self.patterns.get(id).into_iter().flatten() {
                if pattern.is_active {
                    by_name.insert(pattern.name.clone(), pattern.clone());
                }
            }
        }

        let mut patterns: Vec<Pattern> = by_name.into_values().collect();
        patterns.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(patterns)
    }

    fn parent_chain_loaded(&self, schema: &Schema) -> bool {
        let mut current = schema.parent_id.as_deref();
        while let Some(id) = current {
            match self.schemas.get(id) {
                Some(parent) => current = parent.parent_id.as_deref(),
                None => return false,
            }
        }
        true
    }

    fn detection_score(&self, schema: &Schema, file: &SourceFile, ctx: &ProjectContext) -> f64 {
        let mut score = 0.0;

        for dep in &schema.detection.dependencies {
            if ctx.dependencies.contains(dep) {
                score += DEPENDENCY_BOOST;
            }
        }

        for glob in &schema.detection.file_globs {
            if let Ok(g) = Glob::new(glob) {
                if g.compile_matcher().is_match(&file.path) {
                    score += GLOB_BOOST;
                }
            }
        }

        for sig in &schema.detection.content_signatures {
            match regex::Regex::new(&sig.pattern) {
                Ok(re) => {
                    if re.is_match(&file.content) {
                        score += sig.boost;
                    }
                }
                Err(e) => warn!("Bad content signature in {}: {e}", schema.id),
            }
        }

        score
    }

    // ── JSON interchange ─────────────────────────────────────────────

    /// Import a bundle, skipping (and logging) malformed patterns
    /// instead of failing the whole load.
    pub fn import_bundle(&mut self, bundle: SchemaBundle) -> usize {
        let mut loaded = 0;
        for schema in bundle.schemas {
            self.insert_schema(schema);
        }
        for pattern in bundle.patterns {
            match self.insert_pattern(pattern) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Rejected pattern on import: {e}"),
            }
        }
        loaded
    }

    pub fn export_bundle(&self) -> SchemaBundle {
        let mut schemas: Vec<Schema> = self.schemas.values().cloned().collect();
        schemas.sort_by(|a, b| a.id.cmp(&b.id));
        let mut patterns: Vec<Pattern> = self.all_patterns().cloned().collect();
        patterns.sort_by(|a, b| (&a.schema_id, &a.name, a.version).cmp(&(&b.schema_id, &b.name, b.version)));
        SchemaBundle {
            version: crate::mesh::MESH_FORMAT_VERSION.to_string(),
            schemas,
            patterns,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::NodeType;
    use crate::schema::{ContentSignature, Detection, ScopeMethod, Template};
    use std::collections::BTreeMap;

    fn test_pattern(id: &str, schema_id: &str, name: &str, regex: &str) -> Pattern {
        Pattern {
            id: id.to_string(),
            schema_id: schema_id.to_string(),
            name: name.to_string(),
            version: 1,
            regex: regex.to_string(),
            flags: "m".to_string(),
            captures: vec![],
            template: Template::Node {
                node_type: NodeType::Function,
                name: "${name}".to_string(),
                properties: BTreeMap::new(),
            },
            scope: ScopeMethod::None,
            confidence: 0.8,
            is_active: true,
            evolved_from: None,
        }
    }

    fn py_file(content: &str) -> SourceFile {
        SourceFile {
            path: "app/main.py".to_string(),
            language: Some("python"),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_schema_not_found() {
        let store = SchemaStore::new();
        assert!(matches!(
            store.schema("nope"),
            Err(MeshError::SchemaNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_insert() {
        let mut store = SchemaStore::new();
        store.insert_schema(Schema::new("s1", "base", "python"));
        let bad = test_pattern("p1", "s1", "broken", "(unclosed");
        assert!(matches!(
            store.insert_pattern(bad),
            Err(MeshError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_detection_scoring_orders_schemas() {
        let mut store = SchemaStore::new();

        let mut base = Schema::new("base-python", "base-python", "python");
        base.detection = Detection {
            file_globs: vec!["**/*.py".to_string()],
            ..Default::default()
        };
        store.insert_schema(base);

        let mut fastapi = Schema::new("fastapi", "fastapi", "python");
        fastapi.parent_id = Some("base-python".to_string());
        fastapi.detection = Detection {
            dependencies: vec!["fastapi".to_string()],
            file_globs: vec!["**/*.py".to_string()],
            content_signatures: vec![ContentSignature {
                pattern: r"@\w+\.(get|post|put|delete)\(".to_string(),
                boost: 0.2,
            }],
            ..Default::default()
        };
        store.insert_schema(fastapi);

        let mut ctx = ProjectContext::default();
        ctx.dependencies.insert("fastapi".to_string());

        let file = py_file("@app.get(\"/items\")\ndef list_items():\n    pass\n");
        let matches = store.find_matching_schemas(&file, &ctx);

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].schema.id, "fastapi");
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn test_unloaded_parent_excludes_schema() {
        let mut store = SchemaStore::new();
        let mut orphan = Schema::new("child", "child", "python");
        orphan.parent_id = Some("missing-parent".to_string());
        orphan.detection.file_globs = vec!["**/*.py".to_string()];
        store.insert_schema(orphan);

        let matches = store.find_matching_schemas(&py_file("x = 1"), &ProjectContext::default());
        assert!(matches.is_empty());
    }

    #[test]
    fn test_inheritance_child_overrides_parent() {
        let mut store = SchemaStore::new();
        store.insert_schema(Schema::new("parent", "parent", "python"));
        let mut child = Schema::new("child", "child", "python");
        child.parent_id = Some("parent".to_string());
        store.insert_schema(child);

        store
            .insert_pattern(test_pattern("p1", "parent", "func", r"def (?P<name>\w+)"))
            .unwrap();
        store
            .insert_pattern(test_pattern("p2", "parent", "cls", r"class (?P<name>\w+)"))
            .unwrap();
        store
            .insert_pattern(test_pattern("p3", "child", "func", r"async def (?P<name>\w+)"))
            .unwrap();

        let patterns = store.load_patterns("child").unwrap();
        assert_eq!(patterns.len(), 2);
        let func = patterns.iter().find(|p| p.name == "func").unwrap();
        assert_eq!(func.id, "p3", "child pattern must override parent");
    }

    #[test]
    fn test_promote_keeps_single_active_version() {
        let mut store = SchemaStore::new();
        store.insert_schema(Schema::new("s1", "s1", "python"));
        store
            .insert_pattern(test_pattern("p1", "s1", "func", r"def (?P<name>\w+)"))
            .unwrap();

        let mut v2 = test_pattern("p1-v2", "s1", "func", r"(?:async )?def (?P<name>\w+)");
        v2.version = 2;
        v2.evolved_from = Some("p1".to_string());
        store.promote(v2).unwrap();

        let active = store.load_patterns("s1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "p1-v2");
        assert_eq!(active[0].evolved_from.as_deref(), Some("p1"));
    }

    #[test]
    fn test_bundle_roundtrip() {
        let store = SchemaStore::with_builtins();
        let bundle = store.export_bundle();
        assert!(!bundle.schemas.is_empty());

        let mut fresh = SchemaStore::new();
        let loaded = fresh.import_bundle(bundle);
        assert!(loaded > 0);
        assert!(fresh.schema("base-python").is_ok());
    }
}
