//! Persistence for schemas, patterns, trust counters, corrections,
//! extraction history and cross-project links.
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use super::Db;
use crate::error::Result;
use crate::link::CrossProjectLink;
use crate::mesh::{Correction, Statistics};
use crate::schema::store::{SchemaBundle, SchemaStore};
use crate::schema::{Pattern, Schema, ScopeMethod, SchemaTrust};
use crate::trust::{TrustKey, TrustLevel, TrustSnapshot};

/// One row of extraction history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtractionRecord {
    pub id: i64,
    pub project_id: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub statistics: Statistics,
    pub created_at: DateTime<Utc>,
}

fn scope_to_str(scope: ScopeMethod) -> &'static str {
    match scope {
        ScopeMethod::Indentation => "indentation",
        ScopeMethod::Brace => "brace",
        ScopeMethod::None => "none",
    }
}

fn scope_from_str(s: &str) -> ScopeMethod {
    match s {
        "indentation" => ScopeMethod::Indentation,
        "brace" => ScopeMethod::Brace,
        _ => ScopeMethod::None,
    }
}

impl Db {
    // ── Schemas and patterns ─────────────────────────────────────────

    pub fn save_schema(&self, schema: &Schema) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO schemas
               (id, name, language, parent_id, detection, accuracy, extraction_count, active, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                schema.id,
                schema.name,
                schema.language,
                schema.parent_id,
                serde_json::to_string(&schema.detection)?,
                schema.trust.accuracy,
                schema.trust.extraction_count as i64,
                schema.active,
                schema.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn save_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO patterns
               (id, schema_id, name, version, regex, flags, captures, template,
                scope, confidence, is_active, evolved_from)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                pattern.id,
                pattern.schema_id,
                pattern.name,
                pattern.version as i64,
                pattern.regex,
                pattern.flags,
                serde_json::to_string(&pattern.captures)?,
                serde_json::to_string(&pattern.template)?,
                scope_to_str(pattern.scope),
                pattern.confidence,
                pattern.is_active,
                pattern.evolved_from,
            ],
        )?;
        Ok(())
    }

    pub fn load_schemas(&self) -> Result<Vec<Schema>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, language, parent_id, detection, accuracy,
                    extraction_count, active, created_at
             FROM schemas ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let detection: String = row.get(4)?;
            Ok(Schema {
                id: row.get(0)?,
                name: row.get(1)?,
                language: row.get(2)?,
                parent_id: row.get(3)?,
                detection: serde_json::from_str(&detection).unwrap_or_default(),
                trust: SchemaTrust {
                    accuracy: row.get(5)?,
                    extraction_count: row.get::<_, i64>(6)? as u64,
                },
                active: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_patterns(&self) -> Result<Vec<Pattern>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, schema_id, name, version, regex, flags, captures, template,
                    scope, confidence, is_active, evolved_from
             FROM patterns ORDER BY schema_id, name, version",
        )?;
        let rows = stmt.query_map([], |row| {
            let captures: String = row.get(6)?;
            let template: String = row.get(7)?;
            let scope: String = row.get(8)?;
            Ok((
                row.get::<_, String>(0)?,
                Pattern {
                    id: row.get(0)?,
                    schema_id: row.get(1)?,
                    name: row.get(2)?,
                    version: row.get::<_, i64>(3)? as u32,
                    regex: row.get(4)?,
                    flags: row.get(5)?,
                    captures: serde_json::from_str(&captures).unwrap_or_default(),
                    template: serde_json::from_str(&template).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            7,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                    scope: scope_from_str(&scope),
                    confidence: row.get(9)?,
                    is_active: row.get(10)?,
                    evolved_from: row.get(11)?,
                },
            ))
        })?;

        let mut patterns = Vec::new();
        for row in rows {
            match row {
                Ok((_, pattern)) => patterns.push(pattern),
                Err(e) => warn!("Skipping undecodable pattern row: {e}"),
            }
        }
        Ok(patterns)
    }

    /// Build an in-memory schema store from the persisted rows.
    /// Patterns that fail regex validation are skipped with a warning,
    /// matching import semantics.
    pub fn load_schema_store(&self) -> Result<SchemaStore> {
        let mut store = SchemaStore::new();
        for schema in self.load_schemas()? {
            store.insert_schema(schema);
        }
        for pattern in self.load_patterns()? {
            if let Err(e) = store.insert_pattern(pattern) {
                warn!("Skipping stored pattern: {e}");
            }
        }
        Ok(store)
    }

    pub fn save_bundle(&self, bundle: &SchemaBundle) -> Result<usize> {
        for schema in &bundle.schemas {
            self.save_schema(schema)?;
        }
        let mut saved = 0;
        for pattern in &bundle.patterns {
            self.save_pattern(pattern)?;
            saved += 1;
        }
        Ok(saved)
    }

    // ── Trust ────────────────────────────────────────────────────────

    pub fn save_trust(&self, snapshots: &[TrustSnapshot]) -> Result<()> {
        for snap in snapshots {
            self.conn.execute(
                "INSERT OR REPLACE INTO trust
                   (schema_id, pattern_id, language, total, corrected, rejected)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    snap.key.schema_id,
                    snap.key.pattern_id,
                    snap.key.language,
                    snap.total as i64,
                    snap.corrected as i64,
                    snap.rejected as i64,
                ],
            )?;
        }
        Ok(())
    }

    pub fn load_trust(&self) -> Result<Vec<TrustSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT schema_id, pattern_id, language, total, corrected, rejected FROM trust",
        )?;
        let rows = stmt.query_map([], |row| {
            let total = row.get::<_, i64>(3)? as u64;
            let corrected = row.get::<_, i64>(4)? as u64;
            let rejected = row.get::<_, i64>(5)? as u64;
            let accuracy = if total == 0 {
                1.0
            } else {
                (total.saturating_sub(corrected + rejected)) as f64 / total as f64
            };
            Ok(TrustSnapshot {
                key: TrustKey {
                    schema_id: row.get(0)?,
                    pattern_id: row.get(1)?,
                    language: row.get(2)?,
                },
                total,
                corrected,
                rejected,
                accuracy,
                level: TrustLevel::Low,
            })
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let mut snap = row?;
            snap.level = TrustLevel::from_stats(snap.accuracy, snap.total);
            snapshots.push(snap);
        }
        Ok(snapshots)
    }

    // ── Corrections ──────────────────────────────────────────────────

    pub fn append_corrections(&self, corrections: &[Correction]) -> Result<()> {
        for c in corrections {
            self.conn.execute(
                "INSERT INTO corrections
                   (pattern_id, file, original_start, original_end,
                    corrected_start, corrected_end, snippet, reasoning)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    c.pattern_id,
                    c.file,
                    c.original_start as i64,
                    c.original_end as i64,
                    c.corrected_start.map(|v| v as i64),
                    c.corrected_end.map(|v| v as i64),
                    c.snippet,
                    c.reasoning,
                ],
            )?;
        }
        Ok(())
    }

    pub fn corrections_for_pattern(&self, pattern_id: &str, limit: usize) -> Result<Vec<Correction>> {
        let mut stmt = self.conn.prepare(
            "SELECT pattern_id, file, original_start, original_end,
                    corrected_start, corrected_end, snippet, reasoning
             FROM corrections WHERE pattern_id = ?
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![pattern_id, limit as i64], |row| {
            Ok(Correction {
                pattern_id: row.get(0)?,
                file: row.get(1)?,
                original_start: row.get::<_, i64>(2)? as usize,
                original_end: row.get::<_, i64>(3)? as usize,
                corrected_start: row.get::<_, Option<i64>>(4)?.map(|v| v as usize),
                corrected_end: row.get::<_, Option<i64>>(5)?.map(|v| v as usize),
                snippet: row.get(6)?,
                reasoning: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ── Extraction history ───────────────────────────────────────────

    pub fn record_extraction(
        &self,
        project: &str,
        branch: Option<&str>,
        commit: Option<&str>,
        statistics: &Statistics,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO extractions (project_id, branch, commit_sha, statistics)
             VALUES (?, ?, ?, ?)",
            params![project, branch, commit, serde_json::to_string(statistics)?],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn extraction_history(&self, project: &str, limit: usize) -> Result<Vec<ExtractionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, branch, commit_sha, statistics, created_at
             FROM extractions WHERE project_id = ?
             ORDER BY id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![project, limit as i64], |row| {
            let statistics: String = row.get(4)?;
            Ok(ExtractionRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                branch: row.get(2)?,
                commit: row.get(3)?,
                statistics: serde_json::from_str(&statistics).unwrap_or_default(),
                created_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent recorded commit for a project, used by `sync` to
    /// decide between full and incremental extraction.
    pub fn last_recorded_commit(&self, project: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT commit_sha FROM extractions WHERE project_id = ? AND commit_sha IS NOT NULL
                 ORDER BY id DESC LIMIT 1",
                params![project],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    // ── Cross-project links ──────────────────────────────────────────

    pub fn insert_link(&self, link: &CrossProjectLink) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO links
               (source_project, target_project, source_ref, target_ref, link_type, confidence, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                link.source.project_id,
                link.target.project_id,
                serde_json::to_string(&link.source)?,
                serde_json::to_string(&link.target)?,
                link.link_type.as_str(),
                link.confidence,
                link.reason,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replace all links between a pair of projects, in one transaction
    /// with the corresponding edge inserts done by the caller first.
    pub fn clear_links_between(&self, a: &str, b: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM links
             WHERE (source_project = ?1 AND target_project = ?2)
                OR (source_project = ?2 AND target_project = ?1)",
            params![a, b],
        )?;
        Ok(deleted)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
