//! Persistent graph store on SQLite.
//!
//! Nodes and edges are keyed by (id, branch) so one database can hold
//! several branches of several projects. Edges carry foreign keys to
//! both endpoints with ON DELETE CASCADE, which is what makes the
//! per-file replace transaction safe: deleting a file's nodes takes
//! every edge touching them along.
use std::path::Path;

use rusqlite::Connection;
use tracing::info;

pub mod graph;
pub mod meta;

use crate::error::Result;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    branch TEXT,
    last_commit TEXT,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    project_id TEXT NOT NULL,
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    file TEXT NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    tier INTEGER NOT NULL,
    schema_id TEXT,
    pattern_id TEXT,
    confidence REAL NOT NULL,
    extracted_at DATETIME NOT NULL,
    PRIMARY KEY (id, branch)
);

CREATE INDEX IF NOT EXISTS idx_nodes_project ON nodes(project_id, branch);
CREATE INDEX IF NOT EXISTS idx_nodes_file ON nodes(project_id, branch, file);
CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT NOT NULL,
    branch TEXT NOT NULL DEFAULT 'main',
    project_id TEXT NOT NULL,
    type TEXT NOT NULL,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    properties TEXT NOT NULL DEFAULT '{}',
    tier INTEGER NOT NULL,
    confidence REAL NOT NULL,
    extracted_at DATETIME NOT NULL,
    PRIMARY KEY (id, branch),
    FOREIGN KEY (from_id, branch) REFERENCES nodes(id, branch) ON DELETE CASCADE,
    FOREIGN KEY (to_id, branch) REFERENCES nodes(id, branch) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_edges_project ON edges(project_id, branch);
CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_id, branch);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id, branch);

CREATE TABLE IF NOT EXISTS schemas (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    language TEXT NOT NULL,
    parent_id TEXT,
    detection TEXT NOT NULL DEFAULT '{}',
    accuracy REAL NOT NULL DEFAULT 1.0,
    extraction_count INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    schema_id TEXT NOT NULL,
    name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    regex TEXT NOT NULL,
    flags TEXT NOT NULL DEFAULT '',
    captures TEXT NOT NULL DEFAULT '[]',
    template TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'none',
    confidence REAL NOT NULL DEFAULT 0.8,
    is_active INTEGER NOT NULL DEFAULT 1,
    evolved_from TEXT,
    FOREIGN KEY (schema_id) REFERENCES schemas(id)
);

CREATE INDEX IF NOT EXISTS idx_patterns_schema ON patterns(schema_id);

CREATE TABLE IF NOT EXISTS corrections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_id TEXT NOT NULL,
    file TEXT NOT NULL,
    original_start INTEGER NOT NULL,
    original_end INTEGER NOT NULL,
    corrected_start INTEGER,
    corrected_end INTEGER,
    snippet TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_corrections_pattern ON corrections(pattern_id);

CREATE TABLE IF NOT EXISTS trust (
    schema_id TEXT NOT NULL,
    pattern_id TEXT NOT NULL,
    language TEXT NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    corrected INTEGER NOT NULL DEFAULT 0,
    rejected INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (schema_id, pattern_id, language)
);

CREATE TABLE IF NOT EXISTS extractions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    branch TEXT,
    commit_sha TEXT,
    statistics TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_extractions_project ON extractions(project_id);

CREATE TABLE IF NOT EXISTS links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_project TEXT NOT NULL,
    target_project TEXT NOT NULL,
    source_ref TEXT NOT NULL,
    target_ref TEXT NOT NULL,
    link_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    reason TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Opens (or creates) the graph database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!("Graph store ready at {}", path.as_ref().display());
        Ok(Self { conn })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let temp = tempfile::tempdir().unwrap();
        let db = Db::open(temp.path().join("mesh.db")).unwrap();
        let count: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Db::open_in_memory().unwrap();
        let enabled: i64 = db
            .conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
