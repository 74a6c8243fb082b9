//! Mesh node/edge persistence and the per-file replace transaction.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::Db;
use crate::error::{MeshError, Result};
use crate::mesh::{
    Extraction, MeshDocument, MeshEdge, MeshNode, NodeType, ProjectInfo, SourceLocation,
};

/// Outcome of storing one mesh document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSummary {
    pub files_stored: usize,
    pub files_deleted: usize,
    pub nodes: usize,
    pub edges: usize,
    /// Edges dropped because an endpoint was missing.
    pub dangling_dropped: usize,
}

/// Aggregate counts for `query`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ProjectStats {
    pub files: usize,
    pub nodes: usize,
    pub edges: usize,
    pub by_type: BTreeMap<String, usize>,
}

impl Db {
    /// Replace a single file's node/edge set inside one transaction.
    /// The file's previous nodes are deleted (cascading their edges)
    /// and the new set inserted; on any failure the transaction rolls
    /// back and the old data stays intact.
    pub fn replace_file(
        &mut self,
        project: &str,
        branch: &str,
        file: &str,
        nodes: &[MeshNode],
        edges: &[MeshEdge],
    ) -> Result<StoreSummary> {
        let tx = self.conn.transaction().map_err(|source| MeshError::MergeFailed {
            file: file.to_string(),
            source,
        })?;

        let result = (|| -> rusqlite::Result<StoreSummary> {
            tx.execute(
                "DELETE FROM nodes WHERE project_id = ? AND branch = ? AND file = ?",
                params![project, branch, file],
            )?;

            let mut summary = StoreSummary {
                files_stored: 1,
                ..Default::default()
            };
            for node in nodes {
                insert_node(&tx, branch, node)?;
                summary.nodes += 1;
            }
            for edge in edges {
                if edge_endpoints_exist(&tx, branch, edge)? {
                    insert_edge_row(&tx, project, branch, edge)?;
                    summary.edges += 1;
                } else {
                    debug!(edge = %edge.id, "Dropping dangling edge");
                    summary.dangling_dropped += 1;
                }
            }
            Ok(summary)
        })();

        match result {
            Ok(summary) => {
                tx.commit().map_err(|source| MeshError::MergeFailed {
                    file: file.to_string(),
                    source,
                })?;
                Ok(summary)
            }
            Err(source) => Err(MeshError::MergeFailed {
                file: file.to_string(),
                source,
            }),
        }
    }

    /// Remove a deleted file's nodes (edges cascade).
    pub fn delete_file(&mut self, project: &str, branch: &str, file: &str) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM nodes WHERE project_id = ? AND branch = ? AND file = ?",
            params![project, branch, file],
        )?;
        Ok(deleted)
    }

    pub fn clear_project(&mut self, project: &str, branch: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM nodes WHERE project_id = ? AND branch = ?",
            params![project, branch],
        )?;
        Ok(())
    }

    /// Store a mesh document. Full mode clears the project first;
    /// incremental mode only touches the files present in the document
    /// plus the explicitly deleted ones. Either way each file is
    /// replaced as a unit.
    pub fn store_document(
        &mut self,
        document: &MeshDocument,
        branch: &str,
        incremental: bool,
        deleted_files: &[String],
    ) -> Result<StoreSummary> {
        let project = &document.project.id;
        if !incremental {
            self.clear_project(project, branch)?;
        }

        // Group nodes and edges by owning file. An edge belongs to the
        // file of its `from` endpoint.
        let mut node_file: HashMap<&str, &str> = HashMap::new();
        let mut by_file: BTreeMap<&str, (Vec<&MeshNode>, Vec<&MeshEdge>)> = BTreeMap::new();
        for node in &document.nodes {
            node_file.insert(&node.id, &node.source.file);
            by_file
                .entry(node.source.file.as_str())
                .or_default()
                .0
                .push(node);
        }
        let mut orphan_edges = 0usize;
        for edge in &document.edges {
            match node_file.get(edge.from_id.as_str()) {
                Some(file) => by_file.get_mut(*file).expect("file entry exists").1.push(edge),
                None => orphan_edges += 1,
            }
        }

        let mut total = StoreSummary::default();
        total.dangling_dropped += orphan_edges;
        for (file, (nodes, edges)) in by_file {
            let nodes: Vec<MeshNode> = nodes.into_iter().cloned().collect();
            let edges: Vec<MeshEdge> = edges.into_iter().cloned().collect();
            let summary = self.replace_file(project, branch, file, &nodes, &edges)?;
            total.files_stored += summary.files_stored;
            total.nodes += summary.nodes;
            total.edges += summary.edges;
            total.dangling_dropped += summary.dangling_dropped;
        }

        for file in deleted_files {
            if self.delete_file(project, branch, file)? > 0 {
                total.files_deleted += 1;
            }
        }

        self.upsert_project(&document.project)?;
        info!(
            project = %project,
            files = total.files_stored,
            nodes = total.nodes,
            edges = total.edges,
            "Stored mesh document"
        );
        Ok(total)
    }

    pub fn upsert_project(&self, project: &ProjectInfo) -> Result<()> {
        self.conn.execute(
            "INSERT INTO projects (id, path, branch, last_commit, updated_at)
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET
               path = excluded.path,
               branch = excluded.branch,
               last_commit = excluded.last_commit,
               updated_at = CURRENT_TIMESTAMP",
            params![project.id, project.path, project.branch, project.commit],
        )?;
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path, branch, last_commit FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ProjectInfo {
                id: row.get(0)?,
                path: row.get(1)?,
                branch: row.get(2)?,
                commit: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<ProjectInfo>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, path, branch, last_commit FROM projects WHERE id = ?",
                params![id],
                |row| {
                    Ok(ProjectInfo {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        branch: row.get(2)?,
                        commit: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn project_stats(&self, project: &str, branch: &str) -> Result<ProjectStats> {
        let mut stats = ProjectStats::default();

        let mut stmt = self.conn.prepare(
            "SELECT type, COUNT(*) FROM nodes WHERE project_id = ? AND branch = ? GROUP BY type",
        )?;
        let rows = stmt.query_map(params![project, branch], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (node_type, count) = row?;
            stats.nodes += count as usize;
            stats.by_type.insert(node_type, count as usize);
        }

        stats.files = self.conn.query_row(
            "SELECT COUNT(DISTINCT file) FROM nodes WHERE project_id = ? AND branch = ?",
            params![project, branch],
            |row| row.get::<_, i64>(0),
        )? as usize;
        stats.edges = self.conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE project_id = ? AND branch = ?",
            params![project, branch],
            |row| row.get::<_, i64>(0),
        )? as usize;

        Ok(stats)
    }

    /// Nodes of the given types for a project, used by the linker and
    /// by `query --nodes`.
    pub fn nodes_by_types(
        &self,
        project: &str,
        branch: &str,
        types: &[NodeType],
    ) -> Result<Vec<MeshNode>> {
        let mut out = Vec::new();
        for node_type in types {
            let mut stmt = self.conn.prepare(
                "SELECT id, type, name, properties, file, line_start, line_end,
                        tier, schema_id, pattern_id, confidence, extracted_at, project_id
                 FROM nodes WHERE project_id = ? AND branch = ? AND type = ?
                 ORDER BY file, line_start",
            )?;
            let rows = stmt.query_map(params![project, branch, node_type.as_str()], row_to_node)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    pub fn file_nodes(&self, project: &str, branch: &str, file: &str) -> Result<Vec<MeshNode>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, name, properties, file, line_start, line_end,
                    tier, schema_id, pattern_id, confidence, extracted_at, project_id
             FROM nodes WHERE project_id = ? AND branch = ? AND file = ?
             ORDER BY line_start, id",
        )?;
        let rows = stmt.query_map(params![project, branch, file], row_to_node)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn edge_count(&self, project: &str, branch: &str) -> Result<usize> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE project_id = ? AND branch = ?",
            params![project, branch],
            |row| row.get::<_, i64>(0),
        )? as usize)
    }

    /// Whether any edge references a node id that no longer exists.
    /// Kept for merge invariant checks in tests.
    pub fn dangling_edge_count(&self) -> Result<usize> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM edges e
             WHERE NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.from_id AND n.branch = e.branch)
                OR NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.to_id AND n.branch = e.branch)",
            [],
            |row| row.get::<_, i64>(0),
        )? as usize)
    }

    /// Insert a cross-project edge produced by the linker. Unlike the
    /// per-file replace path, this edge may span projects.
    pub fn insert_cross_project_edge(&self, branch: &str, edge: &MeshEdge) -> Result<bool> {
        let exists: bool = edge_endpoints_exist(&self.conn, branch, edge)?;
        if !exists {
            return Ok(false);
        }
        insert_edge_row(&self.conn, "", branch, edge)?;
        Ok(true)
    }
}

fn insert_node(conn: &rusqlite::Connection, branch: &str, node: &MeshNode) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes
           (id, branch, project_id, type, name, properties, file, line_start, line_end,
            tier, schema_id, pattern_id, confidence, extracted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            node.id,
            branch,
            node.project_id,
            node.node_type.as_str(),
            node.name,
            serde_json::to_string(&node.properties).unwrap_or_else(|_| "{}".to_string()),
            node.source.file,
            node.source.line_start as i64,
            node.source.line_end as i64,
            node.extraction.tier as i64,
            node.extraction.schema_id,
            node.extraction.pattern_id,
            node.extraction.confidence,
            node.extraction.extracted_at,
        ],
    )?;
    Ok(())
}

fn insert_edge_row(
    conn: &rusqlite::Connection,
    project: &str,
    branch: &str,
    edge: &MeshEdge,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO edges
           (id, branch, project_id, type, from_id, to_id, properties, tier, confidence, extracted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            edge.id,
            branch,
            project,
            edge.edge_type.as_str(),
            edge.from_id,
            edge.to_id,
            serde_json::to_string(&edge.properties).unwrap_or_else(|_| "{}".to_string()),
            edge.extraction.tier as i64,
            edge.extraction.confidence,
            edge.extraction.extracted_at,
        ],
    )?;
    Ok(())
}

fn edge_endpoints_exist(
    conn: &rusqlite::Connection,
    branch: &str,
    edge: &MeshEdge,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ? AND branch = ?)
            AND EXISTS(SELECT 1 FROM nodes WHERE id = ? AND branch = ?)",
        params![edge.from_id, branch, edge.to_id, branch],
        |row| row.get(0),
    )
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeshNode> {
    let type_str: String = row.get(1)?;
    let properties: String = row.get(3)?;
    let extracted_at: DateTime<Utc> = row.get(11)?;
    Ok(MeshNode {
        id: row.get(0)?,
        node_type: NodeType::parse(&type_str).unwrap_or(NodeType::File),
        name: row.get(2)?,
        properties: serde_json::from_str(&properties).unwrap_or_default(),
        source: SourceLocation {
            file: row.get(4)?,
            line_start: row.get::<_, i64>(5)? as usize,
            line_end: row.get::<_, i64>(6)? as usize,
        },
        extraction: Extraction {
            tier: row.get::<_, i64>(7)? as u8,
            schema_id: row.get(8)?,
            pattern_id: row.get(9)?,
            confidence: row.get(10)?,
            extracted_at,
        },
        project_id: row.get(12)?,
    })
}

// ── Tests ────────────────────────────────────────────────────────────
