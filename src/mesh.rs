//! Mesh data model: nodes, edges and the mesh JSON document.
//!
//! The JSON shapes here are the contract consumed by downstream tooling
//! (documentation generators, graph viewers); field names are normative.
use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

/// Version stamp written into every mesh document.
pub const MESH_FORMAT_VERSION: &str = "1.0";

pub type Properties = BTreeMap<String, serde_json::Value>;

/// Closed set of node kinds the extraction tiers may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    File,
    Class,
    Function,
    Method,
    Interface,
    Module,
    ApiEndpoint,
    DatabaseTable,
    QueueProducer,
    QueueConsumer,
    ServiceCall,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::File => "File",
            NodeType::Class => "Class",
            NodeType::Function => "Function",
            NodeType::Method => "Method",
            NodeType::Interface => "Interface",
            NodeType::Module => "Module",
            NodeType::ApiEndpoint => "ApiEndpoint",
            NodeType::DatabaseTable => "DatabaseTable",
            NodeType::QueueProducer => "QueueProducer",
            NodeType::QueueConsumer => "QueueConsumer",
            NodeType::ServiceCall => "ServiceCall",
        }
    }

    pub fn parse(s: &str) -> Option<NodeType> {
        match s {
            "File" => Some(NodeType::File),
            "Class" => Some(NodeType::Class),
            "Function" => Some(NodeType::Function),
            "Method" => Some(NodeType::Method),
            "Interface" => Some(NodeType::Interface),
            "Module" => Some(NodeType::Module),
            "ApiEndpoint" => Some(NodeType::ApiEndpoint),
            "DatabaseTable" => Some(NodeType::DatabaseTable),
            "QueueProducer" => Some(NodeType::QueueProducer),
            "QueueConsumer" => Some(NodeType::QueueConsumer),
            "ServiceCall" => Some(NodeType::ServiceCall),
            _ => None,
        }
    }

    /// Whether two node types describe the same logical kind of entity
    /// for the purpose of tier-overlap merging. `Function` and `Method`
    /// are interchangeable since the tiers disagree on methodness.
    pub fn compatible_with(&self, other: NodeType) -> bool {
        if *self == other {
            return true;
        }
        matches!(
            (*self, other),
            (NodeType::Function, NodeType::Method) | (NodeType::Method, NodeType::Function)
        )
    }
}

/// Edge vocabulary. Serialized in SCREAMING_SNAKE_CASE to match the
/// graph-store relationship names external query tools depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Contains,
    Calls,
    Imports,
    Inherits,
    ReadsFrom,
    WritesTo,
    PublishesTo,
    SubscribesTo,
    Exposes,
    DependsOn,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Contains => "CONTAINS",
            EdgeType::Calls => "CALLS",
            EdgeType::Imports => "IMPORTS",
            EdgeType::Inherits => "INHERITS",
            EdgeType::ReadsFrom => "READS_FROM",
            EdgeType::WritesTo => "WRITES_TO",
            EdgeType::PublishesTo => "PUBLISHES_TO",
            EdgeType::SubscribesTo => "SUBSCRIBES_TO",
            EdgeType::Exposes => "EXPOSES",
            EdgeType::DependsOn => "DEPENDS_ON",
        }
    }

    pub fn parse(s: &str) -> Option<EdgeType> {
        match s {
            "CONTAINS" => Some(EdgeType::Contains),
            "CALLS" => Some(EdgeType::Calls),
            "IMPORTS" => Some(EdgeType::Imports),
            "INHERITS" => Some(EdgeType::Inherits),
            "READS_FROM" => Some(EdgeType::ReadsFrom),
            "WRITES_TO" => Some(EdgeType::WritesTo),
            "PUBLISHES_TO" => Some(EdgeType::PublishesTo),
            "SUBSCRIBES_TO" => Some(EdgeType::SubscribesTo),
            "EXPOSES" => Some(EdgeType::Exposes),
            "DEPENDS_ON" => Some(EdgeType::DependsOn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line_start: usize,
    pub line_end: usize,
}

/// Provenance of an extraction: which tier produced it, via which
/// schema/pattern, and how confident that stage was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub tier: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    pub confidence: f64,
    pub extracted_at: DateTime<Utc>,
}

impl Extraction {
    pub fn tier1(schema_id: Option<String>, pattern_id: Option<String>, confidence: f64) -> Self {
        Self {
            tier: 1,
            schema_id,
            pattern_id,
            confidence,
            extracted_at: Utc::now(),
        }
    }

    pub fn tier3(confidence: f64) -> Self {
        Self {
            tier: 3,
            schema_id: None,
            pattern_id: None,
            confidence,
            extracted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub properties: Properties,
    pub source: SourceLocation,
    pub project_id: String,
    pub extraction: Extraction,
}

impl MeshNode {
    /// Line-range overlap within the same file.
    pub fn overlaps(&self, other: &MeshNode) -> bool {
        self.source.file == other.source.file
            && self.source.line_start <= other.source.line_end
            && other.source.line_start <= self.source.line_end
    }

    /// Whether this node's range strictly contains the other's.
    pub fn contains_range(&self, other: &MeshNode) -> bool {
        self.source.file == other.source.file
            && (self.source.line_start < other.source.line_start
                && self.source.line_end >= other.source.line_end
                || self.source.line_start <= other.source.line_start
                    && self.source.line_end > other.source.line_end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub properties: Properties,
    pub extraction: Extraction,
}

/// Stable node identifier: derived from the logical identity of the
/// entity, not from extraction order, so re-extracting unchanged code
/// yields the same id. `ordinal` disambiguates same-named entities in
/// one file.
pub fn node_id(project: &str, file: &str, node_type: NodeType, name: &str, ordinal: usize) -> String {
    let key = format!("{project}\x1f{file}\x1f{}\x1f{name}\x1f{ordinal}", node_type.as_str());
    format!("n{:016x}", xxh3_64(key.as_bytes()))
}

pub fn edge_id(edge_type: EdgeType, from_id: &str, to_id: &str) -> String {
    let key = format!("{}\x1f{from_id}\x1f{to_id}", edge_type.as_str());
    format!("e{:016x}", xxh3_64(key.as_bytes()))
}

/// A Tier-2 correction, kept append-only as training signal for the
/// schema evolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub pattern_id: String,
    pub file: String,
    pub original_start: usize,
    pub original_end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_start: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_end: Option<usize>,
    pub snippet: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageStats {
    pub files: usize,
    pub nodes: usize,
    pub edges: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub files_processed: usize,
    pub total_nodes: usize,
    pub total_edges: usize,
    pub tier1_nodes: usize,
    pub tier2_verified: usize,
    pub tier2_corrected: usize,
    pub tier2_rejected: usize,
    pub tier3_nodes: usize,
    pub errors: usize,
    #[serde(default)]
    pub by_language: BTreeMap<String, LanguageStats>,
}

/// The mesh JSON document: the interchange format between `extract`,
/// `store`, `verify` and `link`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshDocument {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub project: ProjectInfo,
    pub statistics: Statistics,
    pub nodes: Vec<MeshNode>,
    pub edges: Vec<MeshEdge>,
}

impl MeshDocument {
    pub fn new(project: ProjectInfo) -> Self {
        Self {
            version: MESH_FORMAT_VERSION.to_string(),
            timestamp: Utc::now(),
            project,
            statistics: Statistics::default(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), data)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
