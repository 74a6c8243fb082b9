//! Tier-1: pattern-based extraction.
//!
//! Runs every active pattern of every matching schema against a file
//! and instantiates node/edge templates from the captures. No model
//! calls happen here; this tier is pure regex and template work.
use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::extract::files::{ProjectContext, SourceFile};
use crate::mesh::{
    edge_id, node_id, Extraction, MeshEdge, MeshNode, NodeType, Properties, SourceLocation,
};
use crate::schema::store::{SchemaMatch, SchemaStore};
use crate::schema::{Pattern, ScopeMethod, Template};

/// Everything Tier-1 produced for one file. The file node is always
/// `nodes[0]`; every other node has a CONTAINS edge from it.
#[derive(Debug, Clone)]
pub struct FileExtraction {
    pub nodes: Vec<MeshNode>,
    pub edges: Vec<MeshEdge>,
    /// Best-scoring schema match, if any schema matched at all.
    pub best_schema: Option<SchemaMatch>,
}

pub struct Tier1Matcher {
    /// Compiled regexes keyed by pattern id, shared across files.
    cache: Mutex<HashMap<String, Regex>>,
}

impl Default for Tier1Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Tier1Matcher {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Extract one file. Patterns from every matching schema run, with
    /// duplicates (inherited base patterns reachable through several
    /// children) collapsed by pattern id.
    pub fn extract(
        &self,
        project: &str,
        file: &SourceFile,
        store: &SchemaStore,
        ctx: &ProjectContext,
    ) -> Result<FileExtraction> {
        let matches = store.find_matching_schemas(file, ctx);
        let lines = LineIndex::new(&file.content);

        let file_node = MeshNode {
            id: node_id(project, &file.path, NodeType::File, &file.path, 0),
            node_type: NodeType::File,
            name: file.path.clone(),
            properties: file_properties(file),
            source: SourceLocation {
                file: file.path.clone(),
                line_start: 1,
                line_end: lines.line_count().max(1),
            },
            project_id: project.to_string(),
            extraction: Extraction::tier1(None, None, 1.0),
        };

        let mut patterns: Vec<(Pattern, f64)> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for m in &matches {
            for pattern in store.load_patterns(&m.schema.id)? {
                if seen.insert(pattern.id.clone()) {
                    patterns.push((pattern, m.score));
                }
            }
        }
        if patterns.is_empty() {
            // No schema knows this language: fall back to a generic
            // function/class heuristic at reduced confidence.
            patterns.extend(fallback_patterns().into_iter().map(|p| (p, 0.0)));
        }

        let mut builder = FileBuilder {
            project,
            file,
            lines: &lines,
            file_node_id: file_node.id.clone(),
            nodes: vec![file_node],
            edges: Vec::new(),
            spans_seen: std::collections::HashSet::new(),
            ordinals: HashMap::new(),
        };

        // Node templates first so edge endpoints can resolve by name.
        for (pattern, score) in &patterns {
            if matches!(pattern.template, Template::Node { .. }) {
                self.run_pattern(pattern, *score, &mut builder)?;
            }
        }
        for (pattern, score) in &patterns {
            if matches!(pattern.template, Template::Edge { .. }) {
                self.run_pattern(pattern, *score, &mut builder)?;
            }
        }

        // Every non-file node is contained by the file.
        let contains: Vec<MeshEdge> = builder.nodes[1..]
            .iter()
            .map(|node| {
                let extraction = node.extraction.clone();
                MeshEdge {
                    id: edge_id(crate::mesh::EdgeType::Contains, &builder.file_node_id, &node.id),
                    edge_type: crate::mesh::EdgeType::Contains,
                    from_id: builder.file_node_id.clone(),
                    to_id: node.id.clone(),
                    properties: Properties::new(),
                    extraction,
                }
            })
            .collect();
        builder.edges.extend(contains);

        Ok(FileExtraction {
            nodes: builder.nodes,
            edges: builder.edges,
            best_schema: matches.into_iter().next(),
        })
    }

    fn run_pattern(&self, pattern: &Pattern, score: f64, b: &mut FileBuilder<'_>) -> Result<()> {
        let regex = self.compiled(pattern)?;
        let confidence = (pattern.confidence + score).min(1.0);
        let file = b.file;

        for caps in regex.captures_iter(&file.content) {
            let Some(whole) = caps.get(0) else { continue };
            let line_start = b.lines.line_of(whole.start());
            let line_end = match pattern.scope {
                ScopeMethod::Indentation => b.lines.indentation_scope_end(&file.content, line_start),
                ScopeMethod::Brace => b.lines.brace_scope_end(&file.content, whole.start()),
                ScopeMethod::None => b.lines.line_of(whole.end().saturating_sub(1).max(whole.start())),
            };

            let values = capture_values(pattern, &regex, &caps, &file.path);

            match &pattern.template {
                Template::Node {
                    node_type,
                    name,
                    properties,
                } => {
                    let name = render(name, &values);
                    if name.is_empty() {
                        continue;
                    }
                    // One node per (type, name, start line); a second
                    // pattern re-matching the same entity is not a new node.
                    if !b.spans_seen.insert((node_type.as_str(), name.clone(), line_start)) {
                        continue;
                    }
                    let ordinal_key = (node_type.as_str(), name.clone());
                    let ordinal = {
                        let n = b.ordinals.entry(ordinal_key).or_insert(0usize);
                        let current = *n;
                        *n += 1;
                        current
                    };

                    let mut props = Properties::new();
                    for (key, template) in properties {
                        props.insert(
                            key.clone(),
                            serde_json::Value::String(render(template, &values)),
                        );
                    }

                    b.nodes.push(MeshNode {
                        id: node_id(b.project, &b.file.path, *node_type, &name, ordinal),
                        node_type: *node_type,
                        name,
                        properties: props,
                        source: SourceLocation {
                            file: b.file.path.clone(),
                            line_start,
                            line_end,
                        },
                        project_id: b.project.to_string(),
                        extraction: Extraction::tier1(
                            Some(pattern.schema_id.clone()),
                            Some(pattern.id.clone()),
                            confidence,
                        ),
                    });
                }
                Template::Edge {
                    edge_type,
                    from,
                    to,
                    properties,
                } => {
                    let from_id = b.resolve_endpoint(&render(from, &values));
                    let to_id = b.resolve_endpoint(&render(to, &values));
                    let (Some(from_id), Some(to_id)) = (from_id, to_id) else {
                        debug!(
                            pattern = %pattern.id,
                            "Edge endpoint did not resolve, skipping"
                        );
                        continue;
                    };

                    let mut props = Properties::new();
                    for (key, template) in properties {
                        props.insert(
                            key.clone(),
                            serde_json::Value::String(render(template, &values)),
                        );
                    }

                    let id = edge_id(*edge_type, &from_id, &to_id);
                    if b.edges.iter().any(|e| e.id == id) {
                        continue;
                    }
                    b.edges.push(MeshEdge {
                        id,
                        edge_type: *edge_type,
                        from_id,
                        to_id,
                        properties: props,
                        extraction: Extraction::tier1(
                            Some(pattern.schema_id.clone()),
                            Some(pattern.id.clone()),
                            confidence,
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn compiled(&self, pattern: &Pattern) -> Result<Regex> {
        let mut cache = self.cache.lock().expect("regex cache poisoned");
        if let Some(re) = cache.get(&pattern.id) {
            return Ok(re.clone());
        }
        let re = pattern.compile().map_err(|source| {
            crate::error::MeshError::InvalidPattern {
                name: pattern.name.clone(),
                source,
            }
        })?;
        cache.insert(pattern.id.clone(), re.clone());
        Ok(re)
    }
}

/// Language-agnostic heuristics used when no schema matches a file.
fn fallback_patterns() -> Vec<Pattern> {
    let make = |name: &str, regex: &str, node_type: NodeType| Pattern {
        id: format!("fallback:{name}:1"),
        schema_id: "fallback".to_string(),
        name: name.to_string(),
        version: 1,
        regex: regex.to_string(),
        flags: "m".to_string(),
        captures: Vec::new(),
        template: Template::Node {
            node_type,
            name: "${name}".to_string(),
            properties: std::collections::BTreeMap::new(),
        },
        scope: ScopeMethod::None,
        confidence: 0.5,
        is_active: true,
        evolved_from: None,
    };
    vec![
        make(
            "function",
            r"^[ \t]*(?:public\s+|private\s+|protected\s+|static\s+|async\s+)*(?:def|function|fn|func)\s+(?P<name>\w+)",
            NodeType::Function,
        ),
        make(
            "class",
            r"^[ \t]*(?:public\s+|abstract\s+|final\s+)*class\s+(?P<name>\w+)",
            NodeType::Class,
        ),
    ]
}

struct FileBuilder<'a> {
    project: &'a str,
    file: &'a SourceFile,
    lines: &'a LineIndex,
    file_node_id: String,
    nodes: Vec<MeshNode>,
    edges: Vec<MeshEdge>,
    spans_seen: std::collections::HashSet<(&'static str, String, usize)>,
    ordinals: HashMap<(&'static str, String), usize>,
}

impl FileBuilder<'_> {
    /// Resolve an edge endpoint: the file's own node, or a node already
    /// extracted from this file, looked up by name.
    fn resolve_endpoint(&self, rendered: &str) -> Option<String> {
        if rendered == self.file.path {
            return Some(self.file_node_id.clone());
        }
        self.nodes
            .iter()
            .find(|n| n.name == rendered)
            .map(|n| n.id.clone())
    }
}

fn file_properties(file: &SourceFile) -> Properties {
    let mut props = Properties::new();
    if let Some(language) = file.language {
        props.insert(
            "language".to_string(),
            serde_json::Value::String(language.to_string()),
        );
    }
    props
}

/// Build the `${group}` substitution map for one match, applying any
/// configured capture transforms. `${file}` is always available.
fn capture_values(
    pattern: &Pattern,
    regex: &Regex,
    caps: &regex::Captures<'_>,
    file_path: &str,
) -> HashMap<String, String> {
    let mut values = HashMap::new();
    values.insert("file".to_string(), file_path.to_string());

    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            let mut value = m.as_str().to_string();
            if let Some(spec) = pattern.captures.iter().find(|c| c.group == name) {
                if let Some(transform) = spec.transform {
                    value = transform.apply(&value);
                }
            }
            values.insert(name.to_string(), value);
        }
    }
    values
}

/// Substitute `${name}` references in a template string.
fn render(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                if let Some(value) = values.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ── Line geometry ────────────────────────────────────────────────────

/// Byte-offset to line-number mapping plus scope-end resolution.
struct LineIndex {
    /// Byte offset of the start of each line.
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(content: &str) -> Self {
        let mut starts = vec![0];
        for (i, b) in content.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self { starts }
    }

    fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 1-based line number containing the byte offset.
    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&s| s <= offset)
    }

    /// End line of an indentation-delimited scope starting at
    /// `start_line`: the last non-blank line more indented than the
    /// opener.
    fn indentation_scope_end(&self, content: &str, start_line: usize) -> usize {
        let lines: Vec<&str> = content.lines().collect();
        if start_line == 0 || start_line > lines.len() {
            return start_line;
        }
        let base = indent_width(lines[start_line - 1]);
        let mut end = start_line;
        for (idx, line) in lines.iter().enumerate().skip(start_line) {
            if line.trim().is_empty() {
                continue;
            }
            if indent_width(line) <= base {
                break;
            }
            end = idx + 1;
        }
        end
    }

    /// End line of a brace-delimited scope: the line of the brace that
    /// closes the first `{` at or after `offset`.
    fn brace_scope_end(&self, content: &str, offset: usize) -> usize {
        let bytes = content.as_bytes();
        let Some(open) = bytes[offset..].iter().position(|&b| b == b'{') else {
            return self.line_of(offset);
        };
        let mut depth = 0usize;
        for (i, &b) in bytes[offset + open..].iter().enumerate() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return self.line_of(offset + open + i);
                    }
                }
                _ => {}
            }
        }
        self.line_of(content.len().saturating_sub(1))
    }
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::store::SchemaStore;

    fn py_ctx() -> ProjectContext {
        let mut ctx = ProjectContext::default();
        ctx.dependencies.insert("fastapi".to_string());
        ctx.dependencies.insert("sqlalchemy".to_string());
        ctx
    }

    fn extract(content: &str) -> FileExtraction {
        let store = SchemaStore::with_builtins();
        let matcher = Tier1Matcher::new();
        let file = SourceFile {
            path: "app/main.py".to_string(),
            language: Some("python"),
            content: content.to_string(),
        };
        matcher.extract("demo", &file, &store, &py_ctx()).unwrap()
    }

    #[test]
    fn test_python_functions_and_scope() {
        let result = extract("def alpha():\n    x = 1\n    return x\n\ndef beta():\n    pass\n");
        let functions: Vec<&MeshNode> = result
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Function)
            .collect();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].name, "alpha");
        assert_eq!(functions[0].source.line_start, 1);
        assert_eq!(functions[0].source.line_end, 3);
        assert_eq!(functions[1].name, "beta");
        assert_eq!(functions[1].source.line_start, 5);
    }

    #[test]
    fn test_fastapi_route_and_sqlalchemy_table() {
        let content = concat!(
            "from fastapi import FastAPI\n",
            "\n",
            "@app.get(\"/orders\")\n",
            "def list_orders():\n",
            "    pass\n",
            "\n",
            "class Order(Base):\n",
            "    __tablename__ = \"orders\"\n",
        );
        let result = extract(content);

        let endpoint = result
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::ApiEndpoint)
            .expect("endpoint node");
        assert_eq!(endpoint.name, "GET /orders");
        assert_eq!(endpoint.properties["method"], "GET");
        assert_eq!(endpoint.properties["path"], "/orders");

        let table = result
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::DatabaseTable)
            .expect("table node");
        assert_eq!(table.name, "orders");

        // File node contains both, with tier-1 provenance.
        let file_id = &result.nodes[0].id;
        for target in [&endpoint.id, &table.id] {
            assert!(
                result.edges.iter().any(|e| {
                    e.edge_type == crate::mesh::EdgeType::Contains
                        && e.from_id == *file_id
                        && e.to_id == **target
                }),
                "missing CONTAINS edge"
            );
        }
        assert!(endpoint.extraction.confidence >= 0.5);
        assert_eq!(endpoint.extraction.tier, 1);
    }

    #[test]
    fn test_import_edges_resolve_to_module_nodes() {
        let result = extract("import os\nfrom requests import get\n");
        let modules: Vec<&MeshNode> = result
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Module)
            .collect();
        assert_eq!(modules.len(), 2);

        let imports: Vec<&MeshEdge> = result
            .edges
            .iter()
            .filter(|e| e.edge_type == crate::mesh::EdgeType::Imports)
            .collect();
        assert_eq!(imports.len(), 2);
        for edge in imports {
            assert_eq!(edge.from_id, result.nodes[0].id, "imports originate at the file");
        }
    }

    #[test]
    fn test_duplicate_names_get_distinct_ids() {
        // Same function name twice at different locations.
        let result = extract("def handler():\n    pass\n\nclass A:\n    pass\n\ndef handler():\n    pass\n");
        let handlers: Vec<&MeshNode> = result
            .nodes
            .iter()
            .filter(|n| n.name == "handler")
            .collect();
        assert_eq!(handlers.len(), 2);
        assert_ne!(handlers[0].id, handlers[1].id);
    }

    #[test]
    fn test_stable_ids_across_runs() {
        let content = "def alpha():\n    pass\n";
        let a = extract(content);
        let b = extract(content);
        let ids_a: Vec<&String> = a.nodes.iter().map(|n| &n.id).collect();
        let ids_b: Vec<&String> = b.nodes.iter().map(|n| &n.id).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_brace_scope() {
        let store = SchemaStore::with_builtins();
        let matcher = Tier1Matcher::new();
        let file = SourceFile {
            path: "src/lib.rs".to_string(),
            language: Some("rust"),
            content: "fn alpha() {\n    let x = 1;\n}\n\nfn beta() {}\n".to_string(),
        };
        let result = matcher
            .extract("demo", &file, &store, &ProjectContext::default())
            .unwrap();
        let alpha = result.nodes.iter().find(|n| n.name == "alpha").unwrap();
        assert_eq!(alpha.source.line_start, 1);
        assert_eq!(alpha.source.line_end, 3);
    }

    #[test]
    fn test_fallback_when_no_schema_matches() {
        let store = SchemaStore::with_builtins();
        let matcher = Tier1Matcher::new();
        let file = SourceFile {
            path: "src/Main.java".to_string(),
            language: Some("java"),
            content: "public class Main {\n    public static void main() {}\n}\n".to_string(),
        };
        let result = matcher
            .extract("demo", &file, &store, &ProjectContext::default())
            .unwrap();
        let class = result
            .nodes
            .iter()
            .find(|n| n.node_type == NodeType::Class)
            .expect("fallback class node");
        assert_eq!(class.name, "Main");
        assert!((class.extraction.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_render_substitution() {
        let mut values = HashMap::new();
        values.insert("method".to_string(), "GET".to_string());
        values.insert("path".to_string(), "/x".to_string());
        assert_eq!(render("${method} ${path}", &values), "GET /x");
        assert_eq!(render("no placeholders", &values), "no placeholders");
        assert_eq!(render("${missing}", &values), "");
    }
}
