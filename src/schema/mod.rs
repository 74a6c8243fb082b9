//! Schema and pattern model.
//!
//! A schema is a named bundle of extraction patterns for one language or
//! framework, with detection rules that score how well it fits a file.
//! Patterns are versioned data (regex + capture config + template), never
//! code: evolution produces a new pattern row linked via `evolved_from`.
pub mod builtin;
pub mod evolver;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::mesh::{EdgeType, NodeType};

// ── Defaults ─────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_pattern_confidence() -> f64 {
    0.8
}

fn default_accuracy() -> f64 {
    1.0
}

// ── Detection ────────────────────────────────────────────────────────

/// A content regex that, when it matches the file, adds its boost to the
/// schema's detection score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSignature {
    pub pattern: String,
    pub boost: f64,
}

/// Score contributed by a dependency-name hit in the project manifest.
pub const DEPENDENCY_BOOST: f64 = 0.15;
/// Score contributed by a file-glob hit on the path.
pub const GLOB_BOOST: f64 = 0.1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub file_globs: Vec<String>,
    #[serde(default)]
    pub content_signatures: Vec<ContentSignature>,
}

// ── Schema ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaTrust {
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
    #[serde(default)]
    pub extraction_count: u64,
}

impl Default for SchemaTrust {
    fn default() -> Self {
        Self {
            accuracy: default_accuracy(),
            extraction_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: String,
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub detection: Detection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub trust: SchemaTrust,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Schema {
    pub fn new(id: &str, name: &str, language: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            language: language.to_string(),
            detection: Detection::default(),
            parent_id: None,
            trust: SchemaTrust::default(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

// ── Pattern ──────────────────────────────────────────────────────────

/// Transform applied to a named capture before template substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Uppercase,
    Lowercase,
    Trim,
    SnakeCase,
    CamelCase,
}

impl Transform {
    pub fn apply(&self, value: &str) -> String {
        match self {
            Transform::Uppercase => value.to_uppercase(),
            Transform::Lowercase => value.to_lowercase(),
            Transform::Trim => value.trim().to_string(),
            Transform::SnakeCase => {
                let mut out = String::with_capacity(value.len() + 4);
                for (i, c) in value.chars().enumerate() {
                    if c.is_uppercase() {
                        if i > 0 {
                            out.push('_');
                        }
                        out.extend(c.to_lowercase());
                    } else if c == '-' || c == ' ' {
                        out.push('_');
                    } else {
                        out.push(c);
                    }
                }
                out
            }
            Transform::CamelCase => {
                let mut out = String::with_capacity(value.len());
                let mut upper_next = false;
                for (i, c) in value.chars().enumerate() {
                    if c == '_' || c == '-' || c == ' ' {
                        upper_next = true;
                    } else if upper_next {
                        out.extend(c.to_uppercase());
                        upper_next = false;
                    } else if i == 0 {
                        out.extend(c.to_lowercase());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSpec {
    /// Named capture group this spec applies to.
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// How the end line of a match's scope is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeMethod {
    Indentation,
    Brace,
    #[default]
    None,
}

/// What a pattern match instantiates: a node or an edge. Template
/// strings may reference captures as `${group}`; edge endpoints may also
/// reference the synthetic `${file}` root node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Template {
    Node {
        #[serde(rename = "type")]
        node_type: NodeType,
        name: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
    Edge {
        #[serde(rename = "type")]
        edge_type: EdgeType,
        from: String,
        to: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub schema_id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub regex: String,
    /// Regex flags: any of `m` (multi-line), `i` (case-insensitive),
    /// `s` (dot matches newline).
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub captures: Vec<CaptureSpec>,
    pub template: Template,
    #[serde(default)]
    pub scope: ScopeMethod,
    #[serde(default = "default_pattern_confidence")]
    pub confidence: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evolved_from: Option<String>,
}

impl Pattern {
    /// Compile the pattern's regex, honoring its flag string.
    pub fn compile(&self) -> Result<Regex, regex::Error> {
        RegexBuilder::new(&self.regex)
            .multi_line(self.flags.contains('m'))
            .case_insensitive(self.flags.contains('i'))
            .dot_matches_new_line(self.flags.contains('s'))
            .build()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transforms() {
        assert_eq!(Transform::Uppercase.apply("orders"), "ORDERS");
        assert_eq!(Transform::Lowercase.apply("Orders"), "orders");
        assert_eq!(Transform::Trim.apply("  x  "), "x");
        assert_eq!(Transform::SnakeCase.apply("OrderCreated"), "order_created");
        assert_eq!(Transform::CamelCase.apply("order_created"), "orderCreated");
    }

    #[test]
    fn test_pattern_compile_flags() {
        let mut p = Pattern {
            id: "p1".to_string(),
            schema_id: "s1".to_string(),
            name: "func".to_string(),
            version: 1,
            regex: r"^def (?P<name>\w+)".to_string(),
            flags: "m".to_string(),
            captures: vec![],
            template: Template::Node {
                node_type: NodeType::Function,
                name: "${name}".to_string(),
                properties: BTreeMap::new(),
            },
            scope: ScopeMethod::Indentation,
            confidence: 0.8,
            is_active: true,
            evolved_from: None,
        };

        let re = p.compile().unwrap();
        assert_eq!(re.find_iter("def a():\n    pass\ndef b():\n    pass\n").count(), 2);

        p.regex = "(unclosed".to_string();
        assert!(p.compile().is_err());
    }

    #[test]
    fn test_template_serde_tagging() {
        let json = r#"{"kind":"node","type":"ApiEndpoint","name":"${method} ${path}"}"#;
        let t: Template = serde_json::from_str(json).unwrap();
        match t {
            Template::Node { node_type, name, .. } => {
                assert_eq!(node_type, NodeType::ApiEndpoint);
                assert_eq!(name, "${method} ${path}");
            }
            Template::Edge { .. } => panic!("expected node template"),
        }
    }

    #[test]
    fn test_scope_method_default() {
        let p: ScopeMethod = serde_json::from_str("\"brace\"").unwrap();
        assert_eq!(p, ScopeMethod::Brace);
        assert_eq!(ScopeMethod::default(), ScopeMethod::None);
    }
}
