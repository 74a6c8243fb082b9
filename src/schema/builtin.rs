//! Built-in base schemas seeded by `schema-init`.
//!
//! These cover the common languages plus the FastAPI/SQLAlchemy
//! framework schemas; everything else is expected to arrive via
//! `schema-import` or Tier-3 discovery.
use std::collections::BTreeMap;

use crate::mesh::{EdgeType, NodeType};
use crate::schema::{
    CaptureSpec, ContentSignature, Detection, Pattern, Schema, ScopeMethod, Template, Transform,
};

fn node_pattern(
    schema_id: &str,
    name: &str,
    regex: &str,
    node_type: NodeType,
    node_name: &str,
    scope: ScopeMethod,
    confidence: f64,
) -> Pattern {
    Pattern {
        id: format!("{schema_id}:{name}:1"),
        schema_id: schema_id.to_string(),
        name: name.to_string(),
        version: 1,
        regex: regex.to_string(),
        flags: "m".to_string(),
        captures: Vec::new(),
        template: Template::Node {
            node_type,
            name: node_name.to_string(),
            properties: BTreeMap::new(),
        },
        scope,
        confidence,
        is_active: true,
        evolved_from: None,
    }
}

fn edge_pattern(
    schema_id: &str,
    name: &str,
    regex: &str,
    edge_type: EdgeType,
    from: &str,
    to: &str,
) -> Pattern {
    Pattern {
        id: format!("{schema_id}:{name}:1"),
        schema_id: schema_id.to_string(),
        name: name.to_string(),
        version: 1,
        regex: regex.to_string(),
        flags: "m".to_string(),
        captures: Vec::new(),
        template: Template::Edge {
            edge_type,
            from: from.to_string(),
            to: to.to_string(),
            properties: BTreeMap::new(),
        },
        scope: ScopeMethod::None,
        confidence: 0.75,
        is_active: true,
        evolved_from: None,
    }
}

pub fn builtin_schemas() -> Vec<(Schema, Vec<Pattern>)> {
    vec![
        base_python(),
        fastapi(),
        sqlalchemy(),
        base_typescript(),
        base_javascript(),
        base_rust(),
        base_go(),
    ]
}

fn base_python() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("base-python", "base-python", "python");
    schema.detection = Detection {
        dependencies: vec![],
        file_globs: vec!["**/*.py".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"^(?:def|class)\s".to_string(),
            boost: 0.1,
        }],
    };

    let py_import = r"^(?:from|import)\s+(?P<module>[\w.]+)";
    let patterns = vec![
        node_pattern(
            "base-python",
            "function",
            r"^[ \t]*(?:async\s+)?def\s+(?P<name>\w+)\s*\(",
            NodeType::Function,
            "${name}",
            ScopeMethod::Indentation,
            0.85,
        ),
        node_pattern(
            "base-python",
            "class",
            r"^class\s+(?P<name>\w+)",
            NodeType::Class,
            "${name}",
            ScopeMethod::Indentation,
            0.85,
        ),
        node_pattern(
            "base-python",
            "import-module",
            py_import,
            NodeType::Module,
            "${module}",
            ScopeMethod::None,
            0.7,
        ),
        edge_pattern(
            "base-python",
            "import-edge",
            py_import,
            EdgeType::Imports,
            "${file}",
            "${module}",
        ),
    ];
    (schema, patterns)
}

fn fastapi() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("fastapi", "fastapi", "python");
    schema.parent_id = Some("base-python".to_string());
    schema.detection = Detection {
        dependencies: vec!["fastapi".to_string()],
        file_globs: vec!["**/*.py".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"@\w+\.(?:get|post|put|delete|patch)\(".to_string(),
            boost: 0.2,
        }],
    };

    let mut route = node_pattern(
        "fastapi",
        "route",
        r#"@(?P<app>\w+)\.(?P<method>get|post|put|delete|patch)\(\s*["'](?P<path>[^"']+)["']"#,
        NodeType::ApiEndpoint,
        "${method} ${path}",
        ScopeMethod::None,
        0.85,
    );
    route.captures = vec![CaptureSpec {
        group: "method".to_string(),
        transform: Some(Transform::Uppercase),
    }];
    if let Template::Node { properties, .. } = &mut route.template {
        properties.insert("method".to_string(), "${method}".to_string());
        properties.insert("path".to_string(), "${path}".to_string());
    }

    (schema, vec![route])
}

fn sqlalchemy() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("sqlalchemy", "sqlalchemy", "python");
    schema.parent_id = Some("base-python".to_string());
    schema.detection = Detection {
        dependencies: vec!["sqlalchemy".to_string()],
        file_globs: vec!["**/*.py".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"__tablename__".to_string(),
            boost: 0.2,
        }],
    };

    let mut table = node_pattern(
        "sqlalchemy",
        "table",
        r#"__tablename__\s*=\s*["'](?P<table>\w+)["']"#,
        NodeType::DatabaseTable,
        "${table}",
        ScopeMethod::None,
        0.85,
    );
    if let Template::Node { properties, .. } = &mut table.template {
        properties.insert("table".to_string(), "${table}".to_string());
    }

    (schema, vec![table])
}

fn base_typescript() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("base-typescript", "base-typescript", "typescript");
    schema.detection = Detection {
        dependencies: vec![],
        file_globs: vec!["**/*.ts".to_string(), "**/*.tsx".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"^(?:export\s+)?(?:function|class|interface|const)\s".to_string(),
            boost: 0.1,
        }],
    };

    let ts_import = r#"^import\s+.*?from\s+['"](?P<module>[^'"]+)['"]"#;
    let patterns = vec![
        node_pattern(
            "base-typescript",
            "function",
            r"^(?:export\s+)?(?:async\s+)?function\s+(?P<name>\w+)",
            NodeType::Function,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-typescript",
            "arrow-function",
            r"^(?:export\s+)?const\s+(?P<name>\w+)\s*=\s*(?:async\s*)?\(",
            NodeType::Function,
            "${name}",
            ScopeMethod::Brace,
            0.7,
        ),
        node_pattern(
            "base-typescript",
            "class",
            r"^(?:export\s+)?(?:abstract\s+)?class\s+(?P<name>\w+)",
            NodeType::Class,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-typescript",
            "interface",
            r"^(?:export\s+)?interface\s+(?P<name>\w+)",
            NodeType::Interface,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-typescript",
            "import-module",
            ts_import,
            NodeType::Module,
            "${module}",
            ScopeMethod::None,
            0.7,
        ),
        edge_pattern(
            "base-typescript",
            "import-edge",
            ts_import,
            EdgeType::Imports,
            "${file}",
            "${module}",
        ),
    ];
    (schema, patterns)
}

fn base_javascript() -> (Schema, Vec<Pattern>) {
    let (mut schema, patterns) = base_typescript();
    schema.id = "base-javascript".to_string();
    schema.name = "base-javascript".to_string();
    schema.language = "javascript".to_string();
    schema.detection.file_globs = vec!["**/*.js".to_string(), "**/*.jsx".to_string()];

    let patterns = patterns
        .into_iter()
        .filter(|p| p.name != "interface")
        .map(|mut p| {
            p.id = p.id.replace("base-typescript", "base-javascript");
            p.schema_id = "base-javascript".to_string();
            p
        })
        .collect();
    (schema, patterns)
}

fn base_rust() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("base-rust", "base-rust", "rust");
    schema.detection = Detection {
        dependencies: vec![],
        file_globs: vec!["**/*.rs".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"^(?:pub\s+)?(?:fn|struct|enum|trait)\s".to_string(),
            boost: 0.1,
        }],
    };

    let patterns = vec![
        node_pattern(
            "base-rust",
            "function",
            r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+(?P<name>\w+)",
            NodeType::Function,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-rust",
            "type",
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:struct|enum)\s+(?P<name>\w+)",
            NodeType::Class,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-rust",
            "trait",
            r"^(?:pub(?:\([^)]*\))?\s+)?trait\s+(?P<name>\w+)",
            NodeType::Interface,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
    ];
    (schema, patterns)
}

fn base_go() -> (Schema, Vec<Pattern>) {
    let mut schema = Schema::new("base-go", "base-go", "go");
    schema.detection = Detection {
        dependencies: vec![],
        file_globs: vec!["**/*.go".to_string()],
        content_signatures: vec![ContentSignature {
            pattern: r"^func\s".to_string(),
            boost: 0.1,
        }],
    };

    let patterns = vec![
        node_pattern(
            "base-go",
            "function",
            r"^func\s+(?:\([^)]*\)\s+)?(?P<name>\w+)\s*\(",
            NodeType::Function,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-go",
            "struct",
            r"^type\s+(?P<name>\w+)\s+struct\b",
            NodeType::Class,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
        node_pattern(
            "base-go",
            "interface",
            r"^type\s+(?P<name>\w+)\s+interface\b",
            NodeType::Interface,
            "${name}",
            ScopeMethod::Brace,
            0.85,
        ),
    ];
    (schema, patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_builtin_patterns_compile() {
        for (schema, patterns) in builtin_schemas() {
            for pattern in patterns {
                assert!(
                    pattern.compile().is_ok(),
                    "pattern {}/{} must compile",
                    schema.id,
                    pattern.name
                );
                assert_eq!(pattern.schema_id, schema.id);
            }
        }
    }

    #[test]
    fn test_framework_schemas_inherit_base_python() {
        let all = builtin_schemas();
        let fastapi = all.iter().find(|(s, _)| s.id == "fastapi").unwrap();
        let sqlalchemy = all.iter().find(|(s, _)| s.id == "sqlalchemy").unwrap();
        assert_eq!(fastapi.0.parent_id.as_deref(), Some("base-python"));
        assert_eq!(sqlalchemy.0.parent_id.as_deref(), Some("base-python"));
    }
}
