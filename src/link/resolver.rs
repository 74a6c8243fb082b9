//! Config resolution for reference placeholders.
//!
//! References often carry an environment-variable placeholder instead
//! of a literal (`${ORDERS_TOPIC}`). The resolver loads a project's
//! `.env` files, compose files and Kubernetes-style YAML manifests and
//! substitutes the literal value, recording which file supplied it.
use std::collections::HashMap;
use std::path::Path;

use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::link::ExternalReference;

const ENV_FILES: &[&str] = &[".env", ".env.local", ".env.production"];
const COMPOSE_FILES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

#[derive(Debug, Default)]
pub struct ConfigResolver {
    /// Variable name to (value, source file).
    values: HashMap<String, (String, String)>,
}

impl ConfigResolver {
    /// Load every recognized config file under the project root.
    /// Missing files are fine; malformed ones are skipped with a
    /// warning.
    pub fn load(root: &Path) -> Self {
        let mut resolver = Self::default();

        for name in ENV_FILES {
            let path = root.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                resolver.parse_env(&content, name);
            }
        }
        for name in COMPOSE_FILES {
            let path = root.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                resolver.parse_compose(&content, name);
            }
        }
        resolver.load_manifests(root);

        debug!("Config resolver loaded {} variables", resolver.values.len());
        resolver
    }

    /// Kubernetes and similar YAML manifests anywhere under the root:
    /// `env:` name/value lists plus ConfigMap `data:` blocks. Only
    /// documents carrying a `kind:` are considered manifests.
    fn load_manifests(&mut self, root: &Path) {
        let walker = WalkBuilder::new(root).hidden(false).build();
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if COMPOSE_FILES.contains(&name) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let source = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");

            for doc in content.split("\n---") {
                if doc.trim().is_empty() {
                    continue;
                }
                let value: serde_yaml::Value = match serde_yaml::from_str(doc) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Skipping malformed manifest {source}: {e}");
                        continue;
                    }
                };
                let Some(kind) = value.get("kind").and_then(|k| k.as_str()) else {
                    continue;
                };
                if kind == "ConfigMap" {
                    if let Some(serde_yaml::Value::Mapping(data)) = value.get("data") {
                        for (key, val) in data {
                            if let (Some(k), Some(v)) = (key.as_str(), yaml_scalar(val)) {
                                self.values
                                    .entry(k.to_string())
                                    .or_insert_with(|| (v, source.clone()));
                            }
                        }
                    }
                }
                self.harvest_env(&value, &source);
            }
        }
    }

    /// Walk a manifest document for `env:` sequences of name/value
    /// pairs, wherever they nest (pod specs, containers, init jobs).
    fn harvest_env(&mut self, value: &serde_yaml::Value, source: &str) {
        match value {
            serde_yaml::Value::Mapping(map) => {
                for (key, val) in map {
                    if key.as_str() == Some("env") {
                        if let serde_yaml::Value::Sequence(seq) = val {
                            for item in seq {
                                let name = item.get("name").and_then(|n| n.as_str());
                                let literal = item.get("value").and_then(yaml_scalar);
                                if let (Some(name), Some(literal)) = (name, literal) {
                                    self.values
                                        .entry(name.to_string())
                                        .or_insert_with(|| (literal, source.to_string()));
                                }
                            }
                            continue;
                        }
                    }
                    self.harvest_env(val, source);
                }
            }
            serde_yaml::Value::Sequence(seq) => {
                for item in seq {
                    self.harvest_env(item, source);
                }
            }
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn parse_env(&mut self, content: &str, source: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            // Earlier files win so .env beats .env.production.
            self.values
                .entry(key.trim().to_string())
                .or_insert_with(|| (value.to_string(), source.to_string()));
        }
    }

    fn parse_compose(&mut self, content: &str, source: &str) {
        let doc: serde_yaml::Value = match serde_yaml::from_str(content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Skipping malformed compose file {source}: {e}");
                return;
            }
        };
        let Some(services) = doc.get("services").and_then(|s| s.as_mapping()) else {
            return;
        };
        for (_, service) in services {
            match service.get("environment") {
                // environment: {KEY: value}
                Some(serde_yaml::Value::Mapping(map)) => {
                    for (key, value) in map {
                        if let (Some(k), Some(v)) = (key.as_str(), yaml_scalar(value)) {
                            self.values
                                .entry(k.to_string())
                                .or_insert_with(|| (v, source.to_string()));
                        }
                    }
                }
                // environment: ["KEY=value"]
                Some(serde_yaml::Value::Sequence(seq)) => {
                    for item in seq {
                        if let Some(entry) = item.as_str() {
                            if let Some((k, v)) = entry.split_once('=') {
                                self.values
                                    .entry(k.trim().to_string())
                                    .or_insert_with(|| (v.trim().to_string(), source.to_string()));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Resolve one raw value if it is a placeholder. Returns the
    /// literal and the source file.
    pub fn lookup(&self, raw: &str) -> Option<(String, String)> {
        let var = placeholder_var(raw)?;
        self.values.get(var).cloned()
    }

    /// Enrich references in place.
    pub fn resolve(&self, refs: &mut [ExternalReference]) {
        for reference in refs {
            if let Some((value, source)) = self.lookup(&reference.raw_value) {
                reference.resolved_value = Some(value);
                reference.config_source = Some(source);
            }
        }
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Extract the variable name from `${VAR}`, `$VAR` or `env:VAR` forms.
fn placeholder_var(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        return Some(inner);
    }
    if let Some(var) = raw.strip_prefix("env:") {
        return Some(var);
    }
    if let Some(var) = raw.strip_prefix('$') {
        if var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') && !var.is_empty() {
            return Some(var);
        }
    }
    None
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{RefOperation, RefType};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_placeholder_forms() {
        assert_eq!(placeholder_var("${ORDERS_TOPIC}"), Some("ORDERS_TOPIC"));
        assert_eq!(placeholder_var("$ORDERS_TOPIC"), Some("ORDERS_TOPIC"));
        assert_eq!(placeholder_var("env:ORDERS_TOPIC"), Some("ORDERS_TOPIC"));
        assert_eq!(placeholder_var("orders.created"), None);
        assert_eq!(placeholder_var("$not-a-var"), None);
    }

    #[test]
    fn test_env_and_compose_loading() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".env"), "ORDERS_TOPIC=orders.created\n# comment\n").unwrap();
        fs::write(
            temp.path().join("docker-compose.yml"),
            "services:\n  worker:\n    environment:\n      DB_TABLE: orders\n  api:\n    environment:\n      - API_URL=http://svc/orders\n",
        )
        .unwrap();

        let resolver = ConfigResolver::load(temp.path());
        assert_eq!(resolver.len(), 3);
        assert_eq!(
            resolver.lookup("${ORDERS_TOPIC}"),
            Some(("orders.created".to_string(), ".env".to_string()))
        );
        assert_eq!(
            resolver.lookup("${DB_TABLE}").unwrap().1,
            "docker-compose.yml"
        );
    }

    #[test]
    fn test_k8s_deployment_env_resolves() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("deploy")).unwrap();
        fs::write(
            temp.path().join("deploy/worker.yaml"),
            "apiVersion: apps/v1\nkind: Deployment\nspec:\n  template:\n    spec:\n      containers:\n        - name: worker\n          env:\n            - name: ORDERS_TOPIC\n              value: orders.created\n            - name: FROM_SECRET\n              valueFrom:\n                secretKeyRef:\n                  name: creds\n                  key: token\n",
        )
        .unwrap();

        let resolver = ConfigResolver::load(temp.path());
        assert_eq!(
            resolver.lookup("${ORDERS_TOPIC}"),
            Some(("orders.created".to_string(), "deploy/worker.yaml".to_string()))
        );
        // valueFrom entries have no literal to harvest.
        assert_eq!(resolver.lookup("${FROM_SECRET}"), None);

        let mut refs = vec![ExternalReference::new(
            RefType::Queue,
            "p",
            "n1",
            "${ORDERS_TOPIC}",
            RefOperation::Publish,
        )];
        resolver.resolve(&mut refs);
        assert_eq!(refs[0].effective_value(), "orders.created");
        assert_eq!(refs[0].config_source.as_deref(), Some("deploy/worker.yaml"));
    }

    #[test]
    fn test_configmap_data_in_multi_doc_manifest() {
        let temp = tempdir().unwrap();
        fs::write(
            temp.path().join("app.yaml"),
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: api\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: api-config\ndata:\n  DB_TABLE: orders\n",
        )
        .unwrap();
        // A plain yaml without kind is not a manifest.
        fs::write(temp.path().join("lint.yaml"), "rules:\n  DB_TABLE: nope\n").unwrap();

        let resolver = ConfigResolver::load(temp.path());
        assert_eq!(
            resolver.lookup("${DB_TABLE}"),
            Some(("orders".to_string(), "app.yaml".to_string()))
        );
    }

    #[test]
    fn test_resolve_enriches_references() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(".env"), "TOPIC=orders.created\n").unwrap();
        let resolver = ConfigResolver::load(temp.path());

        let mut refs = vec![
            ExternalReference::new(RefType::Queue, "p", "n1", "${TOPIC}", RefOperation::Publish),
            ExternalReference::new(RefType::Queue, "p", "n2", "payments", RefOperation::Publish),
        ];
        resolver.resolve(&mut refs);

        assert_eq!(refs[0].effective_value(), "orders.created");
        assert_eq!(refs[0].config_source.as_deref(), Some(".env"));
        assert_eq!(refs[1].effective_value(), "payments");
        assert!(refs[1].config_source.is_none());
    }
}
