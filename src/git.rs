//! Thin wrapper over the git CLI for incremental sync.
use std::path::Path;
use std::process::Command;

use serde::Serialize;
use tracing::debug;

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitContext {
    pub branch: String,
    pub commit: String,
}

/// Files touched between two commits. Renames are modeled as a delete
/// of the old path plus an add of the new one, which matches how the
/// merge treats them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Paths that need re-extraction.
    pub fn to_extract(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .added
            .iter()
            .chain(self.modified.iter())
            .cloned()
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .map_err(|e| MeshError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MeshError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Current branch and HEAD commit, or `None` when the path is not
/// inside a git work tree.
pub fn context(root: &Path) -> Result<Option<GitContext>> {
    match run_git(root, &["rev-parse", "--is-inside-work-tree"]) {
        Ok(out) if out == "true" => {}
        _ => return Ok(None),
    }

    let commit = run_git(root, &["rev-parse", "HEAD"])?;
    let branch = run_git(root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(Some(GitContext { branch, commit }))
}

/// Diff two revisions into a change set. `to` defaults to HEAD.
pub fn changed_files(root: &Path, from: &str, to: Option<&str>) -> Result<ChangeSet> {
    let to = to.unwrap_or("HEAD");
    let output = run_git(root, &["diff", "--name-status", "-M", from, to])?;

    let mut changes = ChangeSet::default();
    for line in output.lines() {
        let mut parts = line.split('\t');
        let Some(status) = parts.next() else { continue };
        match status.chars().next() {
            Some('A') => {
                if let Some(path) = parts.next() {
                    changes.added.push(path.to_string());
                }
            }
            Some('M') => {
                if let Some(path) = parts.next() {
                    changes.modified.push(path.to_string());
                }
            }
            Some('D') => {
                if let Some(path) = parts.next() {
                    changes.deleted.push(path.to_string());
                }
            }
            Some('R') => {
                // Rename: old path is deleted, new path is added.
                if let (Some(old), Some(new)) = (parts.next(), parts.next()) {
                    changes.deleted.push(old.to_string());
                    changes.added.push(new.to_string());
                }
            }
            other => debug!("Ignoring diff status {other:?}: {line}"),
        }
    }
    Ok(changes)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    fn init_repo() -> tempfile::TempDir {
        let temp = tempdir().unwrap();
        git(temp.path(), &["init", "-q", "-b", "main"]);
        temp
    }

    #[test]
    fn test_context_outside_repo() {
        let temp = tempdir().unwrap();
        assert_eq!(context(temp.path()).unwrap(), None);
    }

    #[test]
    fn test_context_and_changes() {
        let temp = init_repo();
        let root = temp.path();

        fs::write(root.join("a.py"), "def a():\n    pass\n").unwrap();
        fs::write(root.join("b.py"), "def b():\n    pass\n").unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-q", "-m", "initial"]);

        let ctx = context(root).unwrap().expect("inside a repo");
        assert_eq!(ctx.branch, "main");
        let first = ctx.commit.clone();

        fs::write(root.join("a.py"), "def a2():\n    pass\n").unwrap();
        fs::write(root.join("c.py"), "def c():\n    pass\n").unwrap();
        fs::remove_file(root.join("b.py")).unwrap();
        git(root, &["add", "-A"]);
        git(root, &["commit", "-q", "-m", "second"]);

        let changes = changed_files(root, &first, None).unwrap();
        assert_eq!(changes.added, vec!["c.py"]);
        assert_eq!(changes.modified, vec!["a.py"]);
        assert_eq!(changes.deleted, vec!["b.py"]);
        assert_eq!(changes.to_extract(), vec!["a.py", "c.py"]);
    }
}
