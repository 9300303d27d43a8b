use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectedPathKind {
    File,
    Directory,
}

impl ProtectedPathKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedPath {
    #[serde(rename = "path")]
    pub relative_path: String,
    pub kind: ProtectedPathKind,
}

impl ProtectedPath {
    pub fn file(relative_path: &str) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            kind: ProtectedPathKind::File,
        }
    }

    pub fn directory(relative_path: &str) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            kind: ProtectedPathKind::Directory,
        }
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.relative_path)
    }
}

/// Paths of the live installation that an update must leave untouched.
///
/// Backup, overwrite and restore all consult the same instance, so the list
/// is only ever defined once per pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedPathPolicy {
    entries: Vec<ProtectedPath>,
}

impl Default for ProtectedPathPolicy {
    fn default() -> Self {
        Self {
            entries: default_protected_paths(),
        }
    }
}

impl ProtectedPathPolicy {
    pub fn new(entries: Vec<ProtectedPath>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            let normalized = normalize_relative(entry.path()).ok_or_else(|| {
                anyhow!(
                    "protected path '{}' must be a non-empty relative path without '..'",
                    entry.relative_path
                )
            })?;
            if !seen.insert(normalized) {
                return Err(anyhow!(
                    "protected path '{}' is listed more than once",
                    entry.relative_path
                ));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ProtectedPath] {
        &self.entries
    }

    pub fn covers(&self, relative_path: &Path) -> bool {
        let Some(candidate) = normalize_relative(relative_path) else {
            return false;
        };
        self.entries.iter().any(|entry| {
            normalize_relative(entry.path())
                .is_some_and(|protected| candidate.starts_with(&protected))
        })
    }
}

pub fn default_protected_paths() -> Vec<ProtectedPath> {
    vec![
        ProtectedPath::file("config.php"),
        ProtectedPath::directory("uploads"),
        ProtectedPath::directory("backups"),
        ProtectedPath::file(".htaccess"),
    ]
}

fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(value) => out.push(value),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}
