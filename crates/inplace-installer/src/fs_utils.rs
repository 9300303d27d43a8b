use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Per-path results of a best-effort recursive copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    pub files: u64,
    pub dirs: u64,
    pub failures: Vec<CopyFailure>,
}

impl CopyOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, path: &Path, err: impl std::fmt::Display) {
        self.failures.push(CopyFailure {
            path: path.to_path_buf(),
            message: err.to_string(),
        });
    }
}

/// Copies `src` (file, symlink or directory tree) to `dst`, continuing past
/// individual failures and recording each of them in the outcome.
pub fn copy_tree_best_effort(src: &Path, dst: &Path) -> CopyOutcome {
    let mut outcome = CopyOutcome::default();
    for entry in WalkDir::new(src).follow_links(false).follow_root_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(src).to_path_buf();
                outcome.fail(&path, err);
                continue;
            }
        };

        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(err) => {
                outcome.fail(entry.path(), err);
                continue;
            }
        };
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };

        let file_type = entry.file_type();
        let result = if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))
                .map(|()| outcome.dirs += 1)
        } else {
            copy_entry_replacing(entry.path(), &target).map(|()| outcome.files += 1)
        };
        if let Err(err) = result {
            outcome.fail(entry.path(), format!("{err:#}"));
        }
    }
    outcome
}

/// Copies a single file or symlink over `dst`, creating parent directories.
pub fn copy_entry_replacing(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let metadata =
        fs::symlink_metadata(src).with_context(|| format!("failed to stat {}", src.display()))?;

    if let Ok(existing) = fs::symlink_metadata(dst) {
        if existing.is_dir() {
            return Err(anyhow!(
                "cannot replace directory {} with a file",
                dst.display()
            ));
        }
        // A read-only file cannot be reopened for writing; replace the entry.
        if existing.file_type().is_symlink()
            || metadata.file_type().is_symlink()
            || existing.permissions().readonly()
        {
            fs::remove_file(dst)
                .with_context(|| format!("failed to remove existing {}", dst.display()))?;
        }
    }

    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)
            .with_context(|| format!("failed to read symlink {}", src.display()))?;
        std::os::unix::fs::symlink(&target, dst).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                dst.display(),
                target.display()
            )
        })?;
        return Ok(());
    }

    fs::copy(src, dst).with_context(|| {
        format!("failed to copy {} to {}", src.display(), dst.display())
    })?;
    Ok(())
}

pub fn remove_dir_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub(crate) fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{nanos}", std::process::id())
}
