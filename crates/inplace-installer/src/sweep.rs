use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::info;

use crate::fs_utils::{remove_dir_if_exists, remove_file_if_exists};
use crate::lock::read_update_lock;
use crate::UpdateLayout;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub skipped_for_lock: Option<String>,
    pub log: Vec<String>,
}

/// Removes staged archives and scratch directories older than `max_age`.
///
/// Nothing is touched while an update holds the lock, since its hand-off
/// paths live only in the caller's context.
pub fn sweep_stale_artifacts(
    layout: &UpdateLayout,
    max_age: Duration,
    now: SystemTime,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    if let Some(holder) = read_update_lock(layout)? {
        report.log.push(format!(
            "sweep skipped: update {holder} holds the update lock"
        ));
        report.skipped_for_lock = Some(holder);
        return Ok(report);
    }

    for dir in [layout.staging_dir(), layout.tmp_dir()] {
        for path in stale_entries(&dir, max_age, now)? {
            let removed = if path.is_dir() {
                remove_dir_if_exists(&path)?
            } else {
                remove_file_if_exists(&path)?
            };
            if removed {
                report.log.push(format!("removed {}", path.display()));
                report.removed.push(path);
            }
        }
    }
    info!(removed = report.removed.len(), "stale artifact sweep finished");
    Ok(report)
}

fn stale_entries(dir: &Path, max_age: Duration, now: SystemTime) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut stale = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let entry = entry?;
        let modified = entry
            .metadata()
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("failed to stat {}", entry.path().display()))?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= max_age {
            stale.push(entry.path());
        }
    }
    stale.sort();
    Ok(stale)
}
