use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use inplace_core::{ExtractionResult, UpdateError};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::fs_utils::{path_exists, remove_dir_if_exists, unique_suffix};
use crate::UpdateLayout;

pub struct ArchiveExtractor<'a> {
    layout: &'a UpdateLayout,
    marker_files: &'a [String],
    entry_points: &'a [String],
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(
        layout: &'a UpdateLayout,
        marker_files: &'a [String],
        entry_points: &'a [String],
    ) -> Self {
        Self {
            layout,
            marker_files,
            entry_points,
        }
    }

    pub fn extract(
        &self,
        archive_path: &Path,
        log: &mut Vec<String>,
    ) -> Result<ExtractionResult, UpdateError> {
        let file = File::open(archive_path).with_context(|| {
            format!("failed to open staged package: {}", archive_path.display())
        })?;
        let mut archive =
            ZipArchive::new(BufReader::new(file)).map_err(|err| UpdateError::CorruptArchive {
                path: archive_path.to_path_buf(),
                message: err.to_string(),
            })?;
        log.push(format!(
            "opened {} ({} entries)",
            archive_path.display(),
            archive.len()
        ));

        let scratch_dir = self.layout.scratch_dir_path(&unique_suffix());
        fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("failed to create {}", scratch_dir.display()))?;

        if let Err(err) = unpack_all(&mut archive, archive_path, &scratch_dir) {
            match remove_dir_if_exists(&scratch_dir) {
                Ok(_) => log.push(format!(
                    "removed partially extracted {}",
                    scratch_dir.display()
                )),
                Err(cleanup_err) => {
                    warn!(error = %format!("{cleanup_err:#}"), "failed to remove partial extraction");
                    log.push(format!("{cleanup_err:#}"));
                }
            }
            return Err(err);
        }
        info!(scratch = %scratch_dir.display(), "archive extracted");
        log.push(format!("extracted into {}", scratch_dir.display()));

        let package_root = discover_package_root(&scratch_dir, self.marker_files, log)?;

        let has_entry_point = self
            .entry_points
            .iter()
            .any(|name| package_root.join(name).is_file());
        if !has_entry_point {
            // Scratch dir stays behind for diagnosis; cleanup removes it.
            log.push(format!(
                "no entry point in {}; extracted files left for inspection",
                package_root.display()
            ));
            return Err(UpdateError::InvalidPackageStructure {
                root: package_root,
                scratch_dir,
                expected: self.entry_points.join(", "),
            });
        }

        let backup_dir = allocate_backup_dir(self.layout);
        log.push(format!("backup will be written to {}", backup_dir.display()));

        Ok(ExtractionResult {
            scratch_dir,
            package_root,
            backup_dir,
        })
    }
}

fn unpack_all<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    archive_path: &Path,
    scratch_dir: &Path,
) -> Result<(), UpdateError> {
    let corrupt = |message: String| UpdateError::CorruptArchive {
        path: archive_path.to_path_buf(),
        message,
    };

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| corrupt(format!("entry #{index}: {err}")))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(corrupt(format!(
                "entry '{}' escapes the extraction directory",
                entry.name()
            )));
        };
        let out_path = scratch_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("failed to create {}", out_path.display()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out_file = File::create(&out_path)
            .with_context(|| format!("failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out_file)
            .map_err(|err| corrupt(format!("entry '{}': {err}", entry.name())))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))
                .with_context(|| format!("failed to set mode on {}", out_path.display()))?;
        }
    }
    Ok(())
}

/// Picks the first immediate subdirectory (by name) that holds a marker file,
/// falling back to the scratch root itself.
pub(crate) fn discover_package_root(
    scratch_dir: &Path,
    marker_files: &[String],
    log: &mut Vec<String>,
) -> Result<PathBuf, UpdateError> {
    let mut child_dirs = Vec::new();
    for entry in fs::read_dir(scratch_dir)
        .with_context(|| format!("failed to read {}", scratch_dir.display()))?
    {
        let entry = entry.with_context(|| format!("failed to read {}", scratch_dir.display()))?;
        let is_dir = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", entry.path().display()))?
            .is_dir();
        if is_dir {
            child_dirs.push(entry.path());
        }
    }
    child_dirs.sort();

    let matching = child_dirs
        .iter()
        .filter_map(|dir| first_marker(dir, marker_files).map(|marker| (dir, marker)))
        .collect::<Vec<_>>();

    let Some((root, marker)) = matching.first() else {
        log.push("no marker file in any top-level directory; using the archive root".to_string());
        return Ok(scratch_dir.to_path_buf());
    };

    let name = root
        .file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default();
    debug!(root = %root.display(), marker, "package root discovered");
    log.push(format!("package root: {name}/ (found {marker})"));

    if matching.len() > 1 {
        let others = matching[1..]
            .iter()
            .filter_map(|(dir, _)| dir.file_name())
            .map(|value| value.to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        log.push(format!(
            "warning: ambiguous package root; also found markers in {}",
            others.join(", ")
        ));
    }
    if let Some(marker) = first_marker(scratch_dir, marker_files) {
        log.push(format!(
            "warning: ambiguous package root; archive root also contains {marker}"
        ));
    }

    Ok((*root).clone())
}

fn first_marker<'m>(dir: &Path, marker_files: &'m [String]) -> Option<&'m str> {
    marker_files
        .iter()
        .map(String::as_str)
        .filter(|name| !name.trim().is_empty())
        .find(|name| dir.join(name).is_file())
}

fn allocate_backup_dir(layout: &UpdateLayout) -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let candidate = layout.backup_path(&stamp);
    if !path_exists(&candidate) {
        return candidate;
    }
    let mut counter = 2_u32;
    loop {
        let candidate = layout.backup_path(&format!("{stamp}-{counter}"));
        if !path_exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
