use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use inplace_core::{
    ExtractionResult, InstallWarning, InstallationReport, ProtectedPath, ProtectedPathPolicy,
    UpdateError, WarningKind,
};
use inplace_migrate::{MigrationRunner, SchemaStore};
use inplace_security::sha256_file_hex;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::fs_utils::{
    copy_entry_replacing, copy_tree_best_effort, path_exists, remove_dir_if_exists,
};
use crate::UpdateLayout;

pub type StoreOpener<'s> = Box<dyn FnOnce() -> anyhow::Result<Box<dyn SchemaStore>> + 's>;

#[derive(Debug, Clone)]
pub(crate) struct CapturedPath {
    pub(crate) relative: PathBuf,
    pub(crate) digests: BTreeMap<PathBuf, String>,
}

/// A failed install together with everything it did before failing.
#[derive(Debug)]
pub struct InstallFailure {
    pub error: UpdateError,
    pub report: InstallationReport,
}

impl From<UpdateError> for InstallFailure {
    fn from(error: UpdateError) -> Self {
        Self {
            error,
            report: InstallationReport::default(),
        }
    }
}

pub struct InstallExecutor<'a> {
    layout: &'a UpdateLayout,
    policy: &'a ProtectedPathPolicy,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(layout: &'a UpdateLayout, policy: &'a ProtectedPathPolicy) -> Self {
        Self { layout, policy }
    }

    /// Runs backup, overwrite, restore, migrate and cleanup in that order.
    ///
    /// Only a failed restore ends the sequence early; every other problem is
    /// recorded as a warning in the returned report.
    pub fn install(
        &self,
        extraction: &ExtractionResult,
        open_store: StoreOpener<'_>,
    ) -> Result<InstallationReport, InstallFailure> {
        let package_root = &extraction.package_root;
        if !package_root.is_dir() {
            return Err(UpdateError::from(anyhow!(
                "package root is missing or not a directory: {}",
                package_root.display()
            ))
            .into());
        }
        fs::create_dir_all(&extraction.backup_dir)
            .with_context(|| {
                format!(
                    "failed to create backup directory {}; live tree left untouched",
                    extraction.backup_dir.display()
                )
            })
            .map_err(UpdateError::from)?;

        let mut report = InstallationReport::default();

        let captured = self.backup(&extraction.backup_dir, &mut report);
        self.overwrite(package_root, &mut report);
        if let Err(error) = self.restore(&extraction.backup_dir, &captured, &mut report) {
            // Migrations and scratch cleanup are skipped; the backup stays.
            return Err(InstallFailure { error, report });
        }
        run_migrations(open_store, &mut report);
        cleanup_scratch(&extraction.scratch_dir, &mut report);

        info!(
            files = report.files_installed,
            dirs = report.dirs_created,
            warnings = report.warnings.len(),
            "install finished"
        );
        Ok(report)
    }

    pub(crate) fn backup(
        &self,
        backup_dir: &Path,
        report: &mut InstallationReport,
    ) -> Vec<CapturedPath> {
        let mut captured = Vec::new();
        for protected in self.policy.entries() {
            let live = self.layout.live_path(protected.path());
            if !path_exists(&live) {
                report.log.push(format!(
                    "backup: {} not present, nothing to preserve",
                    protected.relative_path
                ));
                continue;
            }
            if backup_dir.starts_with(&live) {
                // Holds the backup itself; the overwrite step never writes here.
                report.log.push(format!(
                    "backup: {} holds the backup directory and is left in place",
                    protected.relative_path
                ));
                continue;
            }

            let digests = match record_digests(&live, protected.path()) {
                Ok(digests) => digests,
                Err(err) => {
                    self.warn_backup(report, protected, format!("failed to hash: {err:#}"));
                    BTreeMap::new()
                }
            };

            let outcome = copy_tree_best_effort(&live, &backup_dir.join(protected.path()));
            for failure in &outcome.failures {
                self.warn_backup(
                    report,
                    protected,
                    format!("{}: {}", failure.path.display(), failure.message),
                );
            }
            if outcome.files == 0 && outcome.dirs == 0 {
                continue;
            }
            report.log.push(format!(
                "backup: saved {} ({} {}, {} files)",
                protected.relative_path,
                protected.kind.as_str(),
                if outcome.is_clean() { "complete" } else { "partial" },
                outcome.files
            ));
            captured.push(CapturedPath {
                relative: protected.path().to_path_buf(),
                digests,
            });
        }
        captured
    }

    fn warn_backup(
        &self,
        report: &mut InstallationReport,
        protected: &ProtectedPath,
        message: String,
    ) {
        warn!(path = %protected.relative_path, %message, "backup incomplete");
        let warning = InstallWarning::new(
            WarningKind::BackupIncomplete,
            Some(protected.path()),
            message,
        );
        report.log.push(warning.to_string());
        report.warnings.push(warning);
    }

    fn overwrite(&self, package_root: &Path, report: &mut InstallationReport) {
        let mut walker = WalkDir::new(package_root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    partial_install(report, err.path(), err.to_string());
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(package_root) else {
                partial_install(report, Some(entry.path()), "outside package root".to_string());
                continue;
            };

            if self.policy.covers(relative) {
                report.log.push(format!(
                    "overwrite: skipped protected {}",
                    relative.display()
                ));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if self
                .layout
                .data_dir_relative()
                .is_some_and(|reserved| relative.starts_with(reserved))
            {
                report.log.push(format!(
                    "overwrite: skipped {} (updater data directory)",
                    relative.display()
                ));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            let target = self.layout.live_path(relative);
            if entry.file_type().is_dir() {
                let existed = target.is_dir();
                match fs::create_dir_all(&target) {
                    Ok(()) if !existed => report.dirs_created += 1,
                    Ok(()) => {}
                    Err(err) => {
                        partial_install(report, Some(relative), err.to_string());
                        walker.skip_current_dir();
                    }
                }
                continue;
            }

            match copy_entry_replacing(entry.path(), &target) {
                Ok(()) => report.files_installed += 1,
                Err(err) => partial_install(report, Some(relative), format!("{err:#}")),
            }
        }

        report.log.push(format!(
            "overwrite: installed {} files, created {} directories",
            report.files_installed, report.dirs_created
        ));
    }

    pub(crate) fn restore(
        &self,
        backup_dir: &Path,
        captured: &[CapturedPath],
        report: &mut InstallationReport,
    ) -> Result<(), UpdateError> {
        if captured.is_empty() {
            report.log.push("restore: nothing was backed up".to_string());
            return Ok(());
        }

        let critical = |message: String| {
            error!(backup = %backup_dir.display(), %message, "critical restore failure");
            UpdateError::CriticalRestoreFailure {
                backup_dir: backup_dir.to_path_buf(),
                message,
            }
        };

        fs::read_dir(backup_dir)
            .map_err(|err| critical(format!("backup directory is unreadable: {err}")))?;

        for entry in captured {
            let source = backup_dir.join(&entry.relative);
            if !path_exists(&source) {
                return Err(critical(format!(
                    "backup of {} disappeared",
                    entry.relative.display()
                )));
            }
            let outcome = copy_tree_best_effort(&source, &self.layout.live_path(&entry.relative));
            if let Some(failure) = outcome.failures.first() {
                return Err(critical(format!(
                    "failed to restore {}: {}: {}",
                    entry.relative.display(),
                    failure.path.display(),
                    failure.message
                )));
            }

            for (file, expected) in &entry.digests {
                let live = self.layout.live_path(file);
                let actual = sha256_file_hex(&live)
                    .map_err(|err| critical(format!("failed to verify {}: {err:#}", file.display())))?;
                if &actual != expected {
                    return Err(critical(format!(
                        "{} differs from its pre-update content after restore",
                        file.display()
                    )));
                }
            }
            report.log.push(format!(
                "restore: {} restored and verified",
                entry.relative.display()
            ));
        }
        Ok(())
    }
}

fn record_digests(live: &Path, relative: &Path) -> anyhow::Result<BTreeMap<PathBuf, String>> {
    let mut digests = BTreeMap::new();
    for entry in WalkDir::new(live).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let suffix = entry.path().strip_prefix(live)?;
        let key = if suffix.as_os_str().is_empty() {
            relative.to_path_buf()
        } else {
            relative.join(suffix)
        };
        digests.insert(key, sha256_file_hex(entry.path())?);
    }
    Ok(digests)
}

fn partial_install(report: &mut InstallationReport, path: Option<&Path>, message: String) {
    warn!(path = ?path, %message, "install entry failed");
    let warning = InstallWarning::new(WarningKind::PartialInstall, path, message);
    report.log.push(warning.to_string());
    report.warnings.push(warning);
}

fn run_migrations(open_store: StoreOpener<'_>, report: &mut InstallationReport) {
    let store = match open_store() {
        Ok(store) => store,
        Err(err) => {
            let warning = InstallWarning::new(
                WarningKind::MigrationStep,
                None,
                format!("schema store unavailable, no migrations applied: {err:#}"),
            );
            warn!(error = %format!("{err:#}"), "schema store unavailable");
            report.migration_log.push(warning.to_string());
            report.log.push(warning.to_string());
            report.warnings.push(warning);
            return;
        }
    };

    let summary = MigrationRunner::default().run(&*store);
    for record in summary.failures() {
        report.warnings.push(InstallWarning::new(
            WarningKind::MigrationStep,
            None,
            record.log_line(),
        ));
    }
    report.log.push(format!(
        "migrate: {} steps, {} applied, {} failed",
        summary.records.len(),
        summary.applied(),
        summary.failures().count()
    ));
    report.migration_log = summary.log_lines();
}

fn cleanup_scratch(scratch_dir: &Path, report: &mut InstallationReport) {
    match remove_dir_if_exists(scratch_dir) {
        Ok(_) => report
            .log
            .push(format!("cleanup: removed {}", scratch_dir.display())),
        Err(err) => {
            let warning = InstallWarning::new(
                WarningKind::CleanupIncomplete,
                Some(scratch_dir),
                format!("{err:#}"),
            );
            report.log.push(warning.to_string());
            report.warnings.push(warning);
        }
    }
}
