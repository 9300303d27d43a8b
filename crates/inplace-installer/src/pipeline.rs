use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use inplace_core::{
    InstallWarning, InstallationReport, PipelineContext, ProtectedPathPolicy, UpdateError,
    UpdaterConfig,
};
use inplace_migrate::{SchemaStore, SqliteSchemaStore};
use inplace_security::ProofVerifier;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::fs_utils::{
    current_unix_timestamp, remove_dir_if_exists, remove_file_if_exists, unique_suffix,
};
use crate::lock::{acquire_update_lock, read_update_lock, release_update_lock, verify_update_lock};
use crate::probe::{ConnectionMonitor, DiagnosticProbe};
use crate::{
    ArchiveExtractor, ArchiveStager, InstallExecutor, InstallFailure, StoreOpener, UpdateLayout,
    Upload,
};

pub const MAX_PROBE_SECONDS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResponse {
    pub success: bool,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PipelineContext>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    pub context: PipelineContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallResponse {
    pub success: bool,
    pub critical: bool,
    /// Set when the install finished with warnings.
    pub degraded: bool,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub files_installed: u64,
    pub dirs_created: u64,
    pub migration_log: Vec<String>,
    pub warnings: Vec<InstallWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    pub context: PipelineContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub removed: Vec<PathBuf>,
    pub lock_released: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub success: bool,
    pub elapsed: f64,
    pub requested: f64,
    pub completed: bool,
    pub abandoned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives stage, extract and install as independent calls. Nothing is kept
/// between calls except the update lock on disk; everything else travels in
/// the [`PipelineContext`] the caller hands back.
pub struct UpdatePipeline<'a> {
    layout: UpdateLayout,
    config: UpdaterConfig,
    policy: ProtectedPathPolicy,
    verifier: &'a dyn ProofVerifier,
}

impl<'a> UpdatePipeline<'a> {
    pub fn new(
        install_root: impl AsRef<Path>,
        config: UpdaterConfig,
        verifier: &'a dyn ProofVerifier,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let policy = config.policy()?;
        let layout = UpdateLayout::resolve(install_root.as_ref(), &config)?;
        Ok(Self {
            layout,
            config,
            policy,
            verifier,
        })
    }

    pub fn layout(&self) -> &UpdateLayout {
        &self.layout
    }

    pub fn policy(&self) -> &ProtectedPathPolicy {
        &self.policy
    }

    pub fn stage<R: Read>(&self, upload: Upload<'_, R>) -> StageResponse {
        let update_id = format!("upd-{}-{}", current_unix_timestamp(), unique_suffix());
        let mut log = Vec::new();

        if let Err(err) = self.layout.ensure_base_dirs() {
            return stage_failure(log, &UpdateError::from(err));
        }
        if let Err(err) = acquire_update_lock(&self.layout, &update_id) {
            warn!(error = %err, "stage refused");
            return stage_failure(log, &err);
        }
        log.push(format!(
            "update {update_id} started in {}",
            self.layout.install_root().display()
        ));

        let stager =
            ArchiveStager::new(&self.layout, self.config.max_package_bytes, self.verifier);
        match stager.stage(upload, &mut log) {
            Ok(staged) => {
                let mut context = PipelineContext::new(update_id);
                let zip_path = staged.path.clone();
                context.staged = Some(staged);
                StageResponse {
                    success: true,
                    log,
                    error: None,
                    error_kind: None,
                    zip_path: Some(zip_path),
                    context: Some(context),
                }
            }
            Err(err) => {
                warn!(update_id = %update_id, error = %err, "stage failed");
                if let Err(release_err) = release_update_lock(&self.layout, &update_id) {
                    log.push(format!("failed to release update lock: {release_err}"));
                }
                stage_failure(log, &err)
            }
        }
    }

    pub fn extract(&self, mut context: PipelineContext) -> ExtractResponse {
        let mut log = Vec::new();
        let outcome = self.run_extract(&mut context, &mut log);
        match outcome {
            Ok(()) => {
                let extraction = context.extraction.clone();
                ExtractResponse {
                    success: true,
                    log,
                    error: None,
                    error_kind: None,
                    temp_dir: extraction.as_ref().map(|value| value.scratch_dir.clone()),
                    extracted_root: extraction.as_ref().map(|value| value.package_root.clone()),
                    backup_dir: extraction.map(|value| value.backup_dir),
                    context,
                }
            }
            Err(err) => {
                warn!(update_id = %context.update_id, error = %err, "extract failed");
                log.push(format!("error: {err}"));
                ExtractResponse {
                    success: false,
                    log,
                    error: Some(err.to_string()),
                    error_kind: Some(err.kind().to_string()),
                    temp_dir: None,
                    extracted_root: None,
                    backup_dir: None,
                    context,
                }
            }
        }
    }

    fn run_extract(
        &self,
        context: &mut PipelineContext,
        log: &mut Vec<String>,
    ) -> Result<(), UpdateError> {
        verify_update_lock(&self.layout, &context.update_id)?;
        let staged = context.require_staged()?;
        ensure_within(&staged.path, &self.layout.staging_dir())?;

        let extractor = ArchiveExtractor::new(
            &self.layout,
            &self.config.marker_files,
            &self.config.entry_points,
        );
        match extractor.extract(&staged.path, log) {
            Ok(extraction) => {
                info!(
                    update_id = %context.update_id,
                    root = %extraction.package_root.display(),
                    "package extracted"
                );
                context.extraction = Some(extraction);
                Ok(())
            }
            Err(err) => {
                if let UpdateError::InvalidPackageStructure { scratch_dir, .. } = &err {
                    context.leftover_scratch_dir = Some(scratch_dir.clone());
                }
                Err(err)
            }
        }
    }

    /// Installs against the site database named by the config. A missing
    /// database file disables migrations with a warning.
    pub fn install(&self, context: PipelineContext) -> InstallResponse {
        let database_path = self.layout.live_path(&self.config.database_path);
        let opener: StoreOpener<'_> = Box::new(move || -> anyhow::Result<Box<dyn SchemaStore>> {
            if !database_path.is_file() {
                return Err(anyhow!(
                    "database not found: {}",
                    database_path.display()
                ));
            }
            let store = SqliteSchemaStore::open(&database_path)?;
            Ok(Box::new(store) as Box<dyn SchemaStore>)
        });
        self.install_with_store(context, opener)
    }

    pub fn install_with_store(
        &self,
        context: PipelineContext,
        open_store: StoreOpener<'_>,
    ) -> InstallResponse {
        let mut log = Vec::new();
        let outcome = self.run_install(&context, open_store);
        let backup_dir = context
            .extraction
            .as_ref()
            .map(|extraction| extraction.backup_dir.clone());

        match outcome {
            Ok(report) => {
                let degraded = report.is_degraded();
                log.extend(report.log);
                if let Some(staged) = &context.staged {
                    match remove_file_if_exists(&staged.path) {
                        Ok(_) => log.push(format!(
                            "removed staged package {}",
                            staged.path.display()
                        )),
                        Err(err) => log.push(format!("{err:#}; a later sweep will remove it")),
                    }
                }
                match release_update_lock(&self.layout, &context.update_id) {
                    Ok(_) => log.push(format!("update {} finished", context.update_id)),
                    Err(err) => log.push(format!("failed to release update lock: {err}")),
                }
                InstallResponse {
                    success: true,
                    critical: false,
                    degraded,
                    log,
                    error: None,
                    error_kind: None,
                    files_installed: report.files_installed,
                    dirs_created: report.dirs_created,
                    migration_log: report.migration_log,
                    warnings: report.warnings,
                    backup_dir,
                    context,
                }
            }
            Err(InstallFailure { error, report }) => {
                let critical = error.is_critical();
                let degraded = report.is_degraded();
                log.extend(report.log);
                if critical {
                    error!(
                        update_id = %context.update_id,
                        error = %error,
                        files_installed = report.files_installed,
                        "install aborted; restore protected paths from the backup by hand"
                    );
                    log.push(format!("CRITICAL: {error}"));
                    log.push(
                        "update lock kept; clear it with `inplace unlock --force` once the site is repaired"
                            .to_string(),
                    );
                } else {
                    warn!(update_id = %context.update_id, error = %error, "install failed");
                    log.push(format!("error: {error}"));
                }
                InstallResponse {
                    success: false,
                    critical,
                    degraded,
                    log,
                    error: Some(error.to_string()),
                    error_kind: Some(error.kind().to_string()),
                    files_installed: report.files_installed,
                    dirs_created: report.dirs_created,
                    migration_log: report.migration_log,
                    warnings: report.warnings,
                    backup_dir,
                    context,
                }
            }
        }
    }

    fn run_install(
        &self,
        context: &PipelineContext,
        open_store: StoreOpener<'_>,
    ) -> Result<InstallationReport, InstallFailure> {
        verify_update_lock(&self.layout, &context.update_id)?;
        let extraction = context.require_extraction()?;
        ensure_within(&extraction.scratch_dir, &self.layout.tmp_dir())?;
        if !extraction.package_root.starts_with(&extraction.scratch_dir) {
            return Err(UpdateError::from(anyhow!(
                "package root {} is outside {}",
                extraction.package_root.display(),
                extraction.scratch_dir.display()
            ))
            .into());
        }
        ensure_within(&extraction.backup_dir, &self.layout.backups_dir())?;

        InstallExecutor::new(&self.layout, &self.policy).install(extraction, open_store)
    }

    /// Removes the staged package and scratch directories named by `context`
    /// and releases the lock if this update holds it. Backups are kept.
    pub fn cleanup(&self, context: &PipelineContext) -> CleanupResponse {
        let mut log = Vec::new();
        let mut removed = Vec::new();
        let mut errors = Vec::new();

        let mut targets = Vec::new();
        if let Some(staged) = &context.staged {
            targets.push((staged.path.clone(), self.layout.staging_dir()));
        }
        if let Some(extraction) = &context.extraction {
            targets.push((extraction.scratch_dir.clone(), self.layout.tmp_dir()));
        }
        if let Some(scratch) = &context.leftover_scratch_dir {
            targets.push((scratch.clone(), self.layout.tmp_dir()));
        }

        for (path, parent) in targets {
            if let Err(err) = ensure_within(&path, &parent) {
                log.push(format!("skipped {}: {err}", path.display()));
                errors.push(err.to_string());
                continue;
            }
            let result = if path.is_dir() {
                remove_dir_if_exists(&path)
            } else {
                remove_file_if_exists(&path)
            };
            match result {
                Ok(true) => {
                    log.push(format!("removed {}", path.display()));
                    removed.push(path);
                }
                Ok(false) => log.push(format!("{} already gone", path.display())),
                Err(err) => {
                    log.push(format!("{err:#}"));
                    errors.push(format!("{err:#}"));
                }
            }
        }

        let lock_released = match read_update_lock(&self.layout) {
            Ok(Some(holder)) if holder == context.update_id => {
                match release_update_lock(&self.layout, &context.update_id) {
                    Ok(released) => {
                        log.push(format!("released update lock for {}", context.update_id));
                        released
                    }
                    Err(err) => {
                        errors.push(err.to_string());
                        false
                    }
                }
            }
            Ok(Some(holder)) => {
                log.push(format!("update lock held by {holder}; left in place"));
                false
            }
            Ok(None) => false,
            Err(err) => {
                errors.push(format!("{err:#}"));
                false
            }
        };

        CleanupResponse {
            success: errors.is_empty(),
            log,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
            removed,
            lock_released,
        }
    }

    pub fn probe<F>(
        &self,
        seconds: f64,
        monitor: &dyn ConnectionMonitor,
        on_tick: F,
    ) -> ProbeResponse
    where
        F: FnMut(Duration),
    {
        if !seconds.is_finite() || seconds <= 0.0 || seconds > MAX_PROBE_SECONDS {
            return ProbeResponse {
                success: false,
                elapsed: 0.0,
                requested: seconds,
                completed: false,
                abandoned: false,
                error: Some(format!(
                    "probe duration must be between 0 and {MAX_PROBE_SECONDS} seconds"
                )),
            };
        }

        let probe = DiagnosticProbe::new(Duration::from_millis(
            self.config.probe_yield_interval_ms,
        ));
        let report = probe.run(Duration::from_secs_f64(seconds), monitor, on_tick);
        info!(
            elapsed = report.elapsed,
            requested = report.requested,
            abandoned = report.abandoned,
            "probe finished"
        );
        ProbeResponse {
            success: report.completed,
            elapsed: report.elapsed,
            requested: report.requested,
            completed: report.completed,
            abandoned: report.abandoned,
            error: None,
        }
    }
}

fn stage_failure(mut log: Vec<String>, err: &UpdateError) -> StageResponse {
    log.push(format!("error: {err}"));
    StageResponse {
        success: false,
        log,
        error: Some(err.to_string()),
        error_kind: Some(err.kind().to_string()),
        zip_path: None,
        context: None,
    }
}

// Context files come from the caller; refuse paths outside the updater's own
// directories.
fn ensure_within(path: &Path, parent: &Path) -> Result<(), UpdateError> {
    let escapes = path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir));
    if escapes || !path.starts_with(parent) || path == parent {
        return Err(anyhow!(
            "context path {} is outside {}",
            path.display(),
            parent.display()
        )
        .into());
    }
    Ok(())
}
