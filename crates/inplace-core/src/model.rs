use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UpdateError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedPackage {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub scratch_dir: PathBuf,
    pub package_root: PathBuf,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    BackupIncomplete,
    PartialInstall,
    MigrationStep,
    CleanupIncomplete,
}

impl WarningKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BackupIncomplete => "BackupIncompleteWarning",
            Self::PartialInstall => "PartialInstallWarning",
            Self::MigrationStep => "MigrationStepWarning",
            Self::CleanupIncomplete => "CleanupIncompleteWarning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallWarning {
    pub kind: WarningKind,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl InstallWarning {
    pub fn new(kind: WarningKind, path: Option<&Path>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.map(Path::to_path_buf),
            message: message.into(),
        }
    }
}

impl fmt::Display for InstallWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(
                f,
                "{}: {}: {}",
                self.kind.as_str(),
                path.display(),
                self.message
            ),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationReport {
    pub files_installed: u64,
    pub dirs_created: u64,
    pub migration_log: Vec<String>,
    pub warnings: Vec<InstallWarning>,
    pub log: Vec<String>,
}

impl InstallationReport {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Stage,
    Extract,
    Install,
}

impl PipelineStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Extract => "extract",
            Self::Install => "install",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hand-off state carried by the caller from one pipeline call to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineContext {
    pub update_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<StagedPackage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionResult>,
    /// Scratch directory kept after a rejected extraction, awaiting cleanup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leftover_scratch_dir: Option<PathBuf>,
}

impl PipelineContext {
    pub fn new(update_id: impl Into<String>) -> Self {
        Self {
            update_id: update_id.into(),
            staged: None,
            extraction: None,
            leftover_scratch_dir: None,
        }
    }

    pub fn require_staged(&self) -> Result<&StagedPackage, UpdateError> {
        self.staged.as_ref().ok_or(UpdateError::ContextMissing {
            step: PipelineStep::Stage,
        })
    }

    pub fn require_extraction(&self) -> Result<&ExtractionResult, UpdateError> {
        self.extraction.as_ref().ok_or(UpdateError::ContextMissing {
            step: PipelineStep::Extract,
        })
    }
}
