use std::path::PathBuf;

use thiserror::Error;

use crate::PipelineStep;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("transfer incomplete: declared {expected} bytes but received {received}")]
    TransferIncomplete { expected: u64, received: u64 },

    #[error("package size {size} bytes exceeds the configured limit of {limit} bytes")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("authorization proof was rejected")]
    InvalidProof,

    #[error("unsupported package '{file_name}': expected a .{expected} archive")]
    UnsupportedPackageType { file_name: String, expected: String },

    #[error("corrupt archive {}: {message}", path.display())]
    CorruptArchive { path: PathBuf, message: String },

    #[error(
        "invalid package structure: {} contains none of the entry points [{expected}]",
        root.display()
    )]
    InvalidPackageStructure {
        root: PathBuf,
        scratch_dir: PathBuf,
        expected: String,
    },

    #[error("critical restore failure from {}: {message}", backup_dir.display())]
    CriticalRestoreFailure { backup_dir: PathBuf, message: String },

    #[error("another update is in progress (update_id={holder})")]
    UpdateInProgress { holder: String },

    #[error("update lock is not held by update_id={update_id} (holder={})", holder.as_deref().unwrap_or("none"))]
    LockMismatch {
        update_id: String,
        holder: Option<String>,
    },

    #[error("pipeline context has no {step} result; run the {step} step first")]
    ContextMissing { step: PipelineStep },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpdateError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransferIncomplete { .. } => "TransferIncomplete",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::InvalidProof => "InvalidProof",
            Self::UnsupportedPackageType { .. } => "UnsupportedPackageType",
            Self::CorruptArchive { .. } => "CorruptArchive",
            Self::InvalidPackageStructure { .. } => "InvalidPackageStructure",
            Self::CriticalRestoreFailure { .. } => "CriticalRestoreFailure",
            Self::UpdateInProgress { .. } => "UpdateInProgress",
            Self::LockMismatch { .. } => "LockMismatch",
            Self::ContextMissing { .. } => "ContextMissing",
            Self::Other(_) => "Io",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::CriticalRestoreFailure { .. })
    }
}
