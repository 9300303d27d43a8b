mod archive;
mod config;
mod error;
mod model;
mod policy;

pub use archive::ArchiveType;
pub use config::{
    UpdaterConfig, CONFIG_FILE_NAME, DEFAULT_MAX_PACKAGE_BYTES, DEFAULT_PROBE_YIELD_INTERVAL_MS,
};
pub use error::UpdateError;
pub use model::{
    ExtractionResult, InstallWarning, InstallationReport, PipelineContext, PipelineStep,
    StagedPackage, WarningKind,
};
pub use policy::{default_protected_paths, ProtectedPath, ProtectedPathKind, ProtectedPathPolicy};
