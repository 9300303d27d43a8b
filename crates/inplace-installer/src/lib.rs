mod extract;
mod fs_utils;
mod install;
mod layout;
mod lock;
mod pipeline;
mod probe;
mod stage;
mod sweep;

pub use extract::ArchiveExtractor;
pub use fs_utils::{
    copy_entry_replacing, copy_tree_best_effort, path_exists, remove_dir_if_exists,
    remove_file_if_exists, CopyFailure, CopyOutcome,
};
pub use install::{InstallExecutor, InstallFailure, StoreOpener};
pub use layout::UpdateLayout;
pub use lock::{
    acquire_update_lock, force_release_update_lock, read_update_lock, release_update_lock,
    verify_update_lock,
};
pub use pipeline::{
    CleanupResponse, ExtractResponse, InstallResponse, ProbeResponse, StageResponse,
    UpdatePipeline, MAX_PROBE_SECONDS,
};
pub use probe::{AbandonFlag, AttachedConnection, ConnectionMonitor, DiagnosticProbe, ProbeReport};
pub use stage::{ArchiveStager, Upload};
pub use sweep::{sweep_stale_artifacts, SweepReport};

#[cfg(test)]
mod tests;
