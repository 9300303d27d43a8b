use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use inplace_core::{ArchiveType, UpdaterConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    install_root: PathBuf,
    data_dir: PathBuf,
}

impl UpdateLayout {
    pub fn new(install_root: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            data_dir: data_dir.into(),
        }
    }

    pub fn from_config(install_root: impl Into<PathBuf>, config: &UpdaterConfig) -> Self {
        let install_root = install_root.into();
        let data_dir = config.data_dir_for(&install_root);
        Self::new(install_root, data_dir)
    }

    /// Builds the layout for an existing install root, resolved to an absolute
    /// path so every path handed to the caller stays valid from any directory.
    pub fn resolve(install_root: &Path, config: &UpdaterConfig) -> Result<Self> {
        let install_root = fs::canonicalize(install_root).with_context(|| {
            format!("failed to resolve install root {}", install_root.display())
        })?;
        Ok(Self::from_config(install_root, config))
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join("update.lock")
    }

    // Lives inside the protected `backups` directory of the live tree.
    pub fn backups_dir(&self) -> PathBuf {
        self.install_root.join("backups")
    }

    pub fn staged_package_path(&self, stamp: &str, archive_type: ArchiveType) -> PathBuf {
        self.staging_dir()
            .join(format!("package-{stamp}.{}", archive_type.extension()))
    }

    pub fn scratch_dir_path(&self, suffix: &str) -> PathBuf {
        self.tmp_dir().join(format!("extract-{suffix}"))
    }

    pub fn backup_path(&self, stamp: &str) -> PathBuf {
        self.backups_dir().join(format!("backup-{stamp}"))
    }

    pub fn live_path(&self, relative: &Path) -> PathBuf {
        self.install_root.join(relative)
    }

    /// The data directory relative to the install root, when it lives inside it.
    pub fn data_dir_relative(&self) -> Option<&Path> {
        self.data_dir
            .strip_prefix(&self.install_root)
            .ok()
            .filter(|relative| !relative.as_os_str().is_empty())
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.data_dir.clone(), self.staging_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
