use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::policy::{default_protected_paths, ProtectedPath, ProtectedPathPolicy};

pub const CONFIG_FILE_NAME: &str = "inplace.toml";
pub const DEFAULT_MAX_PACKAGE_BYTES: u64 = 64 * 1024 * 1024;
pub const DEFAULT_PROBE_YIELD_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct UpdaterConfig {
    pub data_dir: Option<PathBuf>,
    pub max_package_bytes: u64,
    pub marker_files: Vec<String>,
    pub entry_points: Vec<String>,
    pub protected_paths: Vec<ProtectedPath>,
    pub database_path: PathBuf,
    pub probe_yield_interval_ms: u64,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_package_bytes: DEFAULT_MAX_PACKAGE_BYTES,
            marker_files: vec![
                "config.sample.php".to_string(),
                "index.php".to_string(),
                "bootstrap.php".to_string(),
            ],
            entry_points: vec!["index.php".to_string(), "bootstrap.php".to_string()],
            protected_paths: default_protected_paths(),
            database_path: PathBuf::from("data").join("site.db"),
            probe_yield_interval_ms: DEFAULT_PROBE_YIELD_INTERVAL_MS,
        }
    }
}

impl UpdaterConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse inplace config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    /// Loads `<install_root>/inplace.toml`, falling back to defaults when absent.
    pub fn load_for_root(install_root: &Path) -> Result<Self> {
        let path = install_root.join(CONFIG_FILE_NAME);
        match fs::metadata(&path) {
            Ok(_) => Self::load(&path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to inspect config: {}", path.display()))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_package_bytes == 0 {
            return Err(anyhow!("max_package_bytes must be greater than zero"));
        }
        if self.marker_files.iter().all(|name| name.trim().is_empty()) {
            return Err(anyhow!("marker_files must name at least one file"));
        }
        if self.entry_points.iter().all(|name| name.trim().is_empty()) {
            return Err(anyhow!("entry_points must name at least one file"));
        }
        if self.database_path.is_absolute() {
            return Err(anyhow!(
                "database_path must be relative to the install root: {}",
                self.database_path.display()
            ));
        }
        self.policy()?;
        Ok(())
    }

    pub fn policy(&self) -> Result<ProtectedPathPolicy> {
        ProtectedPathPolicy::new(self.protected_paths.clone())
    }

    pub fn data_dir_for(&self, install_root: &Path) -> PathBuf {
        match &self.data_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => install_root.join(dir),
            None => install_root.join(".inplace"),
        }
    }
}
