use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use inplace_core::UpdateError;
use tracing::{debug, warn};

use crate::UpdateLayout;

/// Claims the update lock for `update_id`; fails if any update already holds it.
pub fn acquire_update_lock(layout: &UpdateLayout, update_id: &str) -> Result<PathBuf, UpdateError> {
    let path = layout.lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let holder = read_update_lock(layout)
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".to_string());
            return Err(UpdateError::UpdateInProgress { holder });
        }
        Err(err) => {
            return Err(anyhow!(err)
                .context(format!("failed to claim update lock: {}", path.display()))
                .into());
        }
    };

    file.write_all(format!("{update_id}\n").as_bytes())
        .with_context(|| format!("failed to write update lock: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush update lock: {}", path.display()))?;
    debug!(update_id, "update lock acquired");
    Ok(path)
}

pub fn read_update_lock(layout: &UpdateLayout) -> Result<Option<String>> {
    let path = layout.lock_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read update lock: {}", path.display()));
        }
    };

    let holder = raw.trim();
    if holder.is_empty() {
        return Ok(None);
    }
    Ok(Some(holder.to_string()))
}

pub fn verify_update_lock(layout: &UpdateLayout, update_id: &str) -> Result<(), UpdateError> {
    let holder = read_update_lock(layout)?;
    if holder.as_deref() == Some(update_id) {
        return Ok(());
    }
    Err(UpdateError::LockMismatch {
        update_id: update_id.to_string(),
        holder,
    })
}

/// Releases the lock only when `update_id` holds it. Returns whether a lock
/// file was removed.
pub fn release_update_lock(layout: &UpdateLayout, update_id: &str) -> Result<bool, UpdateError> {
    match read_update_lock(layout)? {
        None => Ok(false),
        Some(holder) if holder == update_id => {
            let path = layout.lock_path();
            fs::remove_file(&path)
                .with_context(|| format!("failed to release update lock: {}", path.display()))?;
            debug!(update_id, "update lock released");
            Ok(true)
        }
        Some(holder) => Err(UpdateError::LockMismatch {
            update_id: update_id.to_string(),
            holder: Some(holder),
        }),
    }
}

/// Clears the lock regardless of holder, returning the previous holder.
pub fn force_release_update_lock(layout: &UpdateLayout) -> Result<Option<String>> {
    let holder = read_update_lock(layout).ok().flatten();
    let path = layout.lock_path();
    match fs::remove_file(&path) {
        Ok(()) => {
            warn!(holder = holder.as_deref().unwrap_or("unknown"), "update lock force-released");
            Ok(holder.or_else(|| Some("unknown".to_string())))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to clear update lock: {}", path.display()))
        }
    }
}
