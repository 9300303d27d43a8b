use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Read, Write};

use anyhow::Context;
use chrono::Utc;
use inplace_core::{ArchiveType, StagedPackage, UpdateError};
use inplace_security::ProofVerifier;
use tracing::{debug, info, warn};

use crate::fs_utils::{remove_file_if_exists, unique_suffix};
use crate::UpdateLayout;

/// An uploaded package as handed over by the transport layer.
pub struct Upload<'a, R> {
    pub file_name: &'a str,
    pub declared_size: u64,
    pub proof: &'a str,
    pub reader: R,
}

pub struct ArchiveStager<'a> {
    layout: &'a UpdateLayout,
    max_package_bytes: u64,
    verifier: &'a dyn ProofVerifier,
}

impl<'a> ArchiveStager<'a> {
    pub fn new(
        layout: &'a UpdateLayout,
        max_package_bytes: u64,
        verifier: &'a dyn ProofVerifier,
    ) -> Self {
        Self {
            layout,
            max_package_bytes,
            verifier,
        }
    }

    pub fn stage<R: Read>(
        &self,
        upload: Upload<'_, R>,
        log: &mut Vec<String>,
    ) -> Result<StagedPackage, UpdateError> {
        if !self.verifier.verify(upload.proof) {
            warn!(file = upload.file_name, "upload rejected: invalid proof");
            return Err(UpdateError::InvalidProof);
        }
        log.push("authorization proof accepted".to_string());

        if upload.declared_size > self.max_package_bytes {
            return Err(UpdateError::QuotaExceeded {
                size: upload.declared_size,
                limit: self.max_package_bytes,
            });
        }

        let archive_type = ArchiveType::infer_from_file_name(upload.file_name).ok_or_else(|| {
            UpdateError::UnsupportedPackageType {
                file_name: upload.file_name.to_string(),
                expected: ArchiveType::Zip.extension().to_string(),
            }
        })?;

        let staging_dir = self.layout.staging_dir();
        fs::create_dir_all(&staging_dir)
            .with_context(|| format!("failed to create {}", staging_dir.display()))?;

        let stamp = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), unique_suffix());
        let path = self.layout.staged_package_path(&stamp, archive_type);
        debug!(path = %path.display(), "staging upload");

        let received = match self.write_stream(upload.reader, &path) {
            Ok(received) => received,
            Err(err) => {
                discard_partial(&path, log);
                return Err(err.into());
            }
        };

        if received > self.max_package_bytes {
            discard_partial(&path, log);
            return Err(UpdateError::QuotaExceeded {
                size: received,
                limit: self.max_package_bytes,
            });
        }
        if received != upload.declared_size {
            discard_partial(&path, log);
            return Err(UpdateError::TransferIncomplete {
                expected: upload.declared_size,
                received,
            });
        }

        info!(path = %path.display(), bytes = received, "package staged");
        log.push(format!(
            "staged {} ({received} bytes) at {}",
            upload.file_name,
            path.display()
        ));
        Ok(StagedPackage {
            path,
            size_bytes: received,
            received_at: Utc::now(),
        })
    }

    // Reads at most one byte past the limit so an oversized stream is detected
    // without persisting all of it.
    fn write_stream<R: Read>(&self, reader: R, path: &std::path::Path) -> anyhow::Result<u64> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("failed to create staged package: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        let mut limited = reader.take(self.max_package_bytes.saturating_add(1));
        let received = io::copy(&mut limited, &mut writer)
            .with_context(|| format!("failed to write staged package: {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush staged package: {}", path.display()))?;
        writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync staged package: {}", path.display()))?;
        Ok(received)
    }
}

fn discard_partial(path: &std::path::Path, log: &mut Vec<String>) {
    match remove_file_if_exists(path) {
        Ok(_) => {}
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "failed to discard partial upload");
            log.push(format!(
                "could not remove partial upload {}: {err:#}; a later sweep will remove it",
                path.display()
            ));
        }
    }
}
