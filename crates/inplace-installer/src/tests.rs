use super::*;

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use inplace_core::{
    InstallationReport, PipelineContext, ProtectedPathPolicy, UpdaterConfig, WarningKind,
};
use inplace_migrate::{SchemaStore, SqliteSchemaStore};
use inplace_security::SharedSecretVerifier;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use crate::extract::discover_package_root;

const SECRET: &str = "s3cret";
const LIVE_CONFIG: &[u8] = b"<?php $db = 'live-credentials';\n";
const CAT_PNG: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-a-cat";

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        if name.ends_with('/') {
            writer
                .add_directory(*name, options)
                .expect("must add directory");
        } else {
            writer.start_file(*name, options).expect("must start file");
            writer
                .write_all(body.as_bytes())
                .expect("must write file body");
        }
    }
    writer.finish().expect("must finish zip").into_inner()
}

fn nested_release() -> Vec<u8> {
    zip_bytes(&[
        ("app/", ""),
        ("app/config.sample.php", "<?php // sample\n"),
        ("app/config.php", "<?php $db = 'package-defaults';\n"),
        ("app/index.php", "<?php // v2 index\n"),
        ("app/.htaccess", "RewriteEngine Off\n"),
        ("app/lib/app.php", "<?php // v2 app\n"),
        ("app/lib/extra/helper.php", "<?php // helper\n"),
        ("app/uploads/placeholder.txt", "ship me not"),
        ("README.txt", "release notes"),
    ])
}

struct Site {
    dir: TempDir,
    root: PathBuf,
    config: UpdaterConfig,
}

impl Site {
    fn new() -> Self {
        Self::in_dir(tempfile::tempdir().expect("must create temp dir"))
    }

    fn in_dir(dir: TempDir) -> Self {
        let root = dir.path();
        fs::write(root.join("config.php"), LIVE_CONFIG).expect("must write config");
        fs::write(root.join("index.php"), b"<?php // v1 index\n").expect("must write index");
        fs::write(root.join(".htaccess"), b"RewriteEngine On\n").expect("must write htaccess");
        fs::create_dir_all(root.join("lib")).expect("must create lib");
        fs::write(root.join("lib/app.php"), b"<?php // v1 app\n").expect("must write app");
        fs::create_dir_all(root.join("uploads/2024")).expect("must create uploads");
        fs::write(root.join("uploads/2024/cat.png"), CAT_PNG).expect("must write upload");
        let root = fs::canonicalize(root).expect("must resolve temp dir");
        Self {
            dir,
            root,
            config: UpdaterConfig::default(),
        }
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn layout(&self) -> UpdateLayout {
        UpdateLayout::from_config(self.root(), &self.config)
    }

    fn read(&self, relative: &str) -> Vec<u8> {
        fs::read(self.root().join(relative)).expect("must read live file")
    }
}

fn stage_bytes(pipeline: &UpdatePipeline<'_>, file_name: &str, bytes: &[u8]) -> StageResponse {
    pipeline.stage(Upload {
        file_name,
        declared_size: bytes.len() as u64,
        proof: SECRET,
        reader: bytes,
    })
}

fn staged_context(pipeline: &UpdatePipeline<'_>, bytes: &[u8]) -> PipelineContext {
    let response = stage_bytes(pipeline, "release.zip", bytes);
    assert!(response.success, "stage failed: {:?}", response.error);
    response.context.expect("successful stage must return a context")
}

fn extracted_context(pipeline: &UpdatePipeline<'_>, bytes: &[u8]) -> PipelineContext {
    let response = pipeline.extract(staged_context(pipeline, bytes));
    assert!(response.success, "extract failed: {:?}", response.error);
    response.context
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| entry.expect("must read entry").path())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn layout_paths_live_under_data_dir_and_install_root() {
    let layout = UpdateLayout::new("/srv/site", "/srv/site/.inplace");
    assert_eq!(layout.staging_dir(), PathBuf::from("/srv/site/.inplace/staging"));
    assert_eq!(layout.tmp_dir(), PathBuf::from("/srv/site/.inplace/tmp"));
    assert_eq!(layout.lock_path(), PathBuf::from("/srv/site/.inplace/update.lock"));
    assert_eq!(
        layout.backup_path("2026-01-02_03-04-05"),
        PathBuf::from("/srv/site/backups/backup-2026-01-02_03-04-05")
    );
    assert_eq!(
        layout.staged_package_path("20260102-030405-1-2", inplace_core::ArchiveType::Zip),
        PathBuf::from("/srv/site/.inplace/staging/package-20260102-030405-1-2.zip")
    );
    assert_eq!(layout.data_dir_relative(), Some(Path::new(".inplace")));

    let outside = UpdateLayout::new("/srv/site", "/var/lib/inplace");
    assert_eq!(outside.data_dir_relative(), None);
}

#[test]
fn stage_rejects_bad_proof_before_writing_anything() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let bytes = nested_release();

    let response = pipeline.stage(Upload {
        file_name: "release.zip",
        declared_size: bytes.len() as u64,
        proof: "guess",
        reader: bytes.as_slice(),
    });
    assert!(!response.success);
    assert_eq!(response.error_kind.as_deref(), Some("InvalidProof"));
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
    assert_eq!(read_update_lock(&site.layout()).expect("must read lock"), None);
}

#[test]
fn stage_rejects_declared_size_over_quota() {
    let mut site = Site::new();
    site.config.max_package_bytes = 64;
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = stage_bytes(&pipeline, "release.zip", &nested_release());
    assert!(!response.success);
    assert_eq!(response.error_kind.as_deref(), Some("QuotaExceeded"));
    assert!(response
        .error
        .as_deref()
        .is_some_and(|error| error.contains("limit of 64 bytes")));
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
}

#[test]
fn stage_detects_stream_longer_than_quota_despite_small_declared_size() {
    let mut site = Site::new();
    site.config.max_package_bytes = 16;
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let bytes = vec![7_u8; 1024];

    let response = pipeline.stage(Upload {
        file_name: "release.zip",
        declared_size: 8,
        proof: SECRET,
        reader: bytes.as_slice(),
    });
    assert_eq!(response.error_kind.as_deref(), Some("QuotaExceeded"));
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
}

#[test]
fn stage_discards_truncated_transfer_and_releases_lock() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let bytes = nested_release();

    let response = pipeline.stage(Upload {
        file_name: "release.zip",
        declared_size: bytes.len() as u64 + 100,
        proof: SECRET,
        reader: bytes.as_slice(),
    });
    assert!(!response.success);
    assert_eq!(response.error_kind.as_deref(), Some("TransferIncomplete"));
    assert!(response.context.is_none());
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
    assert_eq!(read_update_lock(&site.layout()).expect("must read lock"), None);
}

#[test]
fn stage_rejects_non_zip_uploads() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = stage_bytes(&pipeline, "release.tar.gz", b"not a zip");
    assert_eq!(response.error_kind.as_deref(), Some("UnsupportedPackageType"));
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
}

#[test]
fn second_stage_is_refused_while_an_update_holds_the_lock() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let bytes = nested_release();

    let first = staged_context(&pipeline, &bytes);
    let second = stage_bytes(&pipeline, "release.zip", &bytes);
    assert!(!second.success);
    assert_eq!(second.error_kind.as_deref(), Some("UpdateInProgress"));
    assert!(second
        .error
        .as_deref()
        .is_some_and(|error| error.contains(&first.update_id)));
    assert_eq!(dir_entries(&site.layout().staging_dir()).len(), 1);
}

#[test]
fn extract_finds_nested_package_root_and_plans_backup() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = pipeline.extract(staged_context(&pipeline, &nested_release()));
    assert!(response.success, "extract failed: {:?}", response.error);

    let root = response.extracted_root.expect("must report package root");
    assert!(root.ends_with("app"));
    assert!(root.join("index.php").is_file());
    let temp_dir = response.temp_dir.expect("must report scratch dir");
    assert!(temp_dir.starts_with(site.layout().tmp_dir()));

    let backup_dir = response.backup_dir.expect("must report backup dir");
    assert!(backup_dir.starts_with(site.layout().backups_dir()));
    assert!(!backup_dir.exists());
    assert!(response
        .context
        .extraction
        .as_ref()
        .is_some_and(|extraction| extraction.package_root != extraction.scratch_dir));
    assert_eq!(site.read("index.php"), b"<?php // v1 index\n");
}

#[test]
fn extract_falls_back_to_archive_root_without_marker_directories() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let flat = zip_bytes(&[
        ("index.php", "<?php // flat\n"),
        ("assets/site.css", "body {}"),
    ]);

    let response = pipeline.extract(staged_context(&pipeline, &flat));
    assert!(response.success, "extract failed: {:?}", response.error);
    assert_eq!(response.extracted_root, response.temp_dir);
}

#[test]
fn corrupt_archive_leaves_no_scratch_directory() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let context = staged_context(&pipeline, b"PK\x03\x04 this is not a real archive");
    let response = pipeline.extract(context);
    assert!(!response.success);
    assert_eq!(response.error_kind.as_deref(), Some("CorruptArchive"));
    assert!(dir_entries(&site.layout().tmp_dir()).is_empty());
    assert_eq!(site.read("index.php"), b"<?php // v1 index\n");
}

#[test]
fn missing_entry_point_keeps_scratch_until_cleanup() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let no_entry = zip_bytes(&[("docs/readme.md", "# nothing runnable")]);

    let response = pipeline.extract(staged_context(&pipeline, &no_entry));
    assert!(!response.success);
    assert_eq!(
        response.error_kind.as_deref(),
        Some("InvalidPackageStructure")
    );
    let leftover = response
        .context
        .leftover_scratch_dir
        .clone()
        .expect("scratch dir must be handed to cleanup");
    assert!(leftover.join("docs/readme.md").is_file());

    let cleanup = pipeline.cleanup(&response.context);
    assert!(cleanup.success, "cleanup failed: {:?}", cleanup.error);
    assert!(cleanup.lock_released);
    assert!(!leftover.exists());
    assert!(dir_entries(&site.layout().staging_dir()).is_empty());
    assert_eq!(read_update_lock(&site.layout()).expect("must read lock"), None);
}

#[test]
fn extract_refuses_context_that_does_not_hold_the_lock() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let mut context = staged_context(&pipeline, &nested_release());
    context.update_id = "upd-forged".to_string();
    let response = pipeline.extract(context);
    assert_eq!(response.error_kind.as_deref(), Some("LockMismatch"));
}

#[test]
fn install_without_extraction_reports_missing_context() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let context = staged_context(&pipeline, &nested_release());
    let response = pipeline.install(context);
    assert!(!response.success);
    assert!(!response.critical);
    assert_eq!(response.error_kind.as_deref(), Some("ContextMissing"));
}

#[test]
fn install_rejects_context_paths_outside_updater_directories() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let mut context = extracted_context(&pipeline, &nested_release());
    if let Some(extraction) = context.extraction.as_mut() {
        extraction.backup_dir = site.root().join("lib");
    }
    let response = pipeline.install(context);
    assert_eq!(response.error_kind.as_deref(), Some("Io"));
    assert_eq!(site.read("lib/app.php"), b"<?php // v1 app\n");
}

#[test]
fn install_overwrites_application_files_and_preserves_protected_paths() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let context = extracted_context(&pipeline, &nested_release());
    let staged_path = context
        .staged
        .as_ref()
        .map(|staged| staged.path.clone())
        .expect("must carry staged package");
    let scratch_dir = context
        .extraction
        .as_ref()
        .map(|extraction| extraction.scratch_dir.clone())
        .expect("must carry scratch dir");

    let response = pipeline.install(context);
    assert!(response.success, "install failed: {:?}", response.error);
    assert!(!response.critical);
    assert_eq!(response.files_installed, 4);
    assert_eq!(response.dirs_created, 1);

    assert_eq!(site.read("config.php"), LIVE_CONFIG);
    assert_eq!(site.read(".htaccess"), b"RewriteEngine On\n");
    assert_eq!(site.read("uploads/2024/cat.png"), CAT_PNG);
    assert!(!site.root().join("uploads/placeholder.txt").exists());
    assert_eq!(site.read("index.php"), b"<?php // v2 index\n");
    assert_eq!(site.read("lib/app.php"), b"<?php // v2 app\n");
    assert_eq!(site.read("lib/extra/helper.php"), b"<?php // helper\n");
    assert!(!site.root().join("README.txt").exists());

    let backup_dir = response.backup_dir.expect("must report backup dir");
    assert_eq!(
        fs::read(backup_dir.join("config.php")).expect("must read backup"),
        LIVE_CONFIG
    );
    assert!(!scratch_dir.exists());
    assert!(!staged_path.exists());
    assert_eq!(read_update_lock(&site.layout()).expect("must read lock"), None);

    // No site database exists, so migrations are skipped with a warning.
    assert!(response.degraded);
    assert_eq!(response.warnings.len(), 1);
    assert_eq!(response.warnings[0].kind, WarningKind::MigrationStep);
    assert!(response.migration_log[0].contains("database not found"));
}

#[test]
fn install_runs_migrations_against_the_site_database() {
    let site = Site::new();
    let db_path = site.root().join(&site.config.database_path);
    {
        let store = SqliteSchemaStore::open(&db_path).expect("must create site db");
        store
            .connection()
            .execute_batch("CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL);")
            .expect("must create posts");
    }
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = pipeline.install(extracted_context(&pipeline, &nested_release()));
    assert!(response.success, "install failed: {:?}", response.error);
    assert!(response.warnings.is_empty(), "{:?}", response.warnings);
    assert!(!response.degraded);
    assert!(response
        .migration_log
        .contains(&"migration posts_featured_image: applied".to_string()));

    let store = SqliteSchemaStore::open(&db_path).expect("must reopen site db");
    assert!(store
        .column_exists("posts", "meta_description")
        .expect("must inspect"));
}

#[test]
fn install_with_custom_store_reports_migration_outcomes() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let context = extracted_context(&pipeline, &nested_release());
    let response = pipeline.install_with_store(
        context,
        Box::new(|| -> anyhow::Result<Box<dyn SchemaStore>> {
            let store = SqliteSchemaStore::open_in_memory()?;
            Ok(Box::new(store) as Box<dyn SchemaStore>)
        }),
    );
    assert!(response.success);
    assert_eq!(response.migration_log[0], "migration create_settings: applied");
}

#[test]
fn file_blocked_by_live_directory_becomes_partial_install_warning() {
    let site = Site::new();
    fs::create_dir_all(site.root().join("robots.txt")).expect("must create blocking dir");
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let package = zip_bytes(&[
        ("index.php", "<?php // v3\n"),
        ("robots.txt", "User-agent: *\n"),
    ]);

    let response = pipeline.install_with_store(
        extracted_context(&pipeline, &package),
        Box::new(|| -> anyhow::Result<Box<dyn SchemaStore>> {
            let store = SqliteSchemaStore::open_in_memory()?;
            Ok(Box::new(store) as Box<dyn SchemaStore>)
        }),
    );
    assert!(response.success, "install failed: {:?}", response.error);
    assert_eq!(response.files_installed, 1);
    assert_eq!(response.warnings.len(), 1);
    assert_eq!(response.warnings[0].kind, WarningKind::PartialInstall);
    assert!(response
        .log
        .iter()
        .any(|line| line.starts_with("PartialInstallWarning: robots.txt")));
    assert_eq!(site.read("index.php"), b"<?php // v3\n");
    assert_eq!(site.read("config.php"), LIVE_CONFIG);
}

#[cfg(unix)]
#[test]
fn read_only_protected_file_survives_install_unchanged() {
    use std::os::unix::fs::PermissionsExt;

    let site = Site::new();
    let config_path = site.root().join("config.php");
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o444))
        .expect("must make config read-only");
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = pipeline.install_with_store(
        extracted_context(&pipeline, &nested_release()),
        Box::new(|| -> anyhow::Result<Box<dyn SchemaStore>> {
            let store = SqliteSchemaStore::open_in_memory()?;
            Ok(Box::new(store) as Box<dyn SchemaStore>)
        }),
    );
    assert!(response.success, "install failed: {:?}", response.error);
    assert!(!response.critical);
    assert_eq!(site.read("config.php"), LIVE_CONFIG);
    assert_eq!(site.read("index.php"), b"<?php // v2 index\n");
    let mode = fs::metadata(&config_path)
        .expect("must stat config")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o444);
    assert_eq!(read_update_lock(&site.layout()).expect("must read lock"), None);
}

#[cfg(unix)]
#[test]
fn replacing_copy_overwrites_read_only_destination() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("must create temp dir");
    let src = dir.path().join("new.php");
    let dst = dir.path().join("live/old.php");
    fs::write(&src, b"fresh").expect("must write source");
    fs::create_dir_all(dst.parent().expect("must have parent")).expect("must create parent");
    fs::write(&dst, b"stale").expect("must write destination");
    fs::set_permissions(&dst, fs::Permissions::from_mode(0o444))
        .expect("must make destination read-only");

    copy_entry_replacing(&src, &dst).expect("must replace read-only file");
    assert_eq!(fs::read(&dst).expect("must read destination"), b"fresh");
}

#[cfg(unix)]
#[test]
fn critical_restore_failure_keeps_the_partial_install_report() {
    use std::os::unix::fs::PermissionsExt;

    let site = Site::new();
    fs::create_dir_all(site.layout().backups_dir()).expect("must create backups dir");
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");
    let context = extracted_context(&pipeline, &nested_release());
    let update_id = context.update_id.clone();

    // A read-only config in a read-only site root cannot be replaced by restore.
    fs::set_permissions(site.root().join("config.php"), fs::Permissions::from_mode(0o444))
        .expect("must make config read-only");
    fs::set_permissions(site.root(), fs::Permissions::from_mode(0o555))
        .expect("must make site root read-only");
    let unrestricted = fs::write(site.root().join(".write-check"), b"").is_ok();
    if unrestricted {
        // Running with privileges that ignore file modes.
        fs::set_permissions(site.root(), fs::Permissions::from_mode(0o755))
            .expect("must restore site root mode");
        return;
    }

    let response = pipeline.install_with_store(
        context,
        Box::new(|| -> anyhow::Result<Box<dyn SchemaStore>> {
            let store = SqliteSchemaStore::open_in_memory()?;
            Ok(Box::new(store) as Box<dyn SchemaStore>)
        }),
    );
    fs::set_permissions(site.root(), fs::Permissions::from_mode(0o755))
        .expect("must restore site root mode");

    assert!(!response.success);
    assert!(response.critical);
    assert!(response.degraded);
    assert_eq!(response.error_kind.as_deref(), Some("CriticalRestoreFailure"));
    assert_eq!(response.files_installed, 3);
    assert_eq!(response.dirs_created, 1);
    assert!(response.migration_log.is_empty());
    assert_eq!(response.warnings.len(), 1);
    assert_eq!(response.warnings[0].kind, WarningKind::PartialInstall);
    assert_eq!(
        response.warnings[0].path.as_deref(),
        Some(Path::new("config.sample.php"))
    );
    assert!(response
        .log
        .iter()
        .any(|line| line.starts_with("backup: saved config.php")));
    assert!(response
        .log
        .iter()
        .any(|line| line == "overwrite: installed 3 files, created 1 directories"));
    assert!(response
        .log
        .iter()
        .any(|line| line.starts_with("CRITICAL:") && line.contains("config.php")));
    assert_eq!(site.read("index.php"), b"<?php // v2 index\n");
    assert_eq!(site.read("config.php"), LIVE_CONFIG);
    assert_eq!(
        read_update_lock(&site.layout()).expect("must read lock"),
        Some(update_id)
    );
}

#[test]
fn relative_install_root_yields_absolute_hand_off_paths() {
    let dir = tempfile::tempdir_in(".").expect("must create temp dir beside the crate");
    assert!(dir.path().is_relative());
    let site = Site::in_dir(dir);
    let verifier = SharedSecretVerifier::new(SECRET);
    let relative_root = site.dir.path().to_path_buf();
    let pipeline = UpdatePipeline::new(&relative_root, site.config.clone(), &verifier)
        .expect("must build pipeline");
    assert!(pipeline.layout().install_root().is_absolute());
    assert_eq!(pipeline.layout().install_root(), site.root());

    let staged = stage_bytes(&pipeline, "release.zip", &nested_release());
    assert!(staged.success, "stage failed: {:?}", staged.error);
    assert!(staged.zip_path.as_deref().is_some_and(Path::is_absolute));

    let extracted = pipeline.extract(staged.context.expect("must carry context"));
    assert!(extracted.success, "extract failed: {:?}", extracted.error);
    let extraction = extracted
        .context
        .extraction
        .as_ref()
        .expect("must carry extraction");
    assert!(extraction.scratch_dir.is_absolute());
    assert!(extraction.package_root.is_absolute());
    assert!(extraction.backup_dir.is_absolute());

    let cleaned = pipeline.cleanup(&extracted.context);
    assert!(cleaned.success, "cleanup failed: {:?}", cleaned.error);
}

#[test]
fn missing_install_root_is_rejected() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let verifier = SharedSecretVerifier::new(SECRET);
    let err = UpdatePipeline::new(dir.path().join("absent"), UpdaterConfig::default(), &verifier)
        .err()
        .expect("missing root must fail");
    assert!(format!("{err:#}").contains("failed to resolve install root"));
}

#[test]
fn vanished_backup_is_a_critical_restore_failure() {
    let site = Site::new();
    let layout = site.layout();
    let policy = ProtectedPathPolicy::default();
    let executor = InstallExecutor::new(&layout, &policy);
    let backup_dir = layout.backup_path("test");
    fs::create_dir_all(&backup_dir).expect("must create backup dir");

    let mut report = InstallationReport::default();
    let captured = executor.backup(&backup_dir, &mut report);
    assert!(!captured.is_empty());
    assert!(report.warnings.is_empty());

    fs::remove_dir_all(&backup_dir).expect("must remove backup dir");
    let err = executor
        .restore(&backup_dir, &captured, &mut report)
        .expect_err("restore must fail without a backup");
    assert!(err.is_critical());
    assert_eq!(err.kind(), "CriticalRestoreFailure");
}

#[test]
fn tampered_backup_fails_restore_verification() {
    let site = Site::new();
    let layout = site.layout();
    let policy = ProtectedPathPolicy::default();
    let executor = InstallExecutor::new(&layout, &policy);
    let backup_dir = layout.backup_path("tampered");
    fs::create_dir_all(&backup_dir).expect("must create backup dir");

    let mut report = InstallationReport::default();
    let captured = executor.backup(&backup_dir, &mut report);
    fs::write(backup_dir.join("config.php"), b"<?php // swapped\n").expect("must tamper");

    let err = executor
        .restore(&backup_dir, &captured, &mut report)
        .expect_err("digest mismatch must fail restore");
    assert!(err.to_string().contains("config.php"));
    assert!(err.is_critical());
}

#[test]
fn backup_skips_absent_paths_and_the_backup_holder() {
    let site = Site::new();
    fs::remove_file(site.root().join(".htaccess")).expect("must remove htaccess");
    let layout = site.layout();
    let policy = ProtectedPathPolicy::default();
    let executor = InstallExecutor::new(&layout, &policy);
    let backup_dir = layout.backup_path("skips");
    fs::create_dir_all(&backup_dir).expect("must create backup dir");

    let mut report = InstallationReport::default();
    let captured = executor.backup(&backup_dir, &mut report);
    let saved = captured
        .iter()
        .map(|entry| entry.relative.clone())
        .collect::<Vec<_>>();
    assert_eq!(saved, vec![PathBuf::from("config.php"), PathBuf::from("uploads")]);
    assert!(backup_dir.join("uploads/2024/cat.png").is_file());
    assert!(!backup_dir.join("backups").exists());
}

#[test]
fn package_root_discovery_prefers_first_marker_directory_and_logs_ambiguity() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    for name in ["beta", "alpha", "plain"] {
        fs::create_dir_all(dir.path().join(name)).expect("must create child");
    }
    fs::write(dir.path().join("alpha/index.php"), b"a").expect("must write marker");
    fs::write(dir.path().join("beta/bootstrap.php"), b"b").expect("must write marker");
    let markers = vec!["index.php".to_string(), "bootstrap.php".to_string()];

    let mut log = Vec::new();
    let root = discover_package_root(dir.path(), &markers, &mut log).expect("must discover");
    assert_eq!(root, dir.path().join("alpha"));
    assert!(log
        .iter()
        .any(|line| line.contains("ambiguous package root") && line.contains("beta")));
}

#[test]
fn update_lock_is_exclusive_and_owner_checked() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let layout = UpdateLayout::new(dir.path(), dir.path().join(".inplace"));

    acquire_update_lock(&layout, "upd-a").expect("must acquire");
    let err = acquire_update_lock(&layout, "upd-b").expect_err("second claim must fail");
    assert_eq!(err.kind(), "UpdateInProgress");

    verify_update_lock(&layout, "upd-a").expect("holder must verify");
    let err = release_update_lock(&layout, "upd-b").expect_err("non-holder must not release");
    assert_eq!(err.kind(), "LockMismatch");

    assert_eq!(
        force_release_update_lock(&layout).expect("must force release"),
        Some("upd-a".to_string())
    );
    assert_eq!(force_release_update_lock(&layout).expect("must be idempotent"), None);
    assert!(!release_update_lock(&layout, "upd-a").expect("absent lock is fine"));
}

#[test]
fn sweep_removes_stale_artifacts_only_when_unlocked() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let layout = UpdateLayout::new(dir.path(), dir.path().join(".inplace"));
    layout.ensure_base_dirs().expect("must create base dirs");
    let staged = layout.staging_dir().join("package-old.zip");
    fs::write(&staged, b"old").expect("must write staged");
    let scratch = layout.scratch_dir_path("old");
    fs::create_dir_all(scratch.join("app")).expect("must create scratch");

    let later = SystemTime::now() + Duration::from_secs(3600);

    acquire_update_lock(&layout, "upd-busy").expect("must acquire");
    let report =
        sweep_stale_artifacts(&layout, Duration::from_secs(60), later).expect("must sweep");
    assert_eq!(report.skipped_for_lock.as_deref(), Some("upd-busy"));
    assert!(staged.exists());

    release_update_lock(&layout, "upd-busy").expect("must release");
    let report = sweep_stale_artifacts(&layout, Duration::from_secs(7200), later)
        .expect("must sweep");
    assert!(report.removed.is_empty());

    let report =
        sweep_stale_artifacts(&layout, Duration::from_secs(60), later).expect("must sweep");
    assert_eq!(report.removed, vec![staged.clone(), scratch.clone()]);
    assert!(!staged.exists());
    assert!(!scratch.exists());
}

#[test]
fn probe_runs_for_requested_duration_and_reports_abandonment() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let mut config = UpdaterConfig::default();
    config.probe_yield_interval_ms = 10;
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline =
        UpdatePipeline::new(dir.path(), config, &verifier).expect("must build pipeline");

    let mut ticks = 0;
    let response = pipeline.probe(0.2, &AttachedConnection, |_| ticks += 1);
    assert!(response.success);
    assert!(response.completed);
    assert!(!response.abandoned);
    assert!(response.elapsed >= 0.2);
    assert!(ticks > 0);

    let flag = AbandonFlag::new();
    flag.mark_abandoned();
    let response = pipeline.probe(0.05, &flag, |_| {});
    assert!(response.completed);
    assert!(response.abandoned);

    let response = pipeline.probe(MAX_PROBE_SECONDS + 1.0, &AttachedConnection, |_| {});
    assert!(!response.success);
    assert!(response.error.is_some());
}

#[test]
fn responses_serialize_for_the_next_call() {
    let site = Site::new();
    let verifier = SharedSecretVerifier::new(SECRET);
    let pipeline = UpdatePipeline::new(site.root(), site.config.clone(), &verifier)
        .expect("must build pipeline");

    let response = stage_bytes(&pipeline, "release.zip", &nested_release());
    let raw = serde_json::to_string(&response).expect("must serialize");
    assert!(raw.contains("\"zip_path\""));
    let parsed: StageResponse = serde_json::from_str(&raw).expect("must parse");
    let context = parsed.context.expect("must carry context");

    let extract = pipeline.extract(context);
    assert!(extract.success, "extract failed: {:?}", extract.error);
}
