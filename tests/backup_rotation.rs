use carnival_maintenance::error::BACKUP_ERROR;
use carnival_maintenance::maintenance::{BackupOutcome, BackupRotator, BackupSettings};
use carnival_maintenance::storage::schema::ensure_portal_tables;
use carnival_maintenance::storage::{ConnectionHandle, HandleOptions, SqliteHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn open_portal() -> (TempDir, Arc<dyn ConnectionHandle>) {
    let dir = tempfile::tempdir().unwrap();
    let handle: Arc<dyn ConnectionHandle> = Arc::new(SqliteHandle::new(
        dir.path().join("data/portal.db"),
        HandleOptions::default(),
    ));
    ensure_portal_tables(handle.as_ref()).unwrap();
    (dir, handle)
}

fn settings(dir: &Path, enabled: bool, retention_days: u64) -> BackupSettings {
    BackupSettings {
        enabled,
        dir: dir.join("uploads/backups"),
        prefix: "database-backup".to_string(),
        retention_days,
    }
}

fn seed_file(dir: &Path, name: &str, age: Duration) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, b"old snapshot").unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
    path
}

fn created(outcome: BackupOutcome) -> (String, Vec<String>) {
    match outcome {
        BackupOutcome::Created {
            artifact, removed, ..
        } => (artifact.filename, removed),
        BackupOutcome::Disabled => panic!("expected a snapshot"),
    }
}

#[tokio::test]
async fn disabled_rotator_touches_nothing() {
    let (dir, handle) = open_portal();
    let settings = settings(dir.path(), false, 30);
    let backup_dir = settings.dir.clone();
    let rotator = BackupRotator::new(handle, settings);

    let outcome = rotator.run().await.unwrap();
    assert!(matches!(outcome, BackupOutcome::Disabled));
    assert!(!backup_dir.exists());
}

#[tokio::test]
async fn zero_retention_keeps_only_the_new_snapshot() {
    let (dir, handle) = open_portal();
    let settings = settings(dir.path(), true, 0);
    let backup_dir = settings.dir.clone();
    seed_file(&backup_dir, "database-backup-older.db", Duration::from_secs(3600));
    seed_file(&backup_dir, "manual.db", Duration::from_secs(60));
    let notes = seed_file(&backup_dir, "notes.txt", Duration::from_secs(3600 * 24 * 90));

    let rotator = BackupRotator::new(handle, settings);
    let (filename, removed) = created(rotator.run().await.unwrap());
    assert_eq!(
        removed,
        vec!["database-backup-older.db".to_string(), "manual.db".to_string()]
    );
    assert!(backup_dir.join(&filename).exists());
    assert!(notes.exists());
}

#[tokio::test]
async fn back_to_back_runs_write_distinct_files() {
    let (dir, handle) = open_portal();
    let settings = settings(dir.path(), true, 30);
    let backup_dir = settings.dir.clone();
    let rotator = BackupRotator::new(handle, settings);

    let (first, _) = created(rotator.run().await.unwrap());
    let (second, removed) = created(rotator.run().await.unwrap());
    assert_ne!(first, second);
    assert!(removed.is_empty());
    assert!(backup_dir.join(first).exists());
    assert!(backup_dir.join(second).exists());
}

#[tokio::test]
async fn snapshot_matches_database_size() {
    let (dir, handle) = open_portal();
    let rotator = BackupRotator::new(handle.clone(), settings(dir.path(), true, 30));

    let outcome = rotator.run().await.unwrap();
    let BackupOutcome::Created { artifact, .. } = outcome else {
        panic!("expected a snapshot");
    };
    let source_len = std::fs::metadata(handle.storage_path()).unwrap().len();
    assert_eq!(artifact.bytes, source_len);
    assert!(artifact.bytes > 0);
    assert!(artifact
        .filename
        .strip_prefix("database-backup-")
        .unwrap()
        .ends_with("Z.db"));
}

#[tokio::test]
async fn unusable_backup_dir_surfaces_backup_error() {
    let (dir, handle) = open_portal();
    let settings = settings(dir.path(), true, 30);
    std::fs::create_dir_all(settings.dir.parent().unwrap()).unwrap();
    std::fs::write(&settings.dir, b"not a directory").unwrap();

    let rotator = BackupRotator::new(handle, settings.clone());
    let err = rotator.run().await.unwrap_err();
    assert_eq!(err.code(), BACKUP_ERROR);
    assert_eq!(std::fs::read(&settings.dir).unwrap(), b"not a directory");
}
