// 备份轮转：复制数据库文件为带时间戳的快照，再按保留天数清理旧快照（清理失败只记警告）。
use crate::core::config::MaintenanceConfig;
use crate::core::error::MaintenanceError;
use crate::services::maintenance::run_blocking;
use crate::storage::{ConnectionHandle, QueryKind};
use anyhow::anyhow;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const BACKUP_EXTENSION: &str = ".db";
const CHECKPOINT_SQL: &str = "PRAGMA wal_checkpoint(TRUNCATE)";
const MAX_RETENTION_DAYS: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub prefix: String,
    pub retention_days: u64,
}

impl BackupSettings {
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            enabled: config.backups_enabled,
            dir: config.backup_dir.clone(),
            prefix: config.backup_prefix.clone(),
            retention_days: config.retention_days,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackupOutcome {
    Disabled,
    Created {
        artifact: BackupArtifact,
        removed: Vec<String>,
        retention_warnings: usize,
    },
}

/// `<prefix>-<ISO 时间戳>.db`，时间戳精确到毫秒，`:` 与 `.` 替换为 `-`。
pub fn backup_file_name(prefix: &str, at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{prefix}-{stamp}{BACKUP_EXTENSION}")
}

#[derive(Clone)]
pub struct BackupRotator {
    handle: Arc<dyn ConnectionHandle>,
    settings: BackupSettings,
}

impl BackupRotator {
    pub fn new(handle: Arc<dyn ConnectionHandle>, settings: BackupSettings) -> Self {
        Self { handle, settings }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub async fn run(&self) -> Result<BackupOutcome, MaintenanceError> {
        if !self.settings.enabled {
            info!("备份未启用，跳过");
            return Ok(BackupOutcome::Disabled);
        }
        let artifact = self.snapshot().await?;
        let (removed, retention_warnings) = self.prune_expired(&artifact.filename).await;
        info!(
            file = %artifact.filename,
            bytes = artifact.bytes,
            removed = removed.len(),
            retention_warnings,
            "数据库备份完成"
        );
        Ok(BackupOutcome::Created {
            artifact,
            removed,
            retention_warnings,
        })
    }

    async fn snapshot(&self) -> Result<BackupArtifact, MaintenanceError> {
        let dir = self.settings.dir.clone();
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(MaintenanceError::backup(
                    format!("cannot create backup directory {}", dir.display()),
                    err,
                ))
            }
        }

        // 先把 WAL 合并回主文件，保证单文件快照包含全部已提交页。
        let handle = self.handle.clone();
        run_blocking(move || handle.execute(CHECKPOINT_SQL, QueryKind::Select).map(|_| ()))
            .await
            .map_err(|err| MaintenanceError::backup("checkpoint before backup failed", err))?;

        let source = self.handle.storage_path().to_path_buf();
        let (filename, target) = self.unused_target(&dir).await?;
        let bytes = tokio::fs::copy(&source, &target).await.map_err(|err| {
            MaintenanceError::backup(
                format!("cannot copy {} to {}", source.display(), target.display()),
                err,
            )
        })?;
        if bytes == 0 {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(MaintenanceError::backup(
                format!("snapshot {filename} is empty"),
                anyhow!("source {} has no data", source.display()),
            ));
        }
        let mtime = tokio::fs::metadata(&target)
            .await
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(BackupArtifact {
            filename,
            path: target,
            bytes,
            mtime,
        })
    }

    /// 每次都写新文件；同一毫秒内重复触发时把时间戳顺延 1ms。
    async fn unused_target(&self, dir: &Path) -> Result<(String, PathBuf), MaintenanceError> {
        let mut stamp = Utc::now();
        loop {
            let filename = backup_file_name(&self.settings.prefix, stamp);
            let target = dir.join(&filename);
            let exists = tokio::fs::try_exists(&target).await.map_err(|err| {
                MaintenanceError::backup(format!("cannot inspect {}", target.display()), err)
            })?;
            if !exists {
                return Ok((filename, target));
            }
            stamp += ChronoDuration::milliseconds(1);
        }
    }

    /// 删除 mtime 早于保留期限的 `.db` 快照，跳过本次刚生成的文件。返回 (已删除文件, 警告数)。
    pub async fn prune_expired(&self, keep: &str) -> (Vec<String>, usize) {
        let retention_days = self.settings.retention_days.min(MAX_RETENTION_DAYS) as i64;
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let mut removed = Vec::new();
        let mut warnings = 0;
        let mut entries = match tokio::fs::read_dir(&self.settings.dir).await {
            Ok(entries) => entries,
            Err(err) => {
                let warning = MaintenanceError::retention_warning("*", err);
                warn!(code = warning.code(), "{warning}");
                return (removed, 1);
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    let warning = MaintenanceError::retention_warning("*", err);
                    warn!(code = warning.code(), "{warning}");
                    warnings += 1;
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            if name == keep || !name.ends_with(BACKUP_EXTENSION) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|meta| {
                if meta.is_file() {
                    meta.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => DateTime::<Utc>::from(modified),
                Ok(None) => continue,
                Err(err) => {
                    let warning = MaintenanceError::retention_warning(&name, err);
                    warn!(code = warning.code(), "{warning}");
                    warnings += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed.push(name),
                Err(err) => {
                    let warning = MaintenanceError::retention_warning(&name, err);
                    warn!(code = warning.code(), "{warning}");
                    warnings += 1;
                }
            }
        }
        removed.sort();
        (removed, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_replaces_colons_and_dots() {
        let at = Utc
            .with_ymd_and_hms(2026, 10, 16, 2, 0, 5)
            .unwrap()
            + ChronoDuration::milliseconds(42);
        assert_eq!(
            backup_file_name("database-backup", at),
            "database-backup-2026-10-16T02-00-05-042Z.db"
        );
    }

    #[test]
    fn names_differ_within_the_same_second() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 2, 0, 5).unwrap();
        let later = at + ChronoDuration::milliseconds(1);
        assert_ne!(
            backup_file_name("database-backup", at),
            backup_file_name("database-backup", later)
        );
    }
}
