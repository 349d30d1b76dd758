// 数据清理：调用门户数据层提供的两项清理能力，本模块只负责编排与错误归类，不重试。
use crate::core::error::MaintenanceError;
use crate::services::maintenance::run_blocking;
use crate::storage::{format_timestamp, ConnectionHandle};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Months, Utc};
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

pub const OP_EXPIRED_INVITATIONS: &str = "cleanup_expired_invitations";
pub const OP_ARCHIVE_CARNIVALS: &str = "archive_old_carnivals";

/// 门户数据层暴露给维护引擎的清理能力，每项都应是一条原子语句。
pub trait CleanupModel: Send + Sync {
    /// 清空已过期邀请的 token 字段，返回受影响的用户数。
    fn cleanup_expired_invitations(&self, now: DateTime<Utc>) -> Result<u64>;

    /// 把早于 `now - archive_age_years` 且仍处于激活状态的嘉年华标记为归档，返回归档数量。
    fn archive_old_carnivals(&self, now: DateTime<Utc>, archive_age_years: u32) -> Result<u64>;
}

pub struct SqlitePortalModel {
    handle: Arc<dyn ConnectionHandle>,
}

impl SqlitePortalModel {
    pub fn new(handle: Arc<dyn ConnectionHandle>) -> Self {
        Self { handle }
    }
}

impl CleanupModel for SqlitePortalModel {
    fn cleanup_expired_invitations(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_text = format_timestamp(now);
        let changed = self.handle.execute_update(
            "UPDATE Users SET invitationToken = NULL, tokenExpires = NULL, updatedAt = ?1 \
             WHERE invitationToken IS NOT NULL AND tokenExpires IS NOT NULL AND tokenExpires < ?1",
            &[SqlValue::Text(now_text)],
        )?;
        Ok(changed as u64)
    }

    fn archive_old_carnivals(&self, now: DateTime<Utc>, archive_age_years: u32) -> Result<u64> {
        let cutoff = archive_cutoff(now, archive_age_years)?;
        let now_text = format_timestamp(now);
        let changed = self.handle.execute_update(
            "UPDATE Carnivals SET isActive = 0, archivedAt = ?1, updatedAt = ?1 \
             WHERE isActive = 1 AND date < ?2",
            &[SqlValue::Text(now_text), SqlValue::Text(format_timestamp(cutoff))],
        )?;
        Ok(changed as u64)
    }
}

pub fn archive_cutoff(now: DateTime<Utc>, archive_age_years: u32) -> Result<DateTime<Utc>> {
    let months = archive_age_years
        .checked_mul(12)
        .ok_or_else(|| anyhow!("archive age {archive_age_years} years overflows"))?;
    now.checked_sub_months(Months::new(months))
        .ok_or_else(|| anyhow!("archive cutoff before {archive_age_years} years is out of range"))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JanitorReport {
    pub expired_invitations: u64,
    pub archived_carnivals: u64,
}

#[derive(Clone)]
pub struct DataJanitor {
    model: Arc<dyn CleanupModel>,
    archive_age_years: u32,
}

impl DataJanitor {
    pub fn new(model: Arc<dyn CleanupModel>, archive_age_years: u32) -> Self {
        Self {
            model,
            archive_age_years,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<JanitorReport, MaintenanceError> {
        let model = self.model.clone();
        let expired_invitations = run_blocking(move || {
            model
                .cleanup_expired_invitations(now)
                .map_err(|err| MaintenanceError::janitor(OP_EXPIRED_INVITATIONS, err))
        })
        .await?;

        let model = self.model.clone();
        let archive_age_years = self.archive_age_years;
        let archived_carnivals = run_blocking(move || {
            model
                .archive_old_carnivals(now, archive_age_years)
                .map_err(|err| MaintenanceError::janitor(OP_ARCHIVE_CARNIVALS, err))
        })
        .await?;

        let report = JanitorReport {
            expired_invitations,
            archived_carnivals,
        };
        info!(
            expired_invitations = report.expired_invitations,
            archived_carnivals = report.archived_carnivals,
            "数据清理完成"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cutoff_subtracts_whole_years() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 2, 0, 0).unwrap();
        let cutoff = archive_cutoff(now, 2).unwrap();
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2024, 10, 16, 2, 0, 0).unwrap());
    }

    #[test]
    fn cutoff_clamps_leap_day() {
        let now = Utc.with_ymd_and_hms(2028, 2, 29, 0, 0, 0).unwrap();
        let cutoff = archive_cutoff(now, 1).unwrap();
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2027, 2, 28, 0, 0, 0).unwrap());
    }
}
