// 存储优化：VACUUM 压缩、ANALYZE 统计刷新与 PRAGMA optimize 提示，外加维护后的容量报告。
use crate::core::error::MaintenanceError;
use crate::services::maintenance::prober::quote_identifier;
use crate::services::maintenance::run_blocking;
use crate::storage::{row_i64, row_str, ConnectionHandle, QueryKind};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// 容量报告统计的表，保持固定集合。
pub const STATISTICS_TABLES: &[&str] = &["Carnivals", "Users", "Clubs", "EmailSubscriptions"];

const PAGE_BYTES_SQL: &str =
    "SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()";
const USER_INDEXES_SQL: &str = "SELECT name, tbl_name FROM sqlite_master \
     WHERE type = 'index' AND name NOT LIKE 'sqlite_%' ORDER BY name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizePhase {
    Compact,
    Analyze,
    OptimizeHint,
}

impl OptimizePhase {
    pub const ALL: [OptimizePhase; 3] = [
        OptimizePhase::Compact,
        OptimizePhase::Analyze,
        OptimizePhase::OptimizeHint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizePhase::Compact => "compact",
            OptimizePhase::Analyze => "analyze",
            OptimizePhase::OptimizeHint => "optimize_hint",
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            OptimizePhase::Compact => "VACUUM",
            OptimizePhase::Analyze => "ANALYZE",
            // 效果随引擎版本变化，只作为建议执行，不依赖其可观察结果。
            OptimizePhase::OptimizeHint => "PRAGMA optimize",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub name: String,
    pub table: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub table_row_counts: BTreeMap<String, i64>,
    pub page_bytes: i64,
    pub index_list: Vec<IndexEntry>,
    pub captured_at: DateTime<Utc>,
}

impl StorageStats {
    pub fn page_kb(&self) -> i64 {
        self.page_bytes / 1024
    }
}

pub fn run_phase(
    handle: &dyn ConnectionHandle,
    phase: OptimizePhase,
) -> Result<(), MaintenanceError> {
    handle
        .execute(phase.sql(), QueryKind::Raw)
        .map(|_| ())
        .map_err(|err| MaintenanceError::optimize(phase.as_str(), err))
}

pub fn collect_storage_stats(
    handle: &dyn ConnectionHandle,
    tables: &[&str],
) -> Result<StorageStats, MaintenanceError> {
    let report_error = |err: MaintenanceError| MaintenanceError::optimize("report", err);
    let mut table_row_counts = BTreeMap::new();
    for table in tables {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", quote_identifier(table));
        let rows = handle
            .execute(&sql, QueryKind::Select)
            .map_err(report_error)?
            .into_rows();
        let total = rows
            .first()
            .and_then(|row| row_i64(row, "total"))
            .ok_or_else(|| {
                MaintenanceError::optimize("report", anyhow!("no row count for {table}"))
            })?;
        table_row_counts.insert(table.to_string(), total);
    }

    let rows = handle
        .execute(PAGE_BYTES_SQL, QueryKind::Select)
        .map_err(report_error)?
        .into_rows();
    let page_bytes = rows
        .first()
        .and_then(|row| row_i64(row, "size"))
        .unwrap_or(0);

    let index_list = handle
        .execute(USER_INDEXES_SQL, QueryKind::Select)
        .map_err(report_error)?
        .into_rows()
        .iter()
        .filter_map(|row| {
            Some(IndexEntry {
                name: row_str(row, "name")?.to_string(),
                table: row_str(row, "tbl_name")?.to_string(),
            })
        })
        .collect();

    Ok(StorageStats {
        table_row_counts,
        page_bytes,
        index_list,
        captured_at: Utc::now(),
    })
}

#[derive(Clone)]
pub struct StorageOptimizer {
    handle: Arc<dyn ConnectionHandle>,
    statistics_tables: Arc<Vec<String>>,
}

impl StorageOptimizer {
    pub fn new(handle: Arc<dyn ConnectionHandle>) -> Self {
        Self::with_statistics_tables(handle, STATISTICS_TABLES)
    }

    pub fn with_statistics_tables(handle: Arc<dyn ConnectionHandle>, tables: &[&str]) -> Self {
        Self {
            handle,
            statistics_tables: Arc::new(tables.iter().map(|table| table.to_string()).collect()),
        }
    }

    pub async fn run(&self, phase: OptimizePhase) -> Result<(), MaintenanceError> {
        let handle = self.handle.clone();
        let started = Instant::now();
        run_blocking(move || run_phase(handle.as_ref(), phase)).await?;
        info!(
            phase = phase.as_str(),
            duration_ms = started.elapsed().as_millis() as u64,
            "存储优化阶段完成"
        );
        Ok(())
    }

    /// 依次执行压缩、统计刷新与优化提示，任一阶段失败即停止后续阶段。
    pub async fn optimize_all(&self) -> Result<(), MaintenanceError> {
        for phase in OptimizePhase::ALL {
            self.run(phase).await?;
        }
        Ok(())
    }

    pub async fn analyze_and_report(&self) -> Result<StorageStats, MaintenanceError> {
        let handle = self.handle.clone();
        let tables = self.statistics_tables.clone();
        run_blocking(move || {
            run_phase(handle.as_ref(), OptimizePhase::Analyze)?;
            let tables = tables.iter().map(String::as_str).collect::<Vec<_>>();
            collect_storage_stats(handle.as_ref(), &tables)
        })
        .await
    }
}
