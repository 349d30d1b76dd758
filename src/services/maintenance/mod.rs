// 数据库定时维护引擎：索引保障、清理、压缩分析、慢查询监控与备份轮转。
pub mod backup;
pub mod coordinator;
pub mod indexes;
pub mod janitor;
pub mod monitor;
pub mod optimizer;
pub mod prober;
pub mod scheduler;

use crate::core::error::MaintenanceError;
use anyhow::anyhow;

pub use backup::{BackupArtifact, BackupOutcome, BackupRotator, BackupSettings};
pub use coordinator::{MaintenanceCoordinator, MaintenanceTick, PhaseResult, TickOutcome};
pub use indexes::{declared_indexes, IndexProvisioner, IndexSpec, ProvisionReport};
pub use janitor::{CleanupModel, DataJanitor, JanitorReport, SqlitePortalModel};
pub use monitor::{QueryMonitor, SlowQueryEvent};
pub use optimizer::{IndexEntry, OptimizePhase, StorageOptimizer, StorageStats};
pub use scheduler::MaintenanceScheduler;

/// 数据库与文件系统的同步调用统一放到阻塞线程池执行。
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T, MaintenanceError>
where
    F: FnOnce() -> Result<T, MaintenanceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|err| {
        MaintenanceError::connection("blocking task aborted", Some(anyhow!(err.to_string())))
    })?
}
