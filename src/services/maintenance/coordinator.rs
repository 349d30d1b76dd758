// 维护协调：按固定顺序执行一次维护 tick，统一捕获错误、记录结果，并始终释放数据库连接。
use crate::core::config::MaintenanceConfig;
use crate::core::error::MaintenanceError;
use crate::services::maintenance::backup::{BackupOutcome, BackupRotator, BackupSettings};
use crate::services::maintenance::indexes::{declared_indexes, IndexProvisioner, ProvisionReport};
use crate::services::maintenance::janitor::{CleanupModel, DataJanitor, JanitorReport};
use crate::services::maintenance::optimizer::{OptimizePhase, StorageOptimizer, StorageStats};
use crate::services::maintenance::run_blocking;
use crate::storage::ConnectionHandle;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Ok,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub phase: &'static str,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceTick {
    pub fired_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: TickOutcome,
    pub phases: Vec<PhaseResult>,
    pub indexes: Option<ProvisionReport>,
    pub janitor: Option<JanitorReport>,
    pub backup: Option<BackupOutcome>,
    pub stats: Option<StorageStats>,
}

impl MaintenanceTick {
    fn started(fired_at: DateTime<Utc>) -> Self {
        Self {
            fired_at,
            finished_at: None,
            outcome: TickOutcome::Ok,
            phases: Vec::new(),
            indexes: None,
            janitor: None,
            backup: None,
            stats: None,
        }
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|result| result.phase == name)
    }
}

pub struct MaintenanceCoordinator {
    handle: Arc<dyn ConnectionHandle>,
    provisioner: IndexProvisioner,
    janitor: DataJanitor,
    optimizer: StorageOptimizer,
    backup: BackupRotator,
    running: tokio::sync::Mutex<()>,
    last_fired_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl MaintenanceCoordinator {
    pub fn new(
        handle: Arc<dyn ConnectionHandle>,
        provisioner: IndexProvisioner,
        janitor: DataJanitor,
        optimizer: StorageOptimizer,
        backup: BackupRotator,
    ) -> Self {
        Self {
            handle,
            provisioner,
            janitor,
            optimizer,
            backup,
            running: tokio::sync::Mutex::new(()),
            last_fired_at: parking_lot::Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &MaintenanceConfig,
        handle: Arc<dyn ConnectionHandle>,
        model: Arc<dyn CleanupModel>,
    ) -> Self {
        Self::new(
            handle.clone(),
            IndexProvisioner::new(handle.clone(), declared_indexes()),
            DataJanitor::new(model, config.archive_age_years),
            StorageOptimizer::new(handle.clone()),
            BackupRotator::new(handle, BackupSettings::from_config(config)),
        )
    }

    pub fn provisioner(&self) -> &IndexProvisioner {
        &self.provisioner
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// 执行一次 tick。已有 tick 在运行时直接跳过并返回 `None`。
    pub async fn run_tick(&self, cancel: &CancellationToken) -> Option<MaintenanceTick> {
        let Ok(_guard) = self.running.try_lock() else {
            warn!("上一次维护仍在运行，跳过本次触发");
            return None;
        };
        let fired_at = self.next_fired_at();
        info!(fired_at = %fired_at.to_rfc3339(), "维护开始");

        let mut tick = MaintenanceTick::started(fired_at);
        if let Err(err) = self.run_phases(&mut tick, cancel).await {
            error!(
                code = err.code(),
                message = err.message(),
                cause = err.cause_text().unwrap_or_default(),
                "维护失败"
            );
            tick.outcome = TickOutcome::Failed;
        }

        // 无论成功与否都释放连接，下一次语句会重新打开。
        let handle = self.handle.clone();
        if let Err(err) = run_blocking(move || handle.close()).await {
            error!(code = err.code(), error = %err, "释放数据库连接失败");
            tick.outcome = TickOutcome::Failed;
        }

        tick.finished_at = Some(Utc::now());
        match serde_json::to_value(&tick) {
            Ok(record) => info!(outcome = ?tick.outcome, tick = %record, "维护结束"),
            Err(_) => info!(outcome = ?tick.outcome, "维护结束"),
        }
        Some(tick)
    }

    async fn run_phases(
        &self,
        tick: &mut MaintenanceTick,
        cancel: &CancellationToken,
    ) -> Result<(), MaintenanceError> {
        if stop_requested(tick, cancel, "indexes") {
            return Ok(());
        }
        // 索引失败不阻断清理与备份，本次结果记为 partial。
        match timed(tick, "indexes", self.provisioner.ensure_all()).await {
            Ok(report) => tick.indexes = Some(report),
            Err(err) => {
                warn!(code = err.code(), error = %err, "索引检查失败，继续维护");
                tick.outcome = TickOutcome::Partial;
            }
        }

        if stop_requested(tick, cancel, "janitor") {
            return Ok(());
        }
        let fired_at = tick.fired_at;
        let report = timed(tick, "janitor", self.janitor.run(fired_at)).await?;
        tick.janitor = Some(report);

        for phase in OptimizePhase::ALL {
            if stop_requested(tick, cancel, phase.as_str()) {
                return Ok(());
            }
            timed(tick, phase.as_str(), self.optimizer.run(phase)).await?;
        }

        if stop_requested(tick, cancel, "backup") {
            return Ok(());
        }
        let outcome = timed(tick, "backup", self.backup.run()).await?;
        tick.backup = Some(outcome);

        if stop_requested(tick, cancel, "report") {
            return Ok(());
        }
        let stats = timed(tick, "report", self.optimizer.analyze_and_report()).await?;
        match serde_json::to_value(&stats) {
            Ok(record) => info!(page_kb = stats.page_kb(), stats = %record, "存储统计"),
            Err(_) => info!(page_kb = stats.page_kb(), "存储统计"),
        }
        tick.stats = Some(stats);
        Ok(())
    }

    /// 保证 firedAt 单调递增，系统时钟回拨时顺延 1ms。
    fn next_fired_at(&self) -> DateTime<Utc> {
        let mut last = self.last_fired_at.lock();
        let now = Utc::now();
        let fired_at = match *last {
            Some(previous) if now <= previous => previous + ChronoDuration::milliseconds(1),
            _ => now,
        };
        *last = Some(fired_at);
        fired_at
    }
}

fn stop_requested(tick: &mut MaintenanceTick, cancel: &CancellationToken, next_phase: &str) -> bool {
    if !cancel.is_cancelled() {
        return false;
    }
    info!(next_phase, "收到停止信号，在阶段边界结束维护");
    tick.outcome = TickOutcome::Partial;
    true
}

async fn timed<T, F>(
    tick: &mut MaintenanceTick,
    phase: &'static str,
    task: F,
) -> Result<T, MaintenanceError>
where
    F: Future<Output = Result<T, MaintenanceError>>,
{
    let started = Instant::now();
    let result = task.await;
    let duration_ms = started.elapsed().as_millis() as u64;
    let error_code = result.as_ref().err().map(MaintenanceError::code);
    info!(phase, ok = result.is_ok(), duration_ms, "维护阶段结束");
    tick.phases.push(PhaseResult {
        phase,
        ok: result.is_ok(),
        duration_ms,
        error_code,
    });
    result
}
