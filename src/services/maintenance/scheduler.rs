// 定时调度：按 cron 表达式触发维护 tick，tick 在调度循环内串行执行，运行期间错过的触发点直接跳过。
use crate::core::config::MaintenanceConfig;
use crate::core::error::MaintenanceError;
use crate::services::maintenance::coordinator::MaintenanceCoordinator;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 单次睡眠上限，避免系统时钟调整后长时间错过触发点。
const MAX_SLEEP: Duration = Duration::from_secs(60);
const MAX_COUNTED_MISSES: usize = 10_000;

/// 5 段 crontab 自动补秒字段，6/7 段原样交给 cron 解析。
pub fn normalize_cron_expr(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("cron expression empty"));
    }
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 {
        Ok(format!("0 {}", parts.join(" ")))
    } else {
        Ok(parts.join(" "))
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(expr)?;
    Schedule::from_str(&normalized).map_err(|err| anyhow!("invalid cron expression {expr:?}: {err}"))
}

/// 在指定时区内求 `after` 之后的下一个触发点，未指定时区按 UTC。
pub fn next_fire_after(
    schedule: &Schedule,
    timezone: Option<Tz>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match timezone {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    }
}

/// 统计 `(after, until]` 内的触发点个数，用于记录被跳过的触发。
pub fn fires_between(
    schedule: &Schedule,
    timezone: Option<Tz>,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> usize {
    let mut count = 0;
    let mut cursor = after;
    while count < MAX_COUNTED_MISSES {
        match next_fire_after(schedule, timezone, cursor) {
            Some(next) if next <= until => {
                count += 1;
                cursor = next;
            }
            _ => break,
        }
    }
    count
}

pub struct MaintenanceScheduler {
    schedule: Schedule,
    timezone: Option<Tz>,
    coordinator: Arc<MaintenanceCoordinator>,
}

impl MaintenanceScheduler {
    pub fn new(
        config: &MaintenanceConfig,
        coordinator: Arc<MaintenanceCoordinator>,
    ) -> Result<Self, MaintenanceError> {
        let schedule = parse_schedule(&config.cron)
            .map_err(|err| MaintenanceError::config("MAINTENANCE_CRON", err.to_string()))?;
        let timezone = match config.timezone.as_deref() {
            Some(name) => Some(Tz::from_str(name).map_err(|_| {
                MaintenanceError::config("MAINTENANCE_TZ", format!("unknown time zone {name}"))
            })?),
            None => None,
        };
        Ok(Self {
            schedule,
            timezone,
            coordinator,
        })
    }

    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_fire_after(&self.schedule, self.timezone, after)
    }

    /// 运行调度循环直到收到停止信号。正在执行的 tick 会在阶段边界结束并释放连接后再返回。
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(timezone = ?self.timezone, "维护调度已启动");
        loop {
            let Some(next) = self.next_fire_after(Utc::now()) else {
                warn!("cron 表达式没有后续触发时间，调度停止");
                return;
            };
            info!(next_fire = %next.to_rfc3339(), "等待下一次维护");
            if !self.wait_until(next, &shutdown).await {
                info!("维护调度已停止");
                return;
            }

            if let Some(tick) = self.coordinator.run_tick(&shutdown).await {
                let missed = fires_between(&self.schedule, self.timezone, next, Utc::now());
                if missed > 0 {
                    warn!(
                        missed,
                        duration_ms = tick
                            .finished_at
                            .map(|end| (end - tick.fired_at).num_milliseconds())
                            .unwrap_or(0),
                        "维护耗时超过触发间隔，已跳过期间的触发点"
                    );
                }
            }
            if shutdown.is_cancelled() {
                info!("维护调度已停止");
                return;
            }
        }
    }

    /// 睡到 `deadline`；期间收到停止信号返回 false。
    async fn wait_until(&self, deadline: DateTime<Utc>, shutdown: &CancellationToken) -> bool {
        loop {
            let remaining = match (deadline - Utc::now()).to_std() {
                Ok(remaining) if !remaining.is_zero() => remaining,
                _ => return true,
            };
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = sleep(remaining.min(MAX_SLEEP)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expression_gets_seconds() {
        assert_eq!(normalize_cron_expr(" 0 2 * * * ").unwrap(), "0 0 2 * * *");
        assert_eq!(normalize_cron_expr("30 0 2 * * *").unwrap(), "30 0 2 * * *");
        assert!(normalize_cron_expr("   ").is_err());
    }

    #[test]
    fn default_schedule_fires_daily_at_two() {
        let schedule = parse_schedule("0 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 16, 2, 0, 0).unwrap();
        let next = next_fire_after(&schedule, None, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 17, 2, 0, 0).unwrap());
    }

    #[test]
    fn timezone_shifts_fire_time() {
        let schedule = parse_schedule("0 2 * * *").unwrap();
        let tz = Tz::from_str("Australia/Sydney").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let next = next_fire_after(&schedule, Some(tz), after).unwrap();
        assert_eq!(next.with_timezone(&tz).hour(), 2);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 16, 15, 0, 0).unwrap());
    }

    #[test]
    fn counts_fires_skipped_by_a_long_tick() {
        let schedule = parse_schedule("0 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 16, 2, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2026, 10, 16, 5, 30, 0).unwrap();
        assert_eq!(fires_between(&schedule, None, after, until), 3);
        assert_eq!(fires_between(&schedule, None, after, after), 0);
        let on_the_hour = Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap();
        assert_eq!(fires_between(&schedule, None, after, on_the_hour), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_schedule("every night").is_err());
        assert!(parse_schedule("0 25 * * *").is_err());
    }
}
