// 启动配置：从环境变量读取调优参数，解析失败或缺省时回落到默认值，只在结构性问题上报错。
use crate::core::error::MaintenanceError;
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_CRON: &str = "0 2 * * *";
pub const DEFAULT_DATABASE_PATH: &str = "./data/carnival-portal.db";
pub const DEFAULT_UPLOADS_ROOT: &str = "./public/uploads";
pub const BACKUP_PREFIX: &str = "database-backup";
pub const BACKUP_SUBDIR: &str = "backups";
/// 慢查询阈值固定为 100ms，不开放配置。
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 100;

const DEFAULT_POOL_MAX: u32 = 5;
const DEFAULT_POOL_MIN: u32 = 1;
const DEFAULT_ACQUIRE_MS: u64 = 30_000;
const DEFAULT_IDLE_MS: u64 = 10_000;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_ARCHIVE_AGE_YEARS: u32 = 2;
// 超出此值时按月回推会越过 chrono 的日期范围。
pub const MAX_ARCHIVE_AGE_YEARS: u32 = 10_000;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub max: u32,
    pub min: u32,
    pub acquire_ms: u64,
    pub idle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_POOL_MAX,
            min: DEFAULT_POOL_MIN,
            acquire_ms: DEFAULT_ACQUIRE_MS,
            idle_ms: DEFAULT_IDLE_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceConfig {
    pub cron: String,
    pub timezone: Option<String>,
    pub pool: PoolConfig,
    pub query_timeout_ms: u64,
    pub slow_threshold_ms: u64,
    pub backups_enabled: bool,
    pub backup_dir: PathBuf,
    pub backup_prefix: String,
    pub retention_days: u64,
    pub archive_age_years: u32,
    pub database_path: PathBuf,
    pub log_sql: bool,
    pub log_level: String,
}

impl MaintenanceConfig {
    pub fn from_env() -> Result<Self, MaintenanceError> {
        let vars = std::env::vars().collect::<HashMap<_, _>>();
        Self::from_env_map(&vars)
    }

    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self, MaintenanceError> {
        let pool = PoolConfig {
            max: parse_strict(vars, "SQLITE_MAX_POOL_SIZE", DEFAULT_POOL_MAX),
            min: parse_strict(vars, "SQLITE_MIN_POOL_SIZE", DEFAULT_POOL_MIN),
            acquire_ms: parse_strict(vars, "SQLITE_ACQUIRE_TIMEOUT", DEFAULT_ACQUIRE_MS),
            idle_ms: parse_strict(vars, "SQLITE_IDLE_TIMEOUT", DEFAULT_IDLE_MS),
        };
        if pool.min > pool.max {
            return Err(MaintenanceError::config(
                "SQLITE_MIN_POOL_SIZE",
                format!("min pool size {} exceeds max {}", pool.min, pool.max),
            ));
        }

        let cron = non_empty(vars, "MAINTENANCE_CRON").unwrap_or_else(|| DEFAULT_CRON.to_string());
        if let Err(err) = crate::services::maintenance::scheduler::parse_schedule(&cron) {
            return Err(MaintenanceError::config("MAINTENANCE_CRON", err.to_string()));
        }
        let timezone = non_empty(vars, "MAINTENANCE_TZ");
        if let Some(tz) = timezone.as_deref() {
            if Tz::from_str(tz).is_err() {
                return Err(MaintenanceError::config(
                    "MAINTENANCE_TZ",
                    format!("unknown time zone {tz}"),
                ));
            }
        }

        let uploads_root = non_empty(vars, "UPLOADS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOADS_ROOT));
        let uploads_root = absolutize(&uploads_root).map_err(|err| {
            MaintenanceError::config("UPLOADS_ROOT", format!("cannot resolve path: {err}"))
        })?;
        let database_path = non_empty(vars, "DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));

        // NODE_ENV 为准，APP_ENV 仅在其缺失时兜底。
        let environment = non_empty(vars, "NODE_ENV").or_else(|| non_empty(vars, "APP_ENV"));
        let log_sql = environment.as_deref() != Some("production");

        Ok(Self {
            cron,
            timezone,
            pool,
            query_timeout_ms: parse_strict(vars, "SQLITE_QUERY_TIMEOUT", DEFAULT_QUERY_TIMEOUT_MS),
            slow_threshold_ms: SLOW_QUERY_THRESHOLD_MS,
            backups_enabled: vars.get("BACKUP_ENABLED").map(String::as_str) == Some("true"),
            backup_dir: uploads_root.join(BACKUP_SUBDIR),
            backup_prefix: BACKUP_PREFIX.to_string(),
            retention_days: parse_strict(vars, "BACKUP_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            archive_age_years: parse_strict(vars, "ARCHIVE_AGE_YEARS", DEFAULT_ARCHIVE_AGE_YEARS)
                .min(MAX_ARCHIVE_AGE_YEARS),
            database_path,
            log_sql,
            log_level: non_empty(vars, "LOG_LEVEL")
                .map(|value| value.to_lowercase())
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

/// 严格整数解析：只接受纯数字，任何多余字符都视为无效并回落到默认值。
fn parse_strict<T: FromStr + Copy>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
    let Some(raw) = vars.get(key) else {
        return default;
    };
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return default;
    }
    raw.parse::<T>().unwrap_or(default)
}

fn non_empty(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    let relative = path.strip_prefix(".").unwrap_or(path);
    Ok(cwd.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = MaintenanceConfig::from_env_map(&HashMap::new()).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.query_timeout_ms, 30_000);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.archive_age_years, 2);
        assert_eq!(config.cron, "0 2 * * *");
        assert_eq!(config.slow_threshold_ms, 100);
        assert!(!config.backups_enabled);
        assert!(config.log_sql);
        assert_eq!(config.backup_prefix, BACKUP_PREFIX);
        assert!(config.backup_dir.is_absolute());
        assert!(config.backup_dir.ends_with("public/uploads/backups"));
    }

    #[test]
    fn numeric_fields_are_parsed_strictly() {
        let config = MaintenanceConfig::from_env_map(&vars(&[
            ("SQLITE_MAX_POOL_SIZE", "12"),
            ("SQLITE_ACQUIRE_TIMEOUT", "15s"),
            ("SQLITE_IDLE_TIMEOUT", " 500"),
            ("SQLITE_QUERY_TIMEOUT", "-1"),
            ("BACKUP_RETENTION_DAYS", "7"),
        ]))
        .unwrap();
        assert_eq!(config.pool.max, 12);
        assert_eq!(config.pool.acquire_ms, 30_000);
        assert_eq!(config.pool.idle_ms, 10_000);
        assert_eq!(config.query_timeout_ms, 30_000);
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn backups_enabled_only_for_literal_true() {
        for (value, expected) in [("true", true), ("TRUE", false), ("1", false), ("yes", false)] {
            let config =
                MaintenanceConfig::from_env_map(&vars(&[("BACKUP_ENABLED", value)])).unwrap();
            assert_eq!(config.backups_enabled, expected, "BACKUP_ENABLED={value}");
        }
    }

    #[test]
    fn production_disables_sql_logging() {
        let config =
            MaintenanceConfig::from_env_map(&vars(&[("NODE_ENV", "production")])).unwrap();
        assert!(!config.log_sql);
        let config = MaintenanceConfig::from_env_map(&vars(&[
            ("NODE_ENV", "production"),
            ("APP_ENV", "staging"),
        ]))
        .unwrap();
        assert!(!config.log_sql);
        let config =
            MaintenanceConfig::from_env_map(&vars(&[("APP_ENV", "production")])).unwrap();
        assert!(!config.log_sql);
        let config = MaintenanceConfig::from_env_map(&vars(&[
            ("NODE_ENV", "development"),
            ("APP_ENV", "production"),
        ]))
        .unwrap();
        assert!(config.log_sql);
    }

    #[test]
    fn huge_archive_age_is_clamped() {
        let config =
            MaintenanceConfig::from_env_map(&vars(&[("ARCHIVE_AGE_YEARS", "400000000")])).unwrap();
        assert_eq!(config.archive_age_years, MAX_ARCHIVE_AGE_YEARS);
        let cutoff = crate::services::maintenance::janitor::archive_cutoff(
            chrono::Utc::now(),
            config.archive_age_years,
        );
        assert!(cutoff.is_ok());
    }

    #[test]
    fn structural_problems_fail_with_field() {
        let err = MaintenanceConfig::from_env_map(&vars(&[("MAINTENANCE_CRON", "every night")]))
            .unwrap_err();
        assert_eq!(err.code(), crate::core::error::CONFIG_ERROR);
        assert!(err.message().starts_with("MAINTENANCE_CRON"));

        let err = MaintenanceConfig::from_env_map(&vars(&[
            ("SQLITE_MAX_POOL_SIZE", "2"),
            ("SQLITE_MIN_POOL_SIZE", "4"),
        ]))
        .unwrap_err();
        assert!(err.message().starts_with("SQLITE_MIN_POOL_SIZE"));

        let err = MaintenanceConfig::from_env_map(&vars(&[("MAINTENANCE_TZ", "Mars/Olympus")]))
            .unwrap_err();
        assert!(err.message().starts_with("MAINTENANCE_TZ"));
    }

    #[test]
    fn absolute_uploads_root_is_kept() {
        let config =
            MaintenanceConfig::from_env_map(&vars(&[("UPLOADS_ROOT", "/srv/portal/uploads")]))
                .unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/srv/portal/uploads/backups"));
    }
}
