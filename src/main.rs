// 服务入口：读取配置、初始化日志、准备数据库与监控，然后进入定时维护循环。
use carnival_maintenance::config::MaintenanceConfig;
use carnival_maintenance::maintenance::{
    MaintenanceCoordinator, MaintenanceScheduler, QueryMonitor, SqlitePortalModel,
};
use carnival_maintenance::shutdown::spawn_shutdown_listener;
use carnival_maintenance::storage::schema::ensure_portal_tables;
use carnival_maintenance::storage::{ConnectionHandle, SqliteHandle};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 配置结构性错误直接终止启动，返回非零退出码。
    let config = MaintenanceConfig::from_env()?;
    init_tracing(&config);
    info!(
        database = %config.database_path.display(),
        backup_dir = %config.backup_dir.display(),
        cron = %config.cron,
        pool_max = config.pool.max,
        pool_min = config.pool.min,
        backups_enabled = config.backups_enabled,
        retention_days = config.retention_days,
        "维护服务启动"
    );

    let sqlite = Arc::new(SqliteHandle::from_config(&config));
    {
        let sqlite = sqlite.clone();
        let version = tokio::task::spawn_blocking(move || {
            sqlite.with_connection(|conn| {
                conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
            })
        })
        .await??;
        info!(sqlite_version = %version, "数据库已打开");
    }
    let handle: Arc<dyn ConnectionHandle> = sqlite;
    {
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || ensure_portal_tables(handle.as_ref())).await??;
    }

    // 监控安装失败不影响服务，只是不再产生慢查询事件。
    let monitor = QueryMonitor::new(handle.clone(), config.slow_threshold_ms);
    if let Err(err) = monitor.install() {
        error!(code = err.code(), error = %err, "查询监控安装失败，继续运行");
    }

    let model = Arc::new(SqlitePortalModel::new(handle.clone()));
    let coordinator = Arc::new(MaintenanceCoordinator::from_config(
        &config,
        handle.clone(),
        model,
    ));
    if let Err(err) = coordinator.provisioner().ensure_all().await {
        error!(code = err.code(), error = %err, "启动时索引检查失败");
    }
    {
        let handle = handle.clone();
        if let Err(err) = tokio::task::spawn_blocking(move || handle.close()).await? {
            error!(code = err.code(), error = %err, "释放数据库连接失败");
        }
    }

    let scheduler = MaintenanceScheduler::new(&config, coordinator)?;
    let shutdown = spawn_shutdown_listener();
    scheduler.run(shutdown).await;

    monitor.uninstall();
    info!("维护服务已退出");
    Ok(())
}

fn init_tracing(config: &MaintenanceConfig) {
    let default_level = config.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let directives = if config.log_sql {
        format!("{default_level},carnival_maintenance::storage=debug")
    } else {
        default_level
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .init();
}
