// 维护引擎统一错误：code 对应错误分类标签，message 描述出错的阶段或对象，source 保留根因。
use std::fmt;

pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
pub const INDEX_PROVISIONING_ERROR: &str = "INDEX_PROVISIONING_ERROR";
pub const OPTIMIZE_ERROR: &str = "OPTIMIZE_ERROR";
pub const MONITOR_SETUP_ERROR: &str = "MONITOR_SETUP_ERROR";
pub const JANITOR_ERROR: &str = "JANITOR_ERROR";
pub const BACKUP_ERROR: &str = "BACKUP_ERROR";
pub const BACKUP_RETENTION_WARNING: &str = "BACKUP_RETENTION_WARNING";
pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";

#[derive(Debug)]
pub struct MaintenanceError {
    code: &'static str,
    message: String,
    source: Option<anyhow::Error>,
}

impl MaintenanceError {
    fn new(code: &'static str, message: String, source: Option<anyhow::Error>) -> Self {
        Self {
            code,
            message,
            source,
        }
    }

    pub fn config(field: &str, reason: impl Into<String>) -> Self {
        Self::new(CONFIG_ERROR, format!("{field}: {}", reason.into()), None)
    }

    pub fn index_provisioning(index_name: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            INDEX_PROVISIONING_ERROR,
            format!("failed to ensure index {index_name}"),
            Some(cause.into()),
        )
    }

    pub fn optimize(phase: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            OPTIMIZE_ERROR,
            format!("optimizer phase {phase} failed"),
            Some(cause.into()),
        )
    }

    pub fn monitor_setup(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        Self::new(MONITOR_SETUP_ERROR, message.into(), cause)
    }

    pub fn janitor(op: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            JANITOR_ERROR,
            format!("cleanup operation {op} failed"),
            Some(cause.into()),
        )
    }

    pub fn backup(message: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(BACKUP_ERROR, message.into(), Some(cause.into()))
    }

    pub fn retention_warning(file: &str, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(
            BACKUP_RETENTION_WARNING,
            format!("failed to remove expired backup {file}"),
            Some(cause.into()),
        )
    }

    pub fn connection(message: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        Self::new(CONNECTION_ERROR, message.into(), cause)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 根因的单行描述，便于写入结构化日志字段。
    pub fn cause_text(&self) -> Option<String> {
        self.source.as_ref().map(|err| format!("{err:#}"))
    }
}

impl fmt::Display for MaintenanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source.as_ref() {
            Some(source) => write!(f, "{}: {}: {source:#}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for MaintenanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|err| {
            let source: &(dyn std::error::Error + 'static) = err.as_ref();
            source
        })
    }
}
