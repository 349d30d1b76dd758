// 存储模块：维护引擎与嵌入式 SQLite 之间唯一的连接句柄契约，以及门户表结构引导。

pub mod schema;
mod sqlite;

use crate::core::error::MaintenanceError;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub use sqlite::{HandleOptions, SqliteHandle};

/// 单个事件允许注册的钩子上限。
pub const MAX_HOOKS_PER_EVENT: usize = 16;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// 不返回结果集的语句（DDL、PRAGMA、VACUUM 等）。
    Raw,
    Select,
}

pub type QueryRow = HashMap<String, Value>;

#[derive(Debug, Clone)]
pub enum QueryOutput {
    Ack,
    Rows(Vec<QueryRow>),
}

impl QueryOutput {
    pub fn into_rows(self) -> Vec<QueryRow> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Ack => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeConnect,
    AfterConnect,
    BeforeDisconnect,
    AfterDisconnect,
    BeforeQuery,
    AfterQuery,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeConnect => "before_connect",
            HookEvent::AfterConnect => "after_connect",
            HookEvent::BeforeDisconnect => "before_disconnect",
            HookEvent::AfterDisconnect => "after_disconnect",
            HookEvent::BeforeQuery => "before_query",
            HookEvent::AfterQuery => "after_query",
        }
    }
}

/// 单条语句的执行上下文，before/after 查询钩子共享同一个实例。
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub sql: String,
    pub kind: QueryKind,
    pub started_at: Option<Instant>,
    pub failed: bool,
}

pub enum HookPayload<'a> {
    Connection { db_path: &'a Path },
    Query(&'a mut QueryContext),
}

pub type HookHandler = Arc<dyn Fn(HookEvent, &mut HookPayload<'_>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// 把闭包包装成钩子，闭包签名由这里的约束推导。
pub fn hook_handler<F>(handler: F) -> HookHandler
where
    F: Fn(HookEvent, &mut HookPayload<'_>) + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// 连接句柄：单写者，所有维护组件都通过它串行访问数据库。
///
/// 钩子在持有句柄锁时同步执行，钩子内部不得再调用句柄。
pub trait ConnectionHandle: Send + Sync {
    fn execute(&self, sql: &str, kind: QueryKind) -> Result<QueryOutput, MaintenanceError>;

    /// 参数化写语句，返回受影响行数。
    fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<usize, MaintenanceError>;

    fn register_hook(
        &self,
        event: HookEvent,
        handler: HookHandler,
    ) -> Result<HookId, MaintenanceError>;

    fn unregister_hook(&self, id: HookId) -> bool;

    fn storage_path(&self) -> &Path;

    fn close(&self) -> Result<(), MaintenanceError>;
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn row_i64(row: &QueryRow, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

pub fn row_str<'a>(row: &'a QueryRow, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}
