// SQLite 连接句柄：惰性打开单个连接，串行执行语句并在连接/查询前后触发钩子。
use crate::core::config::MaintenanceConfig;
use crate::core::error::MaintenanceError;
use crate::storage::{
    ConnectionHandle, HookEvent, HookHandler, HookId, HookPayload, QueryContext, QueryKind,
    QueryOutput, QueryRow, MAX_HOOKS_PER_EVENT,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SQL_SUMMARY_CHARS: usize = 120;

#[derive(Debug, Clone)]
pub struct HandleOptions {
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
    pub idle_timeout: Duration,
    pub log_sql: bool,
}

impl HandleOptions {
    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self {
            acquire_timeout: Duration::from_millis(config.pool.acquire_ms),
            busy_timeout: Duration::from_millis(config.query_timeout_ms),
            idle_timeout: Duration::from_millis(config.pool.idle_ms),
            log_sql: config.log_sql,
        }
    }
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10),
            log_sql: false,
        }
    }
}

struct ConnectionSlot {
    conn: Option<Connection>,
    last_used: Instant,
}

struct HookEntry {
    id: HookId,
    event: HookEvent,
    handler: HookHandler,
}

pub struct SqliteHandle {
    db_path: PathBuf,
    options: HandleOptions,
    slot: Mutex<ConnectionSlot>,
    hooks: RwLock<Vec<HookEntry>>,
    next_hook_id: AtomicU64,
}

impl SqliteHandle {
    pub fn new(db_path: impl Into<PathBuf>, options: HandleOptions) -> Self {
        Self {
            db_path: db_path.into(),
            options,
            slot: Mutex::new(ConnectionSlot {
                conn: None,
                last_used: Instant::now(),
            }),
            hooks: RwLock::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &MaintenanceConfig) -> Self {
        Self::new(
            config.database_path.clone(),
            HandleOptions::from_config(config),
        )
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().conn.is_some()
    }

    /// 直接访问底层连接（不触发查询钩子），用于注册自定义函数等连接级设置。
    pub fn with_connection<T>(
        &self,
        run: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, MaintenanceError> {
        let mut slot = self.acquire()?;
        self.ensure_open(&mut slot)?;
        let conn = slot
            .conn
            .as_ref()
            .ok_or_else(|| MaintenanceError::connection("connection unavailable", None))?;
        let result = run(conn).map_err(|err| {
            MaintenanceError::connection("connection callback failed", Some(err.into()))
        });
        slot.last_used = Instant::now();
        result
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ConnectionSlot>, MaintenanceError> {
        self.slot
            .try_lock_for(self.options.acquire_timeout)
            .ok_or_else(|| {
                MaintenanceError::connection(
                    format!(
                        "timed out after {}ms waiting for database handle",
                        self.options.acquire_timeout.as_millis()
                    ),
                    None,
                )
            })
    }

    fn ensure_db_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self, slot: &mut ConnectionSlot) -> Result<(), MaintenanceError> {
        if slot.conn.is_some() && slot.last_used.elapsed() > self.options.idle_timeout {
            debug!(
                idle_ms = slot.last_used.elapsed().as_millis() as u64,
                "closing idle database connection"
            );
            self.disconnect(slot)?;
        }
        if slot.conn.is_some() {
            return Ok(());
        }
        self.fire_connection(HookEvent::BeforeConnect);
        self.ensure_db_dir().map_err(|err| {
            MaintenanceError::connection(
                format!("cannot create directory for {}", self.db_path.display()),
                Some(err.into()),
            )
        })?;
        let conn = Connection::open(&self.db_path).map_err(|err| {
            MaintenanceError::connection(
                format!("cannot open {}", self.db_path.display()),
                Some(err.into()),
            )
        })?;
        conn.busy_timeout(self.options.busy_timeout).map_err(|err| {
            MaintenanceError::connection("cannot set busy timeout", Some(err.into()))
        })?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        slot.conn = Some(conn);
        slot.last_used = Instant::now();
        self.fire_connection(HookEvent::AfterConnect);
        Ok(())
    }

    fn disconnect(&self, slot: &mut ConnectionSlot) -> Result<(), MaintenanceError> {
        let Some(conn) = slot.conn.take() else {
            return Ok(());
        };
        self.fire_connection(HookEvent::BeforeDisconnect);
        let result = conn.close().map_err(|(_conn, err)| {
            MaintenanceError::connection("failed to close database connection", Some(err.into()))
        });
        self.fire_connection(HookEvent::AfterDisconnect);
        result
    }

    fn handlers_for(&self, event: HookEvent) -> Vec<HookHandler> {
        self.hooks
            .read()
            .iter()
            .filter(|entry| entry.event == event)
            .map(|entry| entry.handler.clone())
            .collect()
    }

    fn fire_connection(&self, event: HookEvent) {
        let handlers = self.handlers_for(event);
        if handlers.is_empty() {
            return;
        }
        let mut payload = HookPayload::Connection {
            db_path: &self.db_path,
        };
        for handler in handlers {
            handler(event, &mut payload);
        }
    }

    fn fire_query(&self, event: HookEvent, ctx: &mut QueryContext) {
        let handlers = self.handlers_for(event);
        if handlers.is_empty() {
            return;
        }
        let mut payload = HookPayload::Query(ctx);
        for handler in handlers {
            handler(event, &mut payload);
        }
    }

    fn run_query<T>(
        &self,
        sql: &str,
        kind: QueryKind,
        run: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, MaintenanceError> {
        let mut slot = self.acquire()?;
        self.ensure_open(&mut slot)?;
        let conn = slot
            .conn
            .as_ref()
            .ok_or_else(|| MaintenanceError::connection("connection unavailable", None))?;
        if self.options.log_sql {
            debug!(sql = %sql, "executing statement");
        }
        let mut ctx = QueryContext {
            sql: sql.to_string(),
            kind,
            started_at: None,
            failed: false,
        };
        self.fire_query(HookEvent::BeforeQuery, &mut ctx);
        let result = run(conn);
        ctx.failed = result.is_err();
        self.fire_query(HookEvent::AfterQuery, &mut ctx);
        slot.last_used = Instant::now();
        result.map_err(|err| {
            MaintenanceError::connection(
                format!("statement failed: {}", summarize_sql(sql)),
                Some(err.into()),
            )
        })
    }
}

impl ConnectionHandle for SqliteHandle {
    fn execute(&self, sql: &str, kind: QueryKind) -> Result<QueryOutput, MaintenanceError> {
        match kind {
            QueryKind::Raw => self
                .run_query(sql, kind, |conn| conn.execute_batch(sql))
                .map(|_| QueryOutput::Ack),
            QueryKind::Select => self
                .run_query(sql, kind, |conn| select_rows(conn, sql))
                .map(QueryOutput::Rows),
        }
    }

    fn execute_update(&self, sql: &str, params: &[SqlValue]) -> Result<usize, MaintenanceError> {
        self.run_query(sql, QueryKind::Raw, |conn| {
            conn.execute(sql, params_from_iter(params.iter()))
        })
    }

    fn register_hook(
        &self,
        event: HookEvent,
        handler: HookHandler,
    ) -> Result<HookId, MaintenanceError> {
        let mut hooks = self.hooks.write();
        let registered = hooks.iter().filter(|entry| entry.event == event).count();
        if registered >= MAX_HOOKS_PER_EVENT {
            return Err(MaintenanceError::monitor_setup(
                format!(
                    "hook limit {MAX_HOOKS_PER_EVENT} reached for {}",
                    event.as_str()
                ),
                None,
            ));
        }
        let id = HookId(self.next_hook_id.fetch_add(1, Ordering::SeqCst));
        hooks.push(HookEntry { id, event, handler });
        Ok(id)
    }

    fn unregister_hook(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|entry| entry.id != id);
        hooks.len() != before
    }

    fn storage_path(&self) -> &Path {
        &self.db_path
    }

    fn close(&self) -> Result<(), MaintenanceError> {
        let mut slot = self.acquire()?;
        let result = self.disconnect(&mut slot);
        if let Err(err) = result.as_ref() {
            warn!(code = err.code(), "关闭数据库连接失败: {err}");
        }
        result
    }
}

fn select_rows(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<QueryRow>> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect::<Vec<_>>();
    let mut rows = stmt.query([])?;
    let mut output = Vec::new();
    while let Some(row) = rows.next()? {
        let mut item = HashMap::with_capacity(columns.len());
        for (index, name) in columns.iter().enumerate() {
            item.insert(name.clone(), value_ref_to_json(row.get_ref(index)?));
        }
        output.push(item);
    }
    Ok(output)
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
    }
}

fn summarize_sql(sql: &str) -> String {
    let single_line = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= SQL_SUMMARY_CHARS {
        return single_line;
    }
    let mut output = single_line
        .chars()
        .take(SQL_SUMMARY_CHARS)
        .collect::<String>();
    output.push_str("...");
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hook_handler;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn temp_handle() -> (tempfile::TempDir, SqliteHandle) {
        let dir = tempfile::tempdir().unwrap();
        let handle = SqliteHandle::new(dir.path().join("portal.db"), HandleOptions::default());
        (dir, handle)
    }

    #[test]
    fn opens_lazily_and_reopens_after_close() {
        let (_dir, handle) = temp_handle();
        assert!(!handle.is_open());
        handle
            .execute("CREATE TABLE Clubs (id INTEGER PRIMARY KEY)", QueryKind::Raw)
            .unwrap();
        assert!(handle.is_open());
        handle.close().unwrap();
        assert!(!handle.is_open());
        let rows = handle
            .execute("SELECT COUNT(*) AS total FROM Clubs", QueryKind::Select)
            .unwrap()
            .into_rows();
        assert_eq!(rows[0]["total"], Value::from(0));
    }

    #[test]
    fn connection_hooks_fire_on_open_and_close() {
        let (_dir, handle) = temp_handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for event in [
            HookEvent::BeforeConnect,
            HookEvent::AfterConnect,
            HookEvent::BeforeDisconnect,
            HookEvent::AfterDisconnect,
        ] {
            let seen = seen.clone();
            handle
                .register_hook(
                    event,
                    hook_handler(move |event, _payload| {
                        seen.lock().push(event.as_str());
                    }),
                )
                .unwrap();
        }
        handle.execute("SELECT 1", QueryKind::Select).unwrap();
        handle.close().unwrap();
        assert_eq!(
            *seen.lock(),
            vec![
                "before_connect",
                "after_connect",
                "before_disconnect",
                "after_disconnect"
            ]
        );
    }

    #[test]
    fn raw_connection_access_skips_query_hooks() {
        let (_dir, handle) = temp_handle();
        let queries = Arc::new(AtomicUsize::new(0));
        for event in [HookEvent::BeforeQuery, HookEvent::AfterQuery] {
            let queries = queries.clone();
            handle
                .register_hook(
                    event,
                    hook_handler(move |_, _| {
                        queries.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        let version = handle
            .with_connection(|conn| {
                conn.query_row("SELECT sqlite_version()", [], |row| row.get::<_, String>(0))
            })
            .unwrap();
        assert!(version.starts_with('3'));
        assert!(handle.is_open());
        assert_eq!(queries.load(Ordering::SeqCst), 0);

        let err = handle
            .with_connection(|conn| conn.execute_batch("SELECT * FROM NoSuchTable"))
            .unwrap_err();
        assert_eq!(err.code(), crate::core::error::CONNECTION_ERROR);
    }

    #[test]
    fn query_hooks_share_context_and_see_failures() {
        let (_dir, handle) = temp_handle();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        handle
            .register_hook(
                HookEvent::BeforeQuery,
                hook_handler(|_event, payload| {
                    if let HookPayload::Query(ctx) = payload {
                        ctx.started_at = Some(Instant::now());
                    }
                }),
            )
            .unwrap();
        handle
            .register_hook(
                HookEvent::AfterQuery,
                hook_handler(move |_event, payload| {
                    if let HookPayload::Query(ctx) = payload {
                        assert!(ctx.started_at.is_some());
                        if ctx.failed {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }),
            )
            .unwrap();
        handle.execute("SELECT 1", QueryKind::Select).unwrap();
        let err = handle
            .execute("SELECT * FROM MissingTable", QueryKind::Select)
            .unwrap_err();
        assert_eq!(err.code(), crate::core::error::CONNECTION_ERROR);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_limit_is_enforced_and_unregister_frees_a_slot() {
        let (_dir, handle) = temp_handle();
        let mut ids = Vec::new();
        for _ in 0..MAX_HOOKS_PER_EVENT {
            ids.push(
                handle
                    .register_hook(HookEvent::AfterQuery, hook_handler(|_, _| {}))
                    .unwrap(),
            );
        }
        assert!(handle
            .register_hook(HookEvent::AfterQuery, hook_handler(|_, _| {}))
            .is_err());
        assert!(handle.unregister_hook(ids[0]));
        assert!(!handle.unregister_hook(ids[0]));
        assert!(handle
            .register_hook(HookEvent::AfterQuery, hook_handler(|_, _| {}))
            .is_ok());
    }

    #[test]
    fn update_reports_affected_rows() {
        let (_dir, handle) = temp_handle();
        handle
            .execute(
                "CREATE TABLE Sponsors (id INTEGER PRIMARY KEY, isActive INTEGER);
                 INSERT INTO Sponsors (isActive) VALUES (1), (1), (0);",
                QueryKind::Raw,
            )
            .unwrap();
        let changed = handle
            .execute_update(
                "UPDATE Sponsors SET isActive = ?1 WHERE isActive = 1",
                &[SqlValue::Integer(0)],
            )
            .unwrap();
        assert_eq!(changed, 2);
    }

    #[test]
    fn idle_connection_is_recycled() {
        let dir = tempfile::tempdir().unwrap();
        let options = HandleOptions {
            idle_timeout: Duration::from_millis(0),
            ..HandleOptions::default()
        };
        let handle = SqliteHandle::new(dir.path().join("portal.db"), options);
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        handle
            .register_hook(
                HookEvent::AfterConnect,
                hook_handler(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        handle.execute("SELECT 1", QueryKind::Select).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        handle.execute("SELECT 1", QueryKind::Select).unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn long_sql_is_summarized() {
        let sql = format!("SELECT {}", "x, ".repeat(100));
        let summary = summarize_sql(&sql);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), SQL_SUMMARY_CHARS + 3);
    }
}
