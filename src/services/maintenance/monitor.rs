// 查询监控：注册连接生命周期与查询前后钩子，超过阈值的查询生成慢查询事件。
use crate::core::error::MaintenanceError;
use crate::storage::{hook_handler, ConnectionHandle, HookEvent, HookHandler, HookId, HookPayload};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{info, warn};

const SLOW_QUERY_CHANNEL_SIZE: usize = 256;
const REDACTED_SQL_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryEvent {
    pub sql: String,
    pub duration_ms: u64,
    pub captured_at: DateTime<Utc>,
}

pub struct QueryMonitor {
    handle: Arc<dyn ConnectionHandle>,
    threshold_ms: u64,
    sender: broadcast::Sender<SlowQueryEvent>,
    installed: Mutex<Vec<HookId>>,
}

impl QueryMonitor {
    pub fn new(handle: Arc<dyn ConnectionHandle>, threshold_ms: u64) -> Self {
        let (sender, _) = broadcast::channel(SLOW_QUERY_CHANNEL_SIZE);
        Self {
            handle,
            threshold_ms,
            sender,
            installed: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlowQueryEvent> {
        self.sender.subscribe()
    }

    pub fn is_installed(&self) -> bool {
        !self.installed.lock().is_empty()
    }

    /// 安装全部钩子；重复调用不会重复注册。任一注册失败时回滚已注册的钩子。
    pub fn install(&self) -> Result<(), MaintenanceError> {
        let mut installed = self.installed.lock();
        if !installed.is_empty() {
            return Ok(());
        }
        let mut registered = Vec::new();
        for (event, handler) in self.build_hooks() {
            match self.handle.register_hook(event, handler) {
                Ok(id) => registered.push(id),
                Err(err) => {
                    for id in registered {
                        self.handle.unregister_hook(id);
                    }
                    return Err(MaintenanceError::monitor_setup(
                        format!("failed to register {} hook", event.as_str()),
                        Some(err.into()),
                    ));
                }
            }
        }
        *installed = registered;
        info!(threshold_ms = self.threshold_ms, "查询监控已安装");
        Ok(())
    }

    pub fn uninstall(&self) {
        let mut installed = self.installed.lock();
        for id in installed.drain(..) {
            self.handle.unregister_hook(id);
        }
    }

    fn build_hooks(&self) -> Vec<(HookEvent, HookHandler)> {
        let lifecycle = hook_handler(|event, payload| {
            if let HookPayload::Connection { db_path } = payload {
                info!(event = event.as_str(), path = %db_path.display(), "database lifecycle");
            }
        });
        let before_query = hook_handler(|_event, payload| {
            if let HookPayload::Query(ctx) = payload {
                ctx.started_at = Some(Instant::now());
            }
        });
        let threshold_ms = self.threshold_ms;
        let sender = self.sender.clone();
        let after_query = hook_handler(move |_event, payload| {
            let HookPayload::Query(ctx) = payload else {
                return;
            };
            let Some(started_at) = ctx.started_at else {
                return;
            };
            let duration_ms = started_at.elapsed().as_millis() as u64;
            if duration_ms <= threshold_ms {
                return;
            }
            let event = SlowQueryEvent {
                sql: redact_sql(&ctx.sql),
                duration_ms,
                captured_at: Utc::now(),
            };
            warn!(
                target: "carnival_maintenance::slow_query",
                sql = %event.sql,
                duration_ms = event.duration_ms,
                failed = ctx.failed,
                "slow query"
            );
            // 没有订阅者时发送失败是正常情况。
            let _ = sender.send(event);
        });
        vec![
            (HookEvent::BeforeConnect, lifecycle.clone()),
            (HookEvent::AfterConnect, lifecycle.clone()),
            (HookEvent::BeforeDisconnect, lifecycle.clone()),
            (HookEvent::AfterDisconnect, lifecycle),
            (HookEvent::BeforeQuery, before_query),
            (HookEvent::AfterQuery, after_query),
        ]
    }
}

/// 把字符串字面量替换为 `'?'`，折叠空白并截断过长语句。
pub fn redact_sql(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut last_space = false;
    while let Some(ch) = chars.next() {
        if ch == '\'' {
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                    }
                    Some('\'') | None => break,
                    Some(_) => {}
                }
            }
            output.push_str("'?'");
            last_space = false;
            continue;
        }
        if ch.is_whitespace() {
            if !last_space && !output.is_empty() {
                output.push(' ');
            }
            last_space = true;
            continue;
        }
        output.push(ch);
        last_space = false;
    }
    let trimmed = output.trim_end();
    if trimmed.chars().count() > REDACTED_SQL_MAX_CHARS {
        let mut truncated = trimmed
            .chars()
            .take(REDACTED_SQL_MAX_CHARS)
            .collect::<String>();
        truncated.push_str("...");
        return truncated;
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_string_literals() {
        assert_eq!(
            redact_sql("UPDATE Users SET invitationToken = 'abc''def' WHERE id = 4"),
            "UPDATE Users SET invitationToken = '?' WHERE id = 4"
        );
        assert_eq!(
            redact_sql("SELECT  *\n  FROM Clubs WHERE clubName = 'Bears'"),
            "SELECT * FROM Clubs WHERE clubName = '?'"
        );
    }

    #[test]
    fn unterminated_literal_is_still_hidden() {
        assert_eq!(redact_sql("SELECT 'secret"), "SELECT '?'");
    }

    #[test]
    fn long_statements_are_truncated() {
        let sql = format!("SELECT {}", "1".repeat(REDACTED_SQL_MAX_CHARS * 2));
        let redacted = redact_sql(&sql);
        assert!(redacted.ends_with("..."));
        assert_eq!(redacted.chars().count(), REDACTED_SQL_MAX_CHARS + 3);
    }
}
