// 结构探测：通过 PRAGMA index_list / table_info 判断索引与列是否存在，只读且可重复调用。
use crate::core::error::MaintenanceError;
use crate::services::maintenance::optimizer::IndexEntry;
use crate::storage::{row_str, ConnectionHandle, QueryKind};

const LIST_TABLES_SQL: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// 列出所有用户表上的索引，跳过 `sqlite_` 开头的系统索引。
pub fn list_indexes(handle: &dyn ConnectionHandle) -> Result<Vec<IndexEntry>, MaintenanceError> {
    let tables = handle.execute(LIST_TABLES_SQL, QueryKind::Select)?.into_rows();
    let mut entries = Vec::new();
    for table in tables {
        let Some(table_name) = row_str(&table, "name") else {
            continue;
        };
        let sql = format!("PRAGMA index_list({})", quote_identifier(table_name));
        let rows = handle.execute(&sql, QueryKind::Select)?.into_rows();
        for row in rows {
            let Some(name) = row_str(&row, "name") else {
                continue;
            };
            if name.starts_with("sqlite_") {
                continue;
            }
            entries.push(IndexEntry {
                name: name.to_string(),
                table: table_name.to_string(),
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// 名称包含 `name` 或其 snake_case 形式即视为存在。
pub fn index_exists(handle: &dyn ConnectionHandle, name: &str) -> Result<bool, MaintenanceError> {
    let snake = to_snake_case(name);
    let entries = list_indexes(handle)?;
    Ok(entries
        .iter()
        .any(|entry| entry.name.contains(name) || entry.name.contains(&snake)))
}

pub fn column_exists(
    handle: &dyn ConnectionHandle,
    table: &str,
    column: &str,
) -> Result<bool, MaintenanceError> {
    let sql = format!("PRAGMA table_info({})", quote_identifier(table));
    let rows = handle.execute(&sql, QueryKind::Select)?.into_rows();
    Ok(rows
        .iter()
        .any(|row| row_str(row, "name") == Some(column)))
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn to_snake_case(input: &str) -> String {
    let chars = input.chars().collect::<Vec<_>>();
    let mut output = String::with_capacity(input.len() + 4);
    for (index, ch) in chars.iter().enumerate() {
        if ch.is_ascii_uppercase() {
            let prev = index.checked_sub(1).map(|i| chars[i]);
            let next = chars.get(index + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => {
                    next.map(|n| n.is_ascii_lowercase()).unwrap_or(false)
                }
                _ => false,
            };
            if boundary && !output.ends_with('_') {
                output.push('_');
            }
            output.push(ch.to_ascii_lowercase());
        } else {
            output.push(*ch);
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_conversion() {
        assert_eq!(to_snake_case("EmailSubscriptions"), "email_subscriptions");
        assert_eq!(to_snake_case("isActive"), "is_active");
        assert_eq!(
            to_snake_case("idx_users_invitationToken"),
            "idx_users_invitation_token"
        );
        assert_eq!(to_snake_case("HTMLReport"), "html_report");
        assert_eq!(to_snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("Users"), "\"Users\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
