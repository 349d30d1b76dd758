// 索引保障：声明式描述门户依赖的（部分/复合）索引，统一渲染为 CREATE INDEX IF NOT EXISTS 并逐条执行。
use crate::core::error::MaintenanceError;
use crate::services::maintenance::prober::{
    column_exists, list_indexes, quote_identifier, to_snake_case,
};
use crate::services::maintenance::run_blocking;
use crate::storage::{ConnectionHandle, QueryKind};
use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: &'static str,
    pub order: SortOrder,
}

impl IndexColumn {
    pub const fn asc(name: &'static str) -> Self {
        Self {
            name,
            order: SortOrder::Asc,
        }
    }

    pub const fn desc(name: &'static str) -> Self {
        Self {
            name,
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Integer(i64),
    Bool(bool),
    Text(&'static str),
}

/// 部分索引谓词，只允许列比较、空值判断与合取。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(&'static str, Literal),
    IsNull(&'static str),
    IsNotNull(&'static str),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn render(&self) -> String {
        match self {
            Predicate::Eq(column, literal) => {
                format!("{} = {}", quote_identifier(column), render_literal(literal))
            }
            Predicate::IsNull(column) => format!("{} IS NULL", quote_identifier(column)),
            Predicate::IsNotNull(column) => format!("{} IS NOT NULL", quote_identifier(column)),
            Predicate::And(items) => items
                .iter()
                .map(|item| match item {
                    Predicate::And(_) => format!("({})", item.render()),
                    _ => item.render(),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }

    fn columns(&self, output: &mut Vec<&'static str>) {
        match self {
            Predicate::Eq(column, _) | Predicate::IsNull(column) | Predicate::IsNotNull(column) => {
                output.push(*column)
            }
            Predicate::And(items) => {
                for item in items {
                    item.columns(output);
                }
            }
        }
    }
}

fn render_literal(literal: &Literal) -> String {
    match literal {
        Literal::Integer(value) => value.to_string(),
        Literal::Bool(true) => "1".to_string(),
        Literal::Bool(false) => "0".to_string(),
        Literal::Text(value) => format!("'{}'", value.replace('\'', "''")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub table: &'static str,
    pub columns: Vec<IndexColumn>,
    pub partial: Option<Predicate>,
}

impl IndexSpec {
    pub fn new(name: &'static str, table: &'static str, columns: Vec<IndexColumn>) -> Self {
        Self {
            name,
            table,
            columns,
            partial: None,
        }
    }

    pub fn partial(mut self, predicate: Predicate) -> Self {
        self.partial = Some(predicate);
        self
    }

    pub fn render_ddl(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| match column.order {
                SortOrder::Asc => quote_identifier(column.name),
                SortOrder::Desc => format!("{} DESC", quote_identifier(column.name)),
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut ddl = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({columns})",
            quote_identifier(self.name),
            quote_identifier(self.table)
        );
        if let Some(predicate) = self.partial.as_ref() {
            ddl.push_str(" WHERE ");
            ddl.push_str(&predicate.render());
        }
        ddl
    }

    /// 索引与谓词引用的全部列（去重，保持声明顺序）。
    pub fn referenced_columns(&self) -> Vec<&'static str> {
        let mut columns = self
            .columns
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>();
        if let Some(predicate) = self.partial.as_ref() {
            predicate.columns(&mut columns);
        }
        let mut seen = HashSet::new();
        columns.retain(|column| seen.insert(*column));
        columns
    }

    /// 名称必须是 `idx_<表名 snake_case>_<用途>`，且不得落入 `sqlite_` 命名空间。
    pub fn validate(&self) -> Result<(), String> {
        if self.name.starts_with("sqlite_") {
            return Err("reserved sqlite_ namespace".to_string());
        }
        let prefix = format!("idx_{}_", to_snake_case(self.table));
        let Some(purpose) = self.name.strip_prefix(&prefix) else {
            return Err(format!("name must start with {prefix}"));
        };
        if purpose.is_empty() {
            return Err("name is missing a purpose suffix".to_string());
        }
        if !self
            .name
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
        {
            return Err("name must be lowercase snake_case".to_string());
        }
        if self.columns.is_empty() {
            return Err("index has no columns".to_string());
        }
        Ok(())
    }
}

/// 门户查询依赖的索引集合。
pub fn declared_indexes() -> Vec<IndexSpec> {
    let active = || Predicate::Eq("isActive", Literal::Bool(true));
    vec![
        IndexSpec::new(
            "idx_carnivals_active_date",
            "Carnivals",
            vec![IndexColumn::desc("date")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_carnivals_state_date",
            "Carnivals",
            vec![IndexColumn::asc("state"), IndexColumn::asc("date")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_carnivals_club_id",
            "Carnivals",
            vec![IndexColumn::asc("clubId")],
        ),
        IndexSpec::new(
            "idx_carnivals_created_by_user",
            "Carnivals",
            vec![IndexColumn::asc("createdByUserId")],
        ),
        IndexSpec::new(
            "idx_carnivals_archive_candidates",
            "Carnivals",
            vec![IndexColumn::asc("date")],
        )
        .partial(Predicate::And(vec![active(), Predicate::IsNull("archivedAt")])),
        IndexSpec::new(
            "idx_users_invitation_token",
            "Users",
            vec![IndexColumn::asc("invitationToken")],
        )
        .partial(Predicate::IsNotNull("invitationToken")),
        IndexSpec::new(
            "idx_users_token_expires",
            "Users",
            vec![IndexColumn::asc("tokenExpires")],
        )
        .partial(Predicate::IsNotNull("invitationToken")),
        IndexSpec::new(
            "idx_users_club_active",
            "Users",
            vec![IndexColumn::asc("clubId"), IndexColumn::asc("isActive")],
        ),
        IndexSpec::new(
            "idx_clubs_active_state_name",
            "Clubs",
            vec![IndexColumn::asc("state"), IndexColumn::asc("clubName")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_email_subscriptions_active_email",
            "EmailSubscriptions",
            vec![IndexColumn::asc("email")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_carnival_clubs_carnival_club",
            "CarnivalClubs",
            vec![IndexColumn::asc("carnivalId"), IndexColumn::asc("clubId")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_club_players_club_name",
            "ClubPlayers",
            vec![
                IndexColumn::asc("clubId"),
                IndexColumn::asc("lastName"),
                IndexColumn::asc("firstName"),
            ],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_sponsors_active_name",
            "Sponsors",
            vec![IndexColumn::asc("sponsorName")],
        )
        .partial(active()),
        IndexSpec::new(
            "idx_audit_logs_user_created",
            "AuditLogs",
            vec![IndexColumn::asc("userId"), IndexColumn::desc("createdAt")],
        ),
    ]
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub already_present: Vec<String>,
}

/// 逐条执行索引语句：遇到第一个失败即中止，已执行的语句保持原样（每条都幂等）。
pub fn ensure_indexes(
    handle: &dyn ConnectionHandle,
    specs: &[IndexSpec],
) -> Result<ProvisionReport, MaintenanceError> {
    let mut seen = HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name) {
            return Err(MaintenanceError::index_provisioning(
                spec.name,
                anyhow!("duplicate index name in declared set"),
            ));
        }
        spec.validate()
            .map_err(|reason| MaintenanceError::index_provisioning(spec.name, anyhow!(reason)))?;
    }

    let existing = list_indexes(handle)
        .map_err(|err| MaintenanceError::index_provisioning("*", err))?
        .into_iter()
        .map(|entry| entry.name)
        .collect::<HashSet<_>>();

    let mut report = ProvisionReport::default();
    for spec in specs {
        for column in spec.referenced_columns() {
            let present = column_exists(handle, spec.table, column)
                .map_err(|err| MaintenanceError::index_provisioning(spec.name, err))?;
            if !present {
                return Err(MaintenanceError::index_provisioning(
                    spec.name,
                    anyhow!("column {column} missing on table {}", spec.table),
                ));
            }
        }
        let ddl = spec.render_ddl();
        debug!(index = spec.name, ddl = %ddl, "ensuring index");
        handle
            .execute(&ddl, QueryKind::Raw)
            .map_err(|err| MaintenanceError::index_provisioning(spec.name, err))?;
        if existing.contains(spec.name) {
            report.already_present.push(spec.name.to_string());
        } else {
            report.created.push(spec.name.to_string());
        }
    }
    Ok(report)
}

#[derive(Clone)]
pub struct IndexProvisioner {
    handle: Arc<dyn ConnectionHandle>,
    specs: Arc<Vec<IndexSpec>>,
}

impl IndexProvisioner {
    pub fn new(handle: Arc<dyn ConnectionHandle>, specs: Vec<IndexSpec>) -> Self {
        Self {
            handle,
            specs: Arc::new(specs),
        }
    }

    pub fn specs(&self) -> &[IndexSpec] {
        &self.specs
    }

    pub async fn ensure_all(&self) -> Result<ProvisionReport, MaintenanceError> {
        let handle = self.handle.clone();
        let specs = self.specs.clone();
        let report = run_blocking(move || ensure_indexes(handle.as_ref(), &specs)).await?;
        info!(
            created = report.created.len(),
            already_present = report.already_present.len(),
            "索引检查完成"
        );
        Ok(report)
    }
}
