use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::info;

use procure_core::approvals::ports::RuleRepository;
use procure_core::domain::document::DocumentType;
use procure_core::domain::identity::{TenantId, UserId};
use procure_core::domain::rule::{
    ApprovalLevel, ApprovalMode, ApprovalRule, ApproverSpec, LevelType, PurchaseType, RuleId,
};
use procure_core::errors::ApplicationError;

use super::{parse_enum, parse_timestamp, parse_u32, RepositoryError};
use crate::DbPool;

pub struct SqlRuleRepository {
    pool: DbPool,
}

impl SqlRuleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Validates the rule, then replaces the stored rule and all of its levels.
    pub async fn save_rule(&self, rule: &ApprovalRule) -> Result<(), RepositoryError> {
        rule.validate()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO approval_rule (id, tenant_id, name, document_type, purchase_type,
                                        min_amount, max_amount, priority, is_active,
                                        created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 document_type = excluded.document_type,
                 purchase_type = excluded.purchase_type,
                 min_amount = excluded.min_amount,
                 max_amount = excluded.max_amount,
                 priority = excluded.priority,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.tenant_id.0)
        .bind(&rule.name)
        .bind(&rule.document_type.0)
        .bind(rule.purchase_type.map(|purchase_type| purchase_type.as_str()))
        .bind(rule.min_amount.map(|amount| amount.to_string()))
        .bind(rule.max_amount.map(|amount| amount.to_string()))
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(rule.created_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM approval_level WHERE rule_id = ?")
            .bind(&rule.id.0)
            .execute(&mut *tx)
            .await?;

        for level in &rule.levels {
            sqlx::query(
                "INSERT INTO approval_level (rule_id, level_order, name, mode, level_type)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&rule.id.0)
            .bind(i64::from(level.level_order))
            .bind(&level.name)
            .bind(level.mode.as_str())
            .bind(level.level_type.as_str())
            .execute(&mut *tx)
            .await?;

            for (position, approver) in level.approvers.iter().enumerate() {
                let (kind, value) = match approver {
                    ApproverSpec::User(user_id) => ("user", user_id.0.as_str()),
                    ApproverSpec::Role(role) => ("role", role.as_str()),
                };
                sqlx::query(
                    "INSERT INTO approval_level_approver
                         (rule_id, level_order, position, approver_kind, approver_value)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&rule.id.0)
                .bind(i64::from(level.level_order))
                .bind(position as i64)
                .bind(kind)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!(
            event_name = "approval.rule.saved",
            tenant_id = %rule.tenant_id.0,
            rule_id = %rule.id.0,
            levels = rule.levels.len(),
            "approval rule saved"
        );
        Ok(())
    }

    pub async fn find_rule(&self, id: &RuleId) -> Result<Option<ApprovalRule>, RepositoryError> {
        let Some(row) = sqlx::query(
            "SELECT id, tenant_id, name, document_type, purchase_type, min_amount, max_amount,
                    priority, is_active, created_at
             FROM approval_rule WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let mut rule = rule_from_row(&row)?;
        let mut levels = self.load_levels("r.id = ?", &[id.0.as_str()]).await?;
        rule.levels = levels.remove(&rule.id).unwrap_or_default();
        Ok(Some(rule))
    }

    pub async fn set_active(&self, id: &RuleId, is_active: bool) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("UPDATE approval_rule SET is_active = ?, updated_at = ? WHERE id = ?")
                .bind(is_active)
                .bind(Utc::now().to_rfc3339())
                .bind(&id.0)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_active_rules(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<Vec<ApprovalRule>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, document_type, purchase_type, min_amount, max_amount,
                    priority, is_active, created_at
             FROM approval_rule
             WHERE tenant_id = ? AND document_type = ? AND is_active = 1
             ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .bind(&tenant_id.0)
        .bind(&document_type.0)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = rows.iter().map(rule_from_row).collect::<Result<Vec<_>, _>>()?;
        let mut levels = self
            .load_levels(
                "r.tenant_id = ? AND r.document_type = ? AND r.is_active = 1",
                &[tenant_id.0.as_str(), document_type.0.as_str()],
            )
            .await?;
        for rule in &mut rules {
            rule.levels = levels.remove(&rule.id).unwrap_or_default();
        }
        Ok(rules)
    }

    /// Levels with their approvers for every rule matching `rule_filter`, keyed by rule id.
    async fn load_levels(
        &self,
        rule_filter: &str,
        binds: &[&str],
    ) -> Result<HashMap<RuleId, Vec<ApprovalLevel>>, RepositoryError> {
        let level_sql = format!(
            "SELECT l.rule_id, l.level_order, l.name, l.mode, l.level_type
             FROM approval_level l JOIN approval_rule r ON r.id = l.rule_id
             WHERE {rule_filter}
             ORDER BY l.rule_id, l.level_order"
        );
        let mut level_query = sqlx::query(&level_sql);
        for value in binds {
            level_query = level_query.bind(*value);
        }
        let level_rows = level_query.fetch_all(&self.pool).await?;

        let approver_sql = format!(
            "SELECT a.rule_id, a.level_order, a.approver_kind, a.approver_value
             FROM approval_level_approver a JOIN approval_rule r ON r.id = a.rule_id
             WHERE {rule_filter}
             ORDER BY a.rule_id, a.level_order, a.position"
        );
        let mut approver_query = sqlx::query(&approver_sql);
        for value in binds {
            approver_query = approver_query.bind(*value);
        }
        let approver_rows = approver_query.fetch_all(&self.pool).await?;

        let mut approvers: HashMap<(String, u32), Vec<ApproverSpec>> = HashMap::new();
        for row in &approver_rows {
            let rule_id: String = row.try_get("rule_id")?;
            let level_order = parse_u32("level_order", row.try_get("level_order")?)?;
            approvers.entry((rule_id, level_order)).or_default().push(approver_from_row(row)?);
        }

        let mut levels: HashMap<RuleId, Vec<ApprovalLevel>> = HashMap::new();
        for row in &level_rows {
            let rule_id: String = row.try_get("rule_id")?;
            let level_order = parse_u32("level_order", row.try_get("level_order")?)?;
            let level = ApprovalLevel {
                level_order,
                name: row.try_get("name")?,
                mode: parse_enum("approval mode", row.try_get("mode")?, ApprovalMode::parse)?,
                level_type: parse_enum("level type", row.try_get("level_type")?, LevelType::parse)?,
                approvers: approvers.remove(&(rule_id.clone(), level_order)).unwrap_or_default(),
            };
            levels.entry(RuleId(rule_id)).or_default().push(level);
        }
        Ok(levels)
    }
}

#[async_trait]
impl RuleRepository for SqlRuleRepository {
    async fn list_active_rules(
        &self,
        tenant_id: &TenantId,
        document_type: &DocumentType,
    ) -> Result<Vec<ApprovalRule>, ApplicationError> {
        Ok(self.fetch_active_rules(tenant_id, document_type).await?)
    }
}

fn rule_from_row(row: &SqliteRow) -> Result<ApprovalRule, RepositoryError> {
    let purchase_type = row
        .try_get::<Option<String>, _>("purchase_type")?
        .map(|value| parse_enum("purchase type", value, PurchaseType::parse))
        .transpose()?;

    Ok(ApprovalRule {
        id: RuleId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        document_type: DocumentType(row.try_get("document_type")?),
        purchase_type,
        min_amount: parse_amount("min_amount", row.try_get("min_amount")?)?,
        max_amount: parse_amount("max_amount", row.try_get("max_amount")?)?,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
        levels: Vec::new(),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn approver_from_row(row: &SqliteRow) -> Result<ApproverSpec, RepositoryError> {
    let kind: String = row.try_get("approver_kind")?;
    let value: String = row.try_get("approver_value")?;
    match kind.as_str() {
        "user" => Ok(ApproverSpec::User(UserId(value))),
        "role" => Ok(ApproverSpec::Role(value)),
        _ => Err(RepositoryError::Decode(format!("unknown approver kind `{kind}`"))),
    }
}

fn parse_amount(column: &str, value: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    value
        .map(|raw| {
            Decimal::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid amount in `{column}`: `{raw}` ({error})"))
            })
        })
        .transpose()
}
