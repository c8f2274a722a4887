use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::debug;

use procure_core::approvals::ports::DelegationRepository;
use procure_core::domain::delegation::{Delegation, DelegationId, DelegationInsert};
use procure_core::domain::identity::{TenantId, UserId};
use procure_core::errors::ApplicationError;

use super::{format_date, parse_date, parse_timestamp, RepositoryError};
use crate::DbPool;

const DELEGATION_COLUMNS: &str = "id, tenant_id, delegator_id, delegate_id, start_date, end_date,
    reason, is_active, created_at";

pub struct SqlDelegationRepository {
    pool: DbPool,
}

impl SqlDelegationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert_unless_overlapping(
        &self,
        delegation: &Delegation,
    ) -> Result<DelegationInsert, RepositoryError> {
        let start_date = format_date(delegation.start_date);
        let end_date = format_date(delegation.end_date);

        loop {
            // ISO dates compare correctly as text.
            let result = sqlx::query(
                "INSERT INTO approval_delegation (id, tenant_id, delegator_id, delegate_id,
                                                  start_date, end_date, reason, is_active,
                                                  created_at)
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?
                 WHERE NOT EXISTS (
                     SELECT 1 FROM approval_delegation
                     WHERE tenant_id = ? AND delegator_id = ? AND is_active = 1
                       AND start_date <= ? AND end_date >= ?
                 )",
            )
            .bind(&delegation.id.0)
            .bind(&delegation.tenant_id.0)
            .bind(&delegation.delegator_id.0)
            .bind(&delegation.delegate_id.0)
            .bind(&start_date)
            .bind(&end_date)
            .bind(&delegation.reason)
            .bind(delegation.is_active)
            .bind(delegation.created_at.to_rfc3339())
            .bind(&delegation.tenant_id.0)
            .bind(&delegation.delegator_id.0)
            .bind(&end_date)
            .bind(&start_date)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(DelegationInsert::Inserted);
            }

            let row = sqlx::query(&format!(
                "SELECT {DELEGATION_COLUMNS} FROM approval_delegation
                 WHERE tenant_id = ? AND delegator_id = ? AND is_active = 1
                   AND start_date <= ? AND end_date >= ?
                 ORDER BY start_date ASC, id ASC
                 LIMIT 1"
            ))
            .bind(&delegation.tenant_id.0)
            .bind(&delegation.delegator_id.0)
            .bind(&end_date)
            .bind(&start_date)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                return Ok(DelegationInsert::Overlaps(delegation_from_row(&row)?));
            }

            // The overlapping row was deactivated between the two statements.
            debug!(
                event_name = "approval.delegation.insert_retry",
                delegation_id = %delegation.id.0,
                "overlapping delegation vanished, retrying insert"
            );
        }
    }

    async fn fetch(&self, id: &DelegationId) -> Result<Option<Delegation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delegation_from_row).transpose()
    }

    async fn mark_inactive(&self, id: &DelegationId) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE approval_delegation SET is_active = 0 WHERE id = ? AND is_active = 1",
        )
        .bind(&id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch_for_user(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation
             WHERE tenant_id = ? AND (delegator_id = ? OR delegate_id = ?)
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(&tenant_id.0)
        .bind(&user_id.0)
        .bind(&user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delegation_from_row).collect()
    }

    async fn fetch_active_for_delegate(
        &self,
        delegate_id: &UserId,
        tenant_id: &TenantId,
        on: NaiveDate,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let day = format_date(on);
        let rows = sqlx::query(&format!(
            "SELECT {DELEGATION_COLUMNS} FROM approval_delegation
             WHERE tenant_id = ? AND delegate_id = ? AND is_active = 1
               AND start_date <= ? AND end_date >= ?
             ORDER BY delegator_id ASC, id ASC"
        ))
        .bind(&tenant_id.0)
        .bind(&delegate_id.0)
        .bind(&day)
        .bind(&day)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delegation_from_row).collect()
    }
}

#[async_trait]
impl DelegationRepository for SqlDelegationRepository {
    async fn insert_if_no_overlap(
        &self,
        delegation: Delegation,
    ) -> Result<DelegationInsert, ApplicationError> {
        Ok(self.insert_unless_overlapping(&delegation).await?)
    }

    async fn find(&self, id: &DelegationId) -> Result<Option<Delegation>, ApplicationError> {
        Ok(self.fetch(id).await?)
    }

    async fn deactivate(&self, id: &DelegationId) -> Result<bool, ApplicationError> {
        Ok(self.mark_inactive(id).await?)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        Ok(self.fetch_for_user(user_id, tenant_id).await?)
    }

    async fn list_active_for_delegate(
        &self,
        delegate_id: &UserId,
        tenant_id: &TenantId,
        on: NaiveDate,
    ) -> Result<Vec<Delegation>, ApplicationError> {
        Ok(self.fetch_active_for_delegate(delegate_id, tenant_id, on).await?)
    }
}

fn delegation_from_row(row: &SqliteRow) -> Result<Delegation, RepositoryError> {
    Ok(Delegation {
        id: DelegationId(row.try_get("id")?),
        tenant_id: TenantId(row.try_get("tenant_id")?),
        delegator_id: UserId(row.try_get("delegator_id")?),
        delegate_id: UserId(row.try_get("delegate_id")?),
        start_date: parse_date("start_date", row.try_get("start_date")?)?,
        end_date: parse_date("end_date", row.try_get("end_date")?)?,
        reason: row.try_get("reason")?,
        is_active: row.try_get("is_active")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, Utc};

    use procure_core::approvals::ports::DelegationRepository;
    use procure_core::domain::delegation::{Delegation, DelegationId, DelegationInsert};
    use procure_core::domain::identity::{TenantId, UserId};

    use super::SqlDelegationRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlDelegationRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDelegationRepository::new(pool)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn delegation(id: &str, delegator: &str, start: NaiveDate, end: NaiveDate) -> Delegation {
        Delegation {
            id: DelegationId(id.to_string()),
            tenant_id: TenantId("tenant-a".to_string()),
            delegator_id: UserId(delegator.to_string()),
            delegate_id: UserId("deputy".to_string()),
            start_date: start,
            end_date: end,
            reason: Some("leave".to_string()),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn overlapping_range_for_same_delegator_is_refused() {
        let repo = setup().await;
        let january = delegation("del-1", "u1", date(2025, 1, 1), date(2025, 1, 31));
        assert_eq!(
            repo.insert_if_no_overlap(january.clone()).await.expect("insert"),
            DelegationInsert::Inserted
        );

        let overlapping = delegation("del-2", "u1", date(2025, 1, 15), date(2025, 2, 15));
        match repo.insert_if_no_overlap(overlapping).await.expect("insert") {
            DelegationInsert::Overlaps(existing) => assert_eq!(existing.id, january.id),
            other => panic!("expected overlap, got {other:?}"),
        }

        let february = delegation("del-3", "u1", date(2025, 2, 1), date(2025, 2, 15));
        assert_eq!(
            repo.insert_if_no_overlap(february).await.expect("insert"),
            DelegationInsert::Inserted
        );

        let other_delegator = delegation("del-4", "u9", date(2025, 1, 10), date(2025, 1, 20));
        assert_eq!(
            repo.insert_if_no_overlap(other_delegator).await.expect("insert"),
            DelegationInsert::Inserted
        );
    }

    #[tokio::test]
    async fn deactivated_delegation_frees_its_range() {
        let repo = setup().await;
        let january = delegation("del-1", "u1", date(2025, 1, 1), date(2025, 1, 31));
        repo.insert_if_no_overlap(january.clone()).await.expect("insert");

        assert!(repo.deactivate(&january.id).await.expect("deactivate"));
        assert!(!repo.deactivate(&january.id).await.expect("deactivate again"));
        assert!(!repo.find(&january.id).await.expect("find").expect("exists").is_active);

        let replacement = delegation("del-2", "u1", date(2025, 1, 10), date(2025, 1, 20));
        assert_eq!(
            repo.insert_if_no_overlap(replacement).await.expect("insert"),
            DelegationInsert::Inserted
        );
    }

    #[tokio::test]
    async fn active_delegations_cover_inclusive_dates() {
        let repo = setup().await;
        repo.insert_if_no_overlap(delegation("del-1", "u1", date(2025, 1, 1), date(2025, 1, 31)))
            .await
            .expect("insert");
        repo.insert_if_no_overlap(delegation("del-2", "u2", date(2025, 1, 20), date(2025, 2, 5)))
            .await
            .expect("insert");
        let deputy = UserId("deputy".to_string());
        let tenant = TenantId("tenant-a".to_string());

        let on_last_day =
            repo.list_active_for_delegate(&deputy, &tenant, date(2025, 1, 31)).await.expect("list");
        assert_eq!(on_last_day.len(), 2);
        assert_eq!(on_last_day[0].delegator_id, UserId("u1".to_string()));

        let in_february =
            repo.list_active_for_delegate(&deputy, &tenant, date(2025, 2, 1)).await.expect("list");
        assert_eq!(in_february.len(), 1);
        assert_eq!(in_february[0].delegator_id, UserId("u2".to_string()));

        let other_tenant = repo
            .list_active_for_delegate(&deputy, &TenantId("tenant-b".to_string()), date(2025, 1, 5))
            .await
            .expect("list");
        assert!(other_tenant.is_empty());
    }

    #[tokio::test]
    async fn user_listing_includes_both_sides_newest_first() {
        let repo = setup().await;
        let mut older = delegation("del-1", "u1", date(2025, 1, 1), date(2025, 1, 31));
        older.created_at = Utc::now() - Duration::hours(1);
        let mut newer = delegation("del-2", "deputy", date(2025, 3, 1), date(2025, 3, 5));
        newer.delegate_id = UserId("u1".to_string());
        repo.insert_if_no_overlap(older).await.expect("insert");
        repo.insert_if_no_overlap(newer).await.expect("insert");

        let listed = repo
            .list_for_user(&UserId("u1".to_string()), &TenantId("tenant-a".to_string()))
            .await
            .expect("list");
        let ids: Vec<_> = listed.iter().map(|delegation| delegation.id.0.as_str()).collect();
        assert_eq!(ids, vec!["del-2", "del-1"]);
    }
}
