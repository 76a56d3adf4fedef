//! SQLite implementation of the RunRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_enum, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Run, RunFilter, RunStatus};
use crate::domain::ports::RunRepository;

const RUN_COLUMNS: &str =
    "id, ticket_ref, status, created_at, started_at, finished_at, last_heartbeat_at, error";

#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: SqlitePool,
}

impl SqliteRunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRepository for SqliteRunRepository {
    async fn create(&self, run: &Run) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO runs (id, ticket_ref, status, created_at, started_at, finished_at, last_heartbeat_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.ticket_ref)
        .bind(run.status.as_str())
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.finished_at.map(|t| t.to_rfc3339()))
        .bind(run.last_heartbeat_at.map(|t| t.to_rfc3339()))
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Run>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: RunFilter) -> DomainResult<Vec<Run>> {
        let mut query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }

        if let Some(ticket_ref) = &filter.ticket_ref {
            query.push_str(" AND ticket_ref = ?");
            bindings.push(ticket_ref.clone());
        }

        query.push_str(" ORDER BY created_at DESC");
        query.push_str(&format!(
            " LIMIT {} OFFSET {}",
            filter.limit.unwrap_or(100),
            filter.offset.unwrap_or(0)
        ));

        let mut q = sqlx::query_as::<_, RunRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<RunRow> = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_running(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            r#"UPDATE runs SET status = 'running', started_at = COALESCE(started_at, ?), last_heartbeat_at = ?
               WHERE id = ? AND status = 'pending'"#,
        )
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> DomainResult<bool> {
        if !status.is_terminal() {
            return Err(DomainError::ValidationFailed(format!(
                "cannot finalize run {id} to non-terminal status {status}"
            )));
        }

        // The status guard makes terminal states absorbing even under concurrent finalizers.
        let result = sqlx::query(
            r#"UPDATE runs SET status = ?, error = ?, finished_at = ?
               WHERE id = ? AND status IN ('pending', 'running')"#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_if_stale(
        &self,
        id: Uuid,
        seen_before: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> DomainResult<bool> {
        // Staleness is re-checked here, so a heartbeat landing after the
        // caller's read keeps the run alive.
        let result = sqlx::query(
            r#"UPDATE runs SET status = 'failed', error = ?, finished_at = ?
               WHERE id = ? AND status = 'running'
                 AND julianday(COALESCE(last_heartbeat_at, started_at, created_at)) < julianday(?)"#,
        )
        .bind(error)
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .bind(seen_before.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET last_heartbeat_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_running(&self) -> DomainResult<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status = 'running' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    ticket_ref: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    last_heartbeat_at: Option<String>,
    error: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = DomainError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: parse_uuid(&row.id)?,
            ticket_ref: row.ticket_ref,
            status: parse_enum("status", &row.status, RunStatus::from_str)?,
            created_at: parse_datetime(&row.created_at)?,
            started_at: parse_optional_datetime(row.started_at)?,
            finished_at: parse_optional_datetime(row.finished_at)?,
            last_heartbeat_at: parse_optional_datetime(row.last_heartbeat_at)?,
            error: row.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn setup() -> SqliteRunRepository {
        let pool = create_migrated_test_pool().await.unwrap();
        SqliteRunRepository::new(pool)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = setup().await;
        let run = Run::new("T-1");
        repo.create(&run).await.unwrap();

        let loaded = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.ticket_ref, "T-1");
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn test_mark_running_only_from_pending() {
        let repo = setup().await;
        let run = Run::new("T-2");
        repo.create(&run).await.unwrap();

        assert!(repo.mark_running(run.id, Utc::now()).await.unwrap());
        assert!(!repo.mark_running(run.id, Utc::now()).await.unwrap());

        let loaded = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.started_at.is_some());
        assert!(loaded.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_if_stale_rechecks_last_heartbeat() {
        let repo = setup().await;
        let run = Run::new("T-4");
        repo.create(&run).await.unwrap();
        let started = Utc::now() - chrono::Duration::minutes(10);
        repo.mark_running(run.id, started).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(1);

        // A heartbeat after the cutoff keeps the run alive.
        repo.touch_heartbeat(run.id, Utc::now()).await.unwrap();
        assert!(!repo
            .fail_if_stale(run.id, cutoff, "heartbeat timeout", Utc::now())
            .await
            .unwrap());
        assert_eq!(
            repo.get(run.id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        repo.touch_heartbeat(run.id, started).await.unwrap();
        assert!(repo
            .fail_if_stale(run.id, cutoff, "heartbeat timeout", Utc::now())
            .await
            .unwrap());
        let loaded = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.as_deref(), Some("heartbeat timeout"));
        assert!(loaded.finished_at.is_some());

        // Terminal runs are never touched again.
        assert!(!repo
            .fail_if_stale(run.id, Utc::now(), "again", Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_finalize_is_one_way() {
        let repo = setup().await;
        let run = Run::new("T-3");
        repo.create(&run).await.unwrap();
        repo.mark_running(run.id, Utc::now()).await.unwrap();

        assert!(repo
            .finalize(run.id, RunStatus::Completed, None, Utc::now())
            .await
            .unwrap());
        assert!(!repo
            .finalize(run.id, RunStatus::Failed, Some("late"), Utc::now())
            .await
            .unwrap());

        let loaded = repo.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.error.is_none());
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finalize_rejects_non_terminal_target() {
        let repo = setup().await;
        let run = Run::new("T-4");
        repo.create(&run).await.unwrap();

        let err = repo
            .finalize(run.id, RunStatus::Running, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_only_touches_running_runs() {
        let repo = setup().await;
        let run = Run::new("T-5");
        repo.create(&run).await.unwrap();

        assert!(!repo.touch_heartbeat(run.id, Utc::now()).await.unwrap());
        repo.mark_running(run.id, Utc::now()).await.unwrap();
        assert!(repo.touch_heartbeat(run.id, Utc::now()).await.unwrap());
        assert_eq!(repo.list_running().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let repo = setup().await;
        let a = Run::new("T-6");
        let b = Run::new("T-7");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();
        repo.mark_running(b.id, Utc::now()).await.unwrap();

        let pending = repo
            .list(RunFilter {
                status: Some(RunStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);

        let all = repo.list(RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
