//! SQLite 存储后端
//!
//! 步骤账本、睡眠票据与执行实例保存在同一个 SQLite 数据库中。
//! 默认开启 WAL 与 `synchronous = FULL`，写入在返回前落盘。

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use uuid::Uuid;

use sw_core::{
    ExecutionError, ExecutionId, ExecutionInstance, ExecutionStatus, Result, SleepTicket,
    StepRecord, StepStatus, StepWeaveError,
};

use crate::store::{resolve_step_write, ExecutionStore, StepLedger, StepWrite, TicketStore};

/// 存储配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 数据库 URL (`sqlite://stepweave.db`、`sqlite::memory:`)
    pub database_url: String,
    /// 是否启用 WAL
    pub enable_wal: bool,
    /// 连接池大小
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://stepweave.db".to_string(),
            enable_wal: true,
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    /// 内存数据库配置
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            enable_wal: false,
            max_connections: 1,
        }
    }

    fn is_memory(&self) -> bool {
        self.database_url.contains(":memory:")
    }
}

/// SQLite 存储
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 连接数据库并建表
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(StepWeaveError::storage)?
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Full);

        let mut pool_options = SqlitePoolOptions::new();
        if config.is_memory() {
            // 内存库随连接关闭而消失，只能保留唯一一条常驻连接
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(config.max_connections.max(1));
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StepWeaveError::storage)?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(database_url = %config.database_url, wal = config.enable_wal, "SQLite store ready");
        Ok(store)
    }

    /// 内存数据库
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    async fn migrate(&self) -> Result<()> {
        const SCHEMA: [&str; 5] = [
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                execution_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                result TEXT NOT NULL,
                wake_at INTEGER,
                completed_at INTEGER,
                PRIMARY KEY (execution_id, step_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sleep_tickets (
                execution_id TEXT PRIMARY KEY,
                wake_at INTEGER NOT NULL,
                resume_token TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sleep_tickets_wake_at ON sleep_tickets(wake_at)",
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                function_id TEXT NOT NULL,
                event TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status)",
        ];

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(StepWeaveError::storage)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StepLedger for SqliteStore {
    async fn get_step(&self, execution_id: ExecutionId, step_name: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT execution_id, step_name, status, result, wake_at, completed_at
            FROM steps
            WHERE execution_id = ? AND step_name = ?
            "#,
        )
        .bind(execution_id.to_string())
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        row.map(StepRow::into_record).transpose()
    }

    async fn write_step(&self, record: StepRecord) -> Result<StepRecord> {
        let mut tx = self.pool.begin().await.map_err(StepWeaveError::storage)?;

        let existing = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT execution_id, step_name, status, result, wake_at, completed_at
            FROM steps
            WHERE execution_id = ? AND step_name = ?
            "#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.step_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StepWeaveError::storage)?
        .map(StepRow::into_record)
        .transpose()?;

        if resolve_step_write(existing.as_ref(), &record)? == StepWrite::Unchanged {
            tx.commit().await.map_err(StepWeaveError::storage)?;
            return Ok(existing.unwrap_or(record));
        }

        sqlx::query(
            r#"
            INSERT INTO steps (execution_id, step_name, status, result, wake_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(execution_id, step_name) DO UPDATE SET
                status = excluded.status,
                result = excluded.result,
                wake_at = excluded.wake_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.step_name)
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.result)?)
        .bind(record.wake_at.map(|t| t.timestamp_millis()))
        .bind(record.completed_at.map(|t| t.timestamp_millis()))
        .execute(&mut *tx)
        .await
        .map_err(StepWeaveError::storage)?;

        tx.commit().await.map_err(StepWeaveError::storage)?;
        Ok(record)
    }

    async fn list_steps(&self, execution_id: ExecutionId) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT execution_id, step_name, status, result, wake_at, completed_at
            FROM steps
            WHERE execution_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        rows.into_iter().map(StepRow::into_record).collect()
    }

    async fn delete_steps(&self, execution_id: ExecutionId) -> Result<()> {
        sqlx::query("DELETE FROM steps WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StepWeaveError::storage)?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    async fn put_ticket(&self, ticket: &SleepTicket) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sleep_tickets (execution_id, wake_at, resume_token)
            VALUES (?, ?, ?)
            ON CONFLICT(execution_id) DO UPDATE SET
                wake_at = excluded.wake_at,
                resume_token = excluded.resume_token
            "#,
        )
        .bind(ticket.execution_id.to_string())
        .bind(ticket.wake_at.timestamp_millis())
        .bind(ticket.resume_token.to_string())
        .execute(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;
        Ok(())
    }

    async fn get_ticket(&self, execution_id: ExecutionId) -> Result<Option<SleepTicket>> {
        let row = sqlx::query_as::<_, TicketRow>(
            "SELECT execution_id, wake_at, resume_token FROM sleep_tickets WHERE execution_id = ?",
        )
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        row.map(TicketRow::into_ticket).transpose()
    }

    async fn due_tickets(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SleepTicket>> {
        let rows = sqlx::query_as::<_, TicketRow>(
            r#"
            SELECT execution_id, wake_at, resume_token
            FROM sleep_tickets
            WHERE wake_at <= ?
            ORDER BY wake_at ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        rows.into_iter().map(TicketRow::into_ticket).collect()
    }

    async fn consume_ticket(&self, execution_id: ExecutionId, resume_token: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sleep_tickets WHERE execution_id = ? AND resume_token = ?")
            .bind(execution_id.to_string())
            .bind(resume_token.to_string())
            .execute(&self.pool)
            .await
            .map_err(StepWeaveError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_ticket(&self, execution_id: ExecutionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sleep_tickets WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StepWeaveError::storage)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn insert_execution(&self, instance: &ExecutionInstance) -> Result<()> {
        let row = ExecutionRow::from_instance(instance)?;
        sqlx::query(
            r#"
            INSERT INTO executions
            (id, function_id, event, status, output, error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.function_id)
        .bind(&row.event)
        .bind(&row.status)
        .bind(&row.output)
        .bind(&row.error)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<ExecutionInstance>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, function_id, event, status, output, error, created_at, updated_at
            FROM executions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        row.map(ExecutionRow::into_instance).transpose()
    }

    async fn update_execution(&self, instance: &ExecutionInstance) -> Result<()> {
        let row = ExecutionRow::from_instance(instance)?;
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?, output = ?, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&row.status)
        .bind(&row.output)
        .bind(&row.error)
        .bind(row.updated_at)
        .bind(&row.id)
        .execute(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        if result.rows_affected() == 0 {
            return Err(StepWeaveError::NotFound(format!("execution {}", instance.id)));
        }
        Ok(())
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionInstance>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, function_id, event, status, output, error, created_at, updated_at
            FROM executions
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        rows.into_iter().map(ExecutionRow::into_instance).collect()
    }

    async fn list_unfinished(&self) -> Result<Vec<ExecutionInstance>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, function_id, event, status, output, error, created_at, updated_at
            FROM executions
            WHERE status IN ('running', 'sleeping')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        rows.into_iter().map(ExecutionRow::into_instance).collect()
    }

    async fn list_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT id FROM executions
            WHERE status IN ('completed', 'failed') AND updated_at < ?
            "#,
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(StepWeaveError::storage)?;

        ids.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StepWeaveError::storage)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    execution_id: String,
    step_name: String,
    status: String,
    result: String,
    wake_at: Option<i64>,
    completed_at: Option<i64>,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            execution_id: parse_uuid(&self.execution_id)?,
            step_name: self.step_name,
            status: self.status.parse::<StepStatus>().map_err(StepWeaveError::Storage)?,
            result: serde_json::from_str(&self.result)?,
            wake_at: self.wake_at.map(from_millis).transpose()?,
            completed_at: self.completed_at.map(from_millis).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    execution_id: String,
    wake_at: i64,
    resume_token: String,
}

impl TicketRow {
    fn into_ticket(self) -> Result<SleepTicket> {
        Ok(SleepTicket {
            execution_id: parse_uuid(&self.execution_id)?,
            wake_at: from_millis(self.wake_at)?,
            resume_token: parse_uuid(&self.resume_token)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    function_id: String,
    event: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ExecutionRow {
    fn from_instance(instance: &ExecutionInstance) -> Result<Self> {
        Ok(Self {
            id: instance.id.to_string(),
            function_id: instance.function_id.clone(),
            event: serde_json::to_string(&instance.event)?,
            status: instance.status.as_str().to_string(),
            output: instance.output.as_ref().map(serde_json::to_string).transpose()?,
            error: instance.error.as_ref().map(serde_json::to_string).transpose()?,
            created_at: instance.created_at.timestamp_millis(),
            updated_at: instance.updated_at.timestamp_millis(),
        })
    }

    fn into_instance(self) -> Result<ExecutionInstance> {
        Ok(ExecutionInstance {
            id: parse_uuid(&self.id)?,
            function_id: self.function_id,
            event: serde_json::from_str(&self.event)?,
            status: self
                .status
                .parse::<ExecutionStatus>()
                .map_err(StepWeaveError::Storage)?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<ExecutionError>)
                .transpose()?,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StepWeaveError::Storage(format!("corrupt id {value:?}: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StepWeaveError::Storage(format!("timestamp out of range: {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sw_core::{ErrorKind, EventEnvelope};

    #[tokio::test]
    async fn test_sqlite_store_creation() {
        let _store = SqliteStore::in_memory().await.unwrap();
    }

    #[tokio::test]
    async fn test_record_step_idempotent_and_conflicting() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();

        store.record_step(id, "step-1", json!({ "data": "a" }), now).await.unwrap();
        store.record_step(id, "step-1", json!({ "data": "a" }), now).await.unwrap();
        assert_eq!(store.list_steps(id).await.unwrap().len(), 1);

        let err = store
            .record_step(id, "step-1", json!({ "data": "b" }), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StepWeaveError::StepConflict { .. }));
    }

    #[tokio::test]
    async fn test_sleep_record_completes_in_place() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let wake_at = now + chrono::Duration::seconds(5);

        store.record_step(id, "step-1", json!(1), now).await.unwrap();
        store.mark_sleeping(id, "await-sleep", wake_at).await.unwrap();

        let pending = store.get_step(id, "await-sleep").await.unwrap().unwrap();
        assert_eq!(pending.status, StepStatus::Pending);
        assert_eq!(pending.wake_at.map(|t| t.timestamp_millis()), Some(wake_at.timestamp_millis()));

        store.record_step(id, "await-sleep", serde_json::Value::Null, wake_at).await.unwrap();
        store.record_step(id, "step-2", json!(2), wake_at).await.unwrap();

        let names: Vec<String> = store
            .list_steps(id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_name)
            .collect();
        assert_eq!(names, vec!["step-1", "await-sleep", "step-2"]);
    }

    #[tokio::test]
    async fn test_sleep_never_ends_before_deadline() {
        use crate::context::StepContext;
        use crate::retry::RetryPolicy;
        use crate::scheduler::{SchedulerConfig, SleepScheduler};
        use std::sync::Arc;
        use std::time::Duration;
        use sw_core::{Clock, ManualClock};

        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let start = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.900700Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let scheduler = Arc::new(SleepScheduler::new(store.clone(), clock.clone(), SchedulerConfig::default()));
        let id = Uuid::new_v4();
        let context = || {
            StepContext::new(id, store.clone(), scheduler.clone(), clock.clone(), None, RetryPolicy::none())
        };

        let err = context().sleep_for("nap", "5s").await.unwrap_err();
        let StepWeaveError::Suspended { wake_at } = err else {
            panic!("expected suspension, got {err:?}");
        };
        assert!(wake_at >= start + chrono::Duration::seconds(5));

        // 持久化后的唤醒时间与内存中的一致
        let record = store.get_step(id, "nap").await.unwrap().unwrap();
        assert_eq!(record.wake_at, Some(wake_at));
        assert_eq!(store.get_ticket(id).await.unwrap().unwrap().wake_at, wake_at);

        clock.advance(Duration::from_micros(4_999_500));
        assert!(matches!(
            context().sleep_for("nap", "5s").await,
            Err(StepWeaveError::Suspended { .. })
        ));
        assert!(store.due_tickets(clock.now(), 10).await.unwrap().is_empty());

        clock.advance(Duration::from_millis(1));
        assert!(clock.now() >= wake_at);
        assert_eq!(store.due_tickets(clock.now(), 10).await.unwrap().len(), 1);
        context().sleep_for("nap", "5s").await.unwrap();
        assert!(store.get_step(id, "nap").await.unwrap().unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_ticket_upsert_and_consume() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();

        let first = SleepTicket::new(id, now - chrono::Duration::seconds(1));
        store.put_ticket(&first).await.unwrap();
        let second = SleepTicket::new(id, now + chrono::Duration::seconds(30));
        store.put_ticket(&second).await.unwrap();

        assert!(store.due_tickets(now, 10).await.unwrap().is_empty());
        assert!(!store.consume_ticket(id, first.resume_token).await.unwrap());
        assert!(store.consume_ticket(id, second.resume_token).await.unwrap());
        assert!(store.get_ticket(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let mut instance = ExecutionInstance::new(
            "hello-world-function",
            EventEnvelope::new("test/hello-world", json!({ "name": "Ada" })),
            now,
        );
        store.insert_execution(&instance).await.unwrap();
        assert_eq!(store.list_unfinished().await.unwrap().len(), 1);

        instance.fail(
            ExecutionError {
                kind: ErrorKind::Cancelled,
                message: "Execution cancelled".into(),
            },
            now,
        );
        store.update_execution(&instance).await.unwrap();

        let loaded = store.get_execution(instance.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.error, instance.error);
        assert_eq!(loaded.event.data, json!({ "name": "Ada" }));
        assert!(store.list_unfinished().await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(1);
        assert_eq!(store.list_terminal_before(later).await.unwrap(), vec![instance.id]);
    }
}
