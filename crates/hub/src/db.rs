use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::model::{NewSchedule, ScheduleStatus, WateringSchedule};
use crate::sources::ScheduleStore;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/garden-hub/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to :memory: is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ScheduleRow {
    id: String,
    garden_id: String,
    scheduled_at: i64,
    amount: Option<f64>,
    reason: Option<String>,
    status: String,
    notes: Option<String>,
    created_at: i64,
    updated_at: i64,
}

const COLUMNS: &str =
    "id, garden_id, scheduled_at, amount, reason, status, notes, created_at, updated_at";

fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(ms: i64) -> CoreResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|e| CoreError::upstream(format!("schedule store: bad timestamp {ms}: {e}")))
}

impl TryFrom<ScheduleRow> for WateringSchedule {
    type Error = CoreError;

    fn try_from(r: ScheduleRow) -> CoreResult<Self> {
        let status = ScheduleStatus::parse(&r.status).ok_or_else(|| {
            CoreError::upstream(format!(
                "schedule store: row '{}' has unknown status '{}'",
                r.id, r.status
            ))
        })?;
        Ok(Self {
            scheduled_at: from_millis(r.scheduled_at)?,
            created_at: from_millis(r.created_at)?,
            updated_at: from_millis(r.updated_at)?,
            id: r.id,
            garden_id: r.garden_id,
            amount: r.amount,
            reason: r.reason,
            status,
            notes: r.notes,
        })
    }
}

fn store_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> CoreError {
    move |e| CoreError::upstream(format!("schedule store {op} failed: {e}"))
}

fn collect(rows: Vec<ScheduleRow>) -> CoreResult<Vec<WateringSchedule>> {
    rows.into_iter().map(WateringSchedule::try_from).collect()
}

// ---------------------------------------------------------------------------
// Schedule store
// ---------------------------------------------------------------------------

impl Db {
    async fn fetch_schedule(
        &self,
        garden_id: &str,
        schedule_id: &str,
    ) -> CoreResult<Option<WateringSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM watering_schedules WHERE id = ? AND garden_id = ?"
        ))
        .bind(schedule_id)
        .bind(garden_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("fetch"))?;
        row.map(WateringSchedule::try_from).transpose()
    }
}

impl ScheduleStore for Db {
    async fn list(&self, garden_id: &str) -> CoreResult<Vec<WateringSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM watering_schedules
             WHERE garden_id = ?
             ORDER BY scheduled_at DESC"
        ))
        .bind(garden_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("list"))?;
        collect(rows)
    }

    async fn upcoming(&self, garden_id: &str, limit: usize) -> CoreResult<Vec<WateringSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM watering_schedules
             WHERE garden_id = ? AND status = 'PENDING' AND scheduled_at >= ?
             ORDER BY scheduled_at ASC
             LIMIT ?"
        ))
        .bind(garden_id)
        .bind(to_millis(OffsetDateTime::now_utc()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("upcoming"))?;
        collect(rows)
    }

    async fn create(&self, new: NewSchedule) -> CoreResult<WateringSchedule> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = to_millis(OffsetDateTime::now_utc());
        sqlx::query(
            "INSERT INTO watering_schedules
               (id, garden_id, scheduled_at, amount, reason, status, notes, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'PENDING', ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.garden_id)
        .bind(to_millis(new.scheduled_at))
        .bind(new.amount)
        .bind(&new.reason)
        .bind(&new.notes)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err("insert"))?;

        debug!(garden = %new.garden_id, schedule = %id, "schedule row inserted");
        self.fetch_schedule(&new.garden_id, &id)
            .await?
            .ok_or_else(|| CoreError::not_found("schedule", id))
    }

    async fn set_status(
        &self,
        garden_id: &str,
        schedule_id: &str,
        status: ScheduleStatus,
    ) -> CoreResult<WateringSchedule> {
        let updated = sqlx::query(
            "UPDATE watering_schedules
             SET status = ?, updated_at = ?
             WHERE id = ? AND garden_id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(to_millis(OffsetDateTime::now_utc()))
        .bind(schedule_id)
        .bind(garden_id)
        .execute(&self.pool)
        .await
        .map_err(store_err("update"))?
        .rows_affected();

        let current = self
            .fetch_schedule(garden_id, schedule_id)
            .await?
            .ok_or_else(|| CoreError::not_found("schedule", schedule_id))?;
        if updated == 0 {
            return Err(CoreError::Conflict(format!(
                "schedule '{schedule_id}' is already {}",
                current.status
            )));
        }
        Ok(current)
    }

    async fn delete(&self, garden_id: &str, schedule_id: &str) -> CoreResult<()> {
        let deleted = sqlx::query("DELETE FROM watering_schedules WHERE id = ? AND garden_id = ?")
            .bind(schedule_id)
            .bind(garden_id)
            .execute(&self.pool)
            .await
            .map_err(store_err("delete"))?
            .rows_affected();
        if deleted == 0 {
            return Err(CoreError::not_found("schedule", schedule_id));
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
