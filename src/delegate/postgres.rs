//! PostgreSQL trigger delegate.
//!
//! Uses sqlx for persistent storage. Exclusion sets bind as
//! `job_type <> ALL($n)` array parameters; per-type remaining limits
//! bind as parallel `unnest` arrays so the counting queries apply them
//! inside `FILTER`-based aggregates in a single statement.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::catalog::JobTypeRegistry;
use crate::config::DatabaseConfig;
use crate::domain::{
    FiredState, FiredTriggerRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::error::Result;

use super::{QueuedJobRow, TriggerDelegate, TypeFilterSnapshot};

const QUEUED_STATES_SQL: &str = "('WAITING', 'BLOCKED', 'PAUSED', 'PAUSED_BLOCKED')";

/// Delegate over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgTriggerDelegate {
    pool: PgPool,
}

impl PgTriggerDelegate {
    /// Connect a new pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(crate::error::SchedulerError::persistence)?;
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn excluded_vec(filter: &TypeFilterSnapshot) -> Vec<String> {
    filter.excluded.iter().cloned().collect()
}

/// Split the snapshot's remaining limits into parallel arrays for
/// `unnest` binds.
fn limit_arrays(filter: &TypeFilterSnapshot) -> (Vec<String>, Vec<i64>) {
    filter
        .limits
        .iter()
        .map(|(job_type, limit)| (job_type.clone(), *limit as i64))
        .unzip()
}

#[async_trait]
impl TriggerDelegate for PgTriggerDelegate {
    async fn select_triggers_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        filter: &TypeFilterSnapshot,
    ) -> Result<Vec<Trigger>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT trigger_group, trigger_name, job_group, job_name, job_type,
                   state, start_time, next_fire_time, prev_fire_time,
                   schedule, priority, calendar_name, fire_instance_id
            FROM triggers
            WHERE state = 'WAITING'
              AND next_fire_time IS NOT NULL
              AND next_fire_time <= $1
              AND job_type <> ALL($2)
            ORDER BY next_fire_time ASC, priority DESC, trigger_group ASC, trigger_name ASC
            LIMIT $3
            "#,
        )
        .bind(no_later_than)
        .bind(excluded_vec(filter))
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TriggerRow::into_trigger).collect()
    }

    async fn select_waiting_trigger_count(&self, filter: &TypeFilterSnapshot) -> Result<usize> {
        let (limit_types, limit_values) = limit_arrays(filter);
        let waiting: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(LEAST(counts.waiting, COALESCE(l.remaining, counts.waiting))), 0)::bigint
            FROM (
                SELECT job_type, COUNT(*) FILTER (WHERE state = 'WAITING') AS waiting
                FROM triggers
                WHERE job_type <> ALL($1)
                GROUP BY job_type
            ) AS counts
            LEFT JOIN unnest($2::text[], $3::bigint[]) AS l(job_type, remaining)
                ON l.job_type = counts.job_type
            "#,
        )
        .bind(excluded_vec(filter))
        .bind(&limit_types)
        .bind(&limit_values)
        .fetch_one(&self.pool)
        .await?;
        Ok(waiting as usize)
    }

    async fn select_blocked_trigger_count(
        &self,
        filter: &TypeFilterSnapshot,
        registry: &JobTypeRegistry,
    ) -> Result<usize> {
        let (limit_types, limit_values) = limit_arrays(filter);
        let known_types: Vec<String> = registry.all().into_keys().collect();

        // A WAITING row counts as blocked when its type is excluded, no
        // longer resolvable, or beyond the type's remaining limit.
        let blocked: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                counts.blocked
                + CASE
                    WHEN counts.job_type = ANY($1) THEN counts.waiting
                    WHEN counts.job_type <> ALL($2) THEN counts.waiting
                    ELSE GREATEST(counts.waiting - COALESCE(l.remaining, counts.waiting), 0)
                  END
            ), 0)::bigint
            FROM (
                SELECT job_type,
                       COUNT(*) FILTER (WHERE state = 'WAITING') AS waiting,
                       COUNT(*) FILTER (WHERE state IN ('BLOCKED', 'PAUSED_BLOCKED')) AS blocked
                FROM triggers
                GROUP BY job_type
            ) AS counts
            LEFT JOIN unnest($3::text[], $4::bigint[]) AS l(job_type, remaining)
                ON l.job_type = counts.job_type
            "#,
        )
        .bind(excluded_vec(filter))
        .bind(&known_types)
        .bind(&limit_types)
        .bind(&limit_values)
        .fetch_one(&self.pool)
        .await?;
        Ok(blocked as usize)
    }

    async fn select_total_waiting_trigger_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM triggers WHERE state IN {QUEUED_STATES_SQL}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn select_job_type_counts(
        &self,
        filter: &TypeFilterSnapshot,
    ) -> Result<HashMap<String, usize>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            r#"
            SELECT job_type, COUNT(*)
            FROM triggers
            WHERE state IN {QUEUED_STATES_SQL}
              AND job_type <> ALL($1)
            GROUP BY job_type
            "#
        ))
        .bind(excluded_vec(filter))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(job_type, count)| (job_type, count as usize))
            .collect())
    }

    async fn select_jobs(&self, max_count: usize, offset: usize) -> Result<Vec<QueuedJobRow>> {
        let rows = sqlx::query_as::<_, QueuedJobRowDb>(&format!(
            r#"
            SELECT j.job_group, j.job_name, j.job_type, j.data, j.durable,
                   j.requests_recovery, j.description,
                   t.state AS trigger_state, t.next_fire_time
            FROM job_details j
            JOIN LATERAL (
                SELECT state, next_fire_time
                FROM triggers
                WHERE job_group = j.job_group
                  AND job_name = j.job_name
                  AND state IN {QUEUED_STATES_SQL}
                ORDER BY next_fire_time ASC NULLS LAST
                LIMIT 1
            ) t ON TRUE
            ORDER BY t.next_fire_time ASC NULLS LAST, j.job_group, j.job_name
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(max_count as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedJobRowDb::into_row).collect()
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
            SELECT trigger_group, trigger_name, job_group, job_name, job_type,
                   state, start_time, next_fire_time, prev_fire_time,
                   schedule, priority, calendar_name, fire_instance_id
            FROM triggers
            WHERE trigger_group = $1 AND trigger_name = $2
            "#,
        )
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TriggerRow::into_trigger).transpose()
    }

    async fn store_trigger(&self, trigger: &Trigger) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO triggers (trigger_group, trigger_name, job_group, job_name, job_type,
                                  state, start_time, next_fire_time, prev_fire_time,
                                  schedule, priority, calendar_name, fire_instance_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (trigger_group, trigger_name) DO UPDATE SET
                state = EXCLUDED.state,
                next_fire_time = EXCLUDED.next_fire_time,
                prev_fire_time = EXCLUDED.prev_fire_time,
                schedule = EXCLUDED.schedule,
                priority = EXCLUDED.priority,
                calendar_name = EXCLUDED.calendar_name,
                fire_instance_id = EXCLUDED.fire_instance_id
            "#,
        )
        .bind(&trigger.key.group)
        .bind(&trigger.key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_type)
        .bind(trigger.state.as_str())
        .bind(trigger.start_time)
        .bind(trigger.next_fire_time)
        .bind(trigger.previous_fire_time)
        .bind(serde_json::to_value(&trigger.schedule)?)
        .bind(trigger.priority)
        .bind(&trigger.calendar_name)
        .bind(trigger.fire_instance_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cas_trigger_state(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
        next_fire_time_fence: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE triggers
            SET state = $1
            WHERE trigger_group = $2 AND trigger_name = $3
              AND state = $4
              AND ($5::timestamptz IS NULL OR next_fire_time = $5)
            "#,
        )
        .bind(to.as_str())
        .bind(&key.group)
        .bind(&key.name)
        .bind(from.as_str())
        .bind(next_fire_time_fence)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_trigger_state(&self, key: &TriggerKey, state: TriggerState) -> Result<()> {
        sqlx::query("UPDATE triggers SET state = $1 WHERE trigger_group = $2 AND trigger_name = $3")
            .bind(state.as_str())
            .bind(&key.group)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_trigger_states_for_job(
        &self,
        job_key: &JobKey,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64> {
        let mut changed = 0;
        for (from, to) in transitions {
            let result = sqlx::query(
                r#"
                UPDATE triggers
                SET state = $1
                WHERE job_group = $2 AND job_name = $3 AND state = $4
                "#,
            )
            .bind(to.as_str())
            .bind(&job_key.group)
            .bind(&job_key.name)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    async fn update_trigger_states_for_types(
        &self,
        types: &HashSet<String>,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64> {
        let types: Vec<String> = types.iter().cloned().collect();
        let mut changed = 0;
        for (from, to) in transitions {
            let result = sqlx::query(
                r#"
                UPDATE triggers
                SET state = $1
                WHERE job_type = ANY($2) AND state = $3
                "#,
            )
            .bind(to.as_str())
            .bind(&types)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            changed += result.rows_affected();
        }
        Ok(changed)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM triggers WHERE trigger_group = $1 AND trigger_name = $2")
                .bind(&key.group)
                .bind(&key.name)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        let row = sqlx::query_as::<_, JobDetailRow>(
            r#"
            SELECT job_group, job_name, job_type, data, durable, requests_recovery, description
            FROM job_details
            WHERE job_group = $1 AND job_name = $2
            "#,
        )
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(JobDetailRow::into_detail))
    }

    async fn store_job(&self, detail: &JobDetail) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_details (job_group, job_name, job_type, data, durable,
                                     requests_recovery, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_group, job_name) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                data = EXCLUDED.data,
                durable = EXCLUDED.durable,
                requests_recovery = EXCLUDED.requests_recovery,
                description = EXCLUDED.description
            "#,
        )
        .bind(&detail.key.group)
        .bind(&detail.key.name)
        .bind(&detail.job_type)
        .bind(serde_json::Value::Object(detail.data.clone()))
        .bind(detail.durable)
        .bind(detail.requests_recovery)
        .bind(&detail.description)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_details WHERE job_group = $1 AND job_name = $2")
            .bind(&key.group)
            .bind(&key.name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_fired_trigger(&self, record: &FiredTriggerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fired_triggers (fire_instance_id, scheduler_instance_id, state,
                                        trigger_group, trigger_name, job_group, job_name,
                                        job_type, fired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.fire_instance_id)
        .bind(&record.scheduler_instance_id)
        .bind(record.state.as_str())
        .bind(&record.trigger_key.group)
        .bind(&record.trigger_key.name)
        .bind(&record.job_key.group)
        .bind(&record.job_key.name)
        .bind(&record.job_type)
        .bind(record.fired_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_fired_trigger_state(
        &self,
        fire_instance_id: Uuid,
        state: FiredState,
    ) -> Result<()> {
        sqlx::query("UPDATE fired_triggers SET state = $1 WHERE fire_instance_id = $2")
            .bind(state.as_str())
            .bind(fire_instance_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_fired_trigger(&self, fire_instance_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM fired_triggers WHERE fire_instance_id = $1")
            .bind(fire_instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn select_fired_trigger_states(&self, instance_id: &str) -> Result<Vec<FiredState>> {
        let states: Vec<String> = sqlx::query_scalar(
            "SELECT state FROM fired_triggers WHERE scheduler_instance_id = $1",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        states.iter().map(|s| FiredState::parse(s)).collect()
    }

    async fn delete_fired_triggers_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query_as::<_, FiredTriggerRow>(
            r#"
            DELETE FROM fired_triggers
            WHERE scheduler_instance_id = $1
            RETURNING fire_instance_id, scheduler_instance_id, state,
                      trigger_group, trigger_name, job_group, job_name, job_type, fired_at
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FiredTriggerRow::into_record).collect()
    }

    async fn calendar_exists(&self, name: &str) -> Result<bool> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM calendars WHERE calendar_name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types (for sqlx queries)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct TriggerRow {
    trigger_group: String,
    trigger_name: String,
    job_group: String,
    job_name: String,
    job_type: String,
    state: String,
    start_time: DateTime<Utc>,
    next_fire_time: Option<DateTime<Utc>>,
    prev_fire_time: Option<DateTime<Utc>>,
    schedule: serde_json::Value,
    priority: i32,
    calendar_name: Option<String>,
    fire_instance_id: Option<Uuid>,
}

impl TriggerRow {
    fn into_trigger(self) -> Result<Trigger> {
        Ok(Trigger {
            key: TriggerKey::new(self.trigger_group, self.trigger_name),
            job_key: JobKey::new(self.job_group, self.job_name),
            job_type: self.job_type,
            state: TriggerState::parse(&self.state)?,
            start_time: self.start_time,
            next_fire_time: self.next_fire_time,
            previous_fire_time: self.prev_fire_time,
            schedule: serde_json::from_value(self.schedule)?,
            priority: self.priority,
            calendar_name: self.calendar_name,
            fire_instance_id: self.fire_instance_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobDetailRow {
    job_group: String,
    job_name: String,
    job_type: String,
    data: serde_json::Value,
    durable: bool,
    requests_recovery: bool,
    description: Option<String>,
}

impl JobDetailRow {
    fn into_detail(self) -> JobDetail {
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        JobDetail {
            key: JobKey::new(self.job_group, self.job_name),
            job_type: self.job_type,
            data,
            durable: self.durable,
            requests_recovery: self.requests_recovery,
            description: self.description,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QueuedJobRowDb {
    job_group: String,
    job_name: String,
    job_type: String,
    data: serde_json::Value,
    durable: bool,
    requests_recovery: bool,
    description: Option<String>,
    trigger_state: String,
    next_fire_time: Option<DateTime<Utc>>,
}

impl QueuedJobRowDb {
    fn into_row(self) -> Result<QueuedJobRow> {
        let trigger_state = TriggerState::parse(&self.trigger_state)?;
        let data = match self.data {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Ok(QueuedJobRow {
            detail: JobDetail {
                key: JobKey::new(self.job_group, self.job_name),
                job_type: self.job_type,
                data,
                durable: self.durable,
                requests_recovery: self.requests_recovery,
                description: self.description,
            },
            trigger_state,
            next_fire_time: self.next_fire_time,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FiredTriggerRow {
    fire_instance_id: Uuid,
    scheduler_instance_id: String,
    state: String,
    trigger_group: String,
    trigger_name: String,
    job_group: String,
    job_name: String,
    job_type: String,
    fired_at: DateTime<Utc>,
}

impl FiredTriggerRow {
    fn into_record(self) -> Result<FiredTriggerRecord> {
        Ok(FiredTriggerRecord {
            fire_instance_id: self.fire_instance_id,
            scheduler_instance_id: self.scheduler_instance_id,
            state: FiredState::parse(&self.state)?,
            trigger_key: TriggerKey::new(self.trigger_group, self.trigger_name),
            job_key: JobKey::new(self.job_group, self.job_name),
            job_type: self.job_type,
            fired_at: self.fired_at,
        })
    }
}
