//! Persistence delegate for the scheduler store.
//!
//! The delegate extends the base job-store persistence surface with
//! queries that accept a [`TypeFilterSnapshot`]: a set of excluded job
//! types and a map of per-type remaining limits. Two implementations are
//! provided, mirroring each other's contract:
//!
//! - [`postgres::PgTriggerDelegate`] — production, over a sqlx pool
//! - [`memory::MemoryTriggerDelegate`] — tests and embedded use

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::catalog::JobTypeRegistry;
use crate::domain::{
    FiredState, FiredTriggerRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTriggerDelegate;
pub use postgres::PgTriggerDelegate;

// ═══════════════════════════════════════════════════════════════════════════════
// Filter Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime constraints applied to candidate selection and counting.
///
/// Built by the acquisition engine from the filter bus, the concurrency
/// catalog, and the executing table. Types whose caps are saturated are
/// folded into `excluded`; types with headroom appear in `limits` with the
/// *remaining* count.
#[derive(Debug, Clone, Default)]
pub struct TypeFilterSnapshot {
    /// Job types removed from candidacy entirely
    pub excluded: HashSet<String>,
    /// Per-type remaining limits (caller enforces the count via gating)
    pub limits: HashMap<String, usize>,
}

impl TypeFilterSnapshot {
    /// A snapshot that filters nothing.
    pub fn unfiltered() -> Self {
        Self::default()
    }

    pub fn is_excluded(&self, job_type: &str) -> bool {
        self.excluded.contains(job_type)
    }

    /// Remaining limit for a type; `None` means uncapped.
    pub fn remaining_limit(&self, job_type: &str) -> Option<usize> {
        self.limits.get(job_type).copied()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queued Job Row
// ═══════════════════════════════════════════════════════════════════════════════

/// A queued (not yet executing) job with its earliest pending trigger.
#[derive(Debug, Clone)]
pub struct QueuedJobRow {
    pub detail: JobDetail,
    pub trigger_state: TriggerState,
    pub next_fire_time: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delegate Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence operations the store overrides depend on.
///
/// All methods run inside the caller's trigger-access critical section;
/// implementations need not serialize against each other.
#[async_trait]
pub trait TriggerDelegate: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Candidate selection and counting
    // ─────────────────────────────────────────────────────────────────────────

    /// Due `WAITING` triggers eligible under the snapshot, ordered by
    /// next-fire-time ascending, then priority descending, then key.
    /// Only `excluded` prunes rows here; the database does not track
    /// running counts, so the acquisition gate enforces `limits`.
    async fn select_triggers_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        filter: &TypeFilterSnapshot,
    ) -> Result<Vec<Trigger>>;

    /// Count of dispatchable `WAITING` triggers (excluded types removed,
    /// limited types capped at their remaining limit).
    async fn select_waiting_trigger_count(&self, filter: &TypeFilterSnapshot) -> Result<usize>;

    /// Count of queued triggers that cannot be dispatched right now:
    /// `BLOCKED`/`PAUSED_BLOCKED` rows plus `WAITING` rows whose type is
    /// excluded, beyond its remaining limit, or no longer resolvable.
    async fn select_blocked_trigger_count(
        &self,
        filter: &TypeFilterSnapshot,
        registry: &JobTypeRegistry,
    ) -> Result<usize>;

    /// Count of all queued triggers regardless of dispatchability.
    async fn select_total_waiting_trigger_count(&self) -> Result<usize>;

    /// Queued trigger counts per job type.
    async fn select_job_type_counts(
        &self,
        filter: &TypeFilterSnapshot,
    ) -> Result<HashMap<String, usize>>;

    /// Queued jobs with their earliest pending trigger, next-fire-time
    /// order, paginated.
    async fn select_jobs(&self, max_count: usize, offset: usize) -> Result<Vec<QueuedJobRow>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Trigger and job rows
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>>;

    /// Upsert a trigger row.
    async fn store_trigger(&self, trigger: &Trigger) -> Result<()>;

    /// Compare-and-swap a trigger's state, optionally fenced on its
    /// next-fire-time. Returns `true` when exactly one row transitioned.
    async fn cas_trigger_state(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
        next_fire_time_fence: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Unconditionally set a trigger's state (error sink, pause axis).
    async fn set_trigger_state(&self, key: &TriggerKey, state: TriggerState) -> Result<()>;

    /// Sweep all triggers of one job through the given `(from, to)`
    /// transitions. Returns rows changed.
    async fn update_trigger_states_for_job(
        &self,
        job_key: &JobKey,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64>;

    /// Sweep all triggers whose job type is in `types` through the given
    /// `(from, to)` transitions. Returns rows changed.
    async fn update_trigger_states_for_types(
        &self,
        types: &HashSet<String>,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64>;

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool>;

    async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>>;

    /// Upsert a job detail row.
    async fn store_job(&self, detail: &JobDetail) -> Result<()>;

    async fn remove_job(&self, key: &JobKey) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Fired-trigger records
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_fired_trigger(&self, record: &FiredTriggerRecord) -> Result<()>;

    async fn update_fired_trigger_state(
        &self,
        fire_instance_id: Uuid,
        state: FiredState,
    ) -> Result<()>;

    async fn delete_fired_trigger(&self, fire_instance_id: Uuid) -> Result<bool>;

    /// States of all fired-trigger rows owned by one scheduler instance.
    async fn select_fired_trigger_states(&self, instance_id: &str) -> Result<Vec<FiredState>>;

    /// Delete and return all fired-trigger rows owned by one scheduler
    /// instance (startup recovery).
    async fn delete_fired_triggers_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Calendars
    // ─────────────────────────────────────────────────────────────────────────

    async fn calendar_exists(&self, name: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accessors() {
        let mut snapshot = TypeFilterSnapshot::unfiltered();
        assert!(!snapshot.is_excluded("HashFileJob"));
        assert_eq!(snapshot.remaining_limit("HashFileJob"), None);

        snapshot.excluded.insert("UdpQueryJob".to_string());
        snapshot.limits.insert("HashFileJob".to_string(), 2);
        assert!(snapshot.is_excluded("UdpQueryJob"));
        assert_eq!(snapshot.remaining_limit("HashFileJob"), Some(2));
    }
}
