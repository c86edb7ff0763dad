//! The concurrency-aware job store.
//!
//! [`ConcurrentJobStore`] owns the durable trigger table through its
//! delegate and layers runtime concurrency policy on top of it:
//!
//! - **Acquisition** promotes due `WAITING` triggers to `ACQUIRED`,
//!   filtering candidates through the acquisition filters, the
//!   concurrency catalog, and the executing table
//! - **Fire** transitions an acquired trigger's firing to `EXECUTING` and
//!   decides the trigger's post-fire state (`WAITING`, `BLOCKED`, or
//!   `COMPLETE`), blocking siblings when a cap is taken
//! - **Complete** releases the slot, unblocks siblings, and wakes the
//!   dispatcher while work remains
//!
//! Persistence operations run under a single trigger-access lock; callers
//! may assume exclusive access to the trigger table for the duration of a
//! call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ConcurrencyCatalog;
use crate::config::SchedulerConfig;
use crate::delegate::{TriggerDelegate, TypeFilterSnapshot};
use crate::domain::{
    FiredState, FiredTriggerRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::error::{Result, SchedulerError};
use crate::events::{
    ExecutingJobInfo, JobDescriber, QueueStateContext, QueueStateEvent, QueueStateListener,
    QueueStatePublisher, SchedulerMeta,
};
use crate::executing::ExecutingJobs;
use crate::filters::FilterBus;
use crate::signal::{wake_sentinel, SchedulerSignaler};

// ═══════════════════════════════════════════════════════════════════════════════
// Fire Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the dispatcher needs to run a fired job.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub trigger: Trigger,
    pub detail: JobDetail,
    pub fire_instance_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Outcome of firing one trigger in a batch.
#[derive(Debug)]
pub enum TriggerFiredResult {
    /// The job is executing
    Fired(TriggerFiredBundle),
    /// The trigger was canceled, stolen, or its calendar vanished
    Skipped { key: TriggerKey },
    /// Firing failed; the error was already logged
    Failed {
        key: TriggerKey,
        error: SchedulerError,
    },
}

/// What the dispatcher tells the store after a job finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedExecutionInstruction {
    NoInstruction,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
}

/// A row of the combined queue view: executing entries first, then queued.
#[derive(Debug, Clone)]
pub struct JobQueueEntry {
    pub name: String,
    pub description: Option<String>,
    pub job_type: String,
    pub running: bool,
    /// Queued but not dispatchable right now
    pub blocked: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistent, concurrency-aware job scheduler store.
pub struct ConcurrentJobStore {
    delegate: Arc<dyn TriggerDelegate>,
    catalog: ConcurrencyCatalog,
    filters: FilterBus,
    executing: ExecutingJobs,
    publisher: QueueStatePublisher,
    signaler: Arc<dyn SchedulerSignaler>,
    describer: Arc<dyn JobDescriber>,
    thread_count: usize,
    instance_id: String,
    acquire_retries: u32,
    trigger_access: Mutex<()>,
}

impl ConcurrentJobStore {
    /// Build the store and wire filter changes to the dispatcher signaler.
    ///
    /// Must run inside a tokio runtime; filter watchers are spawned here.
    pub fn new(
        delegate: Arc<dyn TriggerDelegate>,
        catalog: ConcurrencyCatalog,
        filters: FilterBus,
        signaler: Arc<dyn SchedulerSignaler>,
        meta: &dyn SchedulerMeta,
        describer: Arc<dyn JobDescriber>,
        config: &SchedulerConfig,
    ) -> Self {
        filters.forward_changes(signaler.clone());
        let thread_count = meta.thread_pool_size();
        info!(
            instance_id = %config.instance_id,
            thread_count,
            "concurrency-aware job store ready"
        );
        Self {
            delegate,
            catalog,
            filters,
            executing: ExecutingJobs::new(),
            publisher: QueueStatePublisher::new(),
            signaler,
            describer,
            thread_count,
            instance_id: config.instance_id.clone(),
            acquire_retries: config.acquire_retries,
            trigger_access: Mutex::new(()),
        }
    }

    /// Register a queue-state listener.
    pub fn register_listener(&self, listener: Arc<dyn QueueStateListener>) {
        self.publisher.register(listener);
    }

    /// The concurrency catalog in effect.
    pub fn catalog(&self) -> &ConcurrencyCatalog {
        &self.catalog
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acquisition
    // ─────────────────────────────────────────────────────────────────────────

    /// Acquire up to `max_count` due triggers, promoting each from
    /// `WAITING` to `ACQUIRED` and recording a fired-trigger row.
    ///
    /// Candidates are evaluated in next-fire-time order and gated against
    /// the executing table plus the batch acquired so far. A cancelled
    /// call returns the partial batch; those triggers stay `ACQUIRED` and
    /// are picked up next round.
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        token: &CancellationToken,
    ) -> Result<Vec<Trigger>> {
        if max_count == 0 {
            return Err(SchedulerError::validation("max_count must be positive"));
        }
        let _guard = self.trigger_access.lock().await;

        let snapshot = self.build_filter_snapshot();
        debug!(
            excluded = snapshot.excluded.len(),
            limited = snapshot.limits.len(),
            "acquisition snapshot built"
        );

        let mut acquired: Vec<Trigger> = Vec::new();
        let mut attempt = 0;
        loop {
            match self
                .acquire_round(no_later_than, max_count, time_window, &snapshot, token)
                .await
            {
                Ok(batch) => acquired = batch,
                Err(error) => {
                    error.log();
                    return Err(error);
                }
            }
            attempt += 1;
            if !acquired.is_empty() || attempt >= self.acquire_retries || token.is_cancelled() {
                break;
            }
        }

        if !acquired.is_empty() {
            counter!("scheduler_triggers_acquired_total").increment(acquired.len() as u64);
        }
        Ok(acquired)
    }

    async fn acquire_round(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
        snapshot: &TypeFilterSnapshot,
        token: &CancellationToken,
    ) -> Result<Vec<Trigger>> {
        let candidates = self
            .delegate
            .select_triggers_to_acquire(no_later_than + time_window, max_count, snapshot)
            .await?;

        let mut acquired: Vec<Trigger> = Vec::new();
        let mut local_counts: HashMap<String, usize> = HashMap::new();
        let mut batch_end: Option<DateTime<Utc>> = None;

        for candidate in candidates {
            if token.is_cancelled() {
                debug!("acquisition cancelled; returning partial batch");
                break;
            }

            // Re-retrieve: the row may have raced away since selection.
            let Some(trigger) = self.delegate.get_trigger(&candidate.key).await? else {
                continue;
            };
            if trigger.state != TriggerState::Waiting {
                continue;
            }

            if let Err(error) = self.catalog.registry().resolve(&trigger.job_type) {
                error.log();
                self.delegate
                    .set_trigger_state(&trigger.key, TriggerState::Error)
                    .await?;
                warn!(trigger = %trigger.key, job_type = %trigger.job_type,
                      "trigger moved to ERROR: job type did not resolve");
                continue;
            }

            if !self.job_allowed(&trigger.job_type, &mut local_counts) {
                continue;
            }

            if let (Some(end), Some(next)) = (batch_end, trigger.next_fire_time) {
                if next > end {
                    break;
                }
            }

            let moved = self
                .delegate
                .cas_trigger_state(
                    &trigger.key,
                    TriggerState::Waiting,
                    TriggerState::Acquired,
                    trigger.next_fire_time,
                )
                .await?;
            if !moved {
                continue;
            }

            let fire_instance_id = Uuid::new_v4();
            let now = Utc::now();
            self.delegate
                .insert_fired_trigger(&FiredTriggerRecord {
                    fire_instance_id,
                    scheduler_instance_id: self.instance_id.clone(),
                    state: FiredState::Acquired,
                    trigger_key: trigger.key.clone(),
                    job_key: trigger.job_key.clone(),
                    job_type: trigger.job_type.clone(),
                    fired_at: now,
                })
                .await?;

            let mut owned = trigger.clone();
            owned.state = TriggerState::Acquired;
            owned.fire_instance_id = Some(fire_instance_id);
            self.delegate.store_trigger(&owned).await?;

            if acquired.is_empty() {
                let next = owned.next_fire_time.unwrap_or(now);
                batch_end = Some(next.max(now) + time_window);
            }
            debug!(trigger = %owned.key, job_type = %owned.job_type, "trigger acquired");
            acquired.push(owned);
        }

        Ok(acquired)
    }

    /// Gate one candidate against the executing table and the batch
    /// acquired so far. Rules apply in order; the first match decides.
    fn job_allowed(&self, job_type: &str, local_counts: &mut HashMap<String, usize>) -> bool {
        if self.catalog.disallows_concurrent(job_type) {
            if self.executing.any_of_type(job_type)
                || local_counts.get(job_type).copied().unwrap_or(0) >= 1
            {
                return false;
            }
            *local_counts.entry(job_type.to_string()).or_insert(0) += 1;
            return true;
        }

        if let Some(group) = self.catalog.group(job_type) {
            let members = self
                .catalog
                .group_members(group)
                .cloned()
                .unwrap_or_default();
            if self.executing.any_of_types(&members) || local_counts.contains_key(group) {
                return false;
            }
            local_counts.insert(group.to_string(), 1);
            return true;
        }

        if let Some(limit) = self.catalog.limit(job_type) {
            return self.admit_up_to(job_type, limit, local_counts);
        }

        // Types registered after catalog construction still honor their
        // declared limit.
        if let Some(declared) = self.catalog.declared_limit(job_type) {
            return self.admit_up_to(job_type, declared.max(1), local_counts);
        }

        true
    }

    fn admit_up_to(
        &self,
        job_type: &str,
        limit: usize,
        local_counts: &mut HashMap<String, usize>,
    ) -> bool {
        let running = self.executing.count_of_type(job_type);
        let local = local_counts.get(job_type).copied().unwrap_or(0);
        if running + local < limit {
            *local_counts.entry(job_type.to_string()).or_insert(0) += 1;
            true
        } else {
            false
        }
    }

    /// Combine the filter bus, the catalog, and the executing table into
    /// the snapshot handed to the delegate. Saturated caps and occupied
    /// groups fold into the exclusion set; types with headroom publish
    /// their remaining limits.
    fn build_filter_snapshot(&self) -> TypeFilterSnapshot {
        let mut snapshot = TypeFilterSnapshot {
            excluded: self.filters.excluded_types(),
            limits: HashMap::new(),
        };

        for (job_type, limit) in self.catalog.limits() {
            let running = self.executing.count_of_type(job_type);
            let remaining = limit.saturating_sub(running);
            if remaining == 0 {
                snapshot.excluded.insert(job_type.clone());
            } else {
                snapshot.limits.insert(job_type.clone(), remaining);
            }
        }

        for group in self.catalog.group_names() {
            let Some(members) = self.catalog.group_members(group) else {
                continue;
            };
            if self.executing.any_of_types(members) {
                snapshot.excluded.extend(members.iter().cloned());
            } else {
                // Mutual exclusion reads as a unit cap until the first
                // acquisition takes the group.
                for member in members {
                    snapshot
                        .limits
                        .entry(member.clone())
                        .and_modify(|limit| *limit = (*limit).min(1))
                        .or_insert(1);
                }
            }
        }

        snapshot
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fire
    // ─────────────────────────────────────────────────────────────────────────

    /// Fire a batch of acquired triggers.
    ///
    /// Each trigger runs through [`Self::trigger_fired`]; afterwards the
    /// fired-trigger rows of this instance are re-read to confirm that at
    /// least one returned bundle is actually `EXECUTING`.
    pub async fn triggers_fired(
        &self,
        triggers: &[Trigger],
        token: &CancellationToken,
    ) -> Result<Vec<TriggerFiredResult>> {
        let _guard = self.trigger_access.lock().await;

        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            if token.is_cancelled() {
                break;
            }
            match self.trigger_fired(trigger).await {
                Ok(Some(bundle)) => results.push(TriggerFiredResult::Fired(bundle)),
                Ok(None) => results.push(TriggerFiredResult::Skipped {
                    key: trigger.key.clone(),
                }),
                Err(error) => {
                    error.log();
                    results.push(TriggerFiredResult::Failed {
                        key: trigger.key.clone(),
                        error,
                    });
                }
            }
        }

        let any_fired = results
            .iter()
            .any(|r| matches!(r, TriggerFiredResult::Fired(_)));
        if any_fired {
            let states = self
                .delegate
                .select_fired_trigger_states(&self.instance_id)
                .await?;
            if !states.contains(&FiredState::Executing) {
                return Err(SchedulerError::new(
                    crate::error::ErrorCode::Persistence,
                    "fired batch validation failed: no trigger reached EXECUTING",
                ));
            }
        }

        Ok(results)
    }

    async fn trigger_fired(&self, trigger: &Trigger) -> Result<Option<TriggerFiredBundle>> {
        let Some(mut current) = self.delegate.get_trigger(&trigger.key).await? else {
            return Ok(None);
        };
        // Canceled or stolen since acquisition.
        if current.state != TriggerState::Acquired {
            return Ok(None);
        }

        let detail = match self.delegate.get_job_detail(&current.job_key).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                self.delegate
                    .set_trigger_state(&current.key, TriggerState::Error)
                    .await?;
                return Err(SchedulerError::invalid_state(format!(
                    "job detail missing for trigger {}",
                    current.key
                )));
            }
            Err(error) => {
                self.delegate
                    .set_trigger_state(&current.key, TriggerState::Error)
                    .await?;
                return Err(error);
            }
        };

        if let Some(calendar) = &current.calendar_name {
            if !self.delegate.calendar_exists(calendar).await? {
                warn!(trigger = %current.key, calendar = %calendar, "calendar vanished; skipping fire");
                return Ok(None);
            }
        }

        let fire_instance_id = current.fire_instance_id.ok_or_else(|| {
            SchedulerError::internal(format!("acquired trigger {} has no fire instance", current.key))
        })?;
        self.delegate
            .update_fired_trigger_state(fire_instance_id, FiredState::Executing)
            .await?;

        current.triggered();

        let started_at = Utc::now();
        if !self.executing.insert(detail.clone(), started_at) {
            warn!(job = %detail.key, "job already marked executing");
        }

        // Decide the post-fire trigger state. The gate runs once, with
        // this job already counted in the executing table: the question
        // is whether admitting one more would still fit the caps.
        let mut next_state = if self.job_allowed(&current.job_type, &mut HashMap::new()) {
            TriggerState::Waiting
        } else {
            self.block_siblings(&current).await?;
            TriggerState::Blocked
        };
        if current.next_fire_time.is_none() {
            next_state = TriggerState::Complete;
        }
        current.state = next_state;
        self.delegate.store_trigger(&current).await?;

        debug!(trigger = %current.key, state = %next_state, "trigger fired");
        self.publish(QueueStateEvent::Executing).await;

        Ok(Some(TriggerFiredBundle {
            trigger: current,
            detail,
            fire_instance_id,
            started_at,
        }))
    }

    /// Block every sibling that would contend for the slot this firing
    /// just took: other triggers of the same job for singleton jobs,
    /// all members for grouped types, the type itself for limited types.
    async fn block_siblings(&self, trigger: &Trigger) -> Result<()> {
        const BLOCKING: [(TriggerState, TriggerState); 3] = [
            (TriggerState::Waiting, TriggerState::Blocked),
            (TriggerState::Acquired, TriggerState::Blocked),
            (TriggerState::Paused, TriggerState::PausedBlocked),
        ];

        let changed = if self.catalog.disallows_concurrent(&trigger.job_type) {
            self.delegate
                .update_trigger_states_for_job(&trigger.job_key, &BLOCKING)
                .await?
        } else {
            let types = self.sibling_types(&trigger.job_type);
            self.delegate
                .update_trigger_states_for_types(&types, &BLOCKING)
                .await?
        };
        if changed > 0 {
            debug!(trigger = %trigger.key, siblings = changed, "siblings blocked");
        }
        Ok(())
    }

    fn sibling_types(&self, job_type: &str) -> HashSet<String> {
        match self.catalog.group(job_type) {
            Some(group) => self
                .catalog
                .group_members(group)
                .cloned()
                .unwrap_or_default(),
            None => HashSet::from([job_type.to_string()]),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Complete
    // ─────────────────────────────────────────────────────────────────────────

    /// Finish a fired job: base bookkeeping, slot release, sibling
    /// unblocking, and a dispatcher wake-up while work remains.
    pub async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        let _guard = self.trigger_access.lock().await;

        if let Some(fire_instance_id) = trigger.fire_instance_id {
            self.delegate.delete_fired_trigger(fire_instance_id).await?;
        }

        match instruction {
            CompletedExecutionInstruction::NoInstruction => {}
            CompletedExecutionInstruction::DeleteTrigger => {
                self.delegate.remove_trigger(&trigger.key).await?;
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.delegate
                    .set_trigger_state(&trigger.key, TriggerState::Complete)
                    .await?;
            }
            CompletedExecutionInstruction::SetTriggerError => {
                self.delegate
                    .set_trigger_state(&trigger.key, TriggerState::Error)
                    .await?;
            }
        }

        // Release the slot before sweeping so the freed capacity is
        // visible to the next gate.
        self.executing.remove(&detail.key);

        if self.catalog.is_constrained(&detail.job_type) {
            const UNBLOCKING: [(TriggerState, TriggerState); 2] = [
                (TriggerState::Blocked, TriggerState::Waiting),
                (TriggerState::PausedBlocked, TriggerState::Paused),
            ];
            let changed = if self.catalog.disallows_concurrent(&detail.job_type) {
                self.delegate
                    .update_trigger_states_for_job(&detail.key, &UNBLOCKING)
                    .await?
            } else {
                let types = self.sibling_types(&detail.job_type);
                self.delegate
                    .update_trigger_states_for_types(&types, &UNBLOCKING)
                    .await?
            };
            if changed > 0 {
                debug!(job = %detail.key, siblings = changed, "siblings unblocked");
            }
        }

        counter!("scheduler_jobs_completed_total").increment(1);
        self.publish(QueueStateEvent::Completed).await;

        let snapshot = self.build_filter_snapshot();
        let waiting = self.delegate.select_waiting_trigger_count(&snapshot).await?;
        let blocked = self
            .delegate
            .select_blocked_trigger_count(&snapshot, self.catalog.registry())
            .await?;
        if waiting + blocked > 0 {
            self.signaler.signal_scheduling_change(wake_sentinel()).await;
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Storing
    // ─────────────────────────────────────────────────────────────────────────

    /// Upsert a job detail and publish the queue snapshot.
    pub async fn store_job(&self, detail: &JobDetail) -> Result<()> {
        let _guard = self.trigger_access.lock().await;
        self.delegate.store_job(detail).await?;
        self.publish(QueueStateEvent::Added).await;
        Ok(())
    }

    /// Upsert a trigger and publish the queue snapshot.
    pub async fn store_trigger(&self, trigger: &Trigger) -> Result<()> {
        let _guard = self.trigger_access.lock().await;
        self.delegate.store_trigger(trigger).await?;
        self.publish(QueueStateEvent::Added).await;
        Ok(())
    }

    /// Store a job together with its trigger.
    pub async fn store_job_and_trigger(&self, detail: &JobDetail, trigger: &Trigger) -> Result<()> {
        let _guard = self.trigger_access.lock().await;
        self.delegate.store_job(detail).await?;
        self.delegate.store_trigger(trigger).await?;
        self.publish(QueueStateEvent::Added).await;
        Ok(())
    }

    /// Remove a trigger row.
    pub async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        let _guard = self.trigger_access.lock().await;
        self.delegate.remove_trigger(key).await
    }

    /// Remove a job detail row.
    pub async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        let _guard = self.trigger_access.lock().await;
        self.delegate.remove_job(key).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pause Axis
    // ─────────────────────────────────────────────────────────────────────────

    /// Pause every trigger of one job type.
    pub async fn pause_job_type(&self, job_type: &str) -> Result<u64> {
        let _guard = self.trigger_access.lock().await;
        let types = HashSet::from([job_type.to_string()]);
        self.delegate
            .update_trigger_states_for_types(
                &types,
                &[
                    (TriggerState::Waiting, TriggerState::Paused),
                    (TriggerState::Blocked, TriggerState::PausedBlocked),
                ],
            )
            .await
    }

    /// Resume every trigger of one job type.
    pub async fn resume_job_type(&self, job_type: &str) -> Result<u64> {
        let _guard = self.trigger_access.lock().await;
        let types = HashSet::from([job_type.to_string()]);
        self.delegate
            .update_trigger_states_for_types(
                &types,
                &[
                    (TriggerState::Paused, TriggerState::Waiting),
                    (TriggerState::PausedBlocked, TriggerState::Blocked),
                ],
            )
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Recover orphaned firings of this instance after a restart: delete
    /// their fired-trigger rows and return the triggers to `WAITING`.
    pub async fn recover_fired_triggers(&self) -> Result<usize> {
        let _guard = self.trigger_access.lock().await;
        let orphans = self
            .delegate
            .delete_fired_triggers_for_instance(&self.instance_id)
            .await?;
        for record in &orphans {
            if let Some(mut trigger) = self.delegate.get_trigger(&record.trigger_key).await? {
                if trigger.state == TriggerState::Acquired {
                    trigger.state = TriggerState::Waiting;
                    trigger.fire_instance_id = None;
                    self.delegate.store_trigger(&trigger).await?;
                }
            }
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "recovered orphaned fired triggers");
        }
        Ok(orphans.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Dispatchable waiting triggers under the current snapshot.
    pub async fn get_waiting_triggers_count(&self) -> Result<usize> {
        let snapshot = self.build_filter_snapshot();
        self.delegate.select_waiting_trigger_count(&snapshot).await
    }

    /// Queued triggers held back by state or by the current snapshot.
    pub async fn get_blocked_triggers_count(&self) -> Result<usize> {
        let snapshot = self.build_filter_snapshot();
        self.delegate
            .select_blocked_trigger_count(&snapshot, self.catalog.registry())
            .await
    }

    /// All queued triggers regardless of dispatchability.
    pub async fn get_total_waiting_triggers_count(&self) -> Result<usize> {
        self.delegate.select_total_waiting_trigger_count().await
    }

    /// Queued trigger counts per job type under the current snapshot.
    pub async fn get_job_counts(&self) -> Result<HashMap<String, usize>> {
        let snapshot = self.build_filter_snapshot();
        self.delegate.select_job_type_counts(&snapshot).await
    }

    /// Combined queue view: executing entries first (sorted by start
    /// time), then queued entries flagged `blocked` when held back at the
    /// moment of the call.
    pub async fn get_jobs(
        &self,
        max_count: usize,
        offset: usize,
        token: &CancellationToken,
    ) -> Result<Vec<JobQueueEntry>> {
        let snapshot = self.build_filter_snapshot();

        let mut entries: Vec<JobQueueEntry> = self
            .executing
            .snapshot_sorted()
            .into_iter()
            .map(|job| {
                let (name, description) = self.describer.describe(&job.detail);
                JobQueueEntry {
                    name,
                    description,
                    job_type: job.detail.job_type,
                    running: true,
                    blocked: false,
                    started_at: Some(job.started_at),
                    next_fire_time: None,
                }
            })
            .collect();

        if token.is_cancelled() {
            return Ok(entries.into_iter().skip(offset).take(max_count).collect());
        }

        let queued = self.delegate.select_jobs(max_count + offset, 0).await?;
        for row in queued {
            let (name, description) = self.describer.describe(&row.detail);
            let blocked = matches!(
                row.trigger_state,
                TriggerState::Blocked | TriggerState::PausedBlocked
            ) || snapshot.is_excluded(&row.detail.job_type);
            entries.push(JobQueueEntry {
                name,
                description,
                job_type: row.detail.job_type,
                running: false,
                blocked,
                started_at: None,
                next_fire_time: row.next_fire_time,
            });
        }

        Ok(entries.into_iter().skip(offset).take(max_count).collect())
    }

    /// Number of jobs executing right now.
    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot Publication
    // ─────────────────────────────────────────────────────────────────────────

    async fn snapshot_context(&self) -> Result<QueueStateContext> {
        let snapshot = self.build_filter_snapshot();
        let waiting = self.delegate.select_waiting_trigger_count(&snapshot).await?;
        let blocked = self
            .delegate
            .select_blocked_trigger_count(&snapshot, self.catalog.registry())
            .await?;

        let currently_executing: Vec<ExecutingJobInfo> = self
            .executing
            .snapshot_sorted()
            .into_iter()
            .map(|job| {
                let (name, description) = self.describer.describe(&job.detail);
                ExecutingJobInfo {
                    name,
                    description,
                    job_type: job.detail.job_type,
                    started_at: job.started_at,
                }
            })
            .collect();

        Ok(QueueStateContext {
            thread_count: self.thread_count,
            waiting_triggers_count: waiting,
            blocked_triggers_count: blocked,
            total_triggers_count: waiting + blocked + currently_executing.len(),
            currently_executing,
        })
    }

    async fn publish(&self, event: QueueStateEvent) {
        match self.snapshot_context().await {
            Ok(context) => self.publisher.publish(event, &context).await,
            Err(error) => warn!(?event, %error, "queue-state snapshot failed; event dropped"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
