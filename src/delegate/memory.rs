//! In-memory trigger delegate for tests and embedded use.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::catalog::JobTypeRegistry;
use crate::domain::{
    FiredState, FiredTriggerRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::error::Result;

use super::{QueuedJobRow, TriggerDelegate, TypeFilterSnapshot};

const QUEUED_STATES: [TriggerState; 4] = [
    TriggerState::Waiting,
    TriggerState::Blocked,
    TriggerState::Paused,
    TriggerState::PausedBlocked,
];

#[derive(Debug, Default)]
struct Tables {
    triggers: HashMap<TriggerKey, Trigger>,
    jobs: HashMap<JobKey, JobDetail>,
    fired: HashMap<Uuid, FiredTriggerRecord>,
    calendars: HashSet<String>,
}

/// Delegate backed by plain maps behind one read-write lock.
#[derive(Debug, Default)]
pub struct MemoryTriggerDelegate {
    tables: RwLock<Tables>,
}

impl MemoryTriggerDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a calendar name so triggers may reference it.
    pub fn add_calendar(&self, name: impl Into<String>) {
        self.tables.write().calendars.insert(name.into());
    }

    /// Direct state read for assertions.
    pub fn trigger_state(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.tables.read().triggers.get(key).map(|t| t.state)
    }

    /// Number of fired-trigger rows currently held.
    pub fn fired_count(&self) -> usize {
        self.tables.read().fired.len()
    }

    fn queued_waiting_by_type(tables: &Tables) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for trigger in tables.triggers.values() {
            if trigger.state == TriggerState::Waiting {
                *counts.entry(trigger.job_type.clone()).or_default() += 1;
            }
        }
        counts
    }
}

#[async_trait]
impl TriggerDelegate for MemoryTriggerDelegate {
    async fn select_triggers_to_acquire(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        filter: &TypeFilterSnapshot,
    ) -> Result<Vec<Trigger>> {
        let tables = self.tables.read();
        let mut due: Vec<&Trigger> = tables
            .triggers
            .values()
            .filter(|t| t.state == TriggerState::Waiting)
            .filter(|t| t.next_fire_time.is_some_and(|nft| nft <= no_later_than))
            .filter(|t| !filter.is_excluded(&t.job_type))
            .collect();
        due.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(due.into_iter().take(max_count).cloned().collect())
    }

    async fn select_waiting_trigger_count(&self, filter: &TypeFilterSnapshot) -> Result<usize> {
        let tables = self.tables.read();
        let counts = Self::queued_waiting_by_type(&tables);
        let mut waiting = 0;
        for (job_type, count) in counts {
            if filter.is_excluded(&job_type) {
                continue;
            }
            waiting += match filter.remaining_limit(&job_type) {
                Some(limit) => count.min(limit),
                None => count,
            };
        }
        Ok(waiting)
    }

    async fn select_blocked_trigger_count(
        &self,
        filter: &TypeFilterSnapshot,
        registry: &JobTypeRegistry,
    ) -> Result<usize> {
        let tables = self.tables.read();
        let mut blocked = tables
            .triggers
            .values()
            .filter(|t| {
                matches!(
                    t.state,
                    TriggerState::Blocked | TriggerState::PausedBlocked
                )
            })
            .count();

        // Waiting rows held back by the snapshot count as blocked too:
        // excluded types, rows beyond a type's remaining limit, and rows
        // whose type no longer resolves.
        for (job_type, count) in Self::queued_waiting_by_type(&tables) {
            if filter.is_excluded(&job_type) || !registry.contains(&job_type) {
                blocked += count;
            } else if let Some(limit) = filter.remaining_limit(&job_type) {
                blocked += count.saturating_sub(limit);
            }
        }
        Ok(blocked)
    }

    async fn select_total_waiting_trigger_count(&self) -> Result<usize> {
        let tables = self.tables.read();
        Ok(tables
            .triggers
            .values()
            .filter(|t| QUEUED_STATES.contains(&t.state))
            .count())
    }

    async fn select_job_type_counts(
        &self,
        filter: &TypeFilterSnapshot,
    ) -> Result<HashMap<String, usize>> {
        let tables = self.tables.read();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for trigger in tables.triggers.values() {
            if QUEUED_STATES.contains(&trigger.state) && !filter.is_excluded(&trigger.job_type) {
                *counts.entry(trigger.job_type.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn select_jobs(&self, max_count: usize, offset: usize) -> Result<Vec<QueuedJobRow>> {
        let tables = self.tables.read();
        let mut earliest: HashMap<JobKey, (&Trigger, Option<DateTime<Utc>>)> = HashMap::new();
        for trigger in tables.triggers.values() {
            if !QUEUED_STATES.contains(&trigger.state) {
                continue;
            }
            let entry = earliest.entry(trigger.job_key.clone());
            match entry {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert((trigger, trigger.next_fire_time));
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    let (_, current) = *slot.get();
                    if fires_before(trigger.next_fire_time, current) {
                        slot.insert((trigger, trigger.next_fire_time));
                    }
                }
            }
        }

        let mut rows: Vec<QueuedJobRow> = earliest
            .into_iter()
            .filter_map(|(job_key, (trigger, next_fire_time))| {
                tables.jobs.get(&job_key).map(|detail| QueuedJobRow {
                    detail: detail.clone(),
                    trigger_state: trigger.state,
                    next_fire_time,
                })
            })
            .collect();
        rows.sort_by(|a, b| match (a.next_fire_time, b.next_fire_time) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.detail.key.cmp(&b.detail.key),
        });
        Ok(rows.into_iter().skip(offset).take(max_count).collect())
    }

    async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        Ok(self.tables.read().triggers.get(key).cloned())
    }

    async fn store_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.tables
            .write()
            .triggers
            .insert(trigger.key.clone(), trigger.clone());
        Ok(())
    }

    async fn cas_trigger_state(
        &self,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
        next_fire_time_fence: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        let Some(trigger) = tables.triggers.get_mut(key) else {
            return Ok(false);
        };
        if trigger.state != from {
            return Ok(false);
        }
        if let Some(fence) = next_fire_time_fence {
            if trigger.next_fire_time != Some(fence) {
                return Ok(false);
            }
        }
        trigger.state = to;
        Ok(true)
    }

    async fn set_trigger_state(&self, key: &TriggerKey, state: TriggerState) -> Result<()> {
        if let Some(trigger) = self.tables.write().triggers.get_mut(key) {
            trigger.state = state;
        }
        Ok(())
    }

    async fn update_trigger_states_for_job(
        &self,
        job_key: &JobKey,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut changed = 0;
        for trigger in tables.triggers.values_mut() {
            if trigger.job_key != *job_key {
                continue;
            }
            if let Some((_, to)) = transitions.iter().find(|(from, _)| *from == trigger.state) {
                trigger.state = *to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn update_trigger_states_for_types(
        &self,
        types: &HashSet<String>,
        transitions: &[(TriggerState, TriggerState)],
    ) -> Result<u64> {
        let mut tables = self.tables.write();
        let mut changed = 0;
        for trigger in tables.triggers.values_mut() {
            if !types.contains(&trigger.job_type) {
                continue;
            }
            if let Some((_, to)) = transitions.iter().find(|(from, _)| *from == trigger.state) {
                trigger.state = *to;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        Ok(self.tables.write().triggers.remove(key).is_some())
    }

    async fn get_job_detail(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        Ok(self.tables.read().jobs.get(key).cloned())
    }

    async fn store_job(&self, detail: &JobDetail) -> Result<()> {
        self.tables
            .write()
            .jobs
            .insert(detail.key.clone(), detail.clone());
        Ok(())
    }

    async fn remove_job(&self, key: &JobKey) -> Result<bool> {
        Ok(self.tables.write().jobs.remove(key).is_some())
    }

    async fn insert_fired_trigger(&self, record: &FiredTriggerRecord) -> Result<()> {
        self.tables
            .write()
            .fired
            .insert(record.fire_instance_id, record.clone());
        Ok(())
    }

    async fn update_fired_trigger_state(
        &self,
        fire_instance_id: Uuid,
        state: FiredState,
    ) -> Result<()> {
        if let Some(record) = self.tables.write().fired.get_mut(&fire_instance_id) {
            record.state = state;
        }
        Ok(())
    }

    async fn delete_fired_trigger(&self, fire_instance_id: Uuid) -> Result<bool> {
        Ok(self.tables.write().fired.remove(&fire_instance_id).is_some())
    }

    async fn select_fired_trigger_states(&self, instance_id: &str) -> Result<Vec<FiredState>> {
        Ok(self
            .tables
            .read()
            .fired
            .values()
            .filter(|r| r.scheduler_instance_id == instance_id)
            .map(|r| r.state)
            .collect())
    }

    async fn delete_fired_triggers_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let mut tables = self.tables.write();
        let ids: Vec<Uuid> = tables
            .fired
            .values()
            .filter(|r| r.scheduler_instance_id == instance_id)
            .map(|r| r.fire_instance_id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = tables.fired.remove(&id) {
                removed.push(record);
            }
        }
        Ok(removed)
    }

    async fn calendar_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tables.read().calendars.contains(name))
    }
}

fn fires_before(candidate: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (candidate, current) {
        (Some(c), Some(cur)) => c < cur,
        (Some(_), None) => true,
        _ => false,
    }
}
