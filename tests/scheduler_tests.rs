//! End-to-end tests for the concurrency-aware job store.
//!
//! Tests cover:
//! - Per-type limits: soft at acquisition, hard at fire time
//! - Mutual-exclusion groups and the sibling sweep
//! - Singleton (disallow-concurrent) jobs
//! - Acquisition filters and the dispatcher wake-up
//! - Type-resolution failures isolated to one trigger
//! - Queue-state snapshot arithmetic

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use firelane::prelude::*;

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct RecordingSignaler {
    signals: Mutex<Vec<DateTime<Utc>>>,
}

#[async_trait]
impl SchedulerSignaler for RecordingSignaler {
    async fn signal_scheduling_change(&self, candidate_next_fire_time: DateTime<Utc>) {
        self.signals.lock().unwrap().push(candidate_next_fire_time);
    }
}

impl RecordingSignaler {
    fn count(&self) -> usize {
        self.signals.lock().unwrap().len()
    }

    fn last(&self) -> Option<DateTime<Utc>> {
        self.signals.lock().unwrap().last().copied()
    }
}

#[derive(Default)]
struct RecordingListener {
    contexts: Mutex<Vec<(QueueStateEvent, QueueStateContext)>>,
    completed: AtomicUsize,
}

#[async_trait]
impl QueueStateListener for RecordingListener {
    async fn on_added(&self, context: &QueueStateContext) -> Result<()> {
        self.contexts
            .lock()
            .unwrap()
            .push((QueueStateEvent::Added, context.clone()));
        Ok(())
    }
    async fn on_executing(&self, context: &QueueStateContext) -> Result<()> {
        self.contexts
            .lock()
            .unwrap()
            .push((QueueStateEvent::Executing, context.clone()));
        Ok(())
    }
    async fn on_completed(&self, context: &QueueStateContext) -> Result<()> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap()
            .push((QueueStateEvent::Completed, context.clone()));
        Ok(())
    }
}

struct Harness {
    delegate: Arc<MemoryTriggerDelegate>,
    store: ConcurrentJobStore,
    signaler: Arc<RecordingSignaler>,
    listener: Arc<RecordingListener>,
}

fn registry() -> Arc<JobTypeRegistry> {
    let registry = JobTypeRegistry::new();
    registry.register("HashFileJob", ConcurrencyRules::limit(2));
    registry.register("UdpQueryJob", ConcurrencyRules::group("remote-udp"));
    registry.register("UdpPingJob", ConcurrencyRules::group("remote-udp"));
    registry.register("ScanFolderJob", ConcurrencyRules::disallow_concurrent());
    registry.register("NoopJob", ConcurrencyRules::unrestricted());
    Arc::new(registry)
}

fn harness_with_filters(filters: FilterBus) -> Harness {
    let delegate = Arc::new(MemoryTriggerDelegate::new());
    let signaler = Arc::new(RecordingSignaler::default());
    let listener = Arc::new(RecordingListener::default());
    let catalog = ConcurrencyCatalog::build(registry(), &BTreeMap::new());
    let store = ConcurrentJobStore::new(
        delegate.clone(),
        catalog,
        filters,
        signaler.clone(),
        &StaticSchedulerMeta(8),
        Arc::new(KeyJobDescriber),
        &SchedulerConfig::default(),
    );
    store.register_listener(listener.clone());
    Harness {
        delegate,
        store,
        signaler,
        listener,
    }
}

fn harness() -> Harness {
    harness_with_filters(FilterBus::empty())
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

/// A job plus a repeating trigger due `due_offset_secs` ago (or from now).
async fn seed_repeating(
    h: &Harness,
    job_name: &str,
    trigger_name: &str,
    job_type: &str,
    due_offset_secs: i64,
) -> Trigger {
    let detail = JobDetail::new(JobKey::new("import", job_name), job_type);
    let trigger = Trigger::repeating(
        TriggerKey::new("import", trigger_name),
        &detail,
        Utc::now() + Duration::seconds(due_offset_secs),
        3600,
        None,
    );
    h.store.store_job_and_trigger(&detail, &trigger).await.unwrap();
    trigger
}

async fn acquire(h: &Harness, max_count: usize) -> Vec<Trigger> {
    h.store
        .acquire_next_triggers(Utc::now(), max_count, Duration::seconds(30), &token())
        .await
        .unwrap()
}

async fn fire(h: &Harness, batch: &[Trigger]) -> Vec<TriggerFiredBundle> {
    h.store
        .triggers_fired(batch, &token())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|result| match result {
            TriggerFiredResult::Fired(bundle) => Some(bundle),
            _ => None,
        })
        .collect()
}

async fn complete(h: &Harness, bundle: &TriggerFiredBundle) {
    h.store
        .triggered_job_complete(
            &bundle.trigger,
            &bundle.detail,
            CompletedExecutionInstruction::NoInstruction,
        )
        .await
        .unwrap();
}

fn state_of(h: &Harness, trigger_name: &str) -> TriggerState {
    h.delegate
        .trigger_state(&TriggerKey::new("import", trigger_name))
        .unwrap()
}

// ============================================================================
// Per-Type Limits
// ============================================================================

#[tokio::test]
async fn test_limit_cap_is_soft_at_acquisition() {
    let h = harness();
    for i in 0..6 {
        seed_repeating(&h, &format!("hash-{i}"), &format!("t{i}"), "HashFileJob", -60).await;
    }

    let batch = acquire(&h, 10).await;
    assert_eq!(batch.len(), 2);
    for trigger in &batch {
        assert_eq!(trigger.state, TriggerState::Acquired);
        assert!(trigger.fire_instance_id.is_some());
    }

    // Nothing is executing yet, and the unacquired siblings stay WAITING:
    // the cap only filters acquisition.
    assert_eq!(h.store.executing_count(), 0);
    let waiting: usize = (0..6)
        .filter(|i| state_of(&h, &format!("t{i}")) == TriggerState::Waiting)
        .count();
    assert_eq!(waiting, 4);
}

#[tokio::test]
async fn test_limit_saturation_blocks_the_next_firing() {
    let h = harness();
    for i in 0..6 {
        seed_repeating(&h, &format!("hash-{i}"), &format!("t{i}"), "HashFileJob", -60).await;
    }

    let batch = acquire(&h, 10).await;
    let bundles = fire(&h, &batch).await;
    assert_eq!(bundles.len(), 2);
    assert_eq!(h.store.executing_count(), 2);

    // The second firing saturated the cap, so its sweep blocked every
    // sibling of the type, and a third acquisition round finds nothing.
    for i in 0..6 {
        assert_eq!(state_of(&h, &format!("t{i}")), TriggerState::Blocked);
    }
    assert!(acquire(&h, 10).await.is_empty());

    // One completion returns the siblings to WAITING; the freed slot
    // admits exactly one more.
    complete(&h, &bundles[0]).await;
    let waiting = (0..6)
        .filter(|i| state_of(&h, &format!("t{i}")) == TriggerState::Waiting)
        .count();
    assert_eq!(waiting, 6);
    assert_eq!(acquire(&h, 10).await.len(), 1);
}

#[tokio::test]
async fn test_stolen_trigger_is_skipped_at_fire() {
    let h = harness();
    seed_repeating(&h, "noop-1", "t1", "NoopJob", -60).await;

    let batch = acquire(&h, 1).await;
    assert_eq!(batch.len(), 1);

    // The trigger is released out-of-band between acquisition and fire.
    h.delegate
        .set_trigger_state(&batch[0].key, TriggerState::Waiting)
        .await
        .unwrap();

    let results = h.store.triggers_fired(&batch, &token()).await.unwrap();
    assert!(matches!(results[0], TriggerFiredResult::Skipped { .. }));
    assert_eq!(h.store.executing_count(), 0);
}

#[tokio::test]
async fn test_completion_frees_a_limit_slot() {
    let h = harness();
    for i in 0..3 {
        seed_repeating(&h, &format!("hash-{i}"), &format!("t{i}"), "HashFileJob", -60).await;
    }

    let bundles = fire(&h, &acquire(&h, 10).await).await;
    assert_eq!(bundles.len(), 2);
    assert!(acquire(&h, 10).await.is_empty());

    complete(&h, &bundles[0]).await;
    assert_eq!(h.store.executing_count(), 1);

    let next = acquire(&h, 10).await;
    assert_eq!(next.len(), 1);
}

// ============================================================================
// Mutual-Exclusion Groups
// ============================================================================

#[tokio::test]
async fn test_group_admits_one_and_sweeps_siblings() {
    let h = harness();
    seed_repeating(&h, "udp-query", "tq", "UdpQueryJob", -20).await;
    seed_repeating(&h, "udp-ping", "tp", "UdpPingJob", -10).await;

    // Unit cap: one member per batch, earliest due first.
    let batch = acquire(&h, 10).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job_type, "UdpQueryJob");

    let bundles = fire(&h, &batch).await;
    assert_eq!(bundles.len(), 1);

    // The running member blocked the whole group, including the sibling
    // whose slot "looks free".
    assert_eq!(state_of(&h, "tp"), TriggerState::Blocked);
    assert!(acquire(&h, 10).await.is_empty());

    // Completion unblocks the group and wakes the dispatcher.
    let signals_before = h.signaler.count();
    complete(&h, &bundles[0]).await;
    assert_eq!(state_of(&h, "tp"), TriggerState::Waiting);
    assert!(h.signaler.count() > signals_before);
    assert_eq!(h.signaler.last(), Some(wake_sentinel()));

    let next = acquire(&h, 10).await;
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].job_type, "UdpPingJob");
}

#[tokio::test]
async fn test_group_completion_unblocks_all_siblings() {
    let h = harness();
    seed_repeating(&h, "udp-query", "tq", "UdpQueryJob", -60).await;
    for i in 0..5 {
        seed_repeating(&h, &format!("ping-{i}"), &format!("tp{i}"), "UdpPingJob", -10).await;
    }

    let bundles = fire(&h, &acquire(&h, 1).await).await;
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].trigger.job_type, "UdpQueryJob");

    for i in 0..5 {
        assert_eq!(state_of(&h, &format!("tp{i}")), TriggerState::Blocked);
    }

    let completed_before = h.listener.completed.load(Ordering::SeqCst);
    complete(&h, &bundles[0]).await;
    for i in 0..5 {
        assert_eq!(state_of(&h, &format!("tp{i}")), TriggerState::Waiting);
    }
    assert_eq!(
        h.listener.completed.load(Ordering::SeqCst),
        completed_before + 1
    );
    assert_eq!(h.signaler.last(), Some(wake_sentinel()));
}

// ============================================================================
// Singleton Jobs
// ============================================================================

#[tokio::test]
async fn test_disallow_concurrent_admits_one_per_batch() {
    let h = harness();
    let detail = JobDetail::new(JobKey::new("import", "scan"), "ScanFolderJob");
    h.store.store_job(&detail).await.unwrap();
    for i in 0..2 {
        let trigger = Trigger::repeating(
            TriggerKey::new("import", format!("scan-t{i}")),
            &detail,
            Utc::now() - Duration::seconds(30),
            3600,
            None,
        );
        h.store.store_trigger(&trigger).await.unwrap();
    }

    // Two triggers point at the same job key; only one acquires.
    let batch = acquire(&h, 10).await;
    assert_eq!(batch.len(), 1);

    let bundles = fire(&h, &batch).await;
    assert_eq!(bundles.len(), 1);

    // The sibling of the running singleton is swept by job key.
    let sibling = if batch[0].key.name == "scan-t0" {
        "scan-t1"
    } else {
        "scan-t0"
    };
    assert_eq!(state_of(&h, sibling), TriggerState::Blocked);

    complete(&h, &bundles[0]).await;
    assert_eq!(state_of(&h, sibling), TriggerState::Waiting);
}

// ============================================================================
// Acquisition Filters
// ============================================================================

#[tokio::test]
async fn test_filter_excludes_type_until_state_change() {
    let filter = Arc::new(StaticFilter::new("udp-rate-limit"));
    filter.set_excluded(["HashFileJob".to_string()]);
    let h = harness_with_filters(FilterBus::new(vec![filter.clone()]));

    seed_repeating(&h, "hash-1", "t1", "HashFileJob", -60).await;
    assert!(acquire(&h, 10).await.is_empty());
    assert_eq!(h.store.get_waiting_triggers_count().await.unwrap(), 0);
    assert_eq!(h.store.get_blocked_triggers_count().await.unwrap(), 1);

    // The filter opens up: the dispatcher is woken with the sentinel and
    // the next round acquires.
    let signals_before = h.signaler.count();
    filter.clear();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.signaler.count() > signals_before);
    assert_eq!(h.signaler.last(), Some(wake_sentinel()));

    let batch = acquire(&h, 10).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job_type, "HashFileJob");
}

// ============================================================================
// Type-Resolution Failures
// ============================================================================

#[tokio::test]
async fn test_unresolvable_type_errors_one_trigger_only() {
    let h = harness();

    let ghost = JobDetail::new(JobKey::new("import", "ghost"), "GhostJob");
    let ghost_trigger = Trigger::repeating(
        TriggerKey::new("import", "ghost-t"),
        &ghost,
        Utc::now() - Duration::seconds(60),
        3600,
        None,
    );
    h.store.store_job_and_trigger(&ghost, &ghost_trigger).await.unwrap();
    seed_repeating(&h, "noop-1", "noop-t", "NoopJob", -30).await;

    let batch = acquire(&h, 10).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].job_type, "NoopJob");
    assert_eq!(state_of(&h, "ghost-t"), TriggerState::Error);
}

// ============================================================================
// Acquisition Semantics
// ============================================================================

#[tokio::test]
async fn test_reacquisition_returns_disjoint_sets() {
    let h = harness();
    for i in 0..4 {
        seed_repeating(&h, &format!("noop-{i}"), &format!("t{i}"), "NoopJob", -60).await;
    }

    let first = acquire(&h, 2).await;
    let second = acquire(&h, 10).await;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    for trigger in &first {
        assert!(!second.iter().any(|other| other.key == trigger.key));
    }
}

#[tokio::test]
async fn test_cancelled_acquisition_returns_partial_batch() {
    let h = harness();
    for i in 0..4 {
        seed_repeating(&h, &format!("noop-{i}"), &format!("t{i}"), "NoopJob", -60).await;
    }

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let batch = h
        .store
        .acquire_next_triggers(Utc::now(), 10, Duration::seconds(30), &cancelled)
        .await
        .unwrap();
    assert!(batch.is_empty());

    // Nothing was promoted; all four remain WAITING for the next round.
    for i in 0..4 {
        assert_eq!(state_of(&h, &format!("t{i}")), TriggerState::Waiting);
    }
}

#[tokio::test]
async fn test_one_shot_trigger_completes_after_firing() {
    let h = harness();
    let detail = JobDetail::new(JobKey::new("import", "once"), "NoopJob");
    let trigger = Trigger::once(
        TriggerKey::new("import", "once-t"),
        &detail,
        Utc::now() - Duration::seconds(5),
    );
    h.store.store_job_and_trigger(&detail, &trigger).await.unwrap();

    let bundles = fire(&h, &acquire(&h, 1).await).await;
    assert_eq!(bundles.len(), 1);
    assert_eq!(state_of(&h, "once-t"), TriggerState::Complete);
    assert!(bundles[0].trigger.next_fire_time.is_none());

    // The base deletes the exhausted trigger on completion.
    h.store
        .triggered_job_complete(
            &bundles[0].trigger,
            &bundles[0].detail,
            CompletedExecutionInstruction::DeleteTrigger,
        )
        .await
        .unwrap();
    assert!(h
        .delegate
        .trigger_state(&TriggerKey::new("import", "once-t"))
        .is_none());
    assert_eq!(h.delegate.fired_count(), 0);
}

// ============================================================================
// Queue-State Events
// ============================================================================

#[tokio::test]
async fn test_snapshot_arithmetic_holds_at_every_event() {
    let h = harness();
    for i in 0..3 {
        seed_repeating(&h, &format!("hash-{i}"), &format!("t{i}"), "HashFileJob", -60).await;
    }
    let bundles = fire(&h, &acquire(&h, 10).await).await;
    for bundle in &bundles {
        complete(&h, bundle).await;
    }

    let contexts = h.listener.contexts.lock().unwrap();
    assert!(!contexts.is_empty());
    for (event, context) in contexts.iter() {
        assert_eq!(
            context.total_triggers_count,
            context.waiting_triggers_count
                + context.blocked_triggers_count
                + context.currently_executing.len(),
            "total mismatch on {event:?}"
        );
        assert_eq!(context.thread_count, 8);
    }

    // Executing snapshots are sorted by start time.
    for (_, context) in contexts.iter() {
        let starts: Vec<_> = context
            .currently_executing
            .iter()
            .map(|job| job.started_at)
            .collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }
}

#[tokio::test]
async fn test_get_jobs_lists_executing_first_and_flags_blocked() {
    let h = harness();
    seed_repeating(&h, "udp-query", "tq", "UdpQueryJob", -60).await;
    seed_repeating(&h, "udp-ping", "tp", "UdpPingJob", -10).await;
    seed_repeating(&h, "noop-1", "tn", "NoopJob", -5).await;

    let bundles = fire(&h, &acquire(&h, 1).await).await;
    assert_eq!(bundles.len(), 1);

    let jobs = h.store.get_jobs(10, 0, &token()).await.unwrap();
    assert!(jobs.len() >= 3);
    assert!(jobs[0].running);
    assert_eq!(jobs[0].job_type, "UdpQueryJob");

    let ping = jobs.iter().find(|j| j.job_type == "UdpPingJob").unwrap();
    assert!(ping.blocked);
    let noop = jobs.iter().find(|j| j.job_type == "NoopJob").unwrap();
    assert!(!noop.blocked);
}

#[tokio::test]
async fn test_job_counts_group_queued_triggers_by_type() {
    let h = harness();
    for i in 0..3 {
        seed_repeating(&h, &format!("hash-{i}"), &format!("th{i}"), "HashFileJob", -60).await;
    }
    seed_repeating(&h, "noop-1", "tn", "NoopJob", -5).await;

    let counts = h.store.get_job_counts().await.unwrap();
    assert_eq!(counts.get("HashFileJob"), Some(&3));
    assert_eq!(counts.get("NoopJob"), Some(&1));
    assert_eq!(h.store.get_total_waiting_triggers_count().await.unwrap(), 4);
}

// ============================================================================
// Pause Axis and Recovery
// ============================================================================

#[tokio::test]
async fn test_pause_and_resume_cross_the_blocked_axis() {
    let h = harness();
    seed_repeating(&h, "hash-1", "t1", "HashFileJob", -60).await;

    assert_eq!(h.store.pause_job_type("HashFileJob").await.unwrap(), 1);
    assert_eq!(state_of(&h, "t1"), TriggerState::Paused);
    assert!(acquire(&h, 10).await.is_empty());

    assert_eq!(h.store.resume_job_type("HashFileJob").await.unwrap(), 1);
    assert_eq!(state_of(&h, "t1"), TriggerState::Waiting);
    assert_eq!(acquire(&h, 10).await.len(), 1);
}

#[tokio::test]
async fn test_recovery_returns_orphaned_acquisitions_to_waiting() {
    let h = harness();
    seed_repeating(&h, "hash-1", "t1", "HashFileJob", -60).await;

    let batch = acquire(&h, 1).await;
    assert_eq!(batch.len(), 1);
    assert_eq!(h.delegate.fired_count(), 1);

    // Simulated restart before the batch fired.
    let recovered = h.store.recover_fired_triggers().await.unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(h.delegate.fired_count(), 0);
    assert_eq!(state_of(&h, "t1"), TriggerState::Waiting);
    assert_eq!(acquire(&h, 1).await.len(), 1);
}
