//! In-memory table of currently running jobs.
//!
//! One plain mutex guards the whole map. The map is small (at most the
//! thread-pool size) and the mutex is never held across a suspension
//! point; the gate's correctness rests on atomic read-modify-write of
//! this map together with the batch-local counters it feeds.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{JobDetail, JobKey};

/// A running job: its detail and when it started.
#[derive(Debug, Clone)]
pub struct ExecutingJob {
    pub detail: JobDetail,
    pub started_at: DateTime<Utc>,
}

/// Map of job key to running job, guarded by a single mutex.
#[derive(Debug, Default)]
pub struct ExecutingJobs {
    jobs: Mutex<HashMap<JobKey, ExecutingJob>>,
}

impl ExecutingJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job as executing.
    ///
    /// Returns `false` if the key is already present; a job cannot execute
    /// twice concurrently under the same key.
    pub fn insert(&self, detail: JobDetail, started_at: DateTime<Utc>) -> bool {
        let mut jobs = self.jobs.lock();
        let key = detail.key.clone();
        if jobs.contains_key(&key) {
            return false;
        }
        jobs.insert(key, ExecutingJob { detail, started_at });
        true
    }

    /// Remove a completed job. Returns the entry if it existed.
    pub fn remove(&self, key: &JobKey) -> Option<ExecutingJob> {
        self.jobs.lock().remove(key)
    }

    /// Number of running jobs of one type.
    pub fn count_of_type(&self, job_type: &str) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|job| job.detail.job_type == job_type)
            .count()
    }

    /// Check if any running job's type is in the given set.
    pub fn any_of_types(&self, types: &HashSet<String>) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|job| types.contains(&job.detail.job_type))
    }

    /// Check if any running job has the given type.
    pub fn any_of_type(&self, job_type: &str) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|job| job.detail.job_type == job_type)
    }

    /// Check if a specific job key is running.
    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Snapshot of all entries, sorted by start time ascending.
    pub fn snapshot_sorted(&self) -> Vec<ExecutingJob> {
        let mut entries: Vec<ExecutingJob> = self.jobs.lock().values().cloned().collect();
        entries.sort_by_key(|job| job.started_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn detail(name: &str, job_type: &str) -> JobDetail {
        JobDetail::new(JobKey::new("import", name), job_type)
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let table = ExecutingJobs::new();
        assert!(table.insert(detail("hash-1", "HashFileJob"), Utc::now()));
        assert!(!table.insert(detail("hash-1", "HashFileJob"), Utc::now()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_counts_by_type() {
        let table = ExecutingJobs::new();
        table.insert(detail("hash-1", "HashFileJob"), Utc::now());
        table.insert(detail("hash-2", "HashFileJob"), Utc::now());
        table.insert(detail("img-1", "DownloadImageJob"), Utc::now());

        assert_eq!(table.count_of_type("HashFileJob"), 2);
        assert_eq!(table.count_of_type("DownloadImageJob"), 1);
        assert_eq!(table.count_of_type("NoopJob"), 0);

        let group: HashSet<String> =
            ["DownloadImageJob".to_string(), "UdpQueryJob".to_string()].into();
        assert!(table.any_of_types(&group));
    }

    #[test]
    fn test_snapshot_sorted_by_start_time() {
        let table = ExecutingJobs::new();
        let base = Utc::now();
        table.insert(detail("c", "NoopJob"), base + Duration::seconds(2));
        table.insert(detail("a", "NoopJob"), base);
        table.insert(detail("b", "NoopJob"), base + Duration::seconds(1));

        let names: Vec<String> = table
            .snapshot_sorted()
            .into_iter()
            .map(|job| job.detail.key.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_frees_slot() {
        let table = ExecutingJobs::new();
        let key = JobKey::new("import", "hash-1");
        table.insert(detail("hash-1", "HashFileJob"), Utc::now());
        assert!(table.contains(&key));

        let removed = table.remove(&key).unwrap();
        assert_eq!(removed.detail.job_type, "HashFileJob");
        assert!(table.is_empty());
        assert!(table.remove(&key).is_none());
    }
}
