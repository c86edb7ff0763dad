//! Acquisition filter bus.
//!
//! Filters are pluggable predicates that temporarily remove job types from
//! candidacy (a rate-limited remote service being the canonical case).
//! Each filter answers synchronously and cheaply; the bus polls them every
//! acquisition round and unions their answers. A filter that changes its
//! answer bumps a generation counter, which the bus forwards to the
//! dispatcher as an immediate wake-up.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::signal::{wake_sentinel, SchedulerSignaler};

// ═══════════════════════════════════════════════════════════════════════════════
// Filter Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A predicate producing the set of job types currently ineligible.
pub trait AcquisitionFilter: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Job types to exclude right now. Must be cheap; called every round.
    fn types_to_exclude(&self) -> HashSet<String>;

    /// Subscribe to state changes. The value is a generation counter; any
    /// observed change means the answer of [`Self::types_to_exclude`] may
    /// have changed.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Static Filter
// ═══════════════════════════════════════════════════════════════════════════════

/// A filter holding an explicit exclusion set.
///
/// Building block for rate-limit style filters: the owner flips the set
/// when its backing service opens or closes.
pub struct StaticFilter {
    name: String,
    excluded: RwLock<HashSet<String>>,
    generation: watch::Sender<u64>,
}

impl StaticFilter {
    pub fn new(name: impl Into<String>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            name: name.into(),
            excluded: RwLock::new(HashSet::new()),
            generation,
        }
    }

    /// Replace the exclusion set and notify subscribers.
    pub fn set_excluded(&self, types: impl IntoIterator<Item = String>) {
        let types: HashSet<String> = types.into_iter().collect();
        {
            let mut excluded = self.excluded.write();
            if *excluded == types {
                return;
            }
            *excluded = types;
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Clear the exclusion set and notify subscribers.
    pub fn clear(&self) {
        self.set_excluded(std::iter::empty::<String>());
    }
}

impl AcquisitionFilter for StaticFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn types_to_exclude(&self) -> HashSet<String> {
        self.excluded.read().clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filter Bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed list of acquisition filters consulted each round.
pub struct FilterBus {
    filters: Vec<Arc<dyn AcquisitionFilter>>,
}

impl FilterBus {
    pub fn new(filters: Vec<Arc<dyn AcquisitionFilter>>) -> Self {
        Self { filters }
    }

    pub fn empty() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Union of all filters' exclusions.
    pub fn excluded_types(&self) -> HashSet<String> {
        let mut excluded = HashSet::new();
        for filter in &self.filters {
            let types = filter.types_to_exclude();
            if !types.is_empty() {
                debug!(filter = filter.name(), count = types.len(), "filter excludes types");
                excluded.extend(types);
            }
        }
        excluded
    }

    /// Forward every filter's state changes to the dispatcher.
    ///
    /// Spawns one watcher task per filter; each change signals the
    /// scheduler with the sentinel past timestamp. Tasks end when the
    /// filter's sender side is dropped.
    pub fn forward_changes(&self, signaler: Arc<dyn SchedulerSignaler>) {
        for filter in &self.filters {
            let mut receiver = filter.subscribe();
            let signaler = signaler.clone();
            let name = filter.name().to_string();
            tokio::spawn(async move {
                while receiver.changed().await.is_ok() {
                    debug!(filter = %name, "acquisition filter changed; waking dispatcher");
                    signaler.signal_scheduling_change(wake_sentinel()).await;
                }
            });
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_of_exclusions() {
        let a = Arc::new(StaticFilter::new("udp-rate-limit"));
        a.set_excluded(["UdpQueryJob".to_string()]);
        let b = Arc::new(StaticFilter::new("http-rate-limit"));
        b.set_excluded(["DownloadImageJob".to_string(), "UdpQueryJob".to_string()]);

        let bus = FilterBus::new(vec![a, b]);
        let excluded = bus.excluded_types();
        assert_eq!(excluded.len(), 2);
        assert!(excluded.contains("UdpQueryJob"));
        assert!(excluded.contains("DownloadImageJob"));
    }

    #[test]
    fn test_unchanged_set_does_not_notify() {
        let filter = StaticFilter::new("udp-rate-limit");
        let mut receiver = filter.subscribe();

        filter.set_excluded(["UdpQueryJob".to_string()]);
        assert!(receiver.has_changed().unwrap());
        receiver.mark_unchanged();

        // Same set again: no new generation.
        filter.set_excluded(["UdpQueryJob".to_string()]);
        assert!(!receiver.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_change_wakes_dispatcher() {
        use chrono::{DateTime, Utc};
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recording(Mutex<Vec<DateTime<Utc>>>);

        #[async_trait::async_trait]
        impl SchedulerSignaler for Recording {
            async fn signal_scheduling_change(&self, candidate: DateTime<Utc>) {
                self.0.lock().unwrap().push(candidate);
            }
        }

        let filter = Arc::new(StaticFilter::new("udp-rate-limit"));
        let bus = FilterBus::new(vec![filter.clone()]);
        let signaler = Arc::new(Recording::default());
        bus.forward_changes(signaler.clone());

        filter.set_excluded(["UdpQueryJob".to_string()]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let seen = signaler.0.lock().unwrap().clone();
        assert_eq!(seen, vec![wake_sentinel()]);
    }
}
