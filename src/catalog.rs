//! Concurrency catalog: which job types may run next to each other.
//!
//! Job types are registered explicitly at startup together with their
//! declarative concurrency rules; there is no runtime discovery. The
//! catalog snapshots the registry once at construction, applies the
//! configured per-type overrides, and is read-only afterwards. The
//! disallow-concurrent flag is deliberately *not* cached: the gate reads
//! it from the registry at decision time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrency Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// Declarative concurrency metadata attached to a job type at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConcurrencyRules {
    /// Forbid two concurrent executions of this type (singleton per job key)
    pub disallow_concurrent: bool,
    /// Mutual-exclusion group this type belongs to
    pub group: Option<String>,
    /// Numeric cap on concurrent executions of this type
    pub limit: Option<usize>,
    /// Upper bound configuration overrides may never exceed
    pub max_allowed: Option<usize>,
}

impl ConcurrencyRules {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn disallow_concurrent() -> Self {
        Self {
            disallow_concurrent: true,
            ..Self::default()
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            group: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_max_allowed(mut self, max_allowed: usize) -> Self {
        self.max_allowed = Some(max_allowed);
        self
    }

    /// Check if any concurrency attribute is present.
    pub fn is_constrained(&self) -> bool {
        self.disallow_concurrent || self.group.is_some() || self.limit.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Type Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Explicit registry of all job types known to the process.
///
/// Doubles as the type-load helper: resolving an unknown type name is the
/// error that sends a single trigger to `ERROR` during acquisition.
#[derive(Debug, Default)]
pub struct JobTypeRegistry {
    types: RwLock<HashMap<String, ConcurrencyRules>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type with its concurrency rules.
    ///
    /// Re-registering a name replaces the previous rules.
    pub fn register(&self, type_name: impl Into<String>, rules: ConcurrencyRules) {
        let type_name = type_name.into();
        debug!(job_type = %type_name, ?rules, "registered job type");
        self.types.write().insert(type_name, rules);
    }

    /// Resolve a job-type string to its rules.
    pub fn resolve(&self, type_name: &str) -> Result<ConcurrencyRules> {
        self.types
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| SchedulerError::type_resolution(type_name))
    }

    /// Check if a type name resolves at all.
    pub fn contains(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    /// Snapshot all registered types.
    pub fn all(&self) -> HashMap<String, ConcurrencyRules> {
        self.types.read().clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Concurrency Catalog
// ═══════════════════════════════════════════════════════════════════════════════

/// Static mapping of job types to their effective concurrency caps and
/// group memberships, built once at store construction.
#[derive(Debug)]
pub struct ConcurrencyCatalog {
    registry: Arc<JobTypeRegistry>,
    limits: HashMap<String, usize>,
    groups_by_type: HashMap<String, String>,
    members_by_group: HashMap<String, HashSet<String>>,
}

impl ConcurrencyCatalog {
    /// Build the catalog from the registry plus configured overrides.
    ///
    /// Each override is clamped to the type's declared `max_allowed`.
    /// Overrides naming unknown types are logged and ignored.
    pub fn build(
        registry: Arc<JobTypeRegistry>,
        overrides: &BTreeMap<String, usize>,
    ) -> Self {
        let mut limits = HashMap::new();
        let mut groups_by_type = HashMap::new();
        let mut members_by_group: HashMap<String, HashSet<String>> = HashMap::new();

        for (type_name, rules) in registry.all() {
            if let Some(group) = &rules.group {
                members_by_group
                    .entry(group.clone())
                    .or_default()
                    .insert(type_name.clone());
                groups_by_type.insert(type_name.clone(), group.clone());
            }
            if let Some(limit) = rules.limit {
                limits.insert(type_name.clone(), limit);
            }
        }

        for (type_name, override_limit) in overrides {
            let Ok(rules) = registry.resolve(type_name) else {
                warn!(job_type = %type_name, "concurrency override names an unknown job type");
                continue;
            };
            let effective = match rules.max_allowed {
                Some(max_allowed) => (*override_limit).min(max_allowed),
                None => *override_limit,
            };
            debug!(job_type = %type_name, limit = effective, "applied concurrency override");
            limits.insert(type_name.clone(), effective);
        }

        Self {
            registry,
            limits,
            groups_by_type,
            members_by_group,
        }
    }

    /// Effective concurrency limit for a type, if it carries one.
    pub fn limit(&self, type_name: &str) -> Option<usize> {
        self.limits.get(type_name).copied()
    }

    /// All effective per-type limits.
    pub fn limits(&self) -> &HashMap<String, usize> {
        &self.limits
    }

    /// Mutual-exclusion group of a type, if it belongs to one.
    pub fn group(&self, type_name: &str) -> Option<&str> {
        self.groups_by_type.get(type_name).map(String::as_str)
    }

    /// Member types of a group.
    pub fn group_members(&self, group: &str) -> Option<&HashSet<String>> {
        self.members_by_group.get(group)
    }

    /// All group names.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.members_by_group.keys().map(String::as_str)
    }

    /// Disallow-concurrent flag, read from the registry at decision time.
    pub fn disallows_concurrent(&self, type_name: &str) -> bool {
        self.registry
            .resolve(type_name)
            .map(|rules| rules.disallow_concurrent)
            .unwrap_or(false)
    }

    /// Declared (uncached) limit for a type registered after construction.
    pub fn declared_limit(&self, type_name: &str) -> Option<usize> {
        self.registry.resolve(type_name).ok().and_then(|r| r.limit)
    }

    /// Check if a type carries any concurrency attribute at all.
    pub fn is_constrained(&self, type_name: &str) -> bool {
        self.limits.contains_key(type_name)
            || self.groups_by_type.contains_key(type_name)
            || self.disallows_concurrent(type_name)
    }

    /// The registry this catalog was built from.
    pub fn registry(&self) -> &Arc<JobTypeRegistry> {
        &self.registry
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
