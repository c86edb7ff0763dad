//! # Firelane
//!
//! Persistent, concurrency-aware job scheduler store.
//!
//! ## Architecture
//!
//! - **Concurrency Catalog**: static registry of per-type caps, mutual-exclusion
//!   groups, and singleton flags, built from explicit registration plus
//!   configuration overrides
//! - **Acquisition Filters**: pluggable predicates that temporarily remove job
//!   types from candidacy and wake the dispatcher when they change
//! - **Executing Table**: mutex-guarded map of currently running jobs
//! - **Trigger Delegate**: persistence surface with filtered selection and
//!   counting; PostgreSQL in production, in-memory for tests
//! - **Store**: the acquisition and fire/complete engines enforcing the caps
//!   and driving the trigger state machine
//! - **Queue-State Events**: snapshot notifications on every store, fire, and
//!   completion
//!
//! ## Usage
//!
//! ```rust,ignore
//! use firelane::prelude::*;
//!
//! let registry = Arc::new(JobTypeRegistry::new());
//! registry.register("HashFileJob", ConcurrencyRules::limit(4));
//! registry.register("UdpQueryJob", ConcurrencyRules::group("remote-udp"));
//!
//! let config = SchedulerConfig::default();
//! let catalog = ConcurrencyCatalog::build(registry.clone(), &config.concurrency_overrides);
//! let delegate = Arc::new(PgTriggerDelegate::connect(&config.database).await?);
//!
//! let store = ConcurrentJobStore::new(
//!     delegate,
//!     catalog,
//!     FilterBus::empty(),
//!     Arc::new(NoopSignaler),
//!     &StaticSchedulerMeta(8),
//!     Arc::new(KeyJobDescriber),
//!     &config,
//! );
//!
//! let batch = store
//!     .acquire_next_triggers(Utc::now(), 10, Duration::seconds(30), &token)
//!     .await?;
//! ```

pub mod catalog;
pub mod config;
pub mod delegate;
pub mod domain;
pub mod error;
pub mod events;
pub mod executing;
pub mod filters;
pub mod signal;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorSeverity, Result, SchedulerError};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::catalog::{ConcurrencyCatalog, ConcurrencyRules, JobTypeRegistry};
    pub use crate::config::SchedulerConfig;
    pub use crate::delegate::{
        MemoryTriggerDelegate, PgTriggerDelegate, TriggerDelegate, TypeFilterSnapshot,
    };
    pub use crate::domain::{
        FiredState, FiredTriggerRecord, JobDetail, JobKey, Trigger, TriggerKey, TriggerSchedule,
        TriggerState,
    };
    pub use crate::error::{ErrorCode, Result, SchedulerError};
    pub use crate::events::{
        ExecutingJobInfo, JobDescriber, KeyJobDescriber, QueueStateContext, QueueStateEvent,
        QueueStateListener, SchedulerMeta, StaticSchedulerMeta,
    };
    pub use crate::filters::{AcquisitionFilter, FilterBus, StaticFilter};
    pub use crate::signal::{wake_sentinel, NoopSignaler, SchedulerSignaler};
    pub use crate::store::{
        CompletedExecutionInstruction, ConcurrentJobStore, JobQueueEntry, TriggerFiredBundle,
        TriggerFiredResult,
    };
}
