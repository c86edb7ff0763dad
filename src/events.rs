//! Queue-state events.
//!
//! Every store/fire/complete operation publishes a snapshot of the queue:
//! filtered waiting and blocked counts, the executing list sorted by start
//! time, and the thread-pool size. Publication failures are logged and
//! swallowed; observability never fails scheduling.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::domain::JobDetail;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Collaborator Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// One-shot scheduler metadata read, cached by the store.
pub trait SchedulerMeta: Send + Sync {
    /// Size of the dispatcher's thread pool.
    fn thread_pool_size(&self) -> usize;
}

/// Fixed thread-pool size.
pub struct StaticSchedulerMeta(pub usize);

impl SchedulerMeta for StaticSchedulerMeta {
    fn thread_pool_size(&self) -> usize {
        self.0
    }
}

/// Builds the display name and description of a job for queue surfaces.
pub trait JobDescriber: Send + Sync {
    fn describe(&self, detail: &JobDetail) -> (String, Option<String>);
}

/// Describer using the job key and stored description verbatim.
#[derive(Debug, Default)]
pub struct KeyJobDescriber;

impl JobDescriber for KeyJobDescriber {
    fn describe(&self, detail: &JobDetail) -> (String, Option<String>) {
        (detail.key.to_string(), detail.description.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// A currently executing entry as exposed to listeners.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutingJobInfo {
    pub name: String,
    pub description: Option<String>,
    pub job_type: String,
    pub started_at: DateTime<Utc>,
}

/// Snapshot carried by every queue-state event.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStateContext {
    pub thread_count: usize,
    pub waiting_triggers_count: usize,
    pub blocked_triggers_count: usize,
    /// `waiting + blocked + executing`
    pub total_triggers_count: usize,
    /// Sorted by start time ascending
    pub currently_executing: Vec<ExecutingJobInfo>,
}

/// The three queue-state events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStateEvent {
    /// A trigger or job was stored
    Added,
    /// A trigger fired and its job started
    Executing,
    /// A job finished
    Completed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Listener and Publisher
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives queue-state notifications.
#[async_trait]
pub trait QueueStateListener: Send + Sync {
    async fn on_added(&self, context: &QueueStateContext) -> Result<()>;
    async fn on_executing(&self, context: &QueueStateContext) -> Result<()>;
    async fn on_completed(&self, context: &QueueStateContext) -> Result<()>;
}

/// Fans queue-state events out to registered listeners.
#[derive(Default)]
pub struct QueueStatePublisher {
    listeners: RwLock<Vec<Arc<dyn QueueStateListener>>>,
}

impl QueueStatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn QueueStateListener>) {
        self.listeners.write().push(listener);
    }

    /// Deliver an event to every listener, suppressing their errors.
    pub async fn publish(&self, event: QueueStateEvent, context: &QueueStateContext) {
        let listeners: Vec<Arc<dyn QueueStateListener>> = self.listeners.read().clone();
        for listener in listeners {
            let outcome = match event {
                QueueStateEvent::Added => listener.on_added(context).await,
                QueueStateEvent::Executing => listener.on_executing(context).await,
                QueueStateEvent::Completed => listener.on_completed(context).await,
            };
            if let Err(error) = outcome {
                warn!(?event, %error, "queue-state listener failed");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
