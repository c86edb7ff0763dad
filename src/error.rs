//! Error handling for the scheduler store.
//!
//! This module provides:
//! - A single error type with machine-readable codes
//! - Retryability and severity classification for callers and alerting
//! - Metrics integration for error tracking
//!
//! Anything raised by the database layer wraps into
//! [`ErrorCode::Persistence`] with the originating cause attached, so the
//! dispatcher only ever has to match on codes.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for scheduler store operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A database operation failed; the transaction rolled back.
    Persistence,
    /// A job-type string could not be resolved to a registered type.
    TypeResolution,
    /// The configuration is missing or inconsistent.
    Configuration,
    /// An entity was found in a state the operation cannot proceed from.
    InvalidState,
    /// A request carried invalid input (bad key, empty name, zero count).
    Validation,
    /// Serialization of a job data map or event payload failed.
    Serialization,
    /// Anything that should not happen.
    Internal,
}

impl ErrorCode {
    /// Check if an operation failing with this code may be retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence)
    }

    /// Get the error category for metrics grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Persistence => "persistence",
            Self::TypeResolution => "type_resolution",
            Self::Configuration => "configuration",
            Self::InvalidState | Self::Validation => "request",
            Self::Serialization => "serialization",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, state races lost on purpose)
    Low,
    /// Operational issues localized to a single trigger
    Medium,
    /// System errors threatening batch consistency
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::Validation | ErrorCode::InvalidState => Self::Low,
            ErrorCode::TypeResolution | ErrorCode::Serialization => Self::Medium,
            ErrorCode::Persistence | ErrorCode::Configuration | ErrorCode::Internal => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for all scheduler store operations.
///
/// Supports structured codes, a short message safe for queue-state surfaces,
/// a detailed internal message for logging, and source-error chaining.
#[derive(Error, Debug)]
pub struct SchedulerError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Short message (safe to surface to operators)
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SchedulerError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create a persistence error wrapping a database cause.
    pub fn persistence<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::new(ErrorCode::Persistence, "database operation failed").with_source(source)
    }

    /// Create a type-resolution error for a job-type string.
    pub fn type_resolution(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            code: ErrorCode::TypeResolution,
            message: Cow::Owned(format!("unknown job type: {type_name}")),
            internal_message: None,
            source: None,
        }
        .recorded()
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Configuration, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, "internal scheduler error")
            .with_internal_message(message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add an internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the short message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging / Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at a level matching its severity.
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::High => {
                error!(code = %self.code, internal = ?self.internal_message, "{}", self.message)
            }
            ErrorSeverity::Medium => {
                warn!(code = %self.code, internal = ?self.internal_message, "{}", self.message)
            }
            ErrorSeverity::Low => {
                tracing::debug!(code = %self.code, "{}", self.message)
            }
        }
    }

    fn recorded(self) -> Self {
        self.record_metrics();
        self
    }

    fn record_metrics(&self) {
        counter!("scheduler_errors_total", "code" => self.code.category()).increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SchedulerError {
    fn from(error: sqlx::Error) -> Self {
        SchedulerError::persistence(error)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::new(ErrorCode::Serialization, "serialization failed").with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
