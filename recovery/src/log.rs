//! Bounded in-process error trail.
//!
//! Keeps the most recent terminal failures in a fixed-capacity ring buffer,
//! evicting the oldest entry when capacity is exceeded. Nothing is persisted.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::ErrorClassification;
use crate::context::OperationContext;

/// Default number of entries kept.
pub const DEFAULT_CAPACITY: usize = 100;

/// Number of entries returned in [`ErrorStats::recent_errors`].
const RECENT_ERRORS: usize = 10;

/// Identifier stamped on every entry of one error trail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One recorded terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    #[serde(rename = "type")]
    pub error_type: ErrorClassification,
    pub message: String,
    /// Debug rendering of the error value as the operation returned it.
    pub original_error: String,
    pub timestamp: DateTime<Utc>,
    pub context: OperationContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub session_id: SessionId,
}

/// Aggregate view over the current buffer contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub errors_by_type: BTreeMap<ErrorClassification, usize>,
    /// Up to the ten most recent entries, oldest first.
    pub recent_errors: Vec<ErrorLogEntry>,
    pub session_id: SessionId,
}

/// Thread-safe error log with ring buffer storage.
///
/// Clones share the same buffer and session id.
#[derive(Clone)]
pub struct ErrorLog {
    inner: Arc<ErrorLogInner>,
}

struct ErrorLogInner {
    session_id: SessionId,
    ring: Mutex<RingBuffer>,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLog")
            .field("session_id", &self.inner.session_id)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl ErrorLog {
    /// Create a log with the default capacity (100 entries).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a log keeping at most `capacity` entries (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ErrorLogInner {
                session_id: SessionId::generate(),
                ring: Mutex::new(RingBuffer::new(capacity.max(1))),
            }),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn record(&self, entry: ErrorLogEntry) {
        self.lock().push(entry);
    }

    /// Copy of the current entries, oldest first.
    pub fn snapshot(&self) -> Vec<ErrorLogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn stats(&self) -> ErrorStats {
        let guard = self.lock();
        let mut errors_by_type = BTreeMap::new();
        for entry in &guard.entries {
            *errors_by_type.entry(entry.error_type).or_insert(0) += 1;
        }
        let skip = guard.entries.len().saturating_sub(RECENT_ERRORS);
        ErrorStats {
            total_errors: guard.entries.len(),
            errors_by_type,
            recent_errors: guard.entries.iter().skip(skip).cloned().collect(),
            session_id: self.inner.session_id.clone(),
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().max
    }

    // A panic while holding the lock cannot leave the deque half-written,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, RingBuffer> {
        self.inner
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-capacity ring buffer that evicts the oldest entry when full.
struct RingBuffer {
    max: usize,
    entries: VecDeque<ErrorLogEntry>,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            max: capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn push(&mut self, entry: ErrorLogEntry) {
        while self.entries.len() >= self.max {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(log: &ErrorLog, class: ErrorClassification, message: &str) -> ErrorLogEntry {
        ErrorLogEntry {
            error_type: class,
            message: message.to_string(),
            original_error: format!("OperationError {{ message: {message:?} }}"),
            timestamp: Utc::now(),
            context: OperationContext::named("test"),
            stack_trace: None,
            user_agent: "test-agent".to_string(),
            url: None,
            session_id: log.session_id().clone(),
        }
    }

    #[test]
    fn ring_buffer_drops_oldest_when_full() {
        let log = ErrorLog::with_capacity(3);
        for i in 0..4 {
            log.record(entry(&log, ErrorClassification::Network, &format!("e{i}")));
        }
        let messages: Vec<String> = log.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["e1", "e2", "e3"]);
    }

    #[test]
    fn default_capacity_never_exceeded() {
        let log = ErrorLog::new();
        for i in 0..=DEFAULT_CAPACITY {
            log.record(entry(&log, ErrorClassification::Timeout, &format!("e{i}")));
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), DEFAULT_CAPACITY);
        assert!(snapshot.iter().all(|e| e.message != "e0"));
        assert_eq!(
            snapshot.last().map(|e| e.message.as_str()),
            Some(format!("e{DEFAULT_CAPACITY}").as_str())
        );
    }

    #[test]
    fn stats_are_computed_from_current_contents() {
        let log = ErrorLog::with_capacity(20);
        log.record(entry(&log, ErrorClassification::Network, "a"));
        log.record(entry(&log, ErrorClassification::Network, "b"));
        log.record(entry(&log, ErrorClassification::Validation, "c"));

        let stats = log.stats();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(
            stats.errors_by_type.get(&ErrorClassification::Network),
            Some(&2)
        );
        assert_eq!(
            stats.errors_by_type.get(&ErrorClassification::Validation),
            Some(&1)
        );
        assert_eq!(stats.recent_errors.len(), 3);
        assert_eq!(&stats.session_id, log.session_id());

        log.record(entry(&log, ErrorClassification::Database, "d"));
        assert_eq!(log.stats().total_errors, 4);
    }

    #[test]
    fn recent_errors_are_the_last_ten() {
        let log = ErrorLog::with_capacity(50);
        for i in 0..15 {
            log.record(entry(&log, ErrorClassification::Unknown, &format!("e{i}")));
        }
        let recent: Vec<String> = log
            .stats()
            .recent_errors
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent.first().map(String::as_str), Some("e5"));
        assert_eq!(recent.last().map(String::as_str), Some("e14"));
    }

    #[test]
    fn clear_keeps_session_id() {
        let log = ErrorLog::with_capacity(8);
        let session = log.session_id().clone();
        log.record(entry(&log, ErrorClassification::Network, "x"));
        assert_eq!(log.len(), 1);

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.session_id(), &session);
        assert_eq!(log.stats().total_errors, 0);
    }

    #[test]
    fn clones_share_the_buffer() {
        let log = ErrorLog::with_capacity(8);
        let other = log.clone();
        other.record(entry(&other, ErrorClassification::Network, "shared"));
        assert_eq!(log.len(), 1);
        assert_eq!(log.session_id(), other.session_id());
    }

    #[test]
    fn separate_logs_get_distinct_sessions() {
        assert_ne!(ErrorLog::new().session_id(), ErrorLog::new().session_id());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let log = ErrorLog::with_capacity(0);
        log.record(entry(&log, ErrorClassification::Network, "a"));
        log.record(entry(&log, ErrorClassification::Network, "b"));
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.snapshot()[0].message, "b");
    }

    #[test]
    fn entry_serializes_with_type_tag() {
        let log = ErrorLog::with_capacity(1);
        let value = serde_json::to_value(entry(&log, ErrorClassification::Timeout, "t")).unwrap();
        assert_eq!(value["type"], "timeout");
        assert_eq!(value["session_id"], log.session_id().as_str());
        assert!(value.get("stack_trace").is_none());
    }
}
