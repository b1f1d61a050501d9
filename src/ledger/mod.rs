use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Failure taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Validation,
    Processing,
    Timeout,
    Configuration,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Validation => "validation",
            ErrorKind::Processing => "processing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One classified failure with optional structured context.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Aggregate view over the current history.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub total: usize,
    pub by_kind: HashMap<ErrorKind, usize>,
    pub last_five_minutes: usize,
}

const RECURRENCE_WINDOW_MINUTES: i64 = 5;
const RECURRENCE_THRESHOLD: usize = 3;

/// Bounded, classified record of failures, newest first.
///
/// Capacity-bounded: the oldest entries are evicted once the history exceeds
/// capacity. Shared across components behind an `Arc`.
pub struct ErrorLedger {
    capacity: usize,
    records: RwLock<VecDeque<ErrorRecord>>,
}

impl ErrorLedger {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: RwLock::new(VecDeque::new()),
        }
    }

    /// Record a failure. Returns the stored record; logs recurring failures
    /// distinctly so repeated identical errors are visible as a pattern
    /// rather than re-reported one by one.
    pub fn record(&self, kind: ErrorKind, message: impl Into<String>, context: Option<Value>) -> ErrorRecord {
        let record = ErrorRecord {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            context,
        };

        {
            let mut records = self.records.write().unwrap();
            records.push_front(record.clone());
            while records.len() > self.capacity {
                records.pop_back();
            }
        }

        if self.is_recurring(&record, RECURRENCE_WINDOW_MINUTES) {
            warn!(kind = %record.kind, message = %record.message, "recurring error");
        } else {
            debug!(kind = %record.kind, message = %record.message, "error recorded");
        }

        record
    }

    /// Most recent records first, optionally limited.
    pub fn history(&self, limit: Option<usize>) -> Vec<ErrorRecord> {
        let records = self.records.read().unwrap();
        let take = limit.unwrap_or(records.len());
        records.iter().take(take).cloned().collect()
    }

    pub fn by_kind(&self, kind: ErrorKind, limit: Option<usize>) -> Vec<ErrorRecord> {
        let records = self.records.read().unwrap();
        let take = limit.unwrap_or(records.len());
        records
            .iter()
            .filter(|r| r.kind == kind)
            .take(take)
            .cloned()
            .collect()
    }

    /// Records from the trailing `minutes` window.
    pub fn recent(&self, minutes: i64) -> Vec<ErrorRecord> {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        let records = self.records.read().unwrap();
        records
            .iter()
            .take_while(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// True when more than three records with this record's kind and message
    /// fall within the trailing window.
    pub fn is_recurring(&self, record: &ErrorRecord, window_minutes: i64) -> bool {
        let cutoff = Utc::now() - Duration::minutes(window_minutes);
        let records = self.records.read().unwrap();
        let count = records
            .iter()
            .take_while(|r| r.timestamp >= cutoff)
            .filter(|r| r.kind == record.kind && r.message == record.message)
            .count();
        count > RECURRENCE_THRESHOLD
    }

    pub fn summary(&self) -> LedgerSummary {
        let cutoff = Utc::now() - Duration::minutes(RECURRENCE_WINDOW_MINUTES);
        let records = self.records.read().unwrap();
        let mut by_kind: HashMap<ErrorKind, usize> = HashMap::new();
        let mut last_five_minutes = 0;
        for record in records.iter() {
            *by_kind.entry(record.kind).or_insert(0) += 1;
            if record.timestamp >= cutoff {
                last_five_minutes += 1;
            }
        }
        LedgerSummary {
            total: records.len(),
            by_kind,
            last_five_minutes,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

impl Default for ErrorLedger {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_is_newest_first_and_bounded() {
        let ledger = ErrorLedger::new(3);
        for i in 0..5 {
            ledger.record(ErrorKind::Processing, format!("err {}", i), None);
        }

        let history = ledger.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "err 4");
        assert_eq!(history[2].message, "err 2");
    }

    #[test]
    fn history_limit_applies() {
        let ledger = ErrorLedger::default();
        for i in 0..10 {
            ledger.record(ErrorKind::Unknown, format!("err {}", i), None);
        }
        assert_eq!(ledger.history(Some(4)).len(), 4);
    }

    #[test]
    fn by_kind_filters() {
        let ledger = ErrorLedger::default();
        ledger.record(ErrorKind::Connection, "lost", None);
        ledger.record(ErrorKind::Validation, "bad record", None);
        ledger.record(ErrorKind::Connection, "lost again", None);

        let connection = ledger.by_kind(ErrorKind::Connection, None);
        assert_eq!(connection.len(), 2);
        assert!(connection.iter().all(|r| r.kind == ErrorKind::Connection));
    }

    #[test]
    fn recurring_after_fourth_identical_record() {
        let ledger = ErrorLedger::default();
        let mut last = ledger.record(ErrorKind::Connection, "refused", None);
        assert!(!ledger.is_recurring(&last, 5));

        for _ in 0..2 {
            last = ledger.record(ErrorKind::Connection, "refused", None);
            assert!(!ledger.is_recurring(&last, 5));
        }

        last = ledger.record(ErrorKind::Connection, "refused", None);
        assert!(ledger.is_recurring(&last, 5));
    }

    #[test]
    fn recurrence_ignores_records_outside_window() {
        let ledger = ErrorLedger::default();
        // An old occurrence planted outside the trailing window.
        {
            let mut records = ledger.records.write().unwrap();
            records.push_back(ErrorRecord {
                kind: ErrorKind::Connection,
                message: "refused".to_string(),
                timestamp: Utc::now() - Duration::minutes(6),
                context: None,
            });
        }
        for _ in 0..3 {
            ledger.record(ErrorKind::Connection, "refused", None);
        }
        let last = ledger.history(Some(1)).remove(0);
        assert!(!ledger.is_recurring(&last, 5));
    }

    #[test]
    fn different_message_does_not_count_toward_recurrence() {
        let ledger = ErrorLedger::default();
        for _ in 0..3 {
            ledger.record(ErrorKind::Connection, "refused", None);
        }
        let other = ledger.record(ErrorKind::Connection, "reset", None);
        assert!(!ledger.is_recurring(&other, 5));
    }

    #[test]
    fn summary_counts_per_kind() {
        let ledger = ErrorLedger::default();
        ledger.record(ErrorKind::Processing, "skip", None);
        ledger.record(ErrorKind::Processing, "skip", None);
        ledger.record(ErrorKind::Timeout, "slow", None);

        let summary = ledger.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_kind[&ErrorKind::Processing], 2);
        assert_eq!(summary.by_kind[&ErrorKind::Timeout], 1);
        assert_eq!(summary.last_five_minutes, 3);
    }

    #[test]
    fn context_is_preserved() {
        let ledger = ErrorLedger::default();
        let record = ledger.record(
            ErrorKind::Processing,
            "record has no identifying id",
            Some(json!({"type": "bus"})),
        );
        assert_eq!(record.context, Some(json!({"type": "bus"})));
    }
}
