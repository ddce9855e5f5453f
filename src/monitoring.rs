//! Reply failure-rate tracking.
//!
//! Keeps an in-memory ring of recent reply outcomes and periodically logs
//! when the failure rate crosses the warning or alert threshold.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

/// Records kept in the ring.
pub const MAX_RECORDS: usize = 500;
/// Records evaluated per threshold check.
pub const CHECK_WINDOW: usize = 100;
/// Fewer records than this are not enough to judge a rate.
pub const MIN_SAMPLES: usize = 20;
pub const WARNING_THRESHOLD: f64 = 0.05;
pub const ALERT_THRESHOLD: f64 = 0.10;
pub const CHECK_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    AiReplyFailed,
    SendMessageFailed,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiReplyFailed => "AI_REPLY_FAILED",
            Self::SendMessageFailed => "SEND_MESSAGE_FAILED",
        }
    }
}

#[derive(Debug, Clone)]
struct ReplyRecord {
    at: DateTime<Utc>,
    success: bool,
    failure: Option<FailureType>,
}

/// Result of a threshold evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Normal,
    Warning,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureStatistics {
    pub window_hours: u32,
    pub total: usize,
    pub failures: usize,
    /// Fraction in 0.0–1.0.
    pub failure_rate: f64,
    pub by_type: HashMap<FailureType, usize>,
}

struct TrackerState {
    records: VecDeque<ReplyRecord>,
    last_check: Option<DateTime<Utc>>,
}

pub struct ReplyFailureTracker {
    state: Mutex<TrackerState>,
    check_interval: Duration,
}

impl Default for ReplyFailureTracker {
    fn default() -> Self {
        Self::new(CHECK_INTERVAL)
    }
}

impl ReplyFailureTracker {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                records: VecDeque::with_capacity(MAX_RECORDS),
                last_check: None,
            }),
            check_interval,
        }
    }

    pub fn record_success(&self) {
        self.push(true, None);
    }

    pub fn record_failure(&self, failure: FailureType) {
        self.push(false, Some(failure));
    }

    fn push(&self, success: bool, failure: Option<FailureType>) {
        let now = Utc::now();
        let due = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.records.len() == MAX_RECORDS {
                state.records.pop_front();
            }
            state.records.push_back(ReplyRecord {
                at: now,
                success,
                failure,
            });
            let interval = chrono::Duration::from_std(self.check_interval)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
            let due = state.last_check.is_none_or(|last| now - last >= interval);
            if due {
                state.last_check = Some(now);
            }
            due
        };
        if due {
            self.check();
        }
    }

    /// Evaluate the most recent records and log when a threshold is crossed.
    pub fn check(&self) -> AlertLevel {
        let (total, failures) = {
            let Ok(state) = self.state.lock() else {
                return AlertLevel::Normal;
            };
            let recent: Vec<&ReplyRecord> = state.records.iter().rev().take(CHECK_WINDOW).collect();
            let failures = recent.iter().filter(|r| !r.success).count();
            (recent.len(), failures)
        };
        if total < MIN_SAMPLES {
            return AlertLevel::Normal;
        }

        let rate = failures as f64 / total as f64;
        if rate > ALERT_THRESHOLD {
            error!(
                failure_rate_pct = rate * 100.0,
                failures, total, "Reply failure rate above alert threshold"
            );
            AlertLevel::Alert
        } else if rate > WARNING_THRESHOLD {
            warn!(
                failure_rate_pct = rate * 100.0,
                failures, total, "Reply failure rate above warning threshold"
            );
            AlertLevel::Warning
        } else {
            AlertLevel::Normal
        }
    }

    /// Summary over records from the last `hours` hours.
    pub fn statistics(&self, hours: u32) -> FailureStatistics {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
        let mut stats = FailureStatistics {
            window_hours: hours,
            total: 0,
            failures: 0,
            failure_rate: 0.0,
            by_type: HashMap::new(),
        };
        let Ok(state) = self.state.lock() else {
            return stats;
        };
        for r in state.records.iter().filter(|r| r.at >= cutoff) {
            stats.total += 1;
            if !r.success {
                stats.failures += 1;
            }
            if let Some(kind) = r.failure {
                *stats.by_type.entry(kind).or_default() += 1;
            }
        }
        if stats.total > 0 {
            stats.failure_rate = stats.failures as f64 / stats.total as f64;
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
