//! Domain records shared by the store, the pipeline and the scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Summaries stored for downstream use never exceed this many characters.
pub const MESSAGE_SUMMARY_MAX_LENGTH: usize = 500;

// ── Inbound event ───────────────────────────────────────────────────

/// A message event as produced by a platform adapter's `parse_event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Platform name: "telegram", "facebook", "instagram", ...
    pub platform: String,
    /// Platform-native id of the sender.
    pub sender_id: String,
    /// Platform-native id of the message. Together with `platform` this is
    /// the dedup key.
    pub message_id: String,
    pub content: String,
    /// Milliseconds since the Unix epoch, as reported by the platform.
    pub timestamp_ms: i64,
    /// The platform payload this event was extracted from.
    pub raw: serde_json::Value,
}

impl NormalizedEvent {
    /// Reject events that cannot be resolved to an identity.
    ///
    /// Empty `content` is allowed: it is classified as spam downstream and
    /// still gets an audit row.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.platform.trim().is_empty() {
            return Err(ValidationError::EmptyField("platform"));
        }
        if self.sender_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("sender_id"));
        }
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("message_id"));
        }
        Ok(())
    }

    /// Platform timestamp, or now when the platform sent none.
    pub fn received_at(&self) -> DateTime<Utc> {
        if self.timestamp_ms <= 0 {
            return Utc::now();
        }
        Utc.timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

// ── Priority ────────────────────────────────────────────────────────

/// Triage priority. Ordered from least to most pressing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ── Customer ────────────────────────────────────────────────────────

/// A platform user. Unique per (platform, platform_user_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub platform: String,
    pub platform_user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// Name is missing or blank, so a backfill from the platform is allowed.
    pub fn needs_name(&self) -> bool {
        self.name.as_deref().is_none_or(|n| n.trim().is_empty())
    }
}

// ── Conversation ────────────────────────────────────────────────────

/// One inbound message. Unique per (platform, platform_message_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub customer_id: i64,
    pub platform: String,
    pub platform_message_id: String,
    pub content: String,
    pub raw_data: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
    /// Flips false→true exactly once.
    pub ai_replied: bool,
    pub ai_reply_content: Option<String>,
    pub ai_reply_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub filtered: bool,
    pub filter_reason: Option<String>,
    /// Failed reply attempts so far.
    pub reply_attempts: u32,
    /// Routed to a human (high priority, or retry budget exhausted).
    pub review_requested: bool,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub customer_id: i64,
    pub platform: String,
    pub platform_message_id: String,
    pub content: String,
    pub raw_data: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

impl NewConversation {
    pub fn from_event(customer_id: i64, event: &NormalizedEvent) -> Self {
        Self {
            customer_id,
            platform: event.platform.clone(),
            platform_message_id: event.message_id.clone(),
            content: event.content.clone(),
            raw_data: (!event.raw.is_null()).then(|| event.raw.clone()),
            received_at: event.received_at(),
        }
    }
}

/// Outcome of the filter/priority classification, persisted on the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    pub filtered: bool,
    pub filter_reason: Option<String>,
    pub priority: Priority,
    pub review_requested: bool,
}

/// A prior turn in a customer's history, oldest first when listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

// ── Prompt experiment ───────────────────────────────────────────────

/// One arm of a prompt experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: i64,
    /// Stable identifier, e.g. "v2-friendly".
    pub version_code: String,
    pub name: String,
    /// The system prompt text.
    pub content: String,
    pub is_active: bool,
    pub total_uses: i64,
    /// Exponential moving average over recorded usages.
    pub avg_response_time_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPromptVersion {
    pub version_code: String,
    pub name: String,
    pub content: String,
    pub is_active: bool,
}

/// Append-only record of one generation attempt under a prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptUsageLog {
    pub id: i64,
    pub version_id: i64,
    pub customer_id: i64,
    pub conversation_id: Option<i64>,
    pub response_time_ms: u64,
    pub tokens_used: Option<u32>,
    pub cost: Option<Decimal>,
    pub success: bool,
    pub error: Option<String>,
    pub used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub version_id: i64,
    pub customer_id: i64,
    pub conversation_id: Option<i64>,
    pub response_time_ms: u64,
    pub tokens_used: Option<u32>,
    pub cost: Option<Decimal>,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregates over a version's usage log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub total_uses: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_time_ms: Option<f64>,
    pub total_tokens: u64,
    pub total_cost: Decimal,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Bound `text` to `max` characters, ending in "..." when cut.
pub fn summarize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
