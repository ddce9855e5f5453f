//! `Database` trait: the single async interface for all persistence.
//!
//! Uniqueness of customers and conversations is enforced here, by the
//! store, so concurrent resolvers (in this process or another) cannot create
//! duplicates.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{
    Classification, Conversation, Customer, NewConversation, NewPromptVersion, NewUsageLog,
    PromptUsageLog, PromptVersion, UsageTotals,
};

/// Predicate for conversations that still need an automated reply.
#[derive(Debug, Clone)]
pub struct UnrepliedQuery {
    /// Lower bound on `received_at`; `None` scans all history.
    pub since: Option<DateTime<Utc>>,
    /// Upper bound on `received_at`.
    pub received_before: DateTime<Utc>,
    /// Case-insensitive substrings; a conversation matches if any is
    /// contained in its content. Empty means no keyword restriction.
    pub keywords: Vec<String>,
    /// Conversations with this many failed attempts are excluded.
    pub max_attempts: u32,
    pub limit: u32,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Customers ───────────────────────────────────────────────────

    /// Return the customer for (platform, platform_user_id), inserting it
    /// if absent. Implemented as one conditional insert followed by a read,
    /// so racing callers all observe the same row.
    async fn get_or_create_customer(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Customer, DatabaseError>;

    async fn get_customer(&self, id: i64) -> Result<Option<Customer>, DatabaseError>;

    /// Set the display name only when none is stored. Returns whether the
    /// row changed.
    async fn update_customer_name_if_empty(
        &self,
        id: i64,
        name: &str,
    ) -> Result<bool, DatabaseError>;

    /// Fill in email/phone where the stored value is empty.
    async fn update_customer_contact(
        &self,
        id: i64,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, DatabaseError>;

    /// Look up a conversation by its dedup key.
    async fn get_conversation_by_message(
        &self,
        platform: &str,
        platform_message_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Insert unless the dedup key already exists. Returns the stored row
    /// and whether this call created it.
    async fn insert_conversation_if_absent(
        &self,
        new: &NewConversation,
    ) -> Result<(Conversation, bool), DatabaseError>;

    /// Persist filter/priority results.
    async fn update_classification(
        &self,
        id: i64,
        classification: &Classification,
    ) -> Result<(), DatabaseError>;

    /// Attach a reply and flip `ai_replied` to true, only if it is still
    /// false. Returns `false` when another writer already replied.
    async fn mark_replied_if_unreplied(
        &self,
        id: i64,
        reply: &str,
        replied_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Count a failed reply attempt on an unreplied conversation. The attempt
    /// that reaches `max_attempts` also requests human review and raises the
    /// priority to urgent. Returns the attempt count after the update.
    async fn record_reply_failure(&self, id: i64, max_attempts: u32)
    -> Result<u32, DatabaseError>;

    /// Unreplied, unfiltered, non-empty conversations matching `query`,
    /// oldest first.
    async fn list_unreplied(
        &self,
        query: &UnrepliedQuery,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    /// The customer's most recent `limit` conversations received before
    /// `before`, in chronological order.
    async fn customer_history(
        &self,
        customer_id: i64,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>, DatabaseError>;

    // ── Prompt experiments ──────────────────────────────────────────

    async fn create_prompt_version(
        &self,
        new: &NewPromptVersion,
    ) -> Result<PromptVersion, DatabaseError>;

    async fn set_prompt_version_active(&self, id: i64, active: bool) -> Result<(), DatabaseError>;

    async fn get_prompt_version_by_code(
        &self,
        version_code: &str,
    ) -> Result<Option<PromptVersion>, DatabaseError>;

    /// Active versions, most recently created first (ties broken by id).
    async fn list_active_prompt_versions(&self) -> Result<Vec<PromptVersion>, DatabaseError>;

    /// Append a usage-log row and update the version's counters.
    async fn record_prompt_usage(&self, log: &NewUsageLog)
    -> Result<PromptUsageLog, DatabaseError>;

    /// Usage rows for a conversation, oldest first.
    async fn usage_logs_for_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<PromptUsageLog>, DatabaseError>;

    /// Aggregate a version's usage log, optionally from `since` onwards.
    async fn usage_totals(
        &self,
        version_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, DatabaseError>;
}
