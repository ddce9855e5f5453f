//! Shared types for the per-event pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::model::{Classification, Conversation, Customer, NormalizedEvent};
use crate::platforms::{PlatformAdapter, UserInfo};

// ── Stage contract ──────────────────────────────────────────────────

/// How a stage finished, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Continue with the next stage.
    Success,
    /// Succeeded, but nothing further should run for this event.
    Done(String),
    /// Nothing to do for this event; stop without error.
    Skip(String),
}

impl StageStatus {
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Done(_) => "done",
            Self::Skip(_) => "skip",
        }
    }
}

/// `Err` is the ERROR status: the run stops and is reported as failed.
pub type StageResult = Result<StageStatus, PipelineError>;

/// One unit of work in a [`Pipeline`](super::Pipeline).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Unique name, referenced by other stages' dependency lists.
    fn name(&self) -> &'static str;

    /// Names of stages that must run before this one.
    fn dependencies(&self) -> &[&'static str] {
        &[]
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult;
}

// ── Context ─────────────────────────────────────────────────────────

/// Coarse category of what the customer is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InquiryType {
    Loan,
    Pricing,
    Product,
    #[default]
    General,
}

impl InquiryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loan => "loan",
            Self::Pricing => "pricing",
            Self::Product => "product",
            Self::General => "general",
        }
    }
}

/// Structured hints pulled out of the message text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub inquiry_type: InquiryType,
}

/// What the reply decision did for a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// A reply was generated and persisted by this writer.
    Replied {
        reply: String,
        version_code: String,
        /// Whether the platform accepted the message.
        delivered: bool,
        provider_message_id: Option<String>,
    },
    /// The conversation was already answered, by this or another writer.
    AlreadyReplied,
    /// Filtered conversations never get a reply.
    NotEligible(String),
}

/// Mutable state threaded through every stage for one event.
pub struct PipelineContext {
    pub run_id: Uuid,
    pub event: NormalizedEvent,
    pub customer: Customer,
    pub conversation: Conversation,
    pub adapter: Arc<dyn PlatformAdapter>,
    /// Bounded copy of the message for downstream storage.
    pub summary: Option<String>,
    pub extracted: ExtractedInfo,
    pub user_info: Option<UserInfo>,
    pub classification: Option<Classification>,
    pub reply: Option<ReplyOutcome>,
    /// Free-form values stages may share without a dedicated field.
    pub extras: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    pub fn new(
        event: NormalizedEvent,
        customer: Customer,
        conversation: Conversation,
        adapter: Arc<dyn PlatformAdapter>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            event,
            customer,
            conversation,
            adapter,
            summary: None,
            extracted: ExtractedInfo::default(),
            user_info: None,
            classification: None,
            reply: None,
            extras: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("platform", &self.event.platform)
            .field("conversation_id", &self.conversation.id)
            .field("customer_id", &self.customer.id)
            .finish_non_exhaustive()
    }
}

// ── Run report ──────────────────────────────────────────────────────

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every stage returned `Success`.
    Completed,
    /// A stage stopped the run without error.
    Stopped { stage: &'static str, reason: String },
    /// A stage failed; later stages did not run.
    Failed { stage: &'static str, error: String },
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Stages that ran, in order, with their status label.
    pub stages: Vec<(&'static str, &'static str)>,
}

impl PipelineReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, RunStatus::Failed { .. })
    }

    pub fn ran(&self, stage: &str) -> bool {
        self.stages.iter().any(|(name, _)| *name == stage)
    }
}
