//! Filter/priority stage.
//!
//! Runs before any AI spend:
//! - empty, too-short, or single-repeated-character messages → spam
//! - selling intent ("sell", "for sale", 出售...) → spam, the service buys
//! - urgency / loan / product keywords → priority
//!
//! HIGH and URGENT messages are routed to human review as well as auto-reply.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::config::FilterConfig;
use crate::error::PipelineError;
use crate::model::{Classification, Priority};
use crate::pipeline::types::{PipelineContext, Stage, StageResult, StageStatus};
use crate::pipeline::user_info::UserInfoStage;
use crate::store::Database;

/// A pattern that marks a message as spam.
#[derive(Debug, Clone)]
pub struct SpamRule {
    pub regex: Regex,
    /// Stored as the conversation's filter reason.
    pub reason: String,
}

/// A pattern that lifts a message to at least `priority`.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub regex: Regex,
    pub priority: Priority,
}

/// Spam heuristic and keyword priority classification.
pub struct FilterEngine {
    min_length: usize,
    spam_rules: Vec<SpamRule>,
    priority_rules: Vec<PriorityRule>,
}

fn compile(pattern: &str) -> Result<Regex, PipelineError> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("invalid filter pattern: {e}")))
}

impl FilterEngine {
    pub fn new(config: &FilterConfig) -> Result<Self, PipelineError> {
        let spam_rules = vec![
            SpamRule {
                regex: compile(r"(?i)(\bsell(s|ing)?\b|\bfor sale\b|\bwts\b|\bbinebenta\b)")?,
                reason: "selling intent".into(),
            },
            SpamRule {
                regex: compile(r"(出售|卖手机|我要卖|我要买手机|收购)")?,
                reason: "selling intent".into(),
            },
        ];

        let priority_rules = vec![
            PriorityRule {
                regex: compile(r"(?i)(\burgent\b|\basap\b|\bemergency\b|紧急|急)")?,
                priority: Priority::Urgent,
            },
            PriorityRule {
                regex: compile(r"(?i)(\bloans?\b|\bborrow|\bpawn|\butang\b|贷款|借)")?,
                priority: Priority::High,
            },
            PriorityRule {
                regex: compile(r"(?i)(iphone|\bprice\b|how much|magkano|apple id|价格|多少钱)")?,
                priority: Priority::Medium,
            },
        ];

        Ok(Self {
            min_length: config.min_length,
            spam_rules,
            priority_rules,
        })
    }

    /// The spam reason, if `text` should never reach reply generation.
    pub fn spam_reason(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Some("empty message".into());
        }
        if trimmed.chars().count() < self.min_length {
            return Some(format!("shorter than {} characters", self.min_length));
        }
        let mut chars = trimmed.chars();
        if let Some(first) = chars.next()
            && chars.all(|c| c == first)
        {
            return Some("single repeated character".into());
        }
        self.spam_rules
            .iter()
            .find(|r| r.regex.is_match(trimmed))
            .map(|r| r.reason.clone())
    }

    /// Highest priority whose keywords appear in `text`; LOW otherwise.
    pub fn priority(&self, text: &str) -> Priority {
        self.priority_rules
            .iter()
            .filter(|r| r.regex.is_match(text))
            .map(|r| r.priority)
            .max()
            .unwrap_or_default()
    }

    pub fn classify(&self, text: &str) -> Classification {
        match self.spam_reason(text) {
            Some(reason) => Classification {
                filtered: true,
                filter_reason: Some(reason),
                priority: Priority::Low,
                review_requested: false,
            },
            None => {
                let priority = self.priority(text);
                Classification {
                    filtered: false,
                    filter_reason: None,
                    priority,
                    review_requested: priority >= Priority::High,
                }
            }
        }
    }
}

pub struct FilterStage {
    db: Arc<dyn Database>,
    engine: Arc<FilterEngine>,
}

impl FilterStage {
    pub const NAME: &'static str = "filter";

    pub fn new(db: Arc<dyn Database>, engine: Arc<FilterEngine>) -> Self {
        Self { db, engine }
    }
}

#[async_trait]
impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn dependencies(&self) -> &[&'static str] {
        &[UserInfoStage::NAME]
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let classification = self.engine.classify(&ctx.event.content);
        self.db
            .update_classification(ctx.conversation.id, &classification)
            .await?;

        ctx.conversation.filtered = classification.filtered;
        ctx.conversation.filter_reason = classification.filter_reason.clone();
        ctx.conversation.priority = classification.priority;
        ctx.conversation.review_requested |= classification.review_requested;

        let outcome = if let Some(reason) = &classification.filter_reason {
            debug!(
                run_id = %ctx.run_id,
                conversation_id = ctx.conversation.id,
                reason = %reason,
                "Message filtered"
            );
            StageStatus::Done(format!("filtered: {reason}"))
        } else {
            if classification.review_requested {
                info!(
                    conversation_id = ctx.conversation.id,
                    priority = %classification.priority,
                    "Message routed to human review"
                );
            }
            StageStatus::Success
        };
        ctx.classification = Some(classification);
        Ok(outcome)
    }
}
