//! Reply decision: prompt selection, generation, persistence and delivery.
//!
//! [`ReplyDecider`] is shared by the pipeline's [`ReplyStage`] and the
//! reconciliation scheduler, so both paths follow the same rules:
//!
//! - the spam heuristic is re-applied to rows that reach the decider without
//!   having been classified as spam, so the scheduler never answers spam
//! - a failed generation leaves `ai_replied = false`, logs an unsuccessful
//!   usage row and counts against the conversation's retry budget
//! - a successful generation is persisted through a conditional update; only
//!   the writer that flips the flag delivers
//! - delivery failure after persisting is logged, not rolled back

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheService};
use crate::config::AppConfig;
use crate::error::{AdapterError, LlmError, PipelineError};
use crate::experiment::{PromptExperiment, PromptSelection};
use crate::history::{ConversationHistory, DEFAULT_HISTORY_LIMIT};
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, estimate_cost};
use crate::model::{Conversation, Customer, NewUsageLog, TurnRole};
use crate::monitoring::{FailureType, ReplyFailureTracker};
use crate::pipeline::filter::{FilterEngine, FilterStage};
use crate::pipeline::types::{PipelineContext, ReplyOutcome, Stage, StageResult, StageStatus};
use crate::platforms::{DeliveryResult, PlatformAdapter};
use crate::store::Database;

#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub generation_timeout: Duration,
    pub delivery_timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Failed generations after which a conversation is escalated.
    pub max_attempts: u32,
    pub history_ttl: Duration,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(15),
            temperature: 0.7,
            max_tokens: 500,
            max_attempts: 3,
            history_ttl: Duration::from_secs(300),
        }
    }
}

impl ReplySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            generation_timeout: config.timeouts.generation,
            delivery_timeout: config.timeouts.delivery,
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            max_attempts: config.reconcile.max_attempts,
            history_ttl: config.cache.conversation_ttl,
        }
    }
}

pub struct ReplyDecider {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    llm: Arc<dyn LlmProvider>,
    filter: Arc<FilterEngine>,
    experiment: PromptExperiment,
    history: ConversationHistory,
    tracker: Arc<ReplyFailureTracker>,
    settings: ReplySettings,
}

impl ReplyDecider {
    pub fn new(
        db: Arc<dyn Database>,
        cache: Arc<CacheService>,
        llm: Arc<dyn LlmProvider>,
        filter: Arc<FilterEngine>,
        tracker: Arc<ReplyFailureTracker>,
        settings: ReplySettings,
    ) -> Self {
        Self {
            experiment: PromptExperiment::new(Arc::clone(&db)),
            history: ConversationHistory::new(
                Arc::clone(&db),
                Arc::clone(&cache),
                settings.history_ttl,
            ),
            db,
            cache,
            llm,
            filter,
            tracker,
            settings,
        }
    }

    pub fn tracker(&self) -> &ReplyFailureTracker {
        &self.tracker
    }

    /// The spam/priority rules this decider gates on.
    pub fn filter(&self) -> &Arc<FilterEngine> {
        &self.filter
    }

    /// Generate, persist and deliver a reply for `conversation`.
    ///
    /// Returns `Err` when generation failed; the conversation stays
    /// unreplied and eligible for a later retry within its budget.
    pub async fn decide(
        &self,
        conversation: &Conversation,
        customer: &Customer,
        adapter: &dyn PlatformAdapter,
    ) -> Result<ReplyOutcome, PipelineError> {
        if conversation.ai_replied {
            return Ok(ReplyOutcome::AlreadyReplied);
        }
        if conversation.filtered {
            return Ok(ReplyOutcome::NotEligible(
                conversation
                    .filter_reason
                    .clone()
                    .unwrap_or_else(|| "filtered".into()),
            ));
        }
        // Rows created outside the pipeline, or whose run failed before the
        // filter stage, still carry the default classification.
        let classification = self.filter.classify(&conversation.content);
        if let Some(reason) = classification.filter_reason.clone() {
            self.db
                .update_classification(conversation.id, &classification)
                .await?;
            info!(
                conversation_id = conversation.id,
                reason = %reason,
                "Unclassified spam withheld from reply generation"
            );
            return Ok(ReplyOutcome::NotEligible(reason));
        }

        let selection = self.experiment.select(customer.id).await?;
        let request = self.build_request(&selection, conversation, customer.id).await?;

        let started = Instant::now();
        let generated = match tokio::time::timeout(
            self.settings.generation_timeout,
            self.llm.complete(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.settings.generation_timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match generated {
            Ok(response) => response,
            Err(e) => {
                self.record_generation_failure(&selection, conversation, elapsed_ms, &e)
                    .await?;
                return Err(e.into());
            }
        };

        let reply = response.content.clone();
        let won = self
            .db
            .mark_replied_if_unreplied(conversation.id, &reply, Utc::now())
            .await?;
        self.record_generation_success(&selection, conversation, elapsed_ms, &response)
            .await;

        if !won {
            debug!(
                conversation_id = conversation.id,
                "Conversation answered by another writer; not delivering"
            );
            return Ok(ReplyOutcome::AlreadyReplied);
        }

        self.history.invalidate(customer.id).await;
        self.cache
            .delete(&cache::conversation_key(
                &conversation.platform,
                &conversation.platform_message_id,
            ))
            .await;

        let delivery = self.deliver(conversation, customer, adapter, &reply).await;
        let delivered = delivery.success;
        if delivered {
            self.tracker.record_success();
            info!(
                conversation_id = conversation.id,
                platform = %conversation.platform,
                version = selection.version_code(),
                elapsed_ms,
                "Reply delivered"
            );
        } else {
            self.tracker.record_failure(FailureType::SendMessageFailed);
            warn!(
                conversation_id = conversation.id,
                platform = %conversation.platform,
                error = ?delivery.error.as_ref().map(ToString::to_string),
                "Reply stored but delivery failed"
            );
        }

        Ok(ReplyOutcome::Replied {
            reply,
            version_code: selection.version_code().to_string(),
            delivered,
            provider_message_id: delivery.provider_message_id,
        })
    }

    async fn build_request(
        &self,
        selection: &PromptSelection,
        conversation: &Conversation,
        customer_id: i64,
    ) -> Result<CompletionRequest, PipelineError> {
        let turns = self
            .history
            .recent(customer_id, conversation.received_at, DEFAULT_HISTORY_LIMIT)
            .await?;

        let mut messages = Vec::with_capacity(turns.len() + 2);
        messages.push(ChatMessage::system(selection.system_prompt.clone()));
        // Cached history may have been built for a later message.
        for turn in turns.into_iter().filter(|t| t.at < conversation.received_at) {
            messages.push(match turn.role {
                TurnRole::User => ChatMessage::user(turn.content),
                TurnRole::Assistant => ChatMessage::assistant(turn.content),
            });
        }
        messages.push(ChatMessage::user(conversation.content.clone()));

        Ok(CompletionRequest::new(messages)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens))
    }

    async fn record_generation_failure(
        &self,
        selection: &PromptSelection,
        conversation: &Conversation,
        elapsed_ms: u64,
        error: &LlmError,
    ) -> Result<(), PipelineError> {
        let log = NewUsageLog {
            version_id: 0,
            customer_id: conversation.customer_id,
            conversation_id: Some(conversation.id),
            response_time_ms: elapsed_ms,
            tokens_used: None,
            cost: None,
            success: false,
            error: Some(error.to_string()),
        };
        if let Err(e) = self.experiment.record_usage(selection, log).await {
            warn!(conversation_id = conversation.id, error = %e, "Failed to record prompt usage");
        }

        let attempts = self
            .db
            .record_reply_failure(conversation.id, self.settings.max_attempts)
            .await?;
        self.tracker.record_failure(FailureType::AiReplyFailed);

        if attempts >= self.settings.max_attempts {
            warn!(
                conversation_id = conversation.id,
                attempts,
                error = %error,
                "Reply retry budget exhausted; escalated to human review"
            );
        } else {
            warn!(
                conversation_id = conversation.id,
                attempts,
                error = %error,
                "Reply generation failed"
            );
        }
        Ok(())
    }

    async fn record_generation_success(
        &self,
        selection: &PromptSelection,
        conversation: &Conversation,
        elapsed_ms: u64,
        response: &CompletionResponse,
    ) {
        let log = NewUsageLog {
            version_id: 0,
            customer_id: conversation.customer_id,
            conversation_id: Some(conversation.id),
            response_time_ms: elapsed_ms,
            tokens_used: Some(response.total_tokens()),
            cost: Some(estimate_cost(self.llm.as_ref(), response)),
            success: true,
            error: None,
        };
        if let Err(e) = self.experiment.record_usage(selection, log).await {
            warn!(conversation_id = conversation.id, error = %e, "Failed to record prompt usage");
        }
    }

    async fn deliver(
        &self,
        conversation: &Conversation,
        customer: &Customer,
        adapter: &dyn PlatformAdapter,
        reply: &str,
    ) -> DeliveryResult {
        let hint = conversation
            .raw_data
            .as_ref()
            .and_then(|raw| adapter.routing_hint(raw));
        let send = adapter.send_message(&customer.platform_user_id, reply, hint.as_ref());
        match tokio::time::timeout(self.settings.delivery_timeout, send).await {
            Ok(result) => result,
            Err(_) => DeliveryResult::failed(AdapterError::Timeout {
                platform: adapter.platform().to_string(),
                operation: "send_message".into(),
                timeout: self.settings.delivery_timeout,
            }),
        }
    }
}

pub struct ReplyStage {
    decider: Arc<ReplyDecider>,
}

impl ReplyStage {
    pub const NAME: &'static str = "reply";

    pub fn new(decider: Arc<ReplyDecider>) -> Self {
        Self { decider }
    }
}

#[async_trait]
impl Stage for ReplyStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn dependencies(&self) -> &[&'static str] {
        &[FilterStage::NAME]
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let classification = ctx
            .classification
            .as_ref()
            .ok_or(PipelineError::MissingContext {
                stage: Self::NAME,
                field: "classification",
            })?;
        if classification.filtered {
            return Ok(StageStatus::Skip("filtered".into()));
        }

        let outcome = self
            .decider
            .decide(&ctx.conversation, &ctx.customer, ctx.adapter.as_ref())
            .await?;
        if let ReplyOutcome::Replied { reply, .. } = &outcome {
            ctx.conversation.ai_replied = true;
            ctx.conversation.ai_reply_content = Some(reply.clone());
            ctx.conversation.ai_reply_at = Some(Utc::now());
        }
        ctx.reply = Some(outcome);
        Ok(StageStatus::Success)
    }
}
