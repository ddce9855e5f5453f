//! Message receipt: bounded summary and structured hints from free text.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::cache::{self, CacheService};
use crate::error::PipelineError;
use crate::model::{MESSAGE_SUMMARY_MAX_LENGTH, summarize};
use crate::pipeline::types::{
    ExtractedInfo, InquiryType, PipelineContext, Stage, StageResult, StageStatus,
};
use crate::store::Database;

fn compile(pattern: &str) -> Result<Regex, PipelineError> {
    Regex::new(pattern).map_err(|e| PipelineError::Config(format!("invalid pattern: {e}")))
}

/// Compiled patterns for pulling structured hints out of free text.
pub struct Extractor {
    email: Regex,
    phone: Regex,
    loan: Regex,
    pricing: Regex,
    product: Regex,
}

impl Extractor {
    pub fn new() -> Result<Self, PipelineError> {
        Ok(Self {
            email: compile(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
            // 8–15 digits, optionally with a leading + and single spaces or dashes.
            phone: compile(r"\+?\d(?:[ \-]?\d){7,14}")?,
            loan: compile(r"(?i)(\bloans?\b|\bborrow|\bpawn|\butang\b|贷款|借钱|借款)")?,
            pricing: compile(
                r"(?i)(\bprice\b|how much|magkano|\bcost\b|\binterest\b|价格|多少钱|利息)",
            )?,
            product: compile(r"(?i)(iphone|apple id|\bipad\b|手机|苹果)")?,
        })
    }

    /// Email, phone and a coarse inquiry type.
    pub fn extract(&self, text: &str) -> ExtractedInfo {
        let email = self.email.find(text).map(|m| m.as_str().to_string());
        let phone = self.phone.find(text).map(|m| {
            m.as_str()
                .chars()
                .filter(|c| *c == '+' || c.is_ascii_digit())
                .collect()
        });

        let inquiry_type = if self.loan.is_match(text) {
            InquiryType::Loan
        } else if self.pricing.is_match(text) {
            InquiryType::Pricing
        } else if self.product.is_match(text) {
            InquiryType::Product
        } else {
            InquiryType::General
        };

        ExtractedInfo {
            email,
            phone,
            inquiry_type,
        }
    }
}

pub struct MessageReceiverStage {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    extractor: Extractor,
}

impl MessageReceiverStage {
    pub const NAME: &'static str = "message_receiver";

    pub fn new(db: Arc<dyn Database>, cache: Arc<CacheService>) -> Result<Self, PipelineError> {
        Ok(Self {
            db,
            cache,
            extractor: Extractor::new()?,
        })
    }
}

#[async_trait]
impl Stage for MessageReceiverStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        let content = ctx.event.content.as_str();
        ctx.summary = Some(summarize(content, MESSAGE_SUMMARY_MAX_LENGTH));
        ctx.extracted = self.extractor.extract(content);

        if ctx.extracted.email.is_some() || ctx.extracted.phone.is_some() {
            self.db
                .update_customer_contact(
                    ctx.customer.id,
                    ctx.extracted.email.as_deref(),
                    ctx.extracted.phone.as_deref(),
                )
                .await?;
            self.cache
                .delete(&cache::customer_key(
                    &ctx.customer.platform,
                    &ctx.customer.platform_user_id,
                ))
                .await;
            if ctx.customer.email.is_none() {
                ctx.customer.email = ctx.extracted.email.clone();
            }
            if ctx.customer.phone.is_none() {
                ctx.customer.phone = ctx.extracted.phone.clone();
            }
        }

        debug!(
            run_id = %ctx.run_id,
            conversation_id = ctx.conversation.id,
            inquiry_type = ctx.extracted.inquiry_type.as_str(),
            "Message received"
        );
        Ok(StageStatus::Success)
    }
}
