//! Event processor: validation → identity resolution → pipeline run.
//!
//! A replayed event (same platform + message id) stops after resolution, so
//! webhook retries never reach a stage.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::identity::IdentityResolver;
use crate::model::NormalizedEvent;
use crate::pipeline::engine::Pipeline;
use crate::pipeline::types::{PipelineContext, PipelineReport, ReplyOutcome, RunStatus};
use crate::platforms::PlatformRegistry;

/// Result of handling one event.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The dedup key was already stored; nothing ran.
    Duplicate { conversation_id: i64 },
    /// The pipeline ran; see the report for how far it got.
    Processed {
        conversation_id: i64,
        report: PipelineReport,
        reply: Option<ReplyOutcome>,
    },
}

impl ProcessOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Processed { report, .. } if report.is_failed())
    }
}

pub struct EventProcessor {
    registry: PlatformRegistry,
    resolver: Arc<IdentityResolver>,
    pipeline: Arc<Pipeline>,
}

impl EventProcessor {
    pub fn new(
        registry: PlatformRegistry,
        resolver: Arc<IdentityResolver>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            registry,
            resolver,
            pipeline,
        }
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    /// Parse a raw platform payload with the platform's adapter.
    pub fn parse(
        &self,
        platform: &str,
        raw: &serde_json::Value,
    ) -> Result<Vec<NormalizedEvent>, Error> {
        let adapter = self.registry.require(platform)?;
        Ok(adapter.parse_event(raw)?)
    }

    /// Handle one event end to end.
    ///
    /// Validation and store errors are returned; stage failures are reported
    /// in the outcome, since the conversation row already exists and the
    /// scheduler can pick it up.
    pub async fn handle(&self, event: NormalizedEvent) -> Result<ProcessOutcome, Error> {
        if let Err(e) = event.validate() {
            warn!(platform = %event.platform, error = %e, "Dropping invalid event");
            return Err(e.into());
        }
        let adapter = self.registry.require(&event.platform)?;

        let resolution = self.resolver.resolve(&event).await?;
        if !resolution.is_new {
            debug!(
                platform = %event.platform,
                message_id = %event.message_id,
                "Skipping duplicate event"
            );
            return Ok(ProcessOutcome::Duplicate {
                conversation_id: resolution.conversation.id,
            });
        }

        let conversation_id = resolution.conversation.id;
        let mut ctx = PipelineContext::new(
            event,
            resolution.customer,
            resolution.conversation,
            adapter,
        );
        let report = self.pipeline.run(&mut ctx).await;

        match &report.status {
            RunStatus::Completed => info!(
                run_id = %report.run_id,
                conversation_id,
                "Event processed"
            ),
            RunStatus::Stopped { stage, reason } => info!(
                run_id = %report.run_id,
                conversation_id,
                stage,
                reason = %reason,
                "Event processing stopped early"
            ),
            RunStatus::Failed { stage, error } => warn!(
                run_id = %report.run_id,
                conversation_id,
                stage,
                error = %error,
                "Event processing failed; left for reconciliation"
            ),
        }

        Ok(ProcessOutcome::Processed {
            conversation_id,
            report,
            reply: ctx.reply,
        })
    }
}
