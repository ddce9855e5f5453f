//! Per-event processing pipeline.
//!
//! Every new inbound message flows through:
//! 1. `message_receiver`: bounded summary, email/phone/inquiry extraction
//! 2. `user_info`: best-effort name backfill from the platform
//! 3. `filter`: spam heuristic and priority; filtered messages stop here
//! 4. `reply`: A/B prompt selection, generation, persistence, delivery
//!
//! Replayed events are dropped by [`EventProcessor`] before any stage runs.

mod engine;
mod filter;
mod processor;
mod receive;
mod reply;
pub mod types;
mod user_info;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{Pipeline, PipelineBuilder};
pub use filter::{FilterEngine, FilterStage, PriorityRule, SpamRule};
pub use processor::{EventProcessor, ProcessOutcome};
pub use receive::{Extractor, MessageReceiverStage};
pub use reply::{ReplyDecider, ReplySettings, ReplyStage};
pub use types::*;
pub use user_info::UserInfoStage;

use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheService;
use crate::error::PipelineError;
use crate::store::Database;

/// The four canonical stages, ordered. The filter stage shares the
/// decider's rules.
pub fn standard_pipeline(
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    decider: Arc<ReplyDecider>,
    user_info_timeout: Duration,
) -> Result<Pipeline, PipelineError> {
    Pipeline::builder()
        .stage(Arc::new(MessageReceiverStage::new(
            Arc::clone(&db),
            Arc::clone(&cache),
        )?))
        .stage(Arc::new(UserInfoStage::new(
            Arc::clone(&db),
            cache,
            user_info_timeout,
        )))
        .stage(Arc::new(FilterStage::new(
            Arc::clone(&db),
            Arc::clone(decider.filter()),
        )))
        .stage(Arc::new(ReplyStage::new(decider)))
        .build()
}
