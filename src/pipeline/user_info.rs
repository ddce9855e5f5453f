//! User-info enrichment: best-effort display-name backfill from the platform.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{self, CacheService};
use crate::pipeline::receive::MessageReceiverStage;
use crate::pipeline::types::{PipelineContext, Stage, StageResult, StageStatus};
use crate::store::Database;

pub struct UserInfoStage {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    timeout: Duration,
}

impl UserInfoStage {
    pub const NAME: &'static str = "user_info";

    pub fn new(db: Arc<dyn Database>, cache: Arc<CacheService>, timeout: Duration) -> Self {
        Self { db, cache, timeout }
    }
}

#[async_trait]
impl Stage for UserInfoStage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn dependencies(&self) -> &[&'static str] {
        &[MessageReceiverStage::NAME]
    }

    async fn process(&self, ctx: &mut PipelineContext) -> StageResult {
        if !ctx.customer.needs_name() {
            return Ok(StageStatus::Success);
        }

        let lookup = ctx.adapter.get_user_info(&ctx.event.sender_id);
        let info = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                warn!(
                    run_id = %ctx.run_id,
                    platform = %ctx.event.platform,
                    error = %e,
                    "User info lookup failed; continuing without it"
                );
                return Ok(StageStatus::Success);
            }
            Err(_) => {
                warn!(
                    run_id = %ctx.run_id,
                    platform = %ctx.event.platform,
                    timeout_secs = self.timeout.as_secs(),
                    "User info lookup timed out; continuing without it"
                );
                return Ok(StageStatus::Success);
            }
        };

        let name = info
            .name
            .as_deref()
            .or(info.username.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        ctx.user_info = Some(info);

        if let Some(name) = name
            && self.db.update_customer_name_if_empty(ctx.customer.id, &name).await?
        {
            debug!(run_id = %ctx.run_id, customer_id = ctx.customer.id, "Backfilled customer name");
            ctx.customer.name = Some(name);
            self.cache
                .delete(&cache::customer_key(
                    &ctx.customer.platform,
                    &ctx.customer.platform_user_id,
                ))
                .await;
        }
        Ok(StageStatus::Success)
    }
}
