//! Recent conversation turns for a customer, used as generator context.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{self, CacheService};
use crate::error::DatabaseError;
use crate::model::{Conversation, HistoryTurn, TurnRole};
use crate::store::Database;

/// Number of prior conversations fed to the generator.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

pub struct ConversationHistory {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    ttl: Duration,
}

impl ConversationHistory {
    pub fn new(db: Arc<dyn Database>, cache: Arc<CacheService>, ttl: Duration) -> Self {
        Self { db, cache, ttl }
    }

    /// Turns from the customer's last `limit` conversations received before
    /// `before`, oldest first.
    pub async fn recent(
        &self,
        customer_id: i64,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<HistoryTurn>, DatabaseError> {
        let key = cache::history_key(customer_id, limit);
        if let Some(hit) = self.cache.get_json::<Vec<HistoryTurn>>(&key).await {
            return Ok(hit);
        }
        let conversations = self.db.customer_history(customer_id, before, limit).await?;
        let turns = to_turns(&conversations);
        self.cache.set_json(&key, &turns, Some(self.ttl)).await;
        Ok(turns)
    }

    /// Forget cached history after a new reply was stored.
    pub async fn invalidate(&self, customer_id: i64) {
        self.cache
            .delete(&cache::history_key(customer_id, DEFAULT_HISTORY_LIMIT))
            .await;
    }
}

fn to_turns(conversations: &[Conversation]) -> Vec<HistoryTurn> {
    let mut turns = Vec::with_capacity(conversations.len() * 2);
    for c in conversations {
        if c.filtered || c.content.trim().is_empty() {
            continue;
        }
        turns.push(HistoryTurn {
            role: TurnRole::User,
            content: c.content.clone(),
            at: c.received_at,
        });
        if let Some(reply) = &c.ai_reply_content {
            turns.push(HistoryTurn {
                role: TurnRole::Assistant,
                content: reply.clone(),
                at: c.ai_reply_at.unwrap_or(c.received_at),
            });
        }
    }
    turns
}
