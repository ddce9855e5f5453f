//! Identity resolution: platform event → (Customer, Conversation).
//!
//! The dedup key is (platform, platform_message_id). A replayed webhook
//! resolves to the existing conversation with `is_new = false` and costs at
//! most a cache hit or one indexed read.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{self, CacheService};
use crate::config::CacheConfig;
use crate::error::DatabaseError;
use crate::model::{Conversation, Customer, NewConversation, NormalizedEvent};
use crate::store::Database;

/// Result of resolving one event.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub customer: Customer,
    pub conversation: Conversation,
    /// False when the event's dedup key was already stored.
    pub is_new: bool,
}

pub struct IdentityResolver {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    customer_ttl: Duration,
    conversation_ttl: Duration,
}

impl IdentityResolver {
    pub fn new(db: Arc<dyn Database>, cache: Arc<CacheService>, config: &CacheConfig) -> Self {
        Self {
            db,
            cache,
            customer_ttl: config.customer_ttl,
            conversation_ttl: config.conversation_ttl,
        }
    }

    pub async fn resolve(&self, event: &NormalizedEvent) -> Result<Resolution, DatabaseError> {
        if let Some(conversation) = self.lookup_conversation(event).await? {
            let customer = self.customer_for(event, conversation.customer_id).await?;
            debug!(
                platform = %event.platform,
                message_id = %event.message_id,
                conversation_id = conversation.id,
                "Duplicate event"
            );
            return Ok(Resolution {
                customer,
                conversation,
                is_new: false,
            });
        }

        let customer = self.get_or_create_customer(event).await?;
        let (conversation, is_new) = self
            .db
            .insert_conversation_if_absent(&NewConversation::from_event(customer.id, event))
            .await?;
        self.cache
            .set_json(
                &cache::conversation_key(&event.platform, &event.message_id),
                &conversation,
                Some(self.conversation_ttl),
            )
            .await;

        Ok(Resolution {
            customer,
            conversation,
            is_new,
        })
    }

    /// Conversation for the event's dedup key, cache first.
    async fn lookup_conversation(
        &self,
        event: &NormalizedEvent,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let key = cache::conversation_key(&event.platform, &event.message_id);
        if let Some(hit) = self.cache.get_json::<Conversation>(&key).await {
            return Ok(Some(hit));
        }
        let found = self
            .db
            .get_conversation_by_message(&event.platform, &event.message_id)
            .await?;
        if let Some(conversation) = &found {
            self.cache
                .set_json(&key, conversation, Some(self.conversation_ttl))
                .await;
        }
        Ok(found)
    }

    async fn customer_for(
        &self,
        event: &NormalizedEvent,
        customer_id: i64,
    ) -> Result<Customer, DatabaseError> {
        let key = cache::customer_key(&event.platform, &event.sender_id);
        if let Some(hit) = self.cache.get_json::<Customer>(&key).await
            && hit.id == customer_id
        {
            return Ok(hit);
        }
        let customer = self
            .db
            .get_customer(customer_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "customer".into(),
                id: customer_id.to_string(),
            })?;
        self.cache
            .set_json(&key, &customer, Some(self.customer_ttl))
            .await;
        Ok(customer)
    }

    async fn get_or_create_customer(
        &self,
        event: &NormalizedEvent,
    ) -> Result<Customer, DatabaseError> {
        let key = cache::customer_key(&event.platform, &event.sender_id);
        if let Some(hit) = self.cache.get_json::<Customer>(&key).await {
            return Ok(hit);
        }
        let customer = self
            .db
            .get_or_create_customer(&event.platform, &event.sender_id)
            .await?;
        self.cache
            .set_json(&key, &customer, Some(self.customer_ttl))
            .await;
        Ok(customer)
    }

    /// Drop cached state for a customer after its row changed.
    pub async fn invalidate_customer(&self, platform: &str, platform_user_id: &str) {
        self.cache
            .delete(&cache::customer_key(platform, platform_user_id))
            .await;
    }

    /// Drop the cached conversation for a dedup key.
    pub async fn invalidate_conversation(&self, platform: &str, platform_message_id: &str) {
        self.cache
            .delete(&cache::conversation_key(platform, platform_message_id))
            .await;
    }
}
