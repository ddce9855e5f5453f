//! Mock adapter/generator and context builders shared by pipeline tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;

use crate::cache::CacheService;
use crate::error::{AdapterError, LlmError};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::model::{Conversation, Customer, NewConversation, NormalizedEvent, Priority};
use crate::pipeline::types::PipelineContext;
use crate::platforms::{DeliveryResult, PlatformAdapter, UserInfo};
use crate::store::{Database, LibSqlBackend};

pub struct MockAdapter {
    platform: &'static str,
    name: Option<String>,
    fail_user_info: bool,
    fail_send: bool,
    sent: Mutex<Vec<(String, String)>>,
    user_info_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(platform: &'static str) -> Self {
        Self {
            platform,
            name: None,
            fail_user_info: false,
            fail_send: false,
            sent: Mutex::new(Vec::new()),
            user_info_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn failing_user_info(mut self) -> Self {
        self.fail_user_info = true;
        self
    }

    pub fn failing_send(mut self) -> Self {
        self.fail_send = true;
        self
    }

    /// (recipient, text) pairs delivered so far.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn user_info_calls(&self) -> usize {
        self.user_info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> &str {
        self.platform
    }

    fn parse_event(&self, raw: &serde_json::Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
        Ok(serde_json::from_value(raw.clone()).unwrap_or_default())
    }

    async fn get_user_info(&self, _sender_id: &str) -> Result<UserInfo, AdapterError> {
        self.user_info_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_user_info {
            return Err(AdapterError::Transient {
                platform: self.platform.into(),
                reason: "connection reset".into(),
            });
        }
        Ok(UserInfo {
            name: self.name.clone(),
            username: None,
        })
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        _hint: Option<&crate::platforms::RoutingHint>,
    ) -> DeliveryResult {
        if self.fail_send {
            return DeliveryResult::failed(AdapterError::Rejected {
                platform: self.platform.into(),
                reason: "recipient unavailable".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), text.to_string()));
        DeliveryResult::delivered(Some("out-1".into()))
    }
}

pub struct MockLlm {
    reply: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn model_name(&self) -> &str {
        "mock"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::new(1, 6), Decimal::new(2, 6))
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.reply {
            Some(text) => Ok(CompletionResponse {
                content: text.clone(),
                input_tokens: 40,
                output_tokens: 10,
                finish_reason: FinishReason::Stop,
                response_id: None,
            }),
            None => Err(LlmError::RequestFailed {
                provider: "mock".into(),
                reason: "upstream 503".into(),
            }),
        }
    }
}

pub fn test_context(content: &str) -> PipelineContext {
    test_context_with(content, Arc::new(MockAdapter::new("facebook")))
}

/// Context with placeholder records; call [`test_db_with_context`] to back
/// them with stored rows.
pub fn test_context_with(content: &str, adapter: Arc<dyn PlatformAdapter>) -> PipelineContext {
    let now = Utc::now();
    let event = NormalizedEvent {
        platform: adapter.platform().to_string(),
        sender_id: "u1".into(),
        message_id: "m1".into(),
        content: content.to_string(),
        timestamp_ms: now.timestamp_millis(),
        raw: json!({"mid": "m1"}),
    };
    let customer = Customer {
        id: 0,
        platform: event.platform.clone(),
        platform_user_id: event.sender_id.clone(),
        name: None,
        email: None,
        phone: None,
        created_at: now,
        updated_at: now,
    };
    let conversation = Conversation {
        id: 0,
        customer_id: 0,
        platform: event.platform.clone(),
        platform_message_id: event.message_id.clone(),
        content: content.to_string(),
        raw_data: Some(event.raw.clone()),
        received_at: now,
        ai_replied: false,
        ai_reply_content: None,
        ai_reply_at: None,
        priority: Priority::Low,
        filtered: false,
        filter_reason: None,
        reply_attempts: 0,
        review_requested: false,
        created_at: now,
    };
    PipelineContext::new(event, customer, conversation, adapter)
}

/// Fresh in-memory store holding the context's customer and conversation.
pub async fn test_db_with_context(
    ctx: &mut PipelineContext,
) -> (Arc<dyn Database>, Arc<CacheService>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let customer = db
        .get_or_create_customer(&ctx.event.platform, &ctx.event.sender_id)
        .await
        .unwrap();
    let (conversation, _) = db
        .insert_conversation_if_absent(&NewConversation::from_event(customer.id, &ctx.event))
        .await
        .unwrap();
    ctx.customer = customer;
    ctx.conversation = conversation;
    (db, Arc::new(CacheService::new(None)))
}
