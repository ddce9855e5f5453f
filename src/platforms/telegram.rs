//! Telegram Bot API adapter.
//!
//! Parses `Update` objects (from a webhook or `getUpdates`), looks up
//! senders with `getChat`, and replies with `sendMessage`. The binary uses
//! [`TelegramAdapter::poll_updates`] for long-poll ingestion.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::{
    DeliveryResult, PlatformAdapter, RoutingHint, UserInfo, http_client, split_message,
    status_error, transport_error,
};
use crate::error::AdapterError;
use crate::model::NormalizedEvent;

const PLATFORM: &str = "telegram";

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

pub struct TelegramAdapter {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramAdapter {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: http_client(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    /// POST a Bot API method and return its `result` field.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(PLATFORM, method, e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(PLATFORM, method, status, &text));
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::InvalidPayload {
                platform: PLATFORM.into(),
                reason: format!("{method}: {e}"),
            })?;

        if data.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(AdapterError::Rejected {
                platform: PLATFORM.into(),
                reason: data
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("ok=false")
                    .to_string(),
            });
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Send one chunk (≤4096 chars), Markdown first with plain-text fallback.
    async fn send_chunk(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<Value, AdapterError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(id) = reply_to {
            body["reply_to_message_id"] = Value::from(id);
            body["allow_sending_without_reply"] = Value::Bool(true);
        }

        match self.call("sendMessage", &body).await {
            Ok(result) => Ok(result),
            Err(AdapterError::Rejected { reason, .. }) => {
                tracing::warn!(
                    reason = %reason,
                    "Telegram sendMessage with Markdown failed; retrying without parse_mode"
                );
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("parse_mode");
                }
                self.call("sendMessage", &body).await
            }
            Err(e) => Err(e),
        }
    }

    /// Long-poll `getUpdates`. Returns the raw updates and the offset to
    /// pass on the next call.
    pub async fn poll_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<(Vec<Value>, i64), AdapterError> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        let result = self.call("getUpdates", &body).await?;
        let updates = result.as_array().cloned().unwrap_or_default();
        let next = updates
            .iter()
            .filter_map(|u| u.get("update_id").and_then(Value::as_i64))
            .max()
            .map(|id| id + 1)
            .unwrap_or(offset);
        Ok((updates, next))
    }

    /// Verify the token with `getMe`.
    pub async fn health_check(&self) -> Result<(), AdapterError> {
        self.call("getMe", &serde_json::json!({})).await.map(|_| ())
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn parse_event(&self, raw: &Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
        parse_update(raw)
    }

    async fn get_user_info(&self, sender_id: &str) -> Result<UserInfo, AdapterError> {
        let chat = self
            .call("getChat", &serde_json::json!({ "chat_id": sender_id }))
            .await?;
        Ok(user_info_from_chat(&chat))
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        hint: Option<&RoutingHint>,
    ) -> DeliveryResult {
        let chat_id = hint
            .and_then(|h| h.target.as_deref())
            .unwrap_or(recipient_id);
        let reply_to = hint
            .and_then(|h| h.reply_to.as_deref())
            .and_then(|id| id.parse::<i64>().ok());

        let mut last_id = None;
        for (i, chunk) in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH).iter().enumerate() {
            // Only the first chunk threads under the original message.
            let reply = if i == 0 { reply_to } else { None };
            match self.send_chunk(chat_id, chunk, reply).await {
                Ok(result) => {
                    last_id = result
                        .get("message_id")
                        .and_then(Value::as_i64)
                        .map(|id| id.to_string());
                }
                Err(e) => return DeliveryResult::failed(e),
            }
        }
        DeliveryResult::delivered(last_id)
    }

    fn routing_hint(&self, raw: &Value) -> Option<RoutingHint> {
        let message = raw.get("message")?;
        let chat_id = message.get("chat")?.get("id")?.as_i64()?;
        Some(RoutingHint {
            target: Some(chat_id.to_string()),
            reply_to: message
                .get("message_id")
                .and_then(Value::as_i64)
                .map(|id| id.to_string()),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Convert one Telegram `Update` into zero or one events.
///
/// Telegram message ids are only unique within a chat, so the dedup id is
/// `{chat_id}:{message_id}`.
fn parse_update(update: &Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
    if !update.is_object() {
        return Err(AdapterError::InvalidPayload {
            platform: PLATFORM.into(),
            reason: "update is not an object".into(),
        });
    }

    let Some(message) = update.get("message") else {
        return Ok(vec![]);
    };
    let Some(text) = message.get("text").and_then(Value::as_str) else {
        return Ok(vec![]);
    };

    let from = message.get("from");
    if from
        .and_then(|f| f.get("is_bot"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return Ok(vec![]);
    }

    let invalid = |field: &str| AdapterError::InvalidPayload {
        platform: PLATFORM.into(),
        reason: format!("message without {field}"),
    };
    let sender_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid("from.id"))?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid("chat.id"))?;
    let message_id = message
        .get("message_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid("message_id"))?;
    let date = message.get("date").and_then(Value::as_i64).unwrap_or(0);

    Ok(vec![NormalizedEvent {
        platform: PLATFORM.into(),
        sender_id: sender_id.to_string(),
        message_id: format!("{chat_id}:{message_id}"),
        content: text.to_string(),
        timestamp_ms: date * 1000,
        raw: update.clone(),
    }])
}

fn user_info_from_chat(chat: &Value) -> UserInfo {
    let first = chat.get("first_name").and_then(Value::as_str);
    let last = chat.get("last_name").and_then(Value::as_str);
    let name = match (first, last) {
        (Some(f), Some(l)) => Some(format!("{f} {l}")),
        (Some(f), None) => Some(f.to_string()),
        (None, Some(l)) => Some(l.to_string()),
        (None, None) => chat.get("title").and_then(Value::as_str).map(String::from),
    };
    UserInfo {
        name,
        username: chat
            .get("username")
            .and_then(Value::as_str)
            .map(String::from),
    }
}
