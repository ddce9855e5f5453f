//! Facebook Messenger and Instagram adapter (Graph API).
//!
//! Both platforms deliver the same page-webhook `messaging` shape and use
//! the Send API, so one adapter serves either, keyed by platform name.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use super::{
    DeliveryResult, PlatformAdapter, RoutingHint, UserInfo, http_client, split_message,
    status_error, transport_error,
};
use crate::error::AdapterError;
use crate::model::NormalizedEvent;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v18.0";

/// Messenger rejects text longer than this.
const MESSENGER_MAX_MESSAGE_LENGTH: usize = 2000;

pub struct FacebookAdapter {
    platform: &'static str,
    access_token: SecretString,
    client: reqwest::Client,
}

impl FacebookAdapter {
    /// Facebook Messenger, using a page access token.
    pub fn messenger(page_token: SecretString) -> Self {
        Self::new("facebook", page_token)
    }

    /// Instagram messaging, using an Instagram-scoped access token.
    pub fn instagram(access_token: SecretString) -> Self {
        Self::new("instagram", access_token)
    }

    fn new(platform: &'static str, access_token: SecretString) -> Self {
        Self {
            platform,
            access_token,
            client: http_client(),
        }
    }

    fn send_url(&self) -> String {
        format!(
            "{GRAPH_API_BASE}/me/messages?access_token={}",
            self.access_token.expose_secret()
        )
    }

    fn profile_url(&self, user_id: &str) -> String {
        let fields = if self.platform == "instagram" {
            "name,username"
        } else {
            "first_name,last_name,name"
        };
        format!(
            "{GRAPH_API_BASE}/{user_id}?fields={fields}&access_token={}",
            self.access_token.expose_secret()
        )
    }

    async fn send_chunk(&self, recipient_id: &str, text: &str) -> Result<Value, AdapterError> {
        let body = serde_json::json!({
            "recipient": {"id": recipient_id},
            "message": {"text": text},
            "messaging_type": "RESPONSE",
        });
        let resp = self
            .client
            .post(self.send_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.platform, "send", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(self.platform, "send", status, &text));
        }
        resp.json().await.map_err(|e| AdapterError::InvalidPayload {
            platform: self.platform.into(),
            reason: format!("send: {e}"),
        })
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> &str {
        self.platform
    }

    fn parse_event(&self, raw: &Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
        parse_page_webhook(self.platform, raw)
    }

    async fn get_user_info(&self, sender_id: &str) -> Result<UserInfo, AdapterError> {
        let resp = self
            .client
            .get(self.profile_url(sender_id))
            .send()
            .await
            .map_err(|e| transport_error(self.platform, "profile", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(self.platform, "profile", status, &text));
        }
        let profile: Value = resp.json().await.map_err(|e| AdapterError::InvalidPayload {
            platform: self.platform.into(),
            reason: format!("profile: {e}"),
        })?;
        Ok(user_info_from_profile(&profile))
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        _hint: Option<&RoutingHint>,
    ) -> DeliveryResult {
        let mut last_id = None;
        for chunk in split_message(text, MESSENGER_MAX_MESSAGE_LENGTH) {
            match self.send_chunk(recipient_id, &chunk).await {
                Ok(resp) => {
                    last_id = resp
                        .get("message_id")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
                Err(e) => return DeliveryResult::failed(e),
            }
        }
        DeliveryResult::delivered(last_id)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Extract text messages from a page webhook body. Echoes of our own
/// messages, delivery and read receipts, and attachment-only messages are
/// skipped.
fn parse_page_webhook(platform: &str, body: &Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
    let entries = body
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::InvalidPayload {
            platform: platform.into(),
            reason: "webhook body without entry array".into(),
        })?;

    let mut events = Vec::new();
    for entry in entries {
        let Some(messaging) = entry.get("messaging").and_then(Value::as_array) else {
            continue;
        };
        for item in messaging {
            let Some(message) = item.get("message") else {
                continue;
            };
            if message.get("is_echo").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let Some(text) = message.get("text").and_then(Value::as_str) else {
                continue;
            };
            let sender = item
                .get("sender")
                .and_then(|s| s.get("id"))
                .and_then(Value::as_str);
            let mid = message.get("mid").and_then(Value::as_str);
            let (Some(sender), Some(mid)) = (sender, mid) else {
                tracing::warn!(platform, "Skipping messaging item without sender or mid");
                continue;
            };

            events.push(NormalizedEvent {
                platform: platform.to_string(),
                sender_id: sender.to_string(),
                message_id: mid.to_string(),
                content: text.to_string(),
                timestamp_ms: item.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
                raw: item.clone(),
            });
        }
    }
    Ok(events)
}

fn user_info_from_profile(profile: &Value) -> UserInfo {
    let name = profile
        .get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| {
            let first = profile.get("first_name").and_then(Value::as_str)?;
            Some(match profile.get("last_name").and_then(Value::as_str) {
                Some(last) => format!("{first} {last}"),
                None => first.to_string(),
            })
        });
    UserInfo {
        name,
        username: profile
            .get("username")
            .and_then(Value::as_str)
            .map(String::from),
    }
}
