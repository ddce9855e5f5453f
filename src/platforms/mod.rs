//! Messaging platform adapters.
//!
//! Each platform implements [`PlatformAdapter`]: pure I/O, no business
//! logic. The [`PlatformRegistry`] is a lookup table built once at startup.

mod facebook;
mod telegram;

pub use facebook::FacebookAdapter;
pub use telegram::TelegramAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, ValidationError};
use crate::model::NormalizedEvent;

// ── Adapter I/O types ───────────────────────────────────────────────

/// Best-effort profile data for a sender.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: Option<String>,
    pub username: Option<String>,
}

/// Platform-specific addressing recovered from a stored raw event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingHint {
    /// Where to send instead of the sender id (e.g. a Telegram group chat).
    pub target: Option<String>,
    /// Message to thread the reply under.
    pub reply_to: Option<String>,
}

/// Outcome of a delivery attempt.
#[derive(Debug)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<AdapterError>,
}

impl DeliveryResult {
    pub fn delivered(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
            error: None,
        }
    }

    pub fn failed(error: AdapterError) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error),
        }
    }
}

// ── Adapter trait ───────────────────────────────────────────────────

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Platform name used as the first half of every dedup key.
    fn platform(&self) -> &str;

    /// Extract message events from a raw webhook body. Non-message payloads
    /// (delivery receipts, echoes, reads) yield zero events.
    fn parse_event(&self, raw: &serde_json::Value) -> Result<Vec<NormalizedEvent>, AdapterError>;

    /// Look up the sender's profile.
    async fn get_user_info(&self, sender_id: &str) -> Result<UserInfo, AdapterError>;

    /// Deliver `text` to `recipient_id`.
    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        hint: Option<&RoutingHint>,
    ) -> DeliveryResult;

    /// Addressing details recoverable from a stored raw event, if any.
    fn routing_hint(&self, _raw: &serde_json::Value) -> Option<RoutingHint> {
        None
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Platform name → adapter.
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an adapter, replacing any previous one for the same platform.
    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        let name = adapter.platform().to_string();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            tracing::warn!(platform = %name, "Replaced existing platform adapter");
        }
    }

    pub fn with(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }

    /// Adapter for `platform`, or a validation error for unknown platforms.
    pub fn require(&self, platform: &str) -> Result<Arc<dyn PlatformAdapter>, ValidationError> {
        self.get(platform)
            .ok_or_else(|| ValidationError::UnknownPlatform(platform.to_string()))
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Classify a reqwest transport error.
pub(crate) fn transport_error(platform: &str, operation: &str, e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout {
            platform: platform.to_string(),
            operation: operation.to_string(),
            timeout: HTTP_TIMEOUT,
        }
    } else {
        AdapterError::Transient {
            platform: platform.to_string(),
            reason: format!("{operation}: {e}"),
        }
    }
}

/// Classify a non-success HTTP status: throttling and server errors are
/// retryable, everything else is a rejection.
pub(crate) fn status_error(
    platform: &str,
    operation: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> AdapterError {
    let reason = format!("{operation} returned {status}: {}", crate::util::truncate(body, 200));
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AdapterError::Transient {
            platform: platform.to_string(),
            reason,
        }
    } else {
        AdapterError::Rejected {
            platform: platform.to_string(),
            reason,
        }
    }
}

/// Per-request timeout for platform HTTP clients.
pub(crate) const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// newline then space boundaries.
pub(crate) fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the first char past the limit.
        let limit = remaining
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
