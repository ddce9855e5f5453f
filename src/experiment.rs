//! Prompt experiments: sticky per-customer arm selection, usage recording
//! and per-version statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::DatabaseError;
use crate::model::{NewPromptVersion, NewUsageLog, PromptUsageLog, PromptVersion};
use crate::store::Database;

/// Version code of the built-in prompt's usage row.
pub const DEFAULT_VERSION_CODE: &str = "default";

/// System prompt used when no prompt version is active.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are the customer support assistant for an iPhone-backed loan service in the Philippines.
Loans run from 3,000 to 15,000 PHP against iPhone 11 to iPhone 16 devices.
The weekly fee is 12% (interest plus service fee); new customers get 50% off the first week.
When a customer names a model or an amount, ask for whatever is still missing: \
model, storage capacity, Apple ID status, a valid ID, and the desired amount.
Reply in English, or in Filipino if the customer writes in Filipino. \
Keep replies short (under 100 words), friendly and direct.
Never promise approval; a human agent confirms every loan.";

/// Pick the arm for `customer_id` from `versions`, which must already be in
/// their stable order (newest first).
///
/// One version is always chosen alone; otherwise `customer_id mod N`. The
/// result depends only on the arguments.
pub fn select_arm(versions: &[PromptVersion], customer_id: i64) -> Option<&PromptVersion> {
    match versions.len() {
        0 => None,
        1 => versions.first(),
        n => versions.get(customer_id.rem_euclid(n as i64) as usize),
    }
}

/// The prompt to use for one generation.
#[derive(Debug, Clone)]
pub struct PromptSelection {
    /// `None` when falling back to [`DEFAULT_SYSTEM_PROMPT`].
    pub version: Option<PromptVersion>,
    pub system_prompt: String,
}

impl PromptSelection {
    pub fn version_code(&self) -> &str {
        self.version
            .as_ref()
            .map(|v| v.version_code.as_str())
            .unwrap_or(DEFAULT_VERSION_CODE)
    }
}

/// Aggregated outcome of one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionStatistics {
    pub version_code: String,
    pub name: String,
    pub is_active: bool,
    pub total_uses: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percentage, 0–100.
    pub success_rate: f64,
    pub avg_response_time_ms: Option<f64>,
    pub total_tokens: u64,
    pub total_cost: Decimal,
}

pub struct PromptExperiment {
    db: Arc<dyn Database>,
}

impl PromptExperiment {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Choose the prompt for a customer.
    pub async fn select(&self, customer_id: i64) -> Result<PromptSelection, DatabaseError> {
        let active = self.db.list_active_prompt_versions().await?;
        Ok(match select_arm(&active, customer_id) {
            Some(v) => PromptSelection {
                system_prompt: v.content.clone(),
                version: Some(v.clone()),
            },
            None => PromptSelection {
                version: None,
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            },
        })
    }

    /// Append a usage row. Selections without a version are logged against
    /// the inactive [`DEFAULT_VERSION_CODE`] row, created on first use.
    pub async fn record_usage(
        &self,
        selection: &PromptSelection,
        mut log: NewUsageLog,
    ) -> Result<PromptUsageLog, DatabaseError> {
        log.version_id = match &selection.version {
            Some(version) => version.id,
            None => self.default_version().await?.id,
        };
        self.db.record_prompt_usage(&log).await
    }

    /// The stored row for the built-in prompt. Never active, so it is not
    /// an experiment arm.
    async fn default_version(&self) -> Result<PromptVersion, DatabaseError> {
        if let Some(v) = self.db.get_prompt_version_by_code(DEFAULT_VERSION_CODE).await? {
            return Ok(v);
        }
        let new = NewPromptVersion {
            version_code: DEFAULT_VERSION_CODE.into(),
            name: "Built-in default".into(),
            content: DEFAULT_SYSTEM_PROMPT.into(),
            is_active: false,
        };
        match self.db.create_prompt_version(&new).await {
            Ok(v) => Ok(v),
            // Lost a creation race.
            Err(DatabaseError::Constraint(_)) => self
                .db
                .get_prompt_version_by_code(DEFAULT_VERSION_CODE)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "prompt_version".into(),
                    id: DEFAULT_VERSION_CODE.into(),
                }),
            Err(e) => Err(e),
        }
    }

    pub async fn version_statistics(
        &self,
        version_code: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<VersionStatistics, DatabaseError> {
        let version = self
            .db
            .get_prompt_version_by_code(version_code)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "prompt_version".into(),
                id: version_code.to_string(),
            })?;
        let totals = self.db.usage_totals(version.id, since).await?;
        let success_rate = if totals.total_uses == 0 {
            0.0
        } else {
            totals.success_count as f64 * 100.0 / totals.total_uses as f64
        };

        Ok(VersionStatistics {
            version_code: version.version_code,
            name: version.name,
            is_active: version.is_active,
            total_uses: totals.total_uses,
            success_count: totals.success_count,
            failure_count: totals.failure_count,
            success_rate,
            avg_response_time_ms: totals.avg_response_time_ms,
            total_tokens: totals.total_tokens,
            total_cost: totals.total_cost,
        })
    }

    /// Statistics for several versions keyed by version code. Unknown codes
    /// are skipped.
    pub async fn compare_versions(
        &self,
        version_codes: &[&str],
        since: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, VersionStatistics>, DatabaseError> {
        let mut out = BTreeMap::new();
        for code in version_codes {
            match self.version_statistics(code, since).await {
                Ok(stats) => {
                    out.insert(code.to_string(), stats);
                }
                Err(DatabaseError::NotFound { .. }) => {
                    tracing::warn!(version_code = %code, "Unknown prompt version in comparison");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
