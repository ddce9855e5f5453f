//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 strings so they compare correctly as text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::model::{
    Classification, Conversation, Customer, NewConversation, NewPromptVersion, NewUsageLog,
    Priority, PromptUsageLog, PromptVersion, UsageTotals,
};
use crate::store::migrations;
use crate::store::traits::{Database, UnrepliedQuery};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_conversations(
        &self,
        op: &str,
        sql: &str,
        args: Vec<libsql::Value>,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params::Params::Positional(args))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_conversation(&row) {
                Ok(c) => out.push(c),
                Err(e) => warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for writes.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

/// `%kw%` LIKE pattern with `\` escaping, lowercased to pair with `LOWER(content)`.
fn like_pattern(keyword: &str) -> String {
    let mut p = String::with_capacity(keyword.len() + 2);
    p.push('%');
    for ch in keyword.to_lowercase().chars() {
        if matches!(ch, '%' | '_' | '\\') {
            p.push('\\');
        }
        p.push(ch);
    }
    p.push('%');
    p
}

const CUSTOMER_COLUMNS: &str =
    "id, platform, platform_user_id, name, email, phone, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, customer_id, platform, platform_message_id, content, raw_data, received_at, ai_replied, ai_reply_content, ai_reply_at, priority, filtered, filter_reason, reply_attempts, review_requested, created_at";

const PROMPT_VERSION_COLUMNS: &str =
    "id, version_code, name, content, is_active, total_uses, avg_response_time_ms, created_at";

const USAGE_LOG_COLUMNS: &str = "id, version_id, customer_id, conversation_id, response_time_ms, tokens_used, cost, success, error, used_at";

fn row_to_customer(row: &libsql::Row) -> Result<Customer, libsql::Error> {
    Ok(Customer {
        id: row.get(0)?,
        platform: row.get(1)?,
        platform_user_id: row.get(2)?,
        name: row.get::<String>(3).ok(),
        email: row.get::<String>(4).ok(),
        phone: row.get::<String>(5).ok(),
        created_at: parse_datetime(&row.get::<String>(6)?),
        updated_at: parse_datetime(&row.get::<String>(7)?),
    })
}

/// Column order matches CONVERSATION_COLUMNS.
fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let raw_data = row
        .get::<String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok());
    let priority: Priority = row
        .get::<String>(10)?
        .parse()
        .unwrap_or_default();

    Ok(Conversation {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        platform: row.get(2)?,
        platform_message_id: row.get(3)?,
        content: row.get(4)?,
        raw_data,
        received_at: parse_datetime(&row.get::<String>(6)?),
        ai_replied: row.get::<i64>(7)? != 0,
        ai_reply_content: row.get::<String>(8).ok(),
        ai_reply_at: parse_optional_datetime(row.get::<String>(9).ok()),
        priority,
        filtered: row.get::<i64>(11)? != 0,
        filter_reason: row.get::<String>(12).ok(),
        reply_attempts: row.get::<i64>(13)?.max(0) as u32,
        review_requested: row.get::<i64>(14)? != 0,
        created_at: parse_datetime(&row.get::<String>(15)?),
    })
}

fn row_to_prompt_version(row: &libsql::Row) -> Result<PromptVersion, libsql::Error> {
    Ok(PromptVersion {
        id: row.get(0)?,
        version_code: row.get(1)?,
        name: row.get(2)?,
        content: row.get(3)?,
        is_active: row.get::<i64>(4)? != 0,
        total_uses: row.get(5)?,
        avg_response_time_ms: row.get::<f64>(6).ok(),
        created_at: parse_datetime(&row.get::<String>(7)?),
    })
}

fn row_to_usage_log(row: &libsql::Row) -> Result<PromptUsageLog, libsql::Error> {
    Ok(PromptUsageLog {
        id: row.get(0)?,
        version_id: row.get(1)?,
        customer_id: row.get(2)?,
        conversation_id: row.get::<i64>(3).ok(),
        response_time_ms: row.get::<i64>(4)?.max(0) as u64,
        tokens_used: row.get::<i64>(5).ok().map(|t| t.max(0) as u32),
        cost: row
            .get::<String>(6)
            .ok()
            .and_then(|s| s.parse::<Decimal>().ok()),
        success: row.get::<i64>(7)? != 0,
        error: row.get::<String>(8).ok(),
        used_at: parse_datetime(&row.get::<String>(9)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Customers ───────────────────────────────────────────────────

    async fn get_or_create_customer(
        &self,
        platform: &str,
        platform_user_id: &str,
    ) -> Result<Customer, DatabaseError> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        let inserted = conn
            .execute(
                "INSERT INTO customers (platform, platform_user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (platform, platform_user_id) DO NOTHING",
                params![platform, platform_user_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_or_create_customer: {e}")))?;

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE platform = ?1 AND platform_user_id = ?2"
                ),
                params![platform, platform_user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_or_create_customer: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let customer = row_to_customer(&row).map_err(|e| {
                    DatabaseError::Query(format!("get_or_create_customer row parse: {e}"))
                })?;
                if inserted > 0 {
                    debug!(customer_id = customer.id, platform, "Customer created");
                }
                Ok(customer)
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "customer".into(),
                id: format!("{platform}:{platform_user_id}"),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_or_create_customer: {e}"))),
        }
    }

    async fn get_customer(&self, id: i64) -> Result<Option<Customer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_customer: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_customer(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_customer row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_customer: {e}"))),
        }
    }

    async fn update_customer_name_if_empty(
        &self,
        id: i64,
        name: &str,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE customers SET name = ?2, updated_at = ?3
                 WHERE id = ?1 AND (name IS NULL OR TRIM(name) = '')",
                params![id, name, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_customer_name_if_empty: {e}")))?;
        Ok(changed > 0)
    }

    async fn update_customer_contact(
        &self,
        id: i64,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<(), DatabaseError> {
        if email.is_none() && phone.is_none() {
            return Ok(());
        }
        self.conn()
            .execute(
                "UPDATE customers SET
                    email = COALESCE(NULLIF(TRIM(email), ''), ?2),
                    phone = COALESCE(NULLIF(TRIM(phone), ''), ?3),
                    updated_at = ?4
                 WHERE id = ?1",
                params![id, opt_text(email), opt_text(phone), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_customer_contact: {e}")))?;
        Ok(())
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, DatabaseError> {
        let found = self
            .query_conversations(
                "get_conversation",
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
                vec![libsql::Value::Integer(id)],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn get_conversation_by_message(
        &self,
        platform: &str,
        platform_message_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let found = self
            .query_conversations(
                "get_conversation_by_message",
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE platform = ?1 AND platform_message_id = ?2"
                ),
                vec![
                    libsql::Value::Text(platform.to_string()),
                    libsql::Value::Text(platform_message_id.to_string()),
                ],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn insert_conversation_if_absent(
        &self,
        new: &NewConversation,
    ) -> Result<(Conversation, bool), DatabaseError> {
        let raw = match &new.raw_data {
            Some(v) => Some(
                serde_json::to_string(v)
                    .map_err(|e| DatabaseError::Serialization(format!("raw_data: {e}")))?,
            ),
            None => None,
        };

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO conversations
                    (customer_id, platform, platform_message_id, content, raw_data, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (platform, platform_message_id) DO NOTHING",
                params![
                    new.customer_id,
                    new.platform.as_str(),
                    new.platform_message_id.as_str(),
                    new.content.as_str(),
                    opt_text_owned(raw),
                    fmt_ts(new.received_at),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_conversation_if_absent: {e}")))?;

        let conversation = self
            .get_conversation_by_message(&new.platform, &new.platform_message_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: format!("{}:{}", new.platform, new.platform_message_id),
            })?;

        Ok((conversation, inserted > 0))
    }

    async fn update_classification(
        &self,
        id: i64,
        classification: &Classification,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE conversations SET filtered = ?2, filter_reason = ?3, priority = ?4,
                    review_requested = MAX(review_requested, ?5)
                 WHERE id = ?1",
                params![
                    id,
                    classification.filtered as i64,
                    opt_text(classification.filter_reason.as_deref()),
                    classification.priority.as_str(),
                    classification.review_requested as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_classification: {e}")))?;
        Ok(())
    }

    async fn mark_replied_if_unreplied(
        &self,
        id: i64,
        reply: &str,
        replied_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE conversations SET ai_replied = 1, ai_reply_content = ?2, ai_reply_at = ?3
                 WHERE id = ?1 AND ai_replied = 0",
                params![id, reply, fmt_ts(replied_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_replied_if_unreplied: {e}")))?;
        Ok(changed > 0)
    }

    async fn record_reply_failure(
        &self,
        id: i64,
        max_attempts: u32,
    ) -> Result<u32, DatabaseError> {
        // SET expressions see the pre-update row.
        self.conn()
            .execute(
                "UPDATE conversations SET
                    reply_attempts = reply_attempts + 1,
                    review_requested = CASE WHEN reply_attempts + 1 >= ?2 THEN 1 ELSE review_requested END,
                    priority = CASE WHEN reply_attempts + 1 >= ?2 THEN 'urgent' ELSE priority END
                 WHERE id = ?1 AND ai_replied = 0",
                params![id, max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_reply_failure: {e}")))?;

        let conversation =
            self.get_conversation(id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: id.to_string(),
                })?;
        Ok(conversation.reply_attempts)
    }

    async fn list_unreplied(
        &self,
        query: &UnrepliedQuery,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE ai_replied = 0 AND filtered = 0 AND TRIM(content) != ''
               AND reply_attempts < ?1 AND received_at <= ?2
               AND (?3 IS NULL OR received_at >= ?3)"
        );
        let mut args = vec![
            libsql::Value::Integer(query.max_attempts as i64),
            libsql::Value::Text(fmt_ts(query.received_before)),
            opt_text_owned(query.since.map(fmt_ts)),
            libsql::Value::Integer(query.limit as i64),
        ];

        if !query.keywords.is_empty() {
            let clauses: Vec<String> = query
                .keywords
                .iter()
                .map(|kw| {
                    args.push(libsql::Value::Text(like_pattern(kw)));
                    format!("LOWER(content) LIKE ?{} ESCAPE '\\'", args.len())
                })
                .collect();
            sql.push_str(&format!(" AND ({})", clauses.join(" OR ")));
        }
        sql.push_str(" ORDER BY received_at ASC, id ASC LIMIT ?4");

        self.query_conversations("list_unreplied", &sql, args).await
    }

    async fn customer_history(
        &self,
        customer_id: i64,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let mut recent = self
            .query_conversations(
                "customer_history",
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE customer_id = ?1 AND received_at < ?2
                     ORDER BY received_at DESC, id DESC LIMIT ?3"
                ),
                vec![
                    libsql::Value::Integer(customer_id),
                    libsql::Value::Text(fmt_ts(before)),
                    libsql::Value::Integer(limit as i64),
                ],
            )
            .await?;
        recent.reverse();
        Ok(recent)
    }

    // ── Prompt experiments ──────────────────────────────────────────

    async fn create_prompt_version(
        &self,
        new: &NewPromptVersion,
    ) -> Result<PromptVersion, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO prompt_versions (version_code, name, content, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.version_code.as_str(),
                    new.name.as_str(),
                    new.content.as_str(),
                    new.is_active as i64,
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!(
                        "prompt version {} already exists",
                        new.version_code
                    ))
                } else {
                    DatabaseError::Query(format!("create_prompt_version: {msg}"))
                }
            })?;

        self.get_prompt_version_by_code(&new.version_code)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "prompt_version".into(),
                id: new.version_code.clone(),
            })
    }

    async fn set_prompt_version_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE prompt_versions SET is_active = ?2 WHERE id = ?1",
                params![id, active as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_prompt_version_active: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "prompt_version".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_prompt_version_by_code(
        &self,
        version_code: &str,
    ) -> Result<Option<PromptVersion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROMPT_VERSION_COLUMNS} FROM prompt_versions WHERE version_code = ?1"),
                params![version_code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_prompt_version_by_code: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_prompt_version(&row).map(Some).map_err(|e| {
                DatabaseError::Query(format!("get_prompt_version_by_code row parse: {e}"))
            }),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_prompt_version_by_code: {e}"
            ))),
        }
    }

    async fn list_active_prompt_versions(&self) -> Result<Vec<PromptVersion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROMPT_VERSION_COLUMNS} FROM prompt_versions
                     WHERE is_active = 1 ORDER BY created_at DESC, id DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_prompt_versions: {e}")))?;

        let mut versions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_prompt_version(&row) {
                Ok(v) => versions.push(v),
                Err(e) => warn!("Skipping prompt version row: {e}"),
            }
        }
        Ok(versions)
    }

    async fn record_prompt_usage(
        &self,
        log: &NewUsageLog,
    ) -> Result<PromptUsageLog, DatabaseError> {
        let conn = self.conn();
        let used_at = Utc::now();
        let mut rows = conn
            .query(
                "INSERT INTO prompt_usage_logs
                    (version_id, customer_id, conversation_id, response_time_ms, tokens_used, cost, success, error, used_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 RETURNING id",
                params![
                    log.version_id,
                    log.customer_id,
                    opt_int(log.conversation_id),
                    log.response_time_ms as i64,
                    opt_int(log.tokens_used.map(i64::from)),
                    opt_text_owned(log.cost.map(|c| c.to_string())),
                    log.success as i64,
                    opt_text(log.error.as_deref()),
                    fmt_ts(used_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_prompt_usage: {e}")))?;
        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("record_prompt_usage id: {e}")))?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "record_prompt_usage: insert returned no id".into(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("record_prompt_usage: {e}"))),
        };
        drop(rows);

        // Only successful generations feed the latency average.
        conn.execute(
            "UPDATE prompt_versions SET
                total_uses = total_uses + 1,
                avg_response_time_ms = CASE
                    WHEN ?3 = 0 THEN avg_response_time_ms
                    WHEN avg_response_time_ms IS NULL THEN ?2
                    ELSE avg_response_time_ms * 0.9 + ?2 * 0.1
                END
             WHERE id = ?1",
            params![
                log.version_id,
                log.response_time_ms as f64,
                log.success as i64
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_prompt_usage counters: {e}")))?;

        Ok(PromptUsageLog {
            id,
            version_id: log.version_id,
            customer_id: log.customer_id,
            conversation_id: log.conversation_id,
            response_time_ms: log.response_time_ms,
            tokens_used: log.tokens_used,
            cost: log.cost,
            success: log.success,
            error: log.error.clone(),
            used_at,
        })
    }

    async fn usage_logs_for_conversation(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<PromptUsageLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {USAGE_LOG_COLUMNS} FROM prompt_usage_logs
                     WHERE conversation_id = ?1 ORDER BY id ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage_logs_for_conversation: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_usage_log(&row) {
                Ok(l) => logs.push(l),
                Err(e) => warn!("Skipping usage log row: {e}"),
            }
        }
        Ok(logs)
    }

    async fn usage_totals(
        &self,
        version_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<UsageTotals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT success, response_time_ms, tokens_used, cost FROM prompt_usage_logs
                 WHERE version_id = ?1 AND (?2 IS NULL OR used_at >= ?2)",
                params![version_id, opt_text_owned(since.map(fmt_ts))],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage_totals: {e}")))?;

        let mut totals = UsageTotals::default();
        let mut latency_sum = 0u64;
        while let Ok(Some(row)) = rows.next().await {
            let success = row.get::<i64>(0).unwrap_or(0) != 0;
            totals.total_uses += 1;
            if success {
                totals.success_count += 1;
                latency_sum += row.get::<i64>(1).unwrap_or(0).max(0) as u64;
            } else {
                totals.failure_count += 1;
            }
            totals.total_tokens += row.get::<i64>(2).unwrap_or(0).max(0) as u64;
            if let Some(cost) = row
                .get::<String>(3)
                .ok()
                .and_then(|s| s.parse::<Decimal>().ok())
            {
                totals.total_cost += cost;
            }
        }
        if totals.success_count > 0 {
            totals.avg_response_time_ms = Some(latency_sum as f64 / totals.success_count as f64);
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_conversation(customer_id: i64, message_id: &str, content: &str) -> NewConversation {
        NewConversation {
            customer_id,
            platform: "facebook".into(),
            platform_message_id: message_id.into(),
            content: content.into(),
            raw_data: Some(serde_json::json!({"mid": message_id})),
            received_at: Utc::now() - chrono::Duration::minutes(10),
        }
    }

    fn query(keywords: &[&str]) -> UnrepliedQuery {
        UnrepliedQuery {
            since: None,
            received_before: Utc::now(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            max_attempts: 3,
            limit: 100,
        }
    }

    // ── Customer tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn get_or_create_customer_is_idempotent() {
        let db = test_db().await;
        let a = db.get_or_create_customer("telegram", "42").await.unwrap();
        let b = db.get_or_create_customer("telegram", "42").await.unwrap();
        assert_eq!(a.id, b.id);

        let other = db.get_or_create_customer("facebook", "42").await.unwrap();
        assert_ne!(a.id, other.id);
    }

    #[tokio::test]
    async fn name_backfill_only_when_empty() {
        let db = test_db().await;
        let c = db.get_or_create_customer("telegram", "42").await.unwrap();
        assert!(c.needs_name());

        assert!(db.update_customer_name_if_empty(c.id, "Ana").await.unwrap());
        assert!(!db.update_customer_name_if_empty(c.id, "Other").await.unwrap());

        let c = db.get_customer(c.id).await.unwrap().unwrap();
        assert_eq!(c.name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn contact_fields_are_not_overwritten() {
        let db = test_db().await;
        let c = db.get_or_create_customer("telegram", "42").await.unwrap();
        db.update_customer_contact(c.id, Some("a@x.com"), None)
            .await
            .unwrap();
        db.update_customer_contact(c.id, Some("b@x.com"), Some("09171234567"))
            .await
            .unwrap();

        let c = db.get_customer(c.id).await.unwrap().unwrap();
        assert_eq!(c.email.as_deref(), Some("a@x.com"));
        assert_eq!(c.phone.as_deref(), Some("09171234567"));
    }

    // ── Conversation tests ──────────────────────────────────────────

    #[tokio::test]
    async fn dedup_by_platform_message_id() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();

        let (first, created) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "first"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.raw_data, Some(serde_json::json!({"mid": "m1"})));

        let (second, created) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "second"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "first");
    }

    #[tokio::test]
    async fn reply_flag_flips_once() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();
        let (conv, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "hi"))
            .await
            .unwrap();

        assert!(db.mark_replied_if_unreplied(conv.id, "hello!", Utc::now()).await.unwrap());
        assert!(!db.mark_replied_if_unreplied(conv.id, "again", Utc::now()).await.unwrap());

        let conv = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(conv.ai_replied);
        assert_eq!(conv.ai_reply_content.as_deref(), Some("hello!"));
        assert!(conv.ai_reply_at.is_some());
    }

    #[tokio::test]
    async fn classification_persists() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();
        let (conv, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "aaaa"))
            .await
            .unwrap();

        db.update_classification(
            conv.id,
            &Classification {
                filtered: true,
                filter_reason: Some("repeated character".into()),
                priority: Priority::Low,
                review_requested: false,
            },
        )
        .await
        .unwrap();

        let conv = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(conv.filtered);
        assert_eq!(conv.filter_reason.as_deref(), Some("repeated character"));
    }

    #[tokio::test]
    async fn reply_failures_escalate_at_budget() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();
        let (conv, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "iphone price"))
            .await
            .unwrap();

        assert_eq!(db.record_reply_failure(conv.id, 3).await.unwrap(), 1);
        assert_eq!(db.record_reply_failure(conv.id, 3).await.unwrap(), 2);
        let mid = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(!mid.review_requested);
        assert_eq!(mid.priority, Priority::Low);

        assert_eq!(db.record_reply_failure(conv.id, 3).await.unwrap(), 3);
        let done = db.get_conversation(conv.id).await.unwrap().unwrap();
        assert!(done.review_requested);
        assert_eq!(done.priority, Priority::Urgent);

        // Exhausted conversations drop out of the reconciliation predicate.
        assert!(db.list_unreplied(&query(&["iphone"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_unreplied_applies_predicate() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();

        let (match_a, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m1", "How much is the IPHONE 13?"))
            .await
            .unwrap();
        let (replied, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m2", "iphone loan"))
            .await
            .unwrap();
        db.mark_replied_if_unreplied(replied.id, "ok", Utc::now())
            .await
            .unwrap();
        let (filtered, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m3", "iphone for sale"))
            .await
            .unwrap();
        db.update_classification(
            filtered.id,
            &Classification {
                filtered: true,
                filter_reason: Some("selling intent".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.insert_conversation_if_absent(&new_conversation(c.id, "m4", "good morning"))
            .await
            .unwrap();
        let (chinese, _) = db
            .insert_conversation_if_absent(&new_conversation(c.id, "m5", "我想贷款"))
            .await
            .unwrap();

        let found = db.list_unreplied(&query(&["iphone", "贷款"])).await.unwrap();
        let ids: Vec<i64> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![match_a.id, chinese.id]);

        // No keyword restriction: everything unreplied and unfiltered.
        assert_eq!(db.list_unreplied(&query(&[])).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn list_unreplied_respects_time_bounds() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();

        let mut old = new_conversation(c.id, "old", "iphone");
        old.received_at = Utc::now() - chrono::Duration::days(3);
        db.insert_conversation_if_absent(&old).await.unwrap();

        let mut fresh = new_conversation(c.id, "fresh", "iphone");
        fresh.received_at = Utc::now();
        db.insert_conversation_if_absent(&fresh).await.unwrap();

        let q = UnrepliedQuery {
            since: Some(Utc::now() - chrono::Duration::days(1)),
            received_before: Utc::now() - chrono::Duration::minutes(1),
            ..query(&["iphone"])
        };
        assert!(db.list_unreplied(&q).await.unwrap().is_empty());

        let unbounded = UnrepliedQuery {
            since: None,
            ..q
        };
        let found = db.list_unreplied(&unbounded).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].platform_message_id, "old");
    }

    #[tokio::test]
    async fn like_wildcards_are_escaped() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();
        db.insert_conversation_if_absent(&new_conversation(c.id, "m1", "100 percent"))
            .await
            .unwrap();
        assert!(db.list_unreplied(&query(&["100%"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn customer_history_is_chronological() {
        let db = test_db().await;
        let c = db.get_or_create_customer("facebook", "u1").await.unwrap();
        for i in 0..5 {
            let mut n = new_conversation(c.id, &format!("m{i}"), &format!("msg {i}"));
            n.received_at = Utc::now() - chrono::Duration::minutes(10 - i);
            db.insert_conversation_if_absent(&n).await.unwrap();
        }

        let history = db.customer_history(c.id, Utc::now(), 3).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 2", "msg 3", "msg 4"]);
    }

    // ── Prompt experiment tests ─────────────────────────────────────

    fn version(code: &str) -> NewPromptVersion {
        NewPromptVersion {
            version_code: code.into(),
            name: format!("Prompt {code}"),
            content: format!("You are assistant {code}."),
            is_active: true,
        }
    }

    #[tokio::test]
    async fn active_versions_newest_first() {
        let db = test_db().await;
        let a = db.create_prompt_version(&version("a")).await.unwrap();
        let b = db.create_prompt_version(&version("b")).await.unwrap();
        let c = db.create_prompt_version(&version("c")).await.unwrap();
        db.set_prompt_version_active(b.id, false).await.unwrap();

        let active = db.list_active_prompt_versions().await.unwrap();
        let codes: Vec<&str> = active.iter().map(|v| v.version_code.as_str()).collect();
        assert_eq!(codes, vec!["c", "a"]);
        assert_eq!(active[0].id, c.id);
        assert_eq!(active[1].id, a.id);
    }

    #[tokio::test]
    async fn duplicate_version_code_is_constraint_error() {
        let db = test_db().await;
        db.create_prompt_version(&version("a")).await.unwrap();
        let err = db.create_prompt_version(&version("a")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn usage_updates_counters_and_totals() {
        let db = test_db().await;
        let v = db.create_prompt_version(&version("a")).await.unwrap();

        let log = |ms: u64, success: bool| NewUsageLog {
            version_id: v.id,
            customer_id: 1,
            conversation_id: Some(10),
            response_time_ms: ms,
            tokens_used: Some(100),
            cost: Some(dec!(0.0015)),
            success,
            error: (!success).then(|| "timeout".to_string()),
        };

        db.record_prompt_usage(&log(1000, true)).await.unwrap();
        db.record_prompt_usage(&log(2000, true)).await.unwrap();
        db.record_prompt_usage(&log(30000, false)).await.unwrap();

        let v = db.get_prompt_version_by_code("a").await.unwrap().unwrap();
        assert_eq!(v.total_uses, 3);
        // 0.9 * 1000 + 0.1 * 2000; the failure does not move the average.
        let avg = v.avg_response_time_ms.unwrap();
        assert!((avg - 1100.0).abs() < 1e-6);

        let totals = db.usage_totals(v.id, None).await.unwrap();
        assert_eq!(totals.total_uses, 3);
        assert_eq!(totals.success_count, 2);
        assert_eq!(totals.failure_count, 1);
        assert_eq!(totals.total_tokens, 300);
        assert_eq!(totals.total_cost, dec!(0.0045));
        assert_eq!(totals.avg_response_time_ms, Some(1500.0));

        let logs = db.usage_logs_for_conversation(10).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(!logs[2].success);
        assert_eq!(logs[2].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chatdesk.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.get_or_create_customer("telegram", "7").await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let c = db.get_or_create_customer("telegram", "7").await.unwrap();
        assert_eq!(c.id, 1);
    }
}
