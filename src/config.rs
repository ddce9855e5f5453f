//! Configuration types.
//!
//! Every sub-config has a `Default` matching production defaults and a
//! `from_env()` that overrides individual fields from `CHATDESK_*` variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Product keywords that make an unanswered message eligible for reconciliation.
pub const DEFAULT_RECONCILE_KEYWORDS: &[&str] = &[
    "iphone", "loan", "price", "how much", "apple", "贷款", "价格", "多少钱", "手机",
];

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("cannot parse {raw:?}"),
                })
        }
        _ => Ok(default),
    }
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() { None } else { Some(items) }
}

/// Top-level process configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub llm: GeneratorConfig,
    pub platforms: PlatformCredentials,
    pub timeouts: TimeoutConfig,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub filter: FilterConfig,
    pub reconcile: ReconcileConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: std::env::var("CHATDESK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/chatdesk.db")),
            log_dir: std::env::var("CHATDESK_LOG_DIR").ok().map(PathBuf::from),
            llm: GeneratorConfig::from_env()?,
            platforms: PlatformCredentials::from_env(),
            timeouts: TimeoutConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            filter: FilterConfig::from_env()?,
            reconcile: ReconcileConfig::from_env()?,
        })
    }
}

/// AI generator settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// `None` leaves the binary without a generator; it refuses to start.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

impl GeneratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            api_key: env_secret("OPENAI_API_KEY"),
            model: std::env::var("CHATDESK_MODEL").unwrap_or(d.model),
            base_url: std::env::var("CHATDESK_LLM_BASE_URL").unwrap_or(d.base_url),
            temperature: env_parse("CHATDESK_LLM_TEMPERATURE", d.temperature)?,
            max_tokens: env_parse("CHATDESK_LLM_MAX_TOKENS", d.max_tokens)?,
        })
    }
}

/// Platform credentials. A platform is enabled when its token is present.
#[derive(Debug, Clone, Default)]
pub struct PlatformCredentials {
    pub telegram_bot_token: Option<SecretString>,
    pub facebook_page_token: Option<SecretString>,
    pub instagram_token: Option<SecretString>,
}

impl PlatformCredentials {
    pub fn from_env() -> Self {
        Self {
            telegram_bot_token: env_secret("TELEGRAM_BOT_TOKEN"),
            facebook_page_token: env_secret("FACEBOOK_PAGE_ACCESS_TOKEN"),
            instagram_token: env_secret("INSTAGRAM_ACCESS_TOKEN"),
        }
    }
}

/// Bounds on outbound calls.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub generation: Duration,
    pub delivery: Duration,
    pub user_info: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation: Duration::from_secs(30),
            delivery: Duration::from_secs(15),
            user_info: Duration::from_secs(10),
        }
    }
}

impl TimeoutConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            generation: Duration::from_secs(env_parse(
                "CHATDESK_GENERATION_TIMEOUT_SECS",
                d.generation.as_secs(),
            )?),
            delivery: Duration::from_secs(env_parse(
                "CHATDESK_DELIVERY_TIMEOUT_SECS",
                d.delivery.as_secs(),
            )?),
            user_info: Duration::from_secs(env_parse(
                "CHATDESK_USER_INFO_TIMEOUT_SECS",
                d.user_info.as_secs(),
            )?),
        })
    }
}

/// Event queue sizing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of events waiting for a worker.
    pub capacity: usize,
    /// Number of concurrent workers.
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            workers: 8,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let capacity = env_parse("CHATDESK_QUEUE_CAPACITY", d.capacity)?;
        let workers = env_parse("CHATDESK_QUEUE_WORKERS", d.workers)?;
        if capacity == 0 || workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATDESK_QUEUE_CAPACITY/CHATDESK_QUEUE_WORKERS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(Self { capacity, workers })
    }
}

/// Cache TTLs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub customer_ttl: Duration,
    pub conversation_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            customer_ttl: Duration::from_secs(600),
            conversation_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            customer_ttl: Duration::from_secs(env_parse(
                "CHATDESK_CUSTOMER_CACHE_TTL_SECS",
                d.customer_ttl.as_secs(),
            )?),
            conversation_ttl: Duration::from_secs(env_parse(
                "CHATDESK_CONVERSATION_CACHE_TTL_SECS",
                d.conversation_ttl.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(env_parse(
                "CHATDESK_CACHE_SWEEP_SECS",
                d.sweep_interval.as_secs(),
            )?),
        })
    }
}

/// Spam filter tuning.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Messages with fewer characters than this (after trimming) are spam.
    pub min_length: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { min_length: 2 }
    }
}

impl FilterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            min_length: env_parse("CHATDESK_FILTER_MIN_LENGTH", Self::default().min_length)?,
        })
    }
}

/// Reconciliation scheduler options.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Global kill switch, checked once at `start()`.
    pub enabled: bool,
    pub interval: Duration,
    pub keywords: Vec<String>,
    /// `None` scans all history.
    pub lookback: Option<Duration>,
    /// Failed attempts after which a conversation is left for human review.
    pub max_attempts: u32,
    /// Conversations younger than this are left to the pipeline.
    pub min_age: Duration,
    pub batch_limit: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300), // 5 minutes
            keywords: DEFAULT_RECONCILE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            lookback: Some(Duration::from_secs(24 * 3600)),
            max_attempts: 3,
            min_age: Duration::from_secs(60),
            batch_limit: 100,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let lookback_hours: u64 = env_parse(
            "CHATDESK_RECONCILE_LOOKBACK_HOURS",
            d.lookback.map(|l| l.as_secs() / 3600).unwrap_or(0),
        )?;
        let interval_secs: u64 =
            env_parse("CHATDESK_RECONCILE_INTERVAL_SECS", d.interval.as_secs())?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHATDESK_RECONCILE_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            enabled: env_parse("CHATDESK_RECONCILE_ENABLED", d.enabled)?,
            interval: Duration::from_secs(interval_secs),
            keywords: env_list("CHATDESK_RECONCILE_KEYWORDS").unwrap_or(d.keywords),
            lookback: (lookback_hours > 0).then(|| Duration::from_secs(lookback_hours * 3600)),
            max_attempts: env_parse("CHATDESK_RECONCILE_MAX_ATTEMPTS", d.max_attempts)?,
            min_age: Duration::from_secs(env_parse(
                "CHATDESK_RECONCILE_MIN_AGE_SECS",
                d.min_age.as_secs(),
            )?),
            batch_limit: env_parse("CHATDESK_RECONCILE_BATCH_LIMIT", d.batch_limit)?,
        })
    }
}
