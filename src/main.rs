use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chatdesk::cache::{self, CacheService};
use chatdesk::config::AppConfig;
use chatdesk::identity::IdentityResolver;
use chatdesk::llm::create_provider;
use chatdesk::monitoring::ReplyFailureTracker;
use chatdesk::pipeline::{
    EventProcessor, FilterEngine, ReplyDecider, ReplySettings, standard_pipeline,
};
use chatdesk::platforms::{FacebookAdapter, PlatformAdapter, PlatformRegistry, TelegramAdapter};
use chatdesk::store::{Database, LibSqlBackend};
use chatdesk::worker::{EventQueue, ReconciliationScheduler};

/// Long-poll timeout; must stay below the HTTP client timeout.
const TELEGRAM_POLL_SECS: u64 = 25;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    eprintln!("chatdesk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Store and cache ─────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );
    let cache = Arc::new(CacheService::new(Some(config.cache.conversation_ttl)));
    let sweep = cache::spawn_cleanup_task(Arc::clone(&cache), config.cache.sweep_interval);

    // ── Platforms ───────────────────────────────────────────────────────
    let mut registry = PlatformRegistry::new();
    let telegram = config
        .platforms
        .telegram_bot_token
        .clone()
        .map(|token| Arc::new(TelegramAdapter::new(token)));
    if let Some(tg) = &telegram {
        if let Err(e) = tg.health_check().await {
            tracing::warn!(error = %e, "Telegram token check failed");
        }
        registry.register(tg.clone());
    }
    if let Some(token) = config.platforms.facebook_page_token.clone() {
        registry.register(Arc::new(FacebookAdapter::messenger(token)));
    }
    if let Some(token) = config.platforms.instagram_token.clone() {
        registry.register(Arc::new(FacebookAdapter::instagram(token)));
    }
    if registry.is_empty() {
        anyhow::bail!(
            "no platform configured; set TELEGRAM_BOT_TOKEN, FACEBOOK_PAGE_ACCESS_TOKEN or INSTAGRAM_ACCESS_TOKEN"
        );
    }
    eprintln!("   Platforms: {}", registry.platforms().join(", "));

    // ── Reply pipeline ──────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let filter = Arc::new(FilterEngine::new(&config.filter)?);
    let tracker = Arc::new(ReplyFailureTracker::default());
    let decider = Arc::new(ReplyDecider::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        llm,
        filter,
        tracker,
        ReplySettings::from_config(&config),
    ));
    let pipeline = standard_pipeline(
        Arc::clone(&db),
        Arc::clone(&cache),
        Arc::clone(&decider),
        config.timeouts.user_info,
    )?;
    let resolver = Arc::new(IdentityResolver::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        &config.cache,
    ));
    let processor = Arc::new(EventProcessor::new(
        registry.clone(),
        resolver,
        Arc::new(pipeline),
    ));
    let queue = Arc::new(EventQueue::start(processor, &config.queue));

    // ── Reconciliation ──────────────────────────────────────────────────
    let scheduler = ReconciliationScheduler::new(
        Arc::clone(&db),
        registry,
        decider,
        config.reconcile.clone(),
    );
    scheduler.start().await;

    // ── Ingestion ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let poller = telegram.map(|tg| {
        tokio::spawn(poll_telegram(tg, Arc::clone(&queue), shutdown.clone()))
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    shutdown.cancel();
    if let Some(poller) = poller
        && let Err(e) = poller.await
    {
        tracing::error!(error = %e, "Telegram poller exited abnormally");
    }
    scheduler.stop().await;
    queue.shutdown().await;
    sweep.abort();
    Ok(())
}

/// stderr output plus, when a log directory is configured, a daily file.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chatdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}

/// Feed Telegram long-poll updates into the event queue until cancelled.
///
/// The offset only moves past a batch once every event in it is queued, so
/// updates cut off by shutdown are redelivered on the next start.
async fn poll_telegram(
    telegram: Arc<TelegramAdapter>,
    queue: Arc<EventQueue>,
    shutdown: CancellationToken,
) {
    let mut offset = 0;
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = telegram.poll_updates(offset, TELEGRAM_POLL_SECS) => polled,
        };

        let (updates, next) = match polled {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "Telegram polling failed; retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        for update in &updates {
            let events = match telegram.parse_event(update) {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed Telegram update");
                    continue;
                }
            };
            for event in events {
                // Waits while the queue is full rather than dropping events
                // Telegram will not send again.
                let queued = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    queued = queue.submit(event) => queued,
                };
                if let Err(e) = queued {
                    tracing::warn!(error = %e, "Event queue closed; stopping Telegram poller");
                    return;
                }
            }
        }
        offset = next;
    }
}
