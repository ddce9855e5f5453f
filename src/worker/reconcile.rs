//! Reconciliation scheduler: the safety net for unanswered conversations.
//!
//! On a fixed interval it lists conversations that are still unreplied,
//! unfiltered, older than the settle delay, within the lookback window,
//! under the retry budget and matching a keyword, and runs the reply
//! decision for each. The `ai_replied = false` predicate is the only dedup
//! gate; the conditional reply update makes a lost race a no-op.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::model::{Conversation, Customer};
use crate::pipeline::{ReplyDecider, ReplyOutcome};
use crate::platforms::{PlatformAdapter, PlatformRegistry};
use crate::store::{Database, UnrepliedQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Result of reconciling one conversation.
#[derive(Debug)]
pub struct ItemResult {
    pub conversation_id: i64,
    pub result: Result<ReplyOutcome, PipelineError>,
}

/// Outcome of one reconciliation scan.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub items: Vec<ItemResult>,
}

impl ScanReport {
    pub fn scanned(&self) -> usize {
        self.items.len()
    }

    pub fn replied(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.result, Ok(ReplyOutcome::Replied { .. })))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_err()).count()
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ReconciliationScheduler {
    db: Arc<dyn Database>,
    registry: PlatformRegistry,
    decider: Arc<ReplyDecider>,
    config: ReconcileConfig,
    running: Mutex<Option<Running>>,
}

impl ReconciliationScheduler {
    pub fn new(
        db: Arc<dyn Database>,
        registry: PlatformRegistry,
        decider: Arc<ReplyDecider>,
        config: ReconcileConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            registry,
            decider,
            config,
            running: Mutex::new(None),
        })
    }

    pub async fn state(&self) -> SchedulerState {
        match &*self.running.lock().await {
            Some(r) if !r.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Start the scan loop. The first scan runs immediately, then once per
    /// interval. Does nothing when disabled or already running.
    pub async fn start(self: &Arc<Self>) -> SchedulerState {
        if !self.config.enabled {
            info!("Reconciliation scheduler disabled");
            return SchedulerState::Stopped;
        }
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return SchedulerState::Running;
        }
        if self.config.keywords.is_empty() {
            warn!("Reconciliation keyword set is empty; no conversation will be eligible");
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run_loop(cancel.clone()));
        *running = Some(Running { cancel, handle });
        info!(
            interval_secs = self.config.interval.as_secs(),
            keywords = self.config.keywords.len(),
            "Reconciliation scheduler started"
        );
        SchedulerState::Running
    }

    /// Signal cancellation and wait for an in-flight scan to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Reconciliation loop exited abnormally");
        }
        info!("Reconciliation scheduler stopped");
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            // Spawned so a panic inside one scan cannot end the loop; awaited
            // without racing `cancel`, so stop() waits for it.
            let this = Arc::clone(&self);
            match tokio::spawn(async move { this.scan_once().await }).await {
                Ok(Ok(report)) if report.scanned() > 0 => info!(
                    scanned = report.scanned(),
                    replied = report.replied(),
                    failed = report.failed(),
                    "Reconciliation scan complete"
                ),
                Ok(Ok(_)) => debug!("Reconciliation scan found nothing"),
                Ok(Err(e)) => error!(error = %e, "Reconciliation scan failed"),
                Err(e) => error!(error = %e, "Reconciliation scan panicked"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Run one scan now. Per-item failures are collected in the report; only
    /// a failure to list candidates fails the scan.
    pub async fn scan_once(&self) -> Result<ScanReport, DatabaseError> {
        if self.config.keywords.is_empty() {
            return Ok(ScanReport::default());
        }

        let now = Utc::now();
        let to_chrono = |d: std::time::Duration| {
            chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
        };
        let query = UnrepliedQuery {
            since: self.config.lookback.map(|l| now - to_chrono(l)),
            received_before: now - to_chrono(self.config.min_age),
            keywords: self.config.keywords.clone(),
            max_attempts: self.config.max_attempts,
            limit: self.config.batch_limit,
        };

        let candidates = self.db.list_unreplied(&query).await?;
        let mut report = ScanReport::default();
        for conversation in candidates {
            let conversation_id = conversation.id;
            let result = self.reconcile_one(conversation).await;
            if let Err(e) = &result {
                warn!(conversation_id, error = %e, "Reconciliation of conversation failed");
            }
            report.items.push(ItemResult {
                conversation_id,
                result,
            });
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        conversation: Conversation,
    ) -> Result<ReplyOutcome, PipelineError> {
        let (adapter, customer) = match self.route(&conversation).await {
            Ok(routed) => routed,
            Err(e) => {
                // Counted like a failed generation, so an unroutable row
                // leaves the candidate set once its budget is spent.
                match self
                    .db
                    .record_reply_failure(conversation.id, self.config.max_attempts)
                    .await
                {
                    Ok(attempts) => debug!(
                        conversation_id = conversation.id,
                        attempts, "Counted unroutable conversation against its retry budget"
                    ),
                    Err(db_err) => warn!(
                        conversation_id = conversation.id,
                        error = %db_err,
                        "Failed to record reconciliation failure"
                    ),
                }
                return Err(e);
            }
        };

        debug!(conversation_id = conversation.id, "Reconciling unanswered conversation");
        self.decider
            .decide(&conversation, &customer, adapter.as_ref())
            .await
    }

    /// Adapter and customer needed to answer `conversation`.
    async fn route(
        &self,
        conversation: &Conversation,
    ) -> Result<(Arc<dyn PlatformAdapter>, Customer), PipelineError> {
        let adapter = self
            .registry
            .get(&conversation.platform)
            .ok_or_else(|| PipelineError::Stage {
                stage: "reconcile".into(),
                reason: format!("no adapter for platform {}", conversation.platform),
            })?;
        let customer = self
            .db
            .get_customer(conversation.customer_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "customer".into(),
                id: conversation.customer_id.to_string(),
            })?;
        Ok((adapter, customer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::CacheService;
    use crate::config::FilterConfig;
    use crate::model::{Classification, NewConversation, Priority};
    use crate::monitoring::ReplyFailureTracker;
    use crate::pipeline::{FilterEngine, ReplySettings};
    use crate::pipeline::testing::{MockAdapter, MockLlm};
    use crate::store::LibSqlBackend;

    struct Fixture {
        scheduler: Arc<ReconciliationScheduler>,
        db: Arc<dyn Database>,
        adapter: Arc<MockAdapter>,
        llm: Arc<MockLlm>,
    }

    async fn fixture(llm: MockLlm, config: ReconcileConfig) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let adapter = Arc::new(MockAdapter::new("facebook"));
        let llm = Arc::new(llm);
        let decider = Arc::new(ReplyDecider::new(
            Arc::clone(&db),
            Arc::new(CacheService::new(None)),
            llm.clone(),
            Arc::new(FilterEngine::new(&FilterConfig::default()).unwrap()),
            Arc::new(ReplyFailureTracker::default()),
            ReplySettings {
                max_attempts: config.max_attempts,
                ..ReplySettings::default()
            },
        ));
        let registry = PlatformRegistry::new().with(adapter.clone());
        Fixture {
            scheduler: ReconciliationScheduler::new(Arc::clone(&db), registry, decider, config),
            db,
            adapter,
            llm,
        }
    }

    async fn insert(
        db: &Arc<dyn Database>,
        platform: &str,
        mid: &str,
        content: &str,
        mins_ago: i64,
    ) -> i64 {
        let customer = db.get_or_create_customer(platform, "u1").await.unwrap();
        let (c, _) = db
            .insert_conversation_if_absent(&NewConversation {
                customer_id: customer.id,
                platform: platform.into(),
                platform_message_id: mid.into(),
                content: content.into(),
                raw_data: None,
                received_at: Utc::now() - chrono::Duration::minutes(mins_ago),
            })
            .await
            .unwrap();
        c.id
    }

    #[tokio::test]
    async fn answers_stuck_conversation_once() {
        let f = fixture(MockLlm::replying("We accept iPhone 12!"), ReconcileConfig::default()).await;
        let id = insert(&f.db, "facebook", "m1", "Do you take iPhone 12?", 10).await;

        let first = f.scheduler.scan_once().await.unwrap();
        assert_eq!(first.scanned(), 1);
        assert_eq!(first.replied(), 1);
        assert!(f.db.get_conversation(id).await.unwrap().unwrap().ai_replied);

        let second = f.scheduler.scan_once().await.unwrap();
        assert_eq!(second.scanned(), 0);
        assert_eq!(f.llm.calls(), 1);
        assert_eq!(f.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn skips_ineligible_conversations() {
        let f = fixture(MockLlm::replying("hi"), ReconcileConfig::default()).await;
        // Too young: the pipeline may still be working on it.
        insert(&f.db, "facebook", "young", "iphone price?", 0).await;
        // No keyword.
        insert(&f.db, "facebook", "plain", "good morning po", 10).await;
        // Outside the lookback window.
        insert(&f.db, "facebook", "old", "iphone loan", 60 * 48).await;
        // Filtered.
        let spam = insert(&f.db, "facebook", "spam", "selling iphone", 10).await;
        f.db.update_classification(
            spam,
            &Classification {
                filtered: true,
                filter_reason: Some("selling intent".into()),
                ..Classification::default()
            },
        )
        .await
        .unwrap();

        let report = f.scheduler.scan_once().await.unwrap();
        assert_eq!(report.scanned(), 0);
        assert_eq!(f.llm.calls(), 0);
    }

    #[tokio::test]
    async fn empty_keyword_set_matches_nothing() {
        let config = ReconcileConfig {
            keywords: Vec::new(),
            ..ReconcileConfig::default()
        };
        let f = fixture(MockLlm::replying("hi"), config).await;
        insert(&f.db, "facebook", "m1", "iphone?", 10).await;
        assert_eq!(f.scheduler.scan_once().await.unwrap().scanned(), 0);
    }

    #[tokio::test]
    async fn retry_budget_escalates_to_review() {
        let f = fixture(MockLlm::failing(), ReconcileConfig::default()).await;
        let id = insert(&f.db, "facebook", "m1", "how much for iphone 13?", 10).await;

        for _ in 0..3 {
            let report = f.scheduler.scan_once().await.unwrap();
            assert_eq!(report.failed(), 1);
        }
        let stored = f.db.get_conversation(id).await.unwrap().unwrap();
        assert!(!stored.ai_replied);
        assert_eq!(stored.reply_attempts, 3);
        assert!(stored.review_requested);
        assert_eq!(stored.priority, Priority::Urgent);

        assert_eq!(f.scheduler.scan_once().await.unwrap().scanned(), 0);
        assert_eq!(f.llm.calls(), 3);
    }

    #[tokio::test]
    async fn one_bad_item_does_not_stop_the_scan() {
        let f = fixture(MockLlm::replying("hello"), ReconcileConfig::default()).await;
        insert(&f.db, "viber", "m1", "iphone loan?", 12).await;
        let good = insert(&f.db, "facebook", "m2", "iphone loan?", 11).await;

        let report = f.scheduler.scan_once().await.unwrap();
        assert_eq!(report.scanned(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.replied(), 1);
        assert!(f.db.get_conversation(good).await.unwrap().unwrap().ai_replied);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let config = ReconcileConfig {
            interval: Duration::from_millis(50),
            ..ReconcileConfig::default()
        };
        let f = fixture(MockLlm::replying("hi"), config).await;
        let id = insert(&f.db, "facebook", "m1", "iphone 15 price", 10).await;

        assert_eq!(f.scheduler.state().await, SchedulerState::Stopped);
        assert_eq!(f.scheduler.start().await, SchedulerState::Running);
        assert_eq!(f.scheduler.start().await, SchedulerState::Running);

        let mut answered = false;
        for _ in 0..100 {
            if f.db.get_conversation(id).await.unwrap().unwrap().ai_replied {
                answered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(answered);

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.state().await, SchedulerState::Stopped);
        f.scheduler.stop().await;
        assert_eq!(f.adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_never_starts() {
        let config = ReconcileConfig {
            enabled: false,
            ..ReconcileConfig::default()
        };
        let f = fixture(MockLlm::replying("hi"), config).await;
        assert_eq!(f.scheduler.start().await, SchedulerState::Stopped);
        assert_eq!(f.scheduler.state().await, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn unclassified_spam_is_never_answered() {
        let f = fixture(MockLlm::replying("How much?"), ReconcileConfig::default()).await;
        let id = insert(&f.db, "facebook", "m1", "selling my iphone 12, for sale", 10).await;

        let report = f.scheduler.scan_once().await.unwrap();
        assert_eq!(report.scanned(), 1);
        assert_eq!(report.replied(), 0);
        assert_eq!(report.failed(), 0);
        assert_eq!(f.llm.calls(), 0);
        assert!(f.adapter.sent().is_empty());

        let stored = f.db.get_conversation(id).await.unwrap().unwrap();
        assert!(!stored.ai_replied);
        assert!(stored.filtered);
        assert_eq!(stored.filter_reason.as_deref(), Some("selling intent"));
        assert!(f.db.usage_logs_for_conversation(id).await.unwrap().is_empty());

        // Now classified, so it leaves the candidate set.
        assert_eq!(f.scheduler.scan_once().await.unwrap().scanned(), 0);
    }

    #[tokio::test]
    async fn unroutable_rows_spend_their_budget_and_stop_blocking_the_batch() {
        let config = ReconcileConfig {
            batch_limit: 1,
            ..ReconcileConfig::default()
        };
        let f = fixture(MockLlm::replying("hello"), config).await;
        let stuck = insert(&f.db, "viber", "m1", "iphone loan?", 12).await;
        let good = insert(&f.db, "facebook", "m2", "iphone loan?", 11).await;

        for _ in 0..3 {
            let report = f.scheduler.scan_once().await.unwrap();
            assert_eq!(report.items[0].conversation_id, stuck);
            assert_eq!(report.failed(), 1);
        }
        let escalated = f.db.get_conversation(stuck).await.unwrap().unwrap();
        assert_eq!(escalated.reply_attempts, 3);
        assert!(escalated.review_requested);

        let report = f.scheduler.scan_once().await.unwrap();
        assert_eq!(report.items[0].conversation_id, good);
        assert_eq!(report.replied(), 1);
        assert!(f.db.get_conversation(good).await.unwrap().unwrap().ai_replied);
    }
}
