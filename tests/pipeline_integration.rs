//! End-to-end tests through the public API: events in, rows and deliveries out.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use chatdesk::cache::CacheService;
use chatdesk::config::{CacheConfig, FilterConfig, QueueConfig, ReconcileConfig};
use chatdesk::error::{AdapterError, LlmError};
use chatdesk::experiment::PromptExperiment;
use chatdesk::identity::IdentityResolver;
use chatdesk::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use chatdesk::model::{NewConversation, NewPromptVersion, NormalizedEvent, Priority};
use chatdesk::monitoring::ReplyFailureTracker;
use chatdesk::pipeline::{
    EventProcessor, FilterEngine, ProcessOutcome, ReplyDecider, ReplyOutcome, ReplySettings,
    RunStatus, standard_pipeline,
};
use chatdesk::platforms::{
    DeliveryResult, PlatformAdapter, PlatformRegistry, RoutingHint, UserInfo,
};
use chatdesk::store::{Database, LibSqlBackend};
use chatdesk::worker::{EventQueue, ReconciliationScheduler};

// ── Fakes ───────────────────────────────────────────────────────────

struct FakeMessenger {
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeMessenger {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformAdapter for FakeMessenger {
    fn platform(&self) -> &str {
        "facebook"
    }

    fn parse_event(&self, _raw: &serde_json::Value) -> Result<Vec<NormalizedEvent>, AdapterError> {
        Ok(Vec::new())
    }

    async fn get_user_info(&self, _sender_id: &str) -> Result<UserInfo, AdapterError> {
        Ok(UserInfo {
            name: Some("Maria Santos".into()),
            username: None,
        })
    }

    async fn send_message(
        &self,
        recipient_id: &str,
        text: &str,
        _hint: Option<&RoutingHint>,
    ) -> DeliveryResult {
        self.sent
            .lock()
            .unwrap()
            .push((recipient_id.to_string(), text.to_string()));
        DeliveryResult::delivered(Some("mid.out".into()))
    }
}

struct CannedLlm {
    calls: AtomicUsize,
}

impl CannedLlm {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for CannedLlm {
    fn model_name(&self) -> &str {
        "canned"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            content: "Hi! iPhone 12 Pro starts at 15,000. Want a quote?".into(),
            input_tokens: 120,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

struct App {
    db: Arc<dyn Database>,
    cache: Arc<CacheService>,
    adapter: Arc<FakeMessenger>,
    llm: Arc<CannedLlm>,
    decider: Arc<ReplyDecider>,
    registry: PlatformRegistry,
    processor: Arc<EventProcessor>,
}

async fn app() -> App {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.create_prompt_version(&NewPromptVersion {
        version_code: "live".into(),
        name: "production".into(),
        content: "You answer iPhone loan questions.".into(),
        is_active: true,
    })
    .await
    .unwrap();
    let cache = Arc::new(CacheService::new(None));
    let adapter = Arc::new(FakeMessenger::new());
    let llm = Arc::new(CannedLlm::new());
    let decider = Arc::new(ReplyDecider::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        llm.clone(),
        Arc::new(FilterEngine::new(&FilterConfig::default()).unwrap()),
        Arc::new(ReplyFailureTracker::default()),
        ReplySettings::default(),
    ));
    let pipeline = standard_pipeline(
        Arc::clone(&db),
        Arc::clone(&cache),
        Arc::clone(&decider),
        Duration::from_secs(1),
    )
    .unwrap();
    let resolver = Arc::new(IdentityResolver::new(
        Arc::clone(&db),
        Arc::clone(&cache),
        &CacheConfig::default(),
    ));
    let registry = PlatformRegistry::new().with(adapter.clone());
    let processor = Arc::new(EventProcessor::new(
        registry.clone(),
        resolver,
        Arc::new(pipeline),
    ));
    App {
        db,
        cache,
        adapter,
        llm,
        decider,
        registry,
        processor,
    }
}

fn facebook_event(sender: &str, message_id: &str, content: &str) -> NormalizedEvent {
    NormalizedEvent {
        platform: "facebook".into(),
        sender_id: sender.into(),
        message_id: message_id.into(),
        content: content.into(),
        timestamp_ms: Utc::now().timestamp_millis(),
        raw: serde_json::json!({"mid": message_id}),
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn product_question_is_answered() {
    let app = app().await;
    let outcome = app
        .processor
        .handle(facebook_event("u1", "m1", "iPhone 12 Pro, how much?"))
        .await
        .unwrap();

    let ProcessOutcome::Processed {
        conversation_id,
        report,
        reply,
    } = outcome
    else {
        panic!("first delivery must run the pipeline");
    };
    assert_eq!(report.status, RunStatus::Completed);
    assert!(matches!(reply, Some(ReplyOutcome::Replied { .. })));

    let conversation = app.db.get_conversation(conversation_id).await.unwrap().unwrap();
    assert!(conversation.ai_replied);
    assert!(!conversation.filtered);
    assert_eq!(conversation.priority, Priority::Medium);
    assert!(conversation.ai_reply_content.is_some());

    let customer = app.db.get_customer(conversation.customer_id).await.unwrap().unwrap();
    assert_eq!(customer.platform_user_id, "u1");
    assert_eq!(customer.name.as_deref(), Some("Maria Santos"));

    assert_eq!(app.adapter.sent().len(), 1);
    assert_eq!(app.adapter.sent()[0].0, "u1");

    let logs = app.db.usage_logs_for_conversation(conversation_id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].success);
}

#[tokio::test]
async fn webhook_retry_is_a_no_op() {
    let app = app().await;
    let event = facebook_event("u1", "m1", "iPhone 12 Pro, how much?");
    let first = app.processor.handle(event.clone()).await.unwrap();
    let ProcessOutcome::Processed {
        conversation_id, ..
    } = first
    else {
        panic!("first delivery must run the pipeline");
    };
    let logs_before = app
        .db
        .usage_logs_for_conversation(conversation_id)
        .await
        .unwrap()
        .len();

    let second = app.processor.handle(event).await.unwrap();
    assert!(matches!(
        second,
        ProcessOutcome::Duplicate { conversation_id: id } if id == conversation_id
    ));
    assert_eq!(app.llm.calls(), 1);
    assert_eq!(app.adapter.sent().len(), 1);
    assert_eq!(
        app.db
            .usage_logs_for_conversation(conversation_id)
            .await
            .unwrap()
            .len(),
        logs_before
    );
}

#[tokio::test]
async fn spam_is_filtered_before_generation() {
    let app = app().await;
    let cases = [
        ("m2", "aaaaaaaaaa", "single repeated character"),
        ("m3", "?", "shorter than 2 characters"),
        ("m4", "WTS iPhone 13 Pro Max, for sale 20k", "selling intent"),
    ];
    for (message_id, content, reason) in cases {
        let outcome = app
            .processor
            .handle(facebook_event("u2", message_id, content))
            .await
            .unwrap();
        let ProcessOutcome::Processed {
            conversation_id,
            report,
            reply,
        } = outcome
        else {
            panic!("first delivery must run the pipeline");
        };
        assert!(matches!(report.status, RunStatus::Stopped { .. }));
        assert!(reply.is_none());

        let conversation = app.db.get_conversation(conversation_id).await.unwrap().unwrap();
        assert!(conversation.filtered);
        assert_eq!(conversation.filter_reason.as_deref(), Some(reason));
        assert!(!conversation.ai_replied);
        assert!(
            app.db
                .usage_logs_for_conversation(conversation_id)
                .await
                .unwrap()
                .is_empty()
        );
    }
    assert_eq!(app.llm.calls(), 0);
    assert!(app.adapter.sent().is_empty());
}

#[tokio::test]
async fn prompt_arm_is_sticky_per_customer() {
    let app = app().await;
    let seeded = app.db.get_prompt_version_by_code("live").await.unwrap().unwrap();
    app.db.set_prompt_version_active(seeded.id, false).await.unwrap();
    for (code, name) in [("v1", "baseline"), ("v2", "friendly")] {
        app.db
            .create_prompt_version(&NewPromptVersion {
                version_code: code.into(),
                name: name.into(),
                content: format!("You are the {name} assistant."),
                is_active: true,
            })
            .await
            .unwrap();
    }
    let active = app.db.list_active_prompt_versions().await.unwrap();
    assert_eq!(active.len(), 2);

    let experiment = PromptExperiment::new(Arc::clone(&app.db));
    for _ in 0..5 {
        let selection = experiment.select(7).await.unwrap();
        assert_eq!(selection.version_code(), active[1].version_code);
    }
}

// ── Concurrency properties ──────────────────────────────────────────

#[tokio::test]
async fn concurrent_messages_share_one_customer() {
    let app = app().await;
    let resolver = Arc::new(IdentityResolver::new(
        Arc::clone(&app.db),
        Arc::clone(&app.cache),
        &CacheConfig::default(),
    ));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move {
                resolver
                    .resolve(&facebook_event("u9", &format!("m{i}"), "hello"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut customer_ids = Vec::new();
    for task in futures::future::join_all(tasks).await {
        let resolution = task.unwrap();
        assert!(resolution.is_new);
        customer_ids.push(resolution.customer.id);
    }
    customer_ids.dedup();
    assert_eq!(customer_ids.len(), 1);
}

#[tokio::test]
async fn concurrent_replays_create_one_conversation() {
    let app = app().await;
    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let processor = Arc::clone(&app.processor);
            tokio::spawn(async move {
                processor
                    .handle(facebook_event("u1", "m1", "iPhone 12 Pro, how much?"))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let processed = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Processed { .. }))
        .count();
    assert_eq!(processed, 1);
    assert_eq!(app.llm.calls(), 1);
    assert_eq!(app.adapter.sent().len(), 1);
}

#[tokio::test]
async fn reply_flag_never_flips_back() {
    let app = app().await;
    let outcome = app
        .processor
        .handle(facebook_event("u1", "m1", "iPhone 12 Pro, how much?"))
        .await
        .unwrap();
    let ProcessOutcome::Processed {
        conversation_id, ..
    } = outcome
    else {
        panic!("first delivery must run the pipeline");
    };

    assert!(
        !app.db
            .mark_replied_if_unreplied(conversation_id, "second answer", Utc::now())
            .await
            .unwrap()
    );
    let conversation = app.db.get_conversation(conversation_id).await.unwrap().unwrap();
    assert!(conversation.ai_replied);
    assert_ne!(conversation.ai_reply_content.as_deref(), Some("second answer"));

    let customer = app.db.get_customer(conversation.customer_id).await.unwrap().unwrap();
    let again = app
        .decider
        .decide(&conversation, &customer, app.adapter.as_ref())
        .await
        .unwrap();
    assert_eq!(again, ReplyOutcome::AlreadyReplied);
    assert_eq!(app.adapter.sent().len(), 1);
}

// ── Background workers ──────────────────────────────────────────────

#[tokio::test]
async fn scheduler_answers_conversation_that_bypassed_the_pipeline() {
    let app = app().await;
    let customer = app.db.get_or_create_customer("facebook", "u5").await.unwrap();
    let (conversation, _) = app
        .db
        .insert_conversation_if_absent(&NewConversation {
            customer_id: customer.id,
            platform: "facebook".into(),
            platform_message_id: "stuck-1".into(),
            content: "Can I loan with my iphone 13?".into(),
            raw_data: None,
            received_at: Utc::now() - chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

    let scheduler = ReconciliationScheduler::new(
        Arc::clone(&app.db),
        app.registry.clone(),
        Arc::clone(&app.decider),
        ReconcileConfig {
            interval: Duration::from_millis(40),
            ..ReconcileConfig::default()
        },
    );
    scheduler.start().await;

    let mut answered = false;
    for _ in 0..100 {
        let stored = app.db.get_conversation(conversation.id).await.unwrap().unwrap();
        if stored.ai_replied {
            answered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(answered);

    // Several more intervals must not answer it again.
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.stop().await;
    assert_eq!(app.llm.calls(), 1);
    assert_eq!(app.adapter.sent().len(), 1);
}

#[tokio::test]
async fn scheduler_never_answers_spam_that_bypassed_the_pipeline() {
    let app = app().await;
    let customer = app.db.get_or_create_customer("facebook", "u6").await.unwrap();
    let (conversation, _) = app
        .db
        .insert_conversation_if_absent(&NewConversation {
            customer_id: customer.id,
            platform: "facebook".into(),
            platform_message_id: "stuck-spam".into(),
            content: "selling my iphone 12, for sale".into(),
            raw_data: None,
            received_at: Utc::now() - chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

    let scheduler = ReconciliationScheduler::new(
        Arc::clone(&app.db),
        app.registry.clone(),
        Arc::clone(&app.decider),
        ReconcileConfig::default(),
    );
    let report = scheduler.scan_once().await.unwrap();
    assert_eq!(report.scanned(), 1);
    assert_eq!(report.replied(), 0);

    let stored = app.db.get_conversation(conversation.id).await.unwrap().unwrap();
    assert!(!stored.ai_replied);
    assert!(stored.filtered);
    assert_eq!(app.llm.calls(), 0);
    assert!(app.adapter.sent().is_empty());
    assert!(
        app.db
            .usage_logs_for_conversation(conversation.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn queued_events_are_processed_by_workers() {
    let app = app().await;
    let queue = EventQueue::start(
        app.processor.clone(),
        &QueueConfig {
            capacity: 16,
            workers: 2,
        },
    );
    queue
        .try_submit(facebook_event("u1", "m1", "iPhone 12 Pro, how much?"))
        .unwrap();
    queue
        .try_submit(facebook_event("u2", "m2", "how much for iphone 14?"))
        .unwrap();
    queue.shutdown().await;

    let stats = queue.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(app.adapter.sent().len(), 2);
    assert!(
        app.db
            .get_conversation_by_message("facebook", "m2")
            .await
            .unwrap()
            .unwrap()
            .ai_replied
    );
}
