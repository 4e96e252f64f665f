//! End-to-end call flows through the engine with a scripted model

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use restaurant_agent_config::{Settings, SENTIMENT_PROMPT};
use restaurant_agent_core::{
    CallStatus, ConversationLog, Intent, LanguageModel, LineItem, LlmError, Message, OrderDraft,
    OrderRecord, OrderStatus, Speaker,
};
use restaurant_agent_dialogue::engine::{EMPTY_SPEECH_PROMPT, TELEPHONY_FALLBACK_UTTERANCE};
use restaurant_agent_dialogue::{CallEngine, TurnEvent, VoiceStep, FALLBACK_UTTERANCE};
use restaurant_agent_persistence::{
    ConversationFilter, InMemoryOrderRepository, OrderFilter, OrderRepository, Page,
    PersistenceError,
};
use uuid::Uuid;

const PHONE: &str = "+15551234567";

/// Keyword-driven stand-in for the language model
struct ScriptedModel {
    extraction: String,
    generation_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    generations: AtomicUsize,
}

impl ScriptedModel {
    fn new(extraction: &str) -> Self {
        Self {
            extraction: extraction.to_string(),
            generation_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            generations: AtomicUsize::new(0),
        }
    }

    fn with_generation_delay(mut self, delay: Duration) -> Self {
        self.generation_delay = delay;
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn classify_text(&self, prompt: &str, text: &str) -> Result<String, LlmError> {
        if prompt == SENTIMENT_PROMPT {
            return Ok("0.6".to_string());
        }
        let text = text.to_lowercase();
        let label = if text.contains("bye") {
            "end_call"
        } else if text.contains("cancel") {
            "cancel_order"
        } else if text.contains("order") || text.contains("pizza") {
            "new_order"
        } else if text.contains("where") {
            "check_status"
        } else {
            "general_inquiry"
        };
        Ok(label.to_string())
    }

    async fn generate_text(
        &self,
        _messages: &[Message],
        _max_tokens: usize,
        _temperature: f32,
    ) -> Result<String, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.generation_delay.is_zero() {
            tokio::time::sleep(self.generation_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let n = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("Reply {}", n))
    }

    async fn extract_structured(&self, _prompt: &str, _text: &str) -> Result<String, LlmError> {
        Ok(self.extraction.clone())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

const PIZZA_AND_TIRAMISU: &str = r#"{
    "customer_name": null,
    "order_items": [
        {"item": "Margherita Pizza", "quantity": 1},
        {"item": "Tiramisu", "quantity": 1}
    ],
    "is_delivery": false,
    "address": null,
    "reservation_time": null,
    "party_size": null
}"#;

fn engine_with(model: ScriptedModel) -> (CallEngine, Arc<InMemoryOrderRepository>, Arc<ScriptedModel>) {
    let settings = Settings::default();
    let model = Arc::new(model);
    let repository = Arc::new(InMemoryOrderRepository::new());
    let engine = CallEngine::new(&settings, model.clone(), repository.clone());
    (engine, repository, model)
}

/// In-memory repository whose writes can be made to fail
#[derive(Default)]
struct FlakyRepository {
    inner: InMemoryOrderRepository,
    fail_orders: AtomicBool,
    fail_logs: AtomicBool,
}

impl FlakyRepository {
    fn failing_orders() -> Self {
        let repository = Self::default();
        repository.fail_orders.store(true, Ordering::SeqCst);
        repository
    }

    fn failing_logs() -> Self {
        let repository = Self::default();
        repository.fail_logs.store(true, Ordering::SeqCst);
        repository
    }
}

#[async_trait]
impl OrderRepository for FlakyRepository {
    async fn save_order(&self, record: &OrderRecord) -> Result<Uuid, PersistenceError> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(PersistenceError::Query("orders table unavailable".into()));
        }
        self.inner.save_order(record).await
    }

    async fn save_conversation(
        &self,
        log: &ConversationLog,
        order_id: Option<Uuid>,
    ) -> Result<Uuid, PersistenceError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(PersistenceError::Query("conversation table unavailable".into()));
        }
        self.inner.save_conversation(log, order_id).await
    }

    async fn get_order_history(&self, phone: &str) -> Result<Vec<OrderRecord>, PersistenceError> {
        self.inner.get_order_history(phone).await
    }

    async fn get_order_for_call(
        &self,
        call_id: &str,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        self.inner.get_order_for_call(call_id).await
    }

    async fn get_conversation(
        &self,
        call_id: &str,
    ) -> Result<Option<ConversationLog>, PersistenceError> {
        self.inner.get_conversation(call_id).await
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Page<OrderRecord>, PersistenceError> {
        self.inner.list_orders(filter).await
    }

    async fn update_order_status(
        &self,
        call_id: &str,
        status: OrderStatus,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        self.inner.update_order_status(call_id, status).await
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Page<ConversationLog>, PersistenceError> {
        self.inner.list_conversations(filter).await
    }
}

async fn wait_for_conversation(repository: &InMemoryOrderRepository, call_id: &str) -> ConversationLog {
    for _ in 0..300 {
        if let Some(log) = repository.get_conversation(call_id).await.unwrap() {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("conversation for {} was never saved", call_id);
}

#[tokio::test]
async fn test_order_call_end_to_end() {
    let (engine, repository, _) = engine_with(ScriptedModel::new(PIZZA_AND_TIRAMISU));

    let greeting = engine.start_call("CA100", PHONE).await;
    assert!(greeting.utterance.starts_with("Welcome to Mario's Italian Restaurant."));
    assert!(greeting.document.has_gather());

    let turn = engine
        .handle_turn(TurnEvent::new(
            "CA100",
            PHONE,
            "I'd like to order a Margherita pizza and a tiramisu",
        ))
        .await;
    assert_eq!(turn.intent, Some(Intent::NewOrder));
    assert_eq!(turn.utterance, "Reply 1");
    assert!(!turn.ended);
    assert_eq!(turn.document.say_count(), 1);
    assert!(turn.document.has_gather());

    let bye = engine
        .handle_turn(TurnEvent::new("CA100", PHONE, "That's all, bye"))
        .await;
    assert_eq!(bye.intent, Some(Intent::EndCall));
    assert!(bye.ended);
    assert_eq!(
        bye.utterance,
        "Thank you for calling Mario's Italian Restaurant. Have a great day!"
    );
    assert_eq!(bye.document.steps.last(), Some(&VoiceStep::Hangup));

    let log = wait_for_conversation(&repository, "CA100").await;
    assert_eq!(log.status, CallStatus::Completed);
    assert_eq!(log.turns.len(), 4);
    assert_eq!(log.turns[0].intent, Some(Intent::NewOrder));
    assert_eq!(log.sentiment, Some(0.6));

    let order = repository.get_order_for_call("CA100").await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.total_cents, 2400);
    assert_eq!(order.delivery_fee_cents, 0);
    assert_eq!(log.order_id, Some(order.order_id));
    assert!(engine.sessions().get("CA100").is_none());
}

#[tokio::test]
async fn test_returning_caller_greeting() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("{}"));
    let draft = OrderDraft {
        items: vec![LineItem::new("Lasagna", 2)],
        ..OrderDraft::default()
    };
    let previous = OrderRecord::from_draft(
        "CA-old",
        PHONE,
        draft,
        OrderStatus::Confirmed,
        &Settings::default().restaurant,
        0,
    );
    repository.save_order(&previous).await.unwrap();

    let greeting = engine.start_call("CA200", PHONE).await;
    assert!(greeting.utterance.starts_with("Welcome back to Mario's Italian Restaurant."));

    let session = engine.sessions().get("CA200").unwrap();
    let session = session.lock().await;
    assert_eq!(
        session.order_context.as_ref().map(|o| o.order_id),
        Some(previous.order_id)
    );
}

#[tokio::test]
async fn test_same_call_turns_are_serialized() {
    let model = ScriptedModel::new("{}").with_generation_delay(Duration::from_millis(50));
    let (engine, _, model) = engine_with(model);
    let engine = Arc::new(engine);

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .handle_turn(TurnEvent::new("CA300", PHONE, "What are your hours?"))
                .await
        })
    };
    let second = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .handle_turn(TurnEvent::new("CA300", PHONE, "Do you have gelato?"))
                .await
        })
    };
    first.await.unwrap();
    second.await.unwrap();

    assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 1);

    let session = engine.sessions().get("CA300").unwrap();
    let session = session.lock().await;
    let speakers: Vec<Speaker> = session.turns().iter().map(|t| t.speaker).collect();
    assert_eq!(
        speakers,
        vec![Speaker::Caller, Speaker::Assistant, Speaker::Caller, Speaker::Assistant]
    );
}

#[tokio::test]
async fn test_generation_timeout_falls_back() {
    let mut settings = Settings::default();
    settings.retry.generation.max_attempts = 2;
    settings.retry.generation.initial_backoff_ms = 10;
    settings.retry.generation.max_backoff_ms = 10;
    settings.retry.generation.attempt_timeout_ms = 20;

    let model = Arc::new(ScriptedModel::new("{}").with_generation_delay(Duration::from_millis(200)));
    let repository = Arc::new(InMemoryOrderRepository::new());
    let engine = CallEngine::new(&settings, model, repository);

    let outcome = engine
        .handle_turn(TurnEvent::new("CA400", PHONE, "What's on the menu?"))
        .await;
    assert_eq!(outcome.utterance, FALLBACK_UTTERANCE);
    assert!(outcome.document.has_gather());
    assert!(!outcome.ended);
}

#[tokio::test]
async fn test_no_input_progression() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("{}"));
    engine.start_call("CA500", PHONE).await;

    let first = engine.handle_no_input("CA500", PHONE).await;
    assert!(first.utterance.starts_with("I didn't hear anything."));
    assert!(first.document.has_gather());

    let second = engine.handle_no_input("CA500", PHONE).await;
    assert!(second.utterance.starts_with("I still don't hear anything."));

    let third = engine.handle_no_input("CA500", PHONE).await;
    assert!(third.ended);
    assert!(third.utterance.starts_with("I haven't heard a response."));
    assert!(!third.document.has_gather());

    let log = wait_for_conversation(&repository, "CA500").await;
    assert!(log.turns.is_empty());
    assert_eq!(log.status, CallStatus::Completed);
}

#[tokio::test]
async fn test_speech_resets_no_input_count() {
    let (engine, _, _) = engine_with(ScriptedModel::new("{}"));
    engine.handle_no_input("CA510", PHONE).await;
    engine.handle_no_input("CA510", PHONE).await;
    engine
        .handle_turn(TurnEvent::new("CA510", PHONE, "Sorry, are you open today?"))
        .await;

    let next = engine.handle_no_input("CA510", PHONE).await;
    assert!(next.utterance.starts_with("I didn't hear anything."));
}

#[tokio::test]
async fn test_status_callback_persists_duration() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("{}"));
    engine.start_call("CA600", PHONE).await;
    engine
        .handle_turn(TurnEvent::new("CA600", PHONE, "Do you deliver?"))
        .await;

    assert!(!engine.handle_status("CA600", "in-progress", None).await);
    assert!(engine.handle_status("CA600", "completed", Some(42)).await);

    let log = repository.get_conversation("CA600").await.unwrap().unwrap();
    assert_eq!(log.duration_secs, Some(42));
    assert_eq!(log.turns.len(), 2);
    assert!(engine.sessions().get("CA600").is_none());

    // A repeated callback finds nothing left to do
    assert!(!engine.handle_status("CA600", "completed", Some(42)).await);
    assert_eq!(repository.conversation_count(), 1);
}

#[tokio::test]
async fn test_fallback_transfers_call() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("{}"));
    engine.start_call("CA700", PHONE).await;

    let outcome = engine.handle_fallback("CA700", PHONE).await;
    assert_eq!(outcome.utterance, TELEPHONY_FALLBACK_UTTERANCE);
    assert!(outcome.ended);
    assert!(!outcome.document.has_gather());

    let log = wait_for_conversation(&repository, "CA700").await;
    assert_eq!(log.status, CallStatus::Transferred);
}

#[tokio::test]
async fn test_turn_after_end_opens_fresh_session() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("{}"));
    engine
        .handle_turn(TurnEvent::new("CA800", PHONE, "bye"))
        .await;
    wait_for_conversation(&repository, "CA800").await;

    let outcome = engine
        .handle_turn(TurnEvent::new("CA800", PHONE, "Hello? Are you open on Monday?"))
        .await;
    assert_eq!(outcome.intent, Some(Intent::GeneralInquiry));
    assert!(!outcome.ended);

    let session = engine.sessions().get("CA800").unwrap();
    assert_eq!(session.lock().await.turns().len(), 2);
}

#[tokio::test]
async fn test_empty_speech_does_not_touch_session() {
    let (engine, _, model) = engine_with(ScriptedModel::new("{}"));
    let outcome = engine.handle_turn(TurnEvent::new("CA900", PHONE, "   ")).await;
    assert_eq!(outcome.utterance, EMPTY_SPEECH_PROMPT);
    assert!(outcome.document.has_gather());
    assert!(engine.sessions().get("CA900").is_none());
    assert_eq!(model.generations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_marks_open_order_cancelled() {
    let (engine, repository, _) = engine_with(ScriptedModel::new(r#"{"order_items": []}"#));
    let draft = OrderDraft {
        items: vec![LineItem::new("Calamari", 1)],
        ..OrderDraft::default()
    };
    let previous = OrderRecord::from_draft(
        "CA-earlier",
        PHONE,
        draft,
        OrderStatus::Confirmed,
        &Settings::default().restaurant,
        0,
    );
    repository.save_order(&previous).await.unwrap();

    engine.start_call("CA950", PHONE).await;
    let outcome = engine
        .handle_turn(TurnEvent::new("CA950", PHONE, "Please cancel my calamari"))
        .await;
    assert_eq!(outcome.intent, Some(Intent::CancelOrder));

    engine.handle_status("CA950", "completed", None).await;
    let cancelled = repository
        .get_order_for_call("CA-earlier")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.order_id, previous.order_id);
}

#[tokio::test]
async fn test_full_store_finalizes_idle_call_before_admitting_new_one() {
    let mut settings = Settings::default();
    settings.dialogue.max_sessions = 1;
    settings.dialogue.session_timeout_secs = 0;
    let repository = Arc::new(InMemoryOrderRepository::new());
    let engine = CallEngine::new(&settings, Arc::new(ScriptedModel::new("{}")), repository.clone());

    engine
        .handle_turn(TurnEvent::new("CA1000", PHONE, "What are your hours?"))
        .await;
    let outcome = engine
        .handle_turn(TurnEvent::new("CA1001", PHONE, "Do you have parking?"))
        .await;
    assert_eq!(outcome.utterance, "Reply 2");
    assert!(!outcome.ended);

    // The idle call was written out, not dropped
    let log = repository.get_conversation("CA1000").await.unwrap().unwrap();
    assert_eq!(log.turns.len(), 2);
    assert_eq!(log.status, CallStatus::Completed);
    assert!(engine.sessions().get("CA1000").is_none());
    assert!(engine.sessions().get("CA1001").is_some());
}

#[tokio::test]
async fn test_idle_sweep_keeps_session_whose_log_failed_to_save() {
    let mut settings = Settings::default();
    settings.dialogue.session_timeout_secs = 0;
    let repository = Arc::new(FlakyRepository::failing_logs());
    let engine = CallEngine::new(&settings, Arc::new(ScriptedModel::new("{}")), repository.clone());

    engine
        .handle_turn(TurnEvent::new("CA1100", PHONE, "Are you open on Sunday?"))
        .await;
    engine.finalize_expired().await;
    assert!(engine.sessions().get("CA1100").is_some());
    assert!(repository.get_conversation("CA1100").await.unwrap().is_none());

    // Storage recovers: the next sweep writes the log and frees the slot
    repository.fail_logs.store(false, Ordering::SeqCst);
    assert_eq!(engine.finalize_expired().await, 1);
    assert!(engine.sessions().get("CA1100").is_none());
    let log = repository.get_conversation("CA1100").await.unwrap().unwrap();
    assert_eq!(log.turns.len(), 2);
}

#[tokio::test]
async fn test_unparseable_extraction_saves_no_order() {
    let (engine, repository, _) = engine_with(ScriptedModel::new("Sure! One pizza coming up."));
    engine
        .handle_turn(TurnEvent::new("CA1200", PHONE, "I want to order a pepperoni pizza"))
        .await;
    engine.handle_status("CA1200", "completed", Some(20)).await;

    assert_eq!(repository.order_count(), 0);
    let log = repository.get_conversation("CA1200").await.unwrap().unwrap();
    assert_eq!(log.order_id, None);
    assert_eq!(log.turns.len(), 2);
}

#[tokio::test]
async fn test_failed_order_save_still_logs_conversation() {
    let repository = Arc::new(FlakyRepository::failing_orders());
    let engine = CallEngine::new(
        &Settings::default(),
        Arc::new(ScriptedModel::new(PIZZA_AND_TIRAMISU)),
        repository.clone(),
    );
    engine
        .handle_turn(TurnEvent::new(
            "CA1300",
            PHONE,
            "I'd like to order a Margherita pizza and a tiramisu",
        ))
        .await;
    assert!(engine.handle_status("CA1300", "completed", Some(35)).await);

    assert!(repository.get_order_for_call("CA1300").await.unwrap().is_none());
    let log = repository.get_conversation("CA1300").await.unwrap().unwrap();
    assert_eq!(log.order_id, None);
    assert_eq!(log.status, CallStatus::Completed);
    assert_eq!(log.duration_secs, Some(35));
}

#[tokio::test]
async fn test_different_calls_run_concurrently() {
    let model = ScriptedModel::new("{}").with_generation_delay(Duration::from_millis(100));
    let (engine, _, model) = engine_with(model);
    let engine = Arc::new(engine);

    let turns: Vec<_> = ["CA1400", "CA1401"]
        .into_iter()
        .map(|call_id| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .handle_turn(TurnEvent::new(call_id, PHONE, "What are your hours?"))
                    .await
            })
        })
        .collect();
    for turn in turns {
        let outcome = turn.await.unwrap();
        assert!(outcome.utterance.starts_with("Reply"));
    }

    assert_eq!(model.max_in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(engine.sessions().len(), 2);
}

#[tokio::test]
async fn test_fallback_waits_for_pending_extraction() {
    let (engine, repository, _) = engine_with(ScriptedModel::new(PIZZA_AND_TIRAMISU));
    engine
        .handle_turn(TurnEvent::new(
            "CA1500",
            PHONE,
            "I'd like to order a Margherita pizza and a tiramisu",
        ))
        .await;
    engine.handle_fallback("CA1500", PHONE).await;

    let log = wait_for_conversation(&repository, "CA1500").await;
    let order = repository.get_order_for_call("CA1500").await.unwrap().unwrap();
    assert_eq!(log.status, CallStatus::Transferred);
    assert_eq!(log.order_id, Some(order.order_id));
    assert_eq!(order.total_cents, 2400);
}
