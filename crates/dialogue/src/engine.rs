//! Call engine
//!
//! Turns independent webhook events into one ordered conversation per call.
//! Every event for a call runs under that call's session lock; order
//! extraction and end-of-call persistence run as spawned tasks so the caller
//! never waits on them.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use restaurant_agent_config::{conversation_persona, DialogueConfig, RestaurantProfile, Settings};
use restaurant_agent_core::{
    CallStatus, ConversationLog, Error, Intent, LanguageModel, OrderRecord, OrderStatus, Result,
    Turn,
};
use restaurant_agent_llm::RetryPolicy;
use restaurant_agent_persistence::OrderRepository;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant as Deadline;

use crate::classifier::{IntentClassifier, LlmIntentClassifier};
use crate::document::{DocumentBuilder, VoiceDocument};
use crate::extractor::OrderExtractor;
use crate::generator::{ResponseGenerator, FALLBACK_UTTERANCE};
use crate::sentiment::SentimentScorer;
use crate::session::{trim_turns, CallSession, SessionGuard, SessionStore};

pub const EMPTY_SPEECH_PROMPT: &str = "I'm sorry, I didn't catch that. Could you please repeat?";

pub const TURN_ERROR_UTTERANCE: &str =
    "I'm sorry, I encountered an error. Let me transfer you to a staff member who can help.";

pub const TELEPHONY_FALLBACK_UTTERANCE: &str = "I'm experiencing some technical difficulties. \
                                                Let me transfer you to one of our staff members who can help.";

const FIRST_NO_INPUT_PROMPT: &str =
    "I didn't hear anything. Can I help you with an order or reservation today?";

const SECOND_NO_INPUT_PROMPT: &str =
    "I still don't hear anything. If you're there, please speak now, or I'll end the call.";

type SessionHandle = Arc<Mutex<CallSession>>;

/// One recognized utterance
#[derive(Debug, Clone)]
pub struct TurnEvent {
    pub call_id: String,
    pub caller_phone: String,
    pub transcript: String,
    pub timestamp: DateTime<Utc>,
}

impl TurnEvent {
    pub fn new(
        call_id: impl Into<String>,
        caller_phone: impl Into<String>,
        transcript: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_phone: caller_phone.into(),
            transcript: transcript.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What to say and what the telephony layer should do next
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub utterance: String,
    pub intent: Option<Intent>,
    pub document: VoiceDocument,
    /// The gather cycle is over (hang-up or transfer)
    pub ended: bool,
}

impl TurnOutcome {
    pub fn to_xml(&self) -> String {
        self.document.to_xml()
    }
}

/// Saves extraction results. Cloned into each deferred task.
#[derive(Clone)]
struct OrderSaver {
    extractor: Arc<OrderExtractor>,
    repository: Arc<dyn OrderRepository>,
    profile: Arc<RestaurantProfile>,
}

impl OrderSaver {
    /// Wait for the previous extraction, then extract and save from `history`.
    ///
    /// Resolves to the latest order saved for the call so far.
    async fn run(
        self,
        call_id: String,
        caller_phone: String,
        history: Vec<Turn>,
        intent: Intent,
        order_context: Option<OrderRecord>,
        previous: Option<JoinHandle<Option<OrderRecord>>>,
    ) -> Option<OrderRecord> {
        let prior = match previous {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(call_id = %call_id, error = %e, "Previous extraction task failed");
                None
            }),
            None => None,
        };

        let status = OrderStatus::from_intent(intent).unwrap_or(OrderStatus::Confirmed);
        let draft = self.extractor.extract(&history).await;

        let record = if draft.has_content() {
            draft.into_record(
                &call_id,
                &caller_phone,
                status,
                self.profile.as_ref(),
                self.profile.delivery_fee_cents,
            )
        } else if intent == Intent::CancelOrder {
            // Nothing new was ordered: cancel the open order this call is about
            let mut open = prior.clone().or(order_context)?;
            if !open.status.is_open() {
                return prior;
            }
            open.status = OrderStatus::Cancelled;
            open.updated_at = Utc::now();
            open
        } else {
            tracing::debug!(
                call_id = %call_id,
                parsing_failed = draft.parsing_failed,
                "Extraction produced nothing to save"
            );
            return prior;
        };

        match self.repository.save_order(&record).await {
            Ok(order_id) => {
                tracing::info!(
                    call_id = %call_id,
                    order_id = %order_id,
                    status = %record.status.as_str(),
                    total_cents = record.total_cents,
                    "Order saved"
                );
                metrics::counter!("restaurant_agent_orders_saved_total").increment(1);
                Some(OrderRecord { order_id, ..record })
            },
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Failed to save order");
                metrics::counter!("restaurant_agent_persistence_errors_total").increment(1);
                prior
            },
        }
    }
}

/// Persists a finished call. Cloned into each finalization task.
#[derive(Clone)]
struct Finalizer {
    sessions: Arc<SessionStore>,
    sentiment: Arc<SentimentScorer>,
    repository: Arc<dyn OrderRepository>,
}

impl Finalizer {
    /// Drain pending extraction, write the conversation log once, evict.
    ///
    /// Holds the session lock throughout, so later events for the call see
    /// the terminal session.
    async fn finalize(
        &self,
        handle: SessionHandle,
        mut session: SessionGuard,
        final_status: CallStatus,
        duration_secs: Option<u32>,
    ) {
        let call_id = session.call_id.clone();

        if let Some(pending) = session.take_pending_extraction() {
            match pending.await {
                Ok(Some(record)) => session.apply_saved_order(record),
                Ok(None) => {},
                Err(e) => {
                    tracing::error!(call_id = %call_id, error = %e, "Extraction task failed");
                },
            }
        }

        if !session.is_terminal() {
            if let Err(e) = session.mark_status(final_status) {
                tracing::warn!(call_id = %call_id, error = %e, "Could not mark session");
            }
        }

        if session.is_persisted() {
            self.sessions.retire(&call_id, &handle);
            return;
        }

        let sentiment = if session.turns().len() > 1 {
            self.sentiment.score(session.turns()).await
        } else {
            None
        };
        let duration = duration_secs.or_else(|| {
            let elapsed = Utc::now() - session.created_at;
            u32::try_from(elapsed.num_seconds().max(0)).ok()
        });

        let log = ConversationLog::new(
            &call_id,
            &session.caller_phone,
            session.turns().to_vec(),
            session.status(),
            session.created_at,
        )
        .with_order(session.order_id)
        .with_duration(duration)
        .with_sentiment(sentiment);

        match self.repository.save_conversation(&log, session.order_id).await {
            Ok(log_id) => {
                session.mark_persisted();
                tracing::info!(
                    call_id = %call_id,
                    log_id = %log_id,
                    status = %session.status(),
                    turns = log.turns.len(),
                    "Conversation saved"
                );
                metrics::counter!(
                    "restaurant_agent_calls_finalized_total",
                    "status" => session.status().as_str()
                )
                .increment(1);
                self.sessions.retire(&call_id, &handle);
            },
            Err(e) => {
                // Kept in the store so the status callback or idle sweep can retry
                tracing::error!(call_id = %call_id, error = %e, "Failed to save conversation");
                metrics::counter!("restaurant_agent_persistence_errors_total").increment(1);
            },
        }
    }
}

/// Turn orchestration over the session store and collaborators
pub struct CallEngine {
    sessions: Arc<SessionStore>,
    classifier: Arc<dyn IntentClassifier>,
    generator: ResponseGenerator,
    saver: OrderSaver,
    finalizer: Finalizer,
    documents: DocumentBuilder,
    repository: Arc<dyn OrderRepository>,
    profile: Arc<RestaurantProfile>,
    dialogue: DialogueConfig,
}

impl CallEngine {
    pub fn new(
        settings: &Settings,
        model: Arc<dyn LanguageModel>,
        repository: Arc<dyn OrderRepository>,
    ) -> Self {
        let profile = Arc::new(settings.restaurant.clone());
        let classification_retry = RetryPolicy::from(&settings.retry.classification);
        let generation_retry = RetryPolicy::from(&settings.retry.generation);

        let sessions = Arc::new(SessionStore::with_timeout(
            settings.dialogue.max_sessions,
            settings.dialogue.session_timeout(),
        ));
        let classifier: Arc<dyn IntentClassifier> = Arc::new(LlmIntentClassifier::new(
            Arc::clone(&model),
            classification_retry.clone(),
        ));
        let generator = ResponseGenerator::new(
            Arc::clone(&model),
            generation_retry.clone(),
            conversation_persona(&profile),
            settings.llm.generation.max_tokens,
            settings.llm.generation.temperature,
        );
        let extractor = Arc::new(OrderExtractor::new(
            Arc::clone(&model),
            generation_retry,
            Arc::clone(&profile),
        ));
        let sentiment = Arc::new(SentimentScorer::new(model, classification_retry));

        Self {
            saver: OrderSaver {
                extractor,
                repository: Arc::clone(&repository),
                profile: Arc::clone(&profile),
            },
            finalizer: Finalizer {
                sessions: Arc::clone(&sessions),
                sentiment,
                repository: Arc::clone(&repository),
            },
            sessions,
            classifier,
            generator,
            documents: DocumentBuilder::new(settings.telephony.clone()),
            repository,
            profile,
            dialogue: settings.dialogue.clone(),
        }
    }

    /// Swap the intent classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn repository(&self) -> &Arc<dyn OrderRepository> {
        &self.repository
    }

    pub fn documents(&self) -> &DocumentBuilder {
        &self.documents
    }

    /// Look up or create the call's session. At capacity, idle sessions are
    /// finalized first so their logs are written before they leave the store.
    async fn session_handle(&self, call_id: &str, caller_phone: &str) -> Result<SessionHandle> {
        match self.sessions.get_or_create(call_id, caller_phone) {
            Err(Error::Capacity(max)) => {
                tracing::warn!(call_id, max_sessions = max, "Session store full");
                self.finalize_expired().await;
                self.sessions.get_or_create(call_id, caller_phone)
            },
            other => other,
        }
    }

    /// Lock the call's session. A finished session left under this id is
    /// retired and replaced by a fresh one.
    async fn open_session(
        &self,
        call_id: &str,
        caller_phone: &str,
    ) -> Result<(SessionHandle, SessionGuard)> {
        let handle = self.session_handle(call_id, caller_phone).await?;
        let guard = Arc::clone(&handle).lock_owned().await;
        if !guard.is_terminal() {
            return Ok((handle, guard));
        }
        if guard.is_persisted() {
            drop(guard);
        } else {
            // Its log write failed earlier: retry it before the id is reused
            let status = guard.status();
            self.spawn_finalize(Arc::clone(&handle), guard, status, None);
        }
        self.replace_session(call_id, caller_phone, &handle).await
    }

    async fn replace_session(
        &self,
        call_id: &str,
        caller_phone: &str,
        stale: &SessionHandle,
    ) -> Result<(SessionHandle, SessionGuard)> {
        self.sessions.retire(call_id, stale);
        tracing::info!(call_id, "Replacing finished session");
        let handle = self.session_handle(call_id, caller_phone).await?;
        let guard = Arc::clone(&handle).lock_owned().await;
        Ok((handle, guard))
    }

    /// Collect a finished deferred extraction into the session
    async fn collect_extraction(session: &mut CallSession) {
        if let Some(handle) = session.take_finished_extraction() {
            match handle.await {
                Ok(Some(record)) => session.apply_saved_order(record),
                Ok(None) => {},
                Err(e) => {
                    tracing::error!(call_id = %session.call_id, error = %e, "Extraction task failed");
                },
            }
        }
    }

    fn spawn_finalize(
        &self,
        handle: SessionHandle,
        session: SessionGuard,
        status: CallStatus,
        duration_secs: Option<u32>,
    ) {
        let finalizer = self.finalizer.clone();
        tokio::spawn(async move {
            finalizer.finalize(handle, session, status, duration_secs).await;
        });
    }

    fn listen(&self, utterance: String, intent: Option<Intent>) -> TurnOutcome {
        TurnOutcome {
            document: self.documents.build(&utterance, true),
            utterance,
            intent,
            ended: false,
        }
    }

    fn close(&self, utterance: String, intent: Option<Intent>) -> TurnOutcome {
        TurnOutcome {
            document: self.documents.build(&utterance, false),
            utterance,
            intent,
            ended: true,
        }
    }

    fn transfer(&self, utterance: &str) -> TurnOutcome {
        TurnOutcome {
            document: self.documents.transfer(utterance),
            utterance: utterance.to_string(),
            intent: None,
            ended: true,
        }
    }

    /// Open the call and greet. Returning callers with an open order get
    /// the welcome-back greeting and the order as context.
    pub async fn start_call(&self, call_id: &str, caller_phone: &str) -> TurnOutcome {
        match self.start_call_inner(call_id, caller_phone).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(call_id, error = %e, "Failed to start call");
                metrics::counter!("restaurant_agent_turn_errors_total").increment(1);
                self.transfer(TURN_ERROR_UTTERANCE)
            },
        }
    }

    async fn start_call_inner(&self, call_id: &str, caller_phone: &str) -> Result<TurnOutcome> {
        let (_handle, mut session) = self.open_session(call_id, caller_phone).await?;

        if session.order_context.is_none() && !caller_phone.is_empty() {
            match self.repository.get_order_history(caller_phone).await {
                Ok(history) => {
                    session.order_context = history.into_iter().find(|o| o.status.is_open());
                },
                Err(e) => {
                    tracing::warn!(call_id, error = %e, "Could not load order history");
                    metrics::counter!("restaurant_agent_persistence_errors_total").increment(1);
                },
            }
        }
        session.touch();

        let greeting = if session.order_context.is_some() {
            format!(
                "Welcome back to {}. I see you have an existing order with us. How can I help you today?",
                self.profile.name
            )
        } else {
            format!(
                "Welcome to {}. How can I help you today? You can ask about our menu, place an order, or make a reservation.",
                self.profile.name
            )
        };

        tracing::info!(
            call_id,
            returning = session.order_context.is_some(),
            "Call started"
        );
        metrics::counter!("restaurant_agent_calls_started_total").increment(1);
        Ok(self.listen(greeting, None))
    }

    /// Handle one recognized utterance. Always produces a document.
    pub async fn handle_turn(&self, event: TurnEvent) -> TurnOutcome {
        if event.transcript.trim().is_empty() {
            tracing::warn!(call_id = %event.call_id, "Empty speech result");
            return self.listen(EMPTY_SPEECH_PROMPT.to_string(), None);
        }

        let started = Instant::now();
        let budget = self.dialogue.turn_timeout();
        let deadline = Deadline::now() + budget;
        // Model calls stop early enough to leave room for recording the reply
        let model_deadline = deadline - budget / 10;

        let outcome = match tokio::time::timeout_at(
            deadline,
            self.process_turn(&event, model_deadline),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(call_id = %event.call_id, error = %e, "Turn failed");
                metrics::counter!("restaurant_agent_turn_errors_total").increment(1);
                self.transfer(TURN_ERROR_UTTERANCE)
            },
            Err(_) => {
                tracing::error!(
                    call_id = %event.call_id,
                    budget_ms = budget.as_millis() as u64,
                    "Turn missed its deadline"
                );
                metrics::counter!("restaurant_agent_turn_errors_total").increment(1);
                self.transfer(TURN_ERROR_UTTERANCE)
            },
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!("restaurant_agent_turn_latency_ms").record(latency_ms as f64);
        tracing::debug!(
            call_id = %event.call_id,
            intent = ?outcome.intent,
            latency_ms,
            "Turn complete"
        );
        outcome
    }

    async fn process_turn(&self, event: &TurnEvent, model_deadline: Deadline) -> Result<TurnOutcome> {
        let call_id = event.call_id.as_str();
        let transcript = event.transcript.trim();

        let (mut handle, mut session) = self.open_session(call_id, &event.caller_phone).await?;
        Self::collect_extraction(&mut session).await;

        let intent = tokio::time::timeout_at(model_deadline, self.classifier.classify(transcript))
            .await
            .unwrap_or_else(|_| {
                tracing::warn!(call_id, "Classification ran out of turn budget");
                metrics::counter!("restaurant_agent_llm_failures_total", "operation" => "classify")
                    .increment(1);
                Intent::Unclear
            });
        metrics::counter!("restaurant_agent_turns_total", "intent" => intent.as_str())
            .increment(1);

        let caller_turn = Turn::caller(transcript)
            .with_timestamp(event.timestamp)
            .with_intent(intent);
        match session.append_turn(caller_turn.clone()) {
            Ok(()) => {},
            Err(Error::SessionTerminal { .. }) => {
                drop(session);
                (handle, session) = self
                    .replace_session(call_id, &event.caller_phone, &handle)
                    .await?;
                session.append_turn(caller_turn)?;
            },
            Err(e) => return Err(e),
        }
        session.no_input_count = 0;

        if intent == Intent::EndCall {
            let farewell = format!("Thank you for calling {}. Have a great day!", self.profile.name);
            session.append_turn(Turn::assistant(farewell.clone()))?;
            tracing::info!(call_id, "Caller ended the call");
            self.spawn_finalize(handle, session, CallStatus::Completed, None);
            return Ok(self.close(farewell, Some(intent)));
        }

        // History before the current utterance, which is passed separately
        let turns = session.turns();
        let history = trim_turns(
            &turns[..turns.len() - 1],
            self.dialogue.max_history_turns,
            self.dialogue.max_history_chars,
        );
        let reply = tokio::time::timeout_at(
            model_deadline,
            self.generator
                .generate(transcript, &history, session.order_context.as_ref()),
        )
        .await
        .unwrap_or_else(|_| {
            tracing::warn!(call_id, "Generation ran out of turn budget");
            metrics::counter!("restaurant_agent_llm_failures_total", "operation" => "generate")
                .increment(1);
            FALLBACK_UTTERANCE.to_string()
        });
        session.append_turn(Turn::assistant(reply.clone()))?;

        if intent.is_ordering() {
            let previous = session.take_pending_extraction();
            let task = self.saver.clone().run(
                session.call_id.clone(),
                session.caller_phone.clone(),
                session.turns().to_vec(),
                intent,
                session.order_context.clone(),
                previous,
            );
            session.set_pending_extraction(tokio::spawn(task));
            tracing::debug!(call_id, intent = %intent, "Order extraction scheduled");
        }

        Ok(self.listen(reply, Some(intent)))
    }

    /// The gather timed out with no speech. Re-prompt, then hang up.
    pub async fn handle_no_input(&self, call_id: &str, caller_phone: &str) -> TurnOutcome {
        let (handle, mut session) = match self.open_session(call_id, caller_phone).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(call_id, error = %e, "No-input handling failed");
                return self.transfer(TURN_ERROR_UTTERANCE);
            },
        };

        let count = session.no_input_count;
        tracing::info!(call_id, count, "No input received");

        if count >= self.dialogue.max_no_input_prompts {
            let goodbye = format!(
                "I haven't heard a response. Thank you for calling {}. Feel free to call back anytime!",
                self.profile.name
            );
            self.spawn_finalize(handle, session, CallStatus::Completed, None);
            return self.close(goodbye, None);
        }

        session.no_input_count += 1;
        session.touch();
        let prompt = if count == 0 {
            FIRST_NO_INPUT_PROMPT
        } else {
            SECOND_NO_INPUT_PROMPT
        };
        self.listen(prompt.to_string(), None)
    }

    /// Call-status callback. Terminal statuses finalize the call; returns
    /// whether a live session was finalized.
    pub async fn handle_status(
        &self,
        call_id: &str,
        call_status: &str,
        duration_secs: Option<u32>,
    ) -> bool {
        let terminal = matches!(
            call_status,
            "completed" | "busy" | "failed" | "no-answer" | "canceled"
        );
        if !terminal {
            tracing::debug!(call_id, call_status, "Ignoring non-terminal call status");
            return false;
        }

        let Some(handle) = self.sessions.get(call_id) else {
            tracing::debug!(call_id, call_status, "No live session for status callback");
            return false;
        };
        let session = Arc::clone(&handle).lock_owned().await;
        if session.is_persisted() {
            return false;
        }
        // Awaited inline: nobody is waiting on the telephony side
        self.finalizer
            .finalize(handle, session, CallStatus::Completed, duration_secs)
            .await;
        true
    }

    /// Telephony error: hand the caller to staff
    pub async fn handle_fallback(&self, call_id: &str, caller_phone: &str) -> TurnOutcome {
        match self.open_session(call_id, caller_phone).await {
            Ok((handle, session)) => {
                // The finalizer drains extraction before the terminal transition
                self.spawn_finalize(handle, session, CallStatus::Transferred, None);
            },
            Err(e) => {
                tracing::error!(call_id, error = %e, "Fallback could not open session");
            },
        }
        metrics::counter!("restaurant_agent_transfers_total").increment(1);
        self.transfer(TELEPHONY_FALLBACK_UTTERANCE)
    }

    /// Finalize sessions idle past the timeout. A session whose log could
    /// not be saved stays in the store for the next sweep.
    pub async fn finalize_expired(&self) -> usize {
        let timeout = self.sessions.session_timeout();
        let mut count = 0;
        for (call_id, handle) in self.sessions.expired() {
            let session = Arc::clone(&handle).lock_owned().await;
            // A turn may have arrived between the scan and the lock
            if session.idle_for() < timeout {
                continue;
            }
            if session.is_persisted() {
                drop(session);
                self.sessions.retire(&call_id, &handle);
                continue;
            }
            let status = if session.is_terminal() {
                session.status()
            } else {
                CallStatus::Completed
            };
            self.finalizer.finalize(handle, session, status, None).await;
            count += 1;
        }
        if count > 0 {
            tracing::info!(count, remaining = self.sessions.len(), "Finalized idle sessions");
        }
        count
    }

    /// Periodically finalize idle sessions until the returned sender sends `true`
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let interval = self.dialogue.cleanup_interval();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        engine.finalize_expired().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Session cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}
