//! Per-call session state
//!
//! Sessions live in a sharded map keyed by call id. Each session sits behind
//! its own async mutex, so one turn per call runs at a time while different
//! calls never contend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use restaurant_agent_core::{CallStatus, Error, OrderRecord, Result, Turn};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Exclusive access to one call for the duration of a turn
pub type SessionGuard = OwnedMutexGuard<CallSession>;

/// State of one call
#[derive(Debug)]
pub struct CallSession {
    pub call_id: String,
    pub caller_phone: String,
    turns: Vec<Turn>,
    status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    last_activity: Instant,
    /// Consecutive gathers that captured nothing
    pub no_input_count: u32,
    /// Caller's open order from history, or the one saved during this call
    pub order_context: Option<OrderRecord>,
    /// Order saved for this call
    pub order_id: Option<Uuid>,
    pending_extraction: Option<JoinHandle<Option<OrderRecord>>>,
    persisted: bool,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, caller_phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            caller_phone: caller_phone.into(),
            turns: Vec::new(),
            status: CallStatus::Active,
            created_at: now,
            updated_at: now,
            last_activity: Instant::now(),
            no_input_count: 0,
            order_context: None,
            order_id: None,
            pending_extraction: None,
            persisted: false,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::SessionTerminal {
                call_id: self.call_id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Append to the log. Timestamps never go backwards.
    pub fn append_turn(&mut self, mut turn: Turn) -> Result<()> {
        self.ensure_active()?;
        if let Some(last) = self.turns.last() {
            if turn.timestamp < last.timestamp {
                turn.timestamp = last.timestamp;
            }
        }
        self.turns.push(turn);
        self.touch();
        Ok(())
    }

    /// `active -> active` is a no-op, terminal statuses are final.
    pub fn mark_status(&mut self, status: CallStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::SessionTerminal {
                call_id: self.call_id.clone(),
                status: self.status,
            });
        }
        if self.status != status {
            tracing::debug!(
                call_id = %self.call_id,
                from = %self.status,
                to = %status,
                "Session status changed"
            );
            self.status = status;
        }
        self.touch();
        Ok(())
    }

    pub fn trimmed_history(&self, max_turns: usize, max_chars: usize) -> Vec<Turn> {
        trim_turns(&self.turns, max_turns, max_chars)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Store the in-flight extraction. The new task must already own the
    /// previous handle so saves stay ordered.
    pub fn set_pending_extraction(&mut self, handle: JoinHandle<Option<OrderRecord>>) {
        self.pending_extraction = Some(handle);
    }

    pub fn take_pending_extraction(&mut self) -> Option<JoinHandle<Option<OrderRecord>>> {
        self.pending_extraction.take()
    }

    /// Take the in-flight extraction only if it already completed
    pub fn take_finished_extraction(&mut self) -> Option<JoinHandle<Option<OrderRecord>>> {
        if self.pending_extraction.as_ref().is_some_and(|h| h.is_finished()) {
            self.pending_extraction.take()
        } else {
            None
        }
    }

    /// Link a saved order to this call
    pub fn apply_saved_order(&mut self, record: OrderRecord) {
        self.order_id = Some(record.order_id);
        self.order_context = record.status.is_open().then_some(record);
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = true;
    }
}

/// Bound a turn log for a context window.
///
/// The first caller turn is always kept, even alone over `max_chars`. The
/// rest is the longest run of most recent turns that fits both bounds
/// (`max_turns` counts the anchor). Output stays in chronological order.
pub fn trim_turns(turns: &[Turn], max_turns: usize, max_chars: usize) -> Vec<Turn> {
    let anchor = turns.iter().position(Turn::is_caller);

    let mut keep: Vec<usize> = Vec::new();
    let mut turns_left = max_turns;
    let mut chars_left = max_chars;

    if let Some(idx) = anchor {
        keep.push(idx);
        turns_left = turns_left.saturating_sub(1);
        chars_left = chars_left.saturating_sub(turns[idx].char_len());
    }

    for idx in (0..turns.len()).rev() {
        if Some(idx) == anchor {
            continue;
        }
        let len = turns[idx].char_len();
        if turns_left == 0 || len > chars_left {
            break;
        }
        keep.push(idx);
        turns_left -= 1;
        chars_left -= len;
    }

    keep.sort_unstable();
    keep.into_iter().map(|idx| turns[idx].clone()).collect()
}

/// Arena of live call sessions
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<CallSession>>>,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self::with_timeout(max_sessions, Duration::from_secs(3600))
    }

    pub fn with_timeout(max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            session_timeout,
        }
    }

    /// Look up a call, creating it if this is the first event for it
    pub fn get_or_create(
        &self,
        call_id: &str,
        caller_phone: &str,
    ) -> Result<Arc<Mutex<CallSession>>> {
        if let Some(existing) = self.sessions.get(call_id) {
            return Ok(Arc::clone(existing.value()));
        }

        // Idle sessions are finalized by the engine, never dropped here
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::Capacity(self.max_sessions));
        }

        let session = self
            .sessions
            .entry(call_id.to_string())
            .or_insert_with(|| {
                tracing::info!(call_id, "Session created");
                Arc::new(Mutex::new(CallSession::new(call_id, caller_phone)))
            });
        Ok(Arc::clone(session.value()))
    }

    /// Lock a call for one turn, creating it if needed
    pub async fn acquire(&self, call_id: &str, caller_phone: &str) -> Result<SessionGuard> {
        let session = self.get_or_create(call_id, caller_phone)?;
        Ok(session.lock_owned().await)
    }

    /// Lock an existing call
    pub async fn acquire_existing(&self, call_id: &str) -> Option<SessionGuard> {
        let session = self.get(call_id)?;
        Some(session.lock_owned().await)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<Mutex<CallSession>>> {
        self.sessions.get(call_id).map(|s| Arc::clone(s.value()))
    }

    pub async fn append_turn(&self, call_id: &str, turn: Turn) -> Result<()> {
        let mut session = self.acquire_existing(call_id).await.ok_or_else(|| not_found(call_id))?;
        session.append_turn(turn)
    }

    pub async fn trimmed_history(
        &self,
        call_id: &str,
        max_turns: usize,
        max_chars: usize,
    ) -> Result<Vec<Turn>> {
        let session = self.acquire_existing(call_id).await.ok_or_else(|| not_found(call_id))?;
        Ok(session.trimmed_history(max_turns, max_chars))
    }

    pub async fn mark_status(&self, call_id: &str, status: CallStatus) -> Result<()> {
        let mut session = self.acquire_existing(call_id).await.ok_or_else(|| not_found(call_id))?;
        session.mark_status(status)
    }

    pub fn evict(&self, call_id: &str) -> bool {
        self.sessions.remove(call_id).is_some()
    }

    /// Evict `call_id` only if it still maps to `session`
    pub fn retire(&self, call_id: &str, session: &Arc<Mutex<CallSession>>) -> bool {
        self.sessions
            .remove_if(call_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Sessions idle past the timeout. They stay in the store until the
    /// caller has persisted and retired them.
    ///
    /// Sessions locked by an in-flight turn are never idle and are skipped.
    pub fn expired(&self) -> Vec<(String, Arc<Mutex<CallSession>>)> {
        self.sessions
            .iter()
            .filter(|entry| match entry.value().try_lock() {
                Ok(guard) => guard.idle_for() >= self.session_timeout,
                Err(_) => false,
            })
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }
}

fn not_found(call_id: &str) -> Error {
    Error::Internal(format!("No session for call {}", call_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use restaurant_agent_core::Speaker;

    fn log(texts: &[(&str, Speaker)]) -> Vec<Turn> {
        texts
            .iter()
            .map(|(text, speaker)| Turn::new(*speaker, *text))
            .collect()
    }

    #[test]
    fn test_trim_keeps_anchor_and_recent_turns() {
        let turns = log(&[
            ("I want to order", Speaker::Caller),
            ("Sure, what would you like?", Speaker::Assistant),
            ("A pizza", Speaker::Caller),
            ("Which one?", Speaker::Assistant),
            ("Margherita", Speaker::Caller),
            ("Anything else?", Speaker::Assistant),
        ]);

        let trimmed = trim_turns(&turns, 3, 10_000);
        let texts: Vec<&str> = trimmed.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["I want to order", "Margherita", "Anything else?"]);
    }

    #[test]
    fn test_trim_respects_char_bound() {
        let turns = log(&[
            ("Hello", Speaker::Caller),
            ("A very long assistant answer here", Speaker::Assistant),
            ("ok", Speaker::Caller),
        ]);
        let trimmed = trim_turns(&turns, 10, 8);
        let texts: Vec<&str> = trimmed.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "ok"]);
    }

    #[test]
    fn test_trim_keeps_anchor_even_when_over_budget() {
        let turns = log(&[
            ("This opening request is far too long", Speaker::Caller),
            ("ok", Speaker::Assistant),
        ]);
        let trimmed = trim_turns(&turns, 1, 5);
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].text, "This opening request is far too long");
    }

    #[test]
    fn test_trim_is_chronological_subsequence() {
        let turns: Vec<Turn> = (0..20)
            .map(|i| {
                let speaker = if i % 2 == 0 { Speaker::Caller } else { Speaker::Assistant };
                Turn::new(speaker, format!("turn {}", i))
            })
            .collect();
        for max_turns in 0..25 {
            let trimmed = trim_turns(&turns, max_turns, 60);
            assert_eq!(trimmed[0].text, "turn 0");
            let positions: Vec<usize> = trimmed
                .iter()
                .map(|t| turns.iter().position(|o| o.text == t.text).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_trim_empty_log() {
        assert!(trim_turns(&[], 10, 100).is_empty());
    }

    #[test]
    fn test_append_rejected_after_terminal_status() {
        let mut session = CallSession::new("CA1", "+15550001111");
        session.append_turn(Turn::caller("hi")).unwrap();
        session.mark_status(CallStatus::Completed).unwrap();

        let err = session.append_turn(Turn::caller("hello?")).unwrap_err();
        assert!(err.is_session_terminal());
        assert!(session.mark_status(CallStatus::Active).is_err());
        assert_eq!(session.turns().len(), 1);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut session = CallSession::new("CA1", "+15550001111");
        let now = Utc::now();
        session
            .append_turn(Turn::caller("first").with_timestamp(now))
            .unwrap();
        session
            .append_turn(Turn::assistant("second").with_timestamp(now - chrono::Duration::seconds(5)))
            .unwrap();
        assert_eq!(session.turns()[1].timestamp, now);
    }

    #[tokio::test]
    async fn test_store_operations() {
        let store = SessionStore::new(10);
        store.get_or_create("CA1", "+15550001111").unwrap();
        store.append_turn("CA1", Turn::caller("hi")).await.unwrap();
        store.append_turn("CA1", Turn::assistant("hello")).await.unwrap();

        let history = store.trimmed_history("CA1", 10, 1000).await.unwrap();
        assert_eq!(history.len(), 2);

        store.mark_status("CA1", CallStatus::Transferred).await.unwrap();
        assert!(store
            .append_turn("CA1", Turn::caller("still there?"))
            .await
            .unwrap_err()
            .is_session_terminal());

        assert!(store.evict("CA1"));
        assert!(store.append_turn("CA1", Turn::caller("x")).await.is_err());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let store = SessionStore::new(1);
        store.get_or_create("CA1", "+1").unwrap();
        assert!(store.get_or_create("CA1", "+1").is_ok());
        assert!(matches!(store.get_or_create("CA2", "+1"), Err(Error::Capacity(1))));
    }

    #[test]
    fn test_retire_only_removes_matching_session() {
        let store = SessionStore::new(10);
        let first = store.get_or_create("CA1", "+1").unwrap();
        assert!(store.retire("CA1", &first));
        let second = store.get_or_create("CA1", "+1").unwrap();
        assert!(!store.retire("CA1", &first));
        assert!(Arc::ptr_eq(&store.get("CA1").unwrap(), &second));
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let store = SessionStore::with_timeout(10, Duration::ZERO);
        store.get_or_create("CA1", "+1").unwrap();
        let _held = store.acquire("CA2", "+1").await.unwrap();

        let expired = store.expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "CA1");
        // Still owned by the store until it is retired
        assert_eq!(store.len(), 2);
    }
}
