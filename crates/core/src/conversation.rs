//! Conversation types: speakers, turns, call status and intents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Caller,
    Assistant,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Caller => "caller",
            Speaker::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single turn in the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Classified intent, caller turns only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

impl Turn {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            timestamp: Utc::now(),
            intent: None,
        }
    }

    pub fn caller(text: impl Into<String>) -> Self {
        Self::new(Speaker::Caller, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Speaker::Assistant, text)
    }

    pub fn with_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_caller(&self) -> bool {
        self.speaker == Speaker::Caller
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Lifecycle of a call session.
///
/// `Completed` and `Transferred` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Active,
    Completed,
    Transferred,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Active => "active",
            CallStatus::Completed => "completed",
            CallStatus::Transferred => "transferred",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Active)
    }

    /// Status only moves forward: `active -> {active, completed, transferred}`.
    pub fn can_transition_to(&self, _target: CallStatus) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(CallStatus::Active),
            "completed" => Ok(CallStatus::Completed),
            "transferred" => Ok(CallStatus::Transferred),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// Closed set of caller intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    NewOrder,
    ModifyOrder,
    CancelOrder,
    CheckStatus,
    GeneralInquiry,
    EndCall,
    Unclear,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::NewOrder,
        Intent::ModifyOrder,
        Intent::CancelOrder,
        Intent::CheckStatus,
        Intent::GeneralInquiry,
        Intent::EndCall,
        Intent::Unclear,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::NewOrder => "new_order",
            Intent::ModifyOrder => "modify_order",
            Intent::CancelOrder => "cancel_order",
            Intent::CheckStatus => "check_status",
            Intent::GeneralInquiry => "general_inquiry",
            Intent::EndCall => "end_call",
            Intent::Unclear => "unclear",
        }
    }

    /// Map a raw model label onto the closed set.
    ///
    /// Case, surrounding whitespace/quotes/punctuation, and space or hyphen
    /// separators are normalized. Anything outside the set is `Unclear`.
    pub fn from_label(raw: &str) -> Self {
        let lowered = raw.trim().to_lowercase();
        let lowered = lowered.strip_prefix("intent:").unwrap_or(&lowered);
        let normalized: String = lowered
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        Self::ALL
            .iter()
            .copied()
            .find(|intent| intent.as_str() == normalized)
            .unwrap_or(Intent::Unclear)
    }

    /// Intents that create or change an order record
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Intent::NewOrder | Intent::ModifyOrder | Intent::CancelOrder
        )
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_parse() {
        assert_eq!("transferred".parse::<CallStatus>().unwrap(), CallStatus::Transferred);
        assert_eq!("Completed".parse::<CallStatus>().unwrap(), CallStatus::Completed);
        assert!("ringing".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_intent_label_normalization() {
        assert_eq!(Intent::from_label("new_order"), Intent::NewOrder);
        assert_eq!(Intent::from_label("  NEW_ORDER\n"), Intent::NewOrder);
        assert_eq!(Intent::from_label("\"modify-order\"."), Intent::ModifyOrder);
        assert_eq!(Intent::from_label("End Call"), Intent::EndCall);
        assert_eq!(Intent::from_label("Intent: check_status"), Intent::CheckStatus);
    }

    #[test]
    fn test_intent_outside_closed_set_is_unclear() {
        assert_eq!(Intent::from_label("reservation"), Intent::Unclear);
        assert_eq!(Intent::from_label(""), Intent::Unclear);
        assert_eq!(
            Intent::from_label("The caller wants to order a pizza"),
            Intent::Unclear
        );
    }

    #[test]
    fn test_every_intent_round_trips_through_its_label() {
        for intent in Intent::ALL {
            assert_eq!(Intent::from_label(intent.as_str()), intent);
        }
    }

    #[test]
    fn test_call_status_transitions() {
        assert!(CallStatus::Active.can_transition_to(CallStatus::Active));
        assert!(CallStatus::Active.can_transition_to(CallStatus::Completed));
        assert!(CallStatus::Active.can_transition_to(CallStatus::Transferred));
        assert!(!CallStatus::Completed.can_transition_to(CallStatus::Active));
        assert!(!CallStatus::Completed.can_transition_to(CallStatus::Completed));
        assert!(!CallStatus::Transferred.can_transition_to(CallStatus::Completed));
    }

    #[test]
    fn test_turn_builders() {
        let turn = Turn::caller("Hi there").with_intent(Intent::GeneralInquiry);
        assert!(turn.is_caller());
        assert_eq!(turn.intent, Some(Intent::GeneralInquiry));
        assert_eq!(turn.char_len(), 8);
    }
}
