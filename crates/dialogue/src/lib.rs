//! Call-session dialogue engine
//!
//! Features:
//! - Per-call session store with bounded history trimming
//! - Intent classification over a closed label set
//! - Reply generation with business facts and order context
//! - Order and reservation extraction with explicit-only fields
//! - TwiML voice documents
//! - End-of-call sentiment and conversation logging

pub mod classifier;
pub mod document;
pub mod engine;
pub mod extractor;
pub mod generator;
pub mod sentiment;
pub mod session;

pub use classifier::{IntentClassifier, LlmIntentClassifier};
pub use document::{DocumentBuilder, DocumentError, VoiceDocument, VoiceStep, FALLBACK_TWIML};
pub use engine::{CallEngine, TurnEvent, TurnOutcome};
pub use extractor::{parse_datetime, parse_payload, render_conversation, OrderExtractor};
pub use generator::{ResponseGenerator, FALLBACK_UTTERANCE};
pub use sentiment::SentimentScorer;
pub use session::{trim_turns, CallSession, SessionGuard, SessionStore};
