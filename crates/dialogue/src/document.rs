//! Voice-control documents (TwiML)
//!
//! A document is built as a list of typed steps and only rendered to XML at
//! the edge. Building is pure; rendering can only fail on writer errors, in
//! which case [`FALLBACK_TWIML`] is served.

use std::io::Cursor;

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use restaurant_agent_config::TelephonyConfig;
use thiserror::Error;

/// Served when rendering fails
pub const FALLBACK_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<Response><Say voice=\"Polly.Joanna\">I'm sorry, we are having technical difficulties. \
Please call back later.</Say><Hangup/></Response>";

/// Spoken before handing the caller to staff
pub const TRANSFER_NOTICE: &str = "Transferring you to one of our staff. Please hold.";

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Failed to render voice document: {0}")]
    Render(String),
}

fn render_error<E: std::fmt::Display>(err: E) -> DocumentError {
    DocumentError::Render(err.to_string())
}

/// Escape markup characters only; quotes stay readable in spoken text
fn text(content: &str) -> BytesText<'_> {
    BytesText::from_escaped(partial_escape(content))
}

/// One instruction to the telephony layer
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceStep {
    Say {
        voice: String,
        text: String,
    },
    Gather {
        action: String,
        timeout_secs: u32,
        language: String,
        speech_model: String,
    },
    Redirect {
        url: String,
    },
    Pause {
        secs: u32,
    },
    Dial {
        number: String,
    },
    Hangup,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceDocument {
    pub steps: Vec<VoiceStep>,
}

impl VoiceDocument {
    pub fn say_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, VoiceStep::Say { .. }))
            .count()
    }

    pub fn gather_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, VoiceStep::Gather { .. }))
            .count()
    }

    pub fn has_gather(&self) -> bool {
        self.gather_count() > 0
    }

    pub fn ends_call(&self) -> bool {
        matches!(
            self.steps.last(),
            Some(VoiceStep::Hangup) | Some(VoiceStep::Dial { .. })
        )
    }

    pub fn render(&self) -> Result<String, DocumentError> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(render_error)?;
        writer
            .write_event(Event::Start(BytesStart::new("Response")))
            .map_err(render_error)?;

        for step in &self.steps {
            match step {
                VoiceStep::Say { voice, text } => {
                    writer
                        .create_element("Say")
                        .with_attribute(("voice", voice.as_str()))
                        .write_text_content(self::text(text))
                        .map_err(render_error)?;
                },
                VoiceStep::Gather {
                    action,
                    timeout_secs,
                    language,
                    speech_model,
                } => {
                    let timeout = timeout_secs.to_string();
                    writer
                        .create_element("Gather")
                        .with_attribute(("input", "speech"))
                        .with_attribute(("action", action.as_str()))
                        .with_attribute(("timeout", timeout.as_str()))
                        .with_attribute(("speechTimeout", "auto"))
                        .with_attribute(("language", language.as_str()))
                        .with_attribute(("enhanced", "true"))
                        .with_attribute(("speechModel", speech_model.as_str()))
                        .write_empty()
                        .map_err(render_error)?;
                },
                VoiceStep::Redirect { url } => {
                    writer
                        .create_element("Redirect")
                        .write_text_content(text(url))
                        .map_err(render_error)?;
                },
                VoiceStep::Pause { secs } => {
                    let length = secs.to_string();
                    writer
                        .create_element("Pause")
                        .with_attribute(("length", length.as_str()))
                        .write_empty()
                        .map_err(render_error)?;
                },
                VoiceStep::Dial { number } => {
                    writer
                        .create_element("Dial")
                        .write_text_content(text(number))
                        .map_err(render_error)?;
                },
                VoiceStep::Hangup => {
                    writer
                        .create_element("Hangup")
                        .write_empty()
                        .map_err(render_error)?;
                },
            }
        }

        writer
            .write_event(Event::End(BytesEnd::new("Response")))
            .map_err(render_error)?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(render_error)
    }

    /// Rendered XML, or the static fallback if rendering fails
    pub fn to_xml(&self) -> String {
        self.render().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Serving fallback voice document");
            FALLBACK_TWIML.to_string()
        })
    }
}

/// Builds documents from the telephony configuration
#[derive(Debug, Clone)]
pub struct DocumentBuilder {
    telephony: TelephonyConfig,
}

impl DocumentBuilder {
    pub fn new(telephony: TelephonyConfig) -> Self {
        Self { telephony }
    }

    fn say(&self, text: &str) -> VoiceStep {
        VoiceStep::Say {
            voice: self.telephony.voice.clone(),
            text: text.to_string(),
        }
    }

    /// Speak `message`, then either listen for the next utterance (with a
    /// no-input redirect) or hang up.
    pub fn build(&self, message: &str, expect_further_speech: bool) -> VoiceDocument {
        let mut steps = vec![self.say(message)];
        if expect_further_speech {
            steps.push(VoiceStep::Gather {
                action: self.telephony.speech_action.clone(),
                timeout_secs: self.telephony.gather_timeout_secs,
                language: self.telephony.language.clone(),
                speech_model: self.telephony.speech_model.clone(),
            });
            steps.push(VoiceStep::Redirect {
                url: self.telephony.no_input_action.clone(),
            });
        } else {
            steps.push(VoiceStep::Hangup);
        }
        VoiceDocument { steps }
    }

    /// Hand the caller to staff
    pub fn transfer(&self, message: &str) -> VoiceDocument {
        let mut steps = Vec::with_capacity(4);
        if !message.trim().is_empty() {
            steps.push(self.say(message));
            steps.push(VoiceStep::Pause { secs: 1 });
        }
        steps.push(self.say(TRANSFER_NOTICE));
        if let Some(number) = self.telephony.transfer_number.as_deref() {
            steps.push(VoiceStep::Dial {
                number: number.to_string(),
            });
        }
        VoiceDocument { steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> DocumentBuilder {
        DocumentBuilder::new(TelephonyConfig::default())
    }

    #[test]
    fn test_listen_document() {
        let doc = builder().build("How can I help?", true);
        assert_eq!(doc.say_count(), 1);
        assert_eq!(doc.gather_count(), 1);
        assert!(!doc.ends_call());

        let xml = doc.render().unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<Say voice=\"Polly.Joanna\">How can I help?</Say>"));
        assert!(xml.contains(
            "<Gather input=\"speech\" action=\"/api/webhook/speech\" timeout=\"3\" \
             speechTimeout=\"auto\" language=\"en-US\" enhanced=\"true\" speechModel=\"phone_call\"/>"
        ));
        assert!(xml.ends_with("<Redirect>/api/webhook/no-input</Redirect></Response>"));
    }

    #[test]
    fn test_closing_document() {
        let doc = builder().build("Goodbye!", false);
        assert_eq!(doc.say_count(), 1);
        assert!(!doc.has_gather());
        assert!(doc.ends_call());
        let xml = doc.render().unwrap();
        assert!(xml.contains("<Hangup/>"));
        assert!(!xml.contains("Redirect"));
    }

    #[test]
    fn test_text_is_escaped() {
        let xml = builder().build("Fish & chips <today>, it's fresh", true).render().unwrap();
        assert!(xml.contains("Fish &amp; chips &lt;today&gt;, it's fresh"));
    }

    #[test]
    fn test_transfer_document() {
        let doc = builder().transfer("Let me get someone.");
        assert_eq!(doc.say_count(), 2);
        assert!(doc.steps.contains(&VoiceStep::Pause { secs: 1 }));
        assert!(!doc.has_gather());
        assert!(doc.to_xml().contains(TRANSFER_NOTICE));

        let mut telephony = TelephonyConfig::default();
        telephony.transfer_number = Some("+15550009999".to_string());
        let doc = DocumentBuilder::new(telephony).transfer("One moment.");
        assert!(doc.ends_call());
        assert!(doc.to_xml().contains("<Dial>+15550009999</Dial>"));
    }

    #[test]
    fn test_build_is_deterministic() {
        let b = builder();
        assert_eq!(b.build("Hi", true), b.build("Hi", true));
        assert_eq!(b.build("Hi", true).to_xml(), b.build("Hi", true).to_xml());
    }
}
