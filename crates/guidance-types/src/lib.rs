//! `guidance-types` – shared payloads and errors for the guidance bus.
//!
//! Everything that travels on the bus or crosses a crate boundary lives here
//! so the middleware, kernel, and runtime crates agree on one vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic name used for system-wide alerts and the guidance heartbeat.
pub const SYSTEM_ALERT_TOPIC: &str = "system_alert";

/// Phrase used for any alert code outside the known [`Severity`] set.
pub const UNKNOWN_SEVERITY_PHRASE: &str = "I am NOT Ready!";

/// Alert level carried on the `system_alert` topic.
///
/// The discriminants are the wire codes used by [`SystemAlert::alert_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Severity {
    Caution = 1,
    Warning = 2,
    Fatal = 3,
    NotReady = 4,
    SystemReady = 5,
}

/// Fixed severity-to-phrase table. Codes not listed here fall back to
/// [`UNKNOWN_SEVERITY_PHRASE`].
const SEVERITY_PHRASES: [(Severity, &str); 5] = [
    (Severity::Caution, "Take caution!"),
    (Severity::Warning, "I have a warning!"),
    (Severity::Fatal, "I am FATAL!"),
    (Severity::NotReady, "I am NOT Ready!"),
    (Severity::SystemReady, "I am Ready!"),
];

impl Severity {
    /// All known severities in wire-code order.
    pub const ALL: [Severity; 5] = [
        Severity::Caution,
        Severity::Warning,
        Severity::Fatal,
        Severity::NotReady,
        Severity::SystemReady,
    ];

    /// Wire code of this severity.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire code. Returns `None` for codes outside the known set.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Human-readable phrase for this severity.
    pub fn phrase(self) -> &'static str {
        phrase_for_code(self.code())
    }
}

/// Look up the phrase for a raw alert code.
///
/// Total over `u8`: unknown codes map to the same phrase as
/// [`Severity::NotReady`].
pub fn phrase_for_code(code: u8) -> &'static str {
    SEVERITY_PHRASES
        .iter()
        .find(|(severity, _)| severity.code() == code)
        .map(|(_, phrase)| *phrase)
        .unwrap_or(UNKNOWN_SEVERITY_PHRASE)
}

/// Payload of the `system_alert` topic.
///
/// `alert_type` holds the raw wire code so that alerts from producers with a
/// newer severity set still travel on the bus. The zero value (code 0, empty
/// description) is what a publication channel hands out as a fresh message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub alert_type: u8,
    pub description: String,
}

impl SystemAlert {
    /// Set the alert level from a known [`Severity`].
    pub fn set_severity(&mut self, severity: Severity) {
        self.alert_type = severity.code();
    }

    /// The known severity of this alert, if any.
    pub fn severity(&self) -> Option<Severity> {
        Severity::from_code(self.alert_type)
    }

    /// Phrase for this alert's code, with the documented fallback.
    pub fn phrase(&self) -> &'static str {
        phrase_for_code(self.alert_type)
    }
}

/// Periodic status published by each guidance component on its own topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// e.g. "arbitrator"
    pub component: String,
    /// Loop iteration that produced this status, starting at 0.
    pub tick: u64,
    /// Number of system alerts the component has observed so far.
    pub alerts_seen: u64,
    pub timestamp: DateTime<Utc>,
}

/// Error returned by a subscription handler.
///
/// Handler failures are logged by the delivering channel and never reach the
/// publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Error taxonomy of the guidance process.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuidanceError {
    /// A topic name was reused with a different payload type.
    #[error("Topic '{topic}' is registered with payload {registered}, requested {requested}")]
    TopicTypeMismatch {
        topic: String,
        registered: String,
        requested: String,
    },

    /// Missing or invalid startup configuration.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// A subscription handler failed.
    #[error("Handler Error: {0}")]
    Handler(String),

    /// A component task exited abnormally.
    #[error("Component '{component}' failed: {reason}")]
    ComponentFailed { component: String, reason: String },

    /// Channel-level failure (closed pool, poisoned state, ...).
    #[error("Channel Error: {0}")]
    Channel(String),
}

impl From<HandlerError> for GuidanceError {
    fn from(err: HandlerError) -> Self {
        GuidanceError::Handler(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_severity_has_a_phrase() {
        for severity in Severity::ALL {
            assert!(!severity.phrase().is_empty(), "{severity:?} has no phrase");
        }
    }

    #[test]
    fn severity_phrases_match_table() {
        assert_eq!(Severity::Caution.phrase(), "Take caution!");
        assert_eq!(Severity::Warning.phrase(), "I have a warning!");
        assert_eq!(Severity::Fatal.phrase(), "I am FATAL!");
        assert_eq!(Severity::NotReady.phrase(), "I am NOT Ready!");
        assert_eq!(Severity::SystemReady.phrase(), "I am Ready!");
    }

    #[test]
    fn unknown_code_falls_back_to_not_ready() {
        assert_eq!(phrase_for_code(0), Severity::NotReady.phrase());
        assert_eq!(phrase_for_code(200), Severity::NotReady.phrase());
        assert!(Severity::from_code(200).is_none());
    }

    #[test]
    fn code_roundtrip() {
        for severity in Severity::ALL {
            assert_eq!(Severity::from_code(severity.code()), Some(severity));
        }
    }

    #[test]
    fn default_alert_is_zero_valued() {
        let alert = SystemAlert::default();
        assert_eq!(alert.alert_type, 0);
        assert!(alert.description.is_empty());
        assert_eq!(alert.phrase(), UNKNOWN_SEVERITY_PHRASE);
    }

    #[test]
    fn set_severity_updates_code() {
        let mut alert = SystemAlert::default();
        alert.set_severity(Severity::Fatal);
        assert_eq!(alert.alert_type, 3);
        assert_eq!(alert.severity(), Some(Severity::Fatal));
    }

    #[test]
    fn severity_deserializes_from_snake_case() {
        let s: Severity = serde_json::from_str("\"system_ready\"").unwrap();
        assert_eq!(s, Severity::SystemReady);
    }

    #[test]
    fn guidance_error_display() {
        let err = GuidanceError::TopicTypeMismatch {
            topic: "system_alert".to_string(),
            registered: "SystemAlert".to_string(),
            requested: "u32".to_string(),
        };
        assert!(err.to_string().contains("system_alert"));

        let err2: GuidanceError = HandlerError::new("boom").into();
        assert_eq!(err2, GuidanceError::Handler("boom".to_string()));
    }
}
