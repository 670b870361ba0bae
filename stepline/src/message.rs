//! Message, route log, and decoration data model.
//!
//! A [`Message`] is owned by the remote pipeline service; the runtime holds a
//! transient copy while a step processes it. The route is the ordered list of
//! steps still to visit, the route log is an append-only audit trail of each
//! step's outcome, and decorations are mergeable annotations visible to
//! downstream steps through the decorated payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log code indicating a successful step outcome.
pub const LOG_SUCCESS: i32 = 0;

/// Log code indicating a failed step outcome.
pub const LOG_FAILURE: i32 = -1;

/// A single entry in a message's route log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLogEntry {
    /// The step that produced this entry.
    pub step: String,
    /// Outcome code: 0 = success, negative = failure.
    pub code: i32,
    /// Free-form outcome text.
    pub text: String,
    /// When the entry was appended.
    pub at: DateTime<Utc>,
}

impl RouteLogEntry {
    /// Creates a log entry stamped with the current time.
    #[must_use]
    pub fn new(step: impl Into<String>, code: i32, text: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            code,
            text: text.into(),
            at: Utc::now(),
        }
    }

    /// Returns true if the entry records a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.code < 0
    }
}

/// A named, mergeable annotation attached to a message.
///
/// The value is a JSON-encoded scalar or object, opaque to the runtime. A
/// `None` value marks a key that was never set, in `get_decorations` results.
/// Keys may use dot-paths (`"user.address.city"`) to address nested merge
/// targets; the last write for a given key wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoration {
    /// The decoration key, possibly a dot-path.
    pub key: String,
    /// JSON-encoded value, or `None` for an absent key.
    pub value: Option<String>,
}

impl Decoration {
    /// Creates a decoration with a raw JSON-encoded value.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a decoration from any serializable value.
    pub fn from_value<T: Serialize>(
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            key: key.into(),
            value: Some(serde_json::to_string(value)?),
        })
    }

    /// Creates an absent-key marker.
    #[must_use]
    pub fn absent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// A message travelling through the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier, assigned by the service on send.
    pub id: String,
    /// Ordered route of steps remaining to visit.
    #[serde(default)]
    pub route: Vec<String>,
    /// Accumulated route log.
    #[serde(default)]
    pub route_log: Vec<RouteLogEntry>,
    /// Raw payload as submitted by the producer, typically JSON.
    #[serde(default)]
    pub payload: String,
    /// Payload merged with decorations.
    #[serde(default)]
    pub decorated_payload: String,
    /// Steps this message has already completed.
    #[serde(default)]
    pub completed: Vec<String>,
}

impl Message {
    /// Parses the decorated payload as JSON, falling back to the raw payload.
    pub fn decorated_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.decorated_payload.is_empty() {
            serde_json::from_str(&self.payload)
        } else {
            serde_json::from_str(&self.decorated_payload)
        }
    }

    /// Returns true if the given step is in the completed set.
    #[must_use]
    pub fn has_completed(&self, step: &str) -> bool {
        self.completed.iter().any(|s| s == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_log_entry_failure_classification() {
        assert!(RouteLogEntry::new("x", LOG_FAILURE, "boom").is_failure());
        assert!(!RouteLogEntry::new("x", LOG_SUCCESS, "ok").is_failure());
    }

    #[test]
    fn test_decoration_from_value() {
        let dec = Decoration::from_value("b", &9).unwrap();
        assert_eq!(dec.key, "b");
        assert_eq!(dec.value.as_deref(), Some("9"));

        let dec = Decoration::from_value("s", &"text").unwrap();
        assert_eq!(dec.value.as_deref(), Some(r#""text""#));
    }

    #[test]
    fn test_decorated_json_falls_back_to_payload() {
        let msg = Message {
            payload: r#"{"a":1}"#.to_string(),
            ..Message::default()
        };
        let value = msg.decorated_json().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_decorated_json_prefers_decorated_payload() {
        let msg = Message {
            payload: r#"{"a":1}"#.to_string(),
            decorated_payload: r#"{"a":1,"b":9}"#.to_string(),
            ..Message::default()
        };
        let value = msg.decorated_json().unwrap();
        assert_eq!(value["b"], 9);
    }

    #[test]
    fn test_has_completed() {
        let msg = Message {
            completed: vec!["x".to_string()],
            ..Message::default()
        };
        assert!(msg.has_completed("x"));
        assert!(!msg.has_completed("y"));
    }

    #[test]
    fn test_message_deserialize_with_missing_fields() {
        let msg: Message = serde_json::from_str(r#"{"id":"m1","payload":"{}"}"#).unwrap();
        assert_eq!(msg.id, "m1");
        assert!(msg.route.is_empty());
        assert!(msg.route_log.is_empty());
    }
}
