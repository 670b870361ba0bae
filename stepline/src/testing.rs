//! Reusable handlers for testing workers.
//!
//! These record what they were called with and return configurable results,
//! so tests can assert on dispatch order and escalation behavior without
//! writing bespoke closures each time.

use crate::message::Message;
use crate::worker::{ErrorHandler, HandlerError, MessageHandler};
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

/// A handler that records every message it sees and returns a configurable
/// result.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<Message>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingHandler {
    /// Creates a recording handler that succeeds on every call.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent calls fail with the given error text.
    pub fn fail_with(&self, text: impl Into<String>) {
        *self.fail_with.lock() = Some(text.into());
    }

    /// Makes subsequent calls succeed again.
    pub fn succeed(&self) {
        *self.fail_with.lock() = None;
    }

    /// The messages handled so far, in order.
    #[must_use]
    pub fn handled(&self) -> Vec<Message> {
        self.seen.lock().clone()
    }

    /// The ids of the messages handled so far, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.seen.lock().iter().map(|m| m.id.clone()).collect()
    }

    /// How many times the handler was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// Clears the recorded calls.
    pub fn reset(&self) {
        self.seen.lock().clear();
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.seen.lock().push(message.clone());
        match self.fail_with.lock().as_ref() {
            Some(text) => Err(anyhow!("{text}")),
            None => Ok(()),
        }
    }
}

/// A handler that always fails with a fixed error text.
#[derive(Debug)]
pub struct FailingHandler {
    error: String,
}

impl FailingHandler {
    /// Creates a handler failing with `error`.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _message: &Message) -> Result<(), HandlerError> {
        Err(anyhow!("{}", self.error))
    }
}

/// An error handler that records each escalation it receives.
#[derive(Debug, Default)]
pub struct RecordingErrorHandler {
    seen: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorHandler {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The `(message id, error text)` pairs seen so far, in order.
    #[must_use]
    pub fn errors(&self) -> Vec<(String, String)> {
        self.seen.lock().clone()
    }

    /// How many escalations were received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn on_error(&self, message: &Message, error: &HandlerError) {
        self.seen
            .lock()
            .push((message.id.clone(), format!("{error:#}")));
    }
}
