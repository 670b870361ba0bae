//! Transport driver contract and implementations.
//!
//! A [`Driver`] performs the abstract queue operations against a pipeline
//! service. Pipes and workers are written against this trait only, so the
//! transport (in-process, HTTP, ...) is swappable by configuration without
//! touching their behavior.

use crate::errors::Result;
use crate::message::{Decoration, Message};
use crate::options::ReceiveOptions;
use async_trait::async_trait;

pub mod memory;

#[cfg(feature = "http")]
pub mod http;

pub use memory::MemoryDriver;

#[cfg(feature = "http")]
pub use http::HttpDriver;

/// The abstract queue operations a pipeline transport must provide.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Submits a payload with a route, returning the assigned message id.
    async fn send(&self, payload: &str, route: &[String]) -> Result<String>;

    /// Fetches up to `options.count` messages addressed to `options.step`.
    ///
    /// An empty result is not an error; it means nothing is available yet.
    async fn recv(&self, options: &ReceiveOptions) -> Result<Vec<Message>>;

    /// Acknowledges a message for a step.
    ///
    /// Acking an already-acked message must not error; callers rely on this
    /// for at-least-once semantics.
    async fn ack(&self, id: &str, step: &str) -> Result<()>;

    /// Marks a step complete for a message.
    ///
    /// Completing the same step twice fails.
    async fn complete(&self, id: &str, step: &str) -> Result<()>;

    /// Appends a route-log entry for a step.
    async fn append_log(&self, id: &str, step: &str, code: i32, text: &str) -> Result<()>;

    /// Inserts steps into the message's route immediately after `after`.
    async fn add_steps_after(&self, id: &str, after: &str, steps: &[String]) -> Result<()>;

    /// Merges decorations into the message's decorated payload.
    ///
    /// Returns one result slot per decoration; partial failure is reported
    /// per key, never as a single aggregate failure.
    async fn decorate(&self, id: &str, decorations: &[Decoration]) -> Vec<Result<()>>;

    /// Returns, per requested key in order, the decoration's JSON-encoded
    /// value or an absent marker if the key was never set.
    async fn get_decorations(&self, id: &str, keys: &[String]) -> Result<Vec<Decoration>>;
}
